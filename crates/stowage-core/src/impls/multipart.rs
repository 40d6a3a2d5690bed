//! Multipart chunking shared by the blob backends.

use bytes::{Bytes, BytesMut};

/// S3 rejects non-final parts smaller than 5 MiB.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// PartBuffer は任意サイズの chunk を `part_size` ごとの part に詰め直す
///
/// 最後の part だけは `part_size` 未満でもよい。
#[derive(Debug)]
pub struct PartBuffer {
    part_size: usize,
    buf: BytesMut,
    emitted: u32,
}

impl PartBuffer {
    pub fn new(part_size: usize) -> Self {
        Self {
            part_size: part_size.max(1),
            buf: BytesMut::new(),
            emitted: 0,
        }
    }

    /// Appends `chunk` and returns every part that became full.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut parts = Vec::new();
        while self.buf.len() >= self.part_size {
            parts.push(self.buf.split_to(self.part_size).freeze());
        }
        self.emitted += parts.len() as u32;
        parts
    }

    /// The final part. An empty stream still produces one (empty) part.
    pub fn finish(self) -> Option<Bytes> {
        if self.buf.is_empty() && self.emitted > 0 {
            None
        } else {
            Some(self.buf.freeze())
        }
    }
}
