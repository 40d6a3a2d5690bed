//! Blob - backend 上のバイト列とそのメタデータ

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use url::Url;

use super::errors::{StorageError, StorageResult};

/// 遅延評価されるバイト列（download の戻り値、upload の入力）
pub type ByteStream = BoxStream<'static, StorageResult<Bytes>>;

/// Result of a `head` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMeta {
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// One page of a prefix listing.
///
/// `is_truncated == true` の場合、`continuation_token` を渡して次のページを取得します。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub names: Vec<String>,
    pub continuation_token: Option<String>,
    pub is_truncated: bool,
}

/// Pre-signed request: the client must send `headers` along with the URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedRequest {
    pub url: Url,
    pub headers: Vec<(String, String)>,
}

/// Upload URL handed to a client, together with the key the object will live under.
///
/// ID-backed なストレージでは `key` に採番済みの ID が入っています。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedUpload<K> {
    pub key: K,
    pub url: Url,
    pub headers: Vec<(String, String)>,
}

/// Wraps an in-memory buffer as a single-chunk stream.
pub fn bytes_stream(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    stream::once(async move { Ok(data) }).boxed()
}

/// Buffers a whole stream.
pub async fn collect_bytes(content: ByteStream) -> StorageResult<Bytes> {
    let buf = content
        .try_fold(BytesMut::new(), |mut buf, chunk| async move {
            buf.extend_from_slice(&chunk);
            Ok(buf)
        })
        .await?;
    Ok(buf.freeze())
}

/// Buffers a stream that must be exactly `expected` bytes long.
pub async fn collect_exact(content: ByteStream, expected: u64) -> StorageResult<Bytes> {
    let data = collect_bytes(content).await?;
    let actual = data.len() as u64;
    if actual != expected {
        return Err(StorageError::LengthMismatch { expected, actual });
    }
    Ok(data)
}
