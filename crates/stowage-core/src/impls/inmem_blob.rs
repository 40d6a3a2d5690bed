//! InMemoryBlobBackend - 開発・テスト用の blob backend
//!
//! # 学習ポイント
//! - BTreeMap による辞書順 listing と continuation token
//! - multipart upload の part 番号・etag の管理（create → upload_part → complete / abort）
//! - 障害注入（特定の操作・名前で Transport エラーを返す）

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::Mutex;
use ulid::Ulid;
use url::Url;

use super::multipart::PartBuffer;
use crate::domain::{
    BlobMeta, ByteStream, ListPage, PresignedRequest, StorageError, StorageResult, bytes_stream,
    collect_exact,
};
use crate::ports::{BlobBackend, Clock, SystemClock};

/// Backend operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobOp {
    List,
    Head,
    Get,
    Put,
    Copy,
    Delete,
}

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Bytes,
    last_modified: DateTime<Utc>,
}

#[derive(Debug)]
struct PendingUpload {
    name: String,
    /// part_number -> (etag, data)
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct InMemoryBlobState {
    blobs: BTreeMap<String, StoredBlob>,
    uploads: HashMap<Ulid, PendingUpload>,
    /// (op, None) は全ての名前で失敗
    failures: HashSet<(BlobOp, Option<String>)>,
}

impl InMemoryBlobState {
    fn check(&self, op: BlobOp, name: &str) -> StorageResult<()> {
        let injected = self.failures.contains(&(op, None))
            || self.failures.contains(&(op, Some(name.to_string())));
        if injected {
            return Err(StorageError::transport(std::io::Error::other(format!(
                "injected {op:?} failure for {name}"
            ))));
        }
        Ok(())
    }
}

/// InMemoryBlobBackend は BTreeMap 上の blob backend
///
/// # 使用例
/// ```ignore
/// let backend = InMemoryBlobBackend::new().with_page_size(2);
/// backend.put("avatars/alice.png", 3, bytes_stream(&b"abc"[..])).await?;
/// let page = backend.list_prefixed("avatars/", None).await?;
/// ```
pub struct InMemoryBlobBackend {
    state: Arc<Mutex<InMemoryBlobState>>,
    clock: Arc<dyn Clock>,
    page_size: usize,
    part_size: usize,
}

impl InMemoryBlobBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryBlobState::default())),
            clock: Arc::new(SystemClock),
            page_size: 1000,
            part_size: 64 * 1024,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Stores a blob directly, bypassing failure injection.
    pub async fn insert(&self, name: impl Into<String>, data: impl Into<Bytes>) {
        let blob = StoredBlob {
            data: data.into(),
            last_modified: self.clock.now(),
        };
        self.state.lock().await.blobs.insert(name.into(), blob);
    }

    /// All blob names, sorted.
    pub async fn names(&self) -> Vec<String> {
        self.state.lock().await.blobs.keys().cloned().collect()
    }

    pub async fn contents(&self, name: &str) -> Option<Bytes> {
        self.state
            .lock()
            .await
            .blobs
            .get(name)
            .map(|blob| blob.data.clone())
    }

    /// Multipart uploads that were neither completed nor aborted.
    pub async fn pending_uploads(&self) -> usize {
        self.state.lock().await.uploads.len()
    }

    /// Makes `op` fail for `name`.
    pub async fn fail(&self, op: BlobOp, name: impl Into<String>) {
        self.state.lock().await.failures.insert((op, Some(name.into())));
    }

    /// Makes `op` fail for every name.
    pub async fn fail_all(&self, op: BlobOp) {
        self.state.lock().await.failures.insert((op, None));
    }

    pub async fn clear_failures(&self) {
        self.state.lock().await.failures.clear();
    }

    async fn create_upload(&self, name: &str) -> StorageResult<Ulid> {
        let mut state = self.state.lock().await;
        state.check(BlobOp::Put, name)?;
        let upload_id = Ulid::new();
        state.uploads.insert(
            upload_id,
            PendingUpload {
                name: name.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        upload_id: Ulid,
        part_number: u32,
        data: Bytes,
    ) -> StorageResult<String> {
        let mut state = self.state.lock().await;
        let upload = state.uploads.get_mut(&upload_id).ok_or_else(|| {
            StorageError::IllegalState(format!("unknown multipart upload {upload_id}"))
        })?;
        let etag = Ulid::new().to_string();
        upload.parts.insert(part_number, (etag.clone(), data));
        Ok(etag)
    }

    /// Finalizes the upload from the ordered `(part_number, etag)` list.
    async fn complete_upload(
        &self,
        upload_id: Ulid,
        etags: Vec<(u32, String)>,
    ) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        let upload = state.uploads.remove(&upload_id).ok_or_else(|| {
            StorageError::IllegalState(format!("unknown multipart upload {upload_id}"))
        })?;
        if etags.len() != upload.parts.len() {
            return Err(StorageError::IllegalState(format!(
                "multipart upload {upload_id} completed with {} of {} parts",
                etags.len(),
                upload.parts.len()
            )));
        }

        let mut data = BytesMut::new();
        for (expected_number, (part_number, etag)) in (1u32..).zip(&etags) {
            let stored = upload.parts.get(part_number);
            match stored {
                Some((stored_etag, part)) if *part_number == expected_number && stored_etag == etag => {
                    data.extend_from_slice(part);
                }
                _ => {
                    return Err(StorageError::IllegalState(format!(
                        "multipart upload {upload_id}: part {part_number} does not match"
                    )));
                }
            }
        }

        let blob = StoredBlob {
            data: data.freeze(),
            last_modified: self.clock.now(),
        };
        state.blobs.insert(upload.name, blob);
        Ok(())
    }

    async fn abort_upload(&self, upload_id: Ulid) {
        self.state.lock().await.uploads.remove(&upload_id);
    }

    async fn upload_parts(
        &self,
        upload_id: Ulid,
        mut content: ByteStream,
    ) -> StorageResult<Vec<(u32, String)>> {
        let mut buffer = PartBuffer::new(self.part_size);
        let mut etags = Vec::new();
        while let Some(chunk) = content.next().await {
            let chunk = chunk?;
            for part in buffer.push(&chunk) {
                let part_number = etags.len() as u32 + 1;
                let etag = self.upload_part(upload_id, part_number, part).await?;
                etags.push((part_number, etag));
            }
        }
        if let Some(last) = buffer.finish() {
            let part_number = etags.len() as u32 + 1;
            let etag = self.upload_part(upload_id, part_number, last).await?;
            etags.push((part_number, etag));
        }
        Ok(etags)
    }

    fn url_for(&self, name: &str, expires_in: Duration) -> StorageResult<Url> {
        let mut url = Url::parse("memory://blobs/").map_err(StorageError::transport)?;
        url.path_segments_mut()
            .map_err(|()| StorageError::IllegalState("memory url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(name.split('/'));
        let expires_at = self.clock.now().timestamp() + expires_in.as_secs() as i64;
        url.query_pairs_mut()
            .append_pair("expires", &expires_at.to_string())
            .append_pair("signature", &Ulid::new().to_string());
        Ok(url)
    }
}

impl Default for InMemoryBlobBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobBackend for InMemoryBlobBackend {
    async fn list_prefixed(
        &self,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> StorageResult<ListPage> {
        let state = self.state.lock().await;
        state.check(BlobOp::List, prefix)?;

        let lower = match continuation_token {
            Some(token) => Bound::Excluded(token),
            None => Bound::Included(prefix.to_string()),
        };
        let mut names: Vec<String> = state
            .blobs
            .range((lower, Bound::Unbounded))
            .map(|(name, _)| name)
            .take_while(|name| name.starts_with(prefix))
            .take(self.page_size + 1)
            .cloned()
            .collect();

        let is_truncated = names.len() > self.page_size;
        if is_truncated {
            names.truncate(self.page_size);
        }
        let continuation_token = if is_truncated { names.last().cloned() } else { None };
        Ok(ListPage {
            names,
            continuation_token,
            is_truncated,
        })
    }

    async fn head(&self, name: &str) -> StorageResult<Option<BlobMeta>> {
        let state = self.state.lock().await;
        state.check(BlobOp::Head, name)?;
        Ok(state.blobs.get(name).map(|blob| BlobMeta {
            size: blob.data.len() as u64,
            last_modified: blob.last_modified,
        }))
    }

    async fn get(&self, name: &str) -> StorageResult<ByteStream> {
        let state = self.state.lock().await;
        state.check(BlobOp::Get, name)?;
        let blob = state
            .blobs
            .get(name)
            .ok_or_else(|| StorageError::not_found(name))?;
        Ok(bytes_stream(blob.data.clone()))
    }

    async fn put(&self, name: &str, content_length: u64, content: ByteStream) -> StorageResult<()> {
        self.state.lock().await.check(BlobOp::Put, name)?;
        // stream は lock の外で読み切る
        let data = collect_exact(content, content_length).await?;
        self.insert(name, data).await;
        Ok(())
    }

    async fn put_multipart(&self, name: &str, content: ByteStream) -> StorageResult<()> {
        let upload_id = self.create_upload(name).await?;
        match self.upload_parts(upload_id, content).await {
            Ok(etags) => self.complete_upload(upload_id, etags).await,
            Err(err) => {
                self.abort_upload(upload_id).await;
                Err(err)
            }
        }
    }

    async fn delete(&self, name: &str) -> StorageResult<bool> {
        let mut state = self.state.lock().await;
        state.check(BlobOp::Delete, name)?;
        Ok(state.blobs.remove(name).is_some())
    }

    async fn copy(&self, source: &str, target: &str) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        state.check(BlobOp::Copy, source)?;
        let data = state
            .blobs
            .get(source)
            .map(|blob| blob.data.clone())
            .ok_or_else(|| StorageError::not_found(source))?;
        let blob = StoredBlob {
            data,
            last_modified: self.clock.now(),
        };
        state.blobs.insert(target.to_string(), blob);
        Ok(())
    }

    async fn presign_get(&self, name: &str, expires_in: Duration) -> StorageResult<Url> {
        self.url_for(name, expires_in)
    }

    async fn presign_put(
        &self,
        name: &str,
        content_length: u64,
        expires_in: Duration,
    ) -> StorageResult<PresignedRequest> {
        Ok(PresignedRequest {
            url: self.url_for(name, expires_in)?,
            headers: vec![("content-length".to_string(), content_length.to_string())],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::list_all_names;
    use futures::stream;

    fn chunked(chunks: &[&'static [u8]]) -> ByteStream {
        let chunks: Vec<StorageResult<Bytes>> =
            chunks.iter().map(|c| Ok(Bytes::from_static(*c))).collect();
        stream::iter(chunks).boxed()
    }

    #[tokio::test]
    async fn listing_is_paginated_and_prefix_scoped() {
        let backend = Arc::new(InMemoryBlobBackend::new().with_page_size(2));
        for name in ["a/1", "a/2", "a/3", "a-backup-1/9", "b/1"] {
            backend.insert(name, Bytes::from_static(b"x")).await;
        }

        let first = backend.list_prefixed("a/", None).await.unwrap();
        assert_eq!(first.names, vec!["a/1", "a/2"]);
        assert!(first.is_truncated);

        let second = backend
            .list_prefixed("a/", first.continuation_token)
            .await
            .unwrap();
        assert_eq!(second.names, vec!["a/3"]);
        assert!(!second.is_truncated);

        let all = list_all_names(backend, "a/").await.unwrap();
        assert_eq!(all, vec!["a/1", "a/2", "a/3"]);
    }

    #[tokio::test]
    async fn put_requires_declared_length() {
        let backend = InMemoryBlobBackend::new();
        let err = backend
            .put("a/1", 10, bytes_stream(&b"short"[..]))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::LengthMismatch { .. }));
        assert!(backend.names().await.is_empty());
    }

    #[tokio::test]
    async fn multipart_upload_assembles_parts_in_order() {
        let backend = InMemoryBlobBackend::new().with_part_size(3);
        backend
            .put_multipart("a/big", chunked(&[b"ab", b"cdefg", b"h"]))
            .await
            .unwrap();

        assert_eq!(
            backend.contents("a/big").await,
            Some(Bytes::from_static(b"abcdefgh"))
        );
        assert_eq!(backend.pending_uploads().await, 0);
    }

    #[tokio::test]
    async fn failed_multipart_upload_is_aborted() {
        let backend = InMemoryBlobBackend::new().with_part_size(2);
        let chunks: Vec<StorageResult<Bytes>> = vec![
            Ok(Bytes::from_static(b"abcd")),
            Err(StorageError::transport(std::io::Error::other("client went away"))),
        ];
        let err = backend
            .put_multipart("a/big", stream::iter(chunks).boxed())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::domain::ErrorKind::Transport);
        assert_eq!(backend.pending_uploads().await, 0);
        assert!(backend.contents("a/big").await.is_none());
    }

    #[tokio::test]
    async fn delete_reports_whether_blob_existed() {
        let backend = InMemoryBlobBackend::new();
        backend.insert("a/1", Bytes::from_static(b"x")).await;
        assert!(backend.delete("a/1").await.unwrap());
        assert!(!backend.delete("a/1").await.unwrap());
    }

    #[tokio::test]
    async fn copy_keeps_source() {
        let backend = InMemoryBlobBackend::new();
        backend.insert("a/1", Bytes::from_static(b"x")).await;
        backend.copy("a/1", "b/1").await.unwrap();
        assert_eq!(backend.names().await, vec!["a/1", "b/1"]);

        let err = backend.copy("a/missing", "b/2").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn injected_failures_are_transport_errors() {
        let backend = InMemoryBlobBackend::new();
        backend.insert("a/1", Bytes::from_static(b"x")).await;
        backend.fail(BlobOp::Get, "a/1").await;

        let err = backend.get("a/1").await.err().unwrap();
        assert_eq!(err.kind(), crate::domain::ErrorKind::Transport);

        backend.clear_failures().await;
        assert!(backend.get("a/1").await.is_ok());
    }

    #[tokio::test]
    async fn presigned_put_requires_content_length_header() {
        let backend = InMemoryBlobBackend::new();
        let request = backend
            .presign_put("avatars/user/alice.png", 1024, Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(request.url.path(), "/avatars/user/alice.png");
        assert_eq!(
            request.headers,
            vec![("content-length".to_string(), "1024".to_string())]
        );
    }
}
