//! BlobBackend port - S3 互換 object store の薄いラッパー
//!
//! ビジネスロジックは持ちません。各操作は独立して成功／失敗します。
//!
//! # 実装
//! - **ObjectStoreBackend**: `object_store` crate 経由の S3（本番用）
//! - **InMemoryBlobBackend**: 開発・テスト用

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use url::Url;

use crate::domain::{BlobMeta, ByteStream, ListPage, PresignedRequest, StorageError, StorageResult};

/// BlobBackend はオブジェクト名でアドレスされる blob の基本操作
///
/// # 設計原則
/// - listing はページング。呼び出し側が `is_truncated == false` まで continuation token を辿る
/// - 長さが事前に分かっていれば `put`、分からなければ `put_multipart`
/// - 「存在しない」は `Ok(None)` / `Ok(false)` / `StorageError::NotFound` で表し、I/O 障害と区別する
#[async_trait]
pub trait BlobBackend: Send + Sync {
    /// One page of names starting with `prefix`, in lexicographic order.
    async fn list_prefixed(
        &self,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> StorageResult<ListPage>;

    async fn head(&self, name: &str) -> StorageResult<Option<BlobMeta>>;

    /// Fails with `StorageError::NotFound` if the blob does not exist.
    async fn get(&self, name: &str) -> StorageResult<ByteStream>;

    /// Single-shot upload of exactly `content_length` bytes.
    async fn put(&self, name: &str, content_length: u64, content: ByteStream) -> StorageResult<()>;

    /// Splits `content` into numbered parts, uploads each and completes the upload.
    async fn put_multipart(&self, name: &str, content: ByteStream) -> StorageResult<()>;

    /// Returns whether the blob existed.
    async fn delete(&self, name: &str) -> StorageResult<bool>;

    async fn copy(&self, source: &str, target: &str) -> StorageResult<()>;

    async fn presign_get(&self, name: &str, expires_in: Duration) -> StorageResult<Url>;

    async fn presign_put(
        &self,
        name: &str,
        content_length: u64,
        expires_in: Duration,
    ) -> StorageResult<PresignedRequest>;
}

/// Listing cursor: `Some(token)` is the next page to read, `None` means drained.
type Cursor = Option<Option<String>>;

async fn next_page(
    backend: Arc<dyn BlobBackend>,
    prefix: String,
    cursor: Cursor,
) -> StorageResult<Option<(Vec<String>, Cursor)>> {
    let Some(token) = cursor else {
        return Ok(None);
    };
    let page = backend.list_prefixed(&prefix, token).await?;
    let next = if page.is_truncated {
        let token = page.continuation_token.ok_or_else(|| {
            StorageError::IllegalState(
                "truncated listing page without continuation token".to_string(),
            )
        })?;
        Some(Some(token))
    } else {
        None
    };
    Ok(Some((page.names, next)))
}

/// Lazily drains every page under `prefix`.
pub fn name_stream(
    backend: Arc<dyn BlobBackend>,
    prefix: String,
) -> BoxStream<'static, StorageResult<String>> {
    stream::try_unfold(Some(None), move |cursor| {
        next_page(Arc::clone(&backend), prefix.clone(), cursor)
    })
    .map_ok(|names| stream::iter(names.into_iter().map(Ok::<String, StorageError>)))
    .try_flatten()
    .boxed()
}

/// Drains every page under `prefix` into memory.
pub async fn list_all_names(
    backend: Arc<dyn BlobBackend>,
    prefix: &str,
) -> StorageResult<Vec<String>> {
    name_stream(backend, prefix.to_string()).try_collect().await
}

/// Writes `content`, choosing single-shot or multipart by whether the length is known.
pub async fn write_blob(
    backend: &dyn BlobBackend,
    name: &str,
    content_length: Option<u64>,
    content: ByteStream,
) -> StorageResult<()> {
    match content_length {
        Some(length) => backend.put(name, length, content).await,
        None => backend.put_multipart(name, content).await,
    }
}
