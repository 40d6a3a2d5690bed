//! ObjectStorage port - 上位の CRUD サービスが使う公開契約
//!
//! `Storage`（直接／ID-backed）と `MigratingStorage` がこれを実装します。
//! すべての操作は `Ready` になる前に呼ぶと `StorageError::NotReady` で即座に失敗します。

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, TryStreamExt};
use url::Url;

use crate::domain::{
    ByteStream, DomainKey, PresignedUpload, StorageResult, bytes_stream, collect_bytes,
};

/// Stream of keys returned by `list`.
pub type KeyStream<'a, K> = BoxStream<'a, StorageResult<K>>;

/// ObjectStorage は key-addressed blob store の正規の非同期契約
///
/// 同期風／バッファ版などの呼び出し方は `ObjectStorageExt` のアダプタで提供します。
#[async_trait]
pub trait ObjectStorage<K: DomainKey>: Send + Sync {
    /// Every stored key. Names that do not decode are skipped.
    fn list(&self) -> KeyStream<'_, K>;

    async fn does_exist(&self, key: &K) -> StorageResult<bool>;

    /// Fails with `NotFound` if absent.
    async fn content_length(&self, key: &K) -> StorageResult<u64>;

    /// Fails with `NotFound` if absent.
    async fn last_modified(&self, key: &K) -> StorageResult<DateTime<Utc>>;

    /// Stores `content` and returns the key it is now addressable by.
    ///
    /// `content_length` が分かっていれば single-shot put、`None` なら multipart upload。
    async fn upload(
        &self,
        key: K,
        content_length: Option<u64>,
        content: ByteStream,
    ) -> StorageResult<K>;

    /// Fails with `NotFound` if the key does not resolve.
    async fn download(&self, key: &K) -> StorageResult<ByteStream>;

    /// Returns whether the blob existed.
    async fn delete(&self, key: &K) -> StorageResult<bool>;

    /// Backend-side copy then delete of `source`. Returns whether `source` existed.
    async fn move_key(&self, source: &K, target: &K) -> StorageResult<bool>;

    /// Time-limited, header-less URL; `None` if the key does not resolve.
    async fn generate_download_url(&self, key: &K) -> StorageResult<Option<Url>>;

    async fn generate_upload_url(
        &self,
        key: K,
        content_length: u64,
    ) -> StorageResult<PresignedUpload<K>>;
}

/// Buffered adapters over `ObjectStorage`.
#[async_trait]
pub trait ObjectStorageExt<K: DomainKey>: ObjectStorage<K> {
    async fn upload_bytes(&self, key: K, data: Bytes) -> StorageResult<K> {
        let length = data.len() as u64;
        self.upload(key, Some(length), bytes_stream(data)).await
    }

    async fn download_bytes(&self, key: &K) -> StorageResult<Bytes> {
        let content = self.download(key).await?;
        collect_bytes(content).await
    }

    async fn list_all(&self) -> StorageResult<Vec<K>> {
        self.list().try_collect().await
    }
}

impl<K: DomainKey, S: ObjectStorage<K> + ?Sized> ObjectStorageExt<K> for S {}
