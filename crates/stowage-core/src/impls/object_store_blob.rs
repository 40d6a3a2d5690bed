//! ObjectStoreBackend - `object_store` crate による BlobBackend
//!
//! 本番では S3（`AmazonS3`）を使います。テストでは `object_store::memory::InMemory`
//! を渡せば同じコードパスを通せます（presign は S3 のみ）。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3;
use object_store::path::Path;
use object_store::signer::Signer;
use object_store::{MultipartUpload, ObjectStore, PutPayload};
use tracing::{debug, warn};
use url::Url;

use super::multipart::{MIN_PART_SIZE, PartBuffer};
use crate::domain::{
    BlobMeta, ByteStream, ListPage, PresignedRequest, StorageError, StorageResult, collect_exact,
};
use crate::ports::{BlobBackend, DELIMITER};

pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    signer: Option<Arc<dyn Signer>>,
    page_size: usize,
    part_size: usize,
}

impl ObjectStoreBackend {
    /// Wraps any object store. Presigning is unavailable until `with_signer`.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            signer: None,
            page_size: 1000,
            part_size: MIN_PART_SIZE,
        }
    }

    /// S3 client that also signs URLs.
    pub fn s3(s3: AmazonS3) -> Self {
        let s3 = Arc::new(s3);
        let store: Arc<dyn ObjectStore> = s3.clone();
        Self::new(store).with_signer(s3)
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    fn path(name: &str) -> StorageResult<Path> {
        Path::parse(name)
            .map_err(|e| StorageError::InvalidKey(format!("{name:?} is not a valid object path: {e}")))
    }

    fn signer(&self) -> StorageResult<&dyn Signer> {
        self.signer
            .as_deref()
            .ok_or(StorageError::Unsupported("presigned urls need a signing backend"))
    }

    async fn upload_parts(
        &self,
        upload: &mut Box<dyn MultipartUpload>,
        mut content: ByteStream,
    ) -> StorageResult<usize> {
        let mut buffer = PartBuffer::new(self.part_size);
        let mut parts = 0usize;
        while let Some(chunk) = content.next().await {
            let chunk = chunk?;
            for part in buffer.push(&chunk) {
                upload.put_part(PutPayload::from(part)).await?;
                parts += 1;
            }
        }
        if let Some(last) = buffer.finish() {
            upload.put_part(PutPayload::from(last)).await?;
            parts += 1;
        }
        Ok(parts)
    }
}

/// object_store の prefix はセグメント単位で一致するので、
/// 最後の `/` までをディレクトリとして list し、残りは文字列で絞り込む
fn listing_dir(prefix: &str) -> &str {
    match prefix.rfind(DELIMITER) {
        Some(idx) => &prefix[..idx],
        None => "",
    }
}

#[async_trait]
impl BlobBackend for ObjectStoreBackend {
    async fn list_prefixed(
        &self,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> StorageResult<ListPage> {
        let dir = listing_dir(prefix);
        let dir_path = if dir.is_empty() {
            None
        } else {
            Some(Self::path(dir)?)
        };

        let listing = match continuation_token {
            Some(token) => {
                let offset = Self::path(&token)?;
                self.store.list_with_offset(dir_path.as_ref(), &offset)
            }
            None => self.store.list(dir_path.as_ref()),
        };

        let mut names: Vec<String> = listing
            .map_ok(|meta| meta.location.to_string())
            .try_filter(|name| futures::future::ready(name.starts_with(prefix)))
            .take(self.page_size + 1)
            .try_collect()
            .await?;

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
        match self.store.head(&Self::path(name)?).await {
            Ok(meta) => Ok(Some(BlobMeta {
                size: meta.size,
                last_modified: meta.last_modified,
            })),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn get(&self, name: &str) -> StorageResult<ByteStream> {
        let result = self.store.get(&Self::path(name)?).await?;
        Ok(result.into_stream().map_err(StorageError::from).boxed())
    }

    async fn put(&self, name: &str, content_length: u64, content: ByteStream) -> StorageResult<()> {
        let path = Self::path(name)?;
        let data = collect_exact(content, content_length).await?;
        self.store.put(&path, PutPayload::from(data)).await?;
        Ok(())
    }

    async fn put_multipart(&self, name: &str, content: ByteStream) -> StorageResult<()> {
        let path = Self::path(name)?;
        let mut upload = self.store.put_multipart(&path).await?;
        match self.upload_parts(&mut upload, content).await {
            Ok(parts) => {
                upload.complete().await?;
                debug!(name = %name, parts, "Completed multipart upload");
                Ok(())
            }
            Err(err) => {
                if let Err(abort_err) = upload.abort().await {
                    warn!(name = %name, error = %abort_err, "Failed to abort multipart upload");
                }
                Err(err)
            }
        }
    }

    async fn delete(&self, name: &str) -> StorageResult<bool> {
        let path = Self::path(name)?;
        // S3 の DeleteObject は存在しなくても成功するので、先に head で確認する
        if self.head(name).await?.is_none() {
            return Ok(false);
        }
        match self.store.delete(&path).await {
            Ok(()) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn copy(&self, source: &str, target: &str) -> StorageResult<()> {
        let from = Self::path(source)?;
        let to = Self::path(target)?;
        self.store.copy(&from, &to).await?;
        Ok(())
    }

    async fn presign_get(&self, name: &str, expires_in: Duration) -> StorageResult<Url> {
        let path = Self::path(name)?;
        let url = self
            .signer()?
            .signed_url(http::Method::GET, &path, expires_in)
            .await?;
        Ok(url)
    }

    async fn presign_put(
        &self,
        name: &str,
        content_length: u64,
        expires_in: Duration,
    ) -> StorageResult<PresignedRequest> {
        let path = Self::path(name)?;
        let url = self
            .signer()?
            .signed_url(http::Method::PUT, &path, expires_in)
            .await?;
        Ok(PresignedRequest {
            url,
            headers: vec![("content-length".to_string(), content_length.to_string())],
        })
    }
}
