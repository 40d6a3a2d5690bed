//! StorageConfig - 設定の読み込みと検証
//!
//! 優先順位（後勝ち）:
//! 1. 各フィールドのデフォルト
//! 2. TOML ファイル（任意）
//! 3. 環境変数 `STOWAGE_*`（例: `STOWAGE_BUCKET`, `STOWAGE_PRESIGN_TTL_SECS`）

use std::path::Path;
use std::time::Duration;

use ::config::{Config, Environment, File};
use object_store::aws::AmazonS3Builder;
use serde::Deserialize;

use crate::domain::{DomainKey, StorageError, StorageResult};
use crate::impls::{MIN_PART_SIZE, ObjectStoreBackend, SqliteMetastore};
use crate::ports::normalize_prefix;

pub const ENV_PREFIX: &str = "STOWAGE";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub bucket: String,
    pub prefix: String,
    /// Custom S3 endpoint (MinIO など). Path-style addressing is used when set.
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub allow_http: bool,
    pub presign_ttl_secs: u64,
    pub multipart_part_size: usize,
    pub list_page_size: usize,
    pub reconcile_on_start: bool,
    /// sqlx SQLite URL, e.g. `sqlite://stowage.db?mode=rwc`.
    pub metastore_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            prefix: String::new(),
            endpoint: None,
            region: "us-east-1".to_string(),
            access_key_id: None,
            secret_access_key: None,
            allow_http: false,
            presign_ttl_secs: 600,
            multipart_part_size: MIN_PART_SIZE,
            list_page_size: 1000,
            reconcile_on_start: true,
            metastore_url: None,
        }
    }
}

impl StorageConfig {
    /// Loads defaults, then `path` (if given and present), then `STOWAGE_*` variables.
    pub fn load(path: Option<&Path>) -> StorageResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let loaded: StorageConfig = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Checks everything the S3 backend needs.
    pub fn validate(&self) -> StorageResult<()> {
        if self.bucket.trim().is_empty() {
            return Err(StorageError::Config("bucket must not be empty".to_string()));
        }
        if self.list_page_size == 0 {
            return Err(StorageError::Config("list_page_size must be positive".to_string()));
        }
        if self.multipart_part_size < MIN_PART_SIZE {
            return Err(StorageError::Config(format!(
                "multipart_part_size {} is below the S3 minimum of {MIN_PART_SIZE} bytes",
                self.multipart_part_size
            )));
        }
        if self.presign_ttl_secs == 0 {
            return Err(StorageError::Config("presign_ttl_secs must be positive".to_string()));
        }
        if self.access_key_id.is_some() != self.secret_access_key.is_some() {
            return Err(StorageError::Config(
                "access_key_id and secret_access_key must be set together".to_string(),
            ));
        }
        Ok(())
    }

    pub fn normalized_prefix(&self) -> String {
        normalize_prefix(&self.prefix)
    }

    pub fn presign_ttl(&self) -> Duration {
        Duration::from_secs(self.presign_ttl_secs)
    }

    /// S3 client with URL signing, paging and part size from this config.
    pub fn build_s3_backend(&self) -> StorageResult<ObjectStoreBackend> {
        self.validate()?;
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&self.bucket)
            .with_region(&self.region)
            .with_allow_http(self.allow_http);
        if let Some(endpoint) = &self.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_virtual_hosted_style_request(false);
        }
        if let Some(access_key_id) = &self.access_key_id {
            builder = builder.with_access_key_id(access_key_id);
        }
        if let Some(secret_access_key) = &self.secret_access_key {
            builder = builder.with_secret_access_key(secret_access_key);
        }
        let s3 = builder
            .build()
            .map_err(|e| StorageError::Config(format!("cannot build S3 client: {e}")))?;

        Ok(ObjectStoreBackend::s3(s3)
            .with_page_size(self.list_page_size)
            .with_part_size(self.multipart_part_size))
    }

    /// Opens the SQLite metastore when `metastore_url` is set.
    pub async fn connect_metastore<K>(&self, table: &str) -> StorageResult<Option<SqliteMetastore<K>>>
    where
        K: DomainKey + serde::Serialize + serde::de::DeserializeOwned,
    {
        match &self.metastore_url {
            Some(url) => Ok(Some(SqliteMetastore::connect(url, table).await?)),
            None => Ok(None),
        }
    }
}
