//! StorageBuilder - Storage の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 直接アドレス（KeyCodec）と ID-backed（Metastore）の二択を型ではなく構築時に決める

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;

use super::init_gate::InitGate;
use super::storage::{Addressing, Storage};
use crate::config::StorageConfig;
use crate::domain::{DomainKey, StorageError};
use crate::impls::PathKeyCodec;
use crate::ports::{BlobBackend, Clock, KeyCodec, Metastore, SystemClock, normalize_prefix};

/// Default lifetime of presigned URLs.
pub const DEFAULT_PRESIGN_TTL: Duration = Duration::from_secs(600);

/// StorageBuilder は Storage を構築
///
/// # 使用例
/// ```ignore
/// let storage = Storage::<String>::builder()
///     .backend(backend)
///     .prefix("avatars")
///     .codec(PathKeyCodec)
///     .build()?;
/// storage.start()?.await??;
/// ```
///
/// # Fail-fast 設計
/// - backend が無い、アドレス方式が決まらない、prefix が不正なら build() が BuildError を返す
pub struct StorageBuilder<K: DomainKey> {
    backend: Option<Arc<dyn BlobBackend>>,
    prefix: String,
    codec: Option<Arc<dyn KeyCodec<K>>>,
    metastore: Option<Arc<dyn Metastore<K>>>,
    presign_ttl: Duration,
    reconcile_on_start: bool,
    clock: Arc<dyn Clock>,
    bootstrap_runtime: Option<Handle>,
}

/// BuildError は Storage 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("No blob backend was configured.")]
    MissingBackend,

    #[error("Neither a key codec nor a metastore was configured.")]
    MissingAddressing,

    #[error("Both a key codec and a metastore were configured; pick one.")]
    ConflictingAddressing,

    #[error("Invalid prefix {0:?}.")]
    InvalidPrefix(String),

    #[error("Presigned URL lifetime must be positive.")]
    InvalidPresignTtl,
}

impl From<BuildError> for StorageError {
    fn from(err: BuildError) -> Self {
        StorageError::Config(err.to_string())
    }
}

impl<K: DomainKey> StorageBuilder<K> {
    pub fn new() -> Self {
        Self {
            backend: None,
            prefix: String::new(),
            codec: None,
            metastore: None,
            presign_ttl: DEFAULT_PRESIGN_TTL,
            reconcile_on_start: true,
            clock: Arc::new(SystemClock),
            bootstrap_runtime: None,
        }
    }

    /// Applies prefix, presign lifetime and reconcile-on-start from `config`.
    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new()
            .prefix(&config.prefix)
            .presign_ttl(config.presign_ttl())
            .reconcile_on_start(config.reconcile_on_start)
    }

    pub fn backend(mut self, backend: Arc<dyn BlobBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Common prefix of every object name. Normalized to end with one `/`.
    pub fn prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    /// Direct addressing: object names are `prefix + codec.encode(key)`.
    pub fn codec(mut self, codec: impl KeyCodec<K> + 'static) -> Self {
        self.codec = Some(Arc::new(codec));
        self
    }

    /// ID-backed addressing: object names are `prefix + <metastore id>`.
    pub fn metastore(mut self, metastore: Arc<dyn Metastore<K>>) -> Self {
        self.metastore = Some(metastore);
        self
    }

    pub fn presign_ttl(mut self, ttl: Duration) -> Self {
        self.presign_ttl = ttl;
        self
    }

    /// Run reconciliation as part of bootstrap (ID-backed storage only).
    pub fn reconcile_on_start(mut self, enabled: bool) -> Self {
        self.reconcile_on_start = enabled;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Runtime the bootstrap is spawned on instead of the caller's.
    pub fn bootstrap_runtime(mut self, handle: Handle) -> Self {
        self.bootstrap_runtime = Some(handle);
        self
    }

    /// Storage を構築
    ///
    /// # 検証
    /// - backend が設定されているか
    /// - codec と metastore のちょうど一方が設定されているか
    /// - 正規化した prefix の各セグメントが空・`.`・`..`・制御文字を含まないか
    pub fn build(self) -> Result<Storage<K>, BuildError> {
        let backend = self.backend.ok_or(BuildError::MissingBackend)?;

        let addressing = match (self.codec, self.metastore) {
            (Some(codec), None) => Addressing::Direct(codec),
            (None, Some(metastore)) => Addressing::Indexed(metastore),
            (None, None) => return Err(BuildError::MissingAddressing),
            (Some(_), Some(_)) => return Err(BuildError::ConflictingAddressing),
        };

        let prefix = normalize_prefix(&self.prefix);
        if !prefix.is_empty() && PathKeyCodec::validate(prefix.trim_end_matches('/')).is_err() {
            return Err(BuildError::InvalidPrefix(self.prefix));
        }
        if self.presign_ttl.is_zero() {
            return Err(BuildError::InvalidPresignTtl);
        }

        Ok(Storage {
            backend,
            prefix,
            addressing,
            gate: InitGate::new(),
            presign_ttl: self.presign_ttl,
            reconcile_on_start: self.reconcile_on_start,
            clock: self.clock,
            bootstrap_runtime: self.bootstrap_runtime,
        })
    }
}

impl<K: DomainKey> Default for StorageBuilder<K> {
    fn default() -> Self {
        Self::new()
    }
}
