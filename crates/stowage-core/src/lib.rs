//! stowage-core
//!
//! S3 互換 object store 上の key-addressed blob ストレージ層。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（key, blob, state, errors）
//! - **ports**: 抽象化レイヤー（KeyCodec, BlobBackend, Metastore, ObjectStorage, Clock）
//! - **app**: アプリケーションロジック（Storage, StorageBuilder, InitGate, Migration, Reconciliation）
//! - **impls**: 実装（ObjectStoreBackend, SqliteMetastore, InMemory* など開発用）
//! - **config**: 設定の読み込み（TOML + 環境変数）
//!
//! # 使用例
//! ```ignore
//! let config = StorageConfig::load(Some(Path::new("stowage.toml")))?;
//! let storage = StorageBuilder::<String>::from_config(&config)
//!     .backend(Arc::new(config.build_s3_backend()?))
//!     .codec(PathKeyCodec)
//!     .build()?;
//! storage.start()?;
//! storage.wait_ready().await;
//! storage.upload_bytes("user/alice.png".to_string(), data).await?;
//! ```

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

pub use crate::app::{
    BuildError, InitGate, MigratingStorage, MigrationEngine, MigrationReport, ReconciliationJob,
    ReconciliationReport, Storage, StorageBuilder,
};
pub use crate::config::StorageConfig;
pub use crate::domain::{
    ByteStream, DomainKey, EntryId, ErrorKind, GateState, MigrationState, StorageError,
    StorageResult,
};
pub use crate::ports::{ObjectStorage, ObjectStorageExt};
