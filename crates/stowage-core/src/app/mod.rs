//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてストレージの振る舞いを実装します。
//!
//! # 主要コンポーネント
//! - **StorageBuilder**: Storage の構築とワイヤリング
//! - **Storage**: 公開ストレージ契約（直接アドレス／ID-backed）
//! - **InitGate**: 一度きりの非同期初期化
//! - **MigrationEngine / MigratingStorage**: 旧ストレージからの移行
//! - **ReconciliationJob**: Metastore に無い blob の隔離

pub mod builder;
pub mod init_gate;
pub mod migration;
pub mod reconciliation;
pub mod storage;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, DEFAULT_PRESIGN_TTL, StorageBuilder};
pub use self::init_gate::InitGate;
pub use self::migration::{MigratingStorage, MigrationEngine, MigrationReport};
pub use self::reconciliation::{ReconciliationJob, ReconciliationReport, backup_prefix};
pub use self::storage::Storage;
