//! Errors - エラー型と分類
//!
//! すべての操作は `StorageError` を返します。
//! 呼び出し側（HTTP 層など）は `ErrorKind` を見て 404 / 503 / 500 を決めます。

use thiserror::Error;

/// 下位レイヤー（object_store, sqlx, tokio）のエラーを包むための型
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type StorageResult<T> = Result<T, StorageError>;

/// ErrorKind はエラーの運用分類
///
/// # 分類
/// - NotFound: キー／オブジェクトが存在しない（404 相当）
/// - NotReady: 初期化が終わっていない（503 相当、リトライ可能）
/// - Transport: backend / metastore の I/O 障害
/// - IllegalState: 二重初期化・二重マイグレーション（デプロイのバグ）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    NotReady,
    InvalidKey,
    Transport,
    Unsupported,
    IllegalState,
    Conflict,
    InvalidContent,
    Config,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {name}")]
    NotFound { name: String },

    #[error("storage is not ready yet")]
    NotReady,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("transport error: {0}")]
    Transport(#[source] BoxError),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Metastore row exists but the blob it points to is gone.
    #[error("metastore entry exists but blob {name} is missing")]
    Conflict { name: String },

    #[error("content length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: u64, actual: u64 },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl StorageError {
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    pub fn transport(err: impl Into<BoxError>) -> Self {
        Self::Transport(err.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::NotReady => ErrorKind::NotReady,
            Self::InvalidKey(_) => ErrorKind::InvalidKey,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::IllegalState(_) => ErrorKind::IllegalState,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::LengthMismatch { .. } => ErrorKind::InvalidContent,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<object_store::Error> for StorageError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => Self::NotFound { name: path },
            other => Self::Transport(Box::new(other)),
        }
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        Self::Transport(Box::new(err))
    }
}

impl From<::config::ConfigError> for StorageError {
    fn from(err: ::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
