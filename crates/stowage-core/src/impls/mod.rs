//! Implementations - ports の具象実装
//!
//! - blob backend: `ObjectStoreBackend`（S3）、`InMemoryBlobBackend`（テスト用）
//! - metastore: `SqliteMetastore`、`InMemoryMetastore`
//! - key codec: `PathKeyCodec`、`EntryIdCodec`

pub mod codecs;
pub mod inmem_blob;
pub mod inmem_metastore;
pub mod multipart;
pub mod object_store_blob;
pub mod sqlite_metastore;

pub use self::codecs::{EntryIdCodec, PathKeyCodec};
pub use self::inmem_blob::{BlobOp, InMemoryBlobBackend};
pub use self::inmem_metastore::InMemoryMetastore;
pub use self::multipart::{MIN_PART_SIZE, PartBuffer};
pub use self::object_store_blob::ObjectStoreBackend;
pub use self::sqlite_metastore::SqliteMetastore;
