//! Ports - 抽象化レイヤー
//!
//! 外部システム（S3 互換 object store、関係 DB）へのインターフェースと、
//! 上位サービスに公開するストレージ契約を定義します。
//!
//! # 設計原則
//! - Metastore が source of truth（正本）
//! - blob backend は Metastore に合わせて後から突き合わせる（逆はしない）
//! - 2 つのストアはトランザクションで一貫しない前提で設計する

pub mod blob_backend;
pub mod clock;
pub mod key_codec;
pub mod metastore;
pub mod object_storage;

// 主要な trait を再エクスポート
pub use self::blob_backend::{BlobBackend, list_all_names, name_stream, write_blob};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::key_codec::{DELIMITER, KeyCodec, decode_name, normalize_prefix, object_name};
pub use self::metastore::{Metastore, MetastoreEntry, resolve_entry};
pub use self::object_storage::{KeyStream, ObjectStorage, ObjectStorageExt};
