//! Domain model (keys, blobs, states, errors).

pub mod blob;
pub mod errors;
pub mod key;
pub mod state;

pub use self::blob::{
    BlobMeta, ByteStream, ListPage, PresignedRequest, PresignedUpload, bytes_stream,
    collect_bytes, collect_exact,
};
pub use self::errors::{BoxError, ErrorKind, StorageError, StorageResult};
pub use self::key::{DomainKey, EntryId};
pub use self::state::{AtomicState, GateState, MigrationState, StateCode};
