//! Built-in key codecs.
//!
//! - **PathKeyCodec**: `avatars/user/alice.png` のような相対パスのキー
//! - **EntryIdCodec**: ID-backed なストレージの代理 ID（10 進表記）

use crate::domain::{EntryId, StorageError, StorageResult};
use crate::ports::{DELIMITER, KeyCodec};

/// Keys that are relative `/`-separated paths, stored verbatim as the suffix.
///
/// # 受け付けないキー
/// - 空、`/` で始まる／終わる
/// - 空セグメント（`a//b`）、`.` / `..` セグメント
/// - 制御文字を含む
#[derive(Debug, Clone, Copy, Default)]
pub struct PathKeyCodec;

impl PathKeyCodec {
    pub fn validate(path: &str) -> StorageResult<()> {
        if path.is_empty() {
            return Err(StorageError::InvalidKey("empty path".to_string()));
        }
        if path.chars().any(char::is_control) {
            return Err(StorageError::InvalidKey(format!(
                "{path:?} contains control characters"
            )));
        }
        let bad_segment = path
            .split(DELIMITER)
            .find(|segment| segment.is_empty() || *segment == "." || *segment == "..");
        if let Some(segment) = bad_segment {
            return Err(StorageError::InvalidKey(format!(
                "{path:?} has an invalid segment {segment:?}"
            )));
        }
        Ok(())
    }
}

impl KeyCodec<String> for PathKeyCodec {
    fn encode(&self, key: &String) -> StorageResult<String> {
        Self::validate(key)?;
        Ok(key.clone())
    }

    fn decode(&self, _root_prefix: &str, suffix: &str) -> StorageResult<String> {
        Self::validate(suffix)?;
        Ok(suffix.to_string())
    }
}

/// Surrogate IDs as canonical decimal suffixes.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryIdCodec;

impl KeyCodec<EntryId> for EntryIdCodec {
    fn encode(&self, key: &EntryId) -> StorageResult<String> {
        if key.get() < 0 {
            return Err(StorageError::InvalidKey(format!(
                "entry id {key} is negative"
            )));
        }
        Ok(key.to_string())
    }

    fn decode(&self, _root_prefix: &str, suffix: &str) -> StorageResult<EntryId> {
        suffix.parse()
    }
}
