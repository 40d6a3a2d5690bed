//! KeyCodec port - ドメインキー ⇔ オブジェクト名
//!
//! オブジェクト名は `prefix + suffix`。suffix はキーから決定的に作られ、
//! 区切り文字 `/` で始まってはいけません。
//!
//! I/O は一切しない純粋関数です。

use crate::domain::{StorageError, StorageResult};

/// Common path delimiter of every backend.
pub const DELIMITER: char = '/';

/// KeyCodec はドメインキーと suffix の相互変換
///
/// # 不変条件
/// - `decode(root_prefix, encode(k)) == k`
/// - `encode` の結果は空でなく、`/` で始まらない
pub trait KeyCodec<K>: Send + Sync {
    fn encode(&self, key: &K) -> StorageResult<String>;

    fn decode(&self, root_prefix: &str, suffix: &str) -> StorageResult<K>;
}

/// Normalizes a prefix to end with exactly one delimiter.
///
/// Leading delimiters are dropped and the root prefix stays empty, so that
/// object names never start with `/`.
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches(DELIMITER);
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}{DELIMITER}")
    }
}

/// Full object name of `key` under `prefix`, validating the codec output.
pub fn object_name<K>(
    codec: &dyn KeyCodec<K>,
    prefix: &str,
    key: &K,
) -> StorageResult<String> {
    let suffix = codec.encode(key)?;
    if suffix.is_empty() {
        return Err(StorageError::InvalidKey("encoded key is empty".to_string()));
    }
    if suffix.starts_with(DELIMITER) {
        return Err(StorageError::InvalidKey(format!(
            "encoded key {suffix:?} starts with {DELIMITER:?}"
        )));
    }
    Ok(format!("{prefix}{suffix}"))
}

/// Decodes a full object name listed under `prefix`.
pub fn decode_name<K>(codec: &dyn KeyCodec<K>, prefix: &str, name: &str) -> StorageResult<K> {
    let suffix = name.strip_prefix(prefix).ok_or_else(|| {
        StorageError::InvalidKey(format!("{name:?} is not under prefix {prefix:?}"))
    })?;
    codec.decode(prefix, suffix)
}
