//! Domain keys and surrogate entry IDs.
//!
//! # DomainKey
//! アプリケーションが定義するキー（アバター ID、ファイル ID など）。
//! Key Codec でオブジェクト名に変換されるか、Metastore の行に対応付けられます。
//!
//! # EntryId
//! Metastore が採番する整数の代理キー。ID-backed なストレージでは
//! `EntryId` の 10 進表記がそのまま blob 名の suffix になります。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Debug;
use std::hash::Hash;
use std::str::FromStr;

use super::errors::StorageError;

/// DomainKey はストレージ上のオブジェクトを指すアプリケーション側のキー
///
/// ID-backed なストレージでは upload 時に採番された ID がキーに埋め込まれます
/// （`with_entry_id`）。ID を持たないキー型はデフォルト実装のままで構いません。
pub trait DomainKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {
    /// Surrogate ID embedded in this key, if it has been assigned one.
    fn entry_id(&self) -> Option<EntryId> {
        None
    }

    /// Returns the key with `id` embedded.
    fn with_entry_id(self, _id: EntryId) -> Self {
        self
    }

    /// Returns only the domain attributes (the key without its ID).
    fn without_entry_id(&self) -> Self {
        self.clone()
    }
}

impl DomainKey for String {}

/// EntryId は Metastore の代理キー
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(i64);

impl EntryId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for EntryId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Only canonical non-negative decimals parse (`"42"`, not `"+42"` or `"042"`),
/// so a parsed name always re-encodes to itself.
impl FromStr for EntryId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let canonical = !s.is_empty()
            && s.bytes().all(|b| b.is_ascii_digit())
            && (s == "0" || !s.starts_with('0'));
        if !canonical {
            return Err(StorageError::InvalidKey(format!("{s:?} is not an entry id")));
        }
        s.parse::<i64>()
            .map(Self)
            .map_err(|e| StorageError::InvalidKey(format!("{s:?} is not an entry id: {e}")))
    }
}

impl DomainKey for EntryId {
    fn entry_id(&self) -> Option<EntryId> {
        Some(*self)
    }

    fn with_entry_id(self, id: EntryId) -> Self {
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero("0", 0)]
    #[case::small("42", 42)]
    #[case::large("9007199254740993", 9_007_199_254_740_993)]
    fn entry_id_parses_canonical_decimals(#[case] input: &str, #[case] expected: i64) {
        let id: EntryId = input.parse().unwrap();
        assert_eq!(id.get(), expected);
        assert_eq!(id.to_string(), input);
    }

    #[rstest]
    #[case::empty("")]
    #[case::leading_zero("042")]
    #[case::signed("+42")]
    #[case::negative("-1")]
    #[case::suffix("42.png")]
    #[case::overflow("99999999999999999999")]
    fn entry_id_rejects_non_canonical_names(#[case] input: &str) {
        let err = input.parse::<EntryId>().unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }

    #[test]
    fn string_keys_carry_no_entry_id() {
        let key = "avatars/user/alice.png".to_string();
        assert_eq!(key.entry_id(), None);
        assert_eq!(key.clone().with_entry_id(EntryId::new(3)), key);
    }
}
