//! Metastore port - ドメインキー ⇔ 代理 ID の関係インデックス
//!
//! ID-backed なストレージだけが持ちます。Metastore が「どの blob が所有されているか」の
//! 正本（source of truth）で、blob backend は後から Reconciliation で突き合わされます。
//!
//! # 実装
//! - **InMemoryMetastore**: 開発・テスト用
//! - **SqliteMetastore**: sqlx + SQLite

use async_trait::async_trait;

use crate::domain::{DomainKey, EntryId, StorageResult};

/// One row of the metastore.
///
/// `key` always carries `id` embedded (`key.entry_id() == Some(id)` for key
/// types that can hold an ID).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetastoreEntry<K> {
    pub id: EntryId,
    pub key: K,
}

/// Metastore は汎用 CRUD リポジトリ
///
/// # 不変条件
/// - ID-backed なストレージの blob 名は必ず Metastore の ID の 10 進表記
/// - `save` は ID を持たないキーに新しい ID を採番し、同じ属性のキーには既存の ID を返す
#[async_trait]
pub trait Metastore<K: DomainKey>: Send + Sync {
    /// Inserts (or updates, when the key already carries an ID) and returns the stored row.
    async fn save(&self, key: &K) -> StorageResult<MetastoreEntry<K>>;

    async fn find(&self, id: EntryId) -> StorageResult<Option<MetastoreEntry<K>>>;

    /// Lookup by domain attributes, for keys that do not embed an ID yet.
    async fn find_by_key(&self, key: &K) -> StorageResult<Option<MetastoreEntry<K>>>;

    /// Returns whether a row was deleted.
    async fn delete(&self, id: EntryId) -> StorageResult<bool>;

    async fn list_all(&self) -> StorageResult<Vec<MetastoreEntry<K>>>;
}

/// Resolves `key` by its embedded ID first, then by its attributes.
pub async fn resolve_entry<K: DomainKey>(
    metastore: &dyn Metastore<K>,
    key: &K,
) -> StorageResult<Option<MetastoreEntry<K>>> {
    match key.entry_id() {
        Some(id) => metastore.find(id).await,
        None => metastore.find_by_key(key).await,
    }
}
