//! InMemoryMetastore - 開発・テスト用の Metastore

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{DomainKey, EntryId, StorageResult};
use crate::ports::{Metastore, MetastoreEntry};

struct InMemoryMetastoreState<K> {
    /// id -> ドメイン属性（ID を外したキー）
    rows: BTreeMap<EntryId, K>,
    next_id: i64,
}

/// InMemoryMetastore は BTreeMap 上の Metastore
///
/// ID は 1 から順に採番します。
pub struct InMemoryMetastore<K> {
    state: Mutex<InMemoryMetastoreState<K>>,
}

impl<K: DomainKey> InMemoryMetastore<K> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InMemoryMetastoreState {
                rows: BTreeMap::new(),
                next_id: 1,
            }),
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl<K: DomainKey> Default for InMemoryMetastore<K> {
    fn default() -> Self {
        Self::new()
    }
}

fn entry<K: DomainKey>(id: EntryId, attributes: &K) -> MetastoreEntry<K> {
    MetastoreEntry {
        id,
        key: attributes.clone().with_entry_id(id),
    }
}

#[async_trait]
impl<K: DomainKey> Metastore<K> for InMemoryMetastore<K> {
    async fn save(&self, key: &K) -> StorageResult<MetastoreEntry<K>> {
        let mut state = self.state.lock().await;
        let attributes = key.without_entry_id();

        if let Some(id) = key.entry_id() {
            state.rows.insert(id, attributes.clone());
            state.next_id = state.next_id.max(id.get() + 1);
            return Ok(entry(id, &attributes));
        }

        let existing = state
            .rows
            .iter()
            .find(|(_, stored)| **stored == attributes)
            .map(|(id, _)| *id);
        if let Some(id) = existing {
            return Ok(entry(id, &attributes));
        }

        let id = EntryId::new(state.next_id);
        state.next_id += 1;
        state.rows.insert(id, attributes.clone());
        Ok(entry(id, &attributes))
    }

    async fn find(&self, id: EntryId) -> StorageResult<Option<MetastoreEntry<K>>> {
        let state = self.state.lock().await;
        Ok(state.rows.get(&id).map(|attributes| entry(id, attributes)))
    }

    async fn find_by_key(&self, key: &K) -> StorageResult<Option<MetastoreEntry<K>>> {
        let attributes = key.without_entry_id();
        let state = self.state.lock().await;
        Ok(state
            .rows
            .iter()
            .find(|(_, stored)| **stored == attributes)
            .map(|(id, stored)| entry(*id, stored)))
    }

    async fn delete(&self, id: EntryId) -> StorageResult<bool> {
        Ok(self.state.lock().await.rows.remove(&id).is_some())
    }

    async fn list_all(&self) -> StorageResult<Vec<MetastoreEntry<K>>> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .iter()
            .map(|(id, attributes)| entry(*id, attributes))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_assigns_sequential_ids() {
        let metastore = InMemoryMetastore::<String>::new();
        let first = metastore.save(&"a.png".to_string()).await.unwrap();
        let second = metastore.save(&"b.png".to_string()).await.unwrap();

        assert_eq!(first.id, EntryId::new(1));
        assert_eq!(second.id, EntryId::new(2));
        assert_eq!(metastore.len().await, 2);
    }

    #[tokio::test]
    async fn saving_same_attributes_reuses_the_row() {
        let metastore = InMemoryMetastore::<String>::new();
        let first = metastore.save(&"a.png".to_string()).await.unwrap();
        let again = metastore.save(&"a.png".to_string()).await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(metastore.len().await, 1);
    }

    #[tokio::test]
    async fn find_and_delete() {
        let metastore = InMemoryMetastore::<String>::new();
        let saved = metastore.save(&"a.png".to_string()).await.unwrap();

        assert_eq!(metastore.find(saved.id).await.unwrap(), Some(saved.clone()));
        assert_eq!(
            metastore.find_by_key(&"a.png".to_string()).await.unwrap(),
            Some(saved.clone())
        );

        assert!(metastore.delete(saved.id).await.unwrap());
        assert!(!metastore.delete(saved.id).await.unwrap());
        assert_eq!(metastore.find(saved.id).await.unwrap(), None);
        assert!(metastore.is_empty().await);
    }

    #[tokio::test]
    async fn entry_id_keys_are_saved_under_their_own_id() {
        let metastore = InMemoryMetastore::<EntryId>::new();
        let saved = metastore.save(&EntryId::new(42)).await.unwrap();
        assert_eq!(saved.id, EntryId::new(42));

        let next = metastore.list_all().await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].key, EntryId::new(42));
    }
}
