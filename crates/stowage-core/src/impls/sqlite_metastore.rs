//! SQLite Metastore
//!
//! sqlx + SQLite による Metastore 実装です。
//!
//! ## Schema
//!
//! - `id`: INTEGER PRIMARY KEY AUTOINCREMENT（blob 名になる代理 ID）
//! - `attributes`: キーから ID を外した JSON（UNIQUE）
//!
//! `attributes` は serde_json でシリアライズするため、キー型は
//! `Serialize + DeserializeOwned` である必要があります。

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::domain::{DomainKey, EntryId, StorageError, StorageResult};
use crate::ports::{Metastore, MetastoreEntry};

struct Statements {
    insert: String,
    upsert_with_id: String,
    find: String,
    find_by_key: String,
    delete: String,
    list_all: String,
}

impl Statements {
    fn new(table: &str) -> Self {
        Self {
            insert: format!(
                "INSERT INTO {table} (attributes) VALUES (?1) \
                 ON CONFLICT(attributes) DO UPDATE SET attributes = excluded.attributes \
                 RETURNING id"
            ),
            upsert_with_id: format!(
                "INSERT OR REPLACE INTO {table} (id, attributes) VALUES (?1, ?2)"
            ),
            find: format!("SELECT id, attributes FROM {table} WHERE id = ?1"),
            find_by_key: format!("SELECT id, attributes FROM {table} WHERE attributes = ?1"),
            delete: format!("DELETE FROM {table} WHERE id = ?1"),
            list_all: format!("SELECT id, attributes FROM {table} ORDER BY id"),
        }
    }
}

/// SqliteMetastore は 1 テーブルに 1 種類のキーを保存する
pub struct SqliteMetastore<K> {
    pool: SqlitePool,
    statements: Statements,
    _marker: PhantomData<fn() -> K>,
}

impl<K> SqliteMetastore<K>
where
    K: DomainKey + Serialize + DeserializeOwned,
{
    /// Connects to `url` and creates `table` if it does not exist.
    ///
    /// # Errors
    ///
    /// - `table` is not a plain identifier (`[A-Za-z_][A-Za-z0-9_]*`)
    /// - the database cannot be opened or the table cannot be created
    pub async fn connect(url: &str, table: &str) -> StorageResult<Self> {
        validate_table_name(table)?;

        // :memory: はコネクションごとに別 DB になるので 1 本に固定し、閉じさせない
        let in_memory = url.contains(":memory:");
        let options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Duration::from_secs(30))
        };
        let pool = options.connect(url).await?;

        info!(table = %table, in_memory, "Initializing sqlite metastore");
        Self::with_pool(pool, table).await
    }

    /// Uses an existing pool; creates `table` if it does not exist.
    pub async fn with_pool(pool: SqlitePool, table: &str) -> StorageResult<Self> {
        validate_table_name(table)?;
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
                id INTEGER PRIMARY KEY AUTOINCREMENT, \
                attributes TEXT NOT NULL UNIQUE\
            )"
        );
        sqlx::query(&ddl).execute(&pool).await?;

        Ok(Self {
            pool,
            statements: Statements::new(table),
            _marker: PhantomData,
        })
    }

    fn attributes_of(key: &K) -> StorageResult<String> {
        serde_json::to_string(&key.without_entry_id())
            .map_err(|e| StorageError::InvalidKey(format!("cannot serialize key: {e}")))
    }

    fn entry_from_row(row: &SqliteRow) -> StorageResult<MetastoreEntry<K>> {
        let id = EntryId::new(row.try_get::<i64, _>("id")?);
        let attributes: String = row.try_get("attributes")?;
        let key: K = serde_json::from_str(&attributes).map_err(|e| {
            StorageError::InvalidKey(format!("metastore row {id} is not a valid key: {e}"))
        })?;
        Ok(MetastoreEntry {
            id,
            key: key.with_entry_id(id),
        })
    }
}

fn validate_table_name(table: &str) -> StorageResult<()> {
    let mut chars = table.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::Config(format!("invalid metastore table name {table:?}")))
    }
}

#[async_trait]
impl<K> Metastore<K> for SqliteMetastore<K>
where
    K: DomainKey + Serialize + DeserializeOwned,
{
    async fn save(&self, key: &K) -> StorageResult<MetastoreEntry<K>> {
        let attributes = Self::attributes_of(key)?;
        let id = match key.entry_id() {
            Some(id) => {
                sqlx::query(&self.statements.upsert_with_id)
                    .bind(id.get())
                    .bind(&attributes)
                    .execute(&self.pool)
                    .await?;
                id
            }
            None => {
                let row = sqlx::query(&self.statements.insert)
                    .bind(&attributes)
                    .fetch_one(&self.pool)
                    .await?;
                EntryId::new(row.try_get::<i64, _>("id")?)
            }
        };
        Ok(MetastoreEntry {
            id,
            key: key.without_entry_id().with_entry_id(id),
        })
    }

    async fn find(&self, id: EntryId) -> StorageResult<Option<MetastoreEntry<K>>> {
        let row = sqlx::query(&self.statements.find)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::entry_from_row).transpose()
    }

    async fn find_by_key(&self, key: &K) -> StorageResult<Option<MetastoreEntry<K>>> {
        let attributes = Self::attributes_of(key)?;
        let row = sqlx::query(&self.statements.find_by_key)
            .bind(&attributes)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::entry_from_row).transpose()
    }

    async fn delete(&self, id: EntryId) -> StorageResult<bool> {
        let result = sqlx::query(&self.statements.delete)
            .bind(id.get())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_all(&self) -> StorageResult<Vec<MetastoreEntry<K>>> {
        let rows = sqlx::query(&self.statements.list_all)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::entry_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    struct FileKey {
        #[serde(skip)]
        id: Option<EntryId>,
        project: String,
        name: String,
    }

    impl FileKey {
        fn new(project: &str, name: &str) -> Self {
            Self {
                id: None,
                project: project.to_string(),
                name: name.to_string(),
            }
        }
    }

    impl DomainKey for FileKey {
        fn entry_id(&self) -> Option<EntryId> {
            self.id
        }

        fn with_entry_id(mut self, id: EntryId) -> Self {
            self.id = Some(id);
            self
        }

        fn without_entry_id(&self) -> Self {
            Self {
                id: None,
                ..self.clone()
            }
        }
    }

    async fn metastore() -> SqliteMetastore<FileKey> {
        SqliteMetastore::connect("sqlite::memory:", "files").await.unwrap()
    }

    #[tokio::test]
    async fn save_assigns_ids_and_find_resolves_them() {
        let metastore = metastore().await;
        let saved = metastore.save(&FileKey::new("save", "a.sarif")).await.unwrap();

        assert_eq!(saved.key.id, Some(saved.id));
        let found = metastore.find(saved.id).await.unwrap().unwrap();
        assert_eq!(found, saved);

        let by_key = metastore
            .find_by_key(&FileKey::new("save", "a.sarif"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_key.id, saved.id);
    }

    #[tokio::test]
    async fn save_is_idempotent_per_attributes() {
        let metastore = metastore().await;
        let first = metastore.save(&FileKey::new("p", "a")).await.unwrap();
        let second = metastore.save(&FileKey::new("p", "a")).await.unwrap();
        let other = metastore.save(&FileKey::new("p", "b")).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_ne!(first.id, other.id);
        assert_eq!(metastore.list_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delete_removes_the_row() {
        let metastore = metastore().await;
        let saved = metastore.save(&FileKey::new("p", "a")).await.unwrap();

        assert!(metastore.delete(saved.id).await.unwrap());
        assert!(!metastore.delete(saved.id).await.unwrap());
        assert!(metastore.find(saved.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_table_names_are_rejected() {
        let err = SqliteMetastore::<FileKey>::connect("sqlite::memory:", "files; DROP")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::Config(_)));
    }
}
