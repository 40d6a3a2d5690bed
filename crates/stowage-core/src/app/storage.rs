//! Storage - KeyCodec + BlobBackend (+ Metastore) を組み合わせた公開ストレージ
//!
//! # アドレス方式
//! - **Direct**: オブジェクト名は `prefix + codec.encode(key)`
//! - **Indexed**: オブジェクト名は `prefix + <Metastore の ID>`（ID-backed）
//!
//! # ID-backed な upload の順序
//! 1. Metastore に行を保存（ID 採番）
//! 2. その ID の名前で blob を書き込む
//! 3. blob の書き込みに失敗したら行を削除して元のエラーを返す
//!
//! 不整合は「blob の無い行」に限られ、`does_exist` で `Conflict` として検出されます。
//! 「行の無い blob」は ReconciliationJob が隔離します。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future;
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use super::builder::StorageBuilder;
use super::init_gate::InitGate;
use super::reconciliation::ReconciliationJob;
use crate::domain::{
    BlobMeta, ByteStream, DomainKey, EntryId, GateState, PresignedUpload, StorageError,
    StorageResult,
};
use crate::impls::EntryIdCodec;
use crate::ports::{
    BlobBackend, Clock, KeyCodec, KeyStream, Metastore, MetastoreEntry, ObjectStorage,
    decode_name, name_stream, object_name, resolve_entry, write_blob,
};

pub(crate) enum Addressing<K> {
    Direct(Arc<dyn KeyCodec<K>>),
    Indexed(Arc<dyn Metastore<K>>),
}

/// Object name of a resolved key, plus its metastore row when ID-backed.
struct Located<K> {
    name: String,
    entry: Option<MetastoreEntry<K>>,
}

/// Storage は `ObjectStorage` の唯一の実装
///
/// `start()` で bootstrap を走らせ、`Ready` になるまで全操作が `NotReady` で失敗します。
pub struct Storage<K: DomainKey> {
    pub(crate) backend: Arc<dyn BlobBackend>,
    pub(crate) prefix: String,
    pub(crate) addressing: Addressing<K>,
    pub(crate) gate: InitGate,
    pub(crate) presign_ttl: Duration,
    pub(crate) reconcile_on_start: bool,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) bootstrap_runtime: Option<Handle>,
}

impl<K: DomainKey> Storage<K> {
    pub fn builder() -> StorageBuilder<K> {
        StorageBuilder::new()
    }

    /// Normalized prefix; empty for the root.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn is_id_backed(&self) -> bool {
        matches!(self.addressing, Addressing::Indexed(_))
    }

    pub fn gate(&self) -> &InitGate {
        &self.gate
    }

    pub fn state(&self) -> GateState {
        self.gate.state()
    }

    pub fn backend(&self) -> &Arc<dyn BlobBackend> {
        &self.backend
    }

    /// Starts the one-time bootstrap.
    ///
    /// ID-backed で `reconcile_on_start` が有効なら、bootstrap 中に ReconciliationJob を
    /// 1 回実行します。その失敗はログに残すだけで、`Ready` への遷移は妨げません。
    ///
    /// # Errors
    /// 2 回目の呼び出しは `IllegalState`。
    pub fn start(&self) -> StorageResult<JoinHandle<StorageResult<()>>> {
        let job = if self.reconcile_on_start {
            self.reconciliation_job()
        } else {
            None
        };
        let bootstrap = async move {
            if let Some(job) = job {
                if let Err(err) = job.run().await {
                    warn!(error = %err, "Reconciliation failed during bootstrap");
                }
            }
            Ok(())
        };
        match &self.bootstrap_runtime {
            Some(handle) => self.gate.start_on(handle, bootstrap),
            None => self.gate.start(bootstrap),
        }
    }

    pub async fn wait_ready(&self) {
        self.gate.wait_ready().await;
    }

    /// The orphan sweep for this storage; `None` unless ID-backed.
    pub fn reconciliation_job(&self) -> Option<ReconciliationJob<K>> {
        match &self.addressing {
            Addressing::Indexed(metastore) => Some(ReconciliationJob::new(
                Arc::clone(&self.backend),
                Arc::clone(metastore),
                self.prefix.clone(),
                Arc::clone(&self.clock),
            )),
            Addressing::Direct(_) => None,
        }
    }

    fn id_name(&self, id: EntryId) -> StorageResult<String> {
        object_name(&EntryIdCodec, &self.prefix, &id)
    }

    /// `None` only for ID-backed keys without a metastore row.
    async fn locate(&self, key: &K) -> StorageResult<Option<Located<K>>> {
        match &self.addressing {
            Addressing::Direct(codec) => Ok(Some(Located {
                name: object_name(codec.as_ref(), &self.prefix, key)?,
                entry: None,
            })),
            Addressing::Indexed(metastore) => {
                let Some(entry) = resolve_entry(metastore.as_ref(), key).await? else {
                    return Ok(None);
                };
                Ok(Some(Located {
                    name: self.id_name(entry.id)?,
                    entry: Some(entry),
                }))
            }
        }
    }

    async fn require(&self, key: &K) -> StorageResult<Located<K>> {
        self.locate(key)
            .await?
            .ok_or_else(|| StorageError::not_found(format!("{key:?}")))
    }

    async fn meta(&self, key: &K) -> StorageResult<BlobMeta> {
        self.gate.ensure_ready()?;
        let located = self.require(key).await?;
        self.backend
            .head(&located.name)
            .await?
            .ok_or_else(|| StorageError::not_found(located.name))
    }

    async fn upload_indexed(
        &self,
        metastore: Arc<dyn Metastore<K>>,
        key: K,
        content_length: Option<u64>,
        content: ByteStream,
    ) -> StorageResult<K> {
        let (entry, created) = match resolve_entry(metastore.as_ref(), &key).await? {
            Some(entry) => (entry, false),
            None => (metastore.save(&key).await?, true),
        };
        let name = self.id_name(entry.id)?;
        let id = entry.id;
        let backend = Arc::clone(&self.backend);

        // 呼び出し元が future を drop しても補償処理まで走らせる
        let write = tokio::spawn(async move {
            let result = write_blob(backend.as_ref(), &name, content_length, content).await;
            if let Err(err) = &result {
                if created {
                    match metastore.delete(id).await {
                        Ok(_) => info!(
                            id = %id,
                            error = %err,
                            "Rolled back metastore row after failed upload"
                        ),
                        Err(rollback) => error!(
                            id = %id,
                            error = %rollback,
                            "Failed to roll back metastore row"
                        ),
                    }
                }
            }
            result
        });
        write.await.map_err(StorageError::transport)??;
        Ok(entry.key)
    }
}

#[async_trait]
impl<K: DomainKey> ObjectStorage<K> for Storage<K> {
    fn list(&self) -> KeyStream<'_, K> {
        if let Err(err) = self.gate.ensure_ready() {
            return stream::once(future::ready(Err(err))).boxed();
        }
        match &self.addressing {
            Addressing::Direct(codec) => {
                let codec = Arc::clone(codec);
                let prefix = self.prefix.clone();
                name_stream(Arc::clone(&self.backend), self.prefix.clone())
                    .try_filter_map(move |name| {
                        let key = match decode_name(codec.as_ref(), &prefix, &name) {
                            Ok(key) => Some(key),
                            Err(err) => {
                                debug!(name = %name, error = %err, "Skipping undecodable object name");
                                None
                            }
                        };
                        future::ready(Ok(key))
                    })
                    .boxed()
            }
            Addressing::Indexed(metastore) => {
                let metastore = Arc::clone(metastore);
                stream::once(async move { metastore.list_all().await })
                    .map_ok(|entries| {
                        stream::iter(
                            entries
                                .into_iter()
                                .map(|entry| Ok::<K, StorageError>(entry.key)),
                        )
                    })
                    .try_flatten()
                    .boxed()
            }
        }
    }

    async fn does_exist(&self, key: &K) -> StorageResult<bool> {
        self.gate.ensure_ready()?;
        let Some(located) = self.locate(key).await? else {
            return Ok(false);
        };
        let present = self.backend.head(&located.name).await?.is_some();
        if !present && located.entry.is_some() {
            return Err(StorageError::Conflict {
                name: located.name,
            });
        }
        Ok(present)
    }

    async fn content_length(&self, key: &K) -> StorageResult<u64> {
        Ok(self.meta(key).await?.size)
    }

    async fn last_modified(&self, key: &K) -> StorageResult<DateTime<Utc>> {
        Ok(self.meta(key).await?.last_modified)
    }

    async fn upload(
        &self,
        key: K,
        content_length: Option<u64>,
        content: ByteStream,
    ) -> StorageResult<K> {
        self.gate.ensure_ready()?;
        match &self.addressing {
            Addressing::Direct(codec) => {
                let name = object_name(codec.as_ref(), &self.prefix, &key)?;
                write_blob(self.backend.as_ref(), &name, content_length, content).await?;
                Ok(key)
            }
            Addressing::Indexed(metastore) => {
                self.upload_indexed(Arc::clone(metastore), key, content_length, content)
                    .await
            }
        }
    }

    async fn download(&self, key: &K) -> StorageResult<ByteStream> {
        self.gate.ensure_ready()?;
        let located = self.require(key).await?;
        self.backend.get(&located.name).await
    }

    async fn delete(&self, key: &K) -> StorageResult<bool> {
        self.gate.ensure_ready()?;
        let Some(located) = self.locate(key).await? else {
            return Ok(false);
        };
        let existed = self.backend.delete(&located.name).await?;
        if let (Some(entry), Addressing::Indexed(metastore)) = (&located.entry, &self.addressing) {
            metastore.delete(entry.id).await?;
        }
        Ok(existed)
    }

    async fn move_key(&self, source: &K, target: &K) -> StorageResult<bool> {
        self.gate.ensure_ready()?;
        let Addressing::Direct(codec) = &self.addressing else {
            return Err(StorageError::Unsupported(
                "move is not supported by id-backed storage",
            ));
        };
        let source_name = object_name(codec.as_ref(), &self.prefix, source)?;
        let target_name = object_name(codec.as_ref(), &self.prefix, target)?;

        if self.backend.head(&source_name).await?.is_none() {
            return Ok(false);
        }
        if source_name == target_name {
            return Ok(true);
        }
        self.backend.copy(&source_name, &target_name).await?;
        self.backend.delete(&source_name).await?;
        Ok(true)
    }

    async fn generate_download_url(&self, key: &K) -> StorageResult<Option<Url>> {
        self.gate.ensure_ready()?;
        let Some(located) = self.locate(key).await? else {
            return Ok(None);
        };
        if self.backend.head(&located.name).await?.is_none() {
            return Ok(None);
        }
        self.backend
            .presign_get(&located.name, self.presign_ttl)
            .await
            .map(Some)
    }

    async fn generate_upload_url(
        &self,
        key: K,
        content_length: u64,
    ) -> StorageResult<PresignedUpload<K>> {
        self.gate.ensure_ready()?;
        let (key, name, reserved) = match &self.addressing {
            Addressing::Direct(codec) => {
                let name = object_name(codec.as_ref(), &self.prefix, &key)?;
                (key, name, None)
            }
            Addressing::Indexed(metastore) => {
                let (entry, created) = match resolve_entry(metastore.as_ref(), &key).await? {
                    Some(entry) => (entry, false),
                    None => (metastore.save(&key).await?, true),
                };
                let name = self.id_name(entry.id)?;
                let reserved = created.then(|| (Arc::clone(metastore), entry.id));
                (entry.key, name, reserved)
            }
        };
        let request = match self
            .backend
            .presign_put(&name, content_length, self.presign_ttl)
            .await
        {
            Ok(request) => request,
            Err(err) => {
                if let Some((metastore, id)) = reserved {
                    match metastore.delete(id).await {
                        Ok(_) => info!(
                            id = %id,
                            error = %err,
                            "Released reserved metastore row after failed presign"
                        ),
                        Err(rollback) => error!(
                            id = %id,
                            error = %rollback,
                            "Failed to release reserved metastore row"
                        ),
                    }
                }
                return Err(err);
            }
        };
        Ok(PresignedUpload {
            key,
            url: request.url,
            headers: request.headers,
        })
    }
}
