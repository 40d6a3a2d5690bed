//! Migration - 旧ストレージから新ストレージへの一度きりの移行
//!
//! # フロー（旧ストレージのキーごと）
//! 1. mapper で旧キー → 新キー
//! 2. 新ストレージに既にあればスキップ（再起動後の再実行を安全にする）
//! 3. 無ければ content_length → download → upload でストリームのまま流し込む
//! 4. upload 成功後に旧ストレージから削除
//!
//! 1 キーの失敗で移行全体を止めることはありません（warn ログを出して次へ）。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::future;
use futures::stream;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::init_gate::InitGate;
use super::storage::Storage;
use crate::domain::{
    AtomicState, ByteStream, DomainKey, ErrorKind, GateState, MigrationState, PresignedUpload,
    StorageError, StorageResult,
};
use crate::ports::{KeyStream, ObjectStorage};

type KeyMapper<O, N> = Arc<dyn Fn(&O) -> N + Send + Sync>;

/// MigrationReport は 1 回の移行の集計
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub migrated: usize,
    /// Keys already present in the new storage.
    pub skipped: usize,
    pub failed: usize,
}

enum KeyOutcome {
    Migrated,
    Skipped,
}

/// MigrationEngine は旧ストレージのキーをすべて新ストレージへ移す
///
/// # 状態遷移
/// - NotMigrated -> Migrating -> Migrated（compare-and-set、再実行は `IllegalState`）
pub struct MigrationEngine<O: DomainKey, N: DomainKey> {
    old: Arc<dyn ObjectStorage<O>>,
    new: Arc<dyn ObjectStorage<N>>,
    mapper: KeyMapper<O, N>,
    state: AtomicState<MigrationState>,
}

impl<O: DomainKey, N: DomainKey> MigrationEngine<O, N> {
    pub fn new(
        old: Arc<dyn ObjectStorage<O>>,
        new: Arc<dyn ObjectStorage<N>>,
        mapper: impl Fn(&O) -> N + Send + Sync + 'static,
    ) -> Self {
        Self {
            old,
            new,
            mapper: Arc::new(mapper),
            state: AtomicState::new(MigrationState::NotMigrated),
        }
    }

    pub fn state(&self) -> MigrationState {
        self.state.load()
    }

    /// Drains the old storage once.
    ///
    /// # Errors
    /// Only `IllegalState` when called a second time. Per-key failures are counted
    /// in the report and logged.
    pub async fn run(&self) -> StorageResult<MigrationReport> {
        self.state
            .transition(MigrationState::NotMigrated, MigrationState::Migrating)
            .map_err(|observed| {
                StorageError::IllegalState(format!("migration already ran (state {observed:?})"))
            })?;
        info!("Starting storage migration");

        let mut report = MigrationReport::default();
        let mut keys = self.old.list();
        while let Some(item) = keys.next().await {
            let old_key = match item {
                Ok(key) => key,
                Err(err) => {
                    // 列挙が途切れたら残りは次回の起動に回す
                    warn!(error = %err, "Listing the old storage failed, stopping early");
                    report.failed += 1;
                    break;
                }
            };
            match self.migrate_key(&old_key).await {
                Ok(KeyOutcome::Migrated) => report.migrated += 1,
                Ok(KeyOutcome::Skipped) => report.skipped += 1,
                Err(err) => {
                    warn!(key = ?old_key, error = %err, "Failed to migrate key");
                    report.failed += 1;
                }
            }
        }
        drop(keys);

        self.state
            .transition(MigrationState::Migrating, MigrationState::Migrated)
            .map_err(|observed| {
                StorageError::IllegalState(format!("migration finished from state {observed:?}"))
            })?;
        info!(
            migrated = report.migrated,
            skipped = report.skipped,
            failed = report.failed,
            "Storage migration finished"
        );
        Ok(report)
    }

    async fn migrate_key(&self, old_key: &O) -> StorageResult<KeyOutcome> {
        let new_key = (self.mapper)(old_key);

        // Conflict は行だけ残った中断済み upload。既存の行を再利用して流し直す
        let present = match self.new.does_exist(&new_key).await {
            Ok(present) => present,
            Err(err) if err.kind() == ErrorKind::Conflict => {
                debug!(key = ?old_key, "New storage has a row without a blob, copying again");
                false
            }
            Err(err) => return Err(err),
        };
        if present {
            // upload 後・delete 前に落ちた場合の残骸を片付ける
            self.old.delete(old_key).await?;
            debug!(key = ?old_key, "Already migrated, skipping");
            return Ok(KeyOutcome::Skipped);
        }

        let length = self.old.content_length(old_key).await?;
        let content = self.old.download(old_key).await?;
        let stored = self.new.upload(new_key, Some(length), content).await?;
        self.old.delete(old_key).await?;
        info!(from = ?old_key, to = ?stored, bytes = length, "Migrated key");
        Ok(KeyOutcome::Migrated)
    }

    #[cfg(test)]
    pub(crate) fn reset(&self) {
        self.state.force(MigrationState::NotMigrated);
    }
}

/// MigratingStorage は起動時に移行を行い、以後は新ストレージだけに委譲する
///
/// `start()` は両方の Storage を起動（または起動済みなら Ready を待機）してから
/// MigrationEngine を実行します。旧ストレージは公開契約からは読めなくなります。
pub struct MigratingStorage<O: DomainKey, N: DomainKey> {
    old: Arc<Storage<O>>,
    new: Arc<Storage<N>>,
    engine: Arc<MigrationEngine<O, N>>,
    gate: InitGate,
    bootstrap_runtime: Option<Handle>,
}

impl<O: DomainKey, N: DomainKey> MigratingStorage<O, N> {
    pub fn new(
        old: Arc<Storage<O>>,
        new: Arc<Storage<N>>,
        mapper: impl Fn(&O) -> N + Send + Sync + 'static,
    ) -> Self {
        let old_dyn: Arc<dyn ObjectStorage<O>> = old.clone();
        let new_dyn: Arc<dyn ObjectStorage<N>> = new.clone();
        Self {
            engine: Arc::new(MigrationEngine::new(old_dyn, new_dyn, mapper)),
            old,
            new,
            gate: InitGate::new(),
            bootstrap_runtime: None,
        }
    }

    /// Runtime the migration runs on instead of the caller's.
    pub fn with_bootstrap_runtime(mut self, handle: Handle) -> Self {
        self.bootstrap_runtime = Some(handle);
        self
    }

    pub fn state(&self) -> GateState {
        self.gate.state()
    }

    pub fn migration_state(&self) -> MigrationState {
        self.engine.state()
    }

    pub fn engine(&self) -> &Arc<MigrationEngine<O, N>> {
        &self.engine
    }

    /// Starts both storages if needed, then migrates.
    ///
    /// 移行中のキーごとの失敗は `Ready` への遷移を妨げません。
    pub fn start(&self) -> StorageResult<JoinHandle<StorageResult<()>>> {
        let old = Arc::clone(&self.old);
        let new = Arc::clone(&self.new);
        let engine = Arc::clone(&self.engine);
        let bootstrap = async move {
            ensure_started(&old).await?;
            ensure_started(&new).await?;
            engine.run().await?;
            Ok::<(), StorageError>(())
        };
        match &self.bootstrap_runtime {
            Some(handle) => self.gate.start_on(handle, bootstrap),
            None => self.gate.start(bootstrap),
        }
    }

    pub async fn wait_ready(&self) {
        self.gate.wait_ready().await;
    }
}

async fn ensure_started<K: DomainKey>(storage: &Storage<K>) -> StorageResult<()> {
    if storage.state() == GateState::NotStarted {
        storage.start()?.await.map_err(StorageError::transport)??;
    }
    storage.wait_ready().await;
    Ok(())
}

#[async_trait]
impl<O: DomainKey, N: DomainKey> ObjectStorage<N> for MigratingStorage<O, N> {
    fn list(&self) -> KeyStream<'_, N> {
        match self.gate.ensure_ready() {
            Ok(()) => self.new.list(),
            Err(err) => stream::once(future::ready(Err(err))).boxed(),
        }
    }

    async fn does_exist(&self, key: &N) -> StorageResult<bool> {
        self.gate.ensure_ready()?;
        self.new.does_exist(key).await
    }

    async fn content_length(&self, key: &N) -> StorageResult<u64> {
        self.gate.ensure_ready()?;
        self.new.content_length(key).await
    }

    async fn last_modified(&self, key: &N) -> StorageResult<DateTime<Utc>> {
        self.gate.ensure_ready()?;
        self.new.last_modified(key).await
    }

    async fn upload(
        &self,
        key: N,
        content_length: Option<u64>,
        content: ByteStream,
    ) -> StorageResult<N> {
        self.gate.ensure_ready()?;
        self.new.upload(key, content_length, content).await
    }

    async fn download(&self, key: &N) -> StorageResult<ByteStream> {
        self.gate.ensure_ready()?;
        self.new.download(key).await
    }

    async fn delete(&self, key: &N) -> StorageResult<bool> {
        self.gate.ensure_ready()?;
        self.new.delete(key).await
    }

    async fn move_key(&self, source: &N, target: &N) -> StorageResult<bool> {
        self.gate.ensure_ready()?;
        self.new.move_key(source, target).await
    }

    async fn generate_download_url(&self, key: &N) -> StorageResult<Option<Url>> {
        self.gate.ensure_ready()?;
        self.new.generate_download_url(key).await
    }

    async fn generate_upload_url(
        &self,
        key: N,
        content_length: u64,
    ) -> StorageResult<PresignedUpload<N>> {
        self.gate.ensure_ready()?;
        self.new.generate_upload_url(key, content_length).await
    }
}
