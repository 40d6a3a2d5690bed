//! ReconciliationJob - Metastore に無い blob の隔離
//!
//! # フロー
//! 1. prefix 配下の blob 名をすべて列挙（ページングを最後まで辿る）
//! 2. 名前の末尾を ID として解釈し、`Metastore::find` で行があるか確認
//! 3. 解釈できない／行が無い名前（unexpected）を backup prefix に copy してから delete
//!
//! 破壊的な delete を copy より先に行うことはありません。
//! 名前ごとの失敗は warn ログに残して次へ進みます。

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::domain::{DomainKey, StorageResult};
use crate::impls::EntryIdCodec;
use crate::ports::{BlobBackend, Clock, KeyCodec, Metastore, list_all_names};

/// Quarantine prefix for `prefix` at `epoch_secs`: `<prefix>-backup-<epoch>/`.
pub fn backup_prefix(prefix: &str, epoch_secs: i64) -> String {
    format!("{}-backup-{epoch_secs}/", prefix.trim_end_matches('/'))
}

fn backup_namespace(prefix: &str) -> String {
    format!("{}-backup-", prefix.trim_end_matches('/'))
}

/// ReconciliationReport は 1 回の実行結果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    /// Names listed under the prefix.
    pub scanned: usize,
    /// Names with no live metastore row, sorted.
    pub unexpected: Vec<String>,
    /// Original names that were copied and then deleted.
    pub quarantined: Vec<String>,
    /// Names that could not be checked or moved.
    pub failed: Vec<String>,
    /// Set only when something was unexpected.
    pub backup_prefix: Option<String>,
}

/// ReconciliationJob は ID-backed なストレージの blob を Metastore に突き合わせる
pub struct ReconciliationJob<K: DomainKey> {
    backend: Arc<dyn BlobBackend>,
    metastore: Arc<dyn Metastore<K>>,
    prefix: String,
    clock: Arc<dyn Clock>,
}

impl<K: DomainKey> ReconciliationJob<K> {
    pub fn new(
        backend: Arc<dyn BlobBackend>,
        metastore: Arc<dyn Metastore<K>>,
        prefix: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backend,
            metastore,
            prefix: prefix.into(),
            clock,
        }
    }

    /// Runs one pass. Only a failed listing is returned as an error.
    pub async fn run(&self) -> StorageResult<ReconciliationReport> {
        let names = list_all_names(Arc::clone(&self.backend), &self.prefix).await?;
        let mut report = ReconciliationReport {
            scanned: names.len(),
            ..ReconciliationReport::default()
        };

        // root prefix のときは過去の backup も列挙されるので除外する
        let namespace = backup_namespace(&self.prefix);
        for name in names {
            if name.starts_with(&namespace) {
                continue;
            }
            match self.is_owned(&name).await {
                Ok(true) => {}
                Ok(false) => report.unexpected.push(name),
                Err(err) => {
                    warn!(name = %name, error = %err, "Failed to look up metastore row");
                    report.failed.push(name);
                }
            }
        }

        if report.unexpected.is_empty() {
            info!(prefix = %self.prefix, scanned = report.scanned, "No unexpected blobs");
            return Ok(report);
        }

        let target_prefix = backup_prefix(&self.prefix, self.clock.now().timestamp());
        warn!(
            prefix = %self.prefix,
            backup_prefix = %target_prefix,
            unexpected = ?report.unexpected,
            "Found blobs without metastore rows, moving them to backup"
        );

        for name in &report.unexpected {
            let suffix = name.strip_prefix(self.prefix.as_str()).unwrap_or(name);
            let target = format!("{target_prefix}{suffix}");
            match self.quarantine(name, &target).await {
                Ok(()) => report.quarantined.push(name.clone()),
                Err(err) => {
                    warn!(name = %name, target = %target, error = %err, "Failed to quarantine blob");
                    report.failed.push(name.clone());
                }
            }
        }

        info!(
            backup_prefix = %target_prefix,
            quarantined = ?report.quarantined,
            failed = report.failed.len(),
            "Moved unexpected blobs to backup"
        );
        report.backup_prefix = Some(target_prefix);
        Ok(report)
    }

    async fn is_owned(&self, name: &str) -> StorageResult<bool> {
        let suffix = name.strip_prefix(self.prefix.as_str()).unwrap_or(name);
        let Ok(id) = EntryIdCodec.decode(&self.prefix, suffix) else {
            return Ok(false);
        };
        Ok(self.metastore.find(id).await?.is_some())
    }

    async fn quarantine(&self, name: &str, target: &str) -> StorageResult<()> {
        self.backend.copy(name, target).await?;
        self.backend.delete(name).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EntryId;
    use crate::impls::{BlobOp, InMemoryBlobBackend, InMemoryMetastore};
    use crate::ports::FixedClock;
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};
    use rstest::rstest;

    fn clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
        ))
    }

    #[rstest]
    #[case("files/", 1_704_110_400, "files-backup-1704110400/")]
    #[case("a/b/", 7, "a/b-backup-7/")]
    #[case("", 7, "-backup-7/")]
    fn backup_prefix_is_timestamped(#[case] prefix: &str, #[case] epoch: i64, #[case] expected: &str) {
        assert_eq!(backup_prefix(prefix, epoch), expected);
    }

    async fn setup(
        blobs: &[&str],
        rows: &[i64],
    ) -> (Arc<InMemoryBlobBackend>, Arc<InMemoryMetastore<EntryId>>) {
        let backend = Arc::new(InMemoryBlobBackend::new().with_page_size(2));
        for name in blobs {
            backend.insert(*name, Bytes::from(name.to_string())).await;
        }
        let metastore = Arc::new(InMemoryMetastore::<EntryId>::new());
        for id in rows {
            metastore.save(&EntryId::new(*id)).await.unwrap();
        }
        (backend, metastore)
    }

    #[tokio::test]
    async fn orphans_are_copied_then_deleted() {
        let (backend, metastore) = setup(&["files/1", "files/42", "files/77", "files/x"], &[1]).await;
        let job = ReconciliationJob::new(backend.clone(), metastore, "files/", clock());

        let report = job.run().await.unwrap();

        assert_eq!(report.scanned, 4);
        assert_eq!(report.unexpected, vec!["files/42", "files/77", "files/x"]);
        assert_eq!(report.quarantined, report.unexpected);
        assert!(report.failed.is_empty());
        assert_eq!(report.backup_prefix.as_deref(), Some("files-backup-1704110400/"));
        assert_eq!(
            backend.names().await,
            vec![
                "files-backup-1704110400/42",
                "files-backup-1704110400/77",
                "files-backup-1704110400/x",
                "files/1",
            ]
        );
        assert_eq!(
            backend.contents("files-backup-1704110400/42").await,
            Some(Bytes::from_static(b"files/42"))
        );
    }

    #[tokio::test]
    async fn nothing_moves_when_every_blob_is_owned() {
        let (backend, metastore) = setup(&["files/1", "files/2"], &[1, 2]).await;
        let job = ReconciliationJob::new(backend.clone(), metastore, "files/", clock());

        let report = job.run().await.unwrap();

        assert!(report.unexpected.is_empty());
        assert_eq!(report.backup_prefix, None);
        assert_eq!(backend.names().await, vec!["files/1", "files/2"]);
    }

    #[tokio::test]
    async fn failed_copy_keeps_the_original() {
        let (backend, metastore) = setup(&["files/42", "files/77"], &[]).await;
        backend.fail(BlobOp::Copy, "files/42").await;
        let job = ReconciliationJob::new(backend.clone(), metastore, "files/", clock());

        let report = job.run().await.unwrap();

        assert_eq!(report.quarantined, vec!["files/77"]);
        assert_eq!(report.failed, vec!["files/42"]);
        assert_eq!(
            backend.names().await,
            vec!["files-backup-1704110400/77", "files/42"]
        );
    }

    #[tokio::test]
    async fn listing_failure_is_an_error() {
        let (backend, metastore) = setup(&["files/1"], &[]).await;
        backend.fail_all(BlobOp::List).await;
        let job = ReconciliationJob::new(backend, metastore, "files/", clock());

        assert!(job.run().await.is_err());
    }

    #[tokio::test]
    async fn root_prefix_skips_previous_backups() {
        let (backend, metastore) = setup(&["-backup-5/9", "3"], &[]).await;
        let job = ReconciliationJob::new(backend.clone(), metastore, "", clock());

        let report = job.run().await.unwrap();

        assert_eq!(report.unexpected, vec!["3"]);
        assert!(backend.names().await.contains(&"-backup-5/9".to_string()));
    }
}
