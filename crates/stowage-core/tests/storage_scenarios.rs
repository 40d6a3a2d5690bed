//! End-to-end scenarios over the public storage contract.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use object_store::memory::InMemory;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use stowage_core::domain::collect_bytes;
use stowage_core::impls::{
    BlobOp, InMemoryBlobBackend, InMemoryMetastore, ObjectStoreBackend, PathKeyCodec,
    SqliteMetastore,
};
use stowage_core::ports::{BlobBackend, Clock, FixedClock, Metastore, list_all_names};
use stowage_core::{
    DomainKey, EntryId, ErrorKind, GateState, MigratingStorage, MigrationState, ObjectStorage,
    ObjectStorageExt, Storage,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn random_bytes(len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    Bytes::from(data)
}

fn fixed_clock() -> Arc<dyn Clock> {
    Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
    ))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct ReportKey {
    #[serde(skip)]
    id: Option<EntryId>,
    project: String,
    file: String,
}

impl ReportKey {
    fn new(project: &str, file: &str) -> Self {
        Self {
            id: None,
            project: project.to_string(),
            file: file.to_string(),
        }
    }
}

impl DomainKey for ReportKey {
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

async fn start<K: DomainKey>(storage: &Storage<K>) {
    storage.start().unwrap().await.unwrap().unwrap();
    assert_eq!(storage.state(), GateState::Ready);
}

#[tokio::test]
async fn avatar_round_trip() {
    init_tracing();
    let storage = Storage::<String>::builder()
        .backend(Arc::new(InMemoryBlobBackend::new()))
        .codec(PathKeyCodec)
        .build()
        .unwrap();
    start(&storage).await;

    let key = "avatars/user/alice.png".to_string();
    let content = random_bytes(1024);

    let stored = storage.upload_bytes(key.clone(), content.clone()).await.unwrap();
    assert_eq!(stored, key);
    assert!(storage.does_exist(&key).await.unwrap());
    assert_eq!(storage.content_length(&key).await.unwrap(), 1024);
    assert_eq!(storage.download_bytes(&key).await.unwrap(), content);

    assert!(storage.delete(&key).await.unwrap());
    assert!(!storage.does_exist(&key).await.unwrap());
}

#[tokio::test]
async fn orphans_are_quarantined_on_start() {
    init_tracing();
    let backend = Arc::new(InMemoryBlobBackend::new().with_page_size(3));
    let metastore = Arc::new(InMemoryMetastore::<String>::new());
    backend.insert("files/42", Bytes::from_static(b"orphan-42")).await;
    backend.insert("files/77", Bytes::from_static(b"orphan-77")).await;

    // 行と blob が揃った正常なエントリ
    let owned = metastore.save(&"kept.sarif".to_string()).await.unwrap();
    backend
        .insert(format!("files/{}", owned.id), Bytes::from_static(b"kept"))
        .await;

    let storage = Storage::<String>::builder()
        .backend(backend.clone())
        .prefix("files")
        .metastore(metastore.clone())
        .clock(fixed_clock())
        .build()
        .unwrap();
    start(&storage).await;

    assert_eq!(list_all_names(backend.clone(), "files/").await.unwrap(), vec!["files/1"]);
    assert_eq!(storage.list_all().await.unwrap(), vec!["kept.sarif"]);
    assert_eq!(
        backend.contents("files-backup-1704110400/42").await,
        Some(Bytes::from_static(b"orphan-42"))
    );
    assert_eq!(
        backend.contents("files-backup-1704110400/77").await,
        Some(Bytes::from_static(b"orphan-77"))
    );
}

#[tokio::test]
async fn reconciliation_keeps_exactly_the_owned_blobs() {
    const N: usize = 7;
    const M: usize = 4;
    let backend = Arc::new(InMemoryBlobBackend::new().with_page_size(2));
    let metastore = Arc::new(InMemoryMetastore::<String>::new());
    let storage = Storage::<String>::builder()
        .backend(backend.clone())
        .prefix("files")
        .metastore(metastore.clone())
        .clock(fixed_clock())
        .build()
        .unwrap();
    start(&storage).await;

    let mut keys = Vec::new();
    for i in 0..N {
        let key = format!("report-{i}.sarif");
        storage
            .upload_bytes(key.clone(), Bytes::from(key.clone()))
            .await
            .unwrap();
        keys.push(key);
    }
    // 後ろの N - M 件の行だけを消して orphan を作る
    for key in &keys[M..] {
        let entry = metastore.find_by_key(key).await.unwrap().unwrap();
        metastore.delete(entry.id).await.unwrap();
    }

    let report = storage.reconciliation_job().unwrap().run().await.unwrap();

    assert_eq!(report.scanned, N);
    assert_eq!(report.quarantined.len(), N - M);
    assert!(report.failed.is_empty());
    let backup = report.backup_prefix.unwrap();
    assert_eq!(list_all_names(backend.clone(), &backup).await.unwrap().len(), N - M);
    assert_eq!(list_all_names(backend.clone(), "files/").await.unwrap().len(), M);
    for key in &keys[..M] {
        assert_eq!(
            storage.download_bytes(key).await.unwrap(),
            Bytes::from(key.clone())
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readiness_is_gated_and_start_is_once() {
    let storage = Arc::new(
        Storage::<String>::builder()
            .backend(Arc::new(InMemoryBlobBackend::new()))
            .codec(PathKeyCodec)
            .build()
            .unwrap(),
    );
    let key = "a.png".to_string();

    assert_eq!(
        storage.does_exist(&key).await.unwrap_err().kind(),
        ErrorKind::NotReady
    );

    let attempts: Vec<_> = (0..4)
        .map(|_| {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move { storage.start().map(|_| ()) })
        })
        .collect();
    let mut illegal = 0;
    for attempt in attempts {
        if let Err(err) = attempt.await.unwrap() {
            assert_eq!(err.kind(), ErrorKind::IllegalState);
            illegal += 1;
        }
    }
    assert_eq!(illegal, 3);

    storage.wait_ready().await;
    assert!(!storage.does_exist(&key).await.unwrap());
}

#[tokio::test]
async fn failed_upload_leaves_no_row() {
    let backend = Arc::new(InMemoryBlobBackend::new());
    let metastore = Arc::new(InMemoryMetastore::<String>::new());
    let storage = Storage::<String>::builder()
        .backend(backend.clone())
        .prefix("files")
        .metastore(metastore.clone())
        .build()
        .unwrap();
    start(&storage).await;
    backend.fail(BlobOp::Put, "files/1").await;

    let err = storage
        .upload_bytes("broken.sarif".to_string(), random_bytes(16))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(metastore.find(EntryId::new(1)).await.unwrap().is_none());
    assert!(!storage.does_exist(&"broken.sarif".to_string()).await.unwrap());
}

#[tokio::test]
async fn sqlite_indexed_storage_over_object_store() {
    init_tracing();
    let backend: Arc<dyn BlobBackend> = Arc::new(ObjectStoreBackend::new(Arc::new(InMemory::new())));
    let metastore = Arc::new(
        SqliteMetastore::<ReportKey>::connect("sqlite::memory:", "report_files")
            .await
            .unwrap(),
    );
    let storage = Storage::<ReportKey>::builder()
        .backend(backend.clone())
        .prefix("reports")
        .metastore(metastore.clone())
        .build()
        .unwrap();
    start(&storage).await;

    let content = random_bytes(300);
    let stored = storage
        .upload_bytes(ReportKey::new("analyzer", "results.sarif"), content.clone())
        .await
        .unwrap();
    let id = stored.id.unwrap();

    assert_eq!(
        list_all_names(backend.clone(), "reports/").await.unwrap(),
        vec![format!("reports/{id}")]
    );
    // ID を持たないキーでも属性で引ける
    let lookup = ReportKey::new("analyzer", "results.sarif");
    assert_eq!(storage.download_bytes(&lookup).await.unwrap(), content);
    assert_eq!(storage.download_bytes(&stored).await.unwrap(), content);
    assert_eq!(storage.list_all().await.unwrap(), vec![stored.clone()]);

    let streamed = storage.download(&stored).await.unwrap();
    assert_eq!(collect_bytes(streamed).await.unwrap().len(), 300);

    assert!(storage.delete(&lookup).await.unwrap());
    assert!(metastore.find(id).await.unwrap().is_none());
    assert!(!storage.does_exist(&lookup).await.unwrap());
}

#[tokio::test]
async fn legacy_paths_migrate_into_indexed_storage() {
    init_tracing();
    let legacy_backend = Arc::new(InMemoryBlobBackend::new().with_page_size(2));
    let names = ["alpha/a.sarif", "alpha/b.sarif", "beta/c.sarif"];
    for name in names {
        legacy_backend
            .insert(format!("legacy/{name}"), Bytes::from(name.to_string()))
            .await;
    }
    legacy_backend.fail(BlobOp::Get, "legacy/alpha/b.sarif").await;

    let legacy = Arc::new(
        Storage::<String>::builder()
            .backend(legacy_backend.clone())
            .prefix("legacy")
            .codec(PathKeyCodec)
            .build()
            .unwrap(),
    );
    let metastore = Arc::new(InMemoryMetastore::<ReportKey>::new());
    let indexed = Arc::new(
        Storage::<ReportKey>::builder()
            .backend(Arc::new(InMemoryBlobBackend::new()))
            .prefix("reports")
            .metastore(metastore.clone())
            .build()
            .unwrap(),
    );
    let storage = MigratingStorage::new(legacy, indexed, |path: &String| {
        let (project, file) = path.split_once('/').unwrap_or(("", path.as_str()));
        ReportKey::new(project, file)
    });

    storage.start().unwrap().await.unwrap().unwrap();

    assert_eq!(storage.migration_state(), MigrationState::Migrated);
    assert_eq!(legacy_backend.names().await, vec!["legacy/alpha/b.sarif"]);
    assert_eq!(metastore.len().await, 2);
    assert_eq!(
        storage
            .download_bytes(&ReportKey::new("beta", "c.sarif"))
            .await
            .unwrap(),
        Bytes::from_static(b"beta/c.sarif")
    );
    assert!(
        !storage
            .does_exist(&ReportKey::new("alpha", "b.sarif"))
            .await
            .unwrap()
    );
}
