//! Transfer failures injected through the unreliable_local plugin.

use std::io::Cursor;
use std::sync::Arc;
use syncvault_reduce::{DedupIndex, MemoryDedupIndex, ReduceError};
use syncvault_tests::{
    init_test_tracing, random_bytes, FailureRule, TestRepo, UnreliableLocalConnection,
};
use syncvault_transfer::{Connection, RetryConfig, TransferError};

fn unreliable(repo: &TestRepo, rules: Vec<FailureRule>) -> UnreliableLocalConnection {
    UnreliableLocalConnection::new(repo.repo_path(), rules)
}

#[tokio::test]
async fn test_single_upload_failure_is_retried() {
    init_test_tracing();
    let repo = TestRepo::new();
    let connection = unreliable(
        &repo,
        vec![FailureRule::new("op=upload remote=multichunk-").unwrap().times(1)],
    );
    connection.create_transfer_manager().unwrap().init(true).await.unwrap();
    let index: Arc<dyn DedupIndex> = Arc::new(MemoryDedupIndex::new());
    let engine = repo
        .engine_with("client", &connection, Arc::clone(&index))
        .unwrap();

    let data = random_bytes(1024 * 1024, 11);
    let report = engine.sync_reader(Cursor::new(data.clone())).await.unwrap();

    assert_eq!(connection.faults().injected_count(), 1);
    assert_eq!(report.containers_uploaded, 1);
    assert_eq!(repo.stored_containers().len(), 1);
    assert_eq!(index.len(), report.chunks_new);
    assert_eq!(index.referenced_containers().len(), 1);
    for checksum in &report.manifest.chunks {
        assert!(index.contains(checksum));
    }

    let mut out = Vec::new();
    engine.restore(&report.manifest, &mut out).await.unwrap();
    assert_eq!(out, data);
}

#[tokio::test]
async fn test_failed_transfer_leaves_no_index_entries() {
    let repo = TestRepo::new();
    let connection = repo
        .connect(&repo.unreliable_connection_config(&["op=upload"]))
        .await
        .unwrap();
    let index: Arc<dyn DedupIndex> = Arc::new(MemoryDedupIndex::new());
    let engine = repo
        .engine_with("client", connection.as_ref(), Arc::clone(&index))
        .unwrap();

    let data = random_bytes(512 * 1024, 12);
    let err = engine.sync_reader(Cursor::new(data.clone())).await.unwrap_err();
    assert!(matches!(
        err,
        ReduceError::Transfer(TransferError::Injected { .. })
    ));
    assert!(index.is_empty());
    assert!(repo.stored_containers().is_empty());
    let leftovers = std::fs::read_dir(repo.cache_path("client")).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_failure_mid_session_keeps_earlier_files() {
    let repo = TestRepo::new().with_retry(RetryConfig::no_retry());
    let connection = unreliable(&repo, Vec::new());
    connection.create_transfer_manager().unwrap().init(true).await.unwrap();
    let index: Arc<dyn DedupIndex> = Arc::new(MemoryDedupIndex::new());
    let engine = repo
        .engine_with("client", &connection, Arc::clone(&index))
        .unwrap();

    let first = random_bytes(600_000, 13);
    let first_report = engine.sync_reader(Cursor::new(first.clone())).await.unwrap();
    let indexed = index.len();

    connection
        .faults()
        .add_rule(FailureRule::new("op=upload").unwrap());
    let second = random_bytes(600_000, 14);
    assert!(engine.sync_reader(Cursor::new(second.clone())).await.is_err());
    assert_eq!(index.len(), indexed);
    engine.verify_index().await.unwrap();

    connection.faults().clear_rules();
    let second_report = engine.sync_reader(Cursor::new(second.clone())).await.unwrap();
    let mut out = Vec::new();
    engine.restore(&first_report.manifest, &mut out).await.unwrap();
    assert_eq!(out, first);
    out.clear();
    engine.restore(&second_report.manifest, &mut out).await.unwrap();
    assert_eq!(out, second);
}

#[tokio::test]
async fn test_download_failures_are_retried() {
    let repo = TestRepo::new();
    let connection = unreliable(&repo, Vec::new());
    connection.create_transfer_manager().unwrap().init(true).await.unwrap();
    let engine = repo
        .engine_with("client", &connection, Arc::new(MemoryDedupIndex::new()))
        .unwrap();

    let data = random_bytes(700_000, 15);
    let report = engine.sync_reader(Cursor::new(data.clone())).await.unwrap();

    connection
        .faults()
        .add_rule(FailureRule::new("op=download").unwrap().times(2));
    let mut out = Vec::new();
    engine.restore(&report.manifest, &mut out).await.unwrap();
    assert_eq!(out, data);
    assert_eq!(connection.faults().injected_count(), 2);
}

#[tokio::test]
async fn test_orphan_from_interrupted_sync_is_collected() {
    let repo = TestRepo::new();
    let connection = unreliable(&repo, Vec::new());
    let manager = connection.create_transfer_manager().unwrap();
    manager.init(true).await.unwrap();
    let engine = repo
        .engine_with("client", &connection, Arc::new(MemoryDedupIndex::new()))
        .unwrap();

    let data = random_bytes(400_000, 16);
    let report = engine.sync_reader(Cursor::new(data.clone())).await.unwrap();

    // Container reached the remote but the client died before indexing it.
    let stray = repo.root().join("stray");
    std::fs::write(&stray, b"never indexed").unwrap();
    let orphan = syncvault_reduce::ContainerId::random().remote_file().unwrap();
    manager.upload(&stray, &orphan).await.unwrap();
    assert_eq!(repo.stored_containers().len(), report.containers_uploaded + 1);

    let stats = engine.collect_garbage().await.unwrap();
    assert_eq!(stats.containers_deleted, 1);
    assert_eq!(repo.stored_containers().len(), report.containers_uploaded);
    engine.verify_index().await.unwrap();
}

#[tokio::test]
async fn test_permanent_errors_are_not_retried() {
    let repo = TestRepo::new();
    let connection = unreliable(&repo, Vec::new());
    // Repository never initialized: uploads fail with RepositoryNotFound.
    let engine = repo
        .engine_with("client", &connection, Arc::new(MemoryDedupIndex::new()))
        .unwrap();
    let data = random_bytes(100_000, 17);
    let err = engine.sync_reader(Cursor::new(data.clone())).await.unwrap_err();
    assert!(matches!(
        err,
        ReduceError::Transfer(TransferError::RepositoryNotFound { .. })
    ));
    let uploads = connection
        .faults()
        .operations()
        .iter()
        .filter(|op| op.contains("op=upload"))
        .count();
    assert_eq!(uploads, 1);
}
