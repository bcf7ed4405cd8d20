//! Chaos tests for Syncfold
//!
//! Failing storage, interrupted transactions and corrupted remote data.
//! Every scenario checks that the failure is reported, that nothing partial
//! becomes visible and that the next run recovers.

use super::{at, random_bytes, TestClient};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use syncfold::config::RetryConfig;
use syncfold::model::Checksum;
use syncfold::transfer::{
    FailureKind, ManifestEntry, MemoryTransferManager, Operation, RemoteFile, RemoteFileKind,
    RetriableTransferManager, TransactionManifest, TransferManager,
};
use syncfold::SyncError;
use tempfile::TempDir;
use tracing_test::traced_test;

fn no_delay(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        delay: Duration::ZERO,
    }
}

#[traced_test]
#[test]
fn test_transient_failures_below_limit_are_retried() {
    let temp_dir = TempDir::new().unwrap();
    let local = temp_dir.path().join("payload");
    std::fs::write(&local, b"payload").unwrap();
    let remote = RemoteFile::transaction("A", 1);

    for k in 0..3usize {
        let backend = MemoryTransferManager::new();
        backend.fail_next(Operation::Upload, k, FailureKind::Transient);
        let retrying = RetriableTransferManager::with_config(&backend, no_delay(3));

        retrying.upload(&local, &remote).unwrap();
        // k retries on top of the first attempt
        assert_eq!(backend.calls(Operation::Upload), k + 1);
        assert_eq!(backend.get(&remote).unwrap(), b"payload");
    }
    assert!(logs_contain("Retrying upload: 2/3"));
    assert!(logs_contain("Retrying upload: 3/3"));
}

#[test]
fn test_transient_failures_at_limit_surface() {
    let backend = MemoryTransferManager::new();
    backend.fail_next(Operation::Delete, 3, FailureKind::Transient);
    let retrying = RetriableTransferManager::with_config(&backend, no_delay(3));

    let err = retrying.delete(&RemoteFile::transaction("A", 1)).unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(backend.calls(Operation::Delete), 3);
}

#[test]
fn test_not_found_is_never_retried() {
    let temp_dir = TempDir::new().unwrap();
    let backend = MemoryTransferManager::new();
    let retrying = RetriableTransferManager::with_config(&backend, no_delay(5));

    let missing = RemoteFile::parse("database-A-0000000009").unwrap();
    let err = retrying
        .download(&missing, &temp_dir.path().join("out"))
        .unwrap_err();
    assert!(err.is_permanent_storage_failure());
    assert_eq!(backend.calls(Operation::Download), 1);

    let err = retrying
        .move_file(&missing, &RemoteFile::parse("database-A-0000000010").unwrap())
        .unwrap_err();
    assert!(matches!(err, SyncError::StorageMoveFailed { .. }));
    assert_eq!(backend.calls(Operation::Move), 1);
}

#[test]
fn test_failed_publish_leaves_remote_untouched() {
    let remote = Arc::new(MemoryTransferManager::new());
    let mut a = TestClient::new("A", &remote);
    a.write("data.bin", &random_bytes(11, 6000), at(0));

    remote.fail_matching(Operation::Move, "database-", FailureKind::Transient);
    let err = a.sync.up().unwrap_err();
    match &err {
        SyncError::SyncAborted { operation, source } => {
            assert_eq!(operation, "up");
            assert!(source.is_retryable());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.user_message().contains("up"));

    // Rolled back: no containers, temps, manifests or databases remain
    assert!(remote.is_empty(), "left behind: {:?}", remote.names(RemoteFileKind::Temp));
    assert!(a.sync.database().versions().is_empty());

    remote.clear_failures();
    let id = a.sync.up().unwrap().unwrap();
    assert_eq!(id.sequence, 1);
    assert_eq!(remote.names(RemoteFileKind::Database).len(), 1);
}

#[test]
fn test_stale_transaction_is_cleaned_before_next_publish() {
    let remote = Arc::new(MemoryTransferManager::new());
    let mut a = TestClient::new("A", &remote);

    // Leftovers of a crashed run: a moved container and a staged database
    let container = RemoteFile::parse(&format!("multichunk-{}", Checksum::of(b"orphan").to_hex())).unwrap();
    let database = RemoteFile::parse("database-A-0000000001").unwrap();
    let staged = RemoteFile::temp_for(&database);
    remote.put(&container, b"orphan".to_vec());
    remote.put(&staged, b"half".to_vec());

    let manifest = TransactionManifest {
        client: "A".to_string(),
        created: chrono::Utc::now(),
        entries: vec![
            ManifestEntry {
                temp: RemoteFile::temp_for(&container).name().to_string(),
                target: container.name().to_string(),
            },
            ManifestEntry {
                temp: staged.name().to_string(),
                target: database.name().to_string(),
            },
        ],
    };
    remote.put(
        &RemoteFile::transaction("A", 42),
        serde_json::to_vec(&manifest).unwrap(),
    );
    // Someone else's manifest is not ours to clean
    remote.put(&RemoteFile::transaction("B", 42), b"{}".to_vec());

    assert!(a.sync.up().unwrap().is_none());
    assert!(remote.names(RemoteFileKind::MultiChunk).is_empty());
    assert!(remote.names(RemoteFileKind::Temp).is_empty());
    assert_eq!(remote.names(RemoteFileKind::Transaction), vec!["transaction-B-42"]);
}

#[test]
fn test_corrupted_multichunk_is_detected_and_recovered() {
    let remote = Arc::new(MemoryTransferManager::new());
    let mut a = TestClient::new("A", &remote);
    let mut b = TestClient::new("B", &remote);

    let content = random_bytes(21, 7000);
    a.write("photo.raw", &content, at(0));
    a.sync.up().unwrap().unwrap();

    let names = remote.names(RemoteFileKind::MultiChunk);
    assert_eq!(names.len(), 1);
    let container = RemoteFile::parse(&names[0]).unwrap();
    let original = remote.get(&container).unwrap();
    let mut corrupted = original.clone();
    let last = corrupted.len() - 1;
    corrupted[last] ^= 0x5a;
    remote.put(&container, corrupted);

    let err = b.sync.down().unwrap_err();
    match &err {
        SyncError::SyncAborted { source, .. } => assert!(
            source.is_corruption() || matches!(**source, SyncError::Transform(_)),
            "unexpected cause: {source}"
        ),
        other => panic!("unexpected error: {other}"),
    }
    // Nothing was adopted, so the next run starts over
    assert!(b.sync.database().versions().is_empty());
    assert!(!b.exists("photo.raw"));

    remote.put(&container, original);
    b.sync.down().unwrap();
    assert_eq!(b.read("photo.raw"), content);
}

#[traced_test]
#[test]
fn test_unreadable_database_file_quarantines_its_client() {
    let remote = Arc::new(MemoryTransferManager::new());
    let mut a = TestClient::new("A", &remote);
    let mut b = TestClient::new("B", &remote);

    a.write("fine.txt", b"good version", at(0));
    let first = a.sync.up().unwrap().unwrap();

    let mut rng = StdRng::seed_from_u64(99);
    let garbage: Vec<u8> = (0..256).map(|_| rng.random()).collect();
    remote.put(&RemoteFile::parse("database-A-0000000002").unwrap(), garbage);

    let merge = b.sync.down().unwrap();
    assert_eq!(merge.accepted, vec![first]);
    assert!(merge.quarantined.contains_key("A"));
    assert_eq!(b.read("fine.txt"), b"good version");
    assert!(logs_contain("Cannot decode database-A-0000000002"));
}

#[test]
fn test_wrong_key_cannot_read_repository() {
    use syncfold::config::{ChunkerConfig, SyncConfig, TransformerConfig};
    use syncfold::database::LocalDatabaseStore;
    use syncfold::transform::MasterKey;
    use syncfold::Synchronizer;

    let remote = Arc::new(MemoryTransferManager::new());
    let mut a = TestClient::new("A", &remote);
    a.write("secret.txt", b"top secret", at(0));
    a.sync.up().unwrap().unwrap();

    // Ciphertext only: the plaintext never reaches the store
    for name in remote.names(RemoteFileKind::MultiChunk) {
        let bytes = remote.get(&RemoteFile::parse(&name).unwrap()).unwrap();
        assert!(!bytes.windows(10).any(|w| w == b"top secret"));
    }

    let root = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let db = TempDir::new().unwrap();
    let config = SyncConfig::builder("M")
        .chunker(ChunkerConfig::Fixed { size: 1024 })
        .transformers(TransformerConfig::compressed_and_encrypted())
        .build()
        .unwrap();
    let mut mallory = Synchronizer::new(
        config,
        root.path(),
        work.path(),
        Arc::clone(&remote),
        LocalDatabaseStore::open(db.path()).unwrap(),
        Some(&MasterKey::new(vec![1u8; 32]).unwrap()),
    )
    .unwrap();

    let merge = mallory.down().unwrap();
    assert!(merge.accepted.is_empty());
    assert!(merge.quarantined.contains_key("A"));
    assert!(!root.path().join("secret.txt").exists());
}
