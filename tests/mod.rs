//! Main test module for Syncfold
//!
//! This module includes all test suites:
//! - Integration tests for multi-client sync scenarios
//! - Chaos tests for failing storage and corrupted data
//! - Property-based tests for invariants

pub mod integration;
pub mod chaos;
pub mod property;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use filetime::FileTime;
use syncfold::config::{ChunkerConfig, SyncConfig, TransformerConfig};
use syncfold::database::LocalDatabaseStore;
use syncfold::transfer::MemoryTransferManager;
use syncfold::transform::MasterKey;
use syncfold::Synchronizer;
use tempfile::TempDir;

/// One client of a shared in-memory repository
pub struct TestClient {
    pub root: TempDir,
    pub work: TempDir,
    pub db: TempDir,
    pub sync: Synchronizer<Arc<MemoryTransferManager>, LocalDatabaseStore>,
}

impl TestClient {
    /// Create a client with small chunks, encryption and no retry delay
    pub fn new(client_id: &str, remote: &Arc<MemoryTransferManager>) -> Self {
        let root = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let db = TempDir::new().unwrap();

        let config = SyncConfig::builder(client_id)
            .chunker(ChunkerConfig::Fixed { size: 1024 })
            .max_multi_chunk_size(16 * 1024)
            .transformers(TransformerConfig::compressed_and_encrypted())
            .retry(3, Duration::ZERO)
            .build()
            .unwrap();
        let store = LocalDatabaseStore::open(db.path()).unwrap();
        let sync = Synchronizer::new(
            config,
            root.path(),
            work.path(),
            Arc::clone(remote),
            store,
            Some(&test_key()),
        )
        .unwrap();

        Self { root, work, db, sync }
    }

    /// Reopen the same folders, as after a restart
    pub fn reopen(self, remote: &Arc<MemoryTransferManager>) -> Self {
        let config = SyncConfig::builder(self.sync.client_id())
            .chunker(ChunkerConfig::Fixed { size: 1024 })
            .max_multi_chunk_size(16 * 1024)
            .transformers(TransformerConfig::compressed_and_encrypted())
            .retry(3, Duration::ZERO)
            .build()
            .unwrap();
        let store = LocalDatabaseStore::open(self.db.path()).unwrap();
        let sync = Synchronizer::new(
            config,
            self.root.path(),
            self.work.path(),
            Arc::clone(remote),
            store,
            Some(&test_key()),
        )
        .unwrap();
        Self { sync, ..self }
    }

    /// Write a file with a fixed modification time
    pub fn write(&self, relative: &str, content: &[u8], modified: DateTime<Utc>) {
        let path = self.root.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        set_mtime(&path, modified);
    }

    pub fn read(&self, relative: &str) -> Vec<u8> {
        fs::read(self.root.path().join(relative)).unwrap()
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.root.path().join(relative).exists()
    }

    /// Relative names of all regular files in the sync folder
    pub fn files(&self) -> Vec<String> {
        let mut files: Vec<String> = walkdir::WalkDir::new(self.root.path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                e.path()
                    .strip_prefix(self.root.path())
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect();
        files.sort();
        files
    }
}

pub fn test_key() -> MasterKey {
    MasterKey::new(b"correct horse battery staple 123".to_vec()).unwrap()
}

pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
}

pub fn set_mtime(path: &Path, when: DateTime<Utc>) {
    let time = FileTime::from_unix_time(when.timestamp(), when.timestamp_subsec_nanos());
    filetime::set_file_mtime(path, time).unwrap();
}

/// Deterministic pseudo-random bytes
pub fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill(&mut data[..]);
    data
}

#[cfg(test)]
mod edge_cases {
    use super::*;
    use syncfold::model::FileType;

    #[test]
    fn test_empty_folder_publishes_nothing() {
        let remote = Arc::new(MemoryTransferManager::new());
        let mut client = TestClient::new("A", &remote);

        assert!(client.sync.up().unwrap().is_none());
        assert!(remote.is_empty());
    }

    #[test]
    fn test_special_filenames() {
        let remote = Arc::new(MemoryTransferManager::new());
        let mut a = TestClient::new("A", &remote);
        let mut b = TestClient::new("B", &remote);

        let names = [
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file.multiple.dots.txt",
            "UPPERCASE.TXT",
            "unicode_文件.txt",
            "nested/deeper/leaf.md",
        ];
        for (i, name) in names.iter().enumerate() {
            a.write(name, format!("content {}", i).as_bytes(), at(i as i64));
        }
        a.sync.up().unwrap().unwrap();
        b.sync.down().unwrap();

        for (i, name) in names.iter().enumerate() {
            assert_eq!(b.read(name), format!("content {}", i).as_bytes());
        }
    }

    #[test]
    fn test_empty_file_and_folder() {
        let remote = Arc::new(MemoryTransferManager::new());
        let mut a = TestClient::new("A", &remote);
        let mut b = TestClient::new("B", &remote);

        a.write("empty.txt", b"", at(0));
        fs::create_dir_all(a.root.path().join("empty_dir")).unwrap();
        a.sync.up().unwrap().unwrap();
        b.sync.down().unwrap();

        assert_eq!(b.read("empty.txt"), b"");
        assert!(b.root.path().join("empty_dir").is_dir());
        let current = b.sync.database().current_files();
        assert_eq!(current["empty_dir"].file_type, FileType::Folder);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_is_recreated() {
        let remote = Arc::new(MemoryTransferManager::new());
        let mut a = TestClient::new("A", &remote);
        let mut b = TestClient::new("B", &remote);

        a.write("target.txt", b"pointed at", at(0));
        std::os::unix::fs::symlink("target.txt", a.root.path().join("link")).unwrap();
        a.sync.up().unwrap().unwrap();
        b.sync.down().unwrap();

        let link = b.root.path().join("link");
        assert_eq!(fs::read_link(&link).unwrap(), Path::new("target.txt"));
        assert_eq!(fs::read(&link).unwrap(), b"pointed at");
    }

    #[test]
    fn test_restart_keeps_state() {
        let remote = Arc::new(MemoryTransferManager::new());
        let mut a = TestClient::new("A", &remote);
        a.write("notes.txt", b"v1", at(0));
        let first = a.sync.up().unwrap().unwrap();

        let mut a = a.reopen(&remote);
        assert!(a.sync.database().contains_version(&first));
        assert!(a.sync.up().unwrap().is_none());

        a.write("notes.txt", b"v2", at(10));
        let second = a.sync.up().unwrap().unwrap();
        assert_eq!(second.sequence, 2);
    }
}
