//! Integration tests for Syncfold
//!
//! Multi-client scenarios over a shared repository: adoption of remote
//! changes, concurrent edits, renames and deletions, deduplication across
//! files and the on-disk backends.

use super::{at, random_bytes, TestClient};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use syncfold::chunker::Chunker;
use syncfold::config::{PathAwareConfig, SyncConfig};
use syncfold::deduper::{Deduper, DeduperListener};
use syncfold::model::{Checksum, FileType, MultiChunkId};
use syncfold::multichunk::{MultiChunker, SealedMultiChunk};
use syncfold::sync::build_transfer_stack;
use syncfold::transfer::{
    LocalTransferManager, MemoryTransferManager, RemoteFile, RemoteFileKind, TransferManager,
};
use syncfold::{Chunk, ClockOrdering, TransformerChain};
use tempfile::TempDir;

#[test]
fn test_clean_adoption_by_empty_client() {
    let remote = Arc::new(MemoryTransferManager::new());
    let mut a = TestClient::new("A", &remote);
    let mut b = TestClient::new("B", &remote);

    let content = random_bytes(1, 20 * 1024);
    a.write("docs/report.bin", &content, at(0));
    let id = a.sync.up().unwrap().unwrap();
    assert_eq!(id.client, "A");
    assert_eq!(id.sequence, 1);
    assert_eq!(remote.names(RemoteFileKind::Database), vec!["database-A-0000000001"]);
    let published = &a.sync.database().versions()[0];
    assert_eq!(published.chunks.len(), 20);
    assert_eq!(
        remote.names(RemoteFileKind::MultiChunk).len(),
        published.multi_chunks.len()
    );

    let merge = b.sync.down().unwrap();
    assert_eq!(merge.accepted, vec![id.clone()]);
    assert!(merge.conflicts.is_empty());
    assert_eq!(merge.merged_clock.to_string(), "(A1)");

    assert_eq!(b.read("docs/report.bin"), content);
    assert_eq!(b.sync.database().clock().get("A"), 1);
    assert!(b.sync.database().contains_version(&id));

    // Restored files match their recorded state, so nothing is republished
    assert!(b.sync.up().unwrap().is_none());
    assert_eq!(remote.names(RemoteFileKind::Database).len(), 1);
}

#[test]
fn test_down_is_idempotent() {
    let remote = Arc::new(MemoryTransferManager::new());
    let mut a = TestClient::new("A", &remote);
    let mut b = TestClient::new("B", &remote);

    a.write("a.txt", b"alpha", at(0));
    a.sync.up().unwrap().unwrap();

    b.sync.down().unwrap();
    let again = b.sync.down().unwrap();
    assert!(again.accepted.is_empty());
    assert!(again.is_unchanged());
    assert_eq!(b.read("a.txt"), b"alpha");
}

#[test]
fn test_concurrent_edits_produce_one_winner_and_one_conflicted_copy() {
    let remote = Arc::new(MemoryTransferManager::new());
    let mut a = TestClient::new("A", &remote);
    let mut b = TestClient::new("B", &remote);

    a.write("plan.txt", b"original", at(0));
    a.sync.up().unwrap().unwrap();
    b.sync.down().unwrap();

    // Both edit without seeing each other; B's edit is newer
    a.write("plan.txt", b"edited by A", at(100));
    b.write("plan.txt", b"edited by B!", at(200));
    let a2 = a.sync.up().unwrap().unwrap();
    let b1 = b.sync.up().unwrap().unwrap();
    let clock_of = |client: &TestClient| {
        client.sync.database().versions().last().unwrap().vector_clock().clone()
    };
    assert_eq!(clock_of(&a).compare(&clock_of(&b)), ClockOrdering::Simultaneous);

    let merge_a = a.sync.down().unwrap();
    assert_eq!(merge_a.conflicts.len(), 1);
    let conflict = &merge_a.conflicts[0];
    assert_eq!(conflict.winner, b1);
    assert_eq!(conflict.losers, vec![a2.clone()]);
    assert_eq!(merge_a.conflicted_copies.len(), 1);

    let merge_b = b.sync.down().unwrap();
    assert_eq!(merge_b.conflicts.len(), 1);
    assert_eq!(merge_b.conflicts[0].winner, b1);

    // Winner everywhere, the loser keeps its edit as a conflicted copy
    assert_eq!(a.read("plan.txt"), b"edited by B!");
    assert_eq!(b.read("plan.txt"), b"edited by B!");
    let copies: Vec<String> = a
        .files()
        .into_iter()
        .filter(|f| f.contains("conflicted copy"))
        .collect();
    assert_eq!(copies.len(), 1);
    assert!(copies[0].starts_with("plan (A's conflicted copy, "));
    assert!(copies[0].ends_with(").txt"));
    assert_eq!(a.read(&copies[0]), b"edited by A");
    assert_eq!(b.files(), vec!["plan.txt".to_string()]);

    // The copy reaches B with A's next sync-up
    a.sync.up().unwrap().unwrap();
    b.sync.down().unwrap();
    assert_eq!(b.read(&copies[0]), b"edited by A");
}

#[test]
fn test_conflict_resolution_agrees_regardless_of_order() {
    let remote = Arc::new(MemoryTransferManager::new());
    let mut a = TestClient::new("A", &remote);
    let mut b = TestClient::new("B", &remote);
    let mut c = TestClient::new("C", &remote);

    a.write("shared.txt", b"base", at(0));
    a.sync.up().unwrap().unwrap();
    b.sync.down().unwrap();
    c.sync.down().unwrap();

    // Same modification time: the smaller client id wins
    b.write("shared.txt", b"from B", at(50));
    c.write("shared.txt", b"from C", at(50));
    c.sync.up().unwrap().unwrap();
    b.sync.up().unwrap().unwrap();

    let merge_a = a.sync.down().unwrap();
    let merge_b = b.sync.down().unwrap();
    let merge_c = c.sync.down().unwrap();

    for merge in [&merge_a, &merge_b, &merge_c] {
        assert_eq!(merge.conflicts.len(), 1);
        assert_eq!(merge.conflicts[0].winner.client, "B");
    }
    assert_eq!(a.read("shared.txt"), b"from B");
    assert_eq!(b.read("shared.txt"), b"from B");
    assert_eq!(c.read("shared.txt"), b"from B");
    assert!(c.files().iter().any(|f| f.starts_with("shared (C's conflicted copy")));
    assert!(!a.files().iter().any(|f| f.contains("conflicted copy")));
}

#[test]
fn test_rename_and_delete_propagate() {
    let remote = Arc::new(MemoryTransferManager::new());
    let mut a = TestClient::new("A", &remote);
    let mut b = TestClient::new("B", &remote);

    a.write("old/name.txt", b"moving content", at(0));
    a.write("doomed.txt", b"bye", at(0));
    a.sync.up().unwrap().unwrap();
    b.sync.down().unwrap();

    fs::create_dir_all(a.root.path().join("new")).unwrap();
    fs::rename(
        a.root.path().join("old/name.txt"),
        a.root.path().join("new/name.txt"),
    )
    .unwrap();
    fs::remove_dir(a.root.path().join("old")).unwrap();
    fs::remove_file(a.root.path().join("doomed.txt")).unwrap();
    a.sync.up().unwrap().unwrap();

    // A rename keeps the history, so no new content is uploaded
    assert_eq!(remote.names(RemoteFileKind::MultiChunk).len(), 1);

    b.sync.down().unwrap();
    assert_eq!(b.read("new/name.txt"), b"moving content");
    assert!(!b.exists("old/name.txt"));
    assert!(!b.exists("old"));
    assert!(!b.exists("doomed.txt"));

    let current = b.sync.database().current_files();
    assert!(current.contains_key("new/name.txt"));
    assert!(!current.contains_key("doomed.txt"));
}

#[test]
fn test_local_edit_is_not_overwritten_by_down() {
    let remote = Arc::new(MemoryTransferManager::new());
    let mut a = TestClient::new("A", &remote);
    let mut b = TestClient::new("B", &remote);

    a.write("todo.txt", b"v1", at(0));
    a.sync.up().unwrap().unwrap();
    b.sync.down().unwrap();

    a.write("todo.txt", b"v2 from A", at(10));
    a.sync.up().unwrap().unwrap();

    // B edits but has not indexed yet
    b.write("todo.txt", b"unsaved B edit", at(20));
    b.sync.down().unwrap();
    assert_eq!(b.read("todo.txt"), b"unsaved B edit");
}

#[test]
fn test_restore_older_version() -> anyhow::Result<()> {
    let remote = Arc::new(MemoryTransferManager::new());
    let mut a = TestClient::new("A", &remote);

    a.write("essay.txt", b"first draft", at(0));
    a.sync.up()?;
    a.write("essay.txt", b"second draft, longer", at(60));
    a.sync.up()?;

    let history = a
        .sync
        .database()
        .history_by_path("essay.txt")
        .ok_or_else(|| anyhow::anyhow!("essay.txt is not tracked"))?;
    assert_eq!(history.versions.len(), 2);
    let first = history.versions[0].clone();

    let out = TempDir::new()?;
    let target = out.path().join("restored.txt");
    a.sync.restore(&first, &target)?;
    assert_eq!(fs::read(&target)?, b"first draft");
    let modified: chrono::DateTime<chrono::Utc> = fs::metadata(&target)?.modified()?.into();
    assert_eq!(modified, at(0));
    Ok(())
}

#[test]
fn test_identical_files_share_chunks() {
    let remote = Arc::new(MemoryTransferManager::new());
    let mut a = TestClient::new("A", &remote);

    let content = random_bytes(7, 8 * 1024);
    a.write("one.bin", &content, at(0));
    a.write("two.bin", &content, at(0));
    a.write("copy/three.bin", &content, at(0));
    a.sync.up().unwrap().unwrap();

    let db = a.sync.database();
    let checksums: Vec<_> = ["one.bin", "two.bin", "copy/three.bin"]
        .iter()
        .map(|p| db.history_by_path(p).unwrap().last_version().unwrap().checksum)
        .collect();
    assert!(checksums.windows(2).all(|w| w[0] == w[1]));
    // 8 KiB at 1 KiB fixed chunks, stored once
    let content = db.file_content(&checksums[0].unwrap()).unwrap();
    assert_eq!(content.chunks.len(), 8);
    assert_eq!(db.versions()[0].chunks.len(), 8);
}

#[test]
fn test_folder_type_change() {
    let remote = Arc::new(MemoryTransferManager::new());
    let mut a = TestClient::new("A", &remote);
    let mut b = TestClient::new("B", &remote);

    fs::create_dir_all(a.root.path().join("thing")).unwrap();
    a.sync.up().unwrap().unwrap();
    b.sync.down().unwrap();
    assert!(b.root.path().join("thing").is_dir());

    fs::remove_dir(a.root.path().join("thing")).unwrap();
    a.write("thing", b"now a file", at(5));
    a.sync.up().unwrap().unwrap();
    b.sync.down().unwrap();

    assert_eq!(b.read("thing"), b"now a file");
    let current = b.sync.database().current_files();
    assert_eq!(current["thing"].file_type, FileType::File);
}

/// Collects containers and file contents of one deduplication run
#[derive(Default)]
struct CollectingListener {
    work_dir: PathBuf,
    seen: std::collections::HashSet<Checksum>,
    sealed: Vec<SealedMultiChunk>,
    files: BTreeMap<PathBuf, Vec<Checksum>>,
    current: Vec<Checksum>,
}

impl DeduperListener for CollectingListener {
    fn on_file_start(&mut self, _file: &std::path::Path) -> syncfold::Result<()> {
        self.current.clear();
        Ok(())
    }

    fn on_chunk(&mut self, chunk: &Chunk) -> bool {
        self.seen.insert(chunk.checksum)
    }

    fn multi_chunk_target(&mut self, id: &MultiChunkId) -> syncfold::Result<PathBuf> {
        Ok(self.work_dir.join(format!("multichunk-{}", id)))
    }

    fn on_close_multi_chunk(&mut self, sealed: SealedMultiChunk) -> syncfold::Result<()> {
        self.sealed.push(sealed);
        Ok(())
    }

    fn on_file_add_chunk(&mut self, _file: &std::path::Path, chunk: &Chunk) {
        self.current.push(chunk.checksum);
    }

    fn on_file_end(&mut self, file: &std::path::Path, _last: Option<Checksum>) -> syncfold::Result<()> {
        self.files.insert(file.to_path_buf(), std::mem::take(&mut self.current));
        Ok(())
    }
}

#[test]
fn test_deduplication_is_idempotent() {
    let source = TempDir::new().unwrap();
    let work = TempDir::new().unwrap();
    let mut files = Vec::new();
    for i in 0..4u64 {
        let path = source.path().join(format!("f{}", i));
        let mut data = random_bytes(100, 10_000);
        data.extend(random_bytes(i, 3_000));
        fs::write(&path, data).unwrap();
        files.push(path);
    }

    let deduper = Deduper::new(Chunker::fixed(1000), MultiChunker::new(8 * 1024), TransformerChain::plain());
    let mut listener = CollectingListener {
        work_dir: work.path().to_path_buf(),
        ..Default::default()
    };
    let first = deduper.deduplicate(&files, &mut listener).unwrap();
    assert_eq!(first.files, 4);
    // 10 shared chunks plus 3 unique ones per file
    assert_eq!(first.new_chunks, 10 + 4 * 3);

    let stored: usize = listener.sealed.iter().map(|s| s.chunks.len()).sum();
    assert_eq!(stored, first.new_chunks);
    for sealed in &listener.sealed {
        assert!(sealed.packed_size <= 8 * 1024);
    }

    // A second pass over the same files finds nothing new
    let files_before = listener.files.clone();
    let second = deduper.deduplicate(&files, &mut listener).unwrap();
    assert_eq!(second.new_chunks, 0);
    assert_eq!(second.multi_chunks, 0);
    assert_eq!(listener.files, files_before);
}

#[test]
fn test_sync_through_local_backend_with_sharding() {
    let repo = TempDir::new().unwrap();
    let shard = PathAwareConfig {
        affected: vec![RemoteFileKind::MultiChunk],
        subfolder_depth: 2,
        bytes_per_folder: 2,
        folder_separator: '/',
    };
    let config = |client: &str| {
        SyncConfig::builder(client)
            .path_aware(shard.clone())
            .retry(2, Duration::ZERO)
            .build()
            .unwrap()
    };

    let stack = build_transfer_stack(LocalTransferManager::new(repo.path()), &config("A")).unwrap();
    stack.init(true).unwrap();
    let status = stack.test(false);
    assert!(status.target_exists && status.target_can_write);
    assert!(!status.repo_file_exists);

    let a_root = TempDir::new().unwrap();
    let a_work = TempDir::new().unwrap();
    let a_db = TempDir::new().unwrap();
    let mut a = syncfold::Synchronizer::new(
        config("A"),
        a_root.path(),
        a_work.path(),
        stack,
        syncfold::LocalDatabaseStore::open(a_db.path()).unwrap(),
        None,
    )
    .unwrap();

    let content = random_bytes(3, 40_000);
    fs::write(a_root.path().join("big.bin"), &content).unwrap();
    a.up().unwrap().unwrap();

    // Containers live in hashed sub-folders, databases stay flat
    let multichunks: Vec<_> = walkdir::WalkDir::new(repo.path().join("multichunks"))
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .collect();
    assert!(!multichunks.is_empty());
    for entry in &multichunks {
        let relative = entry.path().strip_prefix(repo.path().join("multichunks")).unwrap();
        assert_eq!(relative.components().count(), 3);
    }
    assert!(repo.path().join("databases/database-A-0000000001").is_file());
    assert!(fs::read_dir(repo.path().join("transactions")).unwrap().next().is_none());

    let b_root = TempDir::new().unwrap();
    let b_work = TempDir::new().unwrap();
    let b_db = TempDir::new().unwrap();
    let b_stack = build_transfer_stack(LocalTransferManager::new(repo.path()), &config("B")).unwrap();
    let listed = b_stack.list(RemoteFileKind::MultiChunk).unwrap();
    assert_eq!(listed.len(), multichunks.len());
    assert!(listed.values().all(|f: &RemoteFile| f.sub_path().is_some()));

    let mut b = syncfold::Synchronizer::new(
        config("B"),
        b_root.path(),
        b_work.path(),
        b_stack,
        syncfold::LocalDatabaseStore::open(b_db.path()).unwrap(),
        None,
    )
    .unwrap();
    b.down().unwrap();
    assert_eq!(fs::read(b_root.path().join("big.bin")).unwrap(), content);
}
