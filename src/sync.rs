//! Sync operations of one client
//!
//! A [`Synchronizer`] ties the pieces together for one sync folder:
//!
//! - [`up`](Synchronizer::up) indexes local changes, packs new chunks into
//!   multichunks and publishes them together with a new database version in
//!   one remote transaction.
//! - [`down`](Synchronizer::down) downloads the database versions of other
//!   clients, reconciles them with the local log, writes the resulting file
//!   changes into the sync folder and persists the merged log.
//! - [`restore`](Synchronizer::restore) reassembles any known file version
//!   from its chunks.
//!
//! One sync cycle per repository runs at a time; callers serialize access
//! (the methods take `&mut self`).
//!
//! ## Local layout
//!
//! ```text
//! <work_dir>/outgoing/   containers and database files being uploaded
//! <work_dir>/incoming/   downloaded database files
//! <work_dir>/cache/      downloaded multichunks
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use syncfold::config::SyncConfig;
//! use syncfold::database::LocalDatabaseStore;
//! use syncfold::sync::{build_transfer_stack, Synchronizer};
//! use syncfold::transfer::LocalTransferManager;
//!
//! # fn main() -> syncfold::Result<()> {
//! let config = SyncConfig::builder("A").build()?;
//! let transfer = build_transfer_stack(LocalTransferManager::new("/mnt/repo"), &config)?;
//! let store = LocalDatabaseStore::open("/home/a/.syncfold/db")?;
//! let mut sync = Synchronizer::new(config, "/home/a/Sync", "/home/a/.syncfold/work", transfer, store, None)?;
//!
//! sync.down()?;
//! if let Some(id) = sync.up()? {
//!     println!("published {}", id);
//! }
//! # Ok(())
//! # }
//! ```

use crate::chunker::Chunker;
use crate::config::SyncConfig;
use crate::database::{DatabaseStore, MemoryDatabase};
use crate::deduper::Deduper;
use crate::error::{Result, SyncError};
use crate::indexer::{build_ignore_set, scan, IndexResult, Indexer};
use crate::model::{
    Checksum, DatabaseVersion, DatabaseVersionId, FileHistoryId, FileType, FileVersion,
    MultiChunkId,
};
use crate::multichunk::{MultiChunkReader, MultiChunker};
use crate::reconciler::{conflicted_copy_id, ConflictPolicy, DatabaseReconciler, MergeResult};
use crate::transfer::{
    PathAwareTransferManager, RemoteFile, RemoteFileKind, RemoteTransaction,
    RetriableTransferManager, TransferManager,
};
use crate::transform::{MasterKey, TransformerChain};
use crate::utils;
use globset::GlobSet;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

/// Wrap a backend in the decorators the configuration asks for
///
/// Path sharding (if configured) sits directly on the backend, retries on
/// top, so every sharded call is retried as a whole.
pub fn build_transfer_stack<T: TransferManager + 'static>(
    backend: T,
    config: &SyncConfig,
) -> Result<Box<dyn TransferManager>> {
    let sharded: Box<dyn TransferManager> = match &config.path_aware {
        Some(path_aware) => Box::new(PathAwareTransferManager::new(backend, path_aware.clone())?),
        None => Box::new(backend),
    };
    Ok(Box::new(RetriableTransferManager::with_config(
        sharded,
        config.retry.clone(),
    )))
}

/// Synchronizes one local folder with a remote repository
pub struct Synchronizer<T: TransferManager, S: DatabaseStore> {
    config: SyncConfig,
    root: PathBuf,
    work_dir: PathBuf,
    transfer: T,
    store: S,
    database: MemoryDatabase,
    transformer: TransformerChain,
    deduper: Deduper,
    reconciler: DatabaseReconciler,
    ignore: GlobSet,
}

impl<T: TransferManager, S: DatabaseStore> Synchronizer<T, S> {
    /// Create a synchronizer
    ///
    /// # Arguments
    ///
    /// * `config` - Client configuration, validated here
    /// * `root` - The sync folder
    /// * `work_dir` - Scratch space; skipped by indexing if inside `root`
    /// * `transfer` - Connected transfer stack
    /// * `store` - Local persistence of database versions
    /// * `key` - Master key, required if the transformers encrypt
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the store cannot
    /// be loaded.
    pub fn new(
        config: SyncConfig,
        root: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        transfer: T,
        store: S,
        key: Option<&MasterKey>,
    ) -> Result<Self> {
        config.validate()?;
        let transformer = TransformerChain::from_config(&config.transformers, key)?;
        let deduper = Deduper::new(
            Chunker::from_config(&config.chunker)?,
            MultiChunker::from_config(&config.multi_chunker)?,
            transformer.clone(),
        );
        let ignore = build_ignore_set(&config.ignore_patterns)?;
        let database = MemoryDatabase::load(&store)?;

        let root = root.into();
        let work_dir = work_dir.into();
        fs::create_dir_all(&root)?;
        fs::create_dir_all(&work_dir)?;

        info!(
            "Opened sync folder {} for client {} at clock {}",
            root.display(),
            config.client_id,
            database.clock()
        );
        Ok(Self {
            config,
            root,
            work_dir,
            transfer,
            store,
            database,
            transformer,
            deduper,
            reconciler: DatabaseReconciler::new(),
            ignore,
        })
    }

    /// Replace the conflict policy used by [`down`](Self::down)
    pub fn with_conflict_policy(mut self, policy: impl ConflictPolicy + 'static) -> Self {
        self.reconciler = DatabaseReconciler::with_policy(policy);
        self
    }

    /// This client's id
    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    /// The sync folder
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current local database view
    pub fn database(&self) -> &MemoryDatabase {
        &self.database
    }

    /// The transfer stack
    pub fn transfer(&self) -> &T {
        &self.transfer
    }

    /// Publish local changes
    ///
    /// Returns the id of the new database version, or `None` if nothing
    /// changed.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SyncAborted`] wrapping the first failure. The
    /// remote is left as it was and the version is discarded.
    pub fn up(&mut self) -> Result<Option<DatabaseVersionId>> {
        self.up_inner().map_err(|e| SyncError::aborted("up", e))
    }

    fn up_inner(&mut self) -> Result<Option<DatabaseVersionId>> {
        let client = self.config.client_id.clone();
        RemoteTransaction::cleanup_stale(&self.transfer, &client)?;

        let outgoing = self.work_dir.join("outgoing");
        fs::create_dir_all(&outgoing)?;
        utils::clear_dir(&outgoing)?;

        let entries = scan(&self.root, &self.ignore, Some(&self.work_dir))?;
        let clock = self.database.next_clock(&client);
        let indexed = Indexer::new(&self.database, &outgoing).index(&client, clock, &entries, &self.deduper);

        let outcome = indexed.and_then(|result| self.publish(result, &outgoing));
        if let Err(e) = utils::clear_dir(&outgoing) {
            warn!("Could not clean {}: {}", outgoing.display(), e);
        }
        outcome
    }

    fn publish(&mut self, indexed: IndexResult, outgoing: &Path) -> Result<Option<DatabaseVersionId>> {
        let Some(version) = indexed.version else {
            return Ok(None);
        };
        let id = version.id();

        let database_remote = RemoteFile::database(&id);
        let database_local = outgoing.join(database_remote.name());
        let encoded = self.encode_version(&version)?;
        fs::write(&database_local, encoded)?;

        let mut transaction = RemoteTransaction::new(&self.transfer, id.client.as_str());
        for (multi_chunk_id, path) in &indexed.multi_chunk_files {
            transaction.add_upload(path, RemoteFile::multi_chunk(multi_chunk_id));
        }
        transaction.add_upload(&database_local, database_remote);
        transaction.commit()?;

        self.store.append(&version)?;
        self.database.add_database_version(version)?;
        info!(
            "Published {} with {} multichunks, clock {}",
            id,
            indexed.multi_chunk_files.len(),
            self.database.clock()
        );
        Ok(Some(id))
    }

    /// Fetch and apply changes of other clients
    ///
    /// Remote versions are reconciled with the local log. Winning file
    /// states are written into the sync folder, and conflicted copies of
    /// this client's losing edits are created next to them. The merged log
    /// is persisted only after the folder was updated, so a failed run can
    /// simply be repeated.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SyncAborted`] wrapping the first failure.
    pub fn down(&mut self) -> Result<MergeResult> {
        self.down_inner().map_err(|e| SyncError::aborted("down", e))
    }

    fn down_inner(&mut self) -> Result<MergeResult> {
        let client = self.config.client_id.clone();
        let incoming = self.work_dir.join("incoming");
        fs::create_dir_all(&incoming)?;

        let mut logs: BTreeMap<String, Vec<DatabaseVersion>> = BTreeMap::new();
        let mut corrupt: BTreeMap<String, String> = BTreeMap::new();

        for (name, remote) in self.transfer.list(RemoteFileKind::Database)? {
            let Some(id) = remote.database_id() else {
                continue;
            };
            if id.client == client || self.database.contains_version(&id) {
                continue;
            }

            let local = incoming.join(&name);
            self.transfer.download(&remote, &local)?;
            let decoded = fs::read(&local)
                .map_err(SyncError::from)
                .and_then(|bytes| self.decode_version(&bytes));
            fs::remove_file(&local)?;

            match decoded {
                Ok(version) if version.id() == id => {
                    trace!("Downloaded {}", id);
                    logs.entry(id.client.clone()).or_default().push(version);
                }
                Ok(version) => {
                    warn!("Remote file {} contains version {}", name, version.id());
                    corrupt.insert(id.client, format!("{} holds version {}", name, version.id()));
                }
                Err(e) if e.is_corruption() || matches!(e, SyncError::Bincode(_) | SyncError::Transform(_)) => {
                    warn!("Cannot decode {}: {}", name, e);
                    corrupt.insert(id.client, format!("{} is unreadable: {}", name, e));
                }
                Err(e) => return Err(e),
            }
        }

        let mut merge = self.reconciler.reconcile(&client, self.database.versions(), &logs);
        for (bad_client, reason) in corrupt {
            merge.quarantined.entry(bad_client).or_insert(reason);
        }
        if merge.is_unchanged() {
            debug!("No new remote versions");
            return Ok(merge);
        }

        let mut view = MemoryDatabase::from_parts(Vec::new(), self.database.superseded().clone());
        view.apply_merge(&merge);

        self.materialize(&merge, &view)?;

        for version in merge.merged_history.iter().filter(|v| merge.accepted.contains(&v.id())) {
            self.store.append(version)?;
        }
        self.store.save_superseded(view.superseded())?;
        self.database = view;

        info!(
            "Merged {} remote versions ({} conflicts), clock {}",
            merge.accepted.len(),
            merge.conflicts.len(),
            self.database.clock()
        );
        Ok(merge)
    }

    /// Write the merge outcome into the sync folder
    fn materialize(&self, merge: &MergeResult, view: &MemoryDatabase) -> Result<()> {
        let client = self.config.client_id.as_str();

        // Preserve this client's losing edits before they are overwritten
        for conflict in &merge.conflicts {
            for loser in conflict.losers.iter().filter(|l| l.client == client) {
                let copy_id = conflicted_copy_id(&conflict.history, loser);
                let copy = merge
                    .conflicted_copies
                    .iter()
                    .find(|c| c.id == copy_id)
                    .and_then(|c| c.last_version());
                if let Some(copy) = copy {
                    info!("Keeping conflicted copy {}", copy.path);
                    self.restore_from(view, copy, &self.root.join(&copy.path))?;
                }
            }
        }

        let mut removals: Vec<(&FileHistoryId, &FileVersion)> = Vec::new();
        let mut writes: Vec<&FileVersion> = Vec::new();
        for (history, winner) in &merge.winning_versions {
            let previous = self
                .database
                .file_history(history)
                .and_then(|h| h.last_version());
            if previous == Some(winner) {
                continue;
            }
            if let Some(previous) = previous.filter(|p| !p.is_deleted()) {
                if winner.is_deleted() || previous.path != winner.path {
                    removals.push((history, previous));
                }
            }
            if !winner.is_deleted() {
                writes.push(winner);
            }
        }

        // Children before parents
        removals.sort_by(|a, b| b.1.path.cmp(&a.1.path));
        for (history, previous) in removals {
            let path = self.root.join(&previous.path);
            if self.has_local_changes(&path, Some(previous)) {
                warn!("Not removing {}: changed locally", previous.path);
                continue;
            }
            trace!("Removing {} ({})", previous.path, history);
            utils::remove_entry(&path)?;
        }

        // Parents before children
        writes.sort_by(|a, b| a.path.cmp(&b.path));
        for winner in writes {
            let path = self.root.join(&winner.path);
            let known = self
                .database
                .history_by_path(&winner.path)
                .and_then(|h| h.last_version());
            if self.has_local_changes(&path, known) {
                warn!("Not overwriting {}: changed locally", winner.path);
                continue;
            }
            self.restore_from(view, winner, &path)?;
        }
        Ok(())
    }

    /// True if the file at `path` differs from what the database knows
    fn has_local_changes(&self, path: &Path, known: Option<&FileVersion>) -> bool {
        let Ok(metadata) = fs::symlink_metadata(path) else {
            return false;
        };
        let Some(known) = known else {
            return metadata.is_file();
        };
        if known.file_type != FileType::File || !metadata.is_file() {
            return false;
        }
        let modified = metadata.modified().ok().map(chrono::DateTime::<chrono::Utc>::from);
        metadata.len() != known.size || modified != Some(known.last_modified)
    }

    /// Reassemble a file version at `target`
    ///
    /// Folders are created, symlinks recreated, and regular files rebuilt
    /// from their chunks. Missing multichunks are downloaded first. The
    /// content checksum is verified before the file is atomically moved into
    /// place.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ChunkNotFound`] if the database does not know
    /// where a chunk is stored, [`SyncError::HashMismatch`] if the assembled
    /// content does not match, and storage errors from downloading.
    pub fn restore(&self, version: &FileVersion, target: &Path) -> Result<()> {
        self.restore_from(&self.database, version, target)
    }

    fn restore_from(&self, view: &MemoryDatabase, version: &FileVersion, target: &Path) -> Result<()> {
        replace_other_type(target, version.file_type)?;
        match version.file_type {
            FileType::Folder => {
                fs::create_dir_all(target)?;
                if let Some(mode) = version.permissions {
                    utils::set_permissions(target, mode)?;
                }
            }
            FileType::Symlink => {
                let link_target = version.link_target.as_deref().ok_or_else(|| {
                    SyncError::InvalidDatabaseVersion(format!("symlink {} without target", version.path))
                })?;
                utils::remove_entry(target)?;
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                utils::create_symlink(Path::new(link_target), target)?;
            }
            FileType::File => self.restore_file(view, version, target)?,
        }
        debug!("Restored {} to {}", version.path, target.display());
        Ok(())
    }

    fn restore_file(&self, view: &MemoryDatabase, version: &FileVersion, target: &Path) -> Result<()> {
        let checksum = version
            .checksum
            .ok_or_else(|| SyncError::InvalidDatabaseVersion(format!("file {} without content", version.path)))?;
        let content = view
            .file_content(&checksum)
            .ok_or_else(|| SyncError::ChunkNotFound(format!("content {}", checksum.to_hex())))?;
        content.verify()?;

        let mut containers: BTreeMap<MultiChunkId, BTreeSet<Checksum>> = BTreeMap::new();
        for chunk in &content.chunks {
            let entry = view
                .multi_chunk_for_chunk(chunk)
                .ok_or_else(|| SyncError::ChunkNotFound(chunk.to_hex()))?;
            containers.entry(entry.id).or_default().insert(*chunk);
        }

        let mut data: HashMap<Checksum, Vec<u8>> = HashMap::new();
        for (id, wanted) in &containers {
            let path = self.fetch_multi_chunk(id)?;
            if let Err(e) = self.read_chunks(&path, wanted, &mut data) {
                warn!("Evicting unreadable multichunk {}: {}", id.short(), e);
                if let Err(remove) = fs::remove_file(&path) {
                    warn!("Could not remove {}: {}", path.display(), remove);
                }
                return Err(e);
            }
        }

        utils::write_atomic(target, |file| {
            let mut written = 0u64;
            for checksum in &content.chunks {
                let bytes = data
                    .get(checksum)
                    .ok_or_else(|| SyncError::ChunkNotFound(checksum.to_hex()))?;
                file.write_all(bytes)?;
                written += bytes.len() as u64;
            }
            if written != content.size {
                return Err(SyncError::HashMismatch {
                    expected: format!("{} bytes", content.size),
                    actual: format!("{} bytes", written),
                });
            }
            Ok(())
        })?;

        if let Some(mode) = version.permissions {
            utils::set_permissions(target, mode)?;
        }
        utils::set_modified(target, version.last_modified)?;
        Ok(())
    }

    fn read_chunks(
        &self,
        path: &Path,
        wanted: &BTreeSet<Checksum>,
        data: &mut HashMap<Checksum, Vec<u8>>,
    ) -> Result<()> {
        for chunk in MultiChunkReader::open(path, &self.transformer)? {
            let chunk = chunk?;
            if wanted.contains(&chunk.checksum) {
                data.insert(chunk.checksum, chunk.data);
            }
        }
        Ok(())
    }

    /// Local path of a multichunk, downloading it if not cached
    fn fetch_multi_chunk(&self, id: &MultiChunkId) -> Result<PathBuf> {
        let remote = RemoteFile::multi_chunk(id);
        let cache = self.work_dir.join("cache");
        fs::create_dir_all(&cache)?;
        let path = cache.join(remote.name());
        if !path.exists() {
            let partial = cache.join(format!("{}.part", remote.name()));
            self.transfer.download(&remote, &partial)?;
            fs::rename(&partial, &path)?;
            trace!("Cached {}", remote.name());
        }
        Ok(path)
    }

    /// Drop downloaded multichunks
    pub fn clear_cache(&self) -> Result<()> {
        utils::clear_dir(&self.work_dir.join("cache"))
    }

    fn encode_version(&self, version: &DatabaseVersion) -> Result<Vec<u8>> {
        let plain = bincode::serde::encode_to_vec(version, bincode::config::standard())?;
        self.transformer.encode(&plain)
    }

    fn decode_version(&self, bytes: &[u8]) -> Result<DatabaseVersion> {
        let plain = self.transformer.decode(bytes)?;
        let (version, _) = bincode::serde::decode_from_slice(&plain, bincode::config::standard())?;
        Ok(version)
    }
}

/// Remove whatever sits at `target` if it is not of the wanted type
fn replace_other_type(target: &Path, wanted: FileType) -> Result<()> {
    let Ok(metadata) = fs::symlink_metadata(target) else {
        return Ok(());
    };
    let existing = if metadata.file_type().is_symlink() {
        FileType::Symlink
    } else if metadata.is_dir() {
        FileType::Folder
    } else {
        FileType::File
    };
    if existing != wanted {
        debug!("Replacing {:?} at {} with {:?}", existing, target.display(), wanted);
        utils::remove_entry(target)?;
    }
    Ok(())
}
