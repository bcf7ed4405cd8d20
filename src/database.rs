//! Local metadata database
//!
//! [`MemoryDatabase`] is the in-memory view a client derives from every
//! [`DatabaseVersion`] it knows: indexes over chunks, containers and file
//! contents, the current state of each file history, a path lookup and the
//! merged vector clock.
//!
//! The view is a pure function of two inputs: the set of known versions and
//! the set of *superseded deltas*, history deltas that lost a conflict and
//! must not be applied. Versions are applied in causal order
//! ([`DatabaseVersion::causal_key`]), so rebuilding from a store always
//! yields the same state.
//!
//! [`DatabaseStore`] is the persistence seam. [`LocalDatabaseStore`] keeps one
//! bincode file per version in a directory and writes every file through a
//! temporary file that is atomically renamed into place.

use crate::error::{Result, SyncError};
use crate::model::{
    Checksum, ChunkEntry, DatabaseVersion, DatabaseVersionId, FileContent, FileHistory,
    FileHistoryId, FileVersion, MultiChunkEntry, MultiChunkId,
};
use crate::reconciler::MergeResult;
use crate::vector_clock::VectorClock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// A history delta excluded from the view: (owning version, history)
pub type SupersededDelta = (DatabaseVersionId, FileHistoryId);

/// In-memory view over all known database versions
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    versions: Vec<DatabaseVersion>,
    version_ids: BTreeSet<DatabaseVersionId>,
    superseded: BTreeSet<SupersededDelta>,
    chunks: HashMap<Checksum, ChunkEntry>,
    multi_chunks: HashMap<MultiChunkId, MultiChunkEntry>,
    chunk_locations: HashMap<Checksum, MultiChunkId>,
    contents: HashMap<Checksum, FileContent>,
    histories: BTreeMap<FileHistoryId, FileHistory>,
    paths: HashMap<String, FileHistoryId>,
    clock: VectorClock,
}

impl MemoryDatabase {
    /// Create an empty database
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the view from stored versions and superseded deltas
    pub fn from_parts(
        versions: Vec<DatabaseVersion>,
        superseded: BTreeSet<SupersededDelta>,
    ) -> Self {
        let mut db = Self {
            versions,
            superseded,
            ..Default::default()
        };
        db.rebuild();
        db
    }

    /// Load the view from a store
    pub fn load(store: &dyn DatabaseStore) -> Result<Self> {
        let db = Self::from_parts(store.load_all()?, store.load_superseded()?);
        debug!("Loaded database with {} versions, clock {}", db.versions.len(), db.clock);
        Ok(db)
    }

    /// Append a locally created version
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidDatabaseVersion`] if the version is
    /// already known, fails validation, or does not extend the local clock.
    pub fn add_database_version(&mut self, version: DatabaseVersion) -> Result<()> {
        version.validate()?;
        let id = version.id();
        if self.version_ids.contains(&id) {
            return Err(SyncError::InvalidDatabaseVersion(format!(
                "version {} is already known",
                id
            )));
        }
        if version.vector_clock().compare(&self.clock) != crate::vector_clock::ClockOrdering::After {
            return Err(SyncError::InvalidDatabaseVersion(format!(
                "version {} with clock {} does not follow local clock {}",
                id,
                version.vector_clock(),
                self.clock
            )));
        }

        // Strictly after everything known, so applying it last keeps the
        // causal order
        self.apply(&version);
        self.version_ids.insert(id);
        self.versions.push(version);
        Ok(())
    }

    /// Replace the view with the outcome of a reconciliation
    ///
    /// Superseded deltas of every history the merge resolved are replaced
    /// by the recomputed set; those of other histories are kept.
    pub fn apply_merge(&mut self, merge: &MergeResult) {
        self.versions = merge.merged_history.clone();
        self.superseded
            .retain(|(_, history)| !merge.resolved_histories.contains(history));
        self.superseded.extend(merge.losing_deltas.iter().cloned());
        self.rebuild();
        info!(
            "Applied merge: {} versions known, clock {}",
            self.versions.len(),
            self.clock
        );
    }

    fn rebuild(&mut self) {
        let versions = std::mem::take(&mut self.versions);
        let superseded = std::mem::take(&mut self.superseded);
        *self = Self {
            superseded,
            ..Default::default()
        };

        let mut versions = versions;
        versions.sort_by_key(|v| v.causal_key());
        versions.dedup_by_key(|v| v.id());
        for version in &versions {
            self.apply(version);
            self.version_ids.insert(version.id());
        }
        self.versions = versions;
    }

    fn apply(&mut self, version: &DatabaseVersion) {
        let id = version.id();
        self.clock = self.clock.merge(version.vector_clock());

        for chunk in &version.chunks {
            self.chunks.insert(chunk.checksum, *chunk);
        }
        for multi_chunk in &version.multi_chunks {
            for chunk in &multi_chunk.chunks {
                self.chunk_locations.insert(*chunk, multi_chunk.id);
            }
            self.multi_chunks.insert(multi_chunk.id, multi_chunk.clone());
        }
        for content in &version.file_contents {
            self.contents.insert(content.checksum, content.clone());
        }

        for delta in &version.file_histories {
            if self.superseded.contains(&(id.clone(), delta.id.clone())) {
                debug!("Skipping superseded delta of history {} in {}", delta.id, id);
                continue;
            }
            if let Err(e) = self.apply_delta(delta) {
                warn!("Ignoring delta of history {} in {}: {}", delta.id, id, e);
            }
        }
    }

    fn apply_delta(&mut self, delta: &FileHistory) -> Result<()> {
        let previous_path = self
            .histories
            .get(&delta.id)
            .and_then(|h| h.last_version())
            .map(|v| v.path.clone());

        let mut history = self
            .histories
            .get(&delta.id)
            .cloned()
            .unwrap_or_else(|| FileHistory::new(delta.id.clone()));
        for version in &delta.versions {
            history.put_version(version.clone())?;
        }

        if let Some(previous) = previous_path {
            if self.paths.get(&previous) == Some(&delta.id) {
                self.paths.remove(&previous);
            }
        }
        if let Some(last) = history.last_version() {
            if !last.is_deleted() {
                self.paths.insert(last.path.clone(), delta.id.clone());
            }
        }
        self.histories.insert(delta.id.clone(), history);
        Ok(())
    }

    /// All known versions in causal order
    pub fn versions(&self) -> &[DatabaseVersion] {
        &self.versions
    }

    /// True if a version with this id is known
    pub fn contains_version(&self, id: &DatabaseVersionId) -> bool {
        self.version_ids.contains(id)
    }

    /// Superseded history deltas
    pub fn superseded(&self) -> &BTreeSet<SupersededDelta> {
        &self.superseded
    }

    /// Merge of all known clocks
    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    /// Clock for the next local commit of `client`
    pub fn next_clock(&self, client: &str) -> VectorClock {
        self.clock.increment(client)
    }

    /// Chunk entry by checksum
    pub fn chunk(&self, checksum: &Checksum) -> Option<&ChunkEntry> {
        self.chunks.get(checksum)
    }

    /// True if the chunk is stored in some container
    pub fn contains_chunk(&self, checksum: &Checksum) -> bool {
        self.chunks.contains_key(checksum)
    }

    /// Container holding the given chunk
    pub fn multi_chunk_for_chunk(&self, checksum: &Checksum) -> Option<&MultiChunkEntry> {
        self.chunk_locations
            .get(checksum)
            .and_then(|id| self.multi_chunks.get(id))
    }

    /// Container entry by id
    pub fn multi_chunk(&self, id: &MultiChunkId) -> Option<&MultiChunkEntry> {
        self.multi_chunks.get(id)
    }

    /// File content by checksum
    pub fn file_content(&self, checksum: &Checksum) -> Option<&FileContent> {
        self.contents.get(checksum)
    }

    /// File history by id
    pub fn file_history(&self, id: &FileHistoryId) -> Option<&FileHistory> {
        self.histories.get(id)
    }

    /// All file histories
    pub fn file_histories(&self) -> impl Iterator<Item = &FileHistory> {
        self.histories.values()
    }

    /// History currently located at `path`
    pub fn history_by_path(&self, path: &str) -> Option<&FileHistory> {
        self.paths.get(path).and_then(|id| self.histories.get(id))
    }

    /// Latest version of every file that currently exists, by path
    pub fn current_files(&self) -> BTreeMap<&str, &FileVersion> {
        self.paths
            .iter()
            .filter_map(|(path, id)| {
                self.histories
                    .get(id)
                    .and_then(|h| h.last_version())
                    .map(|v| (path.as_str(), v))
            })
            .collect()
    }
}

/// Persistence of database versions
pub trait DatabaseStore {
    /// Every stored version, in any order
    fn load_all(&self) -> Result<Vec<DatabaseVersion>>;

    /// Store one version atomically; storing a known version is a no-op
    fn append(&self, version: &DatabaseVersion) -> Result<()>;

    /// Superseded history deltas
    fn load_superseded(&self) -> Result<BTreeSet<SupersededDelta>>;

    /// Replace the superseded delta set atomically
    fn save_superseded(&self, superseded: &BTreeSet<SupersededDelta>) -> Result<()>;
}

/// Directory-backed store
///
/// Layout:
///
/// ```text
/// <root>/versions/<client>-<sequence>.bin   bincode DatabaseVersion
/// <root>/superseded.json                    superseded deltas
/// ```
#[derive(Debug, Clone)]
pub struct LocalDatabaseStore {
    root: PathBuf,
}

impl LocalDatabaseStore {
    /// Open (and create if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("versions"))?;
        Ok(Self { root })
    }

    /// Store root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn version_path(&self, id: &DatabaseVersionId) -> PathBuf {
        self.root
            .join("versions")
            .join(format!("{}-{:010}.bin", id.client, id.sequence))
    }

    fn write_atomic(&self, path: &Path, content: &[u8]) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| SyncError::internal(format!("no parent directory for {:?}", path)))?;
        let mut temp = NamedTempFile::new_in(dir)?;
        temp.write_all(content)?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| SyncError::Io(e.error))?;
        Ok(())
    }
}

impl DatabaseStore for LocalDatabaseStore {
    fn load_all(&self) -> Result<Vec<DatabaseVersion>> {
        let mut versions = Vec::new();
        for entry in fs::read_dir(self.root.join("versions"))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("bin") {
                continue;
            }
            let bytes = fs::read(&path)?;
            let (version, _): (DatabaseVersion, _) =
                bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
            versions.push(version);
        }
        versions.sort_by_key(|v| v.causal_key());
        Ok(versions)
    }

    fn append(&self, version: &DatabaseVersion) -> Result<()> {
        let path = self.version_path(&version.id());
        if path.exists() {
            return Ok(());
        }
        let bytes = bincode::serde::encode_to_vec(version, bincode::config::standard())?;
        self.write_atomic(&path, &bytes)?;
        debug!("Stored database version {} ({} bytes)", version.id(), bytes.len());
        Ok(())
    }

    fn load_superseded(&self) -> Result<BTreeSet<SupersededDelta>> {
        let path = self.root.join("superseded.json");
        if !path.exists() {
            return Ok(BTreeSet::new());
        }
        let json = fs::read_to_string(path)?;
        let entries: Vec<SupersededDelta> = serde_json::from_str(&json)?;
        Ok(entries.into_iter().collect())
    }

    fn save_superseded(&self, superseded: &BTreeSet<SupersededDelta>) -> Result<()> {
        let entries: Vec<&SupersededDelta> = superseded.iter().collect();
        let json = serde_json::to_string_pretty(&entries)?;
        self.write_atomic(&self.root.join("superseded.json"), json.as_bytes())
    }
}
