//! Local change detection
//!
//! The [`Indexer`] compares the sync folder on disk with the local database
//! and turns every difference into a history delta of a new
//! [`DatabaseVersion`]. It is the [`DeduperListener`] of the upload path:
//! the database serves as the chunk existence index, and chunks not seen
//! before are packed into containers in the work directory.
//!
//! ## Change classification
//!
//! | On disk                                   | Delta status |
//! |-------------------------------------------|--------------|
//! | path unknown to the database              | `New`        |
//! | path known, type/size/mtime/mode differ    | `Changed`    |
//! | new path whose content matches a vanished  | `Renamed`    |
//! | known path no longer present              | `Deleted`    |
//!
//! Unchanged entries are skipped without reading them. Folders and
//! symlinks are recorded without content. If nothing changed, no version is
//! produced.

use crate::chunker::Chunk;
use crate::deduper::{Deduper, DeduperListener};
use crate::database::MemoryDatabase;
use crate::error::Result;
use crate::model::{
    Checksum, ChunkEntry, DatabaseVersion, FileContent, FileHistory, FileHistoryId, FileStatus,
    FileType, FileVersion, MultiChunkEntry, MultiChunkId,
};
use crate::multichunk::SealedMultiChunk;
use crate::vector_clock::VectorClock;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace};
use walkdir::WalkDir;

/// One filesystem object found by a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    /// Absolute path
    pub path: PathBuf,
    /// Path relative to the sync root, `/` separated
    pub relative: String,
    /// Object type
    pub file_type: FileType,
    /// Size in bytes (zero for folders)
    pub size: u64,
    /// Modification time
    pub last_modified: DateTime<Utc>,
    /// Unix permission bits, if available
    pub permissions: Option<u32>,
    /// Symlink target
    pub link_target: Option<String>,
}

impl LocalEntry {
    fn matches(&self, version: &FileVersion) -> bool {
        version.file_type == self.file_type
            && match self.file_type {
                FileType::Folder => true,
                FileType::Symlink => version.link_target == self.link_target,
                FileType::File => {
                    version.size == self.size
                        && version.last_modified == self.last_modified
                        && version.permissions == self.permissions
                }
            }
    }
}

/// Build the ignore matcher from glob patterns
pub fn build_ignore_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Walk `root` and collect every entry not matched by `ignore`
///
/// Entries below `skip` (typically the client's work directory) are left
/// out. Symlinks are recorded, never followed.
pub fn scan(root: &Path, ignore: &GlobSet, skip: Option<&Path>) -> Result<BTreeMap<String, LocalEntry>> {
    let mut entries = BTreeMap::new();

    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if skip.is_some_and(|skip| entry.path().starts_with(skip)) {
                return false;
            }
            match relative_path(root, entry.path()) {
                Some(relative) => !ignore.is_match(&relative),
                None => false,
            }
        });

    for entry in walker {
        let entry = entry?;
        let Some(relative) = relative_path(root, entry.path()) else {
            continue;
        };
        let metadata = entry.metadata()?;

        let file_type = if metadata.file_type().is_symlink() {
            FileType::Symlink
        } else if metadata.is_dir() {
            FileType::Folder
        } else if metadata.is_file() {
            FileType::File
        } else {
            trace!("Skipping special file {}", entry.path().display());
            continue;
        };

        let link_target = if file_type == FileType::Symlink {
            Some(fs::read_link(entry.path())?.to_string_lossy().into_owned())
        } else {
            None
        };

        let last_modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        entries.insert(
            relative.clone(),
            LocalEntry {
                path: entry.path().to_path_buf(),
                relative,
                file_type,
                size: if file_type == FileType::File { metadata.len() } else { 0 },
                last_modified,
                permissions: permissions_of(&metadata),
                link_target,
            },
        );
    }

    debug!("Scanned {} entries below {}", entries.len(), root.display());
    Ok(entries)
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[cfg(unix)]
fn permissions_of(metadata: &fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn permissions_of(_metadata: &fs::Metadata) -> Option<u32> {
    None
}

/// Outcome of indexing
#[derive(Debug, Default)]
pub struct IndexResult {
    /// The new version, if anything changed
    pub version: Option<DatabaseVersion>,
    /// Container files written to the work directory
    pub multi_chunk_files: Vec<(MultiChunkId, PathBuf)>,
}

/// Turns local changes into a new database version
pub struct Indexer<'a> {
    database: &'a MemoryDatabase,
    work_dir: PathBuf,
    seen_chunks: HashSet<Checksum>,
    chunks: Vec<ChunkEntry>,
    multi_chunks: Vec<MultiChunkEntry>,
    multi_chunk_files: Vec<(MultiChunkId, PathBuf)>,
    contents: Vec<FileContent>,
    seen_contents: HashSet<Checksum>,
    file_chunks: Vec<Checksum>,
    file_size: u64,
    file_contents: HashMap<PathBuf, FileContent>,
}

impl<'a> Indexer<'a> {
    /// Create an indexer over `database`, writing containers to `work_dir`
    pub fn new(database: &'a MemoryDatabase, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            database,
            work_dir: work_dir.into(),
            seen_chunks: HashSet::new(),
            chunks: Vec::new(),
            multi_chunks: Vec::new(),
            multi_chunk_files: Vec::new(),
            contents: Vec::new(),
            seen_contents: HashSet::new(),
            file_chunks: Vec::new(),
            file_size: 0,
            file_contents: HashMap::new(),
        }
    }

    /// Index a scan result
    ///
    /// Changed regular files are run through `deduper`. The returned version
    /// carries `clock` and is not yet part of the database.
    ///
    /// # Errors
    ///
    /// Fails if a file cannot be read or a container cannot be written. In
    /// that case containers already written are still listed nowhere, and
    /// the caller should clear the work directory.
    pub fn index(
        mut self,
        client: &str,
        clock: VectorClock,
        entries: &BTreeMap<String, LocalEntry>,
        deduper: &Deduper,
    ) -> Result<IndexResult> {
        let mut changed: Vec<&LocalEntry> = Vec::new();
        for entry in entries.values() {
            match self.database.history_by_path(&entry.relative).and_then(|h| h.last_version()) {
                Some(current) if entry.matches(current) => {}
                _ => changed.push(entry),
            }
        }

        let files: Vec<PathBuf> = changed
            .iter()
            .filter(|e| e.file_type == FileType::File)
            .map(|e| e.path.clone())
            .collect();
        if !files.is_empty() {
            deduper.deduplicate(&files, &mut self)?;
        }

        let deltas = self.build_deltas(entries, &changed);

        let mut version = DatabaseVersion::new(client, clock);
        version.chunks = self.chunks;
        version.multi_chunks = self.multi_chunks;
        version.file_contents = self.contents;
        version.file_histories = deltas;

        if version.is_empty() {
            debug!("No local changes");
            return Ok(IndexResult {
                version: None,
                multi_chunk_files: self.multi_chunk_files,
            });
        }

        info!(
            "Indexed {} changed entries: {} new chunks in {} multichunks",
            version.file_histories.len(),
            version.chunks.len(),
            version.multi_chunks.len()
        );
        Ok(IndexResult {
            version: Some(version),
            multi_chunk_files: self.multi_chunk_files,
        })
    }

    fn build_deltas(&self, entries: &BTreeMap<String, LocalEntry>, changed: &[&LocalEntry]) -> Vec<FileHistory> {
        let database: &'a MemoryDatabase = self.database;
        let now = Utc::now();
        let mut deltas: Vec<FileHistory> = Vec::new();

        // Tracked files that vanished, for rename detection
        let mut vanished: Vec<(&'a str, &'a FileVersion)> = database
            .current_files()
            .into_iter()
            .filter(|(path, _)| !entries.contains_key(*path))
            .collect();
        let mut renamed_from: HashSet<String> = HashSet::new();

        for entry in changed {
            let content = self.file_contents.get(&entry.path);
            let mut version = FileVersion {
                version: 1,
                path: entry.relative.clone(),
                file_type: entry.file_type,
                status: FileStatus::New,
                size: content.map(|c| c.size).unwrap_or(entry.size),
                checksum: content.map(|c| c.checksum),
                link_target: entry.link_target.clone(),
                last_modified: entry.last_modified,
                updated: now,
                permissions: entry.permissions,
            };

            let existing = database.history_by_path(&entry.relative);
            let history_id = match existing.and_then(|h| h.last_version().map(|v| (h, v))) {
                Some((history, current)) => {
                    version.version = current.version + 1;
                    version.status = FileStatus::Changed;
                    history.id.clone()
                }
                None => match self.take_rename_source(&mut vanished, &version) {
                    Some((old_path, history)) => {
                        version.version = history.last_version().map(|v| v.version + 1).unwrap_or(1);
                        version.status = FileStatus::Renamed;
                        trace!("Detected rename {} -> {}", old_path, version.path);
                        renamed_from.insert(old_path);
                        history.id.clone()
                    }
                    None => FileHistoryId::random(),
                },
            };

            deltas.push(FileHistory {
                id: history_id,
                versions: vec![version],
            });
        }

        for (path, current) in database.current_files() {
            if entries.contains_key(path) || renamed_from.contains(path) {
                continue;
            }
            let Some(history) = database.history_by_path(path) else {
                continue;
            };
            let mut deleted = current.successor(FileStatus::Deleted);
            deleted.updated = now;
            deltas.push(FileHistory {
                id: history.id.clone(),
                versions: vec![deleted],
            });
        }

        deltas
    }

    /// Pick a vanished file with the same non-empty content as `version`
    fn take_rename_source(
        &self,
        vanished: &mut Vec<(&'a str, &'a FileVersion)>,
        version: &FileVersion,
    ) -> Option<(String, &'a FileHistory)> {
        if version.file_type != FileType::File || version.size == 0 {
            return None;
        }
        let checksum = version.checksum?;
        let index = vanished
            .iter()
            .position(|(_, v)| v.file_type == FileType::File && v.checksum == Some(checksum))?;
        let (path, _) = vanished.remove(index);
        let database: &'a MemoryDatabase = self.database;
        database
            .history_by_path(path)
            .map(|history| (path.to_string(), history))
    }
}

impl DeduperListener for Indexer<'_> {
    fn on_file_start(&mut self, file: &Path) -> Result<()> {
        trace!("Indexing {}", file.display());
        self.file_chunks.clear();
        self.file_size = 0;
        Ok(())
    }

    fn on_chunk(&mut self, chunk: &Chunk) -> bool {
        if self.database.contains_chunk(&chunk.checksum) {
            return false;
        }
        if !self.seen_chunks.insert(chunk.checksum) {
            return false;
        }
        self.chunks.push(chunk.entry());
        true
    }

    fn multi_chunk_target(&mut self, id: &MultiChunkId) -> Result<PathBuf> {
        fs::create_dir_all(&self.work_dir)?;
        Ok(self.work_dir.join(format!("multichunk-{}", id.to_hex())))
    }

    fn on_close_multi_chunk(&mut self, sealed: SealedMultiChunk) -> Result<()> {
        let path = self.work_dir.join(format!("multichunk-{}", sealed.id.to_hex()));
        debug!(
            "Sealed multichunk {} with {} chunks",
            sealed.id.short(),
            sealed.chunks.len()
        );
        self.multi_chunks.push(sealed.entry());
        self.multi_chunk_files.push((sealed.id, path));
        Ok(())
    }

    fn on_file_add_chunk(&mut self, _file: &Path, chunk: &Chunk) {
        self.file_chunks.push(chunk.checksum);
        self.file_size += chunk.data.len() as u64;
    }

    fn on_file_end(&mut self, file: &Path, _last_chunk: Option<Checksum>) -> Result<()> {
        let content = FileContent::from_chunks(std::mem::take(&mut self.file_chunks), self.file_size);
        if self.database.file_content(&content.checksum).is_none()
            && self.seen_contents.insert(content.checksum)
        {
            self.contents.push(content.clone());
        }
        self.file_contents.insert(file.to_path_buf(), content);
        Ok(())
    }
}
