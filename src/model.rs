//! Metadata model: the persisted, append-only version graph
//!
//! A client's view of the synchronized folder is the sum of every
//! [`DatabaseVersion`] it knows. Each version is one client's atomic commit and
//! carries the metadata added by that commit:
//!
//! - [`ChunkEntry`]: a content-addressed chunk (checksum + size)
//! - [`MultiChunkEntry`]: which chunks a stored container holds
//! - [`FileContent`]: the ordered chunk list of one file's bytes
//! - [`FileHistory`] deltas: new [`FileVersion`]s for stable file identities
//!
//! Versions are never mutated after creation. Later versions supersede
//! earlier ones, and conflicting histories are forked, never rewritten.
//!
//! ## Identifiers
//!
//! Checksums are SHA-256 digests rendered as lowercase hex. Client ids are
//! short ASCII-alphabetic names so they can appear verbatim in vector clock
//! strings and remote object names such as `database-laptop-0000000004`.

use crate::error::{Result, SyncError};
use crate::vector_clock::VectorClock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// Length of a checksum in bytes (SHA-256)
pub const CHECKSUM_LEN: usize = 32;

/// SHA-256 checksum identifying chunks, file contents and containers
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Checksum([u8; CHECKSUM_LEN]);

impl Checksum {
    /// Compute the checksum of a byte slice
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Wrap raw digest bytes
    pub fn from_bytes(bytes: [u8; CHECKSUM_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a 64 character hex string
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| SyncError::internal(format!("invalid checksum {:?}: {}", hex_str, e)))?;
        let bytes: [u8; CHECKSUM_LEN] = bytes
            .try_into()
            .map_err(|_| SyncError::internal(format!("invalid checksum length: {:?}", hex_str)))?;
        Ok(Self(bytes))
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; CHECKSUM_LEN] {
        &self.0
    }

    /// Lowercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 hex characters, for log output
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.short())
    }
}

impl Serialize for Checksum {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Checksum::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Identifier of a multichunk container: the checksum of its first chunk
pub type MultiChunkId = Checksum;

/// Check that a client id can be used in clocks and remote names
pub fn validate_client_id(client: &str) -> Result<()> {
    if client.is_empty() || !client.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(SyncError::InvalidConfiguration(format!(
            "client id {:?} must be a non-empty ASCII alphabetic name",
            client
        )));
    }
    Ok(())
}

/// A chunk known to the database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    /// Checksum of the chunk bytes
    pub checksum: Checksum,
    /// Size of the chunk in bytes
    pub size: u32,
}

/// Chunks packed into one stored container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiChunkEntry {
    /// Container id (checksum of its first chunk)
    pub id: MultiChunkId,
    /// Chunk checksums in write order
    pub chunks: Vec<Checksum>,
}

/// The byte content of one file version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    /// Checksum over the ordered chunk checksums and the total size
    pub checksum: Checksum,
    /// Total size in bytes
    pub size: u64,
    /// Chunk checksums in file order
    pub chunks: Vec<Checksum>,
}

impl FileContent {
    /// Build a file content from its chunk list, deriving the checksum
    pub fn from_chunks(chunks: Vec<Checksum>, size: u64) -> Self {
        let checksum = Self::compute_checksum(&chunks, size);
        Self { checksum, size, chunks }
    }

    /// Checksum over ordered chunk checksums followed by the size
    pub fn compute_checksum(chunks: &[Checksum], size: u64) -> Checksum {
        let mut hasher = Sha256::new();
        for chunk in chunks {
            hasher.update(chunk.as_bytes());
        }
        hasher.update(size.to_be_bytes());
        Checksum::from_bytes(hasher.finalize().into())
    }

    /// Check that the stored checksum matches the chunk list
    pub fn verify(&self) -> Result<()> {
        let actual = Self::compute_checksum(&self.chunks, self.size);
        if actual != self.checksum {
            return Err(SyncError::HashMismatch {
                expected: self.checksum.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(())
    }
}

/// Kind of filesystem object a version describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file with content
    File,
    /// Directory
    Folder,
    /// Symbolic link
    Symlink,
}

/// Change a version represents relative to its predecessor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileStatus {
    /// First version of the history
    New,
    /// Content or metadata changed
    Changed,
    /// Path changed, content unchanged
    Renamed,
    /// Object removed
    Deleted,
}

/// Stable identity of a file across renames
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileHistoryId(String);

impl FileHistoryId {
    /// Fresh random identifier
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Deterministic identifier derived from the given parts
    pub fn derived(parts: &[&str]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..16]))
    }

    /// Wrap an existing identifier
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileHistoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One state of a file history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    /// Version number, starting at 1 and increasing by exactly 1
    pub version: u64,
    /// Path relative to the sync root, `/` separated
    pub path: String,
    /// Object type
    pub file_type: FileType,
    /// Change this version represents
    pub status: FileStatus,
    /// Size in bytes (zero for folders)
    pub size: u64,
    /// Content checksum for regular files
    pub checksum: Option<Checksum>,
    /// Link target for symlinks
    pub link_target: Option<String>,
    /// Modification time of the content
    pub last_modified: DateTime<Utc>,
    /// Time this version was recorded
    pub updated: DateTime<Utc>,
    /// Unix permission bits, if known
    pub permissions: Option<u32>,
}

impl FileVersion {
    /// True if this version marks the object as removed
    pub fn is_deleted(&self) -> bool {
        self.status == FileStatus::Deleted
    }

    /// Copy of this version describing the next state
    pub fn successor(&self, status: FileStatus) -> FileVersion {
        let mut next = self.clone();
        next.version = self.version + 1;
        next.status = status;
        next.updated = Utc::now();
        next
    }
}

/// A file identity and (a slice of) its version timeline
///
/// Inside a [`DatabaseVersion`] only the versions added by that commit are
/// present. The database merges these deltas into full histories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHistory {
    /// Stable identity
    pub id: FileHistoryId,
    /// Versions in ascending version order
    pub versions: Vec<FileVersion>,
}

impl FileHistory {
    /// Create an empty history
    pub fn new(id: FileHistoryId) -> Self {
        Self { id, versions: Vec::new() }
    }

    /// Latest version, if any
    pub fn last_version(&self) -> Option<&FileVersion> {
        self.versions.last()
    }

    /// Version with the given number, if present
    pub fn version(&self, number: u64) -> Option<&FileVersion> {
        self.versions.iter().find(|v| v.version == number)
    }

    /// Insert a version, replacing any versions it supersedes
    ///
    /// Versions numbered at or above the new one are dropped first, so a
    /// resolved conflict overwrites the losing branch in this history.
    pub fn put_version(&mut self, version: FileVersion) -> Result<()> {
        self.versions.retain(|v| v.version < version.version);
        let expected = self.versions.last().map(|v| v.version + 1).unwrap_or(version.version);
        if version.version != expected {
            return Err(SyncError::InvalidDatabaseVersion(format!(
                "history {} expects version {}, got {}",
                self.id, expected, version.version
            )));
        }
        self.versions.push(version);
        Ok(())
    }

    /// Check that version numbers increase by exactly one
    pub fn validate(&self) -> Result<()> {
        for pair in self.versions.windows(2) {
            if pair[1].version != pair[0].version + 1 {
                return Err(SyncError::InvalidDatabaseVersion(format!(
                    "history {} jumps from version {} to {}",
                    self.id, pair[0].version, pair[1].version
                )));
            }
        }
        Ok(())
    }
}

/// Identity of a database version: its client and that client's counter
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatabaseVersionId {
    /// Creating client
    pub client: String,
    /// Creating client's own clock component
    pub sequence: u64,
}

impl DatabaseVersionId {
    /// Remote object name: `database-<client>-<sequence>`
    pub fn remote_name(&self) -> String {
        format!("database-{}-{:010}", self.client, self.sequence)
    }
}

impl fmt::Display for DatabaseVersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client, self.sequence)
    }
}

/// Header of a database version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseVersionHeader {
    /// Creating client
    pub client: String,
    /// Creator's clock after incrementing its own component
    pub vector_clock: VectorClock,
    /// Creation time
    pub timestamp: DateTime<Utc>,
}

/// One client's atomic, immutable metadata commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseVersion {
    /// Identity and causal position
    pub header: DatabaseVersionHeader,
    /// Chunks first stored by this commit
    pub chunks: Vec<ChunkEntry>,
    /// Containers first stored by this commit
    pub multi_chunks: Vec<MultiChunkEntry>,
    /// File contents first referenced by this commit
    pub file_contents: Vec<FileContent>,
    /// History deltas (only versions added by this commit)
    pub file_histories: Vec<FileHistory>,
}

impl DatabaseVersion {
    /// Create an empty version with the given header
    pub fn new(client: impl Into<String>, vector_clock: VectorClock) -> Self {
        Self {
            header: DatabaseVersionHeader {
                client: client.into(),
                vector_clock,
                timestamp: Utc::now(),
            },
            chunks: Vec::new(),
            multi_chunks: Vec::new(),
            file_contents: Vec::new(),
            file_histories: Vec::new(),
        }
    }

    /// Creating client
    pub fn client(&self) -> &str {
        &self.header.client
    }

    /// Creator's own clock component
    pub fn sequence(&self) -> u64 {
        self.header.vector_clock.get(&self.header.client)
    }

    /// Vector clock snapshot
    pub fn vector_clock(&self) -> &VectorClock {
        &self.header.vector_clock
    }

    /// Identity of this version
    pub fn id(&self) -> DatabaseVersionId {
        DatabaseVersionId {
            client: self.header.client.clone(),
            sequence: self.sequence(),
        }
    }

    /// Sort key giving a deterministic linear extension of the causal order
    ///
    /// If `a` happened before `b`, the component sum of `a`'s clock is
    /// strictly smaller, so sorting by this key never places a version
    /// before one of its predecessors.
    pub fn causal_key(&self) -> (u128, String, u64) {
        let total: u128 = self
            .header
            .vector_clock
            .iter()
            .map(|(_, v)| u128::from(v))
            .sum();
        (total, self.header.client.clone(), self.sequence())
    }

    /// True if the commit adds nothing
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
            && self.multi_chunks.is_empty()
            && self.file_contents.is_empty()
            && self.file_histories.is_empty()
    }

    /// Look up a history delta by id
    pub fn file_history(&self, id: &FileHistoryId) -> Option<&FileHistory> {
        self.file_histories.iter().find(|h| &h.id == id)
    }

    /// Structural checks independent of any other version
    pub fn validate(&self) -> Result<()> {
        validate_client_id(&self.header.client)?;
        if self.sequence() == 0 {
            return Err(SyncError::InvalidDatabaseVersion(format!(
                "version of client {} has no own clock component: {}",
                self.header.client, self.header.vector_clock
            )));
        }
        for history in &self.file_histories {
            if history.versions.is_empty() {
                return Err(SyncError::InvalidDatabaseVersion(format!(
                    "empty delta for history {}",
                    history.id
                )));
            }
            history.validate()?;
        }
        for content in &self.file_contents {
            content.verify()?;
        }
        Ok(())
    }
}
