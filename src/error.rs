//! Error types for the syncfold library
//!
//! All fallible operations return [`Result<T>`], whose error side is the
//! [`SyncError`] enum defined here. Errors are grouped by the failure classes
//! the synchronization engine distinguishes:
//!
//! - **Transient storage failures** ([`SyncError::Storage`]): connection drops,
//!   timeouts, refused writes. The retry decorator absorbs these up to its
//!   attempt budget.
//! - **Permanent storage failures** ([`SyncError::StorageFileNotFound`],
//!   [`SyncError::StorageMoveFailed`]): the object is simply not there.
//!   Retrying cannot help, so they propagate on first occurrence.
//! - **Local failures** (I/O, chunking, container state): abort the current
//!   run. The in-progress container is discarded by the caller.
//! - **Causally invalid remote versions** never surface here; the reconciler
//!   quarantines them and reports them in its result.
//!
//! Conflicts are an expected outcome of reconciliation and are never errors.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the syncfold library
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type for all syncfold operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// I/O errors during local file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// Transient failure talking to the remote storage
    #[error("Storage error during {operation} of {target}: {message}")]
    Storage {
        /// Operation that failed (upload, download, list, ...)
        operation: String,
        /// Remote object or location involved
        target: String,
        /// Backend specific description
        message: String,
    },

    /// Remote object does not exist
    #[error("Remote file not found: {0}")]
    StorageFileNotFound(String),

    /// Source of a remote move does not exist
    #[error("Cannot move remote file {source_name} to {target_name}: source missing")]
    StorageMoveFailed {
        /// Object that should have been moved
        source_name: String,
        /// Intended destination
        target_name: String,
    },

    /// Remote object name does not match any known kind or pattern
    #[error("Invalid remote file name: {0}")]
    InvalidRemoteFileName(String),

    /// Chunking a local file failed
    #[error("Chunking failed for {path:?}: {message}")]
    Chunking {
        /// File being chunked
        path: PathBuf,
        /// Description of the failure
        message: String,
    },

    /// Write attempted on a multichunk that is no longer open
    #[error("Multichunk {0} is sealed")]
    MultiChunkSealed(String),

    /// Malformed multichunk container
    #[error("Invalid multichunk: {0}")]
    InvalidMultiChunk(String),

    /// Chunk not present in a container or in the database
    #[error("Chunk not found: {0}")]
    ChunkNotFound(String),

    /// Transformer stage failed to encode or decode
    #[error("Transform error: {0}")]
    Transform(String),

    /// Encrypted data failed authentication
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Hash mismatch during verification
    #[error("Hash mismatch - expected: {expected}, actual: {actual}")]
    HashMismatch {
        /// Expected hash value
        expected: String,
        /// Actual computed hash value
        actual: String,
    },

    /// Database version failed validation
    #[error("Invalid database version: {0}")]
    InvalidDatabaseVersion(String),

    /// File history not present in the local database
    #[error("File history not found: {0}")]
    FileHistoryNotFound(String),

    /// Invalid vector clock text representation
    #[error("Invalid vector clock: {0}")]
    InvalidVectorClock(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Pattern parsing error
    #[error("Invalid ignore pattern: {0}")]
    InvalidPattern(#[from] globset::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Sync operation aborted; nothing was committed
    #[error("Sync aborted during {operation}: {source}")]
    SyncAborted {
        /// Step of the sync cycle that failed
        operation: String,
        /// Underlying failure
        #[source]
        source: Box<SyncError>,
    },

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<bincode::error::DecodeError> for SyncError {
    fn from(err: bincode::error::DecodeError) -> Self {
        SyncError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for SyncError {
    fn from(err: bincode::error::EncodeError) -> Self {
        SyncError::Bincode(err.to_string())
    }
}

impl SyncError {
    /// Create a transient storage error
    pub fn storage(
        operation: impl Into<String>,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        SyncError::Storage {
            operation: operation.into(),
            target: target.into(),
            message: message.into(),
        }
    }

    /// Create a transform error with a custom message
    pub fn transform(msg: impl Into<String>) -> Self {
        SyncError::Transform(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        SyncError::Internal(msg.into())
    }

    /// Wrap an error with the sync step it aborted
    pub fn aborted(operation: impl Into<String>, source: SyncError) -> Self {
        SyncError::SyncAborted {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Check if retrying the failed call may succeed
    ///
    /// Only transient storage failures qualify. Missing objects and failed
    /// moves are permanent.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Storage { .. })
    }

    /// Check if this is a permanent storage failure (missing object)
    pub fn is_permanent_storage_failure(&self) -> bool {
        matches!(
            self,
            SyncError::StorageFileNotFound(_) | SyncError::StorageMoveFailed { .. }
        )
    }

    /// Check if this error indicates corrupted or tampered data
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            SyncError::HashMismatch { .. }
                | SyncError::InvalidMultiChunk(_)
                | SyncError::Decryption(_)
        )
    }

    /// Get a user-facing message naming the failing operation and target
    pub fn user_message(&self) -> String {
        match self {
            SyncError::Storage { operation, target, message } => {
                format!(
                    "Could not {} '{}' on the remote storage ({}). The sync was not committed; try again later.",
                    operation, target, message
                )
            }
            SyncError::StorageFileNotFound(name) => {
                format!("Remote file '{}' does not exist. Another client may have cleaned it up.", name)
            }
            SyncError::StorageMoveFailed { source_name, target_name } => {
                format!(
                    "Could not move '{}' to '{}': the source is missing on the remote storage.",
                    source_name, target_name
                )
            }
            SyncError::SyncAborted { operation, source } => {
                format!("Sync failed during {}: {}", operation, source.user_message())
            }
            _ => self.to_string(),
        }
    }
}
