//! Configuration types
//!
//! Every tunable of the engine lives in a plain struct with a `Default`
//! implementation and a `validate()` method. The structs derive serde so an
//! outer layer can load them from whatever format it likes; this crate does
//! not read configuration files itself.
//!
//! ## Examples
//!
//! ```rust
//! use syncfold::config::{ChunkerConfig, SyncConfig, TransformerConfig};
//! use std::time::Duration;
//!
//! let config = SyncConfig::builder("laptop")
//!     .chunker(ChunkerConfig::ContentDefined { min_size: 2048, avg_size: 8192, max_size: 32768 })
//!     .max_multi_chunk_size(1024 * 1024)
//!     .transformers(TransformerConfig::compressed())
//!     .retry(3, Duration::from_millis(10))
//!     .ignore_patterns(vec!["*.tmp".to_string()])
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.client_id, "laptop");
//! ```

use crate::error::{Result, SyncError};
use crate::model::validate_client_id;
use crate::transfer::RemoteFileKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default maximum multichunk size (4 MiB)
pub const DEFAULT_MAX_MULTI_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Default maximum attempts per remote call
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;

/// Default delay between attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);

// Limits enforced by the FastCDC implementation
const CDC_MIN_SIZE_RANGE: (u32, u32) = (64, 1_048_576);
const CDC_AVG_SIZE_RANGE: (u32, u32) = (256, 4_194_304);
const CDC_MAX_SIZE_RANGE: (u32, u32) = (1024, 16_777_216);

/// How files are split into chunks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChunkerConfig {
    /// Fixed-size boundaries
    Fixed {
        /// Chunk size in bytes
        size: u32,
    },
    /// Content-defined boundaries (FastCDC rolling hash)
    ContentDefined {
        /// Minimum chunk size in bytes
        min_size: u32,
        /// Expected chunk size in bytes
        avg_size: u32,
        /// Maximum chunk size in bytes
        max_size: u32,
    },
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        ChunkerConfig::ContentDefined {
            min_size: 4 * 1024,
            avg_size: 16 * 1024,
            max_size: 64 * 1024,
        }
    }
}

impl ChunkerConfig {
    /// Check sizes against the chunker's supported ranges
    pub fn validate(&self) -> Result<()> {
        match *self {
            ChunkerConfig::Fixed { size } => {
                if size == 0 {
                    return Err(SyncError::InvalidConfiguration(
                        "fixed chunk size must be greater than zero".to_string(),
                    ));
                }
            }
            ChunkerConfig::ContentDefined { min_size, avg_size, max_size } => {
                let in_range = |v: u32, (lo, hi): (u32, u32)| v >= lo && v <= hi;
                if !in_range(min_size, CDC_MIN_SIZE_RANGE)
                    || !in_range(avg_size, CDC_AVG_SIZE_RANGE)
                    || !in_range(max_size, CDC_MAX_SIZE_RANGE)
                {
                    return Err(SyncError::InvalidConfiguration(format!(
                        "content-defined chunk sizes out of range: min={} avg={} max={}",
                        min_size, avg_size, max_size
                    )));
                }
                if !(min_size <= avg_size && avg_size <= max_size) {
                    return Err(SyncError::InvalidConfiguration(format!(
                        "content-defined chunk sizes must satisfy min <= avg <= max: min={} avg={} max={}",
                        min_size, avg_size, max_size
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Container packing settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiChunkerConfig {
    /// Upper bound of a container's packed size in bytes
    pub max_size: u64,
}

impl Default for MultiChunkerConfig {
    fn default() -> Self {
        Self { max_size: DEFAULT_MAX_MULTI_CHUNK_SIZE }
    }
}

impl MultiChunkerConfig {
    /// Check that the bound is positive
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(SyncError::InvalidConfiguration(
                "multichunk max_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// One stage of the transformer chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformerKind {
    /// LZ4 frame compression
    Lz4,
    /// AES-256-GCM framed authenticated encryption
    Aes256Gcm,
}

/// Ordered list of transformer stages, outermost (first applied on write) first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformerConfig {
    /// Stages in write order
    pub stages: Vec<TransformerKind>,
}

impl TransformerConfig {
    /// No transformation
    pub fn plain() -> Self {
        Self::default()
    }

    /// Compression only
    pub fn compressed() -> Self {
        Self { stages: vec![TransformerKind::Lz4] }
    }

    /// Compress, then encrypt
    pub fn compressed_and_encrypted() -> Self {
        Self { stages: vec![TransformerKind::Lz4, TransformerKind::Aes256Gcm] }
    }

    /// True if any stage needs key material
    pub fn requires_key(&self) -> bool {
        self.stages.contains(&TransformerKind::Aes256Gcm)
    }
}

/// Retry policy of the retrying transfer decorator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per call, including the first one
    pub max_attempts: u32,
    /// Fixed sleep between attempts
    #[serde(with = "humantime_serde_compat")]
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryConfig {
    /// Check that at least one attempt is made
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(SyncError::InvalidConfiguration(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sharding layout of the path-aware transfer decorator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathAwareConfig {
    /// Object kinds that get a sharded sub-path
    pub affected: Vec<RemoteFileKind>,
    /// Number of nested folders
    pub subfolder_depth: usize,
    /// Hex characters of the name hash per folder level
    pub bytes_per_folder: usize,
    /// Separator between folder levels
    pub folder_separator: char,
}

impl Default for PathAwareConfig {
    fn default() -> Self {
        Self {
            affected: vec![RemoteFileKind::MultiChunk, RemoteFileKind::Database],
            subfolder_depth: 2,
            bytes_per_folder: 2,
            folder_separator: '/',
        }
    }
}

impl PathAwareConfig {
    /// Check that the layout fits in the name hash
    pub fn validate(&self) -> Result<()> {
        // The sharding hash is a hex-encoded SHA-256 digest: 64 characters
        if self.bytes_per_folder == 0 || self.subfolder_depth * self.bytes_per_folder > 64 {
            return Err(SyncError::InvalidConfiguration(format!(
                "path-aware layout {}x{} does not fit a 64 character hash",
                self.subfolder_depth, self.bytes_per_folder
            )));
        }
        Ok(())
    }
}

/// Top-level configuration of a synchronizing client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// This client's id (ASCII letters only)
    pub client_id: String,
    /// Chunking strategy
    pub chunker: ChunkerConfig,
    /// Container packing
    pub multi_chunker: MultiChunkerConfig,
    /// Transformer stages applied to multichunks and database files
    pub transformers: TransformerConfig,
    /// Retry policy for remote calls
    pub retry: RetryConfig,
    /// Optional sharding of remote object names
    pub path_aware: Option<PathAwareConfig>,
    /// Glob patterns excluded from indexing
    pub ignore_patterns: Vec<String>,
}

impl SyncConfig {
    /// Start building a configuration for the given client
    pub fn builder(client_id: impl Into<String>) -> SyncConfigBuilder {
        SyncConfigBuilder::new(client_id)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        validate_client_id(&self.client_id)?;
        self.chunker.validate()?;
        self.multi_chunker.validate()?;
        self.retry.validate()?;
        if let Some(path_aware) = &self.path_aware {
            path_aware.validate()?;
        }
        Ok(())
    }
}

/// Client id derived from the machine host name
///
/// Non-alphabetic characters are dropped so the id is valid in clocks and
/// remote names. Falls back to `"client"` if nothing remains.
pub fn default_client_id() -> String {
    let name: String = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .collect();
    if name.is_empty() {
        "client".to_string()
    } else {
        name
    }
}

/// Builder for [`SyncConfig`]
#[derive(Debug, Clone)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    /// Create a builder with default settings for the given client
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            config: SyncConfig {
                client_id: client_id.into(),
                chunker: ChunkerConfig::default(),
                multi_chunker: MultiChunkerConfig::default(),
                transformers: TransformerConfig::compressed(),
                retry: RetryConfig::default(),
                path_aware: None,
                ignore_patterns: Vec::new(),
            },
        }
    }

    /// Set the chunking strategy
    pub fn chunker(mut self, chunker: ChunkerConfig) -> Self {
        self.config.chunker = chunker;
        self
    }

    /// Set the multichunk size bound
    pub fn max_multi_chunk_size(mut self, size: u64) -> Self {
        self.config.multi_chunker.max_size = size;
        self
    }

    /// Set the transformer stages
    pub fn transformers(mut self, transformers: TransformerConfig) -> Self {
        self.config.transformers = transformers;
        self
    }

    /// Set the retry policy
    pub fn retry(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.config.retry = RetryConfig { max_attempts, delay };
        self
    }

    /// Enable path-aware sharding of remote names
    pub fn path_aware(mut self, path_aware: PathAwareConfig) -> Self {
        self.config.path_aware = Some(path_aware);
        self
    }

    /// Set ignore patterns for indexing
    pub fn ignore_patterns(mut self, patterns: Vec<String>) -> Self {
        self.config.ignore_patterns = patterns;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> Result<SyncConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Serialize durations as humantime strings ("3s", "250ms")
mod humantime_serde_compat {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
