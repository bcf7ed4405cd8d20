//! Retrying transfer decorator

use super::{RemoteFile, RemoteFileKind, StorageTestResult, TransferManager};
use crate::config::RetryConfig;
use crate::error::Result;
use std::collections::BTreeMap;
use std::path::Path;
use std::thread;
use tracing::{debug, warn};

/// Retries transient storage failures of the wrapped manager
///
/// Every call is attempted up to [`RetryConfig::max_attempts`] times with a
/// fixed sleep in between. Only errors for which
/// [`SyncError::is_retryable`](crate::SyncError::is_retryable) holds are
/// retried; a missing object or a failed move propagates on the first
/// occurrence. The result of the first successful attempt is returned as is.
///
/// [`TransferManager::test`] is passed through without retries since it
/// already captures errors in its result.
#[derive(Debug)]
pub struct RetriableTransferManager<T> {
    inner: T,
    config: RetryConfig,
}

impl<T: TransferManager> RetriableTransferManager<T> {
    /// Wrap a manager with the default policy (3 attempts, 3 seconds apart)
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, RetryConfig::default())
    }

    /// Wrap a manager with a custom policy
    pub fn with_config(inner: T, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    /// The wrapped manager
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// The active policy
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    fn retry<R>(&self, operation: &str, mut call: impl FnMut() -> Result<R>) -> Result<R> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            if attempt > 1 {
                warn!("Retrying {}: {}/{}", operation, attempt, max_attempts);
            }

            match call() {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => {
                    debug!("{} failed permanently: {}", operation, e);
                    return Err(e);
                }
                Err(e) if attempt >= max_attempts => {
                    warn!(
                        "{} failed after {} attempts, giving up: {}",
                        operation, attempt, e
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        "{} failed ({}/{}): {}. Sleeping {}",
                        operation,
                        attempt,
                        max_attempts,
                        e,
                        humantime::format_duration(self.config.delay)
                    );
                    thread::sleep(self.config.delay);
                    attempt += 1;
                }
            }
        }
    }
}

impl<T: TransferManager> TransferManager for RetriableTransferManager<T> {
    fn connect(&self) -> Result<()> {
        self.retry("connect", || self.inner.connect())
    }

    fn disconnect(&self) -> Result<()> {
        self.retry("disconnect", || self.inner.disconnect())
    }

    fn init(&self, create_if_required: bool) -> Result<()> {
        self.retry("init", || self.inner.init(create_if_required))
    }

    fn upload(&self, local: &Path, remote: &RemoteFile) -> Result<()> {
        self.retry("upload", || self.inner.upload(local, remote))
    }

    fn download(&self, remote: &RemoteFile, local: &Path) -> Result<()> {
        self.retry("download", || self.inner.download(remote, local))
    }

    fn move_file(&self, source: &RemoteFile, target: &RemoteFile) -> Result<()> {
        self.retry("move", || self.inner.move_file(source, target))
    }

    fn delete(&self, remote: &RemoteFile) -> Result<bool> {
        self.retry("delete", || self.inner.delete(remote))
    }

    fn list(&self, kind: RemoteFileKind) -> Result<BTreeMap<String, RemoteFile>> {
        self.retry("list", || self.inner.list(kind))
    }

    fn test_target_exists(&self) -> Result<bool> {
        self.retry("test_target_exists", || self.inner.test_target_exists())
    }

    fn test_target_can_write(&self) -> Result<bool> {
        self.retry("test_target_can_write", || self.inner.test_target_can_write())
    }

    fn test_target_can_create(&self) -> Result<bool> {
        self.retry("test_target_can_create", || self.inner.test_target_can_create())
    }

    fn test_repo_file_exists(&self) -> Result<bool> {
        self.retry("test_repo_file_exists", || self.inner.test_repo_file_exists())
    }

    fn create_path(&self, remote: &RemoteFile) -> Result<()> {
        self.retry("create_path", || self.inner.create_path(remote))
    }

    fn test(&self, test_create_target: bool) -> StorageTestResult {
        self.inner.test(test_create_target)
    }
}
