//! In-memory transfer manager
//!
//! Keeps objects in a map guarded by a [`parking_lot::Mutex`]. Besides being
//! a fast backend for tests, it can inject failures per operation and counts
//! every call, which makes retry and rollback behavior observable.

use super::{RemoteFile, RemoteFileKind, TransferManager};
use crate::error::{Result, SyncError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use tracing::trace;

/// Transfer operations that can be counted and failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `connect`
    Connect,
    /// `disconnect`
    Disconnect,
    /// `init`
    Init,
    /// `upload`
    Upload,
    /// `download`
    Download,
    /// `move_file`
    Move,
    /// `delete`
    Delete,
    /// `list`
    List,
    /// Any of the `test_*` probes
    Test,
    /// `create_path`
    CreatePath,
}

impl Operation {
    fn name(self) -> &'static str {
        match self {
            Operation::Connect => "connect",
            Operation::Disconnect => "disconnect",
            Operation::Init => "init",
            Operation::Upload => "upload",
            Operation::Download => "download",
            Operation::Move => "move",
            Operation::Delete => "delete",
            Operation::List => "list",
            Operation::Test => "test",
            Operation::CreatePath => "create path",
        }
    }
}

/// Error produced by an injected failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// A retryable [`SyncError::Storage`]
    Transient,
    /// A permanent [`SyncError::StorageFileNotFound`]
    NotFound,
}

#[derive(Debug, Clone)]
struct ScriptedFailure {
    operation: Operation,
    /// Only calls whose target name contains this fail
    pattern: Option<String>,
    /// Remaining failures; `None` fails forever
    remaining: Option<usize>,
    kind: FailureKind,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, (RemoteFile, Vec<u8>)>,
    failures: Vec<ScriptedFailure>,
    calls: HashMap<Operation, usize>,
}

impl State {
    fn enter(&mut self, operation: Operation, target: &str) -> Result<()> {
        *self.calls.entry(operation).or_insert(0) += 1;

        let position = self.failures.iter().position(|f| {
            f.operation == operation
                && f.remaining != Some(0)
                && f.pattern.as_deref().map_or(true, |p| target.contains(p))
        });
        let Some(position) = position else {
            return Ok(());
        };

        let failure = &mut self.failures[position];
        if let Some(remaining) = failure.remaining.as_mut() {
            *remaining -= 1;
        }
        trace!("Injecting {:?} failure into {} of {}", failure.kind, operation.name(), target);
        Err(match failure.kind {
            FailureKind::Transient => {
                SyncError::storage(operation.name(), target, "injected transient failure")
            }
            FailureKind::NotFound => SyncError::StorageFileNotFound(target.to_string()),
        })
    }
}

/// Transfer manager keeping objects in memory
#[derive(Debug, Default)]
pub struct MemoryTransferManager {
    state: Mutex<State>,
}

impl MemoryTransferManager {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` calls of an operation
    pub fn fail_next(&self, operation: Operation, count: usize, kind: FailureKind) {
        self.state.lock().failures.push(ScriptedFailure {
            operation,
            pattern: None,
            remaining: Some(count),
            kind,
        });
    }

    /// Fail every call of an operation
    pub fn fail_always(&self, operation: Operation, kind: FailureKind) {
        self.state.lock().failures.push(ScriptedFailure {
            operation,
            pattern: None,
            remaining: None,
            kind,
        });
    }

    /// Fail every call of an operation whose target name contains `pattern`
    pub fn fail_matching(&self, operation: Operation, pattern: impl Into<String>, kind: FailureKind) {
        self.state.lock().failures.push(ScriptedFailure {
            operation,
            pattern: Some(pattern.into()),
            remaining: None,
            kind,
        });
    }

    /// Remove all scripted failures
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Number of calls made to an operation, failed ones included
    pub fn calls(&self, operation: Operation) -> usize {
        self.state.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    /// Names of the stored objects of one kind
    pub fn names(&self, kind: RemoteFileKind) -> Vec<String> {
        self.state
            .lock()
            .objects
            .values()
            .filter(|(file, _)| file.kind() == kind)
            .map(|(file, _)| file.name().to_string())
            .collect()
    }

    /// Total number of stored objects
    pub fn len(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Check if nothing is stored
    pub fn is_empty(&self) -> bool {
        self.state.lock().objects.is_empty()
    }

    /// Raw bytes of a stored object
    pub fn get(&self, remote: &RemoteFile) -> Option<Vec<u8>> {
        self.state
            .lock()
            .objects
            .get(&remote.relative_path())
            .map(|(_, data)| data.clone())
    }

    /// Store bytes directly, bypassing failure injection
    pub fn put(&self, remote: &RemoteFile, data: Vec<u8>) {
        self.state
            .lock()
            .objects
            .insert(remote.relative_path(), (remote.clone(), data));
    }
}

impl TransferManager for MemoryTransferManager {
    fn connect(&self) -> Result<()> {
        self.state.lock().enter(Operation::Connect, "repository")
    }

    fn disconnect(&self) -> Result<()> {
        self.state.lock().enter(Operation::Disconnect, "repository")
    }

    fn init(&self, _create_if_required: bool) -> Result<()> {
        self.state.lock().enter(Operation::Init, "repository")
    }

    fn upload(&self, local: &Path, remote: &RemoteFile) -> Result<()> {
        let data = fs::read(local)?;
        let mut state = self.state.lock();
        state.enter(Operation::Upload, remote.name())?;
        state
            .objects
            .insert(remote.relative_path(), (remote.clone(), data));
        Ok(())
    }

    fn download(&self, remote: &RemoteFile, local: &Path) -> Result<()> {
        let data = {
            let mut state = self.state.lock();
            state.enter(Operation::Download, remote.name())?;
            match state.objects.get(&remote.relative_path()) {
                Some((_, data)) => data.clone(),
                None => return Err(SyncError::StorageFileNotFound(remote.relative_path())),
            }
        };
        fs::write(local, data)?;
        Ok(())
    }

    fn move_file(&self, source: &RemoteFile, target: &RemoteFile) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(Operation::Move, target.name())?;
        let Some((_, data)) = state.objects.remove(&source.relative_path()) else {
            return Err(SyncError::StorageMoveFailed {
                source_name: source.relative_path(),
                target_name: target.relative_path(),
            });
        };
        state
            .objects
            .insert(target.relative_path(), (target.clone(), data));
        Ok(())
    }

    fn delete(&self, remote: &RemoteFile) -> Result<bool> {
        let mut state = self.state.lock();
        state.enter(Operation::Delete, remote.name())?;
        Ok(state.objects.remove(&remote.relative_path()).is_some())
    }

    fn list(&self, kind: RemoteFileKind) -> Result<BTreeMap<String, RemoteFile>> {
        let mut state = self.state.lock();
        state.enter(Operation::List, kind.prefix())?;
        Ok(state
            .objects
            .values()
            .filter(|(file, _)| file.kind() == kind)
            .map(|(file, _)| (file.name().to_string(), file.clone()))
            .collect())
    }

    fn test_target_exists(&self) -> Result<bool> {
        self.state.lock().enter(Operation::Test, "repository")?;
        Ok(true)
    }

    fn test_target_can_write(&self) -> Result<bool> {
        self.state.lock().enter(Operation::Test, "repository")?;
        Ok(true)
    }

    fn test_target_can_create(&self) -> Result<bool> {
        self.state.lock().enter(Operation::Test, "repository")?;
        Ok(true)
    }

    fn test_repo_file_exists(&self) -> Result<bool> {
        let mut state = self.state.lock();
        state.enter(Operation::Test, "repository")?;
        Ok(state
            .objects
            .contains_key(&RemoteFile::repo().relative_path()))
    }

    fn create_path(&self, remote: &RemoteFile) -> Result<()> {
        self.state.lock().enter(Operation::CreatePath, remote.name())
    }
}
