//! Filesystem helpers
//!
//! Small cross-platform operations used when files are written back into the
//! sync folder:
//!
//! - Atomic file writing through a temporary file in the target directory
//! - Permission and modification time handling
//! - Symbolic link creation
//! - Directory cleanup

use crate::error::Result;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::SystemTime;
use tempfile::NamedTempFile;
use tracing::trace;

/// Write a file atomically
///
/// `fill` writes the content into a temporary file created next to `path`,
/// which is then synced and renamed over `path`. Either the complete new
/// content is visible or the old file is left untouched; the temporary file
/// is removed if anything fails.
///
/// # Examples
///
/// ```rust
/// use std::io::Write;
/// # fn main() -> syncfold::Result<()> {
/// let dir = tempfile::tempdir()?;
/// let target = dir.path().join("out.txt");
/// syncfold::utils::write_atomic(&target, |file| Ok(file.write_all(b"hello")?))?;
/// assert_eq!(std::fs::read(&target)?, b"hello");
/// # Ok(())
/// # }
/// ```
pub fn write_atomic<F>(path: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&mut fs::File) -> Result<()>,
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut temp = NamedTempFile::new_in(dir)?;
    fill(temp.as_file_mut())?;
    temp.as_file_mut().flush()?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    trace!("Atomically wrote {:?}", path);
    Ok(())
}

/// Set permissions (Unix implementation)
#[cfg(unix)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Set permissions (only the owner write bit maps to read-only elsewhere)
#[cfg(not(unix))]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, permissions)?;
    Ok(())
}

/// Set the modification time of a file
pub fn set_modified(path: &Path, when: DateTime<Utc>) -> Result<()> {
    let time = FileTime::from_system_time(SystemTime::from(when));
    filetime::set_file_mtime(path, time)?;
    Ok(())
}

/// Create a symlink (Unix)
#[cfg(unix)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

/// Create a symlink (Windows)
#[cfg(windows)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    use std::os::windows::fs::{symlink_dir, symlink_file};

    if target.is_dir() {
        symlink_dir(target, link)?;
    } else {
        symlink_file(target, link)?;
    }
    Ok(())
}

/// Remove a directory only if it is empty
///
/// Returns `true` if the directory was removed.
pub fn remove_dir_if_empty(path: &Path) -> Result<bool> {
    if path.is_dir() && fs::read_dir(path)?.next().is_none() {
        fs::remove_dir(path)?;
        trace!("Removed empty directory: {:?}", path);
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Remove a file, symlink or empty directory; missing paths are fine
pub fn remove_entry(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => {
            remove_dir_if_empty(path)?;
        }
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Delete everything inside a directory, keeping the directory itself
pub fn clear_dir(path: &Path) -> Result<()> {
    if !path.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
