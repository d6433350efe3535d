// src/capsule/journal.rs

//! Ownership journal for paths conary keeps inside a capsule
//!
//! Before a foreign installer runs, every path conary owns is backed up
//! and removed so the installer's bookkeeping never sees it. Reverting
//! puts the backed up files back and deletes whatever the installer wrote
//! at paths that did not exist before. The journal reverts itself when
//! dropped, so every exit path restores the filesystem.

use crate::error::{Error, Result};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

#[derive(Debug)]
enum Entry {
    /// A regular file saved at `backup`
    File {
        path: PathBuf,
        backup: PathBuf,
        permissions: fs::Permissions,
    },
    /// A symlink and its target
    Symlink { path: PathBuf, target: PathBuf },
    /// Nothing existed at `path`
    Created { path: PathBuf },
}

/// Resolve a trove path under `root`; `..` components are refused
pub fn path_under_root(root: &Path, path: &str) -> Result<PathBuf> {
    let relative = Path::new(path.trim_start_matches('/'));
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(Error::ContractViolation(format!(
            "path {} escapes the install root",
            path
        )));
    }
    Ok(root.join(relative))
}

pub struct OwnershipJournal {
    backups: TempDir,
    entries: Vec<Entry>,
    reverted: bool,
}

impl OwnershipJournal {
    pub fn new() -> Result<Self> {
        Ok(Self {
            backups: TempDir::new()?,
            entries: Vec::new(),
            reverted: false,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Save the live file at `path` and remove it
    ///
    /// Directories are left alone.
    pub fn backup(&mut self, path: &Path) -> Result<()> {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.entries.push(Entry::Created {
                    path: path.to_path_buf(),
                });
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if meta.is_dir() {
            return Ok(());
        }

        if meta.file_type().is_symlink() {
            let target = fs::read_link(path)?;
            self.entries.push(Entry::Symlink {
                path: path.to_path_buf(),
                target,
            });
        } else {
            let backup = self.backups.path().join(self.entries.len().to_string());
            fs::copy(path, &backup)?;
            self.entries.push(Entry::File {
                path: path.to_path_buf(),
                backup,
                permissions: meta.permissions(),
            });
        }

        // a file that cannot be removed is still restored by revert
        if let Err(e) = fs::remove_file(path) {
            warn!("Could not remove {} after backup: {}", path.display(), e);
        }
        debug!("Journaled {}", path.display());
        Ok(())
    }

    /// Restore every journaled path, newest first
    pub fn revert(mut self) -> Result<()> {
        self.revert_entries()
    }

    fn revert_entries(&mut self) -> Result<()> {
        if self.reverted {
            return Ok(());
        }
        self.reverted = true;

        let mut first_error = None;
        for entry in self.entries.iter().rev() {
            if let Err(e) = restore(entry) {
                warn!("Failed to restore journaled path: {}", e);
                first_error.get_or_insert(e);
            }
        }
        debug!("Reverted {} journaled paths", self.entries.len());
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn restore(entry: &Entry) -> std::io::Result<()> {
    match entry {
        Entry::Created { path } => remove_if_exists(path),
        Entry::File {
            path,
            backup,
            permissions,
        } => {
            remove_if_exists(path)?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(backup, path)?;
            fs::set_permissions(path, permissions.clone())
        }
        Entry::Symlink { path, target } => {
            remove_if_exists(path)?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            symlink(target, path)
        }
    }
}

#[cfg(unix)]
fn symlink(target: &Path, path: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, path)
}

#[cfg(not(unix))]
fn symlink(target: &Path, path: &Path) -> std::io::Result<()> {
    fs::copy(target, path).map(|_| ())
}

impl Drop for OwnershipJournal {
    fn drop(&mut self) {
        if let Err(e) = self.revert_entries() {
            warn!("Ownership journal revert on drop failed: {}", e);
        }
    }
}
