//! Revision enumeration and allocation.
//!
//! Every write-producing operation lands in a fresh, monotonically numbered
//! revision file inside the node directory. Existing revisions are never
//! modified or removed, so numbering may become non-contiguous across
//! delete/undelete cycles but never moves backwards.

use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Result, RevError};
use crate::node;
use crate::store::RevStore;

impl RevStore {
    /// Highest revision number present in the node directory, or `None` when
    /// the node does not exist or holds no numeric entries. Non-numeric
    /// entries (markers, strays) are ignored.
    pub fn latest_version(&self, logical: &str) -> Result<Option<u64>> {
        let node = self.versiondir(logical)?;
        let entries = match std::fs::read_dir(&node) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                log::error!("failed to enumerate versions of {:?}: {}", logical, e);
                return Err(e.into());
            }
        };

        let mut max = None;
        for entry in entries {
            if let Ok(version) = entry?.file_name().to_string_lossy().parse::<u64>() {
                max = Some(max.map_or(version, |m: u64| m.max(version)));
            }
        }
        log::debug!("latest version of {:?} is {:?}", logical, max);
        Ok(max)
    }

    /// Physical path of the newest visible revision: the node directory for
    /// directory nodes, `node/<max>` for file nodes. For a tombstoned file
    /// the effective slot is `max + 1` (where the next write would land), so
    /// metadata fall-through finds nothing there.
    pub fn latest_path(&self, logical: &str) -> Result<PathBuf> {
        let node = self.versiondir(logical)?;
        if node::is_directory(&node) {
            return Ok(node);
        }
        match self.latest_version(logical)? {
            Some(version) => {
                let version = if node::is_deleted(&node) {
                    version + 1
                } else {
                    version
                };
                Ok(node.join(version.to_string()))
            }
            None => Err(RevError::NotFound(logical.to_string())),
        }
    }

    /// Destination for the next revision of a file.
    ///
    /// First-ever write creates the node directory and lands in revision 0.
    /// A write to a tombstoned file removes the tombstone and starts fresh at
    /// `max + 1` with no cloning. Otherwise the newest revision is cloned to
    /// `max + 1` so the caller's write sees copy-on-write semantics.
    pub fn new_path(&self, logical: &str) -> Result<PathBuf> {
        let node = self.versiondir(logical)?;
        if node::is_directory(&node) {
            log::debug!("requested a new version of {:?}, but this is a directory", logical);
            return Err(RevError::IsDirectory(logical.to_string()));
        }

        match self.latest_version(logical)? {
            None => {
                match DirBuilder::new().mode(0o700).create(&node) {
                    Ok(()) => {}
                    // An uninitialized node directory may already exist.
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                    Err(e) => {
                        log::error!("failed to create node directory {:?}: {}", node, e);
                        return Err(e.into());
                    }
                }
                Ok(node.join("0"))
            }
            Some(version) => {
                let next = node.join((version + 1).to_string());
                log::debug!("creating new version at {:?}", next);
                if node::is_deleted(&node) {
                    // Resurrection: continuity of the number line, fresh content.
                    node::undelete(&node)?;
                } else {
                    clone_file(&node.join(version.to_string()), &next)?;
                }
                Ok(next)
            }
        }
    }
}

/// Clone one revision file to the next, preserving mode, ownership,
/// timestamps, and extended attributes. Delegated to cp(1) in archive mode,
/// which already handles sparse files and metadata faithfully.
pub fn clone_file(src: &Path, dst: &Path) -> Result<()> {
    let status = Command::new("/bin/cp")
        .arg("-a")
        .arg(src)
        .arg(dst)
        .status()?;
    if !status.success() {
        log::error!("cp -a {:?} {:?} exited with {}", src, dst, status);
        return Err(RevError::CloneFailed {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
        });
    }
    Ok(())
}
