//! The backing store: node classification and the compound path-level
//! operations the dispatcher is built from.
//!
//! A `RevStore` owns nothing but the backing-root path, fixed at mount time.
//! All state lives on the backing filesystem; synchronization piggybacks on
//! it (exclusive marker creation, atomic rename).

use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::sys::stat::{Mode, SFlag};

use crate::error::{Result, RevError};
use crate::mangle::{self, Demangled};
use crate::node;
use crate::revision::clone_file;

/// Where a logical path stands in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Absent,
    File { latest: u64, deleted: bool },
    Directory { deleted: bool },
}

/// One visible child of a directory node.
#[derive(Debug, Clone)]
pub struct ChildEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Join a child name onto a logical parent path.
pub fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

pub struct RevStore {
    root: PathBuf,
}

impl RevStore {
    /// `root` must be absolute; the launcher canonicalizes it.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Node directory for a logical path. Pure computation.
    pub fn versiondir(&self, logical: &str) -> Result<PathBuf> {
        mangle::versiondir(&self.root, logical)
    }

    /// Logical name for a physical path under the root.
    pub fn demangle(&self, physical: &Path) -> Demangled {
        mangle::demangle(&self.root, physical)
    }

    /// Classify a logical path. The root is always a directory even though
    /// the backing root carries no `dir` marker.
    pub fn classify(&self, logical: &str) -> Result<NodeState> {
        let node = self.versiondir(logical)?;
        if logical == "/" || node::is_directory(&node) {
            return Ok(NodeState::Directory {
                deleted: node::is_deleted(&node),
            });
        }
        match self.latest_version(logical)? {
            Some(latest) => Ok(NodeState::File {
                latest,
                deleted: node::is_deleted(&node),
            }),
            None => Ok(NodeState::Absent),
        }
    }

    /// Physical path to stat for attribute-style operations: the node
    /// directory for directories, the newest revision for files. Tombstoned
    /// nodes report not-found before any fall-through.
    pub fn stat_path(&self, logical: &str) -> Result<PathBuf> {
        let node = self.versiondir(logical)?;
        if logical == "/" {
            return Ok(node);
        }
        if node::is_deleted(&node) {
            return Err(RevError::NotFound(logical.to_string()));
        }
        if node::is_directory(&node) {
            return Ok(node);
        }
        self.latest_path(logical)
    }

    /// Tombstone a file node.
    pub fn unlink(&self, logical: &str) -> Result<()> {
        let node = self.versiondir(logical)?;
        if node::is_directory(&node) {
            log::debug!("cannot unlink {:?}, is a directory", logical);
            return Err(RevError::IsDirectory(logical.to_string()));
        }
        if node::is_deleted(&node) {
            log::debug!("already deleted {:?}", logical);
            return Err(RevError::NotFound(logical.to_string()));
        }
        node::mark_deleted(&node)?;
        Ok(())
    }

    /// Create a directory node, or revive a tombstoned one.
    ///
    /// Creating over an existing node (a live file or directory) fails with
    /// the EEXIST of the node-directory creation itself.
    pub fn mkdir(&self, logical: &str, mode: u32) -> Result<PathBuf> {
        let node = self.versiondir(logical)?;
        if node::is_deleted(&node) {
            node::undelete(&node)?;
            return Ok(node);
        }
        DirBuilder::new().mode(mode).create(&node)?;
        if let Err(e) = node::touch(&node.join(node::DIR_MARKER)) {
            // The empty node directory is left behind as an uninitialized
            // node; lookup and listing skip it.
            log::error!("could not create directory marker in {:?}: {}", node, e);
            return Err(e.into());
        }
        Ok(node)
    }

    /// Tombstone a directory node. Children are not checked; tombstoning the
    /// parent hides the whole subtree from lookup.
    pub fn rmdir(&self, logical: &str) -> Result<()> {
        let node = self.versiondir(logical)?;
        if !node::is_directory(&node) {
            return Err(RevError::NotDirectory(logical.to_string()));
        }
        if node::is_deleted(&node) {
            return Err(RevError::NotFound(logical.to_string()));
        }
        node::mark_deleted(&node)?;
        Ok(())
    }

    /// Move a logical path. Directories move their whole node (clobbering
    /// any destination node and its history); files are tombstoned at the
    /// source and their newest revision is cloned to a fresh revision at the
    /// destination.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let old_node = self.versiondir(old)?;
        let new_node = self.versiondir(new)?;

        if node::is_directory(&old_node) {
            if node::exists(&new_node) {
                log::warn!(
                    "rename {:?} -> {:?} overwrites the destination node, deleting all its history",
                    old,
                    new
                );
                std::fs::remove_dir_all(&new_node)?;
            }
            std::fs::rename(&old_node, &new_node)?;
            return Ok(());
        }

        let src = self.latest_path(old)?;
        let dst = self.new_path(new)?;
        self.unlink(old)?;
        if let Err(e) = clone_file(&src, &dst) {
            // Resurrect the source so it does not vanish on a failed move.
            let _ = node::undelete(&old_node);
            return Err(e);
        }
        Ok(())
    }

    /// Hard-link the newest revision of `old` into a fresh revision of `new`.
    pub fn link(&self, old: &str, new: &str) -> Result<PathBuf> {
        let old_node = self.versiondir(old)?;
        if node::is_directory(&old_node) {
            return Err(RevError::IsDirectory(old.to_string()));
        }
        let src = self.latest_path(old)?;
        let dst = self.new_path(new)?;
        std::fs::hard_link(&src, &dst)?;
        Ok(dst)
    }

    /// Store `target` verbatim as a symlink in a fresh revision of
    /// `linkpath`. `new_path` rejects directory nodes.
    pub fn symlink(&self, target: &Path, linkpath: &str) -> Result<PathBuf> {
        let dst = self.new_path(linkpath)?;
        std::os::unix::fs::symlink(target, &dst)?;
        Ok(dst)
    }

    /// Create a regular file, FIFO, or special node in a fresh revision.
    pub fn mknod(&self, logical: &str, mode: u32, rdev: u64) -> Result<PathBuf> {
        let dst = self.new_path(logical)?;
        let kind = mode & libc::S_IFMT;
        let perm = Mode::from_bits_truncate(mode & 0o7777);
        if kind == 0 || kind == libc::S_IFREG {
            std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(mode & 0o7777)
                .open(&dst)?;
        } else if kind == libc::S_IFIFO {
            nix::unistd::mkfifo(&dst, perm)?;
        } else {
            nix::sys::stat::mknod(
                &dst,
                SFlag::from_bits_truncate(kind),
                perm,
                rdev as libc::dev_t,
            )?;
        }
        Ok(dst)
    }

    /// Truncate the newest revision in place. Earlier revisions stay frozen.
    pub fn truncate(&self, logical: &str, size: u64) -> Result<()> {
        let node = self.versiondir(logical)?;
        if node::is_directory(&node) {
            return Err(RevError::IsDirectory(logical.to_string()));
        }
        let latest = self.latest_path(logical)?;
        nix::unistd::truncate(&latest, size as libc::off_t)?;
        Ok(())
    }

    /// Visible children of a directory node, demangled. Tombstoned children,
    /// markers, revision files, and stray unmangled entries are all skipped.
    pub fn list_dir(&self, logical: &str) -> Result<Vec<ChildEntry>> {
        let node = self.versiondir(logical)?;
        let mut children = Vec::new();
        for entry in std::fs::read_dir(&node)? {
            let entry = entry?;
            let child_node = entry.path();
            let demangled = self.demangle(&child_node);
            if !demangled.well_formed {
                continue;
            }
            let name = match demangled.clean.rsplit('/').next() {
                Some(n) if !n.is_empty() => n.to_string(),
                _ => continue,
            };

            if node::is_directory(&child_node) {
                if !node::is_deleted(&child_node) {
                    children.push(ChildEntry { name, is_dir: true });
                }
            } else {
                let child_logical = child_path(logical, &name);
                match self.latest_path(&child_logical) {
                    Ok(latest) if std::fs::symlink_metadata(&latest).is_ok() => {
                        children.push(ChildEntry { name, is_dir: false });
                    }
                    _ => {
                        log::debug!(
                            "skipping {:?} in {:?}: neither a live directory nor a live file",
                            name,
                            logical
                        );
                    }
                }
            }
        }
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (RevStore, TempDir) {
        let dir = TempDir::new().unwrap();
        (RevStore::new(dir.path().to_path_buf()), dir)
    }

    fn write_new(store: &RevStore, logical: &str, content: &[u8]) {
        let dst = store.new_path(logical).unwrap();
        std::fs::write(dst, content).unwrap();
    }

    #[test]
    fn root_is_always_a_directory() {
        let (store, _dir) = store();
        assert_eq!(
            store.classify("/").unwrap(),
            NodeState::Directory { deleted: false }
        );
        assert!(store.stat_path("/").unwrap().is_dir());
    }

    #[test]
    fn file_lifecycle_states() {
        let (store, _dir) = store();
        assert_eq!(store.classify("/a").unwrap(), NodeState::Absent);

        write_new(&store, "/a", b"v0");
        assert_eq!(
            store.classify("/a").unwrap(),
            NodeState::File { latest: 0, deleted: false }
        );

        store.unlink("/a").unwrap();
        assert_eq!(
            store.classify("/a").unwrap(),
            NodeState::File { latest: 0, deleted: true }
        );

        write_new(&store, "/a", b"v1");
        assert_eq!(
            store.classify("/a").unwrap(),
            NodeState::File { latest: 1, deleted: false }
        );
    }

    #[test]
    fn unlink_rejects_directories_and_tombstones() {
        let (store, _dir) = store();
        store.mkdir("/d", 0o755).unwrap();
        assert!(matches!(store.unlink("/d"), Err(RevError::IsDirectory(_))));

        write_new(&store, "/a", b"x");
        store.unlink("/a").unwrap();
        assert!(matches!(store.unlink("/a"), Err(RevError::NotFound(_))));
    }

    #[test]
    fn mkdir_creates_marker_and_revives_tombstones() {
        let (store, _dir) = store();
        let node = store.mkdir("/d", 0o755).unwrap();
        assert!(node::is_directory(&node));

        store.rmdir("/d").unwrap();
        assert!(node::is_deleted(&node));
        assert!(matches!(store.rmdir("/d"), Err(RevError::NotFound(_))));

        // mkdir over the tombstoned directory revives it.
        store.mkdir("/d", 0o755).unwrap();
        assert!(!node::is_deleted(&node));
        assert!(node::is_directory(&node));
    }

    #[test]
    fn mkdir_over_live_node_fails_exists() {
        let (store, _dir) = store();
        store.mkdir("/d", 0o755).unwrap();
        let err = store.mkdir("/d", 0o755).unwrap_err();
        assert_eq!(err.errno(), libc::EEXIST);
    }

    #[test]
    fn rmdir_rejects_files() {
        let (store, _dir) = store();
        write_new(&store, "/a", b"x");
        assert!(matches!(store.rmdir("/a"), Err(RevError::NotDirectory(_))));
    }

    #[test]
    fn rename_file_keeps_destination_history() {
        let (store, _dir) = store();
        write_new(&store, "/a", b"A");
        write_new(&store, "/b", b"B");

        store.rename("/a", "/b").unwrap();

        // Source is tombstoned, not erased.
        assert_eq!(
            store.classify("/a").unwrap(),
            NodeState::File { latest: 0, deleted: true }
        );
        // Destination gained a revision holding the source content.
        let latest = store.latest_path("/b").unwrap();
        assert_eq!(std::fs::read(&latest).unwrap(), b"A");
        let first = store.versiondir("/b").unwrap().join("0");
        assert_eq!(std::fs::read(&first).unwrap(), b"B");
    }

    #[test]
    fn rename_directory_moves_the_node() {
        let (store, _dir) = store();
        store.mkdir("/d", 0o755).unwrap();
        write_new(&store, "/d/f", b"x");

        store.rename("/d", "/e").unwrap();
        assert_eq!(store.classify("/d").unwrap(), NodeState::Absent);
        assert_eq!(
            store.classify("/e").unwrap(),
            NodeState::Directory { deleted: false }
        );
        assert_eq!(
            std::fs::read(store.latest_path("/e/f").unwrap()).unwrap(),
            b"x"
        );
    }

    #[test]
    fn link_shares_content_with_fresh_revision() {
        let (store, _dir) = store();
        write_new(&store, "/a", b"shared");
        store.link("/a", "/b").unwrap();
        assert_eq!(
            std::fs::read(store.latest_path("/b").unwrap()).unwrap(),
            b"shared"
        );
    }

    #[test]
    fn symlink_stores_target_verbatim() {
        let (store, _dir) = store();
        let dst = store.symlink(Path::new("../somewhere"), "/l").unwrap();
        assert_eq!(
            std::fs::read_link(&dst).unwrap(),
            PathBuf::from("../somewhere")
        );
    }

    #[test]
    fn symlink_over_directory_node_is_rejected() {
        let (store, _dir) = store();
        store.mkdir("/d", 0o755).unwrap();
        assert!(matches!(
            store.symlink(Path::new("t"), "/d"),
            Err(RevError::IsDirectory(_))
        ));
    }

    #[test]
    fn truncate_touches_only_the_latest_revision() {
        let (store, _dir) = store();
        write_new(&store, "/a", b"first");
        write_new(&store, "/a", b"second!");

        store.truncate("/a", 3).unwrap();

        let node = store.versiondir("/a").unwrap();
        assert_eq!(std::fs::read(node.join("0")).unwrap(), b"first");
        assert_eq!(std::fs::read(node.join("1")).unwrap(), b"sec");
    }

    #[test]
    fn list_dir_filters_tombstones_and_strays() {
        let (store, dir) = store();
        store.mkdir("/d", 0o755).unwrap();
        write_new(&store, "/d/live", b"x");
        write_new(&store, "/d/dead", b"x");
        store.unlink("/d/dead").unwrap();
        store.mkdir("/d/sub", 0o755).unwrap();

        // A stray unmangled file placed by hand must be skipped.
        std::fs::write(dir.path().join("d.node/stray.txt"), b"junk").unwrap();

        let mut names: Vec<String> = store
            .list_dir("/d")
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        names.sort();
        assert_eq!(names, ["live", "sub"]);
    }

    #[test]
    fn list_dir_on_empty_directory_is_empty() {
        let (store, _dir) = store();
        store.mkdir("/d", 0o755).unwrap();
        assert!(store.list_dir("/d").unwrap().is_empty());
    }
}
