//! Marker files that classify a node directory.
//!
//! A node is a directory iff it holds a `dir` marker, and tombstoned iff it
//! holds a `deleted` marker. Both are empty regular files probed for
//! existence, never opened for reading.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;

pub const DIR_MARKER: &str = "dir";
pub const DELETED_MARKER: &str = "deleted";

/// A node represents a directory iff its `dir` marker exists.
pub fn is_directory(node: &Path) -> bool {
    node.join(DIR_MARKER).exists()
}

/// A node is tombstoned iff its `deleted` marker exists.
pub fn is_deleted(node: &Path) -> bool {
    node.join(DELETED_MARKER).exists()
}

/// Whether the node directory itself exists on the backing store.
pub fn exists(node: &Path) -> bool {
    node.is_dir()
}

/// Tombstone a node. Fails with `AlreadyExists` if it is already tombstoned;
/// callers decide whether that counts as success.
pub fn mark_deleted(node: &Path) -> io::Result<()> {
    touch(&node.join(DELETED_MARKER))
}

/// Remove a node's tombstone. Fails with `NotFound` if it has none.
pub fn undelete(node: &Path) -> io::Result<()> {
    std::fs::remove_file(node.join(DELETED_MARKER))
}

/// Create an empty marker file. Exclusive create, so two racing creators
/// collide at most once and exactly one of them wins.
pub fn touch(path: &Path) -> io::Result<()> {
    log::debug!("touch {:?}", path);
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn markers_classify_a_node() {
        let dir = TempDir::new().unwrap();
        let node = dir.path();

        assert!(exists(node));
        assert!(!is_directory(node));
        assert!(!is_deleted(node));

        touch(&node.join(DIR_MARKER)).unwrap();
        assert!(is_directory(node));

        mark_deleted(node).unwrap();
        assert!(is_deleted(node));

        undelete(node).unwrap();
        assert!(!is_deleted(node));
    }

    #[test]
    fn missing_node_is_nothing() {
        let node = Path::new("/nonexistent/revfs/node");
        assert!(!exists(node));
        assert!(!is_directory(node));
        assert!(!is_deleted(node));
    }

    #[test]
    fn second_tombstone_collides() {
        let dir = TempDir::new().unwrap();
        mark_deleted(dir.path()).unwrap();
        let err = mark_deleted(dir.path()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn undelete_without_tombstone_fails() {
        let dir = TempDir::new().unwrap();
        let err = undelete(dir.path()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
