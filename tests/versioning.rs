//! End-to-end lifecycle scenarios driven at the store level, each against a
//! fresh backing root.

use std::collections::BTreeSet;
use std::path::Path;

use revfs::{NodeState, RevError, RevStore};
use tempfile::TempDir;

fn store() -> (RevStore, TempDir) {
    let dir = TempDir::new().unwrap();
    (RevStore::new(dir.path().to_path_buf()), dir)
}

/// The dispatcher's create path: allocate the next revision, then create
/// and truncate it with the client's content.
fn create(store: &RevStore, logical: &str, content: &[u8]) {
    let dst = store.new_path(logical).unwrap();
    std::fs::write(dst, content).unwrap();
}

/// Read through the newest visible revision.
fn read(store: &RevStore, logical: &str) -> Vec<u8> {
    std::fs::read(store.latest_path(logical).unwrap()).unwrap()
}

/// Numeric revision names present under a node directory.
fn revisions(root: &Path, mangled: &str) -> BTreeSet<u64> {
    std::fs::read_dir(root.join(mangled))
        .unwrap()
        .filter_map(|e| e.unwrap().file_name().to_string_lossy().parse().ok())
        .collect()
}

#[test]
fn create_write_read() {
    let (store, dir) = store();
    create(&store, "/a", b"hello");

    assert_eq!(read(&store, "/a"), b"hello");
    assert_eq!(
        std::fs::read(dir.path().join("a.node/0")).unwrap(),
        b"hello"
    );
}

#[test]
fn copy_on_write_preserves_history() {
    let (store, dir) = store();
    create(&store, "/a", b"v0");
    create(&store, "/a", b"v1");

    assert_eq!(std::fs::read(dir.path().join("a.node/0")).unwrap(), b"v0");
    assert_eq!(std::fs::read(dir.path().join("a.node/1")).unwrap(), b"v1");
    assert_eq!(read(&store, "/a"), b"v1");
}

#[test]
fn every_write_grows_the_revision_set() {
    let (store, dir) = store();
    for i in 0..5u32 {
        let before = if i == 0 {
            BTreeSet::new()
        } else {
            revisions(dir.path(), "a.node")
        };
        create(&store, "/a", format!("rev {i}").as_bytes());
        let after = revisions(dir.path(), "a.node");

        assert_eq!(after.len(), before.len() + 1);
        let newest = *after.iter().max().unwrap();
        assert!(before.iter().all(|&old| newest > old));
    }
}

#[test]
fn soft_delete_tombstones_without_erasing() {
    let (store, dir) = store();
    create(&store, "/a", b"kept");
    store.unlink("/a").unwrap();

    assert!(matches!(store.stat_path("/a"), Err(RevError::NotFound(_))));
    assert!(dir.path().join("a.node/0").exists());
    assert!(dir.path().join("a.node/deleted").exists());
}

#[test]
fn unlinked_file_disappears_from_its_parent_listing() {
    let (store, _dir) = store();
    store.mkdir("/d", 0o755).unwrap();
    create(&store, "/d/f", b"x");
    assert_eq!(store.list_dir("/d").unwrap().len(), 1);

    store.unlink("/d/f").unwrap();
    assert!(store.list_dir("/d").unwrap().is_empty());
}

#[test]
fn rewrite_after_delete_resurrects_with_fresh_content() {
    let (store, dir) = store();
    create(&store, "/a", b"old content");
    let before = revisions(dir.path(), "a.node").len();
    store.unlink("/a").unwrap();

    create(&store, "/a", b"new");

    assert!(!dir.path().join("a.node/deleted").exists());
    assert!(dir.path().join("a.node/1").exists());
    assert_eq!(read(&store, "/a"), b"new");
    assert_eq!(revisions(dir.path(), "a.node").len(), before + 1);
}

#[test]
fn directory_creation_and_listing() {
    let (store, dir) = store();
    store.mkdir("/d", 0o755).unwrap();
    create(&store, "/d/f", b"x");

    let names: Vec<String> = store
        .list_dir("/d")
        .unwrap()
        .into_iter()
        .map(|c| c.name)
        .collect();
    assert_eq!(names, ["f"]);

    assert!(dir.path().join("d.node/dir").exists());
    assert!(dir.path().join("d.node/f.node/0").exists());
}

#[test]
fn rename_over_existing_file_keeps_its_history() {
    let (store, dir) = store();
    create(&store, "/a", b"A");
    create(&store, "/b", b"B");

    store.rename("/a", "/b").unwrap();

    assert_eq!(read(&store, "/b"), b"A");
    assert!(matches!(store.stat_path("/a"), Err(RevError::NotFound(_))));
    assert_eq!(std::fs::read(dir.path().join("b.node/0")).unwrap(), b"B");
    assert!(dir.path().join("a.node/deleted").exists());
}

#[test]
fn clones_are_seeded_from_the_previous_revision() {
    let (store, _dir) = store();
    create(&store, "/a", b"generation 0");

    // The freshly allocated revision must be a bytewise copy of its
    // predecessor before the caller writes anything.
    let next = store.new_path("/a").unwrap();
    assert_eq!(std::fs::read(&next).unwrap(), b"generation 0");
}

#[test]
fn directory_and_file_states_stay_disjoint() {
    let (store, dir) = store();
    store.mkdir("/d", 0o755).unwrap();
    create(&store, "/f", b"x");
    store.unlink("/f").unwrap();
    create(&store, "/f", b"y");
    store.rmdir("/d").unwrap();
    store.mkdir("/d", 0o755).unwrap();

    // A directory node never gains revisions; a file node never gains a
    // directory marker.
    assert!(revisions(dir.path(), "d.node").is_empty());
    assert!(!dir.path().join("f.node/dir").exists());
    assert!(matches!(
        store.classify("/d").unwrap(),
        NodeState::Directory { deleted: false }
    ));
    assert!(matches!(
        store.classify("/f").unwrap(),
        NodeState::File { deleted: false, .. }
    ));

    // And the transitions between the two kinds are refused.
    assert!(matches!(store.new_path("/d"), Err(RevError::IsDirectory(_))));
    assert_eq!(store.mkdir("/f", 0o755).unwrap_err().errno(), libc::EEXIST);
}

#[test]
fn deep_paths_nest_mangled_nodes() {
    let (store, dir) = store();
    store.mkdir("/a", 0o755).unwrap();
    store.mkdir("/a/b", 0o755).unwrap();
    create(&store, "/a/b/c.txt", b"deep");

    assert_eq!(
        std::fs::read(dir.path().join("a.node/b.node/c.txt.node/0")).unwrap(),
        b"deep"
    );
    assert_eq!(read(&store, "/a/b/c.txt"), b"deep");
}
