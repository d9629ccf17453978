use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

pub const ROOT_INO: u64 = 1;

/// Bidirectional inode <-> logical-path table.
///
/// The kernel addresses us by inode number while the store is addressed by
/// logical path; this table is the only glue between the two. Entries are
/// dropped on unlink/rename and re-created on the next lookup.
pub struct InodeManager {
    next_ino: AtomicU64,
    path_to_ino: RwLock<HashMap<String, u64>>,
    ino_to_path: RwLock<HashMap<u64, String>>,
}

impl InodeManager {
    pub fn new() -> Self {
        let mut path_to_ino = HashMap::new();
        let mut ino_to_path = HashMap::new();

        path_to_ino.insert("/".to_string(), ROOT_INO);
        ino_to_path.insert(ROOT_INO, "/".to_string());

        Self {
            next_ino: AtomicU64::new(ROOT_INO + 1),
            path_to_ino: RwLock::new(path_to_ino),
            ino_to_path: RwLock::new(ino_to_path),
        }
    }

    pub fn get_or_create(&self, path: &str) -> u64 {
        {
            let map = self.path_to_ino.read();
            if let Some(&ino) = map.get(path) {
                return ino;
            }
        }

        let mut path_map = self.path_to_ino.write();
        let mut ino_map = self.ino_to_path.write();

        if let Some(&ino) = path_map.get(path) {
            return ino;
        }

        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        path_map.insert(path.to_string(), ino);
        ino_map.insert(ino, path.to_string());
        ino
    }

    pub fn get_path(&self, ino: u64) -> Option<String> {
        self.ino_to_path.read().get(&ino).cloned()
    }

    pub fn remove(&self, path: &str) {
        let mut path_map = self.path_to_ino.write();
        let mut ino_map = self.ino_to_path.write();

        if let Some(ino) = path_map.remove(path) {
            ino_map.remove(&ino);
        }
    }

    /// Remove a path and every path beneath it. Used after rename and rmdir,
    /// where descendants' cached mappings go stale; the kernel re-looks-up
    /// what it still needs.
    pub fn remove_subtree(&self, path: &str) {
        let mut path_map = self.path_to_ino.write();
        let mut ino_map = self.ino_to_path.write();

        let prefix = format!("{}/", path.trim_end_matches('/'));
        let to_remove: Vec<String> = path_map
            .keys()
            .filter(|p| *p == path || p.starts_with(&prefix))
            .cloned()
            .collect();

        for stale in to_remove {
            if let Some(ino) = path_map.remove(&stale) {
                ino_map.remove(&ino);
            }
        }
    }
}

impl Default for InodeManager {
    fn default() -> Self {
        Self::new()
    }
}
