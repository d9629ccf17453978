use std::collections::HashMap;
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Open-file table. The bridge owns descriptors through the opaque `fh`
/// slot; `release` is the only place an entry is dropped, so no descriptor
/// outlives its open/release bracket.
pub struct HandleTable {
    next_fh: AtomicU64,
    files: RwLock<HashMap<u64, Arc<File>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            files: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, file: File) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.files.write().insert(fh, Arc::new(file));
        fh
    }

    pub fn get(&self, fh: u64) -> Option<Arc<File>> {
        self.files.read().get(&fh).cloned()
    }

    pub fn remove(&self, fh: u64) -> Option<Arc<File>> {
        self.files.write().remove(&fh)
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_unique_and_removable() {
        let table = HandleTable::new();
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();

        let a = table.insert(File::open(&path).unwrap());
        let b = table.insert(File::open(&path).unwrap());
        assert_ne!(a, b);

        assert!(table.get(a).is_some());
        assert!(table.remove(a).is_some());
        assert!(table.get(a).is_none());
        assert!(table.get(b).is_some());
    }
}
