use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::time::{Duration, SystemTime};

use fuser::{
    FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use nix::unistd::AccessFlags;

use crate::error::RevError;
use crate::fs_helpers::{attr_from, io_errno, set_times};
use crate::handle::HandleTable;
use crate::inode::InodeManager;
use crate::store::{child_path, NodeState, RevStore};

// Zero TTL forces the kernel to revalidate every lookup. The backing tree is
// the only source of truth, so nothing may be cached across operations.
pub(crate) const TTL: Duration = Duration::from_secs(0);
pub(crate) const BLOCK_SIZE: u32 = 512;

pub struct RevFs {
    pub(crate) store: RevStore,
    pub(crate) inodes: InodeManager,
    pub(crate) handles: HandleTable,
}

impl RevFs {
    pub fn new(store: RevStore) -> Self {
        Self {
            store,
            inodes: InodeManager::new(),
            handles: HandleTable::new(),
        }
    }
}

impl Filesystem for RevFs {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        log::info!("revfs mounted over {:?}", self.store.root());
        Ok(())
    }

    fn destroy(&mut self) {
        log::info!("revfs unmounting");
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let parent_path = match self.inodes.get_path(parent) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let path = child_path(&parent_path, &name.to_string_lossy());

        let fpath = match self.store.stat_path(&path) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        match std::fs::symlink_metadata(&fpath) {
            Ok(meta) => {
                let ino = self.inodes.get_or_create(&path);
                reply.entry(&TTL, &attr_from(ino, &meta), 0);
            }
            Err(e) => reply.error(io_errno(&e)),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        // Descriptor-based getattr goes straight to the open handle.
        if let Some(file) = fh.and_then(|fh| self.handles.get(fh)) {
            match file.metadata() {
                Ok(meta) => reply.attr(&TTL, &attr_from(ino, &meta)),
                Err(e) => reply.error(io_errno(&e)),
            }
            return;
        }

        let path = match self.inodes.get_path(ino) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        match self.store.stat_path(&path) {
            Ok(fpath) => match self.make_attr(ino, &fpath) {
                Some(attr) => reply.attr(&TTL, &attr),
                None => reply.error(libc::ENOENT),
            },
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.inodes.get_path(ino) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        // Directories are mutated on the node itself, files only on their
        // newest revision; older revisions stay frozen.
        let target = match self.store.stat_path(&path) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                std::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))
            {
                log::error!("failed to change permissions of {:?}: {}", path, e);
                reply.error(io_errno(&e));
                return;
            }
        }

        if uid.is_some() || gid.is_some() {
            if let Err(e) = std::os::unix::fs::chown(&target, uid, gid) {
                log::error!("failed to chown {:?}: {}", path, e);
                reply.error(io_errno(&e));
                return;
            }
        }

        if let Some(size) = size {
            let truncated = match fh.and_then(|fh| self.handles.get(fh)) {
                Some(file) => file.set_len(size).map_err(RevError::from),
                None => self.store.truncate(&path, size),
            };
            if let Err(e) = truncated {
                log::error!("failed to truncate {:?} to {}: {}", path, size, e);
                reply.error(e.errno());
                return;
            }
        }

        if atime.is_some() || mtime.is_some() {
            if let Err(e) = set_times(&target, atime, mtime) {
                log::error!("failed to change timestamps of {:?}: {}", path, e);
                reply.error(e.errno());
                return;
            }
        }

        match self.make_attr(ino, &target) {
            Some(attr) => reply.attr(&TTL, &attr),
            None => reply.error(libc::ENOENT),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let path = match self.inodes.get_path(ino) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        let target = self
            .store
            .latest_path(&path)
            .and_then(|p| std::fs::read_link(&p).map_err(RevError::from));
        match target {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let parent_path = match self.inodes.get_path(parent) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let path = child_path(&parent_path, &name.to_string_lossy());

        match self.store.mknod(&path, mode, u64::from(rdev)) {
            Ok(dst) => {
                let ino = self.inodes.get_or_create(&path);
                match self.make_attr(ino, &dst) {
                    Some(attr) => reply.entry(&TTL, &attr, 0),
                    None => reply.error(libc::EIO),
                }
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let parent_path = match self.inodes.get_path(parent) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let path = child_path(&parent_path, &name.to_string_lossy());

        match self.store.mkdir(&path, mode) {
            Ok(node) => {
                let ino = self.inodes.get_or_create(&path);
                match self.make_attr(ino, &node) {
                    Some(attr) => reply.entry(&TTL, &attr, 0),
                    None => reply.error(libc::EIO),
                }
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let parent_path = match self.inodes.get_path(parent) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let path = child_path(&parent_path, &name.to_string_lossy());

        match self.store.unlink(&path) {
            Ok(()) => {
                self.inodes.remove(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let parent_path = match self.inodes.get_path(parent) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let path = child_path(&parent_path, &name.to_string_lossy());

        match self.store.rmdir(&path) {
            Ok(()) => {
                self.inodes.remove_subtree(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let parent_path = match self.inodes.get_path(parent) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let path = child_path(&parent_path, &link_name.to_string_lossy());

        match self.store.symlink(target, &path) {
            Ok(dst) => {
                let ino = self.inodes.get_or_create(&path);
                match self.make_attr(ino, &dst) {
                    Some(attr) => reply.entry(&TTL, &attr, 0),
                    None => reply.error(libc::EIO),
                }
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (parent_path, newparent_path) = match (
            self.inodes.get_path(parent),
            self.inodes.get_path(newparent),
        ) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let old = child_path(&parent_path, &name.to_string_lossy());
        let new = child_path(&newparent_path, &newname.to_string_lossy());

        match self.store.rename(&old, &new) {
            Ok(()) => {
                self.inodes.remove_subtree(&old);
                self.inodes.remove_subtree(&new);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let (old, newparent_path) = match (
            self.inodes.get_path(ino),
            self.inodes.get_path(newparent),
        ) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let new = child_path(&newparent_path, &newname.to_string_lossy());

        match self.store.link(&old, &new) {
            Ok(dst) => {
                let new_ino = self.inodes.get_or_create(&new);
                match self.make_attr(new_ino, &dst) {
                    Some(attr) => reply.entry(&TTL, &attr, 0),
                    None => reply.error(libc::EIO),
                }
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.inodes.get_path(ino) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        // A write-capable open allocates the next revision up front; the
        // revision exists from open time, not from the first write.
        let write = flags & libc::O_ACCMODE != libc::O_RDONLY;
        let resolved = if write {
            self.store.new_path(&path)
        } else {
            self.store.latest_path(&path)
        };

        match resolved {
            Ok(fpath) => {
                log::debug!("opening {:?} for {:?}", fpath, path);
                match Self::open_physical(&fpath, flags, write) {
                    Ok(file) => {
                        let fh = self.handles.insert(file);
                        reply.opened(fh, 0);
                    }
                    Err(e) => {
                        log::error!("open of {:?} failed: {}", fpath, e);
                        reply.error(io_errno(&e));
                    }
                }
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let parent_path = match self.inodes.get_path(parent) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };
        let path = child_path(&parent_path, &name.to_string_lossy());

        let dst = match self.store.new_path(&path) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        match Self::create_physical(&dst, mode, flags) {
            Ok(file) => match file.metadata() {
                Ok(meta) => {
                    let ino = self.inodes.get_or_create(&path);
                    let fh = self.handles.insert(file);
                    reply.created(&TTL, &attr_from(ino, &meta), 0, fh, 0);
                }
                Err(e) => reply.error(io_errno(&e)),
            },
            Err(e) => {
                log::error!("failed to create file at {:?}: {}", dst, e);
                reply.error(io_errno(&e));
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyData,
    ) {
        let file = match self.handles.get(fh) {
            Some(f) => f,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };

        let mut buf = vec![0u8; size as usize];
        match file.read_at(&mut buf, offset as u64) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(io_errno(&e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let file = match self.handles.get(fh) {
            Some(f) => f,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };

        match file.write_at(data, offset as u64) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(io_errno(&e)),
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        // Dropping the handle closes the descriptor.
        self.handles.remove(fh);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let file = match self.handles.get(fh) {
            Some(f) => f,
            None => {
                reply.error(libc::EBADF);
                return;
            }
        };

        let synced = if datasync {
            file.sync_data()
        } else {
            file.sync_all()
        };
        match synced {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(io_errno(&e)),
        }
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = match self.inodes.get_path(ino) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        match self.store.classify(&path) {
            Ok(NodeState::Directory { .. }) => reply.opened(0, 0),
            Ok(_) => {
                log::debug!("tried to open {:?} as a directory", path);
                reply.error(libc::ENOTDIR);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.inodes.get_path(ino) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        let children = match self.store.list_dir(&path) {
            Ok(c) => c,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        let mut entries = vec![
            (ino, FileType::Directory, ".".to_string()),
            (ino, FileType::Directory, "..".to_string()),
        ];
        for child in children {
            let child_logical = child_path(&path, &child.name);
            let child_ino = self.inodes.get_or_create(&child_logical);
            let kind = if child.is_dir {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            entries.push((child_ino, kind, child.name));
        }

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            // A full reply buffer ends this batch; the kernel resumes at the
            // next offset.
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }

        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsyncdir(
        &mut self,
        _req: &Request,
        _ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
        let path = match self.inodes.get_path(ino) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        let fpath = match self.store.stat_path(&path) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        match nix::sys::statvfs::statvfs(&fpath) {
            Ok(st) => reply.statfs(
                st.blocks() as u64,
                st.blocks_free() as u64,
                st.blocks_available() as u64,
                st.files() as u64,
                st.files_free() as u64,
                st.block_size() as u32,
                st.name_max() as u32,
                st.fragment_size() as u32,
            ),
            Err(e) => reply.error(e as i32),
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        let path = match self.inodes.get_path(ino) {
            Some(p) => p,
            None => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        let fpath = match self.store.stat_path(&path) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        match nix::unistd::access(&fpath, AccessFlags::from_bits_truncate(mask)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e as i32),
        }
    }
}
