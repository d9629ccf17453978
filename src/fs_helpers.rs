use std::fs::{File, Metadata, OpenOptions};
use std::io;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use fuser::{FileAttr, FileType, TimeOrNow};
use nix::sys::stat::utimes;
use nix::sys::time::TimeVal;

use crate::error::Result;
use crate::fs::{RevFs, BLOCK_SIZE};

impl RevFs {
    pub(crate) fn make_attr(&self, ino: u64, path: &Path) -> Option<FileAttr> {
        let meta = std::fs::symlink_metadata(path).ok()?;
        Some(attr_from(ino, &meta))
    }

    /// Open a physical revision file with the bridge-supplied flags. The
    /// bridge never forwards creation or truncation flags; `create` covers
    /// the fresh-revision case where the destination does not exist yet.
    pub(crate) fn open_physical(path: &Path, flags: i32, create: bool) -> io::Result<File> {
        let mut opts = OpenOptions::new();
        match flags & libc::O_ACCMODE {
            libc::O_WRONLY => {
                opts.write(true);
            }
            libc::O_RDWR => {
                opts.read(true).write(true);
            }
            _ => {
                opts.read(true);
            }
        }
        if create {
            opts.create(true);
        }
        if flags & libc::O_APPEND != 0 {
            opts.append(true);
        }
        opts.open(path)
    }

    /// creat(2) semantics on the freshly allocated revision.
    pub(crate) fn create_physical(path: &Path, mode: u32, flags: i32) -> io::Result<File> {
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true).mode(mode);
        if flags & libc::O_ACCMODE == libc::O_RDWR {
            opts.read(true);
        }
        opts.open(path)
    }
}

pub(crate) fn attr_from(ino: u64, meta: &Metadata) -> FileAttr {
    FileAttr {
        ino,
        size: meta.len(),
        blocks: meta.len().div_ceil(u64::from(BLOCK_SIZE)),
        atime: meta.accessed().unwrap_or(UNIX_EPOCH),
        mtime: meta.modified().unwrap_or(UNIX_EPOCH),
        ctime: UNIX_EPOCH,
        crtime: UNIX_EPOCH,
        kind: kind_of(meta),
        perm: meta.permissions().mode() as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

fn kind_of(meta: &Metadata) -> FileType {
    match meta.mode() & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

pub(crate) fn io_errno(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

/// utimes(2) sets both timestamps at once, so an omitted side is re-applied
/// from the current metadata.
pub(crate) fn set_times(
    target: &Path,
    atime: Option<TimeOrNow>,
    mtime: Option<TimeOrNow>,
) -> Result<()> {
    let meta = std::fs::symlink_metadata(target)?;
    let atime = resolve_time(atime, meta.accessed()?);
    let mtime = resolve_time(mtime, meta.modified()?);
    utimes(target, &timeval(atime), &timeval(mtime))?;
    Ok(())
}

fn resolve_time(requested: Option<TimeOrNow>, current: SystemTime) -> SystemTime {
    match requested {
        Some(TimeOrNow::SpecificTime(t)) => t,
        Some(TimeOrNow::Now) => SystemTime::now(),
        None => current,
    }
}

fn timeval(t: SystemTime) -> TimeVal {
    let since_epoch = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    TimeVal::new(
        since_epoch.as_secs() as libc::time_t,
        since_epoch.subsec_micros() as libc::suseconds_t,
    )
}
