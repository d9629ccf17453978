use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RevError {
    #[error("no such entry: {0}")]
    NotFound(String),

    #[error("is a directory: {0}")]
    IsDirectory(String),

    #[error("not a directory: {0}")]
    NotDirectory(String),

    #[error("mangled path too long for {0}")]
    NameTooLong(String),

    #[error("failed to clone {src:?} to {dst:?}")]
    CloneFailed { src: PathBuf, dst: PathBuf },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),
}

impl RevError {
    /// Positive errno for this error; the dispatcher negates it on the wire.
    /// Delegated syscall failures pass through verbatim.
    pub fn errno(&self) -> i32 {
        match self {
            RevError::NotFound(_) => libc::ENOENT,
            RevError::IsDirectory(_) => libc::EISDIR,
            RevError::NotDirectory(_) => libc::ENOTDIR,
            RevError::NameTooLong(_) => libc::ENAMETOOLONG,
            RevError::CloneFailed { .. } => libc::EIO,
            RevError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            RevError::Nix(e) => *e as i32,
        }
    }
}

pub type Result<T> = std::result::Result<T, RevError>;
