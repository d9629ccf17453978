use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use fuser::MountOption;

use revfs::{RevFs, RevStore};

#[derive(Parser)]
#[command(name = "revfs")]
#[command(about = "FUSE filesystem that keeps every revision of every file")]
struct Cli {
    /// Backing directory that stores all revisions and tombstones
    root: PathBuf,

    /// Mount point
    mountpoint: PathBuf,

    /// Allow other users to access the mount
    #[arg(long)]
    allow_other: bool,

    /// Unmount automatically when the process exits
    #[arg(long)]
    auto_unmount: bool,
}

/// Diagnostics go to `log.txt` at the backing root, next to the node tree.
/// Entries there never demangle, so they stay invisible to readdir.
fn init_logging(root: &Path) -> Result<()> {
    let logfile = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(root.join("log.txt"))
        .context("failed to open log file")?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(logfile)))
        .init();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    std::fs::create_dir_all(&cli.root)
        .with_context(|| format!("failed to create backing root {:?}", cli.root))?;
    let root = cli
        .root
        .canonicalize()
        .with_context(|| format!("failed to resolve backing root {:?}", cli.root))?;

    init_logging(&root)?;

    let mut options = vec![MountOption::FSName("revfs".to_string())];
    if cli.allow_other {
        options.push(MountOption::AllowOther);
    }
    if cli.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }

    let fs = RevFs::new(RevStore::new(root));
    fuser::mount2(fs, &cli.mountpoint, &options)
        .with_context(|| format!("failed to mount at {:?}", cli.mountpoint))?;

    Ok(())
}
