#![forbid(unsafe_code)]
//! mapfs command-line tool.
//!
//! `mkfs` creates an image, `mount` serves one through FUSE, and the
//! remaining subcommands operate on an image offline: load the file,
//! apply one operation through the core, write the file back. The image
//! bytes are the filesystem, so offline and mounted access see the same
//! tree.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mapfs_core::{MapFs, NodeKind};
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "mapfs", about = "mapfs — in-memory persistent filesystem toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a fresh filesystem image.
    Mkfs {
        /// Path of the image file to create.
        image: PathBuf,
        /// Region size in bytes.
        #[arg(long)]
        size: u64,
        /// Overwrite an existing image.
        #[arg(long)]
        force: bool,
    },
    /// Mount an image via FUSE (read-write); blocks until unmounted.
    Mount {
        /// Path to the image file.
        image: PathBuf,
        /// Mountpoint directory.
        mountpoint: PathBuf,
        /// Allow other users to access the mount.
        #[arg(long)]
        allow_other: bool,
    },
    /// List directory contents.
    Ls {
        image: PathBuf,
        path: String,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Show node attributes.
    Stat {
        image: PathBuf,
        path: String,
        #[arg(long)]
        json: bool,
    },
    /// Show filesystem usage.
    Df {
        image: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Create a directory.
    Mkdir { image: PathBuf, path: String },
    /// Create an empty file.
    Touch { image: PathBuf, path: String },
    /// Write a string into a file at an offset.
    Write {
        image: PathBuf,
        path: String,
        data: String,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Print file contents.
    Cat { image: PathBuf, path: String },
    /// Remove a file.
    Rm { image: PathBuf, path: String },
    /// Remove an empty directory.
    Rmdir { image: PathBuf, path: String },
    /// Rename or move a node.
    Mv {
        image: PathBuf,
        from: String,
        to: String,
    },
    /// Set a file's size exactly, zero-filling growth.
    Truncate {
        image: PathBuf,
        path: String,
        size: i64,
    },
}

// ── Image plumbing ──────────────────────────────────────────────────────────

fn load_image(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("failed to read image {}", path.display()))
}

fn save_image(path: &Path, image: &[u8]) -> Result<()> {
    fs::write(path, image).with_context(|| format!("failed to write image {}", path.display()))
}

/// Load the image, run one operation, write the image back.
fn with_image<T>(
    path: &Path,
    op: impl FnOnce(&mut MapFs) -> mapfs_core::Result<T>,
) -> Result<T> {
    let mut image = load_image(path)?;
    let out = op(&mut MapFs::new(&mut image))?;
    save_image(path, &image)?;
    Ok(out)
}

// ── Subcommands ─────────────────────────────────────────────────────────────

fn cmd_mkfs(image: &Path, size: u64, force: bool) -> Result<()> {
    if image.exists() && !force {
        bail!(
            "image {} already exists (pass --force to overwrite)",
            image.display()
        );
    }
    let mut region =
        vec![0u8; usize::try_from(size).context("image size does not fit this platform")?];
    mapfs_core::mount(&mut region)?;
    save_image(image, &region)?;
    println!("created {} ({size} bytes)", image.display());
    Ok(())
}

fn cmd_mount(image: &Path, mountpoint: &Path, allow_other: bool) -> Result<()> {
    let bytes = load_image(image)?;
    let fuse = mapfs_fuse::MapFuse::with_backing(bytes, image.to_path_buf());
    let options = mapfs_fuse::MountOptions {
        allow_other,
        ..mapfs_fuse::MountOptions::default()
    };
    mapfs_fuse::mount(fuse, mountpoint, &options)
        .with_context(|| format!("failed to mount {} at {}", image.display(), mountpoint.display()))
}

fn cmd_ls(image: &Path, path: &str, json: bool) -> Result<()> {
    let entries = with_image(image, |fs| fs.readdir(path))?;
    if json {
        let rows: Vec<serde_json::Value> = entries
            .iter()
            .map(|e| {
                serde_json::json!({
                    "name": e.name_str(),
                    "kind": match e.kind {
                        NodeKind::File => "file",
                        NodeKind::Directory => "directory",
                    },
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for e in &entries {
            let marker = match e.kind {
                NodeKind::File => '-',
                NodeKind::Directory => 'd',
            };
            println!("{marker} {}", e.name_str());
        }
    }
    Ok(())
}

fn cmd_stat(image: &Path, path: &str, json: bool) -> Result<()> {
    let attr = with_image(image, |fs| fs.getattr(0, 0, path))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&attr)?);
    } else {
        println!("path:  {path}");
        println!("kind:  {:?}", attr.kind);
        println!("mode:  {:o}", attr.mode);
        println!("nlink: {}", attr.nlink);
        println!("size:  {}", attr.size);
        println!("atime: {}.{:09}", attr.atime.sec, attr.atime.nsec);
        println!("mtime: {}.{:09}", attr.mtime.sec, attr.mtime.nsec);
    }
    Ok(())
}

fn cmd_df(image: &Path, json: bool) -> Result<()> {
    let stats = with_image(image, |fs| fs.statfs())?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("block size: {}", stats.block_size);
        println!("blocks:     {}", stats.blocks);
        println!("free:       {}", stats.blocks_free);
        println!("available:  {}", stats.blocks_avail);
        println!("name max:   {}", stats.name_max);
    }
    Ok(())
}

fn cmd_cat(image: &Path, path: &str) -> Result<()> {
    let data = with_image(image, |fs| {
        let size = fs.getattr(0, 0, path)?.size;
        fs.read(path, 0, usize::try_from(size).unwrap_or(usize::MAX))
    })?;
    std::io::stdout().write_all(&data)?;
    Ok(())
}

fn cmd_write(image: &Path, path: &str, data: &str, offset: i64) -> Result<()> {
    let written = with_image(image, |fs| fs.write(path, offset, data.as_bytes()))?;
    println!("wrote {written} bytes");
    Ok(())
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Mkfs { image, size, force } => cmd_mkfs(&image, size, force),
        Command::Mount {
            image,
            mountpoint,
            allow_other,
        } => cmd_mount(&image, &mountpoint, allow_other),
        Command::Ls { image, path, json } => cmd_ls(&image, &path, json),
        Command::Stat { image, path, json } => cmd_stat(&image, &path, json),
        Command::Df { image, json } => cmd_df(&image, json),
        Command::Mkdir { image, path } => with_image(&image, |fs| fs.mkdir(&path)),
        Command::Touch { image, path } => with_image(&image, |fs| fs.mknod(&path)),
        Command::Write {
            image,
            path,
            data,
            offset,
        } => cmd_write(&image, &path, &data, offset),
        Command::Cat { image, path } => cmd_cat(&image, &path),
        Command::Rm { image, path } => with_image(&image, |fs| fs.unlink(&path)),
        Command::Rmdir { image, path } => with_image(&image, |fs| fs.rmdir(&path)),
        Command::Mv { image, from, to } => with_image(&image, |fs| fs.rename(&from, &to)),
        Command::Truncate { image, path, size } => {
            with_image(&image, |fs| fs.truncate(&path, size))
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn image_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("test.mapfs")
    }

    #[test]
    fn mkfs_creates_initialised_image() {
        let dir = tempfile::tempdir().unwrap();
        let img = image_path(&dir);
        cmd_mkfs(&img, 64 * 1024, false).unwrap();

        let bytes = fs::read(&img).unwrap();
        assert_eq!(bytes.len(), 64 * 1024);
        // Magic is in place: a readdir works without re-initialising.
        let entries = with_image(&img, |fs| fs.readdir("/")).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn mkfs_refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let img = image_path(&dir);
        cmd_mkfs(&img, 64 * 1024, false).unwrap();
        assert!(cmd_mkfs(&img, 64 * 1024, false).is_err());
        cmd_mkfs(&img, 32 * 1024, true).unwrap();
        assert_eq!(fs::read(&img).unwrap().len(), 32 * 1024);
    }

    #[test]
    fn offline_ops_persist_across_invocations() {
        let dir = tempfile::tempdir().unwrap();
        let img = image_path(&dir);
        cmd_mkfs(&img, 256 * 1024, false).unwrap();

        // Each with_image call is a separate load/apply/save cycle, i.e. a
        // full unmount/remount between operations.
        with_image(&img, |fs| fs.mkdir("/docs")).unwrap();
        with_image(&img, |fs| fs.mknod("/docs/note.txt")).unwrap();
        with_image(&img, |fs| fs.write("/docs/note.txt", 0, b"remember me")).unwrap();

        let data = with_image(&img, |fs| fs.read("/docs/note.txt", 0, 64)).unwrap();
        assert_eq!(data, b"remember me");

        let entries = with_image(&img, |fs| fs.readdir("/docs")).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name_str(), "note.txt");

        with_image(&img, |fs| fs.rename("/docs/note.txt", "/note.txt")).unwrap();
        with_image(&img, |fs| fs.rmdir("/docs")).unwrap();
        let root = with_image(&img, |fs| fs.readdir("/")).unwrap();
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].name_str(), "note.txt");
    }

    #[test]
    fn stat_and_df_report_consistently() {
        let dir = tempfile::tempdir().unwrap();
        let img = image_path(&dir);
        cmd_mkfs(&img, 128 * 1024, false).unwrap();
        with_image(&img, |fs| fs.mknod("/a")).unwrap();
        with_image(&img, |fs| fs.truncate("/a", 10_000)).unwrap();

        let attr = with_image(&img, |fs| fs.getattr(0, 0, "/a")).unwrap();
        assert_eq!(attr.size, 10_000);

        let stats = with_image(&img, |fs| fs.statfs()).unwrap();
        assert_eq!(stats.blocks, 128);
        assert!(stats.blocks_free < 128 - 10); // ~10 KiB of data gone
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["mapfs", "mkfs", "img.mapfs", "--size", "1048576"]);
        assert!(cli.is_ok());
        let cli = Cli::try_parse_from(["mapfs", "ls", "img.mapfs", "/", "--json"]);
        assert!(matches!(
            cli.unwrap().command,
            Command::Ls { json: true, .. }
        ));
        let cli = Cli::try_parse_from(["mapfs", "write", "img.mapfs", "/f", "hi", "--offset", "5"]);
        assert!(matches!(
            cli.unwrap().command,
            Command::Write { offset: 5, .. }
        ));
        assert!(Cli::try_parse_from(["mapfs", "bogus"]).is_err());
    }
}
