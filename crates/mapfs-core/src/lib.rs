#![forbid(unsafe_code)]
//! The mapfs core: superblock management and the thirteen filesystem
//! operations over a position-independent byte region.
//!
//! The region bytes ARE the filesystem. Everything inside is addressed by
//! offsets from the region base, so the same bytes re-attached anywhere
//! (or loaded into any buffer) read back as the identical tree. Hosts
//! hand [`MapFs`] a `&mut [u8]` and call one method per kernel request;
//! the host serialises calls, and every method runs to completion before
//! the next may begin.
//!
//! Errors map to POSIX codes through `MapFsError::to_errno` at the
//! FUSE/CLI boundary.

mod ops;
mod superblock;

pub use ops::MapFs;
pub use superblock::{mount, Superblock};

pub use mapfs_error::{MapFsError, Result};
pub use mapfs_types::{NodeKind, RegionOffset, TimeSpec};

use serde::Serialize;
use std::borrow::Cow;

// ── Reported modes ──────────────────────────────────────────────────────────
//
// Permission enforcement is out of scope; every node reports a fixed 0755.

pub const S_IFREG: u32 = 0o100_000;
pub const S_IFDIR: u32 = 0o040_000;
const PERM: u32 = 0o755;

#[must_use]
pub fn mode_for(kind: NodeKind) -> u32 {
    match kind {
        NodeKind::File => S_IFREG | PERM,
        NodeKind::Directory => S_IFDIR | PERM,
    }
}

// ── Value types returned by the operations ──────────────────────────────────

/// Attributes reported by `getattr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileAttr {
    pub kind: NodeKind,
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub atime: TimeSpec,
    pub mtime: TimeSpec,
    pub blksize: u32,
}

/// One `readdir` entry (the parent slot is never reported).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: Vec<u8>,
    pub kind: NodeKind,
}

impl DirEntry {
    /// Lossy UTF-8 view of the name for display and FUSE replies.
    #[must_use]
    pub fn name_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }
}

/// Filesystem usage reported by `statfs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FsStats {
    pub block_size: u32,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_avail: u64,
    pub name_max: u32,
}
