#![forbid(unsafe_code)]
//! Region offsets, field codecs, and the on-region layout constants.
//!
//! Everything that lives inside a mapfs region is addressed by a byte
//! offset from the region base; offset 0 is the null reference. This crate
//! owns the offset newtype, the bounds-checked little-endian field codecs
//! every other crate reads and writes the region through, and the layout
//! constants that define the on-region format. Changing any layout
//! constant is a format change and requires a new magic number.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};
use thiserror::Error;

// ── Format constants ────────────────────────────────────────────────────────

/// Magic number marking an initialised region.
pub const MAGIC: u32 = 0x0ADD_BEEF;

/// Superblock field offsets (region offset 0).
pub const SUPERBLOCK_MAGIC_OFFSET: u64 = 0x00;
pub const SUPERBLOCK_SIZE_OFFSET: u64 = 0x08;
pub const SUPERBLOCK_ROOT_OFFSET: u64 = 0x10;
pub const SUPERBLOCK_FREE_HEAD_OFFSET: u64 = 0x18;
/// Total superblock size in bytes.
pub const SUPERBLOCK_SIZE: u64 = 32;

/// The root inode sits directly after the superblock and is never freed.
pub const ROOT_INODE_OFFSET: u64 = SUPERBLOCK_SIZE;

/// Name buffer size inside an inode (NUL-terminated).
pub const NAME_BUF_SIZE: u64 = 256;
/// Maximum name length in bytes (the buffer keeps one NUL).
pub const NAME_MAX: usize = 255;

/// Inode field offsets, relative to the inode record.
pub const INODE_NAME_OFFSET: u64 = 0x000;
pub const INODE_ATIME_SEC_OFFSET: u64 = 0x100;
pub const INODE_MTIME_SEC_OFFSET: u64 = 0x108;
pub const INODE_ATIME_NSEC_OFFSET: u64 = 0x110;
pub const INODE_MTIME_NSEC_OFFSET: u64 = 0x114;
pub const INODE_KIND_OFFSET: u64 = 0x118;
pub const INODE_BODY_WORD0_OFFSET: u64 = 0x120;
pub const INODE_BODY_WORD1_OFFSET: u64 = 0x128;
/// Total inode record size in bytes.
pub const INODE_SIZE: u64 = 0x130;

/// File block header field offsets, relative to the header.
pub const FILE_BLOCK_CAPACITY_OFFSET: u64 = 0x00;
pub const FILE_BLOCK_IN_USE_OFFSET: u64 = 0x08;
pub const FILE_BLOCK_NEXT_OFFSET: u64 = 0x10;
pub const FILE_BLOCK_DATA_OFFSET: u64 = 0x18;
/// Total file block header size in bytes.
pub const FILE_BLOCK_SIZE: u64 = 32;

/// Preferred capacity of a file data area ("block size").
pub const DATA_BLOCK_SIZE: u64 = 1024;

/// Allocation header: one capacity word in front of every payload.
pub const ALLOC_HEADER_SIZE: u64 = 8;
/// A free block needs its capacity word plus a next-offset word, so no
/// payload may be smaller than 8 bytes; 16 is the full free-node footprint
/// and the minimum allocation request.
pub const FREE_NODE_SIZE: u64 = 16;

/// Width of one children-array slot (a stored offset).
pub const CHILD_SLOT_SIZE: u64 = 8;
/// Initial children-array capacity in slots (slot 0 is the parent link).
pub const DIR_INITIAL_SLOTS: u64 = 4;

// ── Errors ──────────────────────────────────────────────────────────────────

/// Low-level layout failures: a stored offset or length that does not fit
/// the region it claims to describe.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    #[error("span [{offset}, {offset}+{len}) exceeds region of {region} bytes")]
    OutOfBounds { offset: u64, len: u64, region: u64 },
    #[error("offset {offset} + length {len} overflows")]
    Overflow { offset: u64, len: u64 },
    #[error("invalid inode kind {0}")]
    InvalidKind(u32),
}

// ── Region offset ───────────────────────────────────────────────────────────

/// A byte offset from the region base. Offset 0 is reserved as the null
/// reference ("no block", "no parent", end of list).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct RegionOffset(pub u64);

impl RegionOffset {
    /// The null reference.
    pub const NULL: Self = Self(0);

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegionOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Inode kind ──────────────────────────────────────────────────────────────

/// Tagged discriminant of an inode record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Directory,
}

impl NodeKind {
    /// On-region encoding: 1 = file, 2 = directory.
    #[must_use]
    pub fn to_raw(self) -> u32 {
        match self {
            Self::File => 1,
            Self::Directory => 2,
        }
    }

    pub fn from_raw(raw: u32) -> Result<Self, LayoutError> {
        match raw {
            1 => Ok(Self::File),
            2 => Ok(Self::Directory),
            other => Err(LayoutError::InvalidKind(other)),
        }
    }
}

// ── Timestamps ──────────────────────────────────────────────────────────────

/// A realtime-clock timestamp stored as seconds + nanoseconds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct TimeSpec {
    pub sec: i64,
    pub nsec: u32,
}

impl From<SystemTime> for TimeSpec {
    fn from(t: SystemTime) -> Self {
        match t.duration_since(SystemTime::UNIX_EPOCH) {
            Ok(d) => Self {
                sec: i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
                nsec: d.subsec_nanos(),
            },
            // Pre-epoch times round towards negative seconds.
            Err(e) => {
                let d = e.duration();
                let sec = i64::try_from(d.as_secs()).unwrap_or(i64::MAX);
                if d.subsec_nanos() == 0 {
                    Self { sec: -sec, nsec: 0 }
                } else {
                    Self {
                        sec: -sec - 1,
                        nsec: 1_000_000_000 - d.subsec_nanos(),
                    }
                }
            }
        }
    }
}

impl From<TimeSpec> for SystemTime {
    fn from(t: TimeSpec) -> Self {
        if t.sec >= 0 {
            #[allow(clippy::cast_sign_loss)]
            let base = Duration::new(t.sec as u64, t.nsec);
            SystemTime::UNIX_EPOCH + base
        } else {
            let back = Duration::new(t.sec.unsigned_abs(), 0);
            SystemTime::UNIX_EPOCH - back + Duration::new(0, t.nsec)
        }
    }
}

// ── Field codecs ────────────────────────────────────────────────────────────
//
// All little-endian, all bounds-checked. These are the only way any crate
// reads or writes region bytes.

/// Validate `[offset, offset + len)` against the region and return it as a
/// native index range.
pub fn span(
    region: &[u8],
    offset: u64,
    len: u64,
) -> Result<std::ops::Range<usize>, LayoutError> {
    let end = offset
        .checked_add(len)
        .ok_or(LayoutError::Overflow { offset, len })?;
    let region_len = region.len() as u64;
    if end > region_len {
        return Err(LayoutError::OutOfBounds {
            offset,
            len,
            region: region_len,
        });
    }
    let start = usize::try_from(offset).map_err(|_| LayoutError::Overflow { offset, len })?;
    let end = usize::try_from(end).map_err(|_| LayoutError::Overflow { offset, len })?;
    Ok(start..end)
}

pub fn bytes_at(region: &[u8], offset: u64, len: u64) -> Result<&[u8], LayoutError> {
    let range = span(region, offset, len)?;
    Ok(&region[range])
}

pub fn bytes_at_mut(region: &mut [u8], offset: u64, len: u64) -> Result<&mut [u8], LayoutError> {
    let range = span(region, offset, len)?;
    Ok(&mut region[range])
}

pub fn read_u32_at(region: &[u8], offset: u64) -> Result<u32, LayoutError> {
    let b = bytes_at(region, offset, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub fn read_u64_at(region: &[u8], offset: u64) -> Result<u64, LayoutError> {
    let b = bytes_at(region, offset, 8)?;
    Ok(u64::from_le_bytes([
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
    ]))
}

pub fn read_i64_at(region: &[u8], offset: u64) -> Result<i64, LayoutError> {
    read_u64_at(region, offset).map(|v| i64::from_le_bytes(v.to_le_bytes()))
}

pub fn read_offset_at(region: &[u8], offset: u64) -> Result<RegionOffset, LayoutError> {
    read_u64_at(region, offset).map(RegionOffset)
}

pub fn write_u32_at(region: &mut [u8], offset: u64, value: u32) -> Result<(), LayoutError> {
    bytes_at_mut(region, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub fn write_u64_at(region: &mut [u8], offset: u64, value: u64) -> Result<(), LayoutError> {
    bytes_at_mut(region, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub fn write_i64_at(region: &mut [u8], offset: u64, value: i64) -> Result<(), LayoutError> {
    write_u64_at(region, offset, u64::from_le_bytes(value.to_le_bytes()))
}

pub fn write_offset_at(
    region: &mut [u8],
    offset: u64,
    value: RegionOffset,
) -> Result<(), LayoutError> {
    write_u64_at(region, offset, value.0)
}

/// Copy `len` bytes from `src` to `dst` within the region. The spans may
/// overlap.
pub fn copy_bytes(region: &mut [u8], src: u64, dst: u64, len: u64) -> Result<(), LayoutError> {
    let src_range = span(region, src, len)?;
    let dst_range = span(region, dst, len)?;
    region.copy_within(src_range, dst_range.start);
    Ok(())
}

/// Zero `len` bytes starting at `offset`.
pub fn zero_bytes(region: &mut [u8], offset: u64, len: u64) -> Result<(), LayoutError> {
    bytes_at_mut(region, offset, len)?.fill(0);
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
