//! Superblock codec and the mount/initialise step.
//!
//! Every entry point re-mounts: an absent magic number means a fresh
//! region, which gets the bootstrap layout written out; a present magic
//! means "already initialised, do not touch". The bootstrap places the
//! superblock at offset 0, the root inode directly behind it, the root's
//! initial children array behind that, and hands the remainder to the
//! allocator as one free block.

use mapfs_error::{MapFsError, Result};
use mapfs_inode::{set_child_at, Inode, InodeBody};
use mapfs_types::{
    read_offset_at, read_u32_at, read_u64_at, write_offset_at, write_u32_at, write_u64_at,
    zero_bytes, RegionOffset, TimeSpec, ALLOC_HEADER_SIZE, CHILD_SLOT_SIZE, DIR_INITIAL_SLOTS,
    INODE_SIZE, MAGIC, ROOT_INODE_OFFSET, SUPERBLOCK_FREE_HEAD_OFFSET, SUPERBLOCK_MAGIC_OFFSET,
    SUPERBLOCK_ROOT_OFFSET, SUPERBLOCK_SIZE_OFFSET,
};
use std::time::SystemTime;
use tracing::debug;

/// Header offset of the root's bootstrap children array block.
pub(crate) const BOOTSTRAP_CHILDREN_BLOCK: u64 = ROOT_INODE_OFFSET + INODE_SIZE;
/// Payload offset of that block (what the root inode records).
pub(crate) const BOOTSTRAP_CHILDREN_PAYLOAD: u64 = BOOTSTRAP_CHILDREN_BLOCK + ALLOC_HEADER_SIZE;
/// First byte past the bootstrap layout; the initial free block starts
/// here. Regions smaller than this cannot hold a filesystem at all.
pub(crate) const BOOTSTRAP_END: u64 =
    BOOTSTRAP_CHILDREN_PAYLOAD + DIR_INITIAL_SLOTS * CHILD_SLOT_SIZE;

/// Parsed superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    /// Region size in bytes, as recorded at initialisation.
    pub size: u64,
    /// Root inode offset.
    pub root: RegionOffset,
    /// Free-list head (0 when no free space remains).
    pub free_head: RegionOffset,
}

impl Superblock {
    /// Load the superblock, or `None` when the magic is absent (fresh
    /// region).
    pub fn load(region: &[u8]) -> Result<Option<Self>> {
        if read_u32_at(region, SUPERBLOCK_MAGIC_OFFSET)? != MAGIC {
            return Ok(None);
        }
        Ok(Some(Self {
            size: read_u64_at(region, SUPERBLOCK_SIZE_OFFSET)?,
            root: read_offset_at(region, SUPERBLOCK_ROOT_OFFSET)?,
            free_head: read_offset_at(region, SUPERBLOCK_FREE_HEAD_OFFSET)?,
        }))
    }

    pub fn store(&self, region: &mut [u8]) -> Result<()> {
        write_u32_at(region, SUPERBLOCK_MAGIC_OFFSET, MAGIC)?;
        write_u64_at(region, SUPERBLOCK_SIZE_OFFSET, self.size)?;
        write_offset_at(region, SUPERBLOCK_ROOT_OFFSET, self.root)?;
        write_offset_at(region, SUPERBLOCK_FREE_HEAD_OFFSET, self.free_head)?;
        Ok(())
    }
}

/// Mount the region: initialise it when fresh, validate it otherwise.
/// Idempotent; called at the top of every operation.
pub fn mount(region: &mut [u8]) -> Result<()> {
    let region_len = region.len() as u64;
    if region_len < BOOTSTRAP_END {
        // Too small to hold the superblock + root; nothing can ever be
        // created here.
        return Err(MapFsError::NoSpace);
    }

    if let Some(sb) = Superblock::load(region)? {
        if sb.size != region_len {
            return Err(MapFsError::Corrupt {
                offset: SUPERBLOCK_SIZE_OFFSET,
                detail: format!(
                    "recorded region size {} does not match the {} bytes handed in",
                    sb.size, region_len
                ),
            });
        }
        return Ok(());
    }

    debug!(region_len, "initialising fresh region");

    // Root inode with its bootstrap children array; slot 0 (the parent
    // link) is the reserved null offset.
    let children = RegionOffset(BOOTSTRAP_CHILDREN_PAYLOAD);
    write_u64_at(
        region,
        BOOTSTRAP_CHILDREN_BLOCK,
        DIR_INITIAL_SLOTS * CHILD_SLOT_SIZE,
    )?;
    zero_bytes(region, children.0, DIR_INITIAL_SLOTS * CHILD_SLOT_SIZE)?;
    set_child_at(region, children, 0, RegionOffset::NULL)?;

    // Built directly: "/" is not a legal child name, but it is the
    // conventional label for the root record itself.
    let now = TimeSpec::from(SystemTime::now());
    let root = Inode {
        name: b"/".to_vec(),
        atime: now,
        mtime: now,
        body: InodeBody::Directory {
            child_count: 1,
            children,
        },
    };
    root.store(region, RegionOffset(ROOT_INODE_OFFSET))?;

    mapfs_alloc::init_free_space(region, BOOTSTRAP_END)?;

    Superblock {
        size: region_len,
        root: RegionOffset(ROOT_INODE_OFFSET),
        // init_free_space wrote the head; re-read it for the record.
        free_head: read_offset_at(region, SUPERBLOCK_FREE_HEAD_OFFSET)?,
    }
    .store(region)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_region_is_initialised_once() {
        let mut region = vec![0u8; 4096];
        mount(&mut region).unwrap();
        let sb = Superblock::load(&region).unwrap().expect("magic present");
        assert_eq!(sb.size, 4096);
        assert_eq!(sb.root, RegionOffset(ROOT_INODE_OFFSET));
        assert!(!sb.free_head.is_null());

        let root = Inode::load(&region, sb.root).unwrap();
        assert_eq!(root.name, b"/");
        let (count, children) = root.as_dir().unwrap();
        assert_eq!(count, 1);
        assert_eq!(children, RegionOffset(BOOTSTRAP_CHILDREN_PAYLOAD));

        // A second mount must not touch anything.
        let snapshot = region.clone();
        mount(&mut region).unwrap();
        assert_eq!(region, snapshot);
    }

    #[test]
    fn mount_rejects_size_mismatch() {
        let mut region = vec![0u8; 4096];
        mount(&mut region).unwrap();
        let mut truncated = region[..2048].to_vec();
        assert!(matches!(
            mount(&mut truncated),
            Err(MapFsError::Corrupt { .. })
        ));
    }

    #[test]
    fn mount_refuses_region_below_bootstrap() {
        let mut tiny = vec![0u8; 64];
        assert!(matches!(mount(&mut tiny), Err(MapFsError::NoSpace)));
        // And leaves the bytes untouched.
        assert!(tiny.iter().all(|&b| b == 0));
    }

    #[test]
    fn bootstrap_region_with_no_free_space_mounts_empty() {
        // Exactly the bootstrap footprint: mounts, but the free list is
        // empty and every allocation fails.
        let mut region = vec![0u8; BOOTSTRAP_END as usize];
        mount(&mut region).unwrap();
        let sb = Superblock::load(&region).unwrap().unwrap();
        assert!(sb.free_head.is_null());
        assert!(matches!(
            mapfs_alloc::alloc(&mut region, 16),
            Err(MapFsError::NoSpace)
        ));
    }
}
