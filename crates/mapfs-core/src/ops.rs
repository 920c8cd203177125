//! The thirteen filesystem operations.
//!
//! Every method re-mounts first, then resolves paths through the
//! namespace, and only then mutates. Helpers mutate in-memory [`Inode`]
//! copies plus the region; each method stores every touched record
//! exactly once, so an error return never leaves a half-applied state
//! (allocation failures inside grow paths roll their blocks back before
//! surfacing).

use crate::{mode_for, superblock, DirEntry, FileAttr, FsStats};
use mapfs_error::{MapFsError, Result};
use mapfs_inode::{
    append_child, find_child, free_chain, list_children, parent_of, read_kind_at, read_name_at,
    remove_child_slot, set_child_at, subdir_count, validate_name, Inode, InodeBody,
};
use mapfs_path::{final_component, resolve, root_offset};
use mapfs_types::{
    NodeKind, RegionOffset, TimeSpec, CHILD_SLOT_SIZE, DATA_BLOCK_SIZE, DIR_INITIAL_SLOTS,
    INODE_SIZE, NAME_MAX,
};
use std::time::SystemTime;

/// The mapfs core over one mounted region.
///
/// Borrows the region for the lifetime of the handle; hosts typically
/// construct one per request over their long-lived buffer or mapping.
pub struct MapFs<'r> {
    region: &'r mut [u8],
}

impl<'r> MapFs<'r> {
    pub fn new(region: &'r mut [u8]) -> Self {
        Self { region }
    }

    fn mount(&mut self) -> Result<()> {
        superblock::mount(self.region)
    }

    fn now() -> TimeSpec {
        TimeSpec::from(SystemTime::now())
    }

    fn non_negative(offset: i64) -> Result<u64> {
        u64::try_from(offset).map_err(|_| MapFsError::InvalidArgument("negative offset"))
    }

    // ── getattr ─────────────────────────────────────────────────────────

    /// Attributes of the node at `path`. uid/gid are echoed from the
    /// caller; modes are fixed 0755.
    pub fn getattr(&mut self, uid: u32, gid: u32, path: &str) -> Result<FileAttr> {
        self.mount()?;
        let off = resolve(self.region, path, 0)?;
        let mut node = Inode::load(self.region, off)?;

        let (nlink, size) = match node.body {
            InodeBody::File { size, .. } => (1, size),
            InodeBody::Directory { .. } => (2 + subdir_count(self.region, &node)?, 0),
        };
        let attr = FileAttr {
            kind: node.kind(),
            mode: mode_for(node.kind()),
            nlink,
            size,
            uid,
            gid,
            atime: node.atime,
            mtime: node.mtime,
            blksize: u32::try_from(DATA_BLOCK_SIZE).unwrap_or(u32::MAX),
        };

        node.touch_access(Self::now());
        node.store(self.region, off)?;
        Ok(attr)
    }

    // ── readdir ─────────────────────────────────────────────────────────

    /// Children of the directory at `path`, excluding the parent slot.
    pub fn readdir(&mut self, path: &str) -> Result<Vec<DirEntry>> {
        self.mount()?;
        let off = resolve(self.region, path, 0)?;
        let mut node = Inode::load(self.region, off)?;

        let mut entries = Vec::new();
        for child in list_children(self.region, &node)? {
            entries.push(DirEntry {
                name: read_name_at(self.region, child)?,
                kind: read_kind_at(self.region, child)?,
            });
        }

        node.touch_access(Self::now());
        node.store(self.region, off)?;
        Ok(entries)
    }

    // ── mknod / mkdir ───────────────────────────────────────────────────

    /// Create an empty regular file at `path`.
    pub fn mknod(&mut self, path: &str) -> Result<()> {
        self.make_node(path, NodeKind::File)
    }

    /// Create an empty directory at `path`.
    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        self.make_node(path, NodeKind::Directory)
    }

    fn make_node(&mut self, path: &str, kind: NodeKind) -> Result<()> {
        self.mount()?;
        let now = Self::now();
        let parent_off = resolve(self.region, path, 1)?;
        let mut parent = Inode::load(self.region, parent_off)?;
        parent.as_dir()?;

        let name = final_component(path)?;
        if find_child(self.region, &parent, name.as_bytes())?.is_some() {
            return Err(MapFsError::Exists);
        }
        validate_name(name.as_bytes())?;

        let node_off = mapfs_alloc::alloc(self.region, INODE_SIZE)?;
        let node = match kind {
            NodeKind::File => Inode::new_file(name.as_bytes(), now)?,
            NodeKind::Directory => {
                let children = match mapfs_alloc::alloc(
                    self.region,
                    DIR_INITIAL_SLOTS * CHILD_SLOT_SIZE,
                ) {
                    Ok(c) => c,
                    Err(e) => {
                        mapfs_alloc::release(self.region, node_off)?;
                        return Err(e);
                    }
                };
                set_child_at(self.region, children, 0, parent_off)?;
                Inode::new_dir(name.as_bytes(), now, children)?
            }
        };
        node.store(self.region, node_off)?;

        if let Err(e) = append_child(self.region, &mut parent, node_off) {
            if let InodeBody::Directory { children, .. } = node.body {
                mapfs_alloc::release(self.region, children)?;
            }
            mapfs_alloc::release(self.region, node_off)?;
            return Err(e);
        }
        parent.touch_modify(now);
        parent.store(self.region, parent_off)
    }

    // ── unlink / rmdir ──────────────────────────────────────────────────

    /// Remove the regular file at `path`.
    pub fn unlink(&mut self, path: &str) -> Result<()> {
        self.mount()?;
        let now = Self::now();
        let (mut parent, parent_off, slot, node_off) = self.locate_child(path)?;

        let node = Inode::load(self.region, node_off)?;
        let (_, first_block) = node.as_file()?;
        free_chain(self.region, first_block)?;
        mapfs_alloc::release(self.region, node_off)?;

        remove_child_slot(self.region, &mut parent, slot)?;
        parent.touch_modify(now);
        parent.store(self.region, parent_off)
    }

    /// Remove the empty directory at `path`.
    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        self.mount()?;
        let now = Self::now();
        let (mut parent, parent_off, slot, node_off) = self.locate_child(path)?;

        let node = Inode::load(self.region, node_off)?;
        let (count, children) = node.as_dir()?;
        if count > 1 {
            return Err(MapFsError::NotEmpty);
        }
        mapfs_alloc::release(self.region, children)?;
        mapfs_alloc::release(self.region, node_off)?;

        remove_child_slot(self.region, &mut parent, slot)?;
        parent.touch_modify(now);
        parent.store(self.region, parent_off)
    }

    /// Resolve `path`'s parent and the final component's slot within it.
    fn locate_child(&mut self, path: &str) -> Result<(Inode, RegionOffset, u64, RegionOffset)> {
        let parent_off = resolve(self.region, path, 1)?;
        let parent = Inode::load(self.region, parent_off)?;
        parent.as_dir()?;
        let name = final_component(path)?;
        match find_child(self.region, &parent, name.as_bytes())? {
            Some((slot, node_off)) => Ok((parent, parent_off, slot, node_off)),
            None => Err(MapFsError::NotFound(path.to_owned())),
        }
    }

    // ── truncate ────────────────────────────────────────────────────────

    /// Set the file at `path` to exactly `size` bytes, zero-filling when
    /// growing.
    pub fn truncate(&mut self, path: &str, size: i64) -> Result<()> {
        self.mount()?;
        let new_size = Self::non_negative(size)?;
        let now = Self::now();
        let off = resolve(self.region, path, 0)?;
        let mut node = Inode::load(self.region, off)?;
        let (old_size, _) = node.as_file()?;

        if new_size == old_size {
            node.touch_access(now);
        } else if new_size < old_size {
            mapfs_inode::shrink(self.region, &mut node, new_size)?;
            node.touch_modify(now);
        } else {
            mapfs_inode::extend_zeroed(self.region, &mut node, new_size)?;
            node.touch_modify(now);
        }
        node.store(self.region, off)
    }

    // ── open ────────────────────────────────────────────────────────────

    /// Check that `path` resolves. No state change, no handle.
    pub fn open(&mut self, path: &str) -> Result<()> {
        self.mount()?;
        resolve(self.region, path, 0).map(|_| ())
    }

    // ── read / write ────────────────────────────────────────────────────

    /// Read up to `len` bytes from the file at `path` starting at
    /// `offset`. Short only at end of file; empty at or past it.
    pub fn read(&mut self, path: &str, offset: i64, len: usize) -> Result<Vec<u8>> {
        self.mount()?;
        let offset = Self::non_negative(offset)?;
        let off = resolve(self.region, path, 0)?;
        let mut node = Inode::load(self.region, off)?;
        let data = mapfs_inode::read_at(self.region, &node, offset, len)?;

        node.touch_access(Self::now());
        node.store(self.region, off)?;
        Ok(data)
    }

    /// Write `data` to the file at `path` at `offset`, extending with
    /// explicit zeros past the current end. Returns the bytes written.
    pub fn write(&mut self, path: &str, offset: i64, data: &[u8]) -> Result<usize> {
        self.mount()?;
        let offset = Self::non_negative(offset)?;
        let off = resolve(self.region, path, 0)?;
        let mut node = Inode::load(self.region, off)?;
        mapfs_inode::write_at(self.region, &mut node, offset, data)?;

        node.touch_modify(Self::now());
        node.store(self.region, off)?;
        Ok(data.len())
    }

    // ── rename ──────────────────────────────────────────────────────────

    /// Move `from` to `to`, replacing a same-typed (and, for directories,
    /// empty) target. The insertion into the target parent commits before
    /// any displaced node is destroyed.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.mount()?;
        let now = Self::now();

        let from_off = resolve(self.region, from, 0)?;
        let from_parent_off = resolve(self.region, from, 1)?;
        let from_name = final_component(from)?;
        let to_parent_off = resolve(self.region, to, 1)?;
        let to_name = final_component(to)?;
        validate_name(to_name.as_bytes())?;

        let mut to_parent = Inode::load(self.region, to_parent_off)?;
        to_parent.as_dir()?;
        let existing = find_child(self.region, &to_parent, to_name.as_bytes())?;

        // Renaming a path onto its own inode is a no-op.
        if let Some((_, off)) = existing {
            if off == from_off {
                return Ok(());
            }
        }

        self.check_not_ancestor(from_off, to_parent_off)?;

        let mut from_parent = Inode::load(self.region, from_parent_off)?;
        let Some((from_slot, _)) = find_child(self.region, &from_parent, from_name.as_bytes())?
        else {
            return Err(MapFsError::NotFound(from.to_owned()));
        };

        let mut node = Inode::load(self.region, from_off)?;

        if let Some((to_slot, displaced_off)) = existing {
            let displaced = Inode::load(self.region, displaced_off)?;
            match (node.kind(), displaced.kind()) {
                (NodeKind::File, NodeKind::Directory) => return Err(MapFsError::IsDirectory),
                (NodeKind::Directory, NodeKind::File) => return Err(MapFsError::NotDirectory),
                _ => {}
            }
            if let InodeBody::Directory { child_count, .. } = displaced.body {
                if child_count > 1 {
                    return Err(MapFsError::NotEmpty);
                }
            }

            // Commit: retarget the node, overwrite the displaced child's
            // slot (a single array write), compact the source slot, and
            // only then destroy the displaced inode.
            self.retarget(&mut node, to_name, to_parent_off, now)?;
            node.store(self.region, from_off)?;

            if from_parent_off == to_parent_off {
                let (_, children) = from_parent.as_dir()?;
                set_child_at(self.region, children, to_slot, from_off)?;
                remove_child_slot(self.region, &mut from_parent, from_slot)?;
                from_parent.touch_modify(now);
                from_parent.store(self.region, from_parent_off)?;
            } else {
                let (_, to_children) = to_parent.as_dir()?;
                set_child_at(self.region, to_children, to_slot, from_off)?;
                to_parent.touch_modify(now);
                to_parent.store(self.region, to_parent_off)?;
                remove_child_slot(self.region, &mut from_parent, from_slot)?;
                from_parent.touch_modify(now);
                from_parent.store(self.region, from_parent_off)?;
            }

            match displaced.body {
                InodeBody::File { first_block, .. } => free_chain(self.region, first_block)?,
                InodeBody::Directory { children, .. } => {
                    mapfs_alloc::release(self.region, children)?;
                }
            }
            mapfs_alloc::release(self.region, displaced_off)
        } else if from_parent_off == to_parent_off {
            // The append (which may grow the children array) goes first;
            // if it fails, the source entry is untouched.
            append_child(self.region, &mut from_parent, from_off)?;
            self.retarget(&mut node, to_name, to_parent_off, now)?;
            node.store(self.region, from_off)?;
            remove_child_slot(self.region, &mut from_parent, from_slot)?;
            from_parent.touch_modify(now);
            from_parent.store(self.region, from_parent_off)
        } else {
            append_child(self.region, &mut to_parent, from_off)?;
            self.retarget(&mut node, to_name, to_parent_off, now)?;
            node.store(self.region, from_off)?;
            to_parent.touch_modify(now);
            to_parent.store(self.region, to_parent_off)?;
            remove_child_slot(self.region, &mut from_parent, from_slot)?;
            from_parent.touch_modify(now);
            from_parent.store(self.region, from_parent_off)
        }
    }

    /// Rename the node and, for directories, repoint the parent link in
    /// slot 0 at the new parent.
    fn retarget(
        &mut self,
        node: &mut Inode,
        to_name: &str,
        to_parent_off: RegionOffset,
        now: TimeSpec,
    ) -> Result<()> {
        node.set_name(to_name.as_bytes())?;
        if let InodeBody::Directory { children, .. } = node.body {
            set_child_at(self.region, children, 0, to_parent_off)?;
        }
        node.touch_modify(now);
        Ok(())
    }

    /// Refuse to move a node into its own subtree: walk the target
    /// parent's slot-0 chain up to the root.
    fn check_not_ancestor(&self, node_off: RegionOffset, to_parent_off: RegionOffset) -> Result<()> {
        let root = root_offset(self.region)?;
        let mut cur = to_parent_off;
        let mut steps = self.region.len() as u64 / INODE_SIZE + 2;
        loop {
            if cur == node_off {
                return Err(MapFsError::InvalidArgument(
                    "cannot move a directory into its own subtree",
                ));
            }
            if cur == root {
                return Ok(());
            }
            if steps == 0 {
                return Err(MapFsError::Corrupt {
                    offset: cur.0,
                    detail: "parent chain does not reach the root".to_owned(),
                });
            }
            steps -= 1;
            let node = Inode::load(self.region, cur)?;
            let parent = parent_of(self.region, &node)?;
            if parent.is_null() {
                return Ok(());
            }
            cur = parent;
        }
    }

    // ── utimens ─────────────────────────────────────────────────────────

    /// Overwrite both timestamps from caller-provided values.
    pub fn utimens(&mut self, path: &str, atime: TimeSpec, mtime: TimeSpec) -> Result<()> {
        self.mount()?;
        let off = resolve(self.region, path, 0)?;
        let mut node = Inode::load(self.region, off)?;
        node.set_times(atime, mtime);
        node.store(self.region, off)
    }

    // ── statfs ──────────────────────────────────────────────────────────

    /// Usage accounting in 1024-byte blocks.
    pub fn statfs(&mut self) -> Result<FsStats> {
        self.mount()?;
        let free = mapfs_alloc::free_bytes(self.region)?;
        Ok(FsStats {
            block_size: u32::try_from(DATA_BLOCK_SIZE).unwrap_or(u32::MAX),
            blocks: self.region.len() as u64 / DATA_BLOCK_SIZE,
            blocks_free: free / DATA_BLOCK_SIZE,
            blocks_avail: free / DATA_BLOCK_SIZE,
            name_max: u32::try_from(NAME_MAX).unwrap_or(u32::MAX),
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
