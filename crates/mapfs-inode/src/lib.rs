#![forbid(unsafe_code)]
//! Inode records, directory children arrays, and file block chains.
//!
//! An inode is a fixed 304-byte record: a NUL-terminated name buffer, two
//! timestamps, a kind discriminant, and a body that is either a file
//! (logical size + first block offset) or a directory (child count +
//! children array offset). Directory children are a contiguous run of
//! offsets whose slot 0 links back to the parent; file contents are a
//! linked chain of block headers, each pointing at a separately allocated
//! data area.
//!
//! Helpers here mutate the region and an in-memory [`Inode`], but never
//! store the inode record themselves — the operation layer stores once
//! per entry point, so two helpers can never clobber each other's update.

use mapfs_error::{MapFsError, Result};
use mapfs_types::{
    bytes_at, bytes_at_mut, read_offset_at, read_u32_at, read_u64_at, read_i64_at, span,
    write_i64_at, write_offset_at, write_u32_at, write_u64_at, zero_bytes, NodeKind, RegionOffset,
    TimeSpec, ALLOC_HEADER_SIZE, CHILD_SLOT_SIZE, DATA_BLOCK_SIZE, DIR_INITIAL_SLOTS,
    FILE_BLOCK_CAPACITY_OFFSET, FILE_BLOCK_DATA_OFFSET, FILE_BLOCK_IN_USE_OFFSET,
    FILE_BLOCK_NEXT_OFFSET, FILE_BLOCK_SIZE, INODE_ATIME_NSEC_OFFSET, INODE_ATIME_SEC_OFFSET,
    INODE_BODY_WORD0_OFFSET, INODE_BODY_WORD1_OFFSET, INODE_KIND_OFFSET, INODE_MTIME_NSEC_OFFSET,
    INODE_MTIME_SEC_OFFSET, INODE_NAME_OFFSET, INODE_SIZE, NAME_BUF_SIZE, NAME_MAX,
};
use std::borrow::Cow;

fn corrupt(offset: u64, detail: impl Into<String>) -> MapFsError {
    MapFsError::Corrupt {
        offset,
        detail: detail.into(),
    }
}

/// Upper bound on chain/list walks; any self-referential structure inside
/// the region is reported as corruption instead of looping.
fn walk_limit(region: &[u8]) -> u64 {
    region.len() as u64 / (ALLOC_HEADER_SIZE + FILE_BLOCK_SIZE) + 2
}

// ── Names ───────────────────────────────────────────────────────────────────

/// Validate a single path component: 1..=255 bytes, no `/`, no NUL.
pub fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(MapFsError::InvalidArgument("empty name"));
    }
    if name.len() > NAME_MAX {
        return Err(MapFsError::NameTooLong);
    }
    if name.contains(&b'/') || name.contains(&0) {
        return Err(MapFsError::InvalidArgument("name contains '/' or NUL"));
    }
    Ok(())
}

/// Read just the name of the inode at `off` (NUL-truncated).
pub fn read_name_at(region: &[u8], off: RegionOffset) -> Result<Vec<u8>> {
    let buf = bytes_at(region, off.0 + INODE_NAME_OFFSET, NAME_BUF_SIZE)?;
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| corrupt(off.0, "unterminated inode name"))?;
    Ok(buf[..end].to_vec())
}

/// Read just the kind discriminant of the inode at `off`.
pub fn read_kind_at(region: &[u8], off: RegionOffset) -> Result<NodeKind> {
    let raw = read_u32_at(region, off.0 + INODE_KIND_OFFSET)?;
    Ok(NodeKind::from_raw(raw)?)
}

// ── Inode record ────────────────────────────────────────────────────────────

/// Body of an inode record, tagged by the kind discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeBody {
    File {
        /// Logical size in bytes.
        size: u64,
        /// First file block header, null for an empty file.
        first_block: RegionOffset,
    },
    Directory {
        /// Number of used slots, including the parent link in slot 0.
        child_count: u64,
        /// Children array payload offset.
        children: RegionOffset,
    },
}

/// Parsed inode record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub name: Vec<u8>,
    pub atime: TimeSpec,
    pub mtime: TimeSpec,
    pub body: InodeBody,
}

impl Inode {
    pub fn new_file(name: &[u8], now: TimeSpec) -> Result<Self> {
        validate_name(name)?;
        Ok(Self {
            name: name.to_vec(),
            atime: now,
            mtime: now,
            body: InodeBody::File {
                size: 0,
                first_block: RegionOffset::NULL,
            },
        })
    }

    pub fn new_dir(name: &[u8], now: TimeSpec, children: RegionOffset) -> Result<Self> {
        validate_name(name)?;
        Ok(Self {
            name: name.to_vec(),
            atime: now,
            mtime: now,
            body: InodeBody::Directory {
                child_count: 1,
                children,
            },
        })
    }

    pub fn load(region: &[u8], off: RegionOffset) -> Result<Self> {
        // Validate the whole record span up front; field reads below
        // cannot go out of bounds after this.
        span(region, off.0, INODE_SIZE)?;
        let name = read_name_at(region, off)?;
        let atime = TimeSpec {
            sec: read_i64_at(region, off.0 + INODE_ATIME_SEC_OFFSET)?,
            nsec: read_u32_at(region, off.0 + INODE_ATIME_NSEC_OFFSET)?,
        };
        let mtime = TimeSpec {
            sec: read_i64_at(region, off.0 + INODE_MTIME_SEC_OFFSET)?,
            nsec: read_u32_at(region, off.0 + INODE_MTIME_NSEC_OFFSET)?,
        };
        let kind = NodeKind::from_raw(read_u32_at(region, off.0 + INODE_KIND_OFFSET)?)?;
        let word0 = read_u64_at(region, off.0 + INODE_BODY_WORD0_OFFSET)?;
        let word1 = read_offset_at(region, off.0 + INODE_BODY_WORD1_OFFSET)?;
        let body = match kind {
            NodeKind::File => InodeBody::File {
                size: word0,
                first_block: word1,
            },
            NodeKind::Directory => InodeBody::Directory {
                child_count: word0,
                children: word1,
            },
        };
        Ok(Self {
            name,
            atime,
            mtime,
            body,
        })
    }

    pub fn store(&self, region: &mut [u8], off: RegionOffset) -> Result<()> {
        span(region, off.0, INODE_SIZE)?;
        if self.name.len() > NAME_MAX {
            return Err(MapFsError::NameTooLong);
        }
        let name_buf = bytes_at_mut(region, off.0 + INODE_NAME_OFFSET, NAME_BUF_SIZE)?;
        name_buf.fill(0);
        name_buf[..self.name.len()].copy_from_slice(&self.name);
        write_i64_at(region, off.0 + INODE_ATIME_SEC_OFFSET, self.atime.sec)?;
        write_i64_at(region, off.0 + INODE_MTIME_SEC_OFFSET, self.mtime.sec)?;
        write_u32_at(region, off.0 + INODE_ATIME_NSEC_OFFSET, self.atime.nsec)?;
        write_u32_at(region, off.0 + INODE_MTIME_NSEC_OFFSET, self.mtime.nsec)?;
        write_u32_at(region, off.0 + INODE_KIND_OFFSET, self.kind().to_raw())?;
        let (word0, word1) = match self.body {
            InodeBody::File { size, first_block } => (size, first_block),
            InodeBody::Directory {
                child_count,
                children,
            } => (child_count, children),
        };
        write_u64_at(region, off.0 + INODE_BODY_WORD0_OFFSET, word0)?;
        write_offset_at(region, off.0 + INODE_BODY_WORD1_OFFSET, word1)?;
        Ok(())
    }

    #[must_use]
    pub fn kind(&self) -> NodeKind {
        match self.body {
            InodeBody::File { .. } => NodeKind::File,
            InodeBody::Directory { .. } => NodeKind::Directory,
        }
    }

    /// Lossy UTF-8 view of the name, for display and FUSE replies.
    #[must_use]
    pub fn name_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }

    /// File body accessor; `EISDIR` for directories.
    pub fn as_file(&self) -> Result<(u64, RegionOffset)> {
        match self.body {
            InodeBody::File { size, first_block } => Ok((size, first_block)),
            InodeBody::Directory { .. } => Err(MapFsError::IsDirectory),
        }
    }

    /// Directory body accessor; `ENOTDIR` for files.
    pub fn as_dir(&self) -> Result<(u64, RegionOffset)> {
        match self.body {
            InodeBody::Directory {
                child_count,
                children,
            } => Ok((child_count, children)),
            InodeBody::File { .. } => Err(MapFsError::NotDirectory),
        }
    }

    pub fn touch_access(&mut self, now: TimeSpec) {
        self.atime = now;
    }

    /// Mutations touch both times.
    pub fn touch_modify(&mut self, now: TimeSpec) {
        self.atime = now;
        self.mtime = now;
    }

    pub fn set_times(&mut self, atime: TimeSpec, mtime: TimeSpec) {
        self.atime = atime;
        self.mtime = mtime;
    }

    pub fn set_name(&mut self, name: &[u8]) -> Result<()> {
        validate_name(name)?;
        self.name = name.to_vec();
        Ok(())
    }
}

// ── Directory children ──────────────────────────────────────────────────────

fn slot_offset(children: RegionOffset, slot: u64) -> u64 {
    children.0 + slot * CHILD_SLOT_SIZE
}

/// Read one children-array slot.
pub fn child_at(region: &[u8], children: RegionOffset, slot: u64) -> Result<RegionOffset> {
    Ok(read_offset_at(region, slot_offset(children, slot))?)
}

/// Write one children-array slot.
pub fn set_child_at(
    region: &mut [u8],
    children: RegionOffset,
    slot: u64,
    value: RegionOffset,
) -> Result<()> {
    write_offset_at(region, slot_offset(children, slot), value)?;
    Ok(())
}

/// The parent link in slot 0 (null for the root).
pub fn parent_of(region: &[u8], dir: &Inode) -> Result<RegionOffset> {
    let (_, children) = dir.as_dir()?;
    child_at(region, children, 0)
}

/// Linear scan for a child by exact name bytes, skipping the parent slot.
/// Returns the slot index and the child's inode offset.
pub fn find_child(
    region: &[u8],
    dir: &Inode,
    name: &[u8],
) -> Result<Option<(u64, RegionOffset)>> {
    let (count, children) = dir.as_dir()?;
    for slot in 1..count {
        let child = child_at(region, children, slot)?;
        if child.is_null() {
            return Err(corrupt(slot_offset(children, slot), "null child slot"));
        }
        if read_name_at(region, child)? == name {
            return Ok(Some((slot, child)));
        }
    }
    Ok(None)
}

/// Inode offsets of all children, excluding the parent slot.
pub fn list_children(region: &[u8], dir: &Inode) -> Result<Vec<RegionOffset>> {
    let (count, children) = dir.as_dir()?;
    let mut out = Vec::with_capacity(usize::try_from(count.saturating_sub(1)).unwrap_or(0));
    for slot in 1..count {
        out.push(child_at(region, children, slot)?);
    }
    Ok(out)
}

/// Number of child directories (for `nlink`).
pub fn subdir_count(region: &[u8], dir: &Inode) -> Result<u32> {
    let mut n = 0u32;
    for child in list_children(region, dir)? {
        if read_kind_at(region, child)? == NodeKind::Directory {
            n += 1;
        }
    }
    Ok(n)
}

/// Append a child offset, doubling the children array when full.
///
/// On allocation failure nothing is visible: the directory body in `dir`
/// is only updated after the slot write succeeded.
pub fn append_child(region: &mut [u8], dir: &mut Inode, child: RegionOffset) -> Result<()> {
    let (count, children) = dir.as_dir()?;
    let slots = mapfs_alloc::capacity_of(region, children)? / CHILD_SLOT_SIZE;
    let children = if count == slots {
        mapfs_alloc::realloc(region, children, slots * 2 * CHILD_SLOT_SIZE)?
    } else {
        children
    };
    set_child_at(region, children, count, child)?;
    dir.body = InodeBody::Directory {
        child_count: count + 1,
        children,
    };
    Ok(())
}

/// Remove the child in `slot`, compacting by moving the last slot down.
/// Shrinks the array when capacity is at least 4x the used slots.
pub fn remove_child_slot(region: &mut [u8], dir: &mut Inode, slot: u64) -> Result<()> {
    let (count, children) = dir.as_dir()?;
    if slot == 0 || slot >= count {
        return Err(MapFsError::InvalidArgument("child slot out of range"));
    }
    let last = count - 1;
    if slot != last {
        let moved = child_at(region, children, last)?;
        set_child_at(region, children, slot, moved)?;
    }

    let slots = mapfs_alloc::capacity_of(region, children)? / CHILD_SLOT_SIZE;
    let children = if slots >= 4 * last && slots > DIR_INITIAL_SLOTS {
        let target = (last * 2).max(DIR_INITIAL_SLOTS);
        mapfs_alloc::realloc(region, children, target * CHILD_SLOT_SIZE)?
    } else {
        children
    };
    dir.body = InodeBody::Directory {
        child_count: last,
        children,
    };
    Ok(())
}

// ── File block chain ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct FileBlock {
    capacity: u64,
    in_use: u64,
    next: RegionOffset,
    data: RegionOffset,
}

fn load_block(region: &[u8], off: RegionOffset) -> Result<FileBlock> {
    span(region, off.0, FILE_BLOCK_SIZE)?;
    let block = FileBlock {
        capacity: read_u64_at(region, off.0 + FILE_BLOCK_CAPACITY_OFFSET)?,
        in_use: read_u64_at(region, off.0 + FILE_BLOCK_IN_USE_OFFSET)?,
        next: read_offset_at(region, off.0 + FILE_BLOCK_NEXT_OFFSET)?,
        data: read_offset_at(region, off.0 + FILE_BLOCK_DATA_OFFSET)?,
    };
    if block.in_use > block.capacity {
        return Err(corrupt(off.0, "file block in_use exceeds capacity"));
    }
    span(region, block.data.0, block.capacity)?;
    Ok(block)
}

fn store_block(region: &mut [u8], off: RegionOffset, block: FileBlock) -> Result<()> {
    write_u64_at(region, off.0 + FILE_BLOCK_CAPACITY_OFFSET, block.capacity)?;
    write_u64_at(region, off.0 + FILE_BLOCK_IN_USE_OFFSET, block.in_use)?;
    write_offset_at(region, off.0 + FILE_BLOCK_NEXT_OFFSET, block.next)?;
    write_offset_at(region, off.0 + FILE_BLOCK_DATA_OFFSET, block.data)?;
    Ok(())
}

/// Read up to `len` bytes starting at `offset`; short reads happen only at
/// end of file. Reading at or past the end returns an empty buffer.
pub fn read_at(region: &[u8], inode: &Inode, offset: u64, len: usize) -> Result<Vec<u8>> {
    let (size, first) = inode.as_file()?;
    if offset >= size {
        return Ok(Vec::new());
    }
    let want = u64::try_from(len).unwrap_or(u64::MAX).min(size - offset);
    let mut out = Vec::with_capacity(usize::try_from(want).unwrap_or(0));

    let mut skip = offset;
    let mut cur = first;
    let mut steps = walk_limit(region);
    while !cur.is_null() && (out.len() as u64) < want {
        if steps == 0 {
            return Err(corrupt(cur.0, "file block chain does not terminate"));
        }
        steps -= 1;
        let block = load_block(region, cur)?;
        if skip >= block.in_use {
            skip -= block.in_use;
        } else {
            let n = (block.in_use - skip).min(want - out.len() as u64);
            out.extend_from_slice(bytes_at(region, block.data.0 + skip, n)?);
            skip = 0;
        }
        cur = block.next;
    }
    if (out.len() as u64) < want {
        return Err(corrupt(
            first.0,
            "file block chain shorter than the logical size",
        ));
    }
    Ok(out)
}

/// State captured before a grow so a mid-flight allocation failure can put
/// everything back.
struct GrowRollback {
    tail: Option<(RegionOffset, u64)>,
    added: Vec<(RegionOffset, RegionOffset)>,
}

impl GrowRollback {
    fn undo(self, region: &mut [u8]) -> Result<()> {
        for (hdr, data) in self.added.into_iter().rev() {
            mapfs_alloc::release(region, data)?;
            mapfs_alloc::release(region, hdr)?;
        }
        if let Some((tail, in_use)) = self.tail {
            write_u64_at(region, tail.0 + FILE_BLOCK_IN_USE_OFFSET, in_use)?;
            write_offset_at(region, tail.0 + FILE_BLOCK_NEXT_OFFSET, RegionOffset::NULL)?;
        }
        Ok(())
    }
}

/// Grow a file to `new_size`, zero-filling the new bytes.
///
/// All-or-nothing: if any allocation fails, every block allocated during
/// this call is released, the old tail is restored, and the inode is left
/// untouched.
pub fn extend_zeroed(region: &mut [u8], inode: &mut Inode, new_size: u64) -> Result<()> {
    let (size, first) = inode.as_file()?;
    if new_size <= size {
        return Ok(());
    }
    let mut deficit = new_size - size;
    let mut rollback = GrowRollback {
        tail: None,
        added: Vec::new(),
    };

    // Fill the tail block's spare capacity first.
    let mut prev = RegionOffset::NULL;
    if !first.is_null() {
        let mut cur = first;
        let mut steps = walk_limit(region);
        let tail = loop {
            if steps == 0 {
                return Err(corrupt(cur.0, "file block chain does not terminate"));
            }
            steps -= 1;
            let block = load_block(region, cur)?;
            if block.next.is_null() {
                break (cur, block);
            }
            cur = block.next;
        };
        let (tail_off, mut block) = tail;
        rollback.tail = Some((tail_off, block.in_use));
        let take = (block.capacity - block.in_use).min(deficit);
        if take > 0 {
            zero_bytes(region, block.data.0 + block.in_use, take)?;
            block.in_use += take;
            store_block(region, tail_off, block)?;
            deficit -= take;
        }
        prev = tail_off;
    }

    // Chain new blocks until the deficit is covered.
    let mut first_new = RegionOffset::NULL;
    while deficit > 0 {
        let want = deficit.min(DATA_BLOCK_SIZE);
        let hdr = match mapfs_alloc::alloc(region, FILE_BLOCK_SIZE) {
            Ok(h) => h,
            Err(e) => {
                rollback.undo(region)?;
                return Err(e);
            }
        };
        let data = match mapfs_alloc::alloc(region, want) {
            Ok(d) => d,
            Err(e) => {
                mapfs_alloc::release(region, hdr)?;
                rollback.undo(region)?;
                return Err(e);
            }
        };
        let capacity = mapfs_alloc::capacity_of(region, data)?;
        let take = deficit.min(capacity);
        zero_bytes(region, data.0, take)?;
        store_block(
            region,
            hdr,
            FileBlock {
                capacity,
                in_use: take,
                next: RegionOffset::NULL,
                data,
            },
        )?;
        if prev.is_null() {
            first_new = hdr;
        } else {
            write_offset_at(region, prev.0 + FILE_BLOCK_NEXT_OFFSET, hdr)?;
        }
        rollback.added.push((hdr, data));
        prev = hdr;
        deficit -= take;
    }

    inode.body = InodeBody::File {
        size: new_size,
        first_block: if first.is_null() { first_new } else { first },
    };
    Ok(())
}

/// Write `data` at `offset`, extending the file (with explicit zero holes)
/// as needed. On allocation failure nothing is visible.
pub fn write_at(region: &mut [u8], inode: &mut Inode, offset: u64, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    let end = offset
        .checked_add(data.len() as u64)
        .ok_or(MapFsError::InvalidArgument("write end overflows"))?;
    let (size, _) = inode.as_file()?;
    if end > size {
        extend_zeroed(region, inode, end)?;
    }

    // The chain now covers [0, end); overwrite in place.
    let (_, first) = inode.as_file()?;
    let mut skip = offset;
    let mut written = 0usize;
    let mut cur = first;
    let mut steps = walk_limit(region);
    while written < data.len() {
        if cur.is_null() || steps == 0 {
            return Err(corrupt(first.0, "file block chain shorter than write span"));
        }
        steps -= 1;
        let block = load_block(region, cur)?;
        if skip >= block.in_use {
            skip -= block.in_use;
        } else {
            let n = (block.in_use - skip).min((data.len() - written) as u64);
            let n_usize = usize::try_from(n).unwrap_or(usize::MAX);
            bytes_at_mut(region, block.data.0 + skip, n)?
                .copy_from_slice(&data[written..written + n_usize]);
            written += n_usize;
            skip = 0;
        }
        cur = block.next;
    }
    Ok(())
}

/// Shrink a file to `new_size`, releasing every block past the boundary.
pub fn shrink(region: &mut [u8], inode: &mut Inode, new_size: u64) -> Result<()> {
    let (size, first) = inode.as_file()?;
    if new_size >= size {
        return Ok(());
    }
    if new_size == 0 {
        free_chain(region, first)?;
        inode.body = InodeBody::File {
            size: 0,
            first_block: RegionOffset::NULL,
        };
        return Ok(());
    }

    let mut remaining = new_size;
    let mut cur = first;
    let mut steps = walk_limit(region);
    loop {
        if cur.is_null() || steps == 0 {
            return Err(corrupt(first.0, "file block chain shorter than shrink target"));
        }
        steps -= 1;
        let mut block = load_block(region, cur)?;
        if remaining > block.in_use {
            remaining -= block.in_use;
            cur = block.next;
        } else {
            // Boundary block: keep its data area (the spare capacity is
            // reused by the next grow), cut the chain here.
            let after = block.next;
            block.in_use = remaining;
            block.next = RegionOffset::NULL;
            store_block(region, cur, block)?;
            free_chain(region, after)?;
            break;
        }
    }
    inode.body = InodeBody::File {
        size: new_size,
        first_block: first,
    };
    Ok(())
}

/// Release every block of a chain, data areas included.
pub fn free_chain(region: &mut [u8], first: RegionOffset) -> Result<()> {
    let mut cur = first;
    let mut steps = walk_limit(region);
    while !cur.is_null() {
        if steps == 0 {
            return Err(corrupt(cur.0, "file block chain does not terminate"));
        }
        steps -= 1;
        let block = load_block(region, cur)?;
        mapfs_alloc::release(region, block.data)?;
        mapfs_alloc::release(region, cur)?;
        cur = block.next;
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mapfs_types::SUPERBLOCK_SIZE;

    fn fresh_region(len: usize) -> Vec<u8> {
        let mut region = vec![0u8; len];
        mapfs_alloc::init_free_space(&mut region, SUPERBLOCK_SIZE).unwrap();
        region
    }

    fn now() -> TimeSpec {
        TimeSpec {
            sec: 1_700_000_000,
            nsec: 42,
        }
    }

    fn alloc_inode(region: &mut [u8], inode: &Inode) -> RegionOffset {
        let off = mapfs_alloc::alloc(region, INODE_SIZE).unwrap();
        inode.store(region, off).unwrap();
        off
    }

    fn new_dir_at(region: &mut [u8], name: &[u8], parent: RegionOffset) -> (RegionOffset, Inode) {
        let children =
            mapfs_alloc::alloc(region, DIR_INITIAL_SLOTS * CHILD_SLOT_SIZE).unwrap();
        set_child_at(region, children, 0, parent).unwrap();
        let dir = Inode::new_dir(name, now(), children).unwrap();
        let off = alloc_inode(region, &dir);
        (off, dir)
    }

    // ── Record codec ────────────────────────────────────────────────────

    #[test]
    fn file_record_round_trips() {
        let mut region = fresh_region(4096);
        let mut inode = Inode::new_file(b"hello.txt", now()).unwrap();
        inode.body = InodeBody::File {
            size: 12345,
            first_block: RegionOffset(2048),
        };
        let off = alloc_inode(&mut region, &inode);
        let loaded = Inode::load(&region, off).unwrap();
        assert_eq!(loaded, inode);
        assert_eq!(loaded.kind(), NodeKind::File);
        assert_eq!(read_kind_at(&region, off).unwrap(), NodeKind::File);
        assert_eq!(read_name_at(&region, off).unwrap(), b"hello.txt");
    }

    #[test]
    fn dir_record_round_trips() {
        let mut region = fresh_region(4096);
        let (off, dir) = new_dir_at(&mut region, b"sub", RegionOffset(32));
        let loaded = Inode::load(&region, off).unwrap();
        assert_eq!(loaded, dir);
        assert_eq!(loaded.kind(), NodeKind::Directory);
        assert_eq!(parent_of(&region, &loaded).unwrap(), RegionOffset(32));
    }

    #[test]
    fn store_rewrites_whole_name_buffer() {
        let mut region = fresh_region(4096);
        let inode = Inode::new_file(b"a-rather-long-name", now()).unwrap();
        let off = alloc_inode(&mut region, &inode);
        let mut renamed = Inode::load(&region, off).unwrap();
        renamed.set_name(b"x").unwrap();
        renamed.store(&mut region, off).unwrap();
        assert_eq!(read_name_at(&region, off).unwrap(), b"x");
    }

    #[test]
    fn name_validation() {
        assert!(validate_name(b"ok").is_ok());
        assert!(validate_name(&[b'a'; 255]).is_ok());
        assert!(matches!(
            validate_name(&[b'a'; 256]),
            Err(MapFsError::NameTooLong)
        ));
        assert!(matches!(
            validate_name(b""),
            Err(MapFsError::InvalidArgument(_))
        ));
        assert!(matches!(
            validate_name(b"a/b"),
            Err(MapFsError::InvalidArgument(_))
        ));
        assert!(matches!(
            validate_name(b"a\0b"),
            Err(MapFsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn body_accessors_enforce_kind() {
        let file = Inode::new_file(b"f", now()).unwrap();
        assert!(file.as_file().is_ok());
        assert!(matches!(file.as_dir(), Err(MapFsError::NotDirectory)));

        let dir = Inode::new_dir(b"d", now(), RegionOffset(344)).unwrap();
        assert!(dir.as_dir().is_ok());
        assert!(matches!(dir.as_file(), Err(MapFsError::IsDirectory)));
    }

    #[test]
    fn touch_updates_times() {
        let mut inode = Inode::new_file(b"f", now()).unwrap();
        let later = TimeSpec {
            sec: now().sec + 10,
            nsec: 0,
        };
        inode.touch_access(later);
        assert_eq!(inode.atime, later);
        assert_eq!(inode.mtime, now());
        inode.touch_modify(later);
        assert_eq!(inode.mtime, later);
    }

    // ── Children arrays ─────────────────────────────────────────────────

    #[test]
    fn append_and_find_children() {
        let mut region = fresh_region(16384);
        let (dir_off, mut dir) = new_dir_at(&mut region, b"d", RegionOffset::NULL);

        let a = alloc_inode(&mut region, &Inode::new_file(b"a", now()).unwrap());
        let b = alloc_inode(&mut region, &Inode::new_file(b"b", now()).unwrap());
        append_child(&mut region, &mut dir, a).unwrap();
        append_child(&mut region, &mut dir, b).unwrap();
        dir.store(&mut region, dir_off).unwrap();

        assert_eq!(find_child(&region, &dir, b"a").unwrap(), Some((1, a)));
        assert_eq!(find_child(&region, &dir, b"b").unwrap(), Some((2, b)));
        assert_eq!(find_child(&region, &dir, b"c").unwrap(), None);
        assert_eq!(list_children(&region, &dir).unwrap(), vec![a, b]);
    }

    #[test]
    fn children_array_doubles_past_initial_capacity() {
        let mut region = fresh_region(65536);
        let (_, mut dir) = new_dir_at(&mut region, b"d", RegionOffset::NULL);

        // Slot 0 is the parent; 3 appends fill the initial 4 slots, the
        // 4th forces a doubling.
        let mut offs = Vec::new();
        for name in [b"c0".as_slice(), b"c1", b"c2", b"c3"] {
            let off = alloc_inode(&mut region, &Inode::new_file(name, now()).unwrap());
            append_child(&mut region, &mut dir, off).unwrap();
            offs.push(off);
        }
        let (count, children_after) = dir.as_dir().unwrap();
        assert_eq!(count, 5);
        assert_eq!(
            mapfs_alloc::capacity_of(&region, children_after).unwrap() / CHILD_SLOT_SIZE,
            8
        );
        // All slots survived the move.
        for (i, off) in offs.iter().enumerate() {
            assert_eq!(
                child_at(&region, children_after, i as u64 + 1).unwrap(),
                *off
            );
        }
    }

    #[test]
    fn remove_child_compacts_with_last_slot() {
        let mut region = fresh_region(65536);
        let (_, mut dir) = new_dir_at(&mut region, b"d", RegionOffset::NULL);
        let a = alloc_inode(&mut region, &Inode::new_file(b"a", now()).unwrap());
        let b = alloc_inode(&mut region, &Inode::new_file(b"b", now()).unwrap());
        let c = alloc_inode(&mut region, &Inode::new_file(b"c", now()).unwrap());
        for off in [a, b, c] {
            append_child(&mut region, &mut dir, off).unwrap();
        }

        remove_child_slot(&mut region, &mut dir, 1).unwrap();
        let (count, children) = dir.as_dir().unwrap();
        assert_eq!(count, 3);
        // `c` moved into the vacated slot.
        assert_eq!(child_at(&region, children, 1).unwrap(), c);
        assert_eq!(child_at(&region, children, 2).unwrap(), b);
    }

    #[test]
    fn remove_child_shrinks_oversized_array() {
        let mut region = fresh_region(65536);
        let (_, mut dir) = new_dir_at(&mut region, b"d", RegionOffset::NULL);
        let mut offs = Vec::new();
        for i in 0..15u32 {
            let name = format!("c{i}");
            let off =
                alloc_inode(&mut region, &Inode::new_file(name.as_bytes(), now()).unwrap());
            append_child(&mut region, &mut dir, off).unwrap();
            offs.push(off);
        }
        let (_, children) = dir.as_dir().unwrap();
        assert_eq!(
            mapfs_alloc::capacity_of(&region, children).unwrap() / CHILD_SLOT_SIZE,
            16
        );

        // Drop to 3 children; 16 slots >= 4 * 4 used slots triggers the
        // shrink.
        for _ in 0..12 {
            remove_child_slot(&mut region, &mut dir, 1).unwrap();
        }
        let (count, children) = dir.as_dir().unwrap();
        assert_eq!(count, 4);
        assert!(
            mapfs_alloc::capacity_of(&region, children).unwrap() / CHILD_SLOT_SIZE <= 8,
            "array should have shrunk"
        );
    }

    #[test]
    fn remove_child_rejects_parent_slot() {
        let mut region = fresh_region(16384);
        let (_, mut dir) = new_dir_at(&mut region, b"d", RegionOffset::NULL);
        assert!(matches!(
            remove_child_slot(&mut region, &mut dir, 0),
            Err(MapFsError::InvalidArgument(_))
        ));
    }

    // ── File chains ─────────────────────────────────────────────────────

    #[test]
    fn empty_file_reads_empty() {
        let region = fresh_region(4096);
        let inode = Inode::new_file(b"f", now()).unwrap();
        assert_eq!(read_at(&region, &inode, 0, 100).unwrap(), Vec::<u8>::new());
        assert_eq!(read_at(&region, &inode, 50, 100).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut region = fresh_region(16384);
        let mut inode = Inode::new_file(b"f", now()).unwrap();
        write_at(&mut region, &mut inode, 0, b"Hello, mapfs!").unwrap();
        let (size, first) = inode.as_file().unwrap();
        assert_eq!(size, 13);
        assert!(!first.is_null());
        assert_eq!(read_at(&region, &inode, 0, 13).unwrap(), b"Hello, mapfs!");
        assert_eq!(read_at(&region, &inode, 7, 64).unwrap(), b"mapfs!");
    }

    #[test]
    fn write_spanning_multiple_blocks() {
        let mut region = fresh_region(64 * 1024);
        let mut inode = Inode::new_file(b"f", now()).unwrap();
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        write_at(&mut region, &mut inode, 0, &data).unwrap();
        let (size, first) = inode.as_file().unwrap();
        assert_eq!(size, 5000);

        // The chain really is multiple ~1 KiB blocks.
        let mut blocks = 0;
        let mut cur = first;
        while !cur.is_null() {
            let b = load_block(&region, cur).unwrap();
            assert!(b.in_use <= b.capacity);
            blocks += 1;
            cur = b.next;
        }
        assert!(blocks >= 5, "expected ~5 blocks, got {blocks}");
        assert_eq!(read_at(&region, &inode, 0, 5000).unwrap(), data);
        // Reads crossing block boundaries.
        assert_eq!(read_at(&region, &inode, 1000, 100).unwrap(), data[1000..1100]);
    }

    #[test]
    fn overwrite_keeps_size_and_surroundings() {
        let mut region = fresh_region(16384);
        let mut inode = Inode::new_file(b"f", now()).unwrap();
        write_at(&mut region, &mut inode, 0, b"aaaaaaaaaa").unwrap();
        write_at(&mut region, &mut inode, 3, b"XYZ").unwrap();
        let (size, _) = inode.as_file().unwrap();
        assert_eq!(size, 10);
        assert_eq!(read_at(&region, &inode, 0, 10).unwrap(), b"aaaXYZaaaa");
    }

    #[test]
    fn write_past_eof_zero_fills_the_hole() {
        let mut region = fresh_region(16384);
        let mut inode = Inode::new_file(b"f", now()).unwrap();
        write_at(&mut region, &mut inode, 2000, b"tail").unwrap();
        let (size, _) = inode.as_file().unwrap();
        assert_eq!(size, 2004);
        let all = read_at(&region, &inode, 0, 2004).unwrap();
        assert!(all[..2000].iter().all(|&b| b == 0));
        assert_eq!(&all[2000..], b"tail");
    }

    #[test]
    fn extend_zeroed_grows_and_zero_fills() {
        let mut region = fresh_region(16384);
        let mut inode = Inode::new_file(b"f", now()).unwrap();
        write_at(&mut region, &mut inode, 0, b"data").unwrap();
        extend_zeroed(&mut region, &mut inode, 3000).unwrap();
        let (size, _) = inode.as_file().unwrap();
        assert_eq!(size, 3000);
        let all = read_at(&region, &inode, 0, 3000).unwrap();
        assert_eq!(&all[..4], b"data");
        assert!(all[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn failed_grow_rolls_back_completely() {
        // Small region: bootstrap a file, then ask for far more than fits.
        let mut region = fresh_region(4096);
        let mut inode = Inode::new_file(b"f", now()).unwrap();
        write_at(&mut region, &mut inode, 0, b"keep me").unwrap();

        let free_before = mapfs_alloc::free_bytes(&region).unwrap();
        let spans_before = mapfs_alloc::free_list(&region).unwrap();
        let inode_before = inode.clone();

        let err = extend_zeroed(&mut region, &mut inode, 1 << 20).unwrap_err();
        assert!(matches!(err, MapFsError::NoSpace));

        // Nothing moved: same inode, same free space, same fragmentation.
        assert_eq!(inode, inode_before);
        assert_eq!(mapfs_alloc::free_bytes(&region).unwrap(), free_before);
        assert_eq!(mapfs_alloc::free_list(&region).unwrap(), spans_before);
        assert_eq!(read_at(&region, &inode, 0, 7).unwrap(), b"keep me");
    }

    #[test]
    fn failed_write_past_eof_rolls_back() {
        let mut region = fresh_region(4096);
        let mut inode = Inode::new_file(b"f", now()).unwrap();
        write_at(&mut region, &mut inode, 0, b"stable").unwrap();
        let inode_before = inode.clone();
        let free_before = mapfs_alloc::free_bytes(&region).unwrap();

        assert!(matches!(
            write_at(&mut region, &mut inode, 1 << 20, b"x"),
            Err(MapFsError::NoSpace)
        ));
        assert_eq!(inode, inode_before);
        assert_eq!(mapfs_alloc::free_bytes(&region).unwrap(), free_before);
    }

    #[test]
    fn shrink_releases_trailing_blocks() {
        let mut region = fresh_region(64 * 1024);
        let mut inode = Inode::new_file(b"f", now()).unwrap();
        let data = vec![7u8; 5000];
        write_at(&mut region, &mut inode, 0, &data).unwrap();
        let free_mid = mapfs_alloc::free_bytes(&region).unwrap();

        shrink(&mut region, &mut inode, 1500).unwrap();
        let (size, first) = inode.as_file().unwrap();
        assert_eq!(size, 1500);
        assert!(!first.is_null());
        assert!(mapfs_alloc::free_bytes(&region).unwrap() > free_mid);
        assert_eq!(read_at(&region, &inode, 0, 1500).unwrap(), vec![7u8; 1500]);

        // Regrowing reuses the boundary block's kept capacity.
        extend_zeroed(&mut region, &mut inode, 2000).unwrap();
        let all = read_at(&region, &inode, 0, 2000).unwrap();
        assert_eq!(&all[..1500], &vec![7u8; 1500][..]);
        assert!(all[1500..].iter().all(|&b| b == 0));
    }

    #[test]
    fn shrink_to_zero_frees_the_whole_chain() {
        let mut region = fresh_region(64 * 1024);
        let free_start = mapfs_alloc::free_bytes(&region).unwrap();
        let mut inode = Inode::new_file(b"f", now()).unwrap();
        write_at(&mut region, &mut inode, 0, &vec![1u8; 4000]).unwrap();

        shrink(&mut region, &mut inode, 0).unwrap();
        let (size, first) = inode.as_file().unwrap();
        assert_eq!(size, 0);
        assert!(first.is_null());
        assert_eq!(mapfs_alloc::free_bytes(&region).unwrap(), free_start);
    }

    #[test]
    fn truncate_write_truncate_write_is_stable() {
        let mut region = fresh_region(64 * 1024);
        let mut inode = Inode::new_file(b"f", now()).unwrap();
        let data = vec![0xA5u8; 2500];
        write_at(&mut region, &mut inode, 100, &data).unwrap();
        let first_read = read_at(&region, &inode, 0, 2600).unwrap();

        shrink(&mut region, &mut inode, 0).unwrap();
        write_at(&mut region, &mut inode, 100, &data).unwrap();
        assert_eq!(read_at(&region, &inode, 0, 2600).unwrap(), first_read);
    }
}
