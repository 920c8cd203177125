#![forbid(unsafe_code)]
//! Free-space management inside a mapfs region.
//!
//! Free space is a singly linked list of free blocks threaded through the
//! region itself, ordered by strictly ascending offset and eagerly
//! coalesced. Every block — free or allocated — carries one 8-byte
//! capacity word in front of its payload; a free block additionally keeps
//! the offset of the next free block in the first 8 bytes of its payload.
//! The list head lives in the superblock.
//!
//! ## Policy
//!
//! - `alloc` is best-fit by capacity; ties go to the lowest offset (the
//!   sorted scan yields that for free).
//! - A free block is split only when the residual could itself become a
//!   free block (header + at least one payload byte); otherwise the whole
//!   block is consumed and the slack stays recorded in the allocation's
//!   capacity word.
//! - `extend_in_place` grows an allocation into the free block that starts
//!   exactly at its payload end, all-or-nothing.
//! - `release` inserts in sorted position and merges with the predecessor
//!   and/or successor when contiguous.
//!
//! All operations either succeed or leave the region untouched.

use mapfs_error::{MapFsError, Result};
use mapfs_types::{
    read_u64_at, span, write_u64_at, RegionOffset, ALLOC_HEADER_SIZE, FREE_NODE_SIZE,
    SUPERBLOCK_FREE_HEAD_OFFSET, SUPERBLOCK_SIZE,
};

// ── Free-list node access ───────────────────────────────────────────────────

/// A free block, addressed by the offset of its capacity word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeSpan {
    /// Offset of the capacity word (the block header).
    pub offset: u64,
    /// Payload capacity in bytes (the 8 bytes holding `next` included).
    pub capacity: u64,
}

#[derive(Debug, Clone, Copy)]
struct FreeNode {
    capacity: u64,
    next: u64,
}

fn corrupt(offset: u64, detail: &str) -> MapFsError {
    MapFsError::Corrupt {
        offset,
        detail: detail.to_owned(),
    }
}

fn load_node(region: &[u8], off: u64) -> Result<FreeNode> {
    let capacity = read_u64_at(region, off)?;
    if capacity < ALLOC_HEADER_SIZE {
        return Err(corrupt(off, "free block too small to hold its link"));
    }
    span(region, off + ALLOC_HEADER_SIZE, capacity)?;
    let next = read_u64_at(region, off + ALLOC_HEADER_SIZE)?;
    Ok(FreeNode { capacity, next })
}

fn store_node(region: &mut [u8], off: u64, node: FreeNode) -> Result<()> {
    write_u64_at(region, off, node.capacity)?;
    write_u64_at(region, off + ALLOC_HEADER_SIZE, node.next)?;
    Ok(())
}

fn free_head(region: &[u8]) -> Result<u64> {
    Ok(read_u64_at(region, SUPERBLOCK_FREE_HEAD_OFFSET)?)
}

fn set_free_head(region: &mut [u8], head: u64) -> Result<()> {
    write_u64_at(region, SUPERBLOCK_FREE_HEAD_OFFSET, head)?;
    Ok(())
}

/// Relink a node's predecessor: either the list head cell or the `next`
/// word of the preceding free block.
fn relink(region: &mut [u8], prev: Option<u64>, target: u64) -> Result<()> {
    match prev {
        None => set_free_head(region, target),
        Some(p) => {
            write_u64_at(region, p + ALLOC_HEADER_SIZE, target)?;
            Ok(())
        }
    }
}

/// Walk the free list, enforcing the strictly-ascending order invariant
/// (which doubles as the termination proof: a cyclic or unsorted list is
/// reported as corruption instead of looping).
fn walk<F>(region: &[u8], mut visit: F) -> Result<()>
where
    F: FnMut(Option<u64>, u64, FreeNode) -> Result<bool>,
{
    let mut prev: Option<u64> = None;
    let mut cur = free_head(region)?;
    let mut last = 0u64;
    while cur != 0 {
        if cur <= last {
            return Err(corrupt(cur, "free list not strictly ascending"));
        }
        let node = load_node(region, cur)?;
        if !visit(prev, cur, node)? {
            return Ok(());
        }
        last = cur;
        prev = Some(cur);
        cur = node.next;
    }
    Ok(())
}

// ── Allocation ──────────────────────────────────────────────────────────────

/// Round a request up to the smallest payload a future free block fits in.
fn rounded(size: u64) -> u64 {
    size.max(FREE_NODE_SIZE)
}

/// Whether carving `need` bytes out of a block of `capacity` leaves a
/// residual worth keeping as a free block.
fn splits(capacity: u64, need: u64) -> bool {
    capacity - need >= FREE_NODE_SIZE + 1
}

/// Allocate a payload of at least `size` bytes.
///
/// Returns the payload offset; the actual capacity (recoverable through
/// [`capacity_of`]) may exceed the request by unsplittable slack.
pub fn alloc(region: &mut [u8], size: u64) -> Result<RegionOffset> {
    if size == 0 {
        return Err(MapFsError::InvalidArgument("zero-size allocation"));
    }
    let need = rounded(size);

    let mut best: Option<(Option<u64>, u64, FreeNode)> = None;
    walk(region, |prev, off, node| {
        if node.capacity >= need
            && best.map_or(true, |(_, _, b)| node.capacity < b.capacity)
        {
            best = Some((prev, off, node));
        }
        Ok(true)
    })?;

    let Some((prev, off, node)) = best else {
        return Err(MapFsError::NoSpace);
    };

    if splits(node.capacity, need) {
        let rest = off + ALLOC_HEADER_SIZE + need;
        store_node(
            region,
            rest,
            FreeNode {
                capacity: node.capacity - need - ALLOC_HEADER_SIZE,
                next: node.next,
            },
        )?;
        relink(region, prev, rest)?;
        write_u64_at(region, off, need)?;
    } else {
        relink(region, prev, node.next)?;
    }
    Ok(RegionOffset(off + ALLOC_HEADER_SIZE))
}

/// Payload capacity of an allocated block.
pub fn capacity_of(region: &[u8], payload: RegionOffset) -> Result<u64> {
    if payload.0 < SUPERBLOCK_SIZE + ALLOC_HEADER_SIZE {
        return Err(corrupt(payload.0, "allocation inside the superblock"));
    }
    let hdr = payload.0 - ALLOC_HEADER_SIZE;
    let capacity = read_u64_at(region, hdr)?;
    if capacity < ALLOC_HEADER_SIZE {
        return Err(corrupt(hdr, "allocation capacity below minimum"));
    }
    span(region, payload.0, capacity)?;
    Ok(capacity)
}

// ── Release ─────────────────────────────────────────────────────────────────

/// Return an allocated payload to the free list, merging with contiguous
/// neighbours. Releasing the null offset is a no-op.
pub fn release(region: &mut [u8], payload: RegionOffset) -> Result<()> {
    if payload.is_null() {
        return Ok(());
    }
    let capacity = capacity_of(region, payload)?;
    let hdr = payload.0 - ALLOC_HEADER_SIZE;
    insert_free(region, hdr, capacity)
}

fn insert_free(region: &mut [u8], hdr: u64, capacity: u64) -> Result<()> {
    let head = free_head(region)?;
    let end = hdr + ALLOC_HEADER_SIZE + capacity;

    if head == 0 {
        store_node(region, hdr, FreeNode { capacity, next: 0 })?;
        return set_free_head(region, hdr);
    }

    if hdr < head {
        if end > head {
            return Err(corrupt(hdr, "released block overlaps a free block"));
        }
        // New lowest block; merge forward into the old head if contiguous.
        let node = if end == head {
            let old = load_node(region, head)?;
            FreeNode {
                capacity: capacity + ALLOC_HEADER_SIZE + old.capacity,
                next: old.next,
            }
        } else {
            FreeNode {
                capacity,
                next: head,
            }
        };
        store_node(region, hdr, node)?;
        return set_free_head(region, hdr);
    }

    if hdr == head {
        return Err(corrupt(hdr, "block is already free"));
    }

    // Find the last free block below the insertion point.
    let mut prev = head;
    loop {
        let node = load_node(region, prev)?;
        if node.next == hdr {
            return Err(corrupt(hdr, "block is already free"));
        }
        if node.next != 0 && node.next < hdr {
            prev = node.next;
        } else {
            break;
        }
    }
    let prev_node = load_node(region, prev)?;
    let prev_end = prev + ALLOC_HEADER_SIZE + prev_node.capacity;
    if prev_end > hdr {
        return Err(corrupt(hdr, "released block overlaps a free block"));
    }

    if prev_node.next != 0 && end > prev_node.next {
        return Err(corrupt(hdr, "released block overlaps a free block"));
    }

    // Merge forward into the successor if contiguous.
    let (merged_capacity, merged_next) = if prev_node.next != 0 && end == prev_node.next {
        let succ = load_node(region, prev_node.next)?;
        (capacity + ALLOC_HEADER_SIZE + succ.capacity, succ.next)
    } else {
        (capacity, prev_node.next)
    };

    // Merge backward into the predecessor if contiguous.
    if prev_end == hdr {
        store_node(
            region,
            prev,
            FreeNode {
                capacity: prev_node.capacity + ALLOC_HEADER_SIZE + merged_capacity,
                next: merged_next,
            },
        )
    } else {
        store_node(
            region,
            hdr,
            FreeNode {
                capacity: merged_capacity,
                next: merged_next,
            },
        )?;
        write_u64_at(region, prev + ALLOC_HEADER_SIZE, hdr)?;
        Ok(())
    }
}

// ── In-place extension ──────────────────────────────────────────────────────

/// Try to grow an allocation to `new_capacity` bytes by consuming the free
/// block that starts exactly at its payload end.
///
/// All-or-nothing: returns `Ok(false)` without mutating anything when no
/// adjacent free block exists or it cannot cover the whole growth.
pub fn extend_in_place(
    region: &mut [u8],
    payload: RegionOffset,
    new_capacity: u64,
) -> Result<bool> {
    let capacity = capacity_of(region, payload)?;
    if new_capacity <= capacity {
        return Ok(true);
    }
    let neighbour = payload.0 + capacity;
    let extra = new_capacity - capacity;

    let mut found: Option<(Option<u64>, FreeNode)> = None;
    walk(region, |prev, off, node| {
        if off == neighbour {
            found = Some((prev, node));
            return Ok(false);
        }
        // The list is sorted; no point looking past the neighbour.
        Ok(off < neighbour)
    })?;
    let Some((prev, node)) = found else {
        return Ok(false);
    };

    // The neighbour's header word is absorbed into the allocation.
    let avail = ALLOC_HEADER_SIZE + node.capacity;
    if avail < extra {
        return Ok(false);
    }

    if splits(avail, extra) {
        let rest = neighbour + extra;
        store_node(
            region,
            rest,
            FreeNode {
                capacity: avail - extra - ALLOC_HEADER_SIZE,
                next: node.next,
            },
        )?;
        relink(region, prev, rest)?;
        write_u64_at(region, payload.0 - ALLOC_HEADER_SIZE, capacity + extra)?;
    } else {
        relink(region, prev, node.next)?;
        write_u64_at(region, payload.0 - ALLOC_HEADER_SIZE, capacity + avail)?;
    }
    Ok(true)
}

// ── Realloc ─────────────────────────────────────────────────────────────────

/// Resize an allocation to at least `new_size` bytes.
///
/// Shrinks carve the tail back to the free list when profitable; growth
/// first tries [`extend_in_place`], then falls back to allocate + copy +
/// release. Returns the (possibly moved) payload offset. A null payload
/// behaves like [`alloc`]; `new_size == 0` releases and returns null.
pub fn realloc(region: &mut [u8], payload: RegionOffset, new_size: u64) -> Result<RegionOffset> {
    if payload.is_null() {
        return alloc(region, new_size);
    }
    if new_size == 0 {
        release(region, payload)?;
        return Ok(RegionOffset::NULL);
    }

    let need = rounded(new_size);
    let capacity = capacity_of(region, payload)?;

    if capacity >= need {
        if splits(capacity, need) {
            let tail_hdr = payload.0 + need;
            write_u64_at(region, payload.0 - ALLOC_HEADER_SIZE, need)?;
            insert_free(region, tail_hdr, capacity - need - ALLOC_HEADER_SIZE)?;
        }
        return Ok(payload);
    }

    if extend_in_place(region, payload, need)? {
        return Ok(payload);
    }

    let moved = alloc(region, new_size)?;
    mapfs_types::copy_bytes(region, payload.0, moved.0, capacity)?;
    release(region, payload)?;
    Ok(moved)
}

// ── Reporting ───────────────────────────────────────────────────────────────

/// Capacity of the largest single free block.
pub fn largest_free(region: &[u8]) -> Result<u64> {
    let mut max = 0u64;
    walk(region, |_, _, node| {
        max = max.max(node.capacity);
        Ok(true)
    })?;
    Ok(max)
}

/// Sum of all free payload capacities.
pub fn free_bytes(region: &[u8]) -> Result<u64> {
    let mut total = 0u64;
    walk(region, |_, _, node| {
        total += node.capacity;
        Ok(true)
    })?;
    Ok(total)
}

/// The free list in ascending offset order.
pub fn free_list(region: &[u8]) -> Result<Vec<FreeSpan>> {
    let mut spans = Vec::new();
    walk(region, |_, off, node| {
        spans.push(FreeSpan {
            offset: off,
            capacity: node.capacity,
        });
        Ok(true)
    })?;
    Ok(spans)
}

// ── Bootstrap ───────────────────────────────────────────────────────────────

/// Initialise the free list to a single block spanning from `first_free`
/// to the end of the region. If the remainder cannot hold even a minimal
/// free block, the list starts empty.
pub fn init_free_space(region: &mut [u8], first_free: u64) -> Result<()> {
    let region_len = region.len() as u64;
    if first_free + ALLOC_HEADER_SIZE + FREE_NODE_SIZE > region_len {
        return set_free_head(region, 0);
    }
    store_node(
        region,
        first_free,
        FreeNode {
            capacity: region_len - first_free - ALLOC_HEADER_SIZE,
            next: 0,
        },
    )?;
    set_free_head(region, first_free)
}

// ── Tests ───────────────────────────────────────────────────────────────────
