#![forbid(unsafe_code)]
//! End-to-end test harness for mapfs.
//!
//! Provides the invariant audits the conformance suite runs after every
//! operation:
//!
//! - free-list order and coalescing,
//! - the allocated/free partition of the whole region (no overlaps, no
//!   gaps),
//! - parent back-references in every directory's slot 0,
//! - file chain accounting against logical sizes,
//!
//! plus a tree snapshot helper for remount comparisons.

use anyhow::{bail, Context, Result};
use mapfs::{MapFs, NodeKind};
use mapfs_inode::{child_at, list_children, Inode, InodeBody};
use mapfs_types::{
    read_offset_at, read_u64_at, RegionOffset, ALLOC_HEADER_SIZE, FILE_BLOCK_IN_USE_OFFSET,
    FILE_BLOCK_NEXT_OFFSET, FREE_NODE_SIZE, INODE_SIZE, ROOT_INODE_OFFSET, SUPERBLOCK_ROOT_OFFSET,
    SUPERBLOCK_SIZE,
};
use std::collections::HashSet;

// ── Free-list audit ─────────────────────────────────────────────────────────

/// Check that the free list is strictly offset-sorted, eagerly coalesced,
/// and fully inside the region. Returns the spans for further checks.
pub fn audit_free_list(region: &[u8]) -> Result<Vec<mapfs_alloc::FreeSpan>> {
    let spans = mapfs_alloc::free_list(region).context("walking the free list")?;
    for pair in spans.windows(2) {
        if pair[0].offset >= pair[1].offset {
            bail!(
                "free list not ascending: {} then {}",
                pair[0].offset,
                pair[1].offset
            );
        }
        if pair[0].offset + ALLOC_HEADER_SIZE + pair[0].capacity == pair[1].offset {
            bail!(
                "adjacent free blocks at {} and {} not coalesced",
                pair[0].offset,
                pair[1].offset
            );
        }
    }
    for s in &spans {
        if s.offset + ALLOC_HEADER_SIZE + s.capacity > region.len() as u64 {
            bail!("free block at {} runs past the region end", s.offset);
        }
    }
    Ok(spans)
}

// ── Region partition audit ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Span {
    start: u64,
    len: u64,
    what: &'static str,
}

fn allocated_span(
    region: &[u8],
    payload: RegionOffset,
    what: &'static str,
) -> Result<Span> {
    let capacity = mapfs_alloc::capacity_of(region, payload)
        .with_context(|| format!("capacity of {what} at {payload}"))?;
    Ok(Span {
        start: payload.0 - ALLOC_HEADER_SIZE,
        len: ALLOC_HEADER_SIZE + capacity,
        what,
    })
}

/// Walk the whole tree and the free list, and verify that superblock,
/// root bootstrap, every live allocation, and every free block tile the
/// region exactly: no overlaps, no unaccounted bytes (except a tail too
/// small to ever hold a free block).
///
/// Also verifies parent back-references (slot 0) and per-file chain
/// accounting along the way.
pub fn audit_region(region: &[u8]) -> Result<()> {
    let root = read_offset_at(region, SUPERBLOCK_ROOT_OFFSET)?;
    if root != RegionOffset(ROOT_INODE_OFFSET) {
        bail!("superblock root {} is not the bootstrap offset", root);
    }

    let mut spans = vec![
        Span {
            start: 0,
            len: SUPERBLOCK_SIZE,
            what: "superblock",
        },
        Span {
            start: ROOT_INODE_OFFSET,
            len: INODE_SIZE,
            what: "root inode",
        },
    ];

    // Tree walk: directories contribute their children array, children
    // contribute their inode records and file chains.
    let mut visited = HashSet::new();
    let mut stack = vec![(root, RegionOffset::NULL)];
    while let Some((off, expected_parent)) = stack.pop() {
        if !visited.insert(off) {
            bail!("inode {} reachable by two paths", off);
        }
        let node = Inode::load(region, off).with_context(|| format!("inode at {off}"))?;
        match node.body {
            InodeBody::Directory {
                child_count,
                children,
            } => {
                let parent = child_at(region, children, 0)?;
                if parent != expected_parent {
                    bail!(
                        "directory {} slot 0 is {} but the parent is {}",
                        off,
                        parent,
                        expected_parent
                    );
                }
                spans.push(allocated_span(region, children, "children array")?);
                let slots = mapfs_alloc::capacity_of(region, children)?
                    / mapfs_types::CHILD_SLOT_SIZE;
                if child_count > slots {
                    bail!("directory {off} has {child_count} children in {slots} slots");
                }
                for child in list_children(region, &node)? {
                    spans.push(allocated_span(region, child, "inode")?);
                    stack.push((child, off));
                }
            }
            InodeBody::File { size, first_block } => {
                let mut total = 0u64;
                let mut cur = first_block;
                while !cur.is_null() {
                    spans.push(allocated_span(region, cur, "file block header")?);
                    let data = read_offset_at(
                        region,
                        cur.0 + mapfs_types::FILE_BLOCK_DATA_OFFSET,
                    )?;
                    spans.push(allocated_span(region, data, "file data area")?);
                    total += read_u64_at(region, cur.0 + FILE_BLOCK_IN_USE_OFFSET)?;
                    cur = read_offset_at(region, cur.0 + FILE_BLOCK_NEXT_OFFSET)?;
                }
                if size > total {
                    bail!("file {off} has size {size} but only {total} chained bytes");
                }
            }
        }
    }

    for free in audit_free_list(region)? {
        spans.push(Span {
            start: free.offset,
            len: ALLOC_HEADER_SIZE + free.capacity,
            what: "free block",
        });
    }

    // The spans must tile the region exactly.
    spans.sort_by_key(|s| s.start);
    let mut cursor = 0u64;
    for s in &spans {
        if s.start < cursor {
            bail!(
                "{} at {} overlaps the previous span ending at {}",
                s.what,
                s.start,
                cursor
            );
        }
        if s.start > cursor {
            bail!("unaccounted gap [{cursor}, {}) before {}", s.start, s.what);
        }
        cursor += s.len;
    }
    let slack = region.len() as u64 - cursor;
    if slack >= ALLOC_HEADER_SIZE + FREE_NODE_SIZE {
        bail!("unaccounted tail of {slack} bytes");
    }
    Ok(())
}

// ── Tree snapshots ──────────────────────────────────────────────────────────

/// One node in a tree snapshot: path, kind, and (for files) content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SnapshotEntry {
    pub path: String,
    pub kind: NodeKind,
    pub content: Option<Vec<u8>>,
}

/// Depth-first snapshot of the whole tree, sorted by path. Timestamps are
/// deliberately excluded so snapshots compare "modulo timestamps".
pub fn snapshot(region: &mut [u8]) -> Result<Vec<SnapshotEntry>> {
    let mut fs = MapFs::new(region);
    let mut out = Vec::new();
    let mut stack = vec!["/".to_owned()];
    while let Some(dir) = stack.pop() {
        for entry in fs.readdir(&dir)? {
            let path = if dir == "/" {
                format!("/{}", entry.name_str())
            } else {
                format!("{dir}/{}", entry.name_str())
            };
            match entry.kind {
                NodeKind::Directory => {
                    out.push(SnapshotEntry {
                        path: path.clone(),
                        kind: NodeKind::Directory,
                        content: None,
                    });
                    stack.push(path);
                }
                NodeKind::File => {
                    let size = fs.getattr(0, 0, &path)?.size;
                    let content = fs.read(&path, 0, usize::try_from(size)?)?;
                    out.push(SnapshotEntry {
                        path,
                        kind: NodeKind::File,
                        content: Some(content),
                    });
                }
            }
        }
    }
    out.sort();
    Ok(out)
}
