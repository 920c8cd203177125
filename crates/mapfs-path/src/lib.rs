#![forbid(unsafe_code)]
//! Path tokenisation and resolution.
//!
//! Paths are absolute (`/`-separated); duplicate and trailing separators
//! are ignored. `.` stays in place and `..` follows slot 0 of the current
//! directory's children array; at the root, `..` stays at the root.
//!
//! `resolve` optionally skips the final component, which is the shape all
//! create/delete/rename call sites need: resolve the parent directory,
//! then handle the last name themselves.

use mapfs_error::{MapFsError, Result};
use mapfs_inode::{find_child, parent_of, Inode};
use mapfs_types::{read_offset_at, RegionOffset, SUPERBLOCK_ROOT_OFFSET};

/// Split an absolute path into components, dropping empty tokens so that
/// `"/a//b/"` and `"/a/b"` read the same. `.` and `..` stay as tokens for
/// the resolver.
pub fn tokenize(path: &str) -> Result<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(MapFsError::InvalidArgument("path is not absolute"));
    }
    Ok(path.split('/').filter(|t| !t.is_empty()).collect())
}

/// The final component of a path, validated for create/rename sites:
/// must exist and must not be `.` or `..`.
pub fn final_component(path: &str) -> Result<&str> {
    let tokens = tokenize(path)?;
    match tokens.last() {
        None => Err(MapFsError::InvalidArgument("path has no final component")),
        Some(&"." | &"..") => Err(MapFsError::InvalidArgument(
            "final component is '.' or '..'",
        )),
        Some(last) => Ok(last),
    }
}

/// Offset of the root inode as recorded in the superblock.
pub fn root_offset(region: &[u8]) -> Result<RegionOffset> {
    let root = read_offset_at(region, SUPERBLOCK_ROOT_OFFSET)?;
    if root.is_null() {
        return Err(MapFsError::Corrupt {
            offset: SUPERBLOCK_ROOT_OFFSET,
            detail: "superblock has no root inode".to_owned(),
        });
    }
    Ok(root)
}

/// Resolve `path` to an inode offset, skipping the final `skip_tail`
/// components (0 resolves the node itself, 1 its parent directory).
///
/// Traversal through a file is `ENOTDIR`; a missing component is `ENOENT`.
pub fn resolve(region: &[u8], path: &str, skip_tail: usize) -> Result<RegionOffset> {
    let tokens = tokenize(path)?;
    let take = tokens.len().saturating_sub(skip_tail);
    let root = root_offset(region)?;

    let mut cur = root;
    for token in &tokens[..take] {
        let node = Inode::load(region, cur)?;
        match *token {
            "." => {
                // Still must be a directory to traverse through.
                node.as_dir()?;
            }
            ".." => {
                let parent = parent_of(region, &node)?;
                cur = if parent.is_null() { root } else { parent };
            }
            name => {
                match find_child(region, &node, name.as_bytes())? {
                    Some((_, child)) => cur = child,
                    None => return Err(MapFsError::NotFound(path.to_owned())),
                }
            }
        }
    }
    Ok(cur)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mapfs_inode::{append_child, set_child_at, InodeBody};
    use mapfs_types::{
        write_offset_at, TimeSpec, CHILD_SLOT_SIZE, DIR_INITIAL_SLOTS, INODE_SIZE,
        SUPERBLOCK_SIZE,
    };

    fn now() -> TimeSpec {
        TimeSpec {
            sec: 1_700_000_000,
            nsec: 0,
        }
    }

    /// Hand-build a region with `/`, `/dir`, `/dir/leaf`, `/file`.
    fn sample_region() -> (Vec<u8>, RegionOffset, RegionOffset, RegionOffset) {
        let mut region = vec![0u8; 16384];
        mapfs_alloc::init_free_space(&mut region, SUPERBLOCK_SIZE).unwrap();

        // Root directory ("/" is not a legal child name, so the record is
        // built directly).
        let root_children =
            mapfs_alloc::alloc(&mut region, DIR_INITIAL_SLOTS * CHILD_SLOT_SIZE).unwrap();
        set_child_at(&mut region, root_children, 0, RegionOffset::NULL).unwrap();
        let mut root = Inode {
            name: b"/".to_vec(),
            atime: now(),
            mtime: now(),
            body: InodeBody::Directory {
                child_count: 1,
                children: root_children,
            },
        };
        let root_off = mapfs_alloc::alloc(&mut region, INODE_SIZE).unwrap();
        write_offset_at(&mut region, SUPERBLOCK_ROOT_OFFSET, root_off).unwrap();

        // /dir
        let dir_children =
            mapfs_alloc::alloc(&mut region, DIR_INITIAL_SLOTS * CHILD_SLOT_SIZE).unwrap();
        set_child_at(&mut region, dir_children, 0, root_off).unwrap();
        let mut dir = Inode::new_dir(b"dir", now(), dir_children).unwrap();
        let dir_off = mapfs_alloc::alloc(&mut region, INODE_SIZE).unwrap();

        // /dir/leaf
        let leaf = Inode::new_file(b"leaf", now()).unwrap();
        let leaf_off = mapfs_alloc::alloc(&mut region, INODE_SIZE).unwrap();
        leaf.store(&mut region, leaf_off).unwrap();
        append_child(&mut region, &mut dir, leaf_off).unwrap();
        dir.store(&mut region, dir_off).unwrap();

        // /file
        let file = Inode::new_file(b"file", now()).unwrap();
        let file_off = mapfs_alloc::alloc(&mut region, INODE_SIZE).unwrap();
        file.store(&mut region, file_off).unwrap();

        append_child(&mut region, &mut root, dir_off).unwrap();
        append_child(&mut region, &mut root, file_off).unwrap();
        root.store(&mut region, root_off).unwrap();

        (region, root_off, dir_off, leaf_off)
    }

    #[test]
    fn tokenize_drops_empty_components() {
        assert_eq!(tokenize("/").unwrap(), Vec::<&str>::new());
        assert_eq!(tokenize("/a/b").unwrap(), vec!["a", "b"]);
        assert_eq!(tokenize("/a//b/").unwrap(), vec!["a", "b"]);
        assert_eq!(tokenize("/a/./..").unwrap(), vec!["a", ".", ".."]);
        assert!(matches!(
            tokenize("relative/path"),
            Err(MapFsError::InvalidArgument(_))
        ));
        assert!(matches!(tokenize(""), Err(MapFsError::InvalidArgument(_))));
    }

    #[test]
    fn final_component_validation() {
        assert_eq!(final_component("/a/b").unwrap(), "b");
        assert_eq!(final_component("/a/b/").unwrap(), "b");
        assert!(final_component("/").is_err());
        assert!(final_component("/a/.").is_err());
        assert!(final_component("/a/..").is_err());
    }

    #[test]
    fn resolve_root_and_children() {
        let (region, root_off, dir_off, leaf_off) = sample_region();
        assert_eq!(resolve(&region, "/", 0).unwrap(), root_off);
        assert_eq!(resolve(&region, "/dir", 0).unwrap(), dir_off);
        assert_eq!(resolve(&region, "/dir/leaf", 0).unwrap(), leaf_off);
        assert_eq!(resolve(&region, "/dir/leaf/", 0).unwrap(), leaf_off);
    }

    #[test]
    fn resolve_parent_with_skip_tail() {
        let (region, root_off, dir_off, _) = sample_region();
        assert_eq!(resolve(&region, "/dir/leaf", 1).unwrap(), dir_off);
        assert_eq!(resolve(&region, "/dir", 1).unwrap(), root_off);
        // Missing leaves don't matter when the tail is skipped.
        assert_eq!(resolve(&region, "/dir/nope", 1).unwrap(), dir_off);
    }

    #[test]
    fn resolve_dot_and_dotdot() {
        let (region, root_off, dir_off, leaf_off) = sample_region();
        assert_eq!(resolve(&region, "/./dir", 0).unwrap(), dir_off);
        assert_eq!(resolve(&region, "/dir/..", 0).unwrap(), root_off);
        assert_eq!(resolve(&region, "/dir/../dir/leaf", 0).unwrap(), leaf_off);
        // `..` at the root stays at the root.
        assert_eq!(resolve(&region, "/..", 0).unwrap(), root_off);
        assert_eq!(resolve(&region, "/../dir", 0).unwrap(), dir_off);
    }

    #[test]
    fn resolve_missing_component_is_not_found() {
        let (region, _, _, _) = sample_region();
        assert!(matches!(
            resolve(&region, "/nope", 0),
            Err(MapFsError::NotFound(_))
        ));
        assert!(matches!(
            resolve(&region, "/dir/nope", 0),
            Err(MapFsError::NotFound(_))
        ));
    }

    #[test]
    fn resolve_through_file_is_not_directory() {
        let (region, _, _, _) = sample_region();
        assert!(matches!(
            resolve(&region, "/file/x", 0),
            Err(MapFsError::NotDirectory)
        ));
        assert!(matches!(
            resolve(&region, "/dir/leaf/deeper", 0),
            Err(MapFsError::NotDirectory)
        ));
    }

    #[test]
    fn resolve_endpoint_may_be_a_file() {
        // Kind checks apply to traversal, not the endpoint.
        let (region, _, _, _) = sample_region();
        assert!(resolve(&region, "/file", 0).is_ok());
    }

    #[test]
    fn dotdot_of_subdir_reaches_root_children() {
        let (region, _, _, leaf_off) = sample_region();
        assert_eq!(
            resolve(&region, "/dir/../dir/../dir/leaf", 0).unwrap(),
            leaf_off
        );
        // `..` cannot traverse through a file.
        assert!(matches!(
            resolve(&region, "/file/..", 0),
            Err(MapFsError::NotDirectory)
        ));
    }
}
