#![forbid(unsafe_code)]
//! FUSE adapter for mapfs.
//!
//! A thin translation layer: kernel requests arrive via the `fuser`
//! crate, inode numbers are mapped to paths through an [`InoTable`], the
//! path-based [`MapFs`] core does the work, and errors are mapped through
//! `MapFsError::to_errno()`.
//!
//! The adapter owns the region image and, when given a backing path,
//! writes the image back on `flush`, `fsync`, and unmount — the last
//! persisted image is what survives.

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow, FUSE_ROOT_ID,
};
use mapfs_core::{MapFs, NodeKind, TimeSpec};
use mapfs_error::MapFsError;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::warn;

/// TTL for cached attributes and entries. The host serialises all access
/// through this process, so short caching is safe.
const ATTR_TTL: Duration = Duration::from_secs(1);

// ── Error type ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FuseError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),
    #[error("mount I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Inode-number table ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct InoEntry {
    parent: u64,
    name: String,
}

/// Maps fuser inode numbers to paths in the path-based core.
///
/// Ino 1 is the root; every other ino records its parent ino and name, so
/// a path is rebuilt by walking to the root. Bindings are created by
/// `lookup`/`readdir`/create operations and dropped on unlink/rmdir.
#[derive(Debug, Default)]
pub struct InoTable {
    entries: HashMap<u64, InoEntry>,
    by_name: HashMap<(u64, String), u64>,
    next: u64,
}

impl InoTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            by_name: HashMap::new(),
            next: FUSE_ROOT_ID + 1,
        }
    }

    /// Absolute path for `ino`, or `None` for a stale number.
    #[must_use]
    pub fn path(&self, ino: u64) -> Option<String> {
        if ino == FUSE_ROOT_ID {
            return Some("/".to_owned());
        }
        let mut segments = Vec::new();
        let mut cur = ino;
        // Generous depth bound; a cycle here would be an adapter bug.
        for _ in 0..4096 {
            let entry = self.entries.get(&cur)?;
            segments.push(entry.name.clone());
            if entry.parent == FUSE_ROOT_ID {
                segments.reverse();
                return Some(format!("/{}", segments.join("/")));
            }
            cur = entry.parent;
        }
        None
    }

    /// Path of `name` under the directory `parent`.
    #[must_use]
    pub fn child_path(&self, parent: u64, name: &str) -> Option<String> {
        let dir = self.path(parent)?;
        if dir == "/" {
            Some(format!("/{name}"))
        } else {
            Some(format!("{dir}/{name}"))
        }
    }

    /// Ino for `name` under `parent`, assigning a fresh one on first use.
    pub fn assign(&mut self, parent: u64, name: &str) -> u64 {
        let key = (parent, name.to_owned());
        if let Some(&ino) = self.by_name.get(&key) {
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.entries.insert(
            ino,
            InoEntry {
                parent,
                name: name.to_owned(),
            },
        );
        self.by_name.insert(key, ino);
        ino
    }

    /// Drop the binding for `name` under `parent` (after unlink/rmdir).
    pub fn remove(&mut self, parent: u64, name: &str) {
        if let Some(ino) = self.by_name.remove(&(parent, name.to_owned())) {
            self.entries.remove(&ino);
        }
    }

    /// Rebind after a rename; a displaced target binding is dropped.
    pub fn rename(&mut self, parent: u64, name: &str, new_parent: u64, new_name: &str) {
        self.remove(new_parent, new_name);
        if let Some(ino) = self.by_name.remove(&(parent, name.to_owned())) {
            self.entries.insert(
                ino,
                InoEntry {
                    parent: new_parent,
                    name: new_name.to_owned(),
                },
            );
            self.by_name.insert((new_parent, new_name.to_owned()), ino);
        }
    }
}

// ── Type conversions ────────────────────────────────────────────────────────

fn to_fuser_file_type(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::File => FileType::RegularFile,
        NodeKind::Directory => FileType::Directory,
    }
}

fn to_file_attr(ino: u64, attr: &mapfs_core::FileAttr) -> FileAttr {
    let mtime = SystemTime::from(attr.mtime);
    FileAttr {
        ino,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: SystemTime::from(attr.atime),
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind: to_fuser_file_type(attr.kind),
        perm: (attr.mode & 0o7777) as u16,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: attr.blksize,
        flags: 0,
    }
}

fn time_or_now(t: TimeOrNow) -> TimeSpec {
    match t {
        TimeOrNow::SpecificTime(t) => TimeSpec::from(t),
        TimeOrNow::Now => TimeSpec::from(SystemTime::now()),
    }
}

/// The core API is `&str`-based; non-UTF-8 names are rejected at this
/// boundary.
fn utf8_name(name: &OsStr) -> Result<&str, c_int> {
    name.to_str().ok_or(libc::EINVAL)
}

// ── FUSE filesystem adapter ─────────────────────────────────────────────────

/// FUSE adapter owning the region image and the ino table.
pub struct MapFuse {
    image: Vec<u8>,
    backing: Option<PathBuf>,
    inos: InoTable,
}

impl MapFuse {
    /// Serve the given image with no persistence.
    #[must_use]
    pub fn new(image: Vec<u8>) -> Self {
        Self {
            image,
            backing: None,
            inos: InoTable::new(),
        }
    }

    /// Serve the given image, writing it back to `backing` on flush,
    /// fsync, and unmount.
    #[must_use]
    pub fn with_backing(image: Vec<u8>, backing: PathBuf) -> Self {
        Self {
            image,
            backing: Some(backing),
            inos: InoTable::new(),
        }
    }

    /// The current image bytes (for tests and hosts that persist
    /// themselves).
    #[must_use]
    pub fn into_image(self) -> Vec<u8> {
        self.image
    }

    fn fs(&mut self) -> MapFs<'_> {
        MapFs::new(&mut self.image)
    }

    fn persist(&self) -> std::io::Result<()> {
        match &self.backing {
            Some(path) => std::fs::write(path, &self.image),
            None => Ok(()),
        }
    }

    fn path_of(&self, ino: u64) -> Result<String, c_int> {
        self.inos.path(ino).ok_or(libc::ENOENT)
    }

    fn child_path_of(&self, parent: u64, name: &OsStr) -> Result<(String, String), c_int> {
        let name = utf8_name(name)?.to_owned();
        let path = self
            .inos
            .child_path(parent, &name)
            .ok_or(libc::ENOENT)?;
        Ok((path, name))
    }

    /// getattr + ino assignment for entry replies.
    fn entry_attr(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &str,
        path: &str,
    ) -> Result<FileAttr, MapFsError> {
        let (uid, gid) = (req.uid(), req.gid());
        let attr = self.fs().getattr(uid, gid, path)?;
        let ino = self.inos.assign(parent, name);
        Ok(to_file_attr(ino, &attr))
    }
}

impl Filesystem for MapFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        Ok(())
    }

    fn destroy(&mut self) {
        if let Err(e) = self.persist() {
            warn!(error = %e, "failed to persist image on unmount");
        }
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let (path, name) = match self.child_path_of(parent, name) {
            Ok(v) => v,
            Err(errno) => return reply.error(errno),
        };
        match self.entry_attr(req, parent, &name, &path) {
            Ok(attr) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(e) => {
                // ENOENT is expected for missing entries — don't warn.
                if e.to_errno() != libc::ENOENT {
                    warn!(parent, %name, error = %e, "lookup failed");
                }
                reply.error(e.to_errno());
            }
        }
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        match self.fs().getattr(req.uid(), req.gid(), &path) {
            Ok(attr) => reply.attr(&ATTR_TTL, &to_file_attr(ino, &attr)),
            Err(e) => {
                warn!(ino, %path, error = %e, "getattr failed");
                reply.error(e.to_errno());
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };

        if let Some(size) = size {
            let Ok(size) = i64::try_from(size) else {
                return reply.error(libc::EINVAL);
            };
            if let Err(e) = self.fs().truncate(&path, size) {
                warn!(ino, %path, size, error = %e, "truncate failed");
                return reply.error(e.to_errno());
            }
        }

        if atime.is_some() || mtime.is_some() {
            // utimens overwrites both; carry the untouched one over.
            let current = match self.fs().getattr(req.uid(), req.gid(), &path) {
                Ok(a) => a,
                Err(e) => return reply.error(e.to_errno()),
            };
            let new_atime = atime.map_or(current.atime, time_or_now);
            let new_mtime = mtime.map_or(current.mtime, time_or_now);
            if let Err(e) = self.fs().utimens(&path, new_atime, new_mtime) {
                warn!(ino, %path, error = %e, "utimens failed");
                return reply.error(e.to_errno());
            }
        }

        match self.fs().getattr(req.uid(), req.gid(), &path) {
            Ok(attr) => reply.attr(&ATTR_TTL, &to_file_attr(ino, &attr)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        // Only regular files; devices and pipes are out of scope.
        if mode & libc::S_IFMT != libc::S_IFREG && mode & libc::S_IFMT != 0 {
            return reply.error(libc::ENOSYS);
        }
        let (path, name) = match self.child_path_of(parent, name) {
            Ok(v) => v,
            Err(errno) => return reply.error(errno),
        };
        if let Err(e) = self.fs().mknod(&path) {
            warn!(parent, %name, error = %e, "mknod failed");
            return reply.error(e.to_errno());
        }
        match self.entry_attr(req, parent, &name, &path) {
            Ok(attr) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let (path, name) = match self.child_path_of(parent, name) {
            Ok(v) => v,
            Err(errno) => return reply.error(errno),
        };
        if let Err(e) = self.fs().mknod(&path) {
            warn!(parent, %name, error = %e, "create failed");
            return reply.error(e.to_errno());
        }
        match self.entry_attr(req, parent, &name, &path) {
            Ok(attr) => reply.created(&ATTR_TTL, &attr, 0, 0, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let (path, name) = match self.child_path_of(parent, name) {
            Ok(v) => v,
            Err(errno) => return reply.error(errno),
        };
        if let Err(e) = self.fs().mkdir(&path) {
            warn!(parent, %name, error = %e, "mkdir failed");
            return reply.error(e.to_errno());
        }
        match self.entry_attr(req, parent, &name, &path) {
            Ok(attr) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let (path, name) = match self.child_path_of(parent, name) {
            Ok(v) => v,
            Err(errno) => return reply.error(errno),
        };
        match self.fs().unlink(&path) {
            Ok(()) => {
                self.inos.remove(parent, &name);
                reply.ok();
            }
            Err(e) => {
                warn!(parent, %name, error = %e, "unlink failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let (path, name) = match self.child_path_of(parent, name) {
            Ok(v) => v,
            Err(errno) => return reply.error(errno),
        };
        match self.fs().rmdir(&path) {
            Ok(()) => {
                self.inos.remove(parent, &name);
                reply.ok();
            }
            Err(e) => {
                warn!(parent, %name, error = %e, "rmdir failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (from, name) = match self.child_path_of(parent, name) {
            Ok(v) => v,
            Err(errno) => return reply.error(errno),
        };
        let (to, newname) = match self.child_path_of(newparent, newname) {
            Ok(v) => v,
            Err(errno) => return reply.error(errno),
        };
        match self.fs().rename(&from, &to) {
            Ok(()) => {
                self.inos.rename(parent, &name, newparent, &newname);
                reply.ok();
            }
            Err(e) => {
                warn!(%from, %to, error = %e, "rename failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        match self.fs().open(&path) {
            // Stateless: no file handles are tracked.
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        match self.fs().open(&path) {
            Ok(()) => reply.opened(0, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        match self.fs().read(&path, offset, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                warn!(ino, %path, offset, size, error = %e, "read failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        match self.fs().write(&path, offset, data) {
            Ok(n) => reply.written(u32::try_from(n).unwrap_or(u32::MAX)),
            Err(e) => {
                warn!(ino, %path, offset, error = %e, "write failed");
                reply.error(e.to_errno());
            }
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(errno) => return reply.error(errno),
        };
        let entries = match self.fs().readdir(&path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(ino, %path, error = %e, "readdir failed");
                return reply.error(e.to_errno());
            }
        };

        let parent_ino = self
            .inos
            .entries
            .get(&ino)
            .map_or(FUSE_ROOT_ID, |e| e.parent);

        // `.` and `..` are synthesised here; the core never reports them.
        let mut rows: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_owned()),
            (parent_ino, FileType::Directory, "..".to_owned()),
        ];
        for entry in &entries {
            let name = entry.name_str().into_owned();
            let child_ino = self.inos.assign(ino, &name);
            rows.push((child_ino, to_fuser_file_type(entry.kind), name));
        }

        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        for (i, (child_ino, kind, name)) in rows.into_iter().enumerate().skip(start) {
            let next_offset = i64::try_from(i).unwrap_or(i64::MAX) + 1;
            if reply.add(child_ino, next_offset, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.fs().statfs() {
            Ok(s) => reply.statfs(
                s.blocks,
                s.blocks_free,
                s.blocks_avail,
                0,
                0,
                s.block_size,
                s.name_max,
                s.block_size,
            ),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.persist() {
            Ok(()) => reply.ok(),
            Err(e) => {
                warn!(error = %e, "flush failed to persist image");
                reply.error(libc::EIO);
            }
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.persist() {
            Ok(()) => reply.ok(),
            Err(e) => {
                warn!(error = %e, "fsync failed to persist image");
                reply.error(libc::EIO);
            }
        }
    }
}

// ── Mount entrypoints ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MountOptions {
    pub allow_other: bool,
    pub auto_unmount: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            allow_other: false,
            auto_unmount: true,
        }
    }
}

fn build_mount_options(options: &MountOptions) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::FSName("mapfs".to_owned()),
        MountOption::Subtype("mapfs".to_owned()),
        MountOption::DefaultPermissions,
    ];
    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }
    opts
}

/// Mount at `mountpoint` and block until unmounted.
pub fn mount(
    fs: MapFuse,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<(), FuseError> {
    let mountpoint = mountpoint.as_ref();
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    let fuse_opts = build_mount_options(options);
    fuser::mount2(fs, mountpoint, &fuse_opts)?;
    Ok(())
}

/// Mount in the background; the filesystem unmounts when the returned
/// session handle is dropped.
pub fn mount_background(
    fs: MapFuse,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<fuser::BackgroundSession, FuseError> {
    let mountpoint = mountpoint.as_ref();
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    let fuse_opts = build_mount_options(options);
    let session = fuser::spawn_mount2(fs, mountpoint, &fuse_opts)?;
    Ok(session)
}

// ── Tests ───────────────────────────────────────────────────────────────────
