//! FUSE facade: mirrors every callback onto the target directory and keeps
//! the cache in step for the ones that touch file content or path identity.
//!
//! The kernel talks in inode numbers, so the facade keeps a bidirectional
//! table of virtual inode to virtual path (root is inode 1). Those numbers
//! are facade-local; the cache itself is keyed by the *target* filesystem's
//! inode numbers, which is what makes hard links and renames share one
//! cache body.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    consts::FOPEN_KEEP_CACHE, FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr,
    ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs,
    ReplyWrite, Request, TimeOrNow,
};
use libc::c_int;
use libc::{O_ACCMODE, O_APPEND, O_CREAT, O_EXCL, O_RDONLY, O_RDWR, O_TRUNC, O_WRONLY};
use log::{debug, warn};
use nix::sys::stat::{mknod, Mode, SFlag, UtimensatFlags};
use nix::sys::statvfs::statvfs;
use nix::sys::time::TimeSpec;
use nix::unistd::{chown, Gid, Uid};

use crate::error::CacheError;
use crate::file_cache::{self, now_secs, FileDataCache};
use crate::meta::SharedStore;

const TTL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct DirInfo {
    ino: u64,
    kind: FileType,
    name: OsString,
}

#[derive(Debug)]
struct OpenFile {
    target: File,
    cache: Option<FileDataCache>,
    path: PathBuf,
}

/// The mounted filesystem.
#[derive(Debug)]
pub struct CacheFs {
    target: PathBuf,
    cache_root: PathBuf,
    store: SharedStore,
    /// Source of virtual inode numbers and file handles.
    counter: u64,
    ino_to_path: HashMap<u64, PathBuf>,
    path_to_ino: HashMap<PathBuf, u64>,
    open_files: HashMap<u64, OpenFile>,
    open_dirs: HashMap<u64, Vec<DirInfo>>,
}

fn errno(e: &io::Error) -> c_int {
    e.raw_os_error().unwrap_or(libc::EIO)
}

fn file_type_of(t: std::fs::FileType) -> FileType {
    use std::os::unix::fs::FileTypeExt;
    match t {
        x if x.is_symlink() => FileType::Symlink,
        x if x.is_dir() => FileType::Directory,
        x if x.is_fifo() => FileType::NamedPipe,
        x if x.is_char_device() => FileType::CharDevice,
        x if x.is_block_device() => FileType::BlockDevice,
        x if x.is_socket() => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn attr_from_meta(m: &fs::Metadata, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: m.size(),
        blocks: m.blocks(),
        atime: m.accessed().unwrap_or(UNIX_EPOCH),
        mtime: m.modified().unwrap_or(UNIX_EPOCH),
        ctime: UNIX_EPOCH + Duration::new(m.ctime().max(0) as u64, m.ctime_nsec() as u32),
        crtime: m.created().unwrap_or(UNIX_EPOCH),
        kind: file_type_of(m.file_type()),
        perm: m.mode() as u16,
        nlink: m.nlink() as u32,
        uid: m.uid(),
        gid: m.gid(),
        rdev: m.rdev() as u32,
        blksize: m.blksize() as u32,
        flags: 0,
    }
}

fn open_options(flags: i32) -> Option<OpenOptions> {
    let mut oo = OpenOptions::new();
    match flags & O_ACCMODE {
        O_RDONLY => {
            oo.read(true);
        }
        O_WRONLY => {
            oo.write(true);
        }
        O_RDWR => {
            oo.read(true).write(true);
        }
        _ => return None,
    }
    // O_APPEND stays off on the target handle: the kernel resolves append
    // writes to absolute offsets, and pwrite on an O_APPEND fd would ignore
    // them.
    oo.truncate(flags & O_TRUNC != 0);
    Some(oo)
}

/// `p` rewritten from under `old` to under `new`, or `None` when `p` is not
/// `old` or below it.
fn rebased(p: &Path, old: &Path, new: &Path) -> Option<PathBuf> {
    let rest = p.strip_prefix(old).ok()?;
    if rest.as_os_str().is_empty() {
        Some(new.to_path_buf())
    } else {
        Some(new.join(rest))
    }
}

/// Read as much as the file holds at `offset`, up to `buf.len()` bytes.
fn read_full_at(f: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match f.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

fn timespec(t: Option<TimeOrNow>) -> TimeSpec {
    match t {
        Some(TimeOrNow::SpecificTime(st)) => match st.duration_since(UNIX_EPOCH) {
            Ok(d) => TimeSpec::new(d.as_secs() as libc::time_t, d.subsec_nanos() as libc::c_long),
            Err(_) => TimeSpec::new(0, 0),
        },
        Some(TimeOrNow::Now) => TimeSpec::new(0, libc::UTIME_NOW),
        None => TimeSpec::new(0, libc::UTIME_OMIT),
    }
}

impl CacheFs {
    /// Build a facade over `target`, with shadow files and the metadata
    /// store under `cache_root`.
    pub fn new(target: PathBuf, cache_root: PathBuf, store: SharedStore) -> CacheFs {
        let mut fs = CacheFs {
            target,
            cache_root,
            store,
            counter: 2,
            ino_to_path: HashMap::new(),
            path_to_ino: HashMap::new(),
            open_files: HashMap::new(),
            open_dirs: HashMap::new(),
        };
        fs.ino_to_path.insert(1, PathBuf::from("/"));
        fs.path_to_ino.insert(PathBuf::from("/"), 1);
        fs
    }

    fn next_id(&mut self) -> u64 {
        let id = self.counter;
        self.counter += 1;
        id
    }

    fn physical_path(&self, vpath: &Path) -> PathBuf {
        match vpath.strip_prefix("/") {
            Ok(rest) => self.target.join(rest),
            Err(_) => self.target.join(vpath),
        }
    }

    fn vpath_of(&self, ino: u64) -> Option<PathBuf> {
        self.ino_to_path.get(&ino).cloned()
    }

    fn child_vpath(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.ino_to_path.get(&parent).map(|p| p.join(name))
    }

    fn ino_for_vpath(&mut self, vpath: &Path) -> u64 {
        if let Some(ino) = self.path_to_ino.get(vpath) {
            return *ino;
        }
        let ino = self.next_id();
        self.path_to_ino.insert(vpath.to_path_buf(), ino);
        self.ino_to_path.insert(ino, vpath.to_path_buf());
        ino
    }

    fn drop_vpath(&mut self, vpath: &Path) {
        if let Some(ino) = self.path_to_ino.remove(vpath) {
            self.ino_to_path.remove(&ino);
        }
    }

    /// Rewrite the inode table after `old` (a file or a whole directory)
    /// moved to `new`.
    fn rebind_tree(&mut self, old: &Path, new: &Path) {
        if let Some(ino) = self.path_to_ino.remove(new) {
            self.ino_to_path.remove(&ino);
        }
        let moved: Vec<(u64, PathBuf)> = self
            .ino_to_path
            .iter()
            .filter_map(|(ino, p)| rebased(p, old, new).map(|np| (*ino, np)))
            .collect();
        for (ino, np) in moved {
            if let Some(op) = self.ino_to_path.insert(ino, np.clone()) {
                self.path_to_ino.remove(&op);
            }
            self.path_to_ino.insert(np, ino);
        }
    }

    /// The metadata-store key for a virtual path. Paths that are not valid
    /// UTF-8 pass through to the target but are never cached.
    fn cache_key(vpath: &Path) -> Option<&str> {
        vpath.to_str()
    }

    /// Bind an opened target file to the cache. Any failure here downgrades
    /// the handle to plain passthrough.
    fn open_cache(&self, vpath: &Path, target: &File, truncate: bool) -> Option<FileDataCache> {
        let key = match Self::cache_key(vpath) {
            Some(key) => key,
            None => {
                warn!("not caching non-UTF-8 path {vpath:?}");
                return None;
            }
        };
        let meta = match target.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!("stat of target {vpath:?} failed, not caching: {e}");
                return None;
            }
        };
        if !meta.is_file() {
            return None;
        }
        match FileDataCache::open(
            self.store.clone(),
            &self.cache_root,
            key,
            Some(meta.ino()),
            truncate,
        ) {
            Ok(cache) => Some(cache),
            Err(e) => {
                warn!("cache disabled for {key}: {e}");
                None
            }
        }
    }

    /// Best-effort truncate of the cache state for a path, preferring not
    /// to fail: a path nothing is known about is simply skipped.
    fn truncate_cache(&mut self, vpath: &Path, len: u64) {
        for of in self.open_files.values_mut() {
            if of.path == vpath {
                if let Some(cache) = of.cache.as_mut() {
                    if let Err(e) = cache.truncate(len) {
                        warn!("cache truncate of {vpath:?} failed: {e}");
                    }
                    return;
                }
            }
        }
        let key = match Self::cache_key(vpath) {
            Some(key) => key,
            None => return,
        };
        match FileDataCache::open(self.store.clone(), &self.cache_root, key, None, false) {
            Ok(mut cache) => {
                if let Err(e) = cache.truncate(len) {
                    warn!("cache truncate of {key} failed: {e}");
                }
            }
            Err(CacheError::NotCached) => {}
            Err(e) => warn!("cache truncate of {key} failed: {e}"),
        }
    }
}

impl Filesystem for CacheFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let vpath = match self.child_vpath(parent, name) {
            Some(p) => p,
            None => return reply.error(libc::ENOENT),
        };
        match fs::symlink_metadata(self.physical_path(&vpath)) {
            Ok(m) => {
                let ino = self.ino_for_vpath(&vpath);
                reply.entry(&TTL, &attr_from_meta(&m, ino), 0);
            }
            Err(e) => {
                if e.kind() == io::ErrorKind::NotFound {
                    self.drop_vpath(&vpath);
                }
                reply.error(errno(&e));
            }
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let vpath = match self.vpath_of(ino) {
            Some(p) => p,
            None => return reply.error(libc::ENOENT),
        };
        match fs::symlink_metadata(self.physical_path(&vpath)) {
            Ok(m) => {
                let mut attr = attr_from_meta(&m, ino);
                attr.atime = SystemTime::now();
                reply.attr(&TTL, &attr);
            }
            Err(e) => {
                if e.kind() == io::ErrorKind::NotFound {
                    self.drop_vpath(&vpath);
                }
                reply.error(errno(&e));
            }
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let vpath = match self.vpath_of(ino) {
            Some(p) => p,
            None => return reply.error(libc::ENOENT),
        };
        let phys = self.physical_path(&vpath);

        if let Some(mode) = mode {
            debug!("chmod {vpath:?} to {mode:o}");
            let perm = fs::Permissions::from_mode(mode);
            if let Err(e) = fs::set_permissions(&phys, perm) {
                return reply.error(errno(&e));
            }
        }

        if uid.is_some() || gid.is_some() {
            debug!("chown {vpath:?} to {uid:?}:{gid:?}");
            if let Err(e) = chown(&phys, uid.map(Uid::from_raw), gid.map(Gid::from_raw)) {
                return reply.error(e as c_int);
            }
        }

        if let Some(size) = size {
            debug!("truncate {vpath:?} to {size}");
            let truncated = match fh.and_then(|fh| self.open_files.get(&fh)) {
                Some(of) => of.target.set_len(size),
                None => OpenOptions::new()
                    .write(true)
                    .open(&phys)
                    .and_then(|f| f.set_len(size)),
            };
            if let Err(e) = truncated {
                return reply.error(errno(&e));
            }
            self.truncate_cache(&vpath, size);
        }

        if atime.is_some() || mtime.is_some() {
            let res = nix::sys::stat::utimensat(
                None,
                &phys,
                &timespec(atime),
                &timespec(mtime),
                UtimensatFlags::NoFollowSymlink,
            );
            if let Err(e) = res {
                return reply.error(e as c_int);
            }
        }

        match fs::symlink_metadata(&phys) {
            Ok(m) => reply.attr(&TTL, &attr_from_meta(&m, ino)),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let vpath = match self.vpath_of(ino) {
            Some(p) => p,
            None => return reply.error(libc::ENOENT),
        };
        match fs::read_link(self.physical_path(&vpath)) {
            Ok(link) => reply.data(link.as_os_str().as_bytes()),
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let vpath = match self.child_vpath(parent, name) {
            Some(p) => p,
            None => return reply.error(libc::ENOENT),
        };
        let phys = self.physical_path(&vpath);
        let kind = SFlag::from_bits_truncate(mode & libc::S_IFMT);
        let perm = Mode::from_bits_truncate(mode & !libc::S_IFMT);
        if let Err(e) = mknod(&phys, kind, perm, rdev as libc::dev_t) {
            return reply.error(e as c_int);
        }
        match fs::symlink_metadata(&phys) {
            Ok(m) => {
                let ino = self.ino_for_vpath(&vpath);
                reply.entry(&TTL, &attr_from_meta(&m, ino), 0);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let vpath = match self.child_vpath(parent, name) {
            Some(p) => p,
            None => return reply.error(libc::ENOENT),
        };
        let phys = self.physical_path(&vpath);
        let mut builder = fs::DirBuilder::new();
        builder.mode(mode);
        if let Err(e) = builder.create(&phys) {
            return reply.error(errno(&e));
        }
        match fs::symlink_metadata(&phys) {
            Ok(m) => {
                let ino = self.ino_for_vpath(&vpath);
                reply.entry(&TTL, &attr_from_meta(&m, ino), 0);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let vpath = match self.child_vpath(parent, name) {
            Some(p) => p,
            None => return reply.error(libc::ENOENT),
        };
        if let Err(e) = fs::remove_file(self.physical_path(&vpath)) {
            return reply.error(errno(&e));
        }
        if let Some(key) = Self::cache_key(&vpath) {
            if let Err(e) = file_cache::forget_path(&self.store, &self.cache_root, key) {
                warn!("cache unlink of {key} failed: {e}");
            }
        }
        self.drop_vpath(&vpath);
        reply.ok();
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let vpath = match self.child_vpath(parent, name) {
            Some(p) => p,
            None => return reply.error(libc::ENOENT),
        };
        if let Err(e) = fs::remove_dir(self.physical_path(&vpath)) {
            return reply.error(errno(&e));
        }
        if let Some(key) = Self::cache_key(&vpath) {
            // The shadow mirror of an empty directory is itself empty.
            let _ = fs::remove_dir(file_cache::shadow_path(&self.cache_root, key));
        }
        self.drop_vpath(&vpath);
        reply.ok();
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        link: &Path,
        reply: ReplyEntry,
    ) {
        let vpath = match self.child_vpath(parent, name) {
            Some(p) => p,
            None => return reply.error(libc::ENOENT),
        };
        let phys = self.physical_path(&vpath);
        if let Err(e) = std::os::unix::fs::symlink(link, &phys) {
            return reply.error(errno(&e));
        }
        match fs::symlink_metadata(&phys) {
            Ok(m) => {
                let ino = self.ino_for_vpath(&vpath);
                reply.entry(&TTL, &attr_from_meta(&m, ino), 0);
            }
            Err(e) => reply.error(errno(&e)),
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
        let (old_vpath, new_vpath) = match (
            self.child_vpath(parent, name),
            self.child_vpath(newparent, newname),
        ) {
            (Some(o), Some(n)) => (o, n),
            _ => return reply.error(libc::ENOENT),
        };
        if old_vpath == new_vpath {
            return reply.ok();
        }
        if let Err(e) = fs::rename(
            self.physical_path(&old_vpath),
            self.physical_path(&new_vpath),
        ) {
            return reply.error(errno(&e));
        }

        self.rebind_tree(&old_vpath, &new_vpath);
        if let (Some(old_key), Some(new_key)) =
            (Self::cache_key(&old_vpath), Self::cache_key(&new_vpath))
        {
            // The destination's previous content (if any) is gone now.
            if let Err(e) = file_cache::forget_path(&self.store, &self.cache_root, new_key) {
                warn!("cache cleanup of {new_key} failed: {e}");
            }
            if let Err(e) = file_cache::relocate(&self.store, &self.cache_root, old_key, new_key) {
                warn!("cache rename {old_key} -> {new_key} failed: {e}");
            }
        }
        let updates: Vec<(u64, PathBuf)> = self
            .open_files
            .iter()
            .filter_map(|(fh, of)| rebased(&of.path, &old_vpath, &new_vpath).map(|np| (*fh, np)))
            .collect();
        for (fh, np) in updates {
            if let Some(of) = self.open_files.get_mut(&fh) {
                of.path = np.clone();
                if let (Some(cache), Some(key)) = (of.cache.as_mut(), np.to_str()) {
                    cache.follow_rename(key);
                }
            }
        }
        reply.ok();
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let old_vpath = match self.vpath_of(ino) {
            Some(p) => p,
            None => return reply.error(libc::ENOENT),
        };
        let new_vpath = match self.child_vpath(newparent, newname) {
            Some(p) => p,
            None => return reply.error(libc::ENOENT),
        };
        let new_phys = self.physical_path(&new_vpath);
        if let Err(e) = fs::hard_link(self.physical_path(&old_vpath), &new_phys) {
            return reply.error(errno(&e));
        }
        match fs::symlink_metadata(&new_phys) {
            Ok(m) => {
                // Bind the alias to the same node so a later open hard-links
                // the shadow body instead of refetching.
                if let Some(key) = Self::cache_key(&new_vpath) {
                    let meta = self.store.lock();
                    let bound = meta
                        .upsert_node(m.ino(), now_secs())
                        .and_then(|()| meta.upsert_path(key, m.ino()));
                    if let Err(e) = bound {
                        warn!("cache link of {key} failed: {e}");
                    }
                }
                let new_ino = self.ino_for_vpath(&new_vpath);
                reply.entry(&TTL, &attr_from_meta(&m, new_ino), 0);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let vpath = match self.vpath_of(ino) {
            Some(p) => p,
            None => return reply.error(libc::ENOENT),
        };
        if flags & (O_EXCL | O_CREAT) != 0 {
            // Creation goes through create(), never open().
            return reply.error(libc::EINVAL);
        }
        let mut oo = match open_options(flags) {
            Some(oo) => oo,
            None => return reply.error(libc::EINVAL),
        };
        oo.create(false);
        match oo.open(self.physical_path(&vpath)) {
            Ok(f) => {
                let cache = self.open_cache(&vpath, &f, flags & O_TRUNC != 0);
                let fh = self.next_id();
                self.open_files.insert(
                    fh,
                    OpenFile {
                        target: f,
                        cache,
                        path: vpath,
                    },
                );
                reply.opened(fh, FOPEN_KEEP_CACHE);
            }
            Err(e) => {
                if e.kind() == io::ErrorKind::NotFound {
                    self.drop_vpath(&vpath);
                }
                reply.error(errno(&e));
            }
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let vpath = match self.child_vpath(parent, name) {
            Some(p) => p,
            None => return reply.error(libc::ENOENT),
        };
        let phys = self.physical_path(&vpath);
        let mut oo = match open_options(flags) {
            Some(oo) => oo,
            None => return reply.error(libc::EINVAL),
        };
        if flags & O_ACCMODE == O_RDONLY {
            // std refuses create-without-write; the fd is ours, so widen it.
            oo.write(true);
        }
        oo.create(flags & O_CREAT != 0);
        oo.create_new(flags & O_EXCL != 0);
        oo.mode(mode);
        match oo.open(&phys) {
            Ok(f) => {
                let m = match f.metadata() {
                    Ok(m) => m,
                    Err(e) => return reply.error(errno(&e)),
                };
                let ino = self.ino_for_vpath(&vpath);
                let cache = self.open_cache(&vpath, &f, flags & O_TRUNC != 0);
                let fh = self.next_id();
                self.open_files.insert(
                    fh,
                    OpenFile {
                        target: f,
                        cache,
                        path: vpath,
                    },
                );
                reply.created(&TTL, &attr_from_meta(&m, ino), 0, fh, FOPEN_KEEP_CACHE);
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        let offset = offset as u64;
        let of = match self.open_files.get_mut(&fh) {
            Some(of) => of,
            None => return reply.error(libc::EBADF),
        };

        if let Some(cache) = of.cache.as_mut() {
            match cache.read(size, offset) {
                Ok(buf) => {
                    debug!("cache hit: {} bytes at {offset} of {:?}", buf.len(), of.path);
                    return reply.data(&buf);
                }
                Err(CacheError::Miss) => {}
                Err(e) => warn!("cache read of {:?} failed, going to target: {e}", of.path),
            }
        }

        let mut buf = vec![0u8; size as usize];
        let n = match read_full_at(&of.target, &mut buf, offset) {
            Ok(n) => n,
            Err(e) => return reply.error(errno(&e)),
        };
        buf.truncate(n);

        // A short target read means we crossed EOF; otherwise probe one byte
        // past the range so a full read that exactly reaches EOF still gets
        // remembered as the last block.
        let mut last = n < size as usize;
        if !last {
            let mut probe = [0u8; 1];
            if let Ok(0) = of.target.read_at(&mut probe, offset + n as u64) {
                last = true;
            }
        }
        if let Some(cache) = of.cache.as_mut() {
            if let Err(e) = cache.update(&buf, offset, last) {
                warn!("cache update of {:?} failed: {e}", of.path);
            }
        }
        reply.data(&buf);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        let offset = offset as u64;
        let of = match self.open_files.get_mut(&fh) {
            Some(of) => of,
            None => return reply.error(libc::EBADF),
        };

        if let Err(e) = of.target.write_all_at(data, offset) {
            return reply.error(errno(&e));
        }
        if let Some(cache) = of.cache.as_mut() {
            let last = match of.target.metadata() {
                Ok(m) => offset + data.len() as u64 == m.size(),
                Err(_) => false,
            };
            if let Err(e) = cache.update(data, offset, last) {
                warn!("cache update of {:?} failed: {e}", of.path);
            }
        }
        reply.written(data.len() as u32);
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        if self.open_files.contains_key(&fh) {
            reply.ok();
        } else {
            reply.error(libc::EBADF);
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.open_files.remove(&fh) {
            Some(of) => {
                if let Some(cache) = of.cache {
                    debug!(
                        "closing {:?}: {} bytes from cache, {} misses",
                        of.path,
                        cache.hit_bytes(),
                        cache.misses()
                    );
                    if let Err(e) = cache.close() {
                        warn!("cache close of {:?} failed: {e}", of.path);
                    }
                }
                reply.ok();
            }
            None => reply.error(libc::EBADF),
        }
    }

    fn fsync(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        datasync: bool,
        reply: ReplyEmpty,
    ) {
        let of = match self.open_files.get(&fh) {
            Some(of) => of,
            None => return reply.error(libc::EBADF),
        };
        let res = if datasync {
            of.target.sync_data()
        } else {
            of.target.sync_all()
        };
        match res {
            Ok(()) => {
                if let Some(cache) = of.cache.as_ref() {
                    if let Err(e) = cache.sync() {
                        warn!("cache sync of {:?} failed: {e}", of.path);
                    }
                }
                reply.ok();
            }
            Err(e) => reply.error(errno(&e)),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let vpath = match self.vpath_of(ino) {
            Some(p) => p,
            None => return reply.error(libc::ENOENT),
        };
        let phys = self.physical_path(&vpath);
        let dir = match fs::read_dir(&phys) {
            Ok(dir) => dir,
            Err(e) => return reply.error(errno(&e)),
        };

        let parent_ino = vpath
            .parent()
            .and_then(|p| self.path_to_ino.get(p).copied())
            .unwrap_or(ino);
        let mut entries = vec![
            DirInfo {
                ino,
                kind: FileType::Directory,
                name: OsString::from("."),
            },
            DirInfo {
                ino: parent_ino,
                kind: FileType::Directory,
                name: OsString::from(".."),
            },
        ];
        for entry in dir {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => return reply.error(errno(&e)),
            };
            let name = entry.file_name();
            let kind = entry
                .file_type()
                .map(file_type_of)
                .unwrap_or(FileType::RegularFile);
            let child_ino = self.ino_for_vpath(&vpath.join(&name));
            entries.push(DirInfo {
                ino: child_ino,
                kind,
                name,
            });
        }
        let fh = self.next_id();
        self.open_dirs.insert(fh, entries);
        reply.opened(fh, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.open_dirs.get(&fh) {
            Some(entries) => entries,
            None => return reply.error(libc::EBADF),
        };
        for (i, entry) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(entry.ino, (i + 1) as i64, entry.kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        match self.open_dirs.remove(&fh) {
            Some(_) => reply.ok(),
            None => reply.error(libc::EBADF),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let phys = match self.vpath_of(ino) {
            Some(p) => self.physical_path(&p),
            None => self.target.clone(),
        };
        match statvfs(&phys) {
            Ok(st) => reply.statfs(
                st.blocks() as u64,
                st.blocks_free() as u64,
                st.blocks_available() as u64,
                st.files() as u64,
                st.files_free() as u64,
                st.block_size() as u32,
                st.name_max() as u32,
                st.fragment_size() as u32,
            ),
            Err(e) => reply.error(e as c_int),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let vpath = match self.vpath_of(ino) {
            Some(p) => p,
            None => return reply.error(libc::ENOENT),
        };
        let flags = nix::unistd::AccessFlags::from_bits_truncate(mask);
        match nix::unistd::access(&self.physical_path(&vpath), flags) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e as c_int),
        }
    }
}
