//! File system implementation. Five layers:
//!   + Free map: allocator for raw device sectors.
//!   + Inodes: metadata records, reading, writing, grow/shrink.
//!   + Directories: inodes with special contents (lists of other inodes!).
//!   + Names: slash-delimited paths resolved against a working directory.
//!   + Context: the [`FileSystem`] owning device, cache, free map and the
//!     open-inode registry.
//!
//! Lock ordering, outermost first; acquisitions must descend:
//!   1. a process's descriptor-table lock
//!   2. the open-inode registry lock
//!   3. an inode's data rwlock
//!   4. an inode's metadata (resize) lock
//!   5. the free-map lock
//!   6. the block-cache lock
//!
//! The free-map lock covers only the in-memory bitmap and never nests a
//! cache call; the bitmap is persisted from [`FileSystem::flush`] with no
//! other lock held.

use core::fmt;
use std::sync::Arc;

use crate::bio::{BlockCache, CacheStats};
use crate::bitmap::{byte_len, Bitmap};
use crate::device::BlockDevice;
use crate::param::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR};

pub mod directory;
pub mod freemap;
pub mod inode;
pub mod path;

pub use directory::Directory;
pub use inode::{InodeKind, InodeRef};
pub use path::{FileName, Path};

use freemap::FreeMap;
use inode::InodeTable;

/// Why a filesystem operation could not be carried out.
///
/// Internal layers return these; the syscall boundary translates them into
/// scalar sentinels. Malformed on-disk state is not an `FsError`: it is a
/// fatal invariant violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// A path component does not exist.
    NotFound,
    /// An intermediate path component is not a directory.
    NotADirectory,
    /// The operation needs a file but found a directory.
    IsADirectory,
    /// The name is already present in the directory.
    AlreadyExists,
    /// A path component is longer than `NAME_MAX`.
    NameTooLong,
    /// The free map has no sectors left, or a table is full.
    NoSpace,
    /// Removing a directory that still has entries.
    DirectoryNotEmpty,
    /// Removing the root, or something somebody still holds open.
    InUse,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::NotFound => write!(f, "no such file or directory"),
            FsError::NotADirectory => write!(f, "not a directory"),
            FsError::IsADirectory => write!(f, "is a directory"),
            FsError::AlreadyExists => write!(f, "file exists"),
            FsError::NameTooLong => write!(f, "name too long"),
            FsError::NoSpace => write!(f, "no space left on device"),
            FsError::DirectoryNotEmpty => write!(f, "directory not empty"),
            FsError::InUse => write!(f, "in use"),
        }
    }
}

/// Everything below the descriptor layer, owned in one place and injected
/// explicitly. Shared between the public [`FileSystem`] handle, every
/// [`InodeRef`], and every process.
pub(crate) struct FsCore {
    pub(crate) dev: Arc<dyn BlockDevice>,
    pub(crate) cache: BlockCache,
    pub(crate) freemap: FreeMap,
    pub(crate) itable: InodeTable,
}

/// A mounted filesystem.
#[derive(Clone)]
pub struct FileSystem {
    core: Arc<FsCore>,
}

impl FileSystem {
    fn build(dev: Arc<dyn BlockDevice>) -> FileSystem {
        let capacity = dev.capacity();
        FileSystem {
            core: Arc::new(FsCore {
                dev,
                cache: BlockCache::new(),
                freemap: FreeMap::new(capacity),
                itable: InodeTable::new(),
            }),
        }
    }

    /// Creates a fresh filesystem on `dev`: a free-map file at sector 0, an
    /// empty root directory at sector 1.
    pub fn format(dev: Arc<dyn BlockDevice>) -> Result<FileSystem, FsError> {
        let fs = FileSystem::build(dev);
        let capacity = fs.core.dev.capacity();

        inode::create(
            &fs.core,
            FREE_MAP_SECTOR,
            byte_len(capacity as usize),
            InodeKind::File,
        )?;
        Directory::create(&fs.core, ROOT_DIR_SECTOR, ROOT_DIR_SECTOR, 16)?;

        fs.flush();
        log::debug!(
            "fs: formatted {} sectors, {} free",
            capacity,
            fs.core.freemap.free_count()
        );
        Ok(fs)
    }

    /// Mounts a previously formatted device, reading the free map back from
    /// its backing file.
    pub fn mount(dev: Arc<dyn BlockDevice>) -> FileSystem {
        let fs = FileSystem::build(dev);
        let capacity = fs.core.dev.capacity() as usize;

        let handle = InodeTable::open(&fs.core, FREE_MAP_SECTOR);
        let mut bytes = vec![0u8; byte_len(capacity)];
        let read = handle.read_at(&mut bytes, 0);
        assert_eq!(read, bytes.len(), "free-map file is truncated");
        fs.core.freemap.replace(Bitmap::from_bytes(capacity, &bytes));
        fs
    }

    /// Writes the free map back to its file and pushes every dirty cache
    /// buffer to the device.
    pub fn flush(&self) {
        // Snapshot under the free-map lock, persist with no lock held.
        let bytes = self.core.freemap.snapshot();
        let handle = InodeTable::open(&self.core, FREE_MAP_SECTOR);
        let written = handle.write_at(&bytes, 0);
        assert_eq!(written, bytes.len(), "free-map file is truncated");
        drop(handle);
        self.core.cache.flush();
    }

    /// Flushes and drops the cache. The final operation on a filesystem.
    pub fn shutdown(&self) {
        self.flush();
        self.core.cache.shutdown();
    }

    /// Opens the root directory.
    pub fn root(&self) -> Directory {
        Directory::open(InodeTable::open(&self.core, ROOT_DIR_SECTOR))
            .expect("root sector does not hold a directory")
    }

    /// Opens the inode living at `sector`.
    pub fn open_inode(&self, sector: u32) -> InodeRef {
        InodeTable::open(&self.core, sector)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.core.cache.stats()
    }

    /// Sectors currently free on the device.
    pub fn free_sectors(&self) -> usize {
        self.core.freemap.free_count()
    }

    /// Walks every component of `path` except the last, yielding the
    /// directory that would contain the basename and the basename itself
    /// (`""` iff the path is empty or all slashes).
    ///
    /// Absolute paths start at root; others at `cwd`, or root when the
    /// caller has none.
    pub fn resolve_parent<'p>(
        &self,
        cwd: Option<&Directory>,
        path: &'p Path,
    ) -> Result<(Directory, &'p str), FsError> {
        let mut dir = match cwd {
            Some(cwd) if !path.is_absolute() => cwd.reopen(),
            _ => self.root(),
        };
        let mut rest = path;
        loop {
            match rest.split_component()? {
                None => return Ok((dir, "")),
                Some((next, name)) if next.is_empty() => return Ok((dir, name.as_str())),
                Some((next, name)) => {
                    let child = dir.lookup(name)?;
                    dir = Directory::open(child)?;
                    rest = next;
                }
            }
        }
    }

    /// Resolves `path` all the way to an inode. An empty basename (the path
    /// is `/` or ends in slashes) yields the directory's own inode; an
    /// empty path is an error.
    pub fn resolve(&self, cwd: Option<&Directory>, path: &Path) -> Result<InodeRef, FsError> {
        if path.is_empty() {
            return Err(FsError::NotFound);
        }
        let (dir, base) = self.resolve_parent(cwd, path)?;
        if base.is_empty() {
            Ok(dir.inode().clone())
        } else {
            dir.lookup(FileName::new(base)?)
        }
    }

    /// Creates a file of `length` bytes at `path`.
    pub fn create_file(
        &self,
        cwd: Option<&Directory>,
        path: &Path,
        length: usize,
    ) -> Result<(), FsError> {
        self.create_at(cwd, path, |core, sector, _parent| {
            inode::create(core, sector, length, InodeKind::File)
        })
    }

    /// Creates an empty directory at `path`.
    pub fn create_dir(&self, cwd: Option<&Directory>, path: &Path) -> Result<(), FsError> {
        self.create_at(cwd, path, |core, sector, parent| {
            Directory::create(core, sector, parent, 16)
        })
    }

    fn create_at(
        &self,
        cwd: Option<&Directory>,
        path: &Path,
        build: impl FnOnce(&Arc<FsCore>, u32, u32) -> Result<(), FsError>,
    ) -> Result<(), FsError> {
        if path.is_empty() {
            return Err(FsError::NotFound);
        }
        let (dir, base) = self.resolve_parent(cwd, path)?;
        if base.is_empty() {
            return Err(FsError::AlreadyExists);
        }
        let name = FileName::new(base)?;
        if dir.lookup(name).is_ok() {
            return Err(FsError::AlreadyExists);
        }

        let sector = self.core.freemap.allocate(1).ok_or(FsError::NoSpace)?;
        if let Err(err) = build(&self.core, sector, dir.inode().sector()) {
            self.core.freemap.release(sector, 1);
            return Err(err);
        }
        if let Err(err) = dir.add(name, sector) {
            // The entry never existed; reclaim the inode and its sectors.
            let handle = InodeTable::open(&self.core, sector);
            handle.remove();
            return Err(err);
        }
        Ok(())
    }

    /// Removes the file or directory at `path`. Data stays reachable
    /// through handles already open; the sectors return to the free map at
    /// the last close.
    pub fn remove(&self, cwd: Option<&Directory>, path: &Path) -> Result<(), FsError> {
        if path.is_empty() {
            return Err(FsError::NotFound);
        }
        let (dir, base) = self.resolve_parent(cwd, path)?;
        if base.is_empty() {
            // "/" or a trailing-slash alias for it.
            return Err(FsError::InUse);
        }
        dir.remove(FileName::new(base)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;
    use crate::param::NAME_MAX;

    fn p(s: &str) -> &Path {
        Path::new(s)
    }

    #[test]
    fn format_then_mount_round_trips() {
        let disk = Arc::new(MemDisk::new(1024));
        let dev: Arc<dyn BlockDevice> = disk;

        let fs = FileSystem::format(Arc::clone(&dev)).unwrap();
        fs.create_dir(None, p("/etc")).unwrap();
        fs.create_file(None, p("/etc/motd"), 0).unwrap();
        let handle = fs.resolve(None, p("/etc/motd")).unwrap();
        assert_eq!(handle.write_at(b"welcome aboard", 0), 14);
        drop(handle);
        let free_before = fs.free_sectors();
        fs.shutdown();

        let fs = FileSystem::mount(dev);
        assert_eq!(fs.free_sectors(), free_before);
        let handle = fs.resolve(None, p("/etc/motd")).unwrap();
        let mut buf = [0u8; 14];
        assert_eq!(handle.read_at(&mut buf, 0), 14);
        assert_eq!(&buf, b"welcome aboard");
    }

    #[test]
    fn resolver_edge_cases() {
        let fs = FileSystem::format(Arc::new(MemDisk::new(512))).unwrap();

        assert_eq!(fs.resolve(None, p("")).unwrap_err(), FsError::NotFound);
        assert_eq!(
            fs.resolve(None, p("/")).unwrap().sector(),
            crate::param::ROOT_DIR_SECTOR
        );
        assert_eq!(fs.resolve(None, p("/ghost")).unwrap_err(), FsError::NotFound);

        fs.create_dir(None, p("/a")).unwrap();
        fs.create_file(None, p("/a/f"), 0).unwrap();
        assert!(fs.resolve(None, p("/a/f")).is_ok());
        assert!(fs.resolve(None, p("a//f")).is_ok());
        // A trailing slash resolves to the directory itself.
        assert_eq!(
            fs.resolve(None, p("/a/")).unwrap().sector(),
            fs.resolve(None, p("/a")).unwrap().sector()
        );

        // A file in the middle of a path is a dead end.
        assert_eq!(
            fs.resolve(None, p("/a/f/deeper")).unwrap_err(),
            FsError::NotADirectory
        );

        let long = "c".repeat(NAME_MAX + 1);
        assert_eq!(
            fs.resolve(None, Path::new(&long)).unwrap_err(),
            FsError::NameTooLong
        );
    }

    #[test]
    fn relative_paths_walk_from_the_given_directory() {
        let fs = FileSystem::format(Arc::new(MemDisk::new(512))).unwrap();
        fs.create_dir(None, p("/home")).unwrap();
        fs.create_dir(None, p("/home/dev")).unwrap();

        let home = Directory::open(fs.resolve(None, p("/home")).unwrap()).unwrap();
        fs.create_file(Some(&home), p("dev/notes"), 0).unwrap();
        assert!(fs.resolve(None, p("/home/dev/notes")).is_ok());

        // `..` climbs, `.` stays.
        assert_eq!(
            fs.resolve(Some(&home), p("dev/./../dev/notes")).unwrap().sector(),
            fs.resolve(None, p("/home/dev/notes")).unwrap().sector()
        );
        // Root's parent is root.
        assert_eq!(
            fs.resolve(None, p("/../..")).unwrap().sector(),
            crate::param::ROOT_DIR_SECTOR
        );
    }

    #[test]
    fn create_collisions_and_missing_parents() {
        let fs = FileSystem::format(Arc::new(MemDisk::new(512))).unwrap();
        fs.create_file(None, p("/x"), 0).unwrap();
        assert_eq!(fs.create_file(None, p("/x"), 0), Err(FsError::AlreadyExists));
        assert_eq!(fs.create_dir(None, p("/x")), Err(FsError::AlreadyExists));
        assert_eq!(fs.create_file(None, p("/no/such"), 0), Err(FsError::NotFound));
        assert_eq!(fs.create_dir(None, p("/")), Err(FsError::AlreadyExists));
    }

    #[test]
    fn removing_the_root_fails() {
        let fs = FileSystem::format(Arc::new(MemDisk::new(512))).unwrap();
        assert_eq!(fs.remove(None, p("/")), Err(FsError::InUse));
        assert_eq!(fs.remove(None, p("//")), Err(FsError::InUse));
    }

    #[test]
    fn failed_create_leaks_no_sectors() {
        let fs = FileSystem::format(Arc::new(MemDisk::new(64))).unwrap();
        let free = fs.free_sectors();
        // Far more than the device has left.
        assert_eq!(
            fs.create_file(None, p("/big"), 500 * crate::param::SECTOR_SIZE),
            Err(FsError::NoSpace)
        );
        assert_eq!(fs.free_sectors(), free);
        assert_eq!(fs.resolve(None, p("/big")).unwrap_err(), FsError::NotFound);
    }
}
