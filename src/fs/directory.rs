//! Directories.
//!
//! A directory is an inode of kind `Directory` whose content is an array of
//! fixed-size entries. Every directory starts with `.` (itself) and `..`
//! (its parent); the root's parent is the root. Entry slots are recycled:
//! removal clears `in_use`, and the next add reuses the first clear slot
//! before growing the file.

use core::mem;
use std::sync::Arc;

use arrayvec::ArrayString;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use super::inode::{self, InodeKind, InodeRef, InodeTable};
use super::path::FileName;
use super::{FsCore, FsError};
use crate::param::{NAME_MAX, ROOT_DIR_SECTOR};

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct DirEntry {
    inode_sector: u32,
    /// NUL-padded; never more than `NAME_MAX` name bytes.
    name: [u8; NAME_MAX + 1],
    in_use: u8,
}

const DIR_ENTRY_SIZE: usize = mem::size_of::<DirEntry>();

const_assert!(DIR_ENTRY_SIZE == 20);

impl DirEntry {
    fn new(name: &FileName, inode_sector: u32) -> DirEntry {
        let mut entry = DirEntry {
            inode_sector,
            name: [0; NAME_MAX + 1],
            in_use: 1,
        };
        entry.name[..name.as_str().len()].copy_from_slice(name.as_str().as_bytes());
        entry
    }

    fn in_use(&self) -> bool {
        self.in_use != 0
    }

    fn name(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..len]).expect("malformed directory entry name")
    }

    fn is_dot(&self) -> bool {
        self.name() == "." || self.name() == ".."
    }
}

/// An open directory: a counted inode reference plus a read cursor.
pub struct Directory {
    inode: InodeRef,
    pos: usize,
}

impl Directory {
    /// Writes a fresh directory at `sector` holding `.` and `..` and room
    /// for `entry_hint` entries before its file has to grow.
    pub(crate) fn create(
        core: &Arc<FsCore>,
        sector: u32,
        parent_sector: u32,
        entry_hint: usize,
    ) -> Result<(), FsError> {
        let entries = entry_hint.max(2);
        inode::create(core, sector, entries * DIR_ENTRY_SIZE, InodeKind::Directory)?;

        let dir = Directory {
            inode: InodeTable::open(core, sector),
            pos: 0,
        };
        let dot = FileName::new(".").expect("dot name");
        let dotdot = FileName::new("..").expect("dot-dot name");
        dir.write_entry(0, &DirEntry::new(dot, sector))?;
        dir.write_entry(1, &DirEntry::new(dotdot, parent_sector))?;
        Ok(())
    }

    /// Views an open inode as a directory.
    pub fn open(inode: InodeRef) -> Result<Directory, FsError> {
        if inode.kind() != InodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        Ok(Directory { inode, pos: 0 })
    }

    /// Another handle on the same directory with a fresh cursor.
    pub fn reopen(&self) -> Directory {
        Directory {
            inode: self.inode.clone(),
            pos: 0,
        }
    }

    pub fn inode(&self) -> &InodeRef {
        &self.inode
    }

    fn read_entry(&self, idx: usize) -> Option<DirEntry> {
        let mut buf = [0u8; DIR_ENTRY_SIZE];
        if self.inode.read_at(&mut buf, idx * DIR_ENTRY_SIZE) < DIR_ENTRY_SIZE {
            return None;
        }
        Some(DirEntry::read_from(&buf[..]).expect("entry size"))
    }

    fn write_entry(&self, idx: usize, entry: &DirEntry) -> Result<(), FsError> {
        if self.inode.write_at(entry.as_bytes(), idx * DIR_ENTRY_SIZE) < DIR_ENTRY_SIZE {
            return Err(FsError::NoSpace);
        }
        Ok(())
    }

    fn find(&self, name: &FileName) -> Option<(usize, DirEntry)> {
        let mut idx = 0;
        while let Some(entry) = self.read_entry(idx) {
            if entry.in_use() && entry.name() == name.as_str() {
                return Some((idx, entry));
            }
            idx += 1;
        }
        None
    }

    /// Opens the inode the entry `name` points at.
    pub fn lookup(&self, name: &FileName) -> Result<InodeRef, FsError> {
        let (_, entry) = self.find(name).ok_or(FsError::NotFound)?;
        Ok(InodeTable::open(self.inode.fs_core(), entry.inode_sector))
    }

    /// Adds an entry binding `name` to the inode at `inode_sector`. Names
    /// are unique within a directory.
    pub fn add(&self, name: &FileName, inode_sector: u32) -> Result<(), FsError> {
        if self.find(name).is_some() {
            return Err(FsError::AlreadyExists);
        }

        // First clear slot, or one past the end.
        let mut idx = 0;
        while let Some(entry) = self.read_entry(idx) {
            if !entry.in_use() {
                break;
            }
            idx += 1;
        }
        self.write_entry(idx, &DirEntry::new(name, inode_sector))
    }

    /// Unbinds `name` and marks its inode for deletion at the last close.
    ///
    /// A directory goes only if it is empty beyond the dot entries, is not
    /// the root, and nobody else holds it open. A working directory is an
    /// open handle, so a live cwd refuses removal through the same check.
    pub fn remove(&self, name: &FileName) -> Result<(), FsError> {
        if name.as_str() == "." || name.as_str() == ".." {
            return Err(FsError::InUse);
        }
        let (idx, entry) = self.find(name).ok_or(FsError::NotFound)?;
        let target = InodeTable::open(self.inode.fs_core(), entry.inode_sector);

        if target.kind() == InodeKind::Directory {
            if target.sector() == ROOT_DIR_SECTOR {
                return Err(FsError::InUse);
            }
            let dir = Directory {
                inode: target.clone(),
                pos: 0,
            };
            if !dir.is_empty_beyond_dots() {
                return Err(FsError::DirectoryNotEmpty);
            }
            // `target` and `dir` account for two openers of our own.
            if target.open_count() > 2 {
                return Err(FsError::InUse);
            }
        }

        let mut cleared = entry;
        cleared.in_use = 0;
        self.write_entry(idx, &cleared)?;
        target.remove();
        log::debug!(
            "dir {}: removed '{}' (inode {})",
            self.inode.sector(),
            name.as_str(),
            entry.inode_sector
        );
        Ok(())
    }

    fn is_empty_beyond_dots(&self) -> bool {
        let mut idx = 0;
        while let Some(entry) = self.read_entry(idx) {
            if entry.in_use() && !entry.is_dot() {
                return false;
            }
            idx += 1;
        }
        true
    }

    /// The next entry name, skipping clear slots and the dot entries.
    pub fn readdir(&mut self) -> Option<ArrayString<NAME_MAX>> {
        while let Some(entry) = self.read_entry(self.pos) {
            self.pos += 1;
            if entry.in_use() && !entry.is_dot() {
                return Some(ArrayString::from(entry.name()).expect("entry name fits"));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;
    use crate::fs::FileSystem;

    fn fresh_fs() -> FileSystem {
        FileSystem::format(Arc::new(MemDisk::new(512))).unwrap()
    }

    fn name(s: &str) -> &FileName {
        FileName::new(s).unwrap()
    }

    #[test]
    fn fresh_directory_has_dot_entries() {
        let fs = fresh_fs();
        let root = fs.root();
        assert_eq!(root.lookup(name(".")).unwrap().sector(), ROOT_DIR_SECTOR);
        assert_eq!(root.lookup(name("..")).unwrap().sector(), ROOT_DIR_SECTOR);
        // But readdir shows neither.
        assert!(root.reopen().readdir().is_none());
    }

    #[test]
    fn add_lookup_readdir() {
        let fs = fresh_fs();
        let root = fs.root();
        fs.create_file(None, crate::fs::Path::new("alpha"), 0).unwrap();
        fs.create_file(None, crate::fs::Path::new("beta"), 0).unwrap();

        assert!(root.lookup(name("alpha")).is_ok());
        assert!(root.lookup(name("gamma")).is_err());

        let mut dir = root.reopen();
        let mut seen = Vec::new();
        while let Some(n) = dir.readdir() {
            seen.push(n.to_string());
        }
        seen.sort();
        assert_eq!(seen, ["alpha", "beta"]);
    }

    #[test]
    fn names_are_unique() {
        let fs = fresh_fs();
        let root = fs.root();
        let target = root.lookup(name(".")).unwrap().sector();
        root.add(name("twice"), target).unwrap();
        assert_eq!(root.add(name("twice"), target), Err(FsError::AlreadyExists));
    }

    #[test]
    fn removal_recycles_the_slot() {
        let fs = fresh_fs();
        let root = fs.root();
        fs.create_file(None, crate::fs::Path::new("a"), 0).unwrap();
        let length = root.inode().length();

        root.remove(name("a")).unwrap();
        fs.create_file(None, crate::fs::Path::new("b"), 0).unwrap();
        assert_eq!(root.inode().length(), length);
    }

    #[test]
    fn dot_entries_cannot_be_removed() {
        let fs = fresh_fs();
        let root = fs.root();
        assert_eq!(root.remove(name(".")), Err(FsError::InUse));
        assert_eq!(root.remove(name("..")), Err(FsError::InUse));
    }

    #[test]
    fn nonempty_directory_refuses_removal() {
        let fs = fresh_fs();
        let root = fs.root();
        fs.create_dir(None, crate::fs::Path::new("nest")).unwrap();
        fs.create_file(None, crate::fs::Path::new("nest/egg"), 0).unwrap();

        assert_eq!(root.remove(name("nest")), Err(FsError::DirectoryNotEmpty));

        let nest = Directory::open(root.lookup(name("nest")).unwrap()).unwrap();
        nest.remove(name("egg")).unwrap();
        drop(nest);
        root.remove(name("nest")).unwrap();
        assert!(root.lookup(name("nest")).is_err());
    }

    #[test]
    fn held_open_directory_refuses_removal() {
        let fs = fresh_fs();
        let root = fs.root();
        fs.create_dir(None, crate::fs::Path::new("busy")).unwrap();

        let held = Directory::open(root.lookup(name("busy")).unwrap()).unwrap();
        assert_eq!(root.remove(name("busy")), Err(FsError::InUse));
        drop(held);
        root.remove(name("busy")).unwrap();
    }

    #[test]
    fn removed_file_stays_readable_until_close() {
        let fs = fresh_fs();
        let root = fs.root();
        fs.create_file(None, crate::fs::Path::new("ghost"), 0).unwrap();

        let handle = root.lookup(name("ghost")).unwrap();
        assert_eq!(handle.write_at(b"boo", 0), 3);
        root.remove(name("ghost")).unwrap();

        assert!(root.lookup(name("ghost")).is_err());
        let mut buf = [0u8; 3];
        assert_eq!(handle.read_at(&mut buf, 0), 3);
        assert_eq!(&buf, b"boo");
    }
}
