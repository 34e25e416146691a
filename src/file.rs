//! Open files.
//!
//! A [`File`] pairs a counted inode reference with a byte position, so
//! sequential reads and writes pick up where the last one stopped. The
//! deny-write latch is per-file and balanced automatically at close, while
//! the count it feeds lives on the shared inode.

use crate::fs::{FsError, InodeKind, InodeRef};

pub struct File {
    inode: InodeRef,
    pos: usize,
    deny_write: bool,
}

impl File {
    /// Views an open inode as a file.
    pub fn open(inode: InodeRef) -> Result<File, FsError> {
        if inode.kind() != InodeKind::File {
            return Err(FsError::IsADirectory);
        }
        Ok(File {
            inode,
            pos: 0,
            deny_write: false,
        })
    }

    /// Another handle on the same inode, rewound and without a deny latch.
    pub fn reopen(&self) -> File {
        File {
            inode: self.inode.clone(),
            pos: 0,
            deny_write: false,
        }
    }

    pub fn inode(&self) -> &InodeRef {
        &self.inode
    }

    pub fn length(&self) -> usize {
        self.inode.length()
    }

    /// Reads from the current position and advances it.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.inode.read_at(buf, self.pos);
        self.pos += n;
        n
    }

    /// Writes at the current position and advances it.
    pub fn write(&mut self, buf: &[u8]) -> usize {
        let n = self.inode.write_at(buf, self.pos);
        self.pos += n;
        n
    }

    /// Positioned read; the file position does not move.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        self.inode.read_at(buf, offset)
    }

    /// Positioned write; the file position does not move.
    pub fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        self.inode.write_at(buf, offset)
    }

    /// Moves the position to `pos`. Seeking past EOF is allowed; a later
    /// write there grows the file.
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn tell(&self) -> usize {
        self.pos
    }

    /// Blocks writers to the underlying inode until this file is closed or
    /// [`File::allow_write`] is called. Idempotent per file.
    pub fn deny_write(&mut self) {
        if !self.deny_write {
            self.deny_write = true;
            self.inode.deny_write();
        }
    }

    pub fn allow_write(&mut self) {
        if self.deny_write {
            self.deny_write = false;
            self.inode.allow_write();
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.allow_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;
    use crate::fs::{FileSystem, Path};
    use std::sync::Arc;

    fn file_named(fs: &FileSystem, name: &str) -> File {
        fs.create_file(None, Path::new(name), 0).unwrap();
        File::open(fs.resolve(None, Path::new(name)).unwrap()).unwrap()
    }

    #[test]
    fn sequential_io_advances_the_position() {
        let fs = FileSystem::format(Arc::new(MemDisk::new(256))).unwrap();
        let mut f = file_named(&fs, "log");

        assert_eq!(f.write(b"hello "), 6);
        assert_eq!(f.write(b"world"), 5);
        assert_eq!(f.tell(), 11);

        f.seek(0);
        let mut buf = [0u8; 11];
        assert_eq!(f.read(&mut buf), 11);
        assert_eq!(&buf, b"hello world");
        assert_eq!(f.read(&mut buf), 0);
    }

    #[test]
    fn seek_then_tell_round_trips() {
        let fs = FileSystem::format(Arc::new(MemDisk::new(256))).unwrap();
        let mut f = file_named(&fs, "sample.txt");
        f.write(b"some text");
        for &k in &[0, 2, 5, 9] {
            f.seek(k);
            assert_eq!(f.tell(), k);
        }
    }

    #[test]
    fn reopen_rewinds_without_sharing_position() {
        let fs = FileSystem::format(Arc::new(MemDisk::new(256))).unwrap();
        let mut f = file_named(&fs, "twice");
        f.write(b"abcdef");

        let mut g = f.reopen();
        let mut buf = [0u8; 3];
        assert_eq!(g.read(&mut buf), 3);
        assert_eq!(&buf, b"abc");
        assert_eq!(f.tell(), 6);
    }

    #[test]
    fn deny_write_released_at_close() {
        let fs = FileSystem::format(Arc::new(MemDisk::new(256))).unwrap();
        let mut f = file_named(&fs, "exe");
        f.deny_write();
        f.deny_write();
        assert_eq!(f.write(b"x"), 0);

        let g = f.reopen();
        assert_eq!(g.write_at(b"x", 0), 0);
        drop(f);
        assert_eq!(g.write_at(b"x", 0), 1);
    }

    #[test]
    fn directories_are_not_files() {
        let fs = FileSystem::format(Arc::new(MemDisk::new(256))).unwrap();
        let root = fs.resolve(None, Path::new("/")).unwrap();
        assert!(matches!(File::open(root), Err(FsError::IsADirectory)));
    }
}
