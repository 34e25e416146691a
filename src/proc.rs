//! Processes.
//!
//! A process is a descriptor table, a working directory, and a place in the
//! parent/child wait graph. The methods here are the system-call surface:
//! they validate arguments, translate `FsError` into the scalar sentinels
//! user code sees (-1, `false`, a 0-length transfer), and never panic on
//! bad input. Everything below them speaks `Result`.
//!
//! Descriptors 0, 1 and 2 are permanently the standard streams and are
//! handled inline against the process's console: stdin is consumed one byte
//! at a time, stdout and stderr go out in 256-byte chunks. Slots from 3 up
//! hold files or directories and are allocated from a rolling hint.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use array_macro::array;
use arrayvec::ArrayString;

use crate::console::Console;
use crate::file::File;
use crate::fs::{Directory, FileSystem, InodeKind, Path};
use crate::param::{CONSOLE_CHUNK, FD_FIRST_FILE, NAME_MAX, NOFILE};
use crate::sync::Semaphore;

static NEXT_PID: AtomicU32 = AtomicU32::new(1);

/// What one descriptor slot holds.
enum Fd {
    Empty,
    /// The standard streams; never anything else in slots 0, 1, 2.
    Stdio,
    File(File),
    Dir(Directory),
}

struct FdTable {
    slots: Box<[Fd; NOFILE]>,
    /// Occupied slots at or above `FD_FIRST_FILE`.
    open_slots: usize,
    /// Next slot to try; wraps to `FD_FIRST_FILE`.
    hint: usize,
}

impl FdTable {
    fn new() -> FdTable {
        let mut slots = Box::new(array![_ => Fd::Empty; NOFILE]);
        slots[0] = Fd::Stdio;
        slots[1] = Fd::Stdio;
        slots[2] = Fd::Stdio;
        FdTable {
            slots,
            open_slots: 0,
            hint: FD_FIRST_FILE,
        }
    }

    fn install(&mut self, entry: Fd) -> Option<usize> {
        if self.open_slots >= NOFILE - FD_FIRST_FILE {
            return None;
        }
        let mut idx = self.hint;
        for _ in 0..NOFILE {
            if idx >= NOFILE {
                idx = FD_FIRST_FILE;
            }
            if matches!(self.slots[idx], Fd::Empty) {
                self.slots[idx] = entry;
                self.open_slots += 1;
                self.hint = idx + 1;
                return Some(idx);
            }
            idx += 1;
        }
        None
    }
}

/// Shared between a parent and one child.
///
/// The surrounding `Arc` is the record's reference count: one reference in
/// the parent's children list, one in the child process, each dropped at
/// that side's exit; the record goes away with the second drop.
struct WaitRecord {
    child_pid: u32,
    exit_code: Mutex<i32>,
    dead: AtomicBool,
    /// Upped once by the child at exit; downed by the waiting parent.
    death: Semaphore,
    /// One permit, so at most one wait on this child succeeds.
    wait_gate: Semaphore,
}

pub struct Process {
    pid: u32,
    fs: FileSystem,
    console: Arc<dyn Console>,
    table: Mutex<FdTable>,
    /// `None` once the process has exited (and before `chdir`, never: a
    /// fresh process starts at root).
    cwd: Mutex<Option<Directory>>,
    children: Mutex<Vec<Arc<WaitRecord>>>,
    /// Present on spawned children; the root process has no parent.
    record: Option<Arc<WaitRecord>>,
}

impl Process {
    /// The initial process: descriptor table with only the standard
    /// streams, working directory at root.
    pub fn new(fs: FileSystem, console: Arc<dyn Console>) -> Arc<Process> {
        let cwd = fs.root();
        Arc::new(Process {
            pid: NEXT_PID.fetch_add(1, Ordering::SeqCst),
            fs,
            console,
            table: Mutex::new(FdTable::new()),
            cwd: Mutex::new(Some(cwd)),
            children: Mutex::new(Vec::new()),
            record: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn cwd_clone(&self) -> Option<Directory> {
        self.cwd.lock().unwrap().as_ref().map(Directory::reopen)
    }

    fn with_slot<R>(&self, fd: i32, f: impl FnOnce(&mut Fd) -> R) -> Option<R> {
        if fd < 0 || fd as usize >= NOFILE {
            return None;
        }
        let mut table = self.table.lock().unwrap();
        Some(f(&mut table.slots[fd as usize]))
    }

    /// CREATE: makes a file of `size` zero bytes. `true` on success.
    pub fn create(&self, path: &str, size: usize) -> bool {
        let cwd = self.cwd_clone();
        self.fs
            .create_file(cwd.as_ref(), Path::new(path), size)
            .is_ok()
    }

    /// MKDIR: makes an empty directory. `true` on success.
    pub fn mkdir(&self, path: &str) -> bool {
        let cwd = self.cwd_clone();
        self.fs.create_dir(cwd.as_ref(), Path::new(path)).is_ok()
    }

    /// REMOVE: unlinks a file or empty directory. `true` on success.
    pub fn remove(&self, path: &str) -> bool {
        let cwd = self.cwd_clone();
        self.fs.remove(cwd.as_ref(), Path::new(path)).is_ok()
    }

    /// OPEN: returns a descriptor for the file or directory at `path`,
    /// or -1.
    pub fn open(&self, path: &str) -> i32 {
        let cwd = self.cwd_clone();
        let inode = match self.fs.resolve(cwd.as_ref(), Path::new(path)) {
            Ok(inode) => inode,
            Err(_) => return -1,
        };
        let entry = match inode.kind() {
            InodeKind::Directory => Directory::open(inode).map(Fd::Dir),
            InodeKind::File => File::open(inode).map(Fd::File),
        };
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => return -1,
        };
        let mut table = self.table.lock().unwrap();
        match table.install(entry) {
            Some(fd) => fd as i32,
            None => -1,
        }
    }

    /// CLOSE: releases a descriptor. The standard streams cannot be
    /// closed.
    pub fn close(&self, fd: i32) -> i32 {
        if fd < FD_FIRST_FILE as i32 || fd as usize >= NOFILE {
            return -1;
        }
        let mut table = self.table.lock().unwrap();
        if matches!(table.slots[fd as usize], Fd::Empty) {
            return -1;
        }
        table.slots[fd as usize] = Fd::Empty;
        table.open_slots -= 1;
        0
    }

    /// READ: from a file descriptor, or one byte at a time from stdin.
    pub fn read(&self, fd: i32, buf: &mut [u8]) -> i32 {
        if fd == 0 {
            let mut n = 0;
            while n < buf.len() {
                match self.console.read_byte() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            return n as i32;
        }
        self.with_slot(fd, |slot| match slot {
            Fd::File(file) => file.read(buf) as i32,
            _ => -1,
        })
        .unwrap_or(-1)
    }

    /// WRITE: to a file descriptor, or to the console for stdout/stderr,
    /// 256 consecutive bytes per chunk.
    pub fn write(&self, fd: i32, buf: &[u8]) -> i32 {
        if fd == 1 || fd == 2 {
            for chunk in buf.chunks(CONSOLE_CHUNK) {
                self.console.write(chunk);
            }
            return buf.len() as i32;
        }
        self.with_slot(fd, |slot| match slot {
            Fd::File(file) => file.write(buf) as i32,
            _ => -1,
        })
        .unwrap_or(-1)
    }

    /// SEEK: repositions a file descriptor. Rejected for directories and
    /// the standard streams.
    pub fn seek(&self, fd: i32, pos: usize) -> i32 {
        self.with_slot(fd, |slot| match slot {
            Fd::File(file) => {
                file.seek(pos);
                0
            }
            _ => -1,
        })
        .unwrap_or(-1)
    }

    /// TELL: the current position of a file descriptor.
    pub fn tell(&self, fd: i32) -> i32 {
        self.with_slot(fd, |slot| match slot {
            Fd::File(file) => file.tell() as i32,
            _ => -1,
        })
        .unwrap_or(-1)
    }

    /// FILESIZE: the length of the file behind `fd`.
    pub fn filesize(&self, fd: i32) -> i32 {
        self.with_slot(fd, |slot| match slot {
            Fd::File(file) => file.length() as i32,
            _ => -1,
        })
        .unwrap_or(-1)
    }

    /// ISDIR: whether `fd` names a directory.
    pub fn isdir(&self, fd: i32) -> bool {
        self.with_slot(fd, |slot| matches!(slot, Fd::Dir(_)))
            .unwrap_or(false)
    }

    /// INUMBER: the home sector of the inode behind `fd`.
    pub fn inumber(&self, fd: i32) -> i32 {
        self.with_slot(fd, |slot| match slot {
            Fd::File(file) => file.inode().sector() as i32,
            Fd::Dir(dir) => dir.inode().sector() as i32,
            _ => -1,
        })
        .unwrap_or(-1)
    }

    /// READDIR: the next entry name of a directory descriptor, skipping
    /// `.` and `..`. `None` once exhausted, or for non-directories.
    pub fn readdir(&self, fd: i32) -> Option<ArrayString<NAME_MAX>> {
        self.with_slot(fd, |slot| match slot {
            Fd::Dir(dir) => dir.readdir(),
            _ => None,
        })
        .flatten()
    }

    /// CHDIR: moves the working directory. `true` on success.
    pub fn chdir(&self, path: &str) -> bool {
        let cwd = self.cwd_clone();
        let inode = match self.fs.resolve(cwd.as_ref(), Path::new(path)) {
            Ok(inode) => inode,
            Err(_) => return false,
        };
        match Directory::open(inode) {
            Ok(dir) => {
                *self.cwd.lock().unwrap() = Some(dir);
                true
            }
            Err(_) => false,
        }
    }

    /// EXEC analogue: runs `body` as a child process on its own thread,
    /// inheriting the filesystem, console and working directory. The
    /// closure's return value is the child's exit status; a panic inside it
    /// is a kernel-fault exit with status -1. Returns the child pid.
    pub fn spawn(self: &Arc<Self>, body: impl FnOnce(&Process) -> i32 + Send + 'static) -> u32 {
        let record = Arc::new(WaitRecord {
            child_pid: NEXT_PID.fetch_add(1, Ordering::SeqCst),
            exit_code: Mutex::new(-1),
            dead: AtomicBool::new(false),
            death: Semaphore::new(0),
            wait_gate: Semaphore::new(1),
        });
        let child = Arc::new(Process {
            pid: record.child_pid,
            fs: self.fs.clone(),
            console: Arc::clone(&self.console),
            table: Mutex::new(FdTable::new()),
            cwd: Mutex::new(self.cwd_clone()),
            children: Mutex::new(Vec::new()),
            record: Some(Arc::clone(&record)),
        });
        self.children.lock().unwrap().push(record);

        let pid = child.pid;
        let _ = thread::spawn(move || {
            let code = panic::catch_unwind(AssertUnwindSafe(|| body(&child))).unwrap_or(-1);
            child.exit(code);
        });
        pid
    }

    /// WAIT: blocks until child `pid` exits and returns its status. Only
    /// one wait per child succeeds; any other wait, or a pid that is not a
    /// live child, yields -1.
    pub fn wait(&self, pid: u32) -> i32 {
        let record = {
            let children = self.children.lock().unwrap();
            match children.iter().find(|r| r.child_pid == pid) {
                Some(r) => Arc::clone(r),
                None => return -1,
            }
        };
        if !record.wait_gate.try_down() {
            return -1;
        }
        record.death.down();
        let code = *record.exit_code.lock().unwrap();
        self.children.lock().unwrap().retain(|r| r.child_pid != pid);
        code
    }

    /// EXIT: closes every descriptor, releases the working directory, and
    /// posts `code` to a waiting parent. Idempotent.
    pub fn exit(&self, code: i32) {
        if let Some(record) = &self.record {
            if record.dead.swap(true, Ordering::SeqCst) {
                return;
            }
            *record.exit_code.lock().unwrap() = code;
        }
        self.drain();
        if let Some(record) = &self.record {
            log::debug!("pid {}: exit({})", self.pid, code);
            record.death.up();
        }
    }

    /// Synchronously closes every open handle the process holds.
    fn drain(&self) {
        let mut table = self.table.lock().unwrap();
        for slot in table.slots.iter_mut() {
            if !matches!(slot, Fd::Stdio) {
                *slot = Fd::Empty;
            }
        }
        table.open_slots = 0;
        drop(table);
        *self.cwd.lock().unwrap() = None;
    }
}
