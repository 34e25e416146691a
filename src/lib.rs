//! stratafs: a layered teaching filesystem with a process descriptor layer.
//!
//! Six layers, leaves first:
//!   + Device: raw synchronous 512-byte sector I/O.
//!   + Cache: a bounded write-back set of sector buffers.
//!   + Inodes: on-disk metadata records and their data-sector maps.
//!   + Directories: inodes whose content is a table of named inodes.
//!   + Names: paths like /usr/share/dict/words for convenient naming.
//!   + Descriptors: per-process integer handles over files and directories.
//!
//! Everything below the descriptor layer lives in a [`fs::FileSystem`]
//! context that owns the device, the cache, the free map and the open-inode
//! registry. There are no ambient globals; tests build a context over an
//! in-memory disk and drive it directly.

#![deny(rust_2018_idioms)]
#![deny(unused_import_braces)]

pub mod bio;
pub mod bitmap;
pub mod console;
pub mod device;
pub mod file;
pub mod fs;
pub mod param;
pub mod proc;
pub mod sync;

pub use crate::file::File;
pub use crate::fs::{FileSystem, FsError};
pub use crate::proc::Process;
