//! Inodes.
//!
//! An inode describes a single file or directory: its length, its kind, and
//! the map from byte offsets to the device sectors holding its content. The
//! on-disk form occupies exactly one sector and indexes data through three
//! tiers: 12 direct pointers, one indirect sector of 128 pointers, and one
//! doubly-indirect sector of 128 indirect sectors. A zero pointer means
//! "unallocated"; exactly the sectors covering `[0, length)` are allocated.
//!
//! In memory, each open inode has a single shadow shared by every opener.
//! [`InodeTable`] keys the shadows by home sector; opening a sector that
//! already has one joins it. [`InodeRef`] is the acquire/release surface:
//! cloning a ref reopens the inode, dropping it closes, and the last close
//! of a removed inode returns every reachable sector plus the inode sector
//! itself to the free map.
//!
//! Two locks per inode, taken in this order when both are needed:
//! the data rwlock serializes content I/O (readers share, writers exclude),
//! and the metadata mutex guards `open_count`, `removed`,
//! `deny_write_count` and the in-memory copy of the on-disk image, which
//! makes it the resize lock.

use core::cmp;
use core::convert::TryInto;
use core::mem;
use std::sync::{Arc, Mutex, RwLock};

use scopeguard::ScopeGuard;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use super::{FsCore, FsError};
use crate::param::{MAXFILE, NDIRECT, NINDIRECT, SECTOR_SIZE};

/// Sentinel identifying a sector as an inode.
const INODE_MAGIC: u32 = 0x494e_4f44;

const ZERO_SECTOR: [u8; SECTOR_SIZE] = [0; SECTOR_SIZE];

/// First data-sector index served by the doubly-indirect tier.
const DINDIRECT_BASE: usize = NDIRECT + NINDIRECT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    File,
    Directory,
}

impl InodeKind {
    fn from_raw(raw: u32) -> InodeKind {
        match raw {
            0 => InodeKind::File,
            1 => InodeKind::Directory,
            _ => panic!("malformed inode kind {}", raw),
        }
    }

    fn to_raw(self) -> u32 {
        match self {
            InodeKind::File => 0,
            InodeKind::Directory => 1,
        }
    }
}

/// On-disk inode. Exactly one sector.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub(crate) struct DiskInode {
    /// File length in bytes.
    length: i32,
    magic: u32,
    kind: u32,
    direct: [u32; NDIRECT],
    indirect: u32,
    dindirect: u32,
    _pad: [u8; SECTOR_SIZE - (3 + NDIRECT + 2) * mem::size_of::<u32>()],
}

const_assert!(mem::size_of::<DiskInode>() == SECTOR_SIZE);

impl DiskInode {
    fn empty(kind: InodeKind) -> DiskInode {
        DiskInode {
            length: 0,
            magic: INODE_MAGIC,
            kind: kind.to_raw(),
            direct: [0; NDIRECT],
            indirect: 0,
            dindirect: 0,
            _pad: [0; SECTOR_SIZE - (3 + NDIRECT + 2) * mem::size_of::<u32>()],
        }
    }
}

/// An index sector: 128 sector pointers.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct IndexBlock {
    ptrs: [u32; NINDIRECT],
}

const_assert!(mem::size_of::<IndexBlock>() == SECTOR_SIZE);

impl IndexBlock {
    fn zeroed() -> IndexBlock {
        IndexBlock {
            ptrs: [0; NINDIRECT],
        }
    }
}

fn read_index(core: &FsCore, sector: u32) -> IndexBlock {
    debug_assert_ne!(sector, 0, "reading an unallocated index sector");
    let mut buf = [0u8; SECTOR_SIZE];
    core.cache.read(&core.dev, sector, &mut buf);
    IndexBlock::read_from(&buf[..]).expect("index sector size")
}

fn write_index(core: &FsCore, sector: u32, blk: &IndexBlock) {
    let mut buf = [0u8; SECTOR_SIZE];
    blk.write_to(&mut buf[..]).expect("index sector size");
    core.cache.write(&core.dev, sector, &buf);
}

fn read_disk_inode(core: &FsCore, sector: u32) -> DiskInode {
    let mut buf = [0u8; SECTOR_SIZE];
    core.cache.read(&core.dev, sector, &mut buf);
    DiskInode::read_from(&buf[..]).expect("inode sector size")
}

fn write_disk_inode(core: &FsCore, sector: u32, disk: &DiskInode) {
    let mut buf = [0u8; SECTOR_SIZE];
    disk.write_to(&mut buf[..]).expect("inode sector size");
    core.cache.write(&core.dev, sector, &buf);
}

/// Data sectors needed for a file of `length` bytes.
fn sectors_for(length: usize) -> usize {
    (length + SECTOR_SIZE - 1) / SECTOR_SIZE
}

/// Index sectors needed alongside `cnt` data sectors.
fn index_sectors_for(cnt: usize) -> usize {
    let mut n = 0;
    if cnt > NDIRECT {
        n += 1;
    }
    if cnt > DINDIRECT_BASE {
        // The root plus one leaf per started group of 128.
        n += 1 + (cnt - DINDIRECT_BASE + NINDIRECT - 1) / NINDIRECT;
    }
    n
}

/// Maps byte offset `pos` to its device sector, or `None` at or past EOF.
fn sector_of(core: &FsCore, disk: &DiskInode, pos: usize) -> Option<u32> {
    if pos >= disk.length as usize {
        return None;
    }
    let idx = pos / SECTOR_SIZE;
    if idx < NDIRECT {
        return Some(disk.direct[idx]);
    }
    let idx = idx - NDIRECT;
    if idx < NINDIRECT {
        return Some(read_index(core, disk.indirect).ptrs[idx]);
    }
    let idx = idx - NINDIRECT;
    let root = read_index(core, disk.dindirect);
    let leaf = read_index(core, root.ptrs[idx / NINDIRECT]);
    Some(leaf.ptrs[idx % NINDIRECT])
}

/// Grows or shrinks `disk` so that exactly the sectors covering
/// `[0, new_len)` are allocated, then commits the new length and writes the
/// inode sector back through the cache.
///
/// Growth runs in two phases: every new data and index sector is reserved
/// from the free map first (a failure releases the partial reservation and
/// leaves the pointer graph and length untouched), and only then are
/// pointers wired in, fresh data sectors zero-filled, and index sectors
/// written. Shrinking releases from the doubly-indirect tier down and
/// cannot fail.
fn resize(core: &FsCore, home: u32, disk: &mut DiskInode, new_len: usize) -> Result<(), FsError> {
    if new_len > MAXFILE {
        return Err(FsError::NoSpace);
    }
    let old_cnt = sectors_for(disk.length as usize);
    let new_cnt = sectors_for(new_len);
    if new_cnt > old_cnt {
        grow(core, disk, old_cnt, new_cnt)?;
    } else if new_cnt < old_cnt {
        shrink(core, disk, new_cnt, old_cnt);
    }
    disk.length = new_len as i32;
    write_disk_inode(core, home, disk);
    Ok(())
}

fn grow(core: &FsCore, disk: &mut DiskInode, old_cnt: usize, new_cnt: usize) -> Result<(), FsError> {
    // Phase 1: reserve everything the new shape needs before touching a
    // pointer.
    let needed = (new_cnt - old_cnt) + index_sectors_for(new_cnt) - index_sectors_for(old_cnt);
    let mut reserved = scopeguard::guard(Vec::with_capacity(needed), |sectors: Vec<u32>| {
        for s in sectors {
            core.freemap.release(s, 1);
        }
    });
    for _ in 0..needed {
        match core.freemap.allocate(1) {
            Some(s) => reserved.push(s),
            // The guard hands the partial reservation back.
            None => return Err(FsError::NoSpace),
        }
    }
    let mut fresh = ScopeGuard::into_inner(reserved).into_iter();
    let mut take = move || fresh.next().expect("resize plan out of sectors");

    // Phase 2: wire the reservation in, tier by tier.
    for idx in old_cnt..cmp::min(new_cnt, NDIRECT) {
        let s = take();
        core.cache.write(&core.dev, s, &ZERO_SECTOR);
        disk.direct[idx] = s;
    }

    if new_cnt > NDIRECT {
        let lo = cmp::max(old_cnt, NDIRECT);
        let hi = cmp::min(new_cnt, DINDIRECT_BASE);
        if lo < hi {
            let mut blk = if old_cnt <= NDIRECT {
                disk.indirect = take();
                IndexBlock::zeroed()
            } else {
                read_index(core, disk.indirect)
            };
            for idx in lo..hi {
                let s = take();
                core.cache.write(&core.dev, s, &ZERO_SECTOR);
                blk.ptrs[idx - NDIRECT] = s;
            }
            write_index(core, disk.indirect, &blk);
        }
    }

    if new_cnt > DINDIRECT_BASE {
        let mut root = if old_cnt <= DINDIRECT_BASE {
            disk.dindirect = take();
            IndexBlock::zeroed()
        } else {
            read_index(core, disk.dindirect)
        };
        let lo = cmp::max(old_cnt, DINDIRECT_BASE);
        let first_leaf = (lo - DINDIRECT_BASE) / NINDIRECT;
        let last_leaf = (new_cnt - DINDIRECT_BASE - 1) / NINDIRECT;
        for leaf_idx in first_leaf..=last_leaf {
            let leaf_base = DINDIRECT_BASE + leaf_idx * NINDIRECT;
            let mut leaf = if old_cnt <= leaf_base {
                root.ptrs[leaf_idx] = take();
                IndexBlock::zeroed()
            } else {
                read_index(core, root.ptrs[leaf_idx])
            };
            for idx in cmp::max(lo, leaf_base)..cmp::min(new_cnt, leaf_base + NINDIRECT) {
                let s = take();
                core.cache.write(&core.dev, s, &ZERO_SECTOR);
                leaf.ptrs[idx - leaf_base] = s;
            }
            write_index(core, root.ptrs[leaf_idx], &leaf);
        }
        write_index(core, disk.dindirect, &root);
    }
    Ok(())
}

fn shrink(core: &FsCore, disk: &mut DiskInode, new_cnt: usize, old_cnt: usize) {
    if old_cnt > DINDIRECT_BASE {
        let mut root = read_index(core, disk.dindirect);
        let mut root_touched = false;
        let last_leaf = (old_cnt - DINDIRECT_BASE - 1) / NINDIRECT;
        for leaf_idx in 0..=last_leaf {
            let leaf_base = DINDIRECT_BASE + leaf_idx * NINDIRECT;
            let leaf_hi = cmp::min(old_cnt, leaf_base + NINDIRECT);
            if new_cnt >= leaf_hi {
                continue;
            }
            let mut leaf = read_index(core, root.ptrs[leaf_idx]);
            for idx in cmp::max(new_cnt, leaf_base)..leaf_hi {
                core.freemap.release(leaf.ptrs[idx - leaf_base], 1);
                leaf.ptrs[idx - leaf_base] = 0;
            }
            if new_cnt <= leaf_base {
                // The whole leaf fell past EOF.
                core.freemap.release(root.ptrs[leaf_idx], 1);
                root.ptrs[leaf_idx] = 0;
                root_touched = true;
            } else {
                write_index(core, root.ptrs[leaf_idx], &leaf);
            }
        }
        if new_cnt <= DINDIRECT_BASE {
            core.freemap.release(disk.dindirect, 1);
            disk.dindirect = 0;
        } else if root_touched {
            write_index(core, disk.dindirect, &root);
        }
    }

    if old_cnt > NDIRECT {
        let hi = cmp::min(old_cnt, DINDIRECT_BASE);
        if new_cnt < hi {
            let mut blk = read_index(core, disk.indirect);
            for idx in cmp::max(new_cnt, NDIRECT)..hi {
                core.freemap.release(blk.ptrs[idx - NDIRECT], 1);
                blk.ptrs[idx - NDIRECT] = 0;
            }
            if new_cnt <= NDIRECT {
                core.freemap.release(disk.indirect, 1);
                disk.indirect = 0;
            } else {
                write_index(core, disk.indirect, &blk);
            }
        }
    }

    for idx in new_cnt..cmp::min(old_cnt, NDIRECT) {
        core.freemap.release(disk.direct[idx], 1);
        disk.direct[idx] = 0;
    }
}

/// Writes a fresh inode of `length` zero bytes at `sector`.
///
/// The caller owns `sector` already (it came from the free map). On failure
/// nothing is allocated and the sector is untouched; the caller keeps it.
pub(crate) fn create(
    core: &Arc<FsCore>,
    sector: u32,
    length: usize,
    kind: InodeKind,
) -> Result<(), FsError> {
    let mut disk = DiskInode::empty(kind);
    resize(core, sector, &mut disk, length)?;
    log::debug!(
        "inode {}: created {:?}, {} bytes",
        sector,
        kind,
        length
    );
    Ok(())
}

struct InodeMeta {
    open_count: u32,
    removed: bool,
    deny_write_count: u32,
    /// In-memory image of the on-disk sector. Kept in sync by writing the
    /// home sector through the cache after every mutation.
    disk: DiskInode,
}

/// The in-memory shadow of one on-disk inode.
pub(crate) struct Inode {
    sector: u32,
    /// Data I/O lock. The sector map is stable while held: every resize
    /// runs under the writer side.
    rw: RwLock<()>,
    /// Metadata and resize lock.
    meta: Mutex<InodeMeta>,
}

/// The open-inode registry: at most one [`Inode`] per home sector.
///
/// `open_count` transitions through zero only while the registry lock is
/// held, so a handle found in the list is never mid-destruction.
pub(crate) struct InodeTable {
    list: spin::Mutex<Vec<Arc<Inode>>>,
}

impl InodeTable {
    pub(crate) fn new() -> InodeTable {
        InodeTable {
            list: spin::Mutex::new(Vec::new()),
        }
    }

    /// Opens the inode at `sector`, joining the existing shadow if one is
    /// registered. A sector without a valid inode is fatal.
    pub(crate) fn open(core: &Arc<FsCore>, sector: u32) -> InodeRef {
        if let Some(handle) = Self::try_join(core, sector) {
            return handle;
        }

        // Materialize outside the registry lock, then race to insert.
        let disk = read_disk_inode(core, sector);
        assert_eq!(
            disk.magic, INODE_MAGIC,
            "sector {} does not hold an inode",
            sector
        );
        let fresh = Arc::new(Inode {
            sector,
            rw: RwLock::new(()),
            meta: Mutex::new(InodeMeta {
                open_count: 1,
                removed: false,
                deny_write_count: 0,
                disk,
            }),
        });

        let mut list = core.itable.list.lock();
        if let Some(existing) = list.iter().find(|inode| inode.sector == sector) {
            let inode = Arc::clone(existing);
            inode.meta.lock().unwrap().open_count += 1;
            drop(list);
            return InodeRef {
                inode,
                core: Arc::clone(core),
            };
        }
        list.push(Arc::clone(&fresh));
        drop(list);
        InodeRef {
            inode: fresh,
            core: Arc::clone(core),
        }
    }

    fn try_join(core: &Arc<FsCore>, sector: u32) -> Option<InodeRef> {
        let list = core.itable.list.lock();
        let inode = Arc::clone(list.iter().find(|inode| inode.sector == sector)?);
        inode.meta.lock().unwrap().open_count += 1;
        drop(list);
        Some(InodeRef {
            inode,
            core: Arc::clone(core),
        })
    }

    /// Whether `sector` currently has an in-memory shadow.
    #[cfg(test)]
    pub(crate) fn contains(&self, sector: u32) -> bool {
        self.list.lock().iter().any(|inode| inode.sector == sector)
    }
}

/// A counted reference to an open inode. Clone to reopen, drop to close.
pub struct InodeRef {
    inode: Arc<Inode>,
    core: Arc<FsCore>,
}

impl core::fmt::Debug for InodeRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InodeRef").finish_non_exhaustive()
    }
}

impl InodeRef {
    /// The inode's home sector; doubles as its identity for `inumber`.
    pub fn sector(&self) -> u32 {
        self.inode.sector
    }

    pub(crate) fn fs_core(&self) -> &Arc<FsCore> {
        &self.core
    }

    pub fn kind(&self) -> InodeKind {
        InodeKind::from_raw(self.inode.meta.lock().unwrap().disk.kind)
    }

    pub fn length(&self) -> usize {
        self.inode.meta.lock().unwrap().disk.length as usize
    }

    /// Marks the inode for deletion at its last close. Openers keep full
    /// access until then.
    pub fn remove(&self) {
        self.inode.meta.lock().unwrap().removed = true;
    }

    /// Openers of this inode right now, ourselves included.
    pub(crate) fn open_count(&self) -> u32 {
        self.inode.meta.lock().unwrap().open_count
    }

    /// Blocks writers until a matching [`InodeRef::allow_write`].
    pub fn deny_write(&self) {
        let mut meta = self.inode.meta.lock().unwrap();
        meta.deny_write_count += 1;
        debug_assert!(meta.deny_write_count <= meta.open_count);
    }

    pub fn allow_write(&self) {
        let mut meta = self.inode.meta.lock().unwrap();
        assert!(meta.deny_write_count > 0, "allow_write without deny_write");
        meta.deny_write_count -= 1;
    }

    /// Reads up to `buf.len()` bytes starting at byte `offset`. Returns the
    /// bytes copied; short counts mean EOF.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let _guard = self.inode.rw.read().unwrap();
        // The map cannot move under a read guard, so one snapshot serves
        // the whole loop.
        let disk = self.inode.meta.lock().unwrap().disk;
        let length = disk.length as usize;

        let mut total = 0;
        while total < buf.len() {
            let pos = offset + total;
            let sector = match sector_of(&self.core, &disk, pos) {
                Some(sector) => sector,
                None => break,
            };
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = cmp::min(
                cmp::min(buf.len() - total, SECTOR_SIZE - sector_ofs),
                length - pos,
            );
            self.core.cache.read_offset(
                &self.core.dev,
                sector,
                &mut buf[total..total + chunk],
                sector_ofs,
            );
            total += chunk;
        }
        total
    }

    /// Writes `buf` starting at byte `offset`, growing the inode first when
    /// the write extends past EOF. Returns the bytes written: 0 while
    /// writers are denied, and a short count when growth fails.
    pub fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        let _guard = self.inode.rw.write().unwrap();
        let disk = {
            let mut meta = self.inode.meta.lock().unwrap();
            if meta.deny_write_count > 0 {
                return 0;
            }
            let end = offset.saturating_add(buf.len());
            if end > meta.disk.length as usize {
                if let Err(err) = resize(&self.core, self.inode.sector, &mut meta.disk, end) {
                    log::debug!(
                        "inode {}: grow to {} failed: {}",
                        self.inode.sector,
                        end,
                        err
                    );
                    return 0;
                }
            }
            meta.disk
        };
        let length = disk.length as usize;

        let mut total = 0;
        while total < buf.len() {
            let pos = offset + total;
            let sector = match sector_of(&self.core, &disk, pos) {
                Some(sector) => sector,
                None => break,
            };
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = cmp::min(
                cmp::min(buf.len() - total, SECTOR_SIZE - sector_ofs),
                length - pos,
            );
            if sector_ofs == 0 && chunk == SECTOR_SIZE {
                let src: &[u8; SECTOR_SIZE] = buf[total..total + chunk]
                    .try_into()
                    .expect("full-sector chunk");
                self.core.cache.write(&self.core.dev, sector, src);
            } else {
                self.core.cache.write_offset(
                    &self.core.dev,
                    sector,
                    &buf[total..total + chunk],
                    sector_ofs,
                );
            }
            total += chunk;
        }
        total
    }
}

impl Clone for InodeRef {
    /// Reopening: another counted reference to the same shadow.
    fn clone(&self) -> InodeRef {
        self.inode.meta.lock().unwrap().open_count += 1;
        InodeRef {
            inode: Arc::clone(&self.inode),
            core: Arc::clone(&self.core),
        }
    }
}

impl Drop for InodeRef {
    /// Closing. The last close deregisters the shadow and, if the inode was
    /// removed, returns its content and home sector to the free map.
    fn drop(&mut self) {
        let mut list = self.core.itable.list.lock();
        let mut meta = self.inode.meta.lock().unwrap();
        meta.open_count -= 1;
        if meta.open_count > 0 {
            return;
        }
        list.retain(|inode| !Arc::ptr_eq(inode, &self.inode));
        let removed = meta.removed;
        let mut disk = meta.disk;
        drop(meta);
        drop(list);

        if removed {
            // Nobody can reach the inode anymore; no lock needed for the
            // final teardown.
            let home = self.inode.sector;
            resize(&self.core, home, &mut disk, 0).expect("shrink to zero cannot fail");
            self.core.freemap.release(home, 1);
            log::debug!("inode {}: deferred free complete", home);
        }
    }
}
