//! Free-sector accounting.
//!
//! One bit per device sector. The working copy lives in memory under a spin
//! lock so that `allocate`/`release` are short critical sections with no
//! nested I/O; the bitmap persists as an ordinary file whose inode lives at
//! sector 0, written back by `FileSystem::flush`.

use spin::Mutex;

use crate::bitmap::Bitmap;
use crate::param::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR};

pub(crate) struct FreeMap {
    bits: Mutex<Bitmap>,
}

impl FreeMap {
    /// A fresh map for `capacity` sectors with only the reserved inode
    /// sectors taken. `mount` replaces this with the persisted state.
    pub(crate) fn new(capacity: u32) -> FreeMap {
        let mut bits = Bitmap::new(capacity as usize);
        bits.set(FREE_MAP_SECTOR as usize, true);
        bits.set(ROOT_DIR_SECTOR as usize, true);
        FreeMap { bits: Mutex::new(bits) }
    }

    pub(crate) fn replace(&self, bits: Bitmap) {
        *self.bits.lock() = bits;
    }

    pub(crate) fn snapshot(&self) -> Vec<u8> {
        self.bits.lock().as_bytes().to_vec()
    }

    /// Claims `cnt` consecutive free sectors, returning the first.
    pub(crate) fn allocate(&self, cnt: usize) -> Option<u32> {
        let found = self.bits.lock().scan_and_flip(0, cnt, false);
        if found.is_none() {
            log::warn!("freemap: no run of {} free sectors", cnt);
        }
        found.map(|idx| idx as u32)
    }

    /// Returns `cnt` sectors starting at `sector` to the pool.
    pub(crate) fn release(&self, sector: u32, cnt: usize) {
        let mut bits = self.bits.lock();
        assert!(
            bits.all(sector as usize, cnt, true),
            "releasing sectors that are not allocated"
        );
        bits.set_multiple(sector as usize, cnt, false);
    }

    pub(crate) fn free_count(&self) -> usize {
        self.bits.lock().count_clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_sectors_start_taken() {
        let map = FreeMap::new(64);
        assert_eq!(map.free_count(), 62);
        // The first allocation lands after the reserved pair.
        assert_eq!(map.allocate(1), Some(2));
    }

    #[test]
    fn release_returns_sectors() {
        let map = FreeMap::new(16);
        let s = map.allocate(4).unwrap();
        assert_eq!(map.free_count(), 10);
        map.release(s, 4);
        assert_eq!(map.free_count(), 14);
    }

    #[test]
    fn allocate_exhausts_and_fails_cleanly() {
        let map = FreeMap::new(8);
        assert!(map.allocate(7).is_none());
        assert_eq!(map.allocate(6), Some(2));
        assert!(map.allocate(1).is_none());
    }

    #[test]
    #[should_panic]
    fn double_release_is_fatal() {
        let map = FreeMap::new(8);
        let s = map.allocate(1).unwrap();
        map.release(s, 1);
        map.release(s, 1);
    }
}
