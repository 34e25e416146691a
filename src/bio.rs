//! Buffer cache.
//!
//! A fixed set of sector-sized buffers holding cached copies of device
//! sectors. Caching reduces device traffic and gives every layer above one
//! synchronization point per sector: a single lock covers the whole set and
//! is held across eviction and the device transfer it triggers.
//!
//! Writes are write-back: a write dirties the in-memory buffer and the
//! device copy catches up when the buffer is evicted or the cache is
//! flushed. The exception is a partial-sector write that misses: the sector
//! is loaded, merged and written straight back, so the read-modified sector
//! is durable even if it is never touched again.
//!
//! Eviction recycles the buffer whose last access is furthest in the past,
//! using a monotonic tick stamped on every touch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use array_macro::array;

use crate::device::BlockDevice;
use crate::param::{NBUF, SECTOR_SIZE};

struct BufSlot {
    free: bool,
    dirty: bool,
    dev: Option<Arc<dyn BlockDevice>>,
    sector: u32,
    last_touched: u64,
    data: [u8; SECTOR_SIZE],
}

impl BufSlot {
    fn new() -> BufSlot {
        BufSlot {
            free: true,
            dirty: false,
            dev: None,
            sector: 0,
            last_touched: 0,
            data: [0; SECTOR_SIZE],
        }
    }

    fn holds(&self, dev: &Arc<dyn BlockDevice>, sector: u32) -> bool {
        !self.free
            && self.sector == sector
            && self
                .dev
                .as_ref()
                .map_or(false, |held| same_device(held, dev))
    }

    fn write_back(&mut self) {
        if self.dirty {
            let dev = self.dev.as_ref().expect("dirty buffer without a device");
            dev.write(self.sector, &self.data);
            self.dirty = false;
        }
    }
}

/// Device identity is the object, not the vtable.
fn same_device(a: &Arc<dyn BlockDevice>, b: &Arc<dyn BlockDevice>) -> bool {
    Arc::as_ptr(a) as *const u8 == Arc::as_ptr(b) as *const u8
}

/// Counters for the policy tests and for `/proc`-style introspection.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub write_backs: u64,
}

pub struct BlockCache {
    slots: Mutex<Box<[BufSlot; NBUF]>>,
    ticks: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    write_backs: AtomicU64,
}

impl BlockCache {
    pub fn new() -> BlockCache {
        BlockCache {
            slots: Mutex::new(Box::new(array![_ => BufSlot::new(); NBUF])),
            ticks: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            write_backs: AtomicU64::new(0),
        }
    }

    /// Reads the whole of `sector` into `dst`.
    pub fn read(&self, dev: &Arc<dyn BlockDevice>, sector: u32, dst: &mut [u8; SECTOR_SIZE]) {
        self.read_offset(dev, sector, dst, 0);
    }

    /// Reads `dst.len()` bytes of `sector` starting at `sector_ofs`.
    pub fn read_offset(
        &self,
        dev: &Arc<dyn BlockDevice>,
        sector: u32,
        dst: &mut [u8],
        sector_ofs: usize,
    ) {
        assert!(sector_ofs + dst.len() <= SECTOR_SIZE);
        let mut slots = self.slots.lock().unwrap();
        let idx = self.slot_for(&mut slots, dev, sector, false);
        dst.copy_from_slice(&slots[idx].data[sector_ofs..sector_ofs + dst.len()]);
    }

    /// Replaces the whole of `sector` with `src`.
    ///
    /// A full overwrite never reads the device: every byte of the old
    /// contents is dead.
    pub fn write(&self, dev: &Arc<dyn BlockDevice>, sector: u32, src: &[u8; SECTOR_SIZE]) {
        let mut slots = self.slots.lock().unwrap();
        let idx = self.slot_for(&mut slots, dev, sector, true);
        slots[idx].data.copy_from_slice(src);
        slots[idx].dirty = true;
    }

    /// Writes `src.len()` bytes into `sector` starting at `sector_ofs`,
    /// preserving the untouched remainder of the sector.
    pub fn write_offset(
        &self,
        dev: &Arc<dyn BlockDevice>,
        sector: u32,
        src: &[u8],
        sector_ofs: usize,
    ) {
        assert!(sector_ofs + src.len() <= SECTOR_SIZE);
        let full = sector_ofs == 0 && src.len() == SECTOR_SIZE;
        let mut slots = self.slots.lock().unwrap();
        let was_cached = slots.iter().any(|slot| slot.holds(dev, sector));
        let idx = self.slot_for(&mut slots, dev, sector, full);
        let slot = &mut slots[idx];
        slot.data[sector_ofs..sector_ofs + src.len()].copy_from_slice(src);
        if !full && !was_cached {
            // Loaded only to be partially overwritten: push the merged
            // sector out now so it is durable even if never touched again.
            dev.write(sector, &slot.data);
            slot.dirty = false;
            self.write_backs.fetch_add(1, Ordering::SeqCst);
        } else {
            slot.dirty = true;
        }
    }

    /// Writes every dirty buffer back to its device. Buffers stay valid.
    pub fn flush(&self) {
        let mut slots = self.slots.lock().unwrap();
        let mut flushed = 0u64;
        for slot in slots.iter_mut() {
            if !slot.free && slot.dirty {
                slot.write_back();
                flushed += 1;
            }
        }
        self.write_backs.fetch_add(flushed, Ordering::SeqCst);
        if flushed > 0 {
            log::debug!("bio: flushed {} dirty buffers", flushed);
        }
    }

    /// Flushes and drops every buffer. The final cache operation.
    pub fn shutdown(&self) {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            if !slot.free {
                slot.write_back();
                slot.free = true;
                slot.dev = None;
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::SeqCst),
            misses: self.misses.load(Ordering::SeqCst),
            evictions: self.evictions.load(Ordering::SeqCst),
            write_backs: self.write_backs.load(Ordering::SeqCst),
        }
    }

    /// Finds the slot caching (`dev`, `sector`), loading it on a miss.
    ///
    /// `whole_sector_write` skips the demand read when the caller is about
    /// to overwrite all 512 bytes. Called with the set lock held; the lock
    /// stays held across any write-back and read this triggers.
    fn slot_for(
        &self,
        slots: &mut [BufSlot; NBUF],
        dev: &Arc<dyn BlockDevice>,
        sector: u32,
        whole_sector_write: bool,
    ) -> usize {
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst);

        if let Some(idx) = slots.iter().position(|slot| slot.holds(dev, sector)) {
            slots[idx].last_touched = tick;
            self.hits.fetch_add(1, Ordering::SeqCst);
            return idx;
        }
        self.misses.fetch_add(1, Ordering::SeqCst);

        // Miss: recycle the least recently touched slot, free ones first.
        let idx = match slots.iter().position(|slot| slot.free) {
            Some(idx) => idx,
            None => {
                let idx = slots
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, slot)| slot.last_touched)
                    .map(|(idx, _)| idx)
                    .unwrap();
                self.evictions.fetch_add(1, Ordering::SeqCst);
                if slots[idx].dirty {
                    self.write_backs.fetch_add(1, Ordering::SeqCst);
                }
                slots[idx].write_back();
                idx
            }
        };

        let slot = &mut slots[idx];
        slot.free = false;
        slot.dirty = false;
        slot.dev = Some(Arc::clone(dev));
        slot.sector = sector;
        slot.last_touched = tick;
        if whole_sector_write {
            slot.data = [0; SECTOR_SIZE];
        } else {
            dev.read(sector, &mut slot.data);
        }
        idx
    }
}

impl Default for BlockCache {
    fn default() -> BlockCache {
        BlockCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;

    fn disk(capacity: u32) -> (Arc<MemDisk>, Arc<dyn BlockDevice>) {
        let disk = Arc::new(MemDisk::new(capacity));
        let dev: Arc<dyn BlockDevice> = disk.clone();
        (disk, dev)
    }

    fn pattern(byte: u8) -> [u8; SECTOR_SIZE] {
        [byte; SECTOR_SIZE]
    }

    #[test]
    fn read_sees_cached_write() {
        let (_, dev) = disk(16);
        let cache = BlockCache::new();
        cache.write(&dev, 3, &pattern(0x5a));
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(&dev, 3, &mut buf);
        assert_eq!(buf, pattern(0x5a));
    }

    #[test]
    fn coherent_across_eviction_pressure() {
        let (disk, dev) = disk(NBUF as u32 * 8);
        let cache = BlockCache::new();
        cache.write(&dev, 5, &pattern(0xa1));

        // Touch enough unrelated sectors to evict sector 5 several times
        // over.
        let mut buf = [0u8; SECTOR_SIZE];
        for sector in 100..100 + 3 * NBUF as u32 {
            cache.read(&dev, sector, &mut buf);
        }

        cache.read(&dev, 5, &mut buf);
        assert_eq!(buf, pattern(0xa1));
        // The dirty buffer went through the device on the way out.
        assert!(disk.write_count() >= 1);
    }

    #[test]
    fn evicts_least_recently_touched_first() {
        let (disk, dev) = disk(NBUF as u32 + 8);
        let cache = BlockCache::new();
        let mut buf = [0u8; SECTOR_SIZE];

        // Fill all 64 slots with sectors 0..64, then touch one more.
        for sector in 0..=NBUF as u32 {
            cache.read(&dev, sector, &mut buf);
        }
        let loads = disk.read_count();

        // Sector 1 was touched after sector 0, so it must still be
        // resident...
        cache.read(&dev, 1, &mut buf);
        assert_eq!(disk.read_count(), loads);
        // ...while sector 0 was the eviction victim.
        cache.read(&dev, 0, &mut buf);
        assert_eq!(disk.read_count(), loads + 1);
        assert!(cache.stats().evictions >= 1);
    }

    #[test]
    fn partial_write_miss_is_immediately_durable() {
        let (disk, dev) = disk(16);
        dev.write(7, &pattern(0x11));
        let writes_before = disk.write_count();

        let cache = BlockCache::new();
        cache.write_offset(&dev, 7, &[0xff; 8], 100);

        // Merged sector already on the device, not just in the cache.
        assert_eq!(disk.write_count(), writes_before + 1);
        let mut raw = [0u8; SECTOR_SIZE];
        disk.read(7, &mut raw);
        assert_eq!(&raw[100..108], &[0xff; 8]);
        assert_eq!(raw[99], 0x11);
        assert_eq!(raw[108], 0x11);

        // Nothing left dirty for flush to do.
        cache.flush();
        assert_eq!(disk.write_count(), writes_before + 1);
    }

    #[test]
    fn full_write_miss_skips_the_demand_read() {
        let (disk, dev) = disk(16);
        let cache = BlockCache::new();
        cache.write(&dev, 2, &pattern(0x33));
        assert_eq!(disk.read_count(), 0);

        // Write-back deferred until flush.
        assert_eq!(disk.write_count(), 0);
        cache.flush();
        assert_eq!(disk.write_count(), 1);
        cache.flush();
        assert_eq!(disk.write_count(), 1);
    }

    #[test]
    fn flush_keeps_buffers_valid() {
        let (disk, dev) = disk(16);
        let cache = BlockCache::new();
        cache.write(&dev, 9, &pattern(0x77));
        cache.flush();
        let loads = disk.read_count();

        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(&dev, 9, &mut buf);
        assert_eq!(buf, pattern(0x77));
        assert_eq!(disk.read_count(), loads);
    }

    #[test]
    fn partial_write_within_cached_sector_stays_write_back() {
        let (disk, dev) = disk(16);
        let cache = BlockCache::new();
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(&dev, 4, &mut buf);
        let writes_before = disk.write_count();

        cache.write_offset(&dev, 4, &[0xee; 4], 0);
        assert_eq!(disk.write_count(), writes_before);
        cache.flush();
        assert_eq!(disk.write_count(), writes_before + 1);
    }
}
