//! Page buffer cache.
//!
//! A fixed array of slots, each able to hold one physical page image.
//! Recency is a per-slot rank (0 = most recently used); touching a slot
//! moves it to rank 0 and shifts the slots that were ahead of it up by one.
//! Locked slots hold unflushed updates and are skipped by victim selection,
//! so pending pages survive until the next sync.

use norftl_common::constants::PAGE_SIZE;
use norftl_common::{LogicalPageNo, PhysicalPageNo};

use crate::error::{FtlError, FtlResult};
use crate::hal::NorFlash;

/// Pending flush action for a cached page.
///
/// Modes only escalate while a slot is dirty; [`Slot::promote_mode`] never
/// downgrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProgramMode {
    /// Nothing to flush.
    None,
    /// Program in place; only 1→0 bit transitions are pending.
    Program,
    /// Erase the page if needed, then program it.
    EraseProgram,
    /// Copy-on-write: allocate a fresh page, erase it if needed, program
    /// there and orphan the old page.
    RelocateEraseProgram,
}

/// One cache slot.
#[derive(Debug)]
pub struct Slot {
    /// Logical page currently held; `INVALID` when the slot is empty.
    pub logical: LogicalPageNo,
    /// Physical page currently held; `INVALID` when the slot is empty.
    pub physical: PhysicalPageNo,
    /// Recency rank; 0 is most recently used.
    pub rank: usize,
    /// Locked slots carry unflushed updates and cannot be evicted.
    pub locked: bool,
    /// Action the next sync takes for this slot.
    pub mode: ProgramMode,
    /// Page image.
    pub data: Vec<u8>,
}

impl Slot {
    fn new(rank: usize) -> Self {
        Self {
            logical: LogicalPageNo::INVALID,
            physical: PhysicalPageNo::INVALID,
            rank,
            locked: false,
            mode: ProgramMode::None,
            data: vec![0xFF; PAGE_SIZE],
        }
    }

    /// Raises the pending mode to at least `mode`.
    #[inline]
    pub fn promote_mode(&mut self, mode: ProgramMode) {
        if mode > self.mode {
            self.mode = mode;
        }
    }

    /// Clears the dirty markers after a successful flush.
    #[inline]
    pub fn settle(&mut self) {
        self.locked = false;
        self.mode = ProgramMode::None;
    }
}

/// Fixed-size cache of physical page images.
#[derive(Debug)]
pub struct BufferCache {
    slots: Vec<Slot>,
}

impl BufferCache {
    /// Creates a cache with `slot_count` empty slots.
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots: (0..slot_count).map(Slot::new).collect(),
        }
    }

    /// Number of slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if the cache has no slots.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Borrows slot `index`.
    #[inline]
    pub fn slot(&self, index: usize) -> &Slot {
        &self.slots[index]
    }

    /// Mutably borrows slot `index`.
    #[inline]
    pub fn slot_mut(&mut self, index: usize) -> &mut Slot {
        &mut self.slots[index]
    }

    /// Number of slots not locked by pending writes.
    pub fn free_slots(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.locked).count()
    }

    /// Looks up `physical`, promoting it to most recently used on a hit.
    pub fn find(&mut self, physical: PhysicalPageNo) -> Option<usize> {
        let index = self
            .slots
            .iter()
            .position(|slot| slot.physical == physical)?;
        self.promote(index);
        Some(index)
    }

    /// Brings `physical` into the cache, reading it from the device unless
    /// already present. Returns the slot index.
    ///
    /// Fails with [`FtlError::CacheExhausted`] when every slot is locked;
    /// the caller must sync and retry.
    pub fn load<F: NorFlash>(
        &mut self,
        hal: &mut F,
        logical: LogicalPageNo,
        physical: PhysicalPageNo,
    ) -> FtlResult<usize> {
        if let Some(index) = self.find(physical) {
            return Ok(index);
        }

        let index = self.victim().ok_or(FtlError::CacheExhausted)?;
        let slot = &mut self.slots[index];
        // invalidate first so a failed read cannot leave a stale mapping
        slot.physical = PhysicalPageNo::INVALID;
        hal.read(physical.byte_offset(), &mut slot.data)?;
        slot.logical = logical;
        slot.physical = physical;
        slot.locked = false;
        slot.mode = ProgramMode::None;
        self.promote(index);
        Ok(index)
    }

    /// Claims a slot for a freshly allocated page without touching the
    /// device: contents all-ones, locked, pending erase-program.
    pub fn init(
        &mut self,
        logical: LogicalPageNo,
        physical: PhysicalPageNo,
    ) -> FtlResult<usize> {
        if let Some(index) = self.find(physical) {
            return Ok(index);
        }

        let index = self.victim().ok_or(FtlError::CacheExhausted)?;
        let slot = &mut self.slots[index];
        slot.logical = logical;
        slot.physical = physical;
        slot.locked = true;
        slot.mode = ProgramMode::EraseProgram;
        slot.data.fill(0xFF);
        self.promote(index);
        Ok(index)
    }

    /// Moves slot `index` to rank 0, shifting the slots ahead of it up.
    fn promote(&mut self, index: usize) {
        let old_rank = self.slots[index].rank;
        for slot in &mut self.slots {
            if slot.rank < old_rank {
                slot.rank += 1;
            }
        }
        self.slots[index].rank = 0;
    }

    /// Picks the least recently used unlocked slot.
    fn victim(&self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.locked)
            .max_by_key(|(_, slot)| slot.rank)
            .map(|(index, _)| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MemFlash;

    fn rank_of(cache: &BufferCache, physical: u16) -> usize {
        (0..cache.len())
            .map(|i| cache.slot(i))
            .find(|slot| slot.physical == PhysicalPageNo::new(physical))
            .expect("page not cached")
            .rank
    }

    #[test]
    fn test_new_cache_is_empty() {
        let mut cache = BufferCache::new(4);
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.free_slots(), 4);
        assert!(cache.find(PhysicalPageNo::new(0)).is_none());
    }

    #[test]
    fn test_load_reads_device() {
        let mut hal = MemFlash::new(4);
        let page = vec![0x5A; PAGE_SIZE];
        hal.program(3 * PAGE_SIZE as u32, &page).unwrap();

        let mut cache = BufferCache::new(4);
        let index = cache
            .load(&mut hal, LogicalPageNo::new(7), PhysicalPageNo::new(3))
            .unwrap();

        let slot = cache.slot(index);
        assert_eq!(slot.logical, LogicalPageNo::new(7));
        assert_eq!(slot.physical, PhysicalPageNo::new(3));
        assert_eq!(slot.rank, 0);
        assert!(!slot.locked);
        assert_eq!(slot.mode, ProgramMode::None);
        assert_eq!(slot.data, page);
    }

    #[test]
    fn test_load_hit_does_not_reread() {
        let mut hal = MemFlash::new(4);
        let mut cache = BufferCache::new(4);

        let a = cache
            .load(&mut hal, LogicalPageNo::new(1), PhysicalPageNo::new(1))
            .unwrap();
        // mutate the cached image; a second load must not clobber it
        cache.slot_mut(a).data[0] = 0x00;
        let b = cache
            .load(&mut hal, LogicalPageNo::new(1), PhysicalPageNo::new(1))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.slot(b).data[0], 0x00);
    }

    #[test]
    fn test_promote_shifts_ranks() {
        let mut hal = MemFlash::new(4);
        let mut cache = BufferCache::new(3);
        for page in 0..3u16 {
            cache
                .load(&mut hal, LogicalPageNo::new(page), PhysicalPageNo::new(page))
                .unwrap();
        }
        // most recent load is rank 0, oldest is rank 2
        assert_eq!(rank_of(&cache, 2), 0);
        assert_eq!(rank_of(&cache, 1), 1);
        assert_eq!(rank_of(&cache, 0), 2);

        // touching the oldest rotates the others up by one
        cache.find(PhysicalPageNo::new(0)).unwrap();
        assert_eq!(rank_of(&cache, 0), 0);
        assert_eq!(rank_of(&cache, 2), 1);
        assert_eq!(rank_of(&cache, 1), 2);
    }

    #[test]
    fn test_eviction_takes_lru() {
        let mut hal = MemFlash::new(4);
        let mut cache = BufferCache::new(2);
        let a = cache
            .load(&mut hal, LogicalPageNo::new(0), PhysicalPageNo::new(0))
            .unwrap();
        cache
            .load(&mut hal, LogicalPageNo::new(1), PhysicalPageNo::new(1))
            .unwrap();

        // slot `a` is the LRU; the third page must land there
        let c = cache
            .load(&mut hal, LogicalPageNo::new(2), PhysicalPageNo::new(2))
            .unwrap();
        assert_eq!(a, c);
        assert!(cache.find(PhysicalPageNo::new(0)).is_none());
    }

    #[test]
    fn test_eviction_skips_locked() {
        let mut hal = MemFlash::new(4);
        let mut cache = BufferCache::new(2);
        let a = cache
            .load(&mut hal, LogicalPageNo::new(0), PhysicalPageNo::new(0))
            .unwrap();
        let b = cache
            .load(&mut hal, LogicalPageNo::new(1), PhysicalPageNo::new(1))
            .unwrap();
        cache.slot_mut(a).locked = true;

        // the LRU slot is locked, so the newer one is sacrificed
        let c = cache
            .load(&mut hal, LogicalPageNo::new(2), PhysicalPageNo::new(2))
            .unwrap();
        assert_eq!(c, b);
        assert!(cache.find(PhysicalPageNo::new(0)).is_some());
    }

    #[test]
    fn test_all_locked_fails() {
        let mut hal = MemFlash::new(4);
        let mut cache = BufferCache::new(2);
        for page in 0..2u16 {
            let index = cache
                .load(&mut hal, LogicalPageNo::new(page), PhysicalPageNo::new(page))
                .unwrap();
            cache.slot_mut(index).locked = true;
        }
        assert_eq!(cache.free_slots(), 0);

        let result = cache.load(&mut hal, LogicalPageNo::new(9), PhysicalPageNo::new(9));
        assert!(matches!(result, Err(FtlError::CacheExhausted)));
    }

    #[test]
    fn test_init_fills_ones_and_locks() {
        let mut cache = BufferCache::new(2);
        let index = cache
            .init(LogicalPageNo::new(4), PhysicalPageNo::new(10))
            .unwrap();
        let slot = cache.slot(index);
        assert!(slot.locked);
        assert_eq!(slot.mode, ProgramMode::EraseProgram);
        assert!(slot.data.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_mode_never_downgrades() {
        let mut slot = Slot::new(0);
        slot.promote_mode(ProgramMode::Program);
        assert_eq!(slot.mode, ProgramMode::Program);
        slot.promote_mode(ProgramMode::RelocateEraseProgram);
        assert_eq!(slot.mode, ProgramMode::RelocateEraseProgram);
        slot.promote_mode(ProgramMode::EraseProgram);
        assert_eq!(slot.mode, ProgramMode::RelocateEraseProgram);

        slot.settle();
        assert_eq!(slot.mode, ProgramMode::None);
        assert!(!slot.locked);
    }
}
