//! Physical-page state tracking.
//!
//! The engine keeps two bits of state per physical page, packed into `u32`
//! words so a 128 MiB device costs 8 KiB of RAM. Pages start `Unknown` at
//! mount; a lazy resolver probes the device and settles each page into
//! `Erased` or `EraseRequired`, while the translation tables claim theirs
//! as `Used`.

use norftl_common::PhysicalPageNo;

/// Erase/usage state of one physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageState {
    /// Not examined since mount.
    Unknown = 0,
    /// Referenced by the current translation-table view.
    Used = 1,
    /// Holds stale data; must be erased before reuse.
    EraseRequired = 2,
    /// Confirmed all-ones, immediately programmable.
    Erased = 3,
}

impl PageState {
    fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => Self::Unknown,
            1 => Self::Used,
            2 => Self::EraseRequired,
            _ => Self::Erased,
        }
    }
}

/// Packed per-page state map.
#[derive(Debug)]
pub struct PageStateMap {
    words: Vec<u32>,
    page_count: u16,
    resolved: bool,
}

impl PageStateMap {
    /// Creates a map with every page `Unknown`.
    pub fn new(page_count: u16) -> Self {
        Self {
            words: vec![0; (page_count as usize + 15) / 16],
            page_count,
            resolved: false,
        }
    }

    /// Number of pages tracked.
    #[inline]
    pub fn page_count(&self) -> u16 {
        self.page_count
    }

    /// Returns the state of `page`.
    #[inline]
    pub fn get(&self, page: PhysicalPageNo) -> PageState {
        let index = page.as_u16() as usize;
        PageState::from_bits(self.words[index >> 4] >> ((index & 0xF) * 2))
    }

    /// Sets the state of `page`.
    #[inline]
    pub fn set(&mut self, page: PhysicalPageNo, state: PageState) {
        let index = page.as_u16() as usize;
        let shift = (index & 0xF) * 2;
        let word = &mut self.words[index >> 4];
        *word = (*word & !(0x3 << shift)) | ((state as u32) << shift);
    }

    /// True once every page has been resolved at least once; further
    /// resolver passes are no-ops.
    #[inline]
    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// Latches the resolved flag.
    #[inline]
    pub fn mark_resolved(&mut self) {
        self.resolved = true;
    }
}
