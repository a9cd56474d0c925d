//! In-memory NOR device emulation.
//!
//! `MemFlash` models the semantics the engine depends on: programming can
//! only clear bits, erasing restores a whole page to all-ones, and data
//! survives as long as the backing store does. Handles clone into the same
//! backing store, so "power loss" is simply dropping the engine and
//! mounting a fresh one over another handle.
//!
//! The emulation also carries the hooks the test suites need: per-page
//! erase counters, an operation counter, a fail-after-N fault latch for
//! power-fail injection, and direct bit flips for corruption tests.

use std::sync::Arc;

use parking_lot::Mutex;

use norftl_common::constants::PAGE_SIZE;

use super::{HalError, HalOp, HalResult, NorFlash};

#[derive(Debug)]
struct Backing {
    cells: Vec<u8>,
    erase_counts: Vec<u32>,
    program_ops: u64,
    /// Successful fallible operations remaining before the latch trips.
    /// `None` disarms injection; once tripped, every later call fails.
    fail_after: Option<u32>,
}

impl Backing {
    fn charge(&mut self, op: HalOp, addr: u32) -> HalResult<()> {
        match &mut self.fail_after {
            Some(0) => Err(HalError { op, addr }),
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// An in-memory NOR flash device.
///
/// Starts fully erased. Cloned handles share the backing store.
#[derive(Debug, Clone)]
pub struct MemFlash {
    backing: Arc<Mutex<Backing>>,
}

impl MemFlash {
    /// Creates a fully erased device of `size_mib` MiB.
    pub fn new(size_mib: u32) -> Self {
        let bytes = size_mib as usize * 1024 * 1024;
        Self {
            backing: Arc::new(Mutex::new(Backing {
                cells: vec![0xFF; bytes],
                erase_counts: vec![0; bytes / PAGE_SIZE],
                program_ops: 0,
                fail_after: None,
            })),
        }
    }

    /// Arms the fault latch: the next `count` fallible operations (read,
    /// program, erase) succeed and every later one fails, as if power were
    /// lost at that call boundary.
    pub fn fail_after(&self, count: u32) {
        self.backing.lock().fail_after = Some(count);
    }

    /// Disarms fault injection; the device works again, like power coming
    /// back.
    pub fn clear_fault(&self) {
        self.backing.lock().fail_after = None;
    }

    /// Number of erase cycles the page at `page_index` has seen.
    pub fn erase_count(&self, page_index: usize) -> u32 {
        self.backing.lock().erase_counts[page_index]
    }

    /// Total number of program operations accepted.
    pub fn program_ops(&self) -> u64 {
        self.backing.lock().program_ops
    }

    /// Device size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.backing.lock().cells.len()
    }

    /// Flips one stored bit, bypassing NOR semantics. Corruption-test hook.
    pub fn flip_bit(&self, addr: usize, bit: u8) {
        self.backing.lock().cells[addr] ^= 1 << bit;
    }
}

impl NorFlash for MemFlash {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> HalResult<()> {
        debug_assert!(buf.len() <= PAGE_SIZE);
        let mut backing = self.backing.lock();
        backing.charge(HalOp::Read, addr)?;
        let start = addr as usize;
        buf.copy_from_slice(&backing.cells[start..start + buf.len()]);
        Ok(())
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> HalResult<()> {
        debug_assert_eq!(addr as usize % PAGE_SIZE, 0);
        debug_assert_eq!(data.len(), PAGE_SIZE);
        let mut backing = self.backing.lock();
        backing.charge(HalOp::Program, addr)?;
        let start = addr as usize;
        for (cell, byte) in backing.cells[start..start + data.len()].iter_mut().zip(data) {
            *cell &= byte;
        }
        backing.program_ops += 1;
        Ok(())
    }

    fn erase(&mut self, addr: u32) -> HalResult<()> {
        debug_assert_eq!(addr as usize % PAGE_SIZE, 0);
        let mut backing = self.backing.lock();
        backing.charge(HalOp::Erase, addr)?;
        let start = addr as usize;
        backing.cells[start..start + PAGE_SIZE].fill(0xFF);
        backing.erase_counts[start / PAGE_SIZE] += 1;
        Ok(())
    }

    fn is_erased(&mut self, addr: u32) -> bool {
        let backing = self.backing.lock();
        let start = addr as usize;
        backing.cells[start..start + PAGE_SIZE].iter().all(|&c| c == 0xFF)
    }
}
