//! Flash device interface.
//!
//! The engine drives the device through the narrow [`NorFlash`] trait: one
//! read, one program, one erase, and one erased-state probe. Everything else
//! — translation, caching, wear spreading, crash ordering — lives above this
//! seam, so porting to a new device means implementing four methods.
//!
//! Addresses are byte offsets from the start of the device. Program and
//! erase target whole 4096-byte pages at page-aligned addresses; reads may
//! cover any span of up to one page.

mod mem;

pub use mem::MemFlash;

use std::fmt;

use thiserror::Error;

/// Result type for device operations.
pub type HalResult<T> = Result<T, HalError>;

/// The device operation that failed, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalOp {
    /// A read of up to one page.
    Read,
    /// A full-page program.
    Program,
    /// A page erase.
    Erase,
}

impl fmt::Display for HalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Program => write!(f, "program"),
            Self::Erase => write!(f, "erase"),
        }
    }
}

/// A failed device operation.
///
/// The engine aborts the current operation when the device reports failure;
/// its RAM state is left as-is and the caller may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("flash {op} failed at address {addr:#x}")]
pub struct HalError {
    /// The operation that failed.
    pub op: HalOp,
    /// Byte address the operation targeted.
    pub addr: u32,
}

/// Blocking interface to a NOR flash device.
///
/// Every call runs to completion before returning; the engine never issues
/// overlapping operations and never cancels one mid-flight.
pub trait NorFlash {
    /// Copies `buf.len()` bytes starting at `addr` into `buf`.
    ///
    /// `buf.len()` never exceeds one page.
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> HalResult<()>;

    /// Programs one full page at the page-aligned `addr`.
    ///
    /// NOR programming only moves bits 1→0; the engine erases first whenever
    /// a 0→1 transition would be needed.
    fn program(&mut self, addr: u32, data: &[u8]) -> HalResult<()>;

    /// Erases the page at the page-aligned `addr` back to all-ones.
    fn erase(&mut self, addr: u32) -> HalResult<()>;

    /// Whether the page at `addr` currently reads as all-ones.
    fn is_erased(&mut self, addr: u32) -> bool;
}
