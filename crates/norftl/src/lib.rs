//! # norftl
//!
//! Crash-safe flash translation layer for NOR devices.
//!
//! norftl exposes a linear array of 512-byte logical sectors over a NOR
//! flash whose smallest erase/program unit is a 4096-byte page. Internally
//! it manages the erase/program asymmetry of NOR (bits program 1→0 and only
//! erase back), spreads wear with a circular write frontier, and keeps the
//! volume mountable across power loss at any device-call boundary:
//!
//! - **Two-level translation**: a master table page plus secondary table
//!   pages map logical pages to physical pages, all resident on media with
//!   magic/serial/CRC headers.
//! - **Copy-on-write updates**: rewriting a sector relocates its page to a
//!   fresh physical location; the tables follow, master last.
//! - **Delayed programming**: updates accumulate in a small LRU page cache
//!   and reach the device in a strict order on [`Ftl::sync`].
//!
//! # Usage
//!
//! ```rust
//! use norftl::{Ftl, Geometry, MemFlash};
//! use norftl_common::constants::SECTOR_SIZE;
//!
//! fn example() -> norftl::FtlResult<()> {
//!     let geometry = Geometry::new(4)?;
//!     let mut ftl = Ftl::new(MemFlash::new(4), geometry)?;
//!
//!     ftl.write_sectors(0, &[0xAA; SECTOR_SIZE])?;
//!     ftl.sync()?;
//!
//!     let mut out = [0u8; SECTOR_SIZE];
//!     ftl.read_sector(0, &mut out)?;
//!     assert_eq!(out, [0xAA; SECTOR_SIZE]);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Page buffer cache
pub mod buffer;

/// Error types
pub mod error;

/// The translation engine
pub mod ftl;

/// Device geometry
pub mod geometry;

/// Flash device interface
pub mod hal;

/// Physical-page state tracking
pub mod state;

/// On-media translation-table format
pub mod table;

pub use error::{FtlError, FtlResult};
pub use ftl::Ftl;
pub use geometry::Geometry;
pub use hal::{HalError, HalOp, HalResult, MemFlash, NorFlash};
