//! # norftl-common
//!
//! Common types and constants for the norftl flash translation layer.
//!
//! This crate provides the foundational pieces shared by the engine and its
//! consumers:
//!
//! - **Types**: page-number newtypes (`LogicalPageNo`, `PhysicalPageNo`)
//! - **Constants**: the on-media format's numeric semantics

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod constants;
pub mod types;

// Re-export commonly used items at the crate root
pub use constants::*;
pub use types::{LogicalPageNo, PhysicalPageNo};
