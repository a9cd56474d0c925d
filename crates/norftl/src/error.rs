//! Translation-layer error types.

use thiserror::Error;

use crate::hal::HalError;

/// Result type for translation-layer operations.
pub type FtlResult<T> = Result<T, FtlError>;

/// Errors that can occur during translation-layer operations.
#[derive(Debug, Error)]
#[allow(missing_docs)] // Fields are documented by variant docs
pub enum FtlError {
    /// The flash device reported a failure. The engine's RAM state is left
    /// as-is; the caller may retry the operation.
    #[error(transparent)]
    Hal(#[from] HalError),

    /// The requested device size is not supported.
    #[error("unsupported flash size: {size_mib} MiB")]
    UnsupportedSize { size_mib: u32 },

    /// A sector range fell outside the usable sector count.
    #[error("sector range {start}..{end} exceeds usable sector count {limit}")]
    SectorOutOfRange { start: u32, end: u32, limit: u32 },

    /// A write payload is not a whole number of sectors.
    #[error("payload length {len} is not a multiple of the sector size")]
    UnalignedLength { len: usize },

    /// Every cache slot is locked with pending writes; the caller must sync
    /// before more pages can be brought in.
    #[error("all page buffers are locked with pending writes")]
    CacheExhausted,

    /// A full frontier revolution found no allocatable physical page.
    #[error("no allocatable physical page (frontier at {frontier})")]
    OutOfPages { frontier: u16 },
}

impl FtlError {
    /// Returns true if retrying after a sync (or a device recovery) can
    /// succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Hal(_) | Self::CacheExhausted)
    }

    /// Returns true if the caller passed arguments the volume can never
    /// accept.
    pub fn is_invalid_request(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedSize { .. }
                | Self::SectorOutOfRange { .. }
                | Self::UnalignedLength { .. }
        )
    }
}
