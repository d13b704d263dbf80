//! CMA error types.

use core::fmt;

/// Errors from CMA declaration and runtime operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum CmaError {
    /// All area slots are in use
    TooManyAreas,
    /// Base or size is not aligned to the CMA granule
    Misaligned { base: u64, size: u64, align: u64 },
    /// Zero size, bad alignment request, or range not reserved
    InvalidRange,
    /// The requested window cannot hold the area
    ExceedsLimit { base: u64, size: u64, limit: u64 },
    /// A fixed placement overlaps memory that is already claimed
    Busy,
    /// No physical memory left for the area
    OutOfSpace,
    /// No free run of the requested size in the bitmap
    NoSpace,
    /// Pages in the chosen run could not be migrated away
    MigrationFailed,
    /// The caller is not allowed to sleep
    WouldBlock,
    /// The pages do not belong to this area, or are not allocated
    NotOwned,
    /// The area was never activated or was disabled
    Inactive,
}

impl fmt::Display for CmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyAreas => write!(f, "not enough slots for CMA reserved regions"),
            Self::Misaligned { base, size, align } => write!(
                f,
                "region {:#x}+{:#x} is not aligned to {:#x}",
                base, size, align
            ),
            Self::InvalidRange => write!(f, "invalid CMA range"),
            Self::ExceedsLimit { base, size, limit } => write!(
                f,
                "size {:#x} of region at {:#x} exceeds limit {:#x}",
                size, base, limit
            ),
            Self::Busy => write!(f, "region overlaps reserved memory"),
            Self::OutOfSpace => write!(f, "no memory for CMA area"),
            Self::NoSpace => write!(f, "no free range in CMA bitmap"),
            Self::MigrationFailed => write!(f, "migration failed"),
            Self::WouldBlock => write!(f, "CMA allocation requires a sleepable context"),
            Self::NotOwned => write!(f, "pages not allocated from this area"),
            Self::Inactive => write!(f, "CMA area is not active"),
        }
    }
}
