//! Page Allocator Seam
//!
//! CMA pages are lent to movable users until they are requested back. The
//! page allocator owns that lending, so taking a range back (and giving it
//! out again on release) goes through [`ContigRange`], implemented by
//! whoever owns the buddy lists.

use core::fmt;
use core::ops::BitOr;

use m6_common::Pfn;

/// Allocation context flags.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct GfpFlags(u32);

impl GfpFlags {
    /// Atomic context, no flags
    pub const ATOMIC: Self = Self(0);
    /// The caller may sleep and reclaim
    pub const DIRECT_RECLAIM: Self = Self(1 << 0);
    /// Do not log allocation failures
    pub const NOWARN: Self = Self(1 << 1);
    /// The caller needs ZONE_DMA memory
    pub const DMA: Self = Self(1 << 2);
    /// The caller needs ZONE_DMA32 memory
    pub const DMA32: Self = Self(1 << 3);
    /// Ordinary sleepable kernel allocation
    pub const KERNEL: Self = Self::DIRECT_RECLAIM;

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether the caller may block (`gfpflags_allow_blocking`).
    #[inline]
    #[must_use]
    pub const fn allows_blocking(self) -> bool {
        self.contains(Self::DIRECT_RECLAIM)
    }
}

impl BitOr for GfpFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for GfpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GfpFlags({:#x})", self.0)
    }
}

/// Why a range could not be taken back from the page allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateError {
    /// Some pages are transiently pinned; retrying elsewhere may succeed
    Busy,
    /// The range cannot be evacuated
    Failed,
    /// The caller was interrupted
    Interrupted,
}

impl fmt::Display for MigrateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "busy"),
            Self::Failed => write!(f, "failed"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Operations the page allocator provides to CMA.
pub trait ContigRange {
    /// Migrate any movable occupants out of `[start, start + count)` and
    /// hand the frames to the caller.
    ///
    /// # Errors
    ///
    /// [`MigrateError::Busy`] when the range is transiently pinned.
    fn alloc_contig_range(&self, start: Pfn, count: u64, gfp: GfpFlags) -> Result<(), MigrateError>;

    /// Return `[start, start + count)` to the page allocator.
    fn free_contig_range(&self, start: Pfn, count: u64);

    /// Sleep before retrying a busy allocation.
    fn backoff(&self) {}
}
