//! Region table errors.

use core::fmt;

/// Errors returned by [`Memblock`](crate::Memblock) operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum MemblockError {
    /// `base + size` does not fit in a physical address
    Overflow { base: u64, size: u64 },
    /// No free, mapped range satisfies the request
    OutOfSpace {
        size: u64,
        align: u64,
        start: u64,
        end: u64,
    },
}

impl fmt::Display for MemblockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overflow { base, size } => {
                write!(f, "range {:#x}+{:#x} overflows the address space", base, size)
            }
            Self::OutOfSpace {
                size,
                align,
                start,
                end,
            } => write!(
                f,
                "no {:#x} bytes aligned to {:#x} free in [{:#x}-{:#x})",
                size, align, start, end
            ),
        }
    }
}
