//! Physical Address, Virtual Address and Page Frame Types
//!
//! Small newtypes used throughout the boot memory code so that physical
//! addresses, linear-map virtual addresses and page frame numbers cannot be
//! mixed up silently.
//!
//! # Design
//!
//! These types are `#[repr(transparent)]` wrappers around `u64`:
//! - Zero runtime overhead
//! - Conversions between them are explicit methods (`Pa::pfn_down`,
//!   `Pfn::phys`, ...) instead of free-floating shift macros
//! - The linear-map translation itself lives with the layout that owns
//!   `memstart`, not here

use core::fmt;

use crate::memory::{PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};

/// Physical memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Pa(pub u64);

/// Virtual memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Va(pub u64);

/// Page frame number: a physical address shifted right by [`PAGE_SHIFT`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Pfn(pub u64);

impl Pa {
    /// Create a new physical address.
    #[inline]
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if this address is page-aligned.
    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Align this address down to a page boundary.
    #[inline]
    #[must_use]
    pub const fn page_align_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Align this address up to a page boundary.
    #[inline]
    #[must_use]
    pub const fn page_align_up(self) -> Self {
        Self(align_up(self.0, PAGE_SIZE))
    }

    /// Add an offset to this address.
    #[inline]
    #[must_use]
    pub const fn offset(self, offset: u64) -> Self {
        Self(self.0.wrapping_add(offset))
    }

    /// Frame containing this address (`PFN_DOWN`).
    #[inline]
    #[must_use]
    pub const fn pfn_down(self) -> Pfn {
        Pfn(self.0 >> PAGE_SHIFT)
    }

    /// First frame starting at or above this address (`PFN_UP`).
    #[inline]
    #[must_use]
    pub const fn pfn_up(self) -> Pfn {
        Pfn(self.0.div_ceil(PAGE_SIZE))
    }
}

impl Va {
    /// Create a new virtual address.
    #[inline]
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Get the raw address value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Add an offset to this address.
    #[inline]
    #[must_use]
    pub const fn offset(self, offset: u64) -> Self {
        Self(self.0.wrapping_add(offset))
    }
}

impl Pfn {
    /// Create a new frame number.
    #[inline]
    #[must_use]
    pub const fn new(pfn: u64) -> Self {
        Self(pfn)
    }

    /// Get the raw frame number.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Physical address of the first byte of this frame (`PFN_PHYS`).
    #[inline]
    #[must_use]
    pub const fn phys(self) -> Pa {
        Pa(self.0 << PAGE_SHIFT)
    }

    /// Advance by `n` frames.
    #[inline]
    #[must_use]
    pub const fn add(self, n: u64) -> Self {
        Self(self.0 + n)
    }
}

// -- Alignment helpers

/// Round `value` down to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// Round `value` up to a multiple of `align` (a power of two), wrapping to 0
/// when the result does not fit.
#[inline]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    value.wrapping_add(align - 1) & !(align - 1)
}

/// Check whether `value` is a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn is_aligned(value: u64, align: u64) -> bool {
    value & (align - 1) == 0
}

/// Index of the most significant set bit plus one (`fls64`); 0 for 0.
#[inline]
#[must_use]
pub const fn fls64(value: u64) -> u32 {
    64 - value.leading_zeros()
}

/// All-ones mask covering `bits` low bits (`DMA_BIT_MASK`).
#[inline]
#[must_use]
pub const fn bit_mask(bits: u32) -> u64 {
    if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 }
}

// -- Formatting implementations

impl fmt::Debug for Pa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pa({:#018x})", self.0)
    }
}

impl fmt::Display for Pa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA:{:#018x}", self.0)
    }
}

impl fmt::LowerHex for Pa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::Debug for Va {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Va({:#018x})", self.0)
    }
}

impl fmt::Display for Va {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA:{:#018x}", self.0)
    }
}

impl fmt::LowerHex for Va {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::Debug for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pfn({:#x})", self.0)
    }
}

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pfn:{:#x}", self.0)
    }
}

impl fmt::LowerHex for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

// -- Conversion implementations

impl From<u64> for Pa {
    #[inline]
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}

impl From<Pa> for u64 {
    #[inline]
    fn from(addr: Pa) -> Self {
        addr.0
    }
}

impl From<u64> for Va {
    #[inline]
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}

impl From<Va> for u64 {
    #[inline]
    fn from(addr: Va) -> Self {
        addr.0
    }
}

impl From<Pfn> for Pa {
    #[inline]
    fn from(pfn: Pfn) -> Self {
        pfn.phys()
    }
}
