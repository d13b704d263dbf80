//! Physical Range and Region Flags
//!
//! A [`PhysRange`] is one entry of either the `memory` or the `reserved`
//! table. Flags follow the same newtype-with-constants pattern used for
//! other small bitsets in M6.

use core::fmt;
use core::ops::BitOr;

use m6_common::NodeId;

/// Flags carried by a physical range.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct RegionFlags(u8);

impl RegionFlags {
    /// No special handling
    pub const NONE: Self = Self(0);
    /// Hot-pluggable memory
    pub const HOTPLUG: Self = Self(1 << 0);
    /// Mirrored memory
    pub const MIRROR: Self = Self(1 << 1);
    /// Not included in the linear map
    pub const NOMAP: Self = Self(1 << 2);
    /// Struct pages are not initialised for this range
    pub const NOINIT: Self = Self(1 << 3);

    const ALL: u8 = 0x0F;

    /// Create flags from raw bits, dropping unknown bits.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL)
    }

    /// Raw bit representation.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Check whether every flag in `other` is set.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check whether no flag is set.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Flags set in either operand.
    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Flags set in `self` but not in `other`.
    #[inline]
    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for RegionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for RegionFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "NONE");
        }
        let names = [
            (Self::HOTPLUG, "HOTPLUG"),
            (Self::MIRROR, "MIRROR"),
            (Self::NOMAP, "NOMAP"),
            (Self::NOINIT, "NOINIT"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// One `[base, base + size)` range of a region table.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PhysRange {
    /// First byte of the range
    pub base: u64,
    /// Length in bytes
    pub size: u64,
    /// Region flags
    pub flags: RegionFlags,
    /// Owning node, `None` for "any node"
    pub nid: Option<NodeId>,
}

impl PhysRange {
    #[must_use]
    pub const fn new(base: u64, size: u64, flags: RegionFlags, nid: Option<NodeId>) -> Self {
        Self {
            base,
            size,
            flags,
            nid,
        }
    }

    /// One past the last byte of the range.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base + self.size
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Check whether `[base, end)` intersects this range.
    #[inline]
    #[must_use]
    pub const fn overlaps(&self, base: u64, end: u64) -> bool {
        base < self.end() && end > self.base
    }

    #[inline]
    #[must_use]
    pub const fn is_nomap(&self) -> bool {
        self.flags.contains(RegionFlags::NOMAP)
    }

    /// Check whether two ranges may be coalesced into one.
    #[inline]
    #[must_use]
    pub fn mergeable_with(&self, next: &Self) -> bool {
        self.end() == next.base && self.flags == next.flags && self.nid == next.nid
    }
}

impl fmt::Debug for PhysRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:#018x}-{:#018x}] {:?}",
            self.base,
            self.end().wrapping_sub(1),
            self.flags
        )?;
        match self.nid {
            Some(nid) => write!(f, " node {}", nid),
            None => write!(f, " node -"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_ops() {
        let flags = RegionFlags::NOMAP | RegionFlags::HOTPLUG;
        assert!(flags.contains(RegionFlags::NOMAP));
        assert!(!flags.contains(RegionFlags::MIRROR));
        assert_eq!(flags.difference(RegionFlags::NOMAP), RegionFlags::HOTPLUG);
        assert_eq!(RegionFlags::from_bits(0xFF).bits(), 0x0F);
    }

    #[test]
    fn test_range_geometry() {
        let r = PhysRange::new(0x1000, 0x2000, RegionFlags::NONE, None);
        assert_eq!(r.end(), 0x3000);
        assert!(r.contains(0x2fff));
        assert!(!r.contains(0x3000));
        assert!(r.overlaps(0x2000, 0x4000));
        assert!(!r.overlaps(0x3000, 0x4000));
    }

    #[test]
    fn test_mergeable() {
        let a = PhysRange::new(0x1000, 0x1000, RegionFlags::NONE, None);
        let b = PhysRange::new(0x2000, 0x1000, RegionFlags::NONE, None);
        let c = PhysRange::new(0x2000, 0x1000, RegionFlags::NOMAP, None);
        assert!(a.mergeable_with(&b));
        assert!(!a.mergeable_with(&c));
    }
}
