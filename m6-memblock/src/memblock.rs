//! Boot-Time Physical Region Table
//!
//! [`Memblock`] is the authoritative view of physical RAM before the page
//! allocator exists. It keeps two canonical tables:
//!
//! - `memory`: every range of RAM the kernel may use, tagged with flags and
//!   an optional node id
//! - `reserved`: ranges already claimed (kernel image, DT blob, tables)
//!
//! # Allocation Policy
//!
//! Allocations walk the free ranges (`memory` minus `reserved`, skipping
//! `NOMAP`) from the highest address downwards by default. The bottom-up
//! policy walks from low addresses instead. Nothing below [`PAGE_SIZE`] is
//! ever handed out.
//!
//! # Concurrency
//!
//! The table is owned by the boot CPU; it is not shared between threads
//! and carries no lock.

use alloc::vec::Vec;

use m6_common::memory::{PAGE_SIZE, SMP_CACHE_BYTES};
use m6_common::{NodeId, Pfn};
use m6_common::addr::{align_down, align_up};

use crate::error::MemblockError;
use crate::region::{PhysRange, RegionFlags};
use crate::table::{cap_size, RegionTable};

/// Which table an operation or iterator refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeKind {
    Memory,
    Reserved,
    /// `memory` minus `reserved`, excluding `NOMAP`
    Free,
}

/// Upper bound meaning "anywhere the current limit allows"
pub const ALLOC_ACCESSIBLE: u64 = 0;
/// Upper bound meaning "anywhere at all"
pub const ALLOC_ANYWHERE: u64 = u64::MAX;

/// The boot-time physical region table.
#[derive(Clone)]
pub struct Memblock {
    memory: RegionTable,
    reserved: RegionTable,
    bottom_up: bool,
    current_limit: u64,
}

impl core::fmt::Debug for Memblock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Memblock")
            .field("memory", &self.memory())
            .field("reserved", &self.reserved())
            .field("bottom_up", &self.bottom_up)
            .field("current_limit", &self.current_limit)
            .finish()
    }
}

impl Default for Memblock {
    fn default() -> Self {
        Self::new()
    }
}

impl Memblock {
    /// Create an empty table with the top-down policy.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            memory: RegionTable::new(),
            reserved: RegionTable::new(),
            bottom_up: false,
            current_limit: ALLOC_ANYWHERE,
        }
    }

    // -- Table mutation

    /// Register RAM with no flags and no node.
    ///
    /// # Errors
    ///
    /// Returns [`MemblockError::Overflow`] if `base + size` wraps.
    pub fn add(&mut self, base: u64, size: u64) -> Result<(), MemblockError> {
        self.add_node(base, size, RegionFlags::NONE, None)
    }

    /// Register RAM with explicit flags and node.
    ///
    /// # Errors
    ///
    /// Returns [`MemblockError::Overflow`] if `base + size` wraps.
    pub fn add_node(
        &mut self,
        base: u64,
        size: u64,
        flags: RegionFlags,
        nid: Option<NodeId>,
    ) -> Result<(), MemblockError> {
        check_range(base, size)?;
        log::trace!("memblock_add: [{:#x}-{:#x}]", base, base.wrapping_add(size).wrapping_sub(1));
        self.memory.add(base, size, flags, nid);
        Ok(())
    }

    /// Remove a range from both `memory` and `reserved`. Sizes reaching past
    /// the top of the address space are capped.
    pub fn remove(&mut self, base: u64, size: u64) {
        self.memory.remove(base, size);
        self.reserved.remove(base, size);
    }

    /// Claim a range. Reserving an already reserved range is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`MemblockError::Overflow`] if `base + size` wraps.
    pub fn reserve(&mut self, base: u64, size: u64) -> Result<(), MemblockError> {
        check_range(base, size)?;
        log::trace!("memblock_reserve: [{:#x}-{:#x}]", base, base.wrapping_add(size).wrapping_sub(1));
        self.reserved.add(base, size, RegionFlags::NONE, None);
        Ok(())
    }

    /// Drop a range from `reserved` only, returning it to the free pool.
    pub fn free(&mut self, base: u64, size: u64) {
        log::trace!("memblock_free: [{:#x}-{:#x}]", base, base.wrapping_add(size).wrapping_sub(1));
        self.reserved.remove(base, size);
    }

    /// Set `flag` on the part of `memory` intersecting the range.
    pub fn set_flag(&mut self, base: u64, size: u64, flag: RegionFlags) {
        self.memory.set_flags(base, size, flag, true);
    }

    /// Clear `flag` on the part of `memory` intersecting the range.
    pub fn clear_flag(&mut self, base: u64, size: u64, flag: RegionFlags) {
        self.memory.set_flags(base, size, flag, false);
    }

    pub fn mark_nomap(&mut self, base: u64, size: u64) {
        self.set_flag(base, size, RegionFlags::NOMAP);
    }

    pub fn clear_nomap(&mut self, base: u64, size: u64) {
        self.clear_flag(base, size, RegionFlags::NOMAP);
    }

    pub fn mark_hotplug(&mut self, base: u64, size: u64) {
        self.set_flag(base, size, RegionFlags::HOTPLUG);
    }

    /// Tag the intersecting part of one table with a node.
    pub fn set_node(&mut self, base: u64, size: u64, nid: Option<NodeId>, kind: RangeKind) {
        match kind {
            RangeKind::Memory => self.memory.set_node(base, size, nid),
            RangeKind::Reserved => self.reserved.set_node(base, size, nid),
            RangeKind::Free => {}
        }
    }

    /// Switch between top-down (default) and bottom-up allocation.
    pub fn set_bottom_up(&mut self, enable: bool) {
        self.bottom_up = enable;
    }

    #[must_use]
    pub const fn bottom_up(&self) -> bool {
        self.bottom_up
    }

    /// Cap the highest address [`ALLOC_ACCESSIBLE`] allocations may use.
    pub fn set_current_limit(&mut self, limit: u64) {
        self.current_limit = limit;
    }

    #[must_use]
    pub const fn current_limit(&self) -> u64 {
        self.current_limit
    }

    /// Keep only `[base, base + size)` of mapped memory. `NOMAP` ranges
    /// outside the window survive; reserved ranges outside it are dropped.
    pub fn cap_memory_range(&mut self, base: u64, size: u64) {
        let size = cap_size(base, size);
        if size == 0 {
            return;
        }
        let end = base + size;
        self.memory.isolate(base, size);
        self.memory
            .remove_where(|r| !r.is_nomap() && (r.end() <= base || r.base >= end));
        self.reserved.remove(0, base);
        self.reserved.remove(end, u64::MAX);
    }

    /// Limit usable RAM to `limit` bytes, counted from the bottom over
    /// mapped memory.
    pub fn mem_limit_remove_map(&mut self, limit: u64) {
        if limit == 0 {
            return;
        }
        let max_addr = self.find_max_addr(limit);
        if max_addr == u64::MAX {
            return;
        }
        self.cap_memory_range(0, max_addr);
    }

    fn find_max_addr(&self, mut limit: u64) -> u64 {
        for r in self.memory.as_slice().iter().filter(|r| !r.is_nomap()) {
            if limit <= r.size {
                return r.base + limit;
            }
            limit -= r.size;
        }
        u64::MAX
    }

    // -- Allocation

    /// Find a free, mapped, `align`-aligned range of `size` bytes inside
    /// `[start, end)` without reserving it.
    #[must_use]
    pub fn find_in_range(&self, start: u64, end: u64, size: u64, align: u64) -> Option<u64> {
        self.find_in_range_node(size, align, start, end, None)
    }

    /// Like [`find_in_range`](Self::find_in_range), restricted to memory on
    /// `nid` when given.
    #[must_use]
    pub fn find_in_range_node(
        &self,
        size: u64,
        align: u64,
        start: u64,
        end: u64,
        nid: Option<NodeId>,
    ) -> Option<u64> {
        if size == 0 {
            return None;
        }
        let align = align.max(1);
        let end = match end {
            ALLOC_ACCESSIBLE => self.current_limit,
            end => end,
        };
        let start = start.max(PAGE_SIZE);
        let end = end.max(start);
        let free = self.free_ranges(nid);

        if self.bottom_up {
            free.iter().find_map(|fr| {
                let lo = fr.base.clamp(start, end);
                let hi = fr.end().clamp(start, end);
                let cand = align_up(lo, align);
                (cand >= lo && cand < hi && hi - cand >= size).then_some(cand)
            })
        } else {
            free.iter().rev().find_map(|fr| {
                let lo = fr.base.clamp(start, end);
                let hi = fr.end().clamp(start, end);
                if hi < size {
                    return None;
                }
                let cand = align_down(hi - size, align);
                (cand >= lo).then_some(cand)
            })
        }
    }

    /// Allocate and reserve `size` bytes aligned to `align` inside
    /// `[start, end)`, preferring `nid`.
    ///
    /// # Arguments
    ///
    /// * `exact` - when set, never fall back to memory on other nodes
    ///
    /// # Errors
    ///
    /// Returns [`MemblockError::OutOfSpace`] when no range fits.
    pub fn alloc_range_nid(
        &mut self,
        size: u64,
        align: u64,
        start: u64,
        end: u64,
        nid: Option<NodeId>,
        exact: bool,
    ) -> Result<u64, MemblockError> {
        let align = if align == 0 {
            log::warn!("memblock: zero alignment requested, using {}", SMP_CACHE_BYTES);
            SMP_CACHE_BYTES
        } else {
            align
        };

        let found = self
            .find_in_range_node(size, align, start, end, nid)
            .or_else(|| match nid {
                Some(_) if !exact => self.find_in_range_node(size, align, start, end, None),
                _ => None,
            });

        match found {
            Some(base) => {
                self.reserve(base, size)?;
                Ok(base)
            }
            None => Err(MemblockError::OutOfSpace {
                size,
                align,
                start,
                end,
            }),
        }
    }

    /// Allocate and reserve a range inside `[min_pa, max_pa)`, preferring
    /// `nid_hint` but accepting any node.
    ///
    /// # Errors
    ///
    /// Returns [`MemblockError::OutOfSpace`] when no range fits.
    pub fn alloc_range(
        &mut self,
        size: u64,
        align: u64,
        min_pa: u64,
        max_pa: u64,
        nid_hint: Option<NodeId>,
    ) -> Result<u64, MemblockError> {
        self.alloc_range_nid(size, align, min_pa, max_pa, nid_hint, false)
    }

    /// Allocate for a boot-time table: like [`alloc_range`](Self::alloc_range)
    /// but retried without the lower bound if that fails.
    ///
    /// # Errors
    ///
    /// Returns [`MemblockError::OutOfSpace`] when no range fits.
    pub fn alloc_try_nid(
        &mut self,
        size: u64,
        align: u64,
        min_pa: u64,
        max_pa: u64,
        nid: Option<NodeId>,
    ) -> Result<u64, MemblockError> {
        let max_pa = match max_pa {
            ALLOC_ACCESSIBLE => self.current_limit,
            max => max.min(self.current_limit),
        };
        self.alloc_range(size, align, min_pa, max_pa, nid)
            .or_else(|err| {
                if min_pa == 0 {
                    return Err(err);
                }
                self.alloc_range(size, align, 0, max_pa, nid)
            })
    }

    // -- Queries

    /// Check whether `pa` is RAM.
    #[must_use]
    pub fn is_memory(&self, pa: u64) -> bool {
        self.memory.search(pa).is_some()
    }

    /// Check whether `pa` is RAM that belongs in the linear map.
    #[must_use]
    pub fn is_map_memory(&self, pa: u64) -> bool {
        self.memory
            .search(pa)
            .is_some_and(|i| !self.memory.as_slice()[i].is_nomap())
    }

    /// Check whether `pa` is claimed.
    #[must_use]
    pub fn is_reserved(&self, pa: u64) -> bool {
        self.reserved.search(pa).is_some()
    }

    /// Check whether the whole range lies in one `memory` entry.
    #[must_use]
    pub fn is_region_memory(&self, base: u64, size: u64) -> bool {
        let end = base + cap_size(base, size);
        self.memory
            .search(base)
            .is_some_and(|i| end <= self.memory.as_slice()[i].end())
    }

    /// Check whether any part of the range is claimed.
    #[must_use]
    pub fn is_region_reserved(&self, base: u64, size: u64) -> bool {
        self.reserved.overlaps(base, size)
    }

    /// Base of the lowest `memory` entry, 0 when empty.
    #[must_use]
    pub fn start_of_dram(&self) -> u64 {
        self.memory.as_slice().first().map_or(0, |r| r.base)
    }

    /// End of the highest `memory` entry, 0 when empty.
    #[must_use]
    pub fn end_of_dram(&self) -> u64 {
        self.memory.as_slice().last().map_or(0, PhysRange::end)
    }

    /// Total bytes of RAM, including `NOMAP` ranges.
    #[must_use]
    pub fn phys_mem_size(&self) -> u64 {
        self.memory.total_size()
    }

    /// Total bytes claimed.
    #[must_use]
    pub fn reserved_size(&self) -> u64 {
        self.reserved.total_size()
    }

    #[must_use]
    pub fn memory(&self) -> &[PhysRange] {
        self.memory.as_slice()
    }

    #[must_use]
    pub fn reserved(&self) -> &[PhysRange] {
        self.reserved.as_slice()
    }

    /// Iterate one view of the table in increasing address order.
    pub fn for_each_range(&self, kind: RangeKind) -> impl Iterator<Item = PhysRange> + '_ {
        let ranges = match kind {
            RangeKind::Memory => self.memory.as_slice().to_vec(),
            RangeKind::Reserved => self.reserved.as_slice().to_vec(),
            RangeKind::Free => self.free_ranges(None),
        };
        ranges.into_iter()
    }

    /// Free, mapped ranges, optionally restricted to one node. Each result
    /// carries the flags and node of the `memory` entry it came from.
    #[must_use]
    pub fn free_ranges(&self, nid: Option<NodeId>) -> Vec<PhysRange> {
        let reserved = self.reserved.as_slice();
        let mut out = Vec::new();

        for m in self.memory.as_slice() {
            if m.is_nomap() || (nid.is_some() && m.nid != nid) {
                continue;
            }
            let mut cursor = m.base;
            let first = reserved.partition_point(|r| r.end() <= m.base);
            for r in reserved[first..].iter().take_while(|r| r.base < m.end()) {
                if r.base > cursor {
                    out.push(PhysRange { base: cursor, size: r.base - cursor, ..*m });
                }
                cursor = cursor.max(r.end());
            }
            if cursor < m.end() {
                out.push(PhysRange { base: cursor, size: m.end() - cursor, ..*m });
            }
        }
        out
    }

    /// Page frame ranges of `memory`, optionally restricted to one node.
    /// Partial pages at either end are excluded.
    pub fn mem_pfn_ranges(
        &self,
        nid: Option<NodeId>,
    ) -> impl Iterator<Item = (Pfn, Pfn, Option<NodeId>)> + '_ {
        self.memory
            .as_slice()
            .iter()
            .filter(move |r| nid.is_none() || r.nid == nid)
            .filter_map(|r| {
                let start = m6_common::Pa(r.base).pfn_up();
                let end = m6_common::Pa(r.end()).pfn_down();
                (start < end).then_some((start, end, r.nid))
            })
    }

    /// Lowest and highest-plus-one frame of memory on `nid`.
    #[must_use]
    pub fn get_pfn_range_for_nid(&self, nid: NodeId) -> Option<(Pfn, Pfn)> {
        self.mem_pfn_ranges(Some(nid))
            .fold(None, |acc, (start, end, _)| match acc {
                None => Some((start, end)),
                Some((lo, hi)) => Some((core::cmp::min(lo, start), core::cmp::max(hi, end))),
            })
    }

    /// Log both tables at debug level.
    pub fn dump(&self) {
        log::debug!(
            "memblock: memory size = {:#x} reserved size = {:#x}",
            self.phys_mem_size(),
            self.reserved_size()
        );
        for (name, table) in [("memory", &self.memory), ("reserved", &self.reserved)] {
            log::debug!(" {}.cnt = {:#x}", name, table.as_slice().len());
            for (i, r) in table.as_slice().iter().enumerate() {
                log::debug!(" {}[{:#x}]\t{:?}", name, i, r);
            }
        }
    }
}

fn check_range(base: u64, size: u64) -> Result<(), MemblockError> {
    match base.checked_add(size) {
        Some(_) => Ok(()),
        None => Err(MemblockError::Overflow { base, size }),
    }
}
