//! Sorted Region Table
//!
//! One flat, sorted, non-overlapping array of [`PhysRange`]s. Every
//! mutation leaves the table canonical: sorted by base, no overlaps, and
//! adjacent entries with equal flags and node merged.
//!
//! # Design
//!
//! Partial updates go through [`RegionTable::isolate`], which splits the
//! entries straddling the boundaries of the target range so the range is
//! covered by whole entries that can then be dropped or retagged.

use alloc::vec::Vec;
use core::ops::Range;

use m6_common::NodeId;

use crate::region::{PhysRange, RegionFlags};

/// Clamp `size` so that `base + size` does not wrap.
#[inline]
pub(crate) const fn cap_size(base: u64, size: u64) -> u64 {
    if size > u64::MAX - base { u64::MAX - base } else { size }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub(crate) struct RegionTable {
    regions: Vec<PhysRange>,
}

impl RegionTable {
    pub(crate) const fn new() -> Self {
        Self {
            regions: Vec::new(),
        }
    }

    #[inline]
    pub(crate) fn as_slice(&self) -> &[PhysRange] {
        &self.regions
    }

    #[inline]
    pub(crate) fn total_size(&self) -> u64 {
        self.regions.iter().map(|r| r.size).sum()
    }

    /// Insert `[base, base + size)`, filling only the parts not already
    /// covered. Existing entries keep their flags and node.
    pub(crate) fn add(&mut self, base: u64, size: u64, flags: RegionFlags, nid: Option<NodeId>) {
        if size == 0 {
            return;
        }
        let end = base + size;
        let mut cursor = base;
        let mut fresh = Vec::new();

        for r in &self.regions {
            if r.base >= end {
                break;
            }
            if r.end() <= cursor {
                continue;
            }
            if r.base > cursor {
                fresh.push(PhysRange::new(cursor, r.base - cursor, flags, nid));
            }
            cursor = cursor.max(r.end());
        }
        if cursor < end {
            fresh.push(PhysRange::new(cursor, end - cursor, flags, nid));
        }
        if fresh.is_empty() {
            return;
        }

        self.regions.extend(fresh);
        self.regions.sort_unstable_by_key(|r| r.base);
        self.merge();
    }

    /// Split entries so `[base, base + size)` is covered by whole entries,
    /// returning the index range of those entries.
    pub(crate) fn isolate(&mut self, base: u64, size: u64) -> Range<usize> {
        let size = cap_size(base, size);
        if size == 0 {
            return 0..0;
        }
        let end = base + size;
        let mut first = None;
        let mut last = 0;
        let mut i = 0;

        while i < self.regions.len() {
            let r = self.regions[i];
            let (rbase, rend) = (r.base, r.end());

            if rbase >= end {
                break;
            }
            if rend <= base {
                i += 1;
                continue;
            }

            if rbase < base {
                // Keep the part below `base` as its own entry and revisit
                // the remainder.
                self.regions[i].base = base;
                self.regions[i].size = rend - base;
                self.regions.insert(i, PhysRange { size: base - rbase, ..r });
                i += 1;
            } else if rend > end {
                // Split off the part above `end`; the lower half is
                // revisited as an inner entry.
                self.regions[i].base = end;
                self.regions[i].size = rend - end;
                self.regions.insert(i, PhysRange { size: end - rbase, ..r });
            } else {
                first.get_or_insert(i);
                last = i + 1;
                i += 1;
            }
        }

        match first {
            Some(first) => first..last,
            None => 0..0,
        }
    }

    pub(crate) fn remove(&mut self, base: u64, size: u64) {
        let range = self.isolate(base, size);
        self.regions.drain(range);
    }

    /// Drop isolated entries matching `pred`.
    pub(crate) fn remove_where(&mut self, pred: impl Fn(&PhysRange) -> bool) {
        self.regions.retain(|r| !pred(r));
    }

    pub(crate) fn set_flags(&mut self, base: u64, size: u64, flags: RegionFlags, set: bool) {
        let range = self.isolate(base, size);
        for r in &mut self.regions[range] {
            r.flags = if set {
                r.flags.union(flags)
            } else {
                r.flags.difference(flags)
            };
        }
        self.merge();
    }

    pub(crate) fn set_node(&mut self, base: u64, size: u64, nid: Option<NodeId>) {
        let range = self.isolate(base, size);
        for r in &mut self.regions[range] {
            r.nid = nid;
        }
        self.merge();
    }

    /// Index of the entry containing `addr`.
    pub(crate) fn search(&self, addr: u64) -> Option<usize> {
        let idx = self.regions.partition_point(|r| r.end() <= addr);
        self.regions
            .get(idx)
            .filter(|r| r.contains(addr))
            .map(|_| idx)
    }

    pub(crate) fn overlaps(&self, base: u64, size: u64) -> bool {
        let end = base + cap_size(base, size);
        self.regions.iter().any(|r| r.overlaps(base, end))
    }

    fn merge(&mut self) {
        self.regions.dedup_by(|next, prev| {
            if prev.mergeable_with(next) {
                prev.size += next.size;
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bases(t: &RegionTable) -> Vec<(u64, u64)> {
        t.as_slice().iter().map(|r| (r.base, r.size)).collect()
    }

    #[test]
    fn test_add_merges_adjacent() {
        let mut t = RegionTable::new();
        t.add(0x1000, 0x1000, RegionFlags::NONE, None);
        t.add(0x3000, 0x1000, RegionFlags::NONE, None);
        t.add(0x2000, 0x1000, RegionFlags::NONE, None);
        assert_eq!(bases(&t), [(0x1000, 0x3000)]);
    }

    #[test]
    fn test_add_overlapping_fills_gaps() {
        let mut t = RegionTable::new();
        t.add(0x2000, 0x1000, RegionFlags::NOMAP, None);
        t.add(0x1000, 0x4000, RegionFlags::NONE, None);
        assert_eq!(bases(&t), [(0x1000, 0x1000), (0x2000, 0x1000), (0x3000, 0x2000)]);
        assert!(t.as_slice()[1].is_nomap());
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut t = RegionTable::new();
        t.add(0x1000, 0x1000, RegionFlags::NONE, None);
        let before = t.clone();
        t.add(0x1000, 0x1000, RegionFlags::NONE, None);
        assert!(t == before);
    }

    #[test]
    fn test_isolate_splits_both_ends() {
        let mut t = RegionTable::new();
        t.add(0x0, 0x10000, RegionFlags::NONE, None);
        let range = t.isolate(0x4000, 0x2000);
        assert_eq!(range, 1..2);
        assert_eq!(bases(&t), [(0x0, 0x4000), (0x4000, 0x2000), (0x6000, 0xa000)]);
    }

    #[test]
    fn test_remove_middle() {
        let mut t = RegionTable::new();
        t.add(0x0, 0x10000, RegionFlags::NONE, None);
        t.remove(0x4000, 0x2000);
        assert_eq!(bases(&t), [(0x0, 0x4000), (0x6000, 0xa000)]);
        t.remove(0x0, u64::MAX);
        assert!(t.as_slice().is_empty());
    }

    #[test]
    fn test_set_flags_and_clear_remerge() {
        let mut t = RegionTable::new();
        t.add(0x0, 0x10000, RegionFlags::NONE, None);
        t.set_flags(0x4000, 0x1000, RegionFlags::NOMAP, true);
        assert_eq!(t.as_slice().len(), 3);
        t.set_flags(0x4000, 0x1000, RegionFlags::NOMAP, false);
        assert_eq!(bases(&t), [(0x0, 0x10000)]);
    }

    #[test]
    fn test_set_node_splits() {
        let mut t = RegionTable::new();
        t.add(0x0, 0x4000, RegionFlags::NONE, None);
        let n1 = NodeId::new(1);
        t.set_node(0x2000, 0x2000, n1);
        assert_eq!(t.as_slice()[1].nid, n1);
        assert_eq!(t.as_slice()[0].nid, None);
    }

    #[test]
    fn test_search() {
        let mut t = RegionTable::new();
        t.add(0x1000, 0x1000, RegionFlags::NONE, None);
        t.add(0x4000, 0x1000, RegionFlags::NONE, None);
        assert_eq!(t.search(0x1800), Some(0));
        assert_eq!(t.search(0x4000), Some(1));
        assert_eq!(t.search(0x3000), None);
        assert_eq!(t.search(0x5000), None);
    }
}
