//! CMA Area
//!
//! A physically contiguous pool reserved at boot and lent to movable
//! allocations until a driver asks for a contiguous run.
//!
//! # Locking
//!
//! The bitmap lives behind a per-area spin lock held only for the search
//! and set step (and the clear on release). Migration of the chosen range
//! runs with the lock dropped, so concurrent allocators may race for the
//! same pages; the loser sees `Busy`, clears its bits, and moves on past
//! the contested range. The search hint rotates after each success so
//! contending allocators start at different bits.

use alloc::string::String;
use core::sync::atomic::{AtomicU64, Ordering};

use m6_common::memory::PAGE_SHIFT;
use m6_common::{NodeId, Pfn};
use spin::Mutex;

use crate::bitmap::CmaBitmap;
use crate::error::CmaError;
use crate::migrate::{ContigRange, GfpFlags, MigrateError};
use crate::ratelimit::Ratelimit;

/// Busy retries before an allocation gives up.
pub const MAX_BUSY_RETRIES: u32 = 5;

/// Identifies an area in the [`CmaRegistry`](crate::CmaRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CmaId(pub u16);

/// Allocation counters for one area.
#[derive(Debug, Default)]
pub struct CmaStats {
    pub alloc_success: AtomicU64,
    pub alloc_fail: AtomicU64,
    pub pages_released: AtomicU64,
}

/// A contiguous memory area.
pub struct CmaArea {
    name: String,
    base_pfn: Pfn,
    /// Size in units of `1 << order_per_bit` pages
    count: u64,
    order_per_bit: u32,
    nid: Option<NodeId>,
    bitmap: Mutex<CmaBitmap>,
    /// Bumped on every release; waiters poll it to notice freed pages
    release_seq: AtomicU64,
    stats: CmaStats,
    warn_limit: Ratelimit,
}

impl CmaArea {
    pub(crate) fn new(
        name: String,
        base_pfn: Pfn,
        pages: u64,
        order_per_bit: u32,
        nid: Option<NodeId>,
    ) -> Self {
        Self {
            name,
            base_pfn,
            count: pages >> order_per_bit,
            order_per_bit,
            nid,
            bitmap: Mutex::new(CmaBitmap::default()),
            release_seq: AtomicU64::new(0),
            stats: CmaStats::default(),
            warn_limit: Ratelimit::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// First frame of the area.
    #[must_use]
    pub fn base_pfn(&self) -> Pfn {
        self.base_pfn
    }

    /// Physical base address (`cma_get_base`).
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base_pfn.phys().as_u64()
    }

    /// Size in bytes (`cma_get_size`).
    #[must_use]
    pub fn size(&self) -> u64 {
        self.pages() << PAGE_SHIFT
    }

    /// Size in pages.
    #[must_use]
    pub fn pages(&self) -> u64 {
        self.count << self.order_per_bit
    }

    /// Size in bitmap units.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    #[must_use]
    pub fn order_per_bit(&self) -> u32 {
        self.order_per_bit
    }

    #[must_use]
    pub fn nid(&self) -> Option<NodeId> {
        self.nid
    }

    #[must_use]
    pub fn stats(&self) -> &CmaStats {
        &self.stats
    }

    /// Number of releases so far.
    #[must_use]
    pub fn release_seq(&self) -> u64 {
        self.release_seq.load(Ordering::Acquire)
    }

    /// Whether the area has a bitmap and can serve allocations.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.count != 0 && !self.bitmap.lock().is_empty()
    }

    /// Pages currently handed out.
    #[must_use]
    pub fn used_pages(&self) -> u64 {
        (self.bitmap.lock().weight() as u64) << self.order_per_bit
    }

    /// Check whether `pfn` falls inside the area.
    #[must_use]
    pub fn contains(&self, pfn: Pfn) -> bool {
        pfn >= self.base_pfn && pfn.0 < self.base_pfn.0 + self.pages()
    }

    pub(crate) fn activate(&mut self) {
        *self.bitmap.get_mut() = CmaBitmap::new(self.count as usize);
    }

    pub(crate) fn disable(&mut self) {
        self.count = 0;
        *self.bitmap.get_mut() = CmaBitmap::default();
    }

    fn bitmap_aligned_mask(&self, align_order: u32) -> usize {
        if align_order <= self.order_per_bit {
            0
        } else {
            (1usize << (align_order - self.order_per_bit)) - 1
        }
    }

    fn bitmap_aligned_offset(&self, align_order: u32) -> usize {
        let mask = (1u64 << align_order) - 1;
        ((self.base_pfn.0 & mask) >> self.order_per_bit) as usize
    }

    fn pages_to_bits(&self, pages: u64) -> usize {
        let unit = 1u64 << self.order_per_bit;
        (pages.div_ceil(unit)) as usize
    }

    /// Allocate `count` pages aligned to `1 << align_order` pages from a
    /// sleepable context.
    ///
    /// # Errors
    ///
    /// See [`alloc_gfp`](Self::alloc_gfp).
    pub fn alloc(
        &self,
        count: u64,
        align_order: u32,
        no_warn: bool,
        ops: &dyn ContigRange,
    ) -> Result<Pfn, CmaError> {
        let gfp = if no_warn {
            GfpFlags::KERNEL | GfpFlags::NOWARN
        } else {
            GfpFlags::KERNEL
        };
        self.alloc_gfp(count, align_order, gfp, ops)
    }

    /// Allocate `count` pages aligned to `1 << align_order` pages.
    ///
    /// The bitmap is searched from the rotating hint, wrapping once to the
    /// start of the area. Chosen bits are set under the lock, then the
    /// range is migrated with the lock dropped. A busy range is released
    /// and the search resumes past it; after a full pass with only busy
    /// failures the caller backs off and retries, at most
    /// [`MAX_BUSY_RETRIES`] times.
    ///
    /// # Errors
    ///
    /// - [`CmaError::WouldBlock`] if `gfp` does not allow sleeping
    /// - [`CmaError::Inactive`] if the area has no bitmap
    /// - [`CmaError::NoSpace`] if no free run exists
    /// - [`CmaError::MigrationFailed`] if migration never succeeded
    pub fn alloc_gfp(
        &self,
        count: u64,
        align_order: u32,
        gfp: GfpFlags,
        ops: &dyn ContigRange,
    ) -> Result<Pfn, CmaError> {
        if !gfp.allows_blocking() {
            return Err(CmaError::WouldBlock);
        }
        if count == 0 {
            return Err(CmaError::NoSpace);
        }

        log::trace!(
            "cma_alloc(cma {}, name: {}, count {}, align {})",
            self.base_pfn,
            self.name,
            count,
            align_order
        );

        let mask = self.bitmap_aligned_mask(align_order);
        let offset = self.bitmap_aligned_offset(align_order);
        let bitmap_count = self.pages_to_bits(count);

        let result = self.alloc_bits(count, bitmap_count, mask, offset, gfp, ops);

        match result {
            Ok(pfn) => {
                self.stats.alloc_success.fetch_add(1, Ordering::Relaxed);
                log::trace!("cma_alloc(): returned {}", pfn);
            }
            Err(err) => {
                self.stats.alloc_fail.fetch_add(1, Ordering::Relaxed);
                if !gfp.contains(GfpFlags::NOWARN) {
                    if let Some(suppressed) = self.warn_limit.check() {
                        if suppressed != 0 {
                            log::warn!("cma_alloc: {} callbacks suppressed", suppressed);
                        }
                        log::error!(
                            "cma_alloc: {}: alloc failed, req-size: {} pages, ret: {}",
                            self.name,
                            count,
                            err
                        );
                        let bitmap = self.bitmap.lock();
                        log::debug!(
                            "cma: number of available pages: {}/{}",
                            ((bitmap.len() - bitmap.weight()) as u64) << self.order_per_bit,
                            self.pages()
                        );
                    }
                }
            }
        }
        result
    }

    fn alloc_bits(
        &self,
        count: u64,
        bitmap_count: usize,
        mask: usize,
        offset: usize,
        gfp: GfpFlags,
        ops: &dyn ContigRange,
    ) -> Result<Pfn, CmaError> {
        let mut start;
        let mut wrapped;
        {
            let bitmap = self.bitmap.lock();
            if bitmap.is_empty() {
                return Err(CmaError::Inactive);
            }
            if bitmap_count > bitmap.len() {
                return Err(CmaError::NoSpace);
            }
            start = bitmap.hint();
            wrapped = start == 0;
        }

        let mut attempts = 0;
        let mut last_err = None;

        loop {
            let bitmap_no = {
                let mut bitmap = self.bitmap.lock();
                match bitmap.find_zero_area(start, bitmap_count, mask, offset) {
                    Some(no) => {
                        bitmap.set_range(no, bitmap_count);
                        no
                    }
                    None => {
                        drop(bitmap);
                        if !wrapped {
                            wrapped = true;
                            start = 0;
                            continue;
                        }
                        if last_err == Some(MigrateError::Busy) && attempts < MAX_BUSY_RETRIES {
                            // Every candidate was busy; give the holders a
                            // chance to drop their references.
                            ops.backoff();
                            attempts += 1;
                            start = 0;
                            last_err = None;
                            continue;
                        }
                        return Err(match last_err {
                            Some(_) => CmaError::MigrationFailed,
                            None => CmaError::NoSpace,
                        });
                    }
                }
            };

            let pfn = self.base_pfn.add((bitmap_no as u64) << self.order_per_bit);
            match ops.alloc_contig_range(pfn, count, gfp) {
                Ok(()) => {
                    self.bitmap
                        .lock()
                        .advance_hint(bitmap_no + bitmap_count);
                    return Ok(pfn);
                }
                Err(err) => {
                    self.bitmap.lock().clear_range(bitmap_no, bitmap_count);
                    if err != MigrateError::Busy {
                        return Err(CmaError::MigrationFailed);
                    }
                    log::debug!("cma_alloc(): memory range at {} is busy, retrying", pfn);
                    last_err = Some(err);
                    start = bitmap_no + mask + 1;
                }
            }
        }
    }

    /// Return pages obtained from [`alloc`](Self::alloc).
    ///
    /// # Errors
    ///
    /// [`CmaError::NotOwned`] if the range is outside the area or any of
    /// its bits is clear; nothing is changed in that case.
    pub fn release(&self, pfn: Pfn, count: u64, ops: &dyn ContigRange) -> Result<(), CmaError> {
        if count == 0 || !self.contains(pfn) || pfn.0 + count > self.base_pfn.0 + self.pages() {
            return Err(CmaError::NotOwned);
        }
        let bitmap_no = ((pfn.0 - self.base_pfn.0) >> self.order_per_bit) as usize;
        let bitmap_count = self.pages_to_bits(count);

        // Check and clear under one lock: a range goes back to the page
        // allocator at most once.
        {
            let mut bitmap = self.bitmap.lock();
            if !bitmap.all_set(bitmap_no, bitmap_count) {
                return Err(CmaError::NotOwned);
            }
            bitmap.clear_range(bitmap_no, bitmap_count);
        }

        log::trace!("cma_release(page {}, count {})", pfn, count);
        ops.free_contig_range(pfn, count);
        self.release_seq.fetch_add(1, Ordering::Release);
        self.stats.pages_released.fetch_add(count, Ordering::Relaxed);
        Ok(())
    }

    /// Run `f` over the bitmap under the area lock.
    pub fn with_bitmap<R>(&self, f: impl FnOnce(&CmaBitmap) -> R) -> R {
        f(&self.bitmap.lock())
    }
}

impl core::fmt::Debug for CmaArea {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CmaArea")
            .field("name", &self.name)
            .field("base_pfn", &self.base_pfn)
            .field("count", &self.count)
            .field("order_per_bit", &self.order_per_bit)
            .field("nid", &self.nid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use core::cell::{Cell, RefCell};

    /// Page allocator double: pages listed in `pinned` report busy.
    #[derive(Default)]
    struct FakeBuddy {
        pinned: RefCell<Vec<u64>>,
        fail_hard: Cell<bool>,
        freed: Cell<u64>,
        backoffs: Cell<u32>,
    }

    impl ContigRange for FakeBuddy {
        fn alloc_contig_range(&self, start: Pfn, count: u64, _gfp: GfpFlags) -> Result<(), MigrateError> {
            if self.fail_hard.get() {
                return Err(MigrateError::Failed);
            }
            let pinned = self.pinned.borrow();
            if pinned.iter().any(|p| *p >= start.0 && *p < start.0 + count) {
                return Err(MigrateError::Busy);
            }
            Ok(())
        }

        fn free_contig_range(&self, _start: Pfn, count: u64) {
            self.freed.set(self.freed.get() + count);
        }

        fn backoff(&self) {
            self.backoffs.set(self.backoffs.get() + 1);
        }
    }

    fn area(pages: u64, order_per_bit: u32) -> CmaArea {
        let mut area = CmaArea::new("test".into(), Pfn(0x80000), pages, order_per_bit, None);
        area.activate();
        area
    }

    #[test]
    fn test_alloc_first_fit_and_hint() {
        let buddy = FakeBuddy::default();
        let area = area(0x8000, 0);
        let pfn = area.alloc(256, 0, false, &buddy).unwrap();
        assert_eq!(pfn, Pfn(0x80000));
        area.with_bitmap(|bm| {
            assert!(bm.all_set(0, 256));
            assert_eq!(bm.weight(), 256);
        });
        let next = area.alloc(16, 0, false, &buddy).unwrap();
        assert_eq!(next, Pfn(0x80100));
    }

    #[test]
    fn test_alloc_alignment() {
        let buddy = FakeBuddy::default();
        let area = area(0x1000, 0);
        area.alloc(1, 0, false, &buddy).unwrap();
        let pfn = area.alloc(16, 4, false, &buddy).unwrap();
        assert_eq!(pfn.0 % 16, 0);
        assert_eq!(pfn, Pfn(0x80010));
    }

    #[test]
    fn test_popcount_matches_pages_out() {
        let buddy = FakeBuddy::default();
        let area = area(0x1000, 2);
        let a = area.alloc(8, 0, false, &buddy).unwrap();
        let _b = area.alloc(4, 0, false, &buddy).unwrap();
        assert_eq!(area.used_pages(), 12);
        area.release(a, 8, &buddy).unwrap();
        assert_eq!(area.used_pages(), 4);
    }

    #[test]
    fn test_busy_range_is_skipped() {
        let buddy = FakeBuddy::default();
        buddy.pinned.borrow_mut().push(0x80000);
        let area = area(0x100, 0);
        let pfn = area.alloc(4, 0, false, &buddy).unwrap();
        assert_eq!(pfn, Pfn(0x80001));
        area.with_bitmap(|bm| {
            assert!(!bm.test(0));
            assert_eq!(bm.weight(), 4);
        });
    }

    #[test]
    fn test_busy_everywhere_backs_off_then_fails() {
        let buddy = FakeBuddy::default();
        buddy.pinned.borrow_mut().extend([0x80000, 0x80002]);
        let area = area(4, 0);
        let err = area.alloc(2, 0, true, &buddy).unwrap_err();
        assert_eq!(err, CmaError::MigrationFailed);
        assert_eq!(buddy.backoffs.get(), MAX_BUSY_RETRIES);
        area.with_bitmap(|bm| assert_eq!(bm.weight(), 0));
        assert_eq!(area.stats().alloc_fail.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_hard_failure_leaves_bitmap_untouched() {
        let buddy = FakeBuddy::default();
        buddy.fail_hard.set(true);
        let area = area(64, 0);
        assert_eq!(area.alloc(8, 0, true, &buddy), Err(CmaError::MigrationFailed));
        area.with_bitmap(|bm| assert_eq!(bm.weight(), 0));
    }

    #[test]
    fn test_atomic_context_fails_fast() {
        let buddy = FakeBuddy::default();
        let area = area(64, 0);
        assert_eq!(
            area.alloc_gfp(1, 0, GfpFlags::ATOMIC, &buddy),
            Err(CmaError::WouldBlock)
        );
        area.with_bitmap(|bm| assert_eq!(bm.weight(), 0));
    }

    #[test]
    fn test_no_space() {
        let buddy = FakeBuddy::default();
        let area = area(64, 0);
        area.alloc(60, 0, true, &buddy).unwrap();
        assert_eq!(area.alloc(8, 0, true, &buddy), Err(CmaError::NoSpace));
    }

    #[test]
    fn test_search_wraps_from_hint() {
        let buddy = FakeBuddy::default();
        let area = area(64, 0);
        let a = area.alloc(32, 0, true, &buddy).unwrap();
        let _b = area.alloc(24, 0, true, &buddy).unwrap();
        area.release(a, 32, &buddy).unwrap();
        // Hint sits at 56; only 8 units remain above it.
        let c = area.alloc(16, 0, true, &buddy).unwrap();
        assert_eq!(c, Pfn(0x80000));
    }

    #[test]
    fn test_release_checks_ownership() {
        let buddy = FakeBuddy::default();
        let area = area(64, 0);
        let pfn = area.alloc(8, 0, true, &buddy).unwrap();
        assert_eq!(area.release(Pfn(0x7ffff), 1, &buddy), Err(CmaError::NotOwned));
        assert_eq!(area.release(pfn.add(8), 1, &buddy), Err(CmaError::NotOwned));
        assert_eq!(area.release(pfn, 65, &buddy), Err(CmaError::NotOwned));
        let seq = area.release_seq();
        area.release(pfn, 8, &buddy).unwrap();
        assert_eq!(area.release_seq(), seq + 1);
        assert_eq!(buddy.freed.get(), 8);
        assert_eq!(area.release(pfn, 8, &buddy), Err(CmaError::NotOwned));
    }

    #[test]
    fn test_concurrent_release_frees_once() {
        extern crate std;
        use std::thread;
        use std::time::Duration;

        /// Page allocator that is slow to take pages back.
        #[derive(Default)]
        struct SlowBuddy {
            freed: AtomicU64,
        }

        impl ContigRange for SlowBuddy {
            fn alloc_contig_range(&self, _: Pfn, _: u64, _: GfpFlags) -> Result<(), MigrateError> {
                Ok(())
            }

            fn free_contig_range(&self, _: Pfn, count: u64) {
                thread::sleep(Duration::from_millis(100));
                self.freed.fetch_add(count, Ordering::Relaxed);
            }
        }

        let buddy = SlowBuddy::default();
        let area = area(64, 0);
        let pfn = area.alloc(16, 0, true, &buddy).unwrap();

        let (r1, r2) = thread::scope(|s| {
            let t1 = s.spawn(|| area.release(pfn, 16, &buddy));
            let t2 = s.spawn(|| area.release(pfn, 16, &buddy));
            (t1.join().unwrap(), t2.join().unwrap())
        });

        let mut results = [r1, r2];
        results.sort_by_key(Result::is_err);
        assert_eq!(results, [Ok(()), Err(CmaError::NotOwned)]);
        assert_eq!(buddy.freed.load(Ordering::Relaxed), 16);
        assert_eq!(area.used_pages(), 0);
        assert_eq!(area.stats().pages_released.load(Ordering::Relaxed), 16);
    }

    #[test]
    fn test_inactive_area() {
        let buddy = FakeBuddy::default();
        let area = CmaArea::new("idle".into(), Pfn(0x80000), 64, 0, None);
        assert!(!area.is_active());
        assert_eq!(area.alloc(1, 0, true, &buddy), Err(CmaError::Inactive));
    }
}
