//! CMA Area Registry
//!
//! Holds every declared area. Areas are declared on the boot CPU while the
//! region table is still live, then activated (bitmaps allocated) once
//! zones are known. After activation the registry is only read; each area
//! serialises its own bitmap.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use m6_common::addr::{align_up, is_aligned};
use m6_common::memory::{MAX_ORDER, PAGEBLOCK_ORDER, PAGE_SHIFT, PAGE_SIZE, SZ_4G};
use m6_common::{NodeId, Pa};
use m6_memblock::Memblock;

use crate::area::{CmaArea, CmaId};
use crate::error::CmaError;

/// Default number of area slots (`CONFIG_CMA_AREAS`).
pub const DEFAULT_MAX_AREAS: usize = 7;

/// Smallest alignment of an area: the larger of a pageblock and the
/// largest buddy order.
pub const CMA_MIN_ALIGNMENT: u64 = PAGE_SIZE << max_u32(MAX_ORDER - 1, PAGEBLOCK_ORDER);

const fn max_u32(a: u32, b: u32) -> u32 {
    if a > b { a } else { b }
}

/// Parameters of a boot-time area declaration.
#[derive(Debug, Clone, Copy)]
pub struct CmaDeclaration<'a> {
    /// Requested base, 0 for "anywhere"
    pub base: u64,
    pub size: u64,
    /// Highest end address, 0 for "end of DRAM"
    pub limit: u64,
    /// Extra alignment, 0 for the CMA minimum
    pub alignment: u64,
    pub order_per_bit: u32,
    /// Place exactly at `base`
    pub fixed: bool,
    pub name: &'a str,
    /// Node the memory must come from
    pub nid: Option<NodeId>,
}

impl<'a> CmaDeclaration<'a> {
    /// A floating declaration of `size` bytes.
    #[must_use]
    pub const fn new(size: u64, name: &'a str) -> Self {
        Self {
            base: 0,
            size,
            limit: 0,
            alignment: 0,
            order_per_bit: 0,
            fixed: false,
            name,
            nid: None,
        }
    }
}

/// Registry of all CMA areas.
#[derive(Debug)]
pub struct CmaRegistry {
    areas: Vec<CmaArea>,
    max_areas: usize,
    total_pages: u64,
}

impl Default for CmaRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_AREAS)
    }
}

impl CmaRegistry {
    #[must_use]
    pub const fn new(max_areas: usize) -> Self {
        Self {
            areas: Vec::new(),
            max_areas,
            total_pages: 0,
        }
    }

    /// Number of declared areas.
    #[must_use]
    pub fn len(&self) -> usize {
        self.areas.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    /// Total pages given to CMA (`totalcma_pages`).
    #[must_use]
    pub fn total_pages(&self) -> u64 {
        self.total_pages
    }

    /// Look up an area.
    ///
    /// # Panics
    ///
    /// Panics if `id` did not come from this registry.
    #[must_use]
    pub fn get(&self, id: CmaId) -> &CmaArea {
        &self.areas[id.0 as usize]
    }

    /// Iterate all areas with their ids (`cma_for_each_area`).
    pub fn iter(&self) -> impl Iterator<Item = (CmaId, &CmaArea)> {
        self.areas
            .iter()
            .enumerate()
            .map(|(i, area)| (CmaId(i as u16), area))
    }

    /// Find the area owning `pfn`.
    #[must_use]
    pub fn find_by_pfn(&self, pfn: m6_common::Pfn) -> Option<CmaId> {
        self.iter().find(|(_, area)| area.contains(pfn)).map(|(id, _)| id)
    }

    /// Turn an already reserved range into a CMA area
    /// (`cma_init_reserved_mem`).
    ///
    /// # Errors
    ///
    /// - [`CmaError::TooManyAreas`] when all slots are used
    /// - [`CmaError::InvalidRange`] for an empty or unreserved range
    /// - [`CmaError::Misaligned`] when base or size break the CMA alignment
    pub fn init_reserved_mem(
        &mut self,
        memblock: &Memblock,
        base: u64,
        size: u64,
        order_per_bit: u32,
        name: Option<&str>,
        nid: Option<NodeId>,
    ) -> Result<CmaId, CmaError> {
        if self.areas.len() == self.max_areas {
            log::error!("Not enough slots for CMA reserved regions!");
            return Err(CmaError::TooManyAreas);
        }
        if size == 0 || !memblock.is_region_reserved(base, size) {
            return Err(CmaError::InvalidRange);
        }

        let alignment = CMA_MIN_ALIGNMENT;
        if !is_aligned(alignment >> PAGE_SHIFT, 1 << order_per_bit) {
            return Err(CmaError::InvalidRange);
        }
        if !is_aligned(base, alignment) || !is_aligned(size, alignment) {
            return Err(CmaError::Misaligned {
                base,
                size,
                align: alignment,
            });
        }

        let id = CmaId(self.areas.len() as u16);
        let name: String = match name {
            Some(name) => name.into(),
            None => format!("cma{}", id.0),
        };
        let pages = size >> PAGE_SHIFT;
        self.areas
            .push(CmaArea::new(name, Pa(base).pfn_down(), pages, order_per_bit, nid));
        self.total_pages += pages;
        Ok(id)
    }

    /// Reserve memory for a new area and register it
    /// (`cma_declare_contiguous_nid`).
    ///
    /// Floating areas are placed bottom-up above 4 GiB when DRAM reaches
    /// far enough, so low memory stays available for devices with narrow
    /// DMA masks; otherwise top-down inside `[base, limit)`.
    ///
    /// # Errors
    ///
    /// - [`CmaError::InvalidRange`] for a zero size or a non power of two
    ///   alignment
    /// - [`CmaError::Misaligned`] for a fixed base that is not aligned
    /// - [`CmaError::ExceedsLimit`] when the area cannot fit below `limit`
    /// - [`CmaError::Busy`] when a fixed range is already claimed
    /// - [`CmaError::OutOfSpace`] when no memory is left
    /// - any error of [`init_reserved_mem`](Self::init_reserved_mem)
    pub fn declare_contiguous_nid(
        &mut self,
        memblock: &mut Memblock,
        decl: &CmaDeclaration<'_>,
    ) -> Result<CmaId, CmaError> {
        let memblock_end = memblock.end_of_dram();
        let CmaDeclaration {
            mut base,
            mut size,
            mut limit,
            alignment,
            order_per_bit,
            mut fixed,
            name,
            nid,
        } = *decl;

        log::debug!(
            "cma_declare_contiguous_nid(size {:#x}, base {:#x}, limit {:#x} alignment {:#x})",
            size,
            base,
            limit,
            alignment
        );

        if self.areas.len() == self.max_areas {
            log::error!("Not enough slots for CMA reserved regions!");
            return Err(CmaError::TooManyAreas);
        }
        if size == 0 {
            return Err(CmaError::InvalidRange);
        }
        if alignment != 0 && !alignment.is_power_of_two() {
            return Err(CmaError::InvalidRange);
        }

        let align_floor = CMA_MIN_ALIGNMENT.max(PAGE_SIZE << order_per_bit);
        let alignment = alignment.max(align_floor);
        if fixed && !is_aligned(base, alignment) {
            return Err(CmaError::Misaligned {
                base,
                size,
                align: alignment,
            });
        }
        base = align_up(base, alignment);
        size = align_up(size, alignment);
        limit &= !(alignment - 1);

        if base == 0 {
            fixed = false;
        }
        if limit == 0 || limit > memblock_end {
            limit = memblock_end;
        }
        if base.saturating_add(size) > limit {
            log::error!(
                "Size ({:#x}) of region at {:#x} exceeds limit ({:#x})",
                size,
                base,
                limit
            );
            return Err(CmaError::ExceedsLimit { base, size, limit });
        }

        if fixed {
            if memblock.is_region_reserved(base, size) || memblock.reserve(base, size).is_err() {
                return Err(CmaError::Busy);
            }
        } else {
            let mut addr = None;
            if !memblock.bottom_up() && memblock_end >= SZ_4G + size {
                memblock.set_bottom_up(true);
                addr = memblock
                    .alloc_range_nid(size, alignment, SZ_4G, limit, nid, true)
                    .ok();
                memblock.set_bottom_up(false);
            }
            if addr.is_none() {
                addr = memblock
                    .alloc_range_nid(size, alignment, base, limit, nid, true)
                    .ok();
            }
            if addr.is_none() && nid.is_some() {
                addr = memblock
                    .alloc_range_nid(size, alignment, base, limit, None, false)
                    .ok();
            }
            base = addr.ok_or(CmaError::OutOfSpace)?;
        }

        match self.init_reserved_mem(memblock, base, size, order_per_bit, Some(name), nid) {
            Ok(id) => {
                log::info!("Reserved {} MiB at {:#x}", size >> 20, base);
                Ok(id)
            }
            Err(err) => {
                memblock.free(base, size);
                Err(err)
            }
        }
    }

    /// Allocate bitmaps for all areas once zones are known
    /// (`cma_init_reserved_areas`).
    ///
    /// # Arguments
    ///
    /// * `zone_of` - zone identity of a frame; an area whose first and last
    ///   frames fall in different zones cannot be used and is disabled
    /// * `memblock` - disabled areas give their memory back here
    pub fn activate<Z: PartialEq>(
        &mut self,
        memblock: &mut Memblock,
        zone_of: impl Fn(m6_common::Pfn) -> Option<Z>,
    ) {
        for area in &mut self.areas {
            if area.count() == 0 {
                continue;
            }
            let first = area.base_pfn();
            let last = first.add(area.pages() - 1);
            let zone = zone_of(first);
            if zone.is_none() || zone != zone_of(last) {
                log::error!("CMA area {} could not be activated", area.name());
                memblock.free(area.base(), area.size());
                self.total_pages -= area.pages();
                area.disable();
                continue;
            }
            area.activate();
            log::debug!(
                "cma: activated {} at pfn {:#x}, {} pages",
                area.name(),
                first.0,
                area.pages()
            );
        }
    }
}
