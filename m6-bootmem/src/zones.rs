//! Zone Planner
//!
//! Splits each node's frames into zones by DMA reach.
//!
//! # Design
//!
//! Zone limits are global and ascending: every zone ends where the next
//! begins, and a zone whose limit is below its start is empty. A node's
//! zones are the intersection of its frame span with those global ranges.
//!
//! ```text
//! 0          DMA limit     4 GiB                     max_pfn
//! |--- DMA ---|--- DMA32 ---|-------- NORMAL ---------|
//! ```
//!
//! `MOVABLE` and `DEVICE` exist for completeness and are always empty
//! here: nothing on the command line carves out movable memory, and
//! device memory only appears with hotplug.

use core::fmt;

use m6_cma::CmaRegistry;
use m6_common::addr::{bit_mask, fls64};
use m6_common::memory::PHYS_ADDR_MAX;
use m6_common::{NodeId, Pa, Pfn};
use m6_memblock::Memblock;

use crate::config::KernelConfig;
use crate::numa::Numa;

/// Number of zone types.
pub const NR_ZONES: usize = 5;

/// Zone types in ascending address order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ZoneType {
    Dma,
    Dma32,
    Normal,
    Movable,
    Device,
}

impl ZoneType {
    pub const ALL: [Self; NR_ZONES] = [
        Self::Dma,
        Self::Dma32,
        Self::Normal,
        Self::Movable,
        Self::Device,
    ];

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Dma => "DMA",
            Self::Dma32 => "DMA32",
            Self::Normal => "Normal",
            Self::Movable => "Movable",
            Self::Device => "Device",
        }
    }
}

impl fmt::Display for ZoneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One zone of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Zone {
    pub zone_type: ZoneType,
    pub start_pfn: Pfn,
    /// Frames from start to end, holes included
    pub spanned: u64,
    /// Frames backed by memory
    pub present: u64,
    /// Frames handed to the page allocator
    pub managed: u64,
}

impl Zone {
    #[must_use]
    pub const fn empty(zone_type: ZoneType) -> Self {
        Self {
            zone_type,
            start_pfn: Pfn(0),
            spanned: 0,
            present: 0,
            managed: 0,
        }
    }

    /// All zones of a node, empty.
    #[must_use]
    pub const fn empty_set() -> [Self; NR_ZONES] {
        [
            Self::empty(ZoneType::Dma),
            Self::empty(ZoneType::Dma32),
            Self::empty(ZoneType::Normal),
            Self::empty(ZoneType::Movable),
            Self::empty(ZoneType::Device),
        ]
    }

    #[inline]
    #[must_use]
    pub const fn end_pfn(&self) -> Pfn {
        Pfn(self.start_pfn.0 + self.spanned)
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, pfn: Pfn) -> bool {
        pfn.0 >= self.start_pfn.0 && pfn.0 < self.start_pfn.0 + self.spanned
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.spanned == 0
    }
}

/// Upper bound of a zone that should cover `bits` of DMA address space,
/// adjusted for DRAM that starts above it (`max_zone_phys`).
#[must_use]
pub fn max_zone_phys(memblock: &Memblock, bits: u32) -> u64 {
    let start = memblock.start_of_dram();
    let mask = if start > u64::from(u32::MAX) {
        PHYS_ADDR_MAX
    } else if start > bit_mask(bits) {
        u64::from(u32::MAX)
    } else {
        bit_mask(bits)
    };
    mask.min(memblock.end_of_dram().wrapping_sub(1)).saturating_add(1)
}

/// Global zone limits (`zone_sizes_init`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZonePlan {
    /// Address bits devices in `ZONE_DMA` can reach
    pub zone_dma_bits: u32,
    /// Highest address plus one usable by any DMA master
    pub arm64_dma_phys_limit: u64,
    /// Per-zone end frame handed to `free_area_init`
    pub max_zone_pfns: [Pfn; NR_ZONES],
    lowest: [Pfn; NR_ZONES],
    highest: [Pfn; NR_ZONES],
}

impl ZonePlan {
    /// Compute zone limits.
    ///
    /// # Arguments
    ///
    /// * `dt_dma_limit` - highest CPU address reachable by DMA per the
    ///   device tree
    /// * `acpi_dma_limit` - the same from ACPI IORT, [`PHYS_ADDR_MAX`]
    ///   without ACPI
    /// * `max` - end frame of RAM
    #[must_use]
    pub fn new(
        config: &KernelConfig,
        memblock: &Memblock,
        dt_dma_limit: u64,
        acpi_dma_limit: u64,
        max: Pfn,
    ) -> Self {
        let mut max_zone_pfns = [Pfn(0); NR_ZONES];
        let mut zone_dma_bits = 0;
        let mut dma_limit = 0;
        let dma32_phys_limit = max_zone_phys(memblock, 32);

        if config.zone_dma {
            zone_dma_bits = 32.min(fls64(dt_dma_limit)).min(fls64(acpi_dma_limit));
            dma_limit = max_zone_phys(memblock, zone_dma_bits);
            max_zone_pfns[ZoneType::Dma.index()] = Pa(dma_limit).pfn_down();
        }
        if config.zone_dma32 {
            max_zone_pfns[ZoneType::Dma32.index()] = Pa(dma32_phys_limit).pfn_down();
            if dma_limit == 0 {
                dma_limit = dma32_phys_limit;
            }
        }
        if dma_limit == 0 {
            dma_limit = config.phys_limit();
        }
        max_zone_pfns[ZoneType::Normal.index()] = max;

        let mut plan = Self {
            zone_dma_bits,
            arm64_dma_phys_limit: dma_limit,
            max_zone_pfns,
            lowest: [Pfn(0); NR_ZONES],
            highest: [Pfn(0); NR_ZONES],
        };
        plan.arrange(Pa(memblock.start_of_dram()).pfn_down());
        plan
    }

    /// `arch_zone_{lowest,highest}_possible_pfn`
    fn arrange(&mut self, min_pfn: Pfn) {
        let mut start = min_pfn;
        for zone in ZoneType::ALL {
            let i = zone.index();
            if zone == ZoneType::Movable {
                continue;
            }
            let end = self.max_zone_pfns[i].max(start);
            self.lowest[i] = start;
            self.highest[i] = end;
            start = end;
        }

        log::info!("Zone ranges:");
        for zone in ZoneType::ALL {
            if zone == ZoneType::Movable {
                continue;
            }
            let (lo, hi) = self.zone_range(zone);
            if lo == hi {
                log::info!("  {:<8} empty", zone.name());
            } else {
                log::info!(
                    "  {:<8} [mem {:#018x}-{:#018x}]",
                    zone.name(),
                    lo.phys().as_u64(),
                    hi.phys().as_u64() - 1
                );
            }
        }
    }

    /// Global frame range of a zone.
    #[must_use]
    pub fn zone_range(&self, zone: ZoneType) -> (Pfn, Pfn) {
        (self.lowest[zone.index()], self.highest[zone.index()])
    }

    /// Size every node's zones (`free_area_init`).
    pub fn free_area_init(&self, memblock: &Memblock, numa: &mut Numa) {
        let nids: alloc::vec::Vec<NodeId> = numa.online().iter().collect();
        for nid in nids {
            let (start, end) = memblock
                .get_pfn_range_for_nid(nid)
                .unwrap_or((Pfn(0), Pfn(0)));
            let Some(nd) = numa.node_data_mut(nid) else {
                continue;
            };
            if start != end {
                log::info!(
                    "Initmem setup node {} [mem {:#018x}-{:#018x}]",
                    nid,
                    start.phys().as_u64(),
                    end.phys().as_u64() - 1
                );
            }
            nd.start_pfn = start;

            let mut spanned_total = 0;
            let mut present_total = 0;
            for zone_type in ZoneType::ALL {
                let (lo, hi) = self.zone_range(zone_type);
                let zone = &mut nd.zones[zone_type.index()];
                *zone = Zone::empty(zone_type);
                if zone_type == ZoneType::Movable || start == end {
                    continue;
                }
                let zstart = start.clamp(lo, hi);
                let zend = end.clamp(lo, hi);
                let spanned = zend.0 - zstart.0;
                zone.start_pfn = zstart;
                zone.spanned = spanned;
                zone.present = present_in(memblock, nid, zstart, zend);
                spanned_total += spanned;
                present_total += zone.present;
                if spanned != 0 {
                    log::debug!(
                        "  node {} {:<8} spanned {:#x} present {:#x}",
                        nid,
                        zone_type.name(),
                        spanned,
                        zone.present
                    );
                }
            }
            nd.spanned_pages = spanned_total;
            nd.present_pages = present_total;
            log::debug!("On node {} totalpages: {}", nid, present_total);
        }
    }
}

/// Frames of `nid` backed by memory in `[start, end)`.
fn present_in(memblock: &Memblock, nid: NodeId, start: Pfn, end: Pfn) -> u64 {
    memblock
        .mem_pfn_ranges(Some(nid))
        .map(|(lo, hi, _)| {
            let lo = lo.max(start);
            let hi = hi.min(end);
            hi.0.saturating_sub(lo.0)
        })
        .sum()
}

/// Node and zone holding a frame (`page_zone`).
#[must_use]
pub fn zone_of(numa: &Numa, pfn: Pfn) -> Option<(NodeId, ZoneType)> {
    numa.nodes().find_map(|nd| {
        nd.zones
            .iter()
            .find(|z| !z.is_empty() && z.contains(pfn))
            .map(|z| (nd.id, z.zone_type))
    })
}

/// Count frames the page allocator receives: free memory plus active CMA
/// areas (`memblock_free_all` and `cma_activate_area`).
pub fn compute_managed(numa: &mut Numa, memblock: &Memblock, cma: &CmaRegistry) {
    let free = memblock.free_ranges(None);
    let nids: alloc::vec::Vec<NodeId> = numa.online().iter().collect();
    for nid in nids {
        let Some(nd) = numa.node_data_mut(nid) else {
            continue;
        };
        for zone in nd.zones.iter_mut().filter(|z| !z.is_empty()) {
            let (zs, ze) = (zone.start_pfn, zone.end_pfn());
            let clip = |lo: Pfn, hi: Pfn| hi.min(ze).0.saturating_sub(lo.max(zs).0);

            let free_pages: u64 = free
                .iter()
                .filter(|r| r.nid == Some(nid))
                .map(|r| clip(Pa(r.base).pfn_up(), Pa(r.end()).pfn_down()))
                .sum();
            let cma_pages: u64 = cma
                .iter()
                .filter(|(_, area)| area.is_active())
                .map(|(_, area)| clip(area.base_pfn(), area.base_pfn().add(area.pages())))
                .sum();
            zone.managed = (free_pages + cma_pages).min(zone.present);
        }
    }
}
