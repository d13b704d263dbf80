//! `/memreserve/` entries and `/reserved-memory` children.
//!
//! Static regions (`reg`) are claimed during the scan. Dynamic regions
//! (`size` with optional `alignment` and `alloc-ranges`) are placed
//! afterwards, in node order, so they avoid everything static. Each region
//! is then offered to its driver; `shared-dma-pool` nodes marked
//! `reusable` become CMA areas.

use alloc::string::String;
use alloc::vec::Vec;

use fdt::node::FdtNode;

use m6_cma::{CmaError, CmaId, CmaRegistry, DmaContiguous, PoolSetup, ReservedPool, CMA_MIN_ALIGNMENT};
use m6_common::memory::{SMP_CACHE_BYTES, SZ_1M};
use m6_memblock::{Memblock, ALLOC_ANYWHERE};

use super::cells::{self, CellSizes};
use super::FdtBlob;
use crate::error::{BootError, FirmwareFault};

/// Capacity of the reserved region table.
pub const MAX_RESERVED_REGIONS: usize = 64;

/// A reserved-memory region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedMem {
    /// Node name including the unit address
    pub name: String,
    pub base: u64,
    pub size: u64,
    pub phandle: Option<u32>,
    pub no_map: bool,
    pub reusable: bool,
    /// CMA area created for the region
    pub cma: Option<CmaId>,
}

/// CMA state reserved-memory nodes may feed.
pub struct CmaSinks<'r> {
    pub dma: &'r mut DmaContiguous,
    pub registry: &'r mut CmaRegistry,
}

struct Pending<'a> {
    rmem: ReservedMem,
    node: FdtNode<'a, 'a>,
    dynamic: bool,
}

/// Apply `/memreserve/` and `/reserved-memory`
/// (`early_init_fdt_scan_reserved_mem`).
///
/// # Arguments
///
/// * `cma` - where reusable DMA pools go; `None` when CMA is disabled, in
///   which case they stay plain reservations
///
/// # Returns
///
/// The regions that ended up reserved.
///
/// # Errors
///
/// - [`FirmwareFault::ReusableNoMap`] for a node with both properties
/// - [`FirmwareFault::BadReg`] for malformed `reg`, `size`, `alignment` or
///   `alloc-ranges`
/// - [`BootError::CmaMisaligned`] for a CMA pool off the CMA alignment
pub fn scan_reserved<'a>(
    blob: &'a FdtBlob<'a>,
    memblock: &mut Memblock,
    mut cma: Option<CmaSinks<'_>>,
) -> Result<Vec<ReservedMem>, BootError> {
    for rsv in blob.fdt().memory_reservations() {
        let (base, size) = (rsv.address() as u64, rsv.size() as u64);
        log::debug!("memreserve: {:#x} + {:#x}", base, size);
        if size != 0 {
            memblock.reserve(base, size)?;
        }
    }

    let Some(parent) = blob.fdt().find_node("/reserved-memory") else {
        return Ok(Vec::new());
    };
    let root = blob.root_cells()?;
    let own = CellSizes::of(&parent).map_err(|f| blob.fault(f))?;
    if own != root {
        log::error!("Reserved memory: unsupported node format, ignoring");
        return Ok(Vec::new());
    }
    if !cells::has_prop(&parent, "ranges") {
        log::error!("Reserved memory: unsupported node format, ignoring");
        return Ok(Vec::new());
    }

    let mut pending: Vec<Pending<'a>> = Vec::new();
    for node in parent.children() {
        if !cells::is_available(&node) {
            continue;
        }
        let name = node.name;
        let no_map = cells::has_prop(&node, "no-map");
        let reusable = cells::has_prop(&node, "reusable");
        if no_map && reusable {
            log::error!("Reserved memory: {} is both reusable and no-map", name);
            return Err(blob.fault(FirmwareFault::ReusableNoMap));
        }

        let record = |base, size, dynamic| Pending {
            rmem: ReservedMem {
                name: name.into(),
                base,
                size,
                phandle: cells::prop_u32(&node, "phandle"),
                no_map,
                reusable,
                cma: None,
            },
            node,
            dynamic,
        };

        let entry = match node.property("reg") {
            Some(reg) => {
                let ranges = cells::read_reg(reg.value, root).map_err(|f| {
                    log::error!("Reserved memory: invalid reg property in '{}'", name);
                    blob.fault(f)
                })?;
                for &(base, size) in &ranges {
                    if size != 0 && reserve_memory_arch(memblock, base, size, no_map) {
                        log::debug!(
                            "Reserved memory: reserved region for node '{}': base {:#x}, size {} MiB",
                            name,
                            base,
                            size / SZ_1M
                        );
                    } else {
                        log::info!(
                            "Reserved memory: failed to reserve memory for node '{}': base {:#x}, size {} MiB",
                            name,
                            base,
                            size / SZ_1M
                        );
                    }
                }
                ranges.first().map(|&(base, size)| record(base, size, false))
            }
            None if cells::has_prop(&node, "size") => Some(record(0, 0, true)),
            None => None,
        };

        if let Some(entry) = entry {
            if pending.len() == MAX_RESERVED_REGIONS {
                log::error!("not enough space for all defined regions.");
                continue;
            }
            pending.push(entry);
        }
    }

    let mut regions = Vec::with_capacity(pending.len());
    for Pending {
        mut rmem,
        node,
        dynamic,
    } in pending
    {
        if dynamic {
            match alloc_size(blob, memblock, &node, &rmem, root, cma.is_some())? {
                Some((base, size)) => {
                    rmem.base = base;
                    rmem.size = size;
                }
                None => {
                    log::info!("Reserved memory: failed to allocate memory for node '{}'", rmem.name);
                    continue;
                }
            }
        }

        if cells::is_compatible(&node, "shared-dma-pool") {
            if !init_dma_pool(&mut cma, memblock, &node, &mut rmem)? {
                memblock.free(rmem.base, rmem.size);
                if rmem.no_map {
                    memblock.clear_nomap(rmem.base, rmem.size);
                }
                continue;
            }
        }
        regions.push(rmem);
    }

    check_for_overlap(&mut regions);
    Ok(regions)
}

/// Claim a static region (`early_init_dt_reserve_memory_arch`). A `no-map`
/// region may not overlap anything already reserved.
fn reserve_memory_arch(memblock: &mut Memblock, base: u64, size: u64, no_map: bool) -> bool {
    if no_map {
        if memblock.is_region_reserved(base, size) {
            return false;
        }
        memblock.mark_nomap(base, size);
    }
    memblock.reserve(base, size).is_ok()
}

/// Place a dynamic region (`__reserved_mem_alloc_size`).
fn alloc_size(
    blob: &FdtBlob<'_>,
    memblock: &mut Memblock,
    node: &FdtNode<'_, '_>,
    rmem: &ReservedMem,
    root: CellSizes,
    cma_enabled: bool,
) -> Result<Option<(u64, u64)>, BootError> {
    let size = cells::prop_cells(node, "size", root.size)
        .map_err(|f| blob.fault(f))?
        .unwrap_or(0);
    let mut align = cells::prop_cells(node, "alignment", root.address)
        .map_err(|f| blob.fault(f))?
        .unwrap_or(0);
    if size == 0 {
        return Ok(None);
    }

    // CMA pools must be pageblock and max-order aligned.
    if cma_enabled
        && cells::is_compatible(node, "shared-dma-pool")
        && rmem.reusable
        && !rmem.no_map
    {
        align = align.max(CMA_MIN_ALIGNMENT);
    }

    let windows = match node.property("alloc-ranges") {
        Some(prop) => cells::read_reg(prop.value, root).map_err(|f| {
            log::error!("Reserved memory: invalid alloc-ranges property in '{}'", rmem.name);
            blob.fault(f)
        })?,
        None => alloc::vec![(0, 0)],
    };

    for (start, len) in windows {
        let end = if len == 0 { ALLOC_ANYWHERE } else { start.saturating_add(len) };
        if let Some(base) = alloc_reserved_memory_arch(memblock, size, align, start, end, rmem.no_map) {
            log::debug!(
                "Reserved memory: allocated memory for '{}' node: base {:#x}, size {} MiB",
                rmem.name,
                base,
                size / SZ_1M
            );
            return Ok(Some((base, size)));
        }
    }
    Ok(None)
}

fn alloc_reserved_memory_arch(
    memblock: &mut Memblock,
    size: u64,
    align: u64,
    start: u64,
    end: u64,
    no_map: bool,
) -> Option<u64> {
    let align = if align == 0 { SMP_CACHE_BYTES } else { align };
    let base = memblock.find_in_range(start, end, size, align)?;
    if no_map {
        memblock.mark_nomap(base, size);
    }
    memblock.reserve(base, size).ok()?;
    Some(base)
}

/// Offer a `shared-dma-pool` region to CMA (`rmem_cma_setup`).
///
/// # Returns
///
/// `Ok(false)` if the region should be released again.
fn init_dma_pool(
    cma: &mut Option<CmaSinks<'_>>,
    memblock: &Memblock,
    node: &FdtNode<'_, '_>,
    rmem: &mut ReservedMem,
) -> Result<bool, BootError> {
    let Some(sinks) = cma.as_mut() else {
        return Ok(true);
    };
    if !rmem.reusable {
        // Coherent per-device pool: stays reserved for its driver.
        log::info!(
            "Reserved memory: created DMA memory pool at {:#x}, size {} MiB",
            rmem.base,
            rmem.size / SZ_1M
        );
        return Ok(true);
    }
    let pool = ReservedPool {
        name: &rmem.name,
        base: rmem.base,
        size: rmem.size,
        reusable: rmem.reusable,
        no_map: rmem.no_map,
        default: cells::has_prop(node, "linux,cma-default"),
    };
    match sinks.dma.setup_reserved_pool(sinks.registry, memblock, &pool) {
        Ok(PoolSetup::Created(id)) => {
            rmem.cma = Some(id);
            Ok(true)
        }
        Ok(PoolSetup::Bypassed) => Ok(false),
        Err(CmaError::Misaligned { base, size, .. }) => Err(BootError::CmaMisaligned { base, size }),
        Err(err) => {
            log::info!("node {} compatible matching fail: {}", rmem.name, err);
            Ok(false)
        }
    }
}

/// Report overlapping regions (`__rmem_check_for_overlap`).
fn check_for_overlap(regions: &mut [ReservedMem]) {
    regions.sort_by_key(|r| r.base);
    for pair in regions.windows(2) {
        let (this, next) = (&pair[0], &pair[1]);
        if this.base + this.size > next.base {
            log::error!(
                "OVERLAP DETECTED!\n{} ({:#x}--{:#x}) overlaps with {} ({:#x}--{:#x})",
                this.name,
                this.base,
                this.base + this.size,
                next.name,
                next.base,
                next.base + next.size
            );
        }
    }
}
