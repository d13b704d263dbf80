//! Protected KVM Memory Pool
//!
//! In protected mode the hypervisor runs with its own stage-1 tables and
//! owns the host's stage-2 tables, so it needs memory the host never
//! touches again. The pool is sized for the worst case: every RAM range
//! mapped at page granularity in both stages, 1 GiB of private and MMIO
//! mappings, and the hypervisor's own page metadata.

use alloc::vec::Vec;

use m6_common::addr::align_up;
use m6_common::memory::{PAGE_SHIFT, PAGE_SIZE, PMD_SIZE, PTRS_PER_TABLE, SZ_1G};
use m6_memblock::{Memblock, PhysRange, ALLOC_ACCESSIBLE};

use crate::cmdline::KvmMode;
use crate::config::KernelConfig;
use crate::cpu::BootCpu;
use crate::error::BootError;

/// Capacity of the hypervisor's copy of the memory table
pub const HYP_MEMBLOCK_REGIONS: usize = 128;

/// Translation levels provisioned for
const PGTABLE_MAX_LEVELS: u32 = 4;

/// Slack for concatenated stage-2 PGDs
const S2_PGD_SLACK: u64 = 16;

/// Bytes of hypervisor metadata per frame (`struct hyp_page`)
const HYP_PAGE_SIZE: u64 = 4;

/// The reserved pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HypMemory {
    /// Snapshot of `memory` handed to the hypervisor (`hyp_memory`)
    pub regions: Vec<PhysRange>,
    /// `hyp_mem_base`
    pub base: u64,
    /// `hyp_mem_size`
    pub size: u64,
}

/// Table pages needed to map `nr_pages` frames at page granularity in the
/// worst case (`__hyp_pgtable_max_pages`).
#[must_use]
pub const fn hyp_pgtable_max_pages(mut nr_pages: u64) -> u64 {
    let mut total = 0;
    let mut level = 0;
    while level < PGTABLE_MAX_LEVELS {
        nr_pages = nr_pages.div_ceil(PTRS_PER_TABLE);
        total += nr_pages;
        level += 1;
    }
    total
}

fn pgtable_total_pages(regions: &[PhysRange]) -> u64 {
    regions
        .iter()
        .map(|r| hyp_pgtable_max_pages(r.size >> PAGE_SHIFT))
        .sum()
}

/// Pages backing `hyp_vmemmap`. Those pages need metadata of their own,
/// so iterate until the count stops changing.
fn vmemmap_pages(hyp_mem_pages: u64) -> u64 {
    let mut nr_pages = 0;
    loop {
        let prev = nr_pages;
        nr_pages = (hyp_mem_pages + prev) * HYP_PAGE_SIZE;
        nr_pages = nr_pages.div_ceil(PAGE_SIZE);
        nr_pages += hyp_pgtable_max_pages(nr_pages);
        if nr_pages == prev {
            return nr_pages;
        }
    }
}

/// Total pool size in pages for a memory table.
fn pool_pages(regions: &[PhysRange]) -> u64 {
    let total = pgtable_total_pages(regions);
    let private = hyp_pgtable_max_pages(SZ_1G >> PAGE_SHIFT);
    let s1 = total + private;
    let s2 = total + S2_PGD_SLACK + private;
    let pages = s1 + s2;
    pages + vmemmap_pages(pages)
}

/// Reserve the protected hypervisor pool (`kvm_hyp_reserve`).
///
/// # Returns
///
/// `None` unless the kernel was entered at EL2 without VHE and
/// `kvm-arm.mode=protected` was given.
///
/// # Errors
///
/// - [`BootError::HypRegionOverflow`] when `memory` has more than
///   [`HYP_MEMBLOCK_REGIONS`] entries
/// - [`BootError::OutOfAddressSpace`] when the pool does not fit
pub fn kvm_hyp_reserve(
    config: &KernelConfig,
    cpu: &BootCpu,
    mode: KvmMode,
    memblock: &mut Memblock,
) -> Result<Option<HypMemory>, BootError> {
    if !config.kvm || !cpu.hyp_mode_available() || cpu.kernel_in_hyp_mode() {
        return Ok(None);
    }
    if mode != KvmMode::Protected {
        return Ok(None);
    }

    let regions = memblock.memory();
    if regions.len() > HYP_MEMBLOCK_REGIONS {
        log::error!("kvm [{}]: Failed to register hyp memblocks", regions.len());
        return Err(BootError::HypRegionOverflow {
            regions: regions.len(),
        });
    }
    let regions = regions.to_vec();

    let mut size = pool_pages(&regions) << PAGE_SHIFT;
    let base = match memblock.alloc_range(align_up(size, PMD_SIZE), PMD_SIZE, 0, ALLOC_ACCESSIBLE, None) {
        Ok(base) => {
            size = align_up(size, PMD_SIZE);
            base
        }
        Err(_) => memblock
            .alloc_range(size, PAGE_SIZE, 0, ALLOC_ACCESSIBLE, None)
            .map_err(|_| {
                log::error!("kvm: Failed to reserve hyp memory");
                BootError::OutOfAddressSpace {
                    what: "hyp memory",
                    size,
                }
            })?,
    };

    log::info!("kvm: Reserved {} MiB at {:#x}", size >> 20, base);
    Ok(Some(HypMemory {
        regions,
        base,
        size,
    }))
}
