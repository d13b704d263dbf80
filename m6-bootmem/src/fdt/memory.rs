//! Memory nodes.

use alloc::vec::Vec;

use m6_common::addr::align_up;
use m6_common::memory::{PAGE_MASK, PAGE_SIZE};
use m6_common::numa::MAX_NUMNODES;
use m6_common::NodeId;
use m6_memblock::{Memblock, RegionFlags};

use super::cells;
use super::FdtBlob;
use crate::error::BootError;

/// One `reg` tuple of a memory node, as registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryNode {
    pub base: u64,
    pub size: u64,
    /// Raw `numa-node-id`, unvalidated
    pub nid: Option<u32>,
    pub hotpluggable: bool,
}

/// Register every `device_type = "memory"` node with the region table
/// (`early_init_dt_scan_memory`).
///
/// Ranges are trimmed to whole pages; ranges smaller than a page are
/// dropped with a warning. `linux,usable-memory` overrides `reg`.
///
/// # Arguments
///
/// * `numa` - tag ranges with their `numa-node-id`
///
/// # Errors
///
/// Malformed `reg` properties or unsupported root cells.
pub fn scan_memory(
    blob: &FdtBlob<'_>,
    memblock: &mut Memblock,
    numa: bool,
) -> Result<Vec<MemoryNode>, BootError> {
    let root = blob.root_cells()?;
    let mut found = Vec::new();

    for node in blob.fdt().all_nodes() {
        if cells::prop_str(&node, "device_type") != Some("memory") || !cells::is_available(&node) {
            continue;
        }
        let Some(reg) = node
            .property("linux,usable-memory")
            .or_else(|| node.property("reg"))
        else {
            continue;
        };
        let ranges = cells::read_reg(reg.value, root).map_err(|f| {
            log::error!("{}: invalid reg property", cells::node_name(&node));
            blob.fault(f)
        })?;
        let hotpluggable = cells::has_prop(&node, "hotpluggable");
        let raw_nid = cells::prop_u32(&node, "numa-node-id");
        let nid = match raw_nid {
            Some(n) if numa && (n as usize) < MAX_NUMNODES => NodeId::new(n),
            Some(n) if numa => {
                log::warn!("{}: node id {} exceeds maximum value", cells::node_name(&node), n);
                None
            }
            _ => None,
        };

        for (base, size) in ranges {
            log::debug!(" - {:#x}, {:#x}", base, size);
            let Some((base, size)) = add_memory_arch(memblock, base, size, nid)? else {
                continue;
            };
            if hotpluggable {
                memblock.mark_hotplug(base, size);
                log::debug!("{}: marked hotpluggable", cells::node_name(&node));
            }
            found.push(MemoryNode {
                base,
                size,
                nid: raw_nid,
                hotpluggable,
            });
        }
    }
    Ok(found)
}

/// Page-trim and register one range (`early_init_dt_add_memory_arch`).
fn add_memory_arch(
    memblock: &mut Memblock,
    mut base: u64,
    mut size: u64,
    nid: Option<NodeId>,
) -> Result<Option<(u64, u64)>, BootError> {
    let offset = base & PAGE_MASK;
    if offset != 0 {
        if size < PAGE_SIZE - offset {
            log::warn!(
                "Ignoring memory block {:#x} - {:#x}",
                base,
                base.wrapping_add(size)
            );
            return Ok(None);
        }
        size -= PAGE_SIZE - offset;
        base = align_up(base, PAGE_SIZE);
    }
    size &= !PAGE_MASK;
    if size == 0 {
        log::warn!("Ignoring memory block {:#x} - {:#x}", base, base);
        return Ok(None);
    }
    if base.checked_add(size).is_none() {
        log::warn!("Truncating memory at {:#x} to the top of the address space", base);
        size = (u64::MAX - base + 1) & !PAGE_MASK;
        if size == 0 {
            return Ok(None);
        }
    }
    memblock.add_node(base, size, RegionFlags::NONE, nid)?;
    Ok(Some((base, size)))
}
