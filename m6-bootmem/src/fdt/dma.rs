//! `dma-ranges` limits.

use fdt::node::FdtNode;

use m6_common::memory::PHYS_ADDR_MAX;

use super::cells::{self, CellSizes};
use super::FdtBlob;

/// Highest CPU address any DMA master can reach
/// (`of_dma_get_max_cpu_address`).
///
/// Walks every available node below the root and takes the smallest
/// limit implied by a `dma-ranges` property. Parent bus addresses are used
/// as CPU addresses, which holds for the identity-mapped buses found on
/// arm64 boards. Returns [`PHYS_ADDR_MAX`] if no node restricts DMA.
#[must_use]
pub fn max_dma_cpu_address(blob: &FdtBlob<'_>) -> u64 {
    let Some(root) = blob.fdt().find_node("/") else {
        return PHYS_ADDR_MAX;
    };
    let cells = CellSizes::raw(&root);
    subtree_limit(&root, cells, cells)
}

fn subtree_limit(node: &FdtNode<'_, '_>, parent: CellSizes, own: CellSizes) -> u64 {
    let mut limit = PHYS_ADDR_MAX;

    if let Some(prop) = node.property("dma-ranges").filter(|p| !p.value.is_empty()) {
        let child_bytes = own.address as usize * 4;
        let parent_bytes = parent.address as usize * 4;
        let size_bytes = own.size as usize * 4;
        let tuple = (child_bytes + parent_bytes + size_bytes).max(4);

        let mut cpu_end = 0u64;
        for chunk in prop.value.chunks_exact(tuple) {
            let cpu = cells::read_number(&chunk[child_bytes..child_bytes + parent_bytes]);
            let size = cells::read_number(&chunk[child_bytes + parent_bytes..]);
            if let (Ok(cpu), Ok(size)) = (cpu, size) {
                if size != 0 {
                    cpu_end = cpu_end.max(cpu.saturating_add(size - 1));
                }
            }
        }
        limit = limit.min(cpu_end);
    }

    for child in node.children() {
        if !cells::is_available(&child) {
            continue;
        }
        let child_cells = CellSizes::raw(&child);
        limit = limit.min(subtree_limit(&child, own, child_cells));
    }
    limit
}

#[cfg(test)]
mod tests {
    use super::super::early_fdt_map;
    use super::super::testutil::FdtBuilder;
    use super::*;

    #[test]
    fn test_no_dma_ranges() {
        let blob = FdtBuilder::with_root_cells().finish();
        let fdt = early_fdt_map(0x4000_0000, Some(&blob)).unwrap();
        assert_eq!(max_dma_cpu_address(&fdt), PHYS_ADDR_MAX);
    }

    #[test]
    fn test_nested_dma_ranges() {
        let blob = FdtBuilder::with_root_cells()
            .begin("soc")
            .prop_u32("#address-cells", 2)
            .prop_u32("#size-cells", 2)
            // 1 GiB window at CPU address 0
            .prop_cells("dma-ranges", &[0, 0, 0, 0, 0, 0x4000_0000])
            .begin("bus")
            .prop_u32("#address-cells", 1)
            .prop_u32("#size-cells", 1)
            .end()
            .end()
            .begin("disabled")
            .prop_str("status", "disabled")
            .prop_u32("#address-cells", 2)
            .prop_u32("#size-cells", 2)
            .prop_cells("dma-ranges", &[0, 0, 0, 0, 0, 0x1000])
            .end()
            .finish();
        let fdt = early_fdt_map(0x4000_0000, Some(&blob)).unwrap();
        assert_eq!(max_dma_cpu_address(&fdt), 0x3fff_ffff);
    }
}
