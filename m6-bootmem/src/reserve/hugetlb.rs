//! Gigantic Page CMA Areas
//!
//! `hugetlb_cma=size` sets memory aside for 1 GiB pages that can be
//! allocated at runtime. The total is split evenly over online nodes, and
//! each node gets an area aligned to a gigantic page.

use alloc::format;
use alloc::vec::Vec;

use m6_cma::{CmaDeclaration, CmaId, CmaRegistry};
use m6_common::addr::align_up;
use m6_common::memory::{PAGE_SHIFT, PAGE_SIZE, PUD_SHIFT};
use m6_common::{NodeId, NodeMask};
use m6_memblock::Memblock;

/// Order of a gigantic page (PUD block) in frames
pub const HUGETLB_PAGE_ORDER: u32 = PUD_SHIFT - PAGE_SHIFT;

/// Areas created for gigantic pages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HugetlbCma {
    pub areas: Vec<(NodeId, CmaId)>,
    /// Bytes actually reserved
    pub reserved: u64,
}

/// Reserve per-node CMA areas for gigantic pages
/// (`arm64_hugetlb_cma_reserve`).
pub fn hugetlb_cma_reserve(
    registry: &mut CmaRegistry,
    memblock: &mut Memblock,
    online: NodeMask,
    size: u64,
) -> HugetlbCma {
    let mut out = HugetlbCma::default();
    if size == 0 || online.is_empty() {
        return out;
    }
    let gigantic = PAGE_SIZE << HUGETLB_PAGE_ORDER;
    if size < gigantic {
        log::warn!("hugetlb_cma: cma area should be at least {} MiB", gigantic >> 20);
        return out;
    }

    let per_node = size.div_ceil(u64::from(online.weight()));
    log::info!(
        "hugetlb_cma: reserve {} MiB, up to {} MiB per node",
        size >> 20,
        per_node >> 20
    );

    for nid in online.iter() {
        let node_size = align_up(per_node.min(size - out.reserved), gigantic);
        let name = format!("hugetlb{}", nid);
        let decl = CmaDeclaration {
            alignment: gigantic,
            nid: Some(nid),
            ..CmaDeclaration::new(node_size, &name)
        };
        match registry.declare_contiguous_nid(memblock, &decl) {
            Ok(id) => {
                out.areas.push((nid, id));
                out.reserved += node_size;
                log::info!("hugetlb_cma: reserved {} MiB on node {}", node_size >> 20, nid);
            }
            Err(err) => {
                log::warn!("hugetlb_cma: reservation failed: err {}, node {}", err, nid);
                continue;
            }
        }
        if out.reserved >= size {
            break;
        }
    }

    if out.reserved == 0 {
        log::warn!("hugetlb_cma: no memory reserved for gigantic pages");
    }
    out
}
