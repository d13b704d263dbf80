//! Late Boot Reservations
//!
//! Reservations made after NUMA nodes are known but before the page
//! allocator takes over:
//!
//! - [`hugetlb_cma_reserve`]: per-node CMA areas for gigantic pages
//! - [`kvm_hyp_reserve`]: the protected hypervisor's private pool
//! - [`reserve_crashkernel`]: memory for a kdump kernel
//!
//! Each of them only grows the reserved table. A failed CMA or crash
//! kernel reservation is logged and boot continues; the hypervisor pool
//! is required once protected mode was asked for.

mod crash;
mod hugetlb;
mod hyp;

pub use crash::{parse_crashkernel, reserve_crashkernel, CrashKernel, CRASH_ALIGN};
pub use hugetlb::{hugetlb_cma_reserve, HugetlbCma, HUGETLB_PAGE_ORDER};
pub use hyp::{hyp_pgtable_max_pages, kvm_hyp_reserve, HypMemory, HYP_MEMBLOCK_REGIONS};
