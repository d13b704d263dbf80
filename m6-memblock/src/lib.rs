//! # m6-memblock
//!
//! Boot-time physical region table for M6.
//!
//! Firmware ingest fills [`Memblock`] with RAM ranges, arch init trims it to
//! what the linear map can reach, and every early consumer (NUMA node data,
//! sparse section maps, CMA pools, crash kernel, hypervisor pool) carves its
//! memory out of it before the page allocator takes over.
//!
//! # no_std
//!
//! This crate is `#![no_std]` and uses `alloc` for the region arrays.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

mod error;
mod memblock;
mod region;
mod table;

pub use error::MemblockError;
pub use memblock::{Memblock, RangeKind, ALLOC_ACCESSIBLE, ALLOC_ANYWHERE};
pub use region::{PhysRange, RegionFlags};
