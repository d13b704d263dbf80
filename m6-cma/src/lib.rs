//! # m6-cma
//!
//! Contiguous Memory Allocator for M6.
//!
//! CMA areas are carved out of the boot region table, stay reserved from
//! the page allocator's point of view, and are lent to movable allocations
//! until a driver needs a physically contiguous run. This crate provides:
//!
//! - [`CmaRegistry`]: boot-time declaration and activation of areas
//! - [`CmaArea`]: runtime `alloc`/`release` over a locked occupancy bitmap
//! - [`DmaContiguous`]: default, per-node and per-device pools for DMA
//! - [`ContigRange`]: the seam to the page allocator's migration code
//!
//! # no_std
//!
//! This crate is `#![no_std]` and uses `alloc` for bitmaps and names.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

mod area;
mod bitmap;
pub mod dma;
mod error;
mod migrate;
mod ratelimit;
mod registry;

pub use area::{CmaArea, CmaId, CmaStats, MAX_BUSY_RETRIES};
pub use bitmap::CmaBitmap;
pub use dma::{CmaCmdline, DmaContiguous, DmaDevice, FreedTo, PoolSetup, ReservedPool};
pub use error::CmaError;
pub use migrate::{ContigRange, GfpFlags, MigrateError};
pub use ratelimit::Ratelimit;
pub use registry::{CmaDeclaration, CmaRegistry, CMA_MIN_ALIGNMENT, DEFAULT_MAX_AREAS};
