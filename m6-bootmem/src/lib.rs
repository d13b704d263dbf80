//! # m6-bootmem
//!
//! Boot-time physical memory bring-up for arm64.
//!
//! Starting from the device tree the bootloader handed over, this crate
//! builds everything the page allocator needs before it can run:
//!
//! - [`fdt`]: memory, CPU, NUMA and reserved-memory ingest
//! - [`archinit`]: linear map placement and the region table cuts it implies
//! - [`numa`]: node binding, node data and the distance table
//! - [`sparse`]: the section table and per-section memory maps
//! - [`zones`]: DMA, DMA32 and Normal limits and per-node zone sizes
//! - [`reserve`]: gigantic page CMA, protected KVM and crash kernel pools
//! - [`boot`]: the pipeline tying the stages together, frozen into a
//!   [`System`]
//!
//! The region table lives in `m6-memblock` and the contiguous allocator in
//! `m6-cma`.
//!
//! # no_std
//!
//! This crate is `#![no_std]` and uses `alloc`. Everything except CPU
//! feature detection builds on any host, so the pipeline is tested with
//! synthetic device trees.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod archinit;
pub mod boot;
pub mod cmdline;
pub mod config;
pub mod cpu;
pub mod error;
pub mod fdt;
pub mod layout;
pub mod logging;
pub mod numa;
pub mod reserve;
pub mod smp;
pub mod sparse;
pub mod zones;

#[cfg(test)]
mod scenarios;

pub use boot::{boot, publish, system, BootArgs, BootCtx, Bootmem, Platform, System};
pub use cmdline::{BootParams, KvmMode};
pub use config::KernelConfig;
pub use cpu::BootCpu;
pub use error::{fatal, BootError, BootFailure, BootStage, FirmwareFault};
pub use layout::{KernelImage, LinearMap};
