//! # m6-common
//!
//! Shared types and constants for the M6 boot memory crates.
//!
//! - [`Pa`], [`Va`], [`Pfn`]: physical address, virtual address and page
//!   frame newtypes with explicit conversions
//! - [`NodeId`], [`NodeMask`]: NUMA node identifiers
//! - [`memory`]: granule, section and buddy geometry constants
//! - [`size`]: the `memparse` size grammar used by kernel parameters
//!
//! # no_std
//!
//! This crate is `#![no_std]` and has zero dependencies, making it suitable
//! as a foundation crate that all other M6 crates can depend on.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod addr;
pub mod memory;
pub mod numa;
pub mod size;

// Re-export commonly used types
pub use addr::{Pa, Pfn, Va};
pub use numa::{NodeId, NodeMask};
