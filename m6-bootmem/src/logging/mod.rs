//! Boot Logging
//!
//! A `log` backend usable before any driver exists. Records go to a
//! lock-free ring (drained later by the console driver) and, while the
//! early console is enabled, straight to a raw output function supplied by
//! the platform.

pub mod buffer;
mod logger;

pub use logger::{disable_early_console, init, set_early_console};
