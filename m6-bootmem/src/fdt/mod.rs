//! Device Tree Ingest
//!
//! Reads the firmware-provided flattened device tree (FDT) and turns it
//! into region table edits and plain topology records.
//!
//! # Design
//!
//! Parsing is done by the `fdt` crate. Everything here only reads the
//! blob; the results are either applied to the region table directly
//! (memory, memreserve, reserved-memory) or returned as owned records
//! (CPUs, NUMA ids, distances) for later stages.
//!
//! # Scan Order
//!
//! 1. `/chosen`: command line, initrd, KASLR seed, usable range
//! 2. root cell sizes
//! 3. memory nodes, then the `/chosen` usable range cap
//! 4. reserved memory (after the linear map is fixed, see
//!    [`scan_reserved`])

mod cells;
mod chosen;
mod cpus;
mod dma;
mod memory;
mod numa;
mod reserved;
#[cfg(test)]
pub mod testutil;

use fdt::node::FdtNode;
use fdt::Fdt;

use m6_common::memory::SZ_2M;

use crate::error::{BootError, FirmwareFault};

pub use cells::CellSizes;
pub use chosen::{scan_chosen, ChosenInfo};
pub use cpus::{scan_cpus, CpuNode};
pub use dma::max_dma_cpu_address;
pub use memory::{scan_memory, MemoryNode};
pub use numa::{scan_distance_map, DistanceEntry};
pub use reserved::{scan_reserved, CmaSinks, ReservedMem, MAX_RESERVED_REGIONS};

/// Largest blob the early mapping covers.
pub const MAX_FDT_SIZE: u64 = SZ_2M;

/// A validated device tree blob and where it lives.
pub struct FdtBlob<'a> {
    fdt: Fdt<'a>,
    phys: u64,
}

impl<'a> FdtBlob<'a> {
    #[must_use]
    pub fn fdt(&self) -> &Fdt<'a> {
        &self.fdt
    }

    /// Physical address of the blob.
    #[must_use]
    pub fn phys(&self) -> u64 {
        self.phys
    }

    /// Size of the blob in bytes (`fdt_totalsize`).
    #[must_use]
    pub fn size(&self) -> u64 {
        self.fdt.total_size() as u64
    }

    /// The root node.
    ///
    /// # Errors
    ///
    /// [`FirmwareFault::Unparseable`] if the tree has no root.
    pub fn root(&self) -> Result<FdtNode<'_, 'a>, BootError> {
        self.fdt
            .find_node("/")
            .ok_or_else(|| self.fault(FirmwareFault::Unparseable))
    }

    /// Cell sizes of the root node.
    ///
    /// # Errors
    ///
    /// [`FirmwareFault::CellWidth`] for unsupported widths.
    pub fn root_cells(&self) -> Result<CellSizes, BootError> {
        CellSizes::of(&self.root()?).map_err(|f| self.fault(f))
    }

    /// Board name: `model`, else the first `compatible`.
    #[must_use]
    pub fn machine_name(&self) -> Option<&'a str> {
        let root = self.fdt.find_node("/")?;
        cells::prop_str(&root, "model").or_else(|| root.compatible().map(|c| c.first()))
    }

    pub(crate) fn fault(&self, fault: FirmwareFault) -> BootError {
        BootError::BadFirmware {
            fault,
            addr: self.phys,
        }
    }
}

/// Validate the blob handed over by the bootloader (`fixmap_remap_fdt`).
///
/// # Arguments
///
/// * `dt_phys` - physical address from the boot registers
/// * `blob` - the blob as seen through the early mapping, if any
///
/// # Errors
///
/// - [`FirmwareFault::Misaligned`] for a null or unaligned address
/// - [`FirmwareFault::Unparseable`] for a missing or corrupt blob
/// - [`FirmwareFault::TooLarge`] when the blob exceeds [`MAX_FDT_SIZE`]
pub fn early_fdt_map(dt_phys: u64, blob: Option<&[u8]>) -> Result<FdtBlob<'_>, BootError> {
    let bad = |fault| BootError::BadFirmware {
        fault,
        addr: dt_phys,
    };
    if dt_phys == 0 || dt_phys % 8 != 0 {
        return Err(bad(FirmwareFault::Misaligned));
    }
    let blob = blob.ok_or(bad(FirmwareFault::Unparseable))?;
    let fdt = Fdt::new(blob).map_err(|err| {
        log::error!("invalid device tree blob at {:#x}: {:?}", dt_phys, err);
        bad(FirmwareFault::Unparseable)
    })?;
    if fdt.total_size() as u64 > MAX_FDT_SIZE {
        return Err(bad(FirmwareFault::TooLarge));
    }
    Ok(FdtBlob { fdt, phys: dt_phys })
}

#[cfg(test)]
mod tests {
    use super::testutil::FdtBuilder;
    use super::*;

    #[test]
    fn test_early_fdt_map_checks() {
        let blob = FdtBuilder::with_root_cells()
            .prop_str("model", "m6 test board")
            .finish();

        assert!(matches!(
            early_fdt_map(0x4000_0004, Some(&blob)),
            Err(BootError::BadFirmware {
                fault: FirmwareFault::Misaligned,
                ..
            })
        ));
        assert!(matches!(
            early_fdt_map(0, Some(&blob)),
            Err(BootError::BadFirmware {
                fault: FirmwareFault::Misaligned,
                ..
            })
        ));
        assert!(matches!(
            early_fdt_map(0x4000_0000, Some(&blob[..20])),
            Err(BootError::BadFirmware {
                fault: FirmwareFault::Unparseable,
                ..
            })
        ));

        let fdt = early_fdt_map(0x4000_0000, Some(&blob)).unwrap();
        assert_eq!(fdt.size(), blob.len() as u64);
        assert_eq!(fdt.machine_name(), Some("m6 test board"));
        assert_eq!(
            fdt.root_cells().unwrap(),
            CellSizes {
                address: 2,
                size: 2
            }
        );
    }

    #[test]
    fn test_machine_name_falls_back_to_compatible() {
        let blob = FdtBuilder::new()
            .prop_strs("compatible", &["vendor,board", "vendor,soc"])
            .finish();
        let fdt = early_fdt_map(0x4000_0000, Some(&blob)).unwrap();
        assert_eq!(fdt.machine_name(), Some("vendor,board"));
        assert_eq!(fdt.root_cells().unwrap(), CellSizes::DEFAULT);
    }
}
