//! `/chosen` node.

use super::cells;
use super::FdtBlob;
use crate::error::BootError;

/// Boot information handed over in `/chosen`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChosenInfo<'a> {
    /// `bootargs`, empty when absent
    pub bootargs: &'a str,
    /// Physical `[start, end)` of the initial ramdisk
    pub initrd: Option<(u64, u64)>,
    /// `kaslr-seed`, 0 when absent
    pub kaslr_seed: u64,
    /// `linux,usable-memory-range` as `(base, size)`
    pub usable_range: Option<(u64, u64)>,
}

/// Read `/chosen` (`early_init_dt_scan_chosen`).
///
/// A missing `/chosen` yields the defaults.
///
/// # Errors
///
/// Malformed `linux,usable-memory-range` or unsupported root cells.
pub fn scan_chosen<'a>(blob: &FdtBlob<'a>) -> Result<ChosenInfo<'a>, BootError> {
    let Some(chosen) = blob
        .fdt()
        .find_node("/chosen")
        .or_else(|| blob.fdt().find_node("/chosen@0"))
    else {
        return Ok(ChosenInfo::default());
    };
    let root = blob.root_cells()?;

    let initrd = match (
        cells::prop_number(&chosen, "linux,initrd-start"),
        cells::prop_number(&chosen, "linux,initrd-end"),
    ) {
        (Some(start), Some(end)) if end > start => {
            log::debug!("initrd_start={:#x}  initrd_end={:#x}", start, end);
            Some((start, end))
        }
        _ => None,
    };

    let usable_range = match chosen.property("linux,usable-memory-range") {
        Some(prop) => {
            let ranges = cells::read_reg(prop.value, root).map_err(|f| blob.fault(f))?;
            ranges.first().copied()
        }
        None => None,
    };

    let bootargs = cells::prop_str(&chosen, "bootargs").unwrap_or("");
    log::debug!("Command line is: {}", bootargs);

    Ok(ChosenInfo {
        bootargs,
        initrd,
        kaslr_seed: cells::prop_number(&chosen, "kaslr-seed").unwrap_or(0),
        usable_range,
    })
}
