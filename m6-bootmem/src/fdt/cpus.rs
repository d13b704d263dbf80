//! `/cpus` node.

use alloc::vec::Vec;

use super::cells::{self, CellSizes};
use super::FdtBlob;
use crate::cpu::MPIDR_HWID_BITMASK;
use crate::error::BootError;

/// A `device_type = "cpu"` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuNode<'a> {
    pub name: &'a str,
    /// MPIDR affinity from `reg`; `None` if the property is missing or
    /// has bits outside the affinity fields
    pub hwid: Option<u64>,
    /// Raw `numa-node-id`
    pub nid: Option<u32>,
    pub enable_method: Option<&'a str>,
    /// `cpu-release-addr` for spin-table CPUs
    pub release_addr: Option<u64>,
}

/// Collect the CPU nodes in device tree order (`for_each_of_cpu_node`).
///
/// # Errors
///
/// Unsupported `/cpus` cell sizes.
pub fn scan_cpus<'a>(blob: &FdtBlob<'a>) -> Result<Vec<CpuNode<'a>>, BootError> {
    let Some(cpus) = blob.fdt().find_node("/cpus") else {
        log::warn!("no /cpus node in device tree");
        return Ok(Vec::new());
    };
    let cells = CellSizes::of(&cpus).map_err(|f| blob.fault(f))?;

    let mut found = Vec::new();
    for node in cpus.children() {
        if cells::prop_str(&node, "device_type") != Some("cpu") || !cells::is_available(&node) {
            continue;
        }
        let hwid = node
            .property("reg")
            .and_then(|reg| reg.value.get(..cells.address as usize * 4))
            .and_then(|raw| cells::read_number(raw).ok())
            .filter(|hwid| {
                let ok = hwid & !MPIDR_HWID_BITMASK == 0;
                if !ok {
                    log::error!("{}: invalid reg property", node.name);
                }
                ok
            });
        found.push(CpuNode {
            name: node.name,
            hwid,
            nid: cells::prop_u32(&node, "numa-node-id"),
            enable_method: cells::prop_str(&node, "enable-method"),
            release_addr: cells::prop_number(&node, "cpu-release-addr"),
        });
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::super::early_fdt_map;
    use super::super::testutil::FdtBuilder;
    use super::*;

    #[test]
    fn test_scan_cpus() {
        let blob = FdtBuilder::with_root_cells()
            .begin("cpus")
            .prop_u32("#address-cells", 2)
            .prop_u32("#size-cells", 0)
            .begin("cpu@0")
            .prop_str("device_type", "cpu")
            .prop_u64("reg", 0)
            .prop_str("enable-method", "psci")
            .end()
            .begin("cpu@100")
            .prop_str("device_type", "cpu")
            .prop_u64("reg", 0x100)
            .prop_str("enable-method", "spin-table")
            .prop_u64("cpu-release-addr", 0x8000_fff8)
            .prop_u32("numa-node-id", 1)
            .end()
            .begin("cpu@bad")
            .prop_str("device_type", "cpu")
            .prop_u64("reg", 0x1_0000_0000_0000)
            .end()
            .begin("l2-cache")
            .prop_str("compatible", "cache")
            .end()
            .end()
            .finish();
        let fdt = early_fdt_map(0x4000_0000, Some(&blob)).unwrap();
        let cpus = scan_cpus(&fdt).unwrap();

        assert_eq!(cpus.len(), 3);
        assert_eq!(cpus[0].hwid, Some(0));
        assert_eq!(cpus[1].hwid, Some(0x100));
        assert_eq!(cpus[1].nid, Some(1));
        assert_eq!(cpus[1].enable_method, Some("spin-table"));
        assert_eq!(cpus[1].release_addr, Some(0x8000_fff8));
        assert_eq!(cpus[2].hwid, None);
    }
}
