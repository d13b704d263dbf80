//! `numa-distance-map-v1` node.

use alloc::vec::Vec;

use super::cells;
use super::FdtBlob;
use crate::error::{BootError, FirmwareFault};

/// One `<from to distance>` triple of a distance matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistanceEntry {
    pub from: u32,
    pub to: u32,
    pub distance: u32,
}

/// Read the distance matrix, if the tree has one.
///
/// A trailing partial triple is ignored.
///
/// # Errors
///
/// [`FirmwareFault::MissingProperty`] if a distance map node has no
/// `distance-matrix`.
pub fn scan_distance_map(blob: &FdtBlob<'_>) -> Result<Option<Vec<DistanceEntry>>, BootError> {
    let Some(map) = blob
        .fdt()
        .all_nodes()
        .find(|n| cells::is_compatible(n, "numa-distance-map-v1"))
    else {
        return Ok(None);
    };
    let Some(matrix) = cells::prop_u32_list(&map, "distance-matrix").filter(|m| !m.is_empty())
    else {
        log::error!("No distance-matrix property in distance-map");
        return Err(blob.fault(FirmwareFault::MissingProperty));
    };

    Ok(Some(
        matrix
            .chunks_exact(3)
            .map(|t| DistanceEntry {
                from: t[0],
                to: t[1],
                distance: t[2],
            })
            .collect(),
    ))
}
