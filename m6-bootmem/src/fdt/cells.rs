//! Property decoding helpers.
//!
//! The `fdt` crate hands out raw property bytes; cell counts come from the
//! parent node, which the crate does not track, so callers pass them in.

use alloc::vec::Vec;

use fdt::node::FdtNode;

use crate::error::FirmwareFault;

/// `#address-cells` / `#size-cells` governing a node's children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellSizes {
    pub address: u32,
    pub size: u32,
}

impl CellSizes {
    /// Values assumed when a node carries no cell properties
    pub const DEFAULT: Self = Self {
        address: 2,
        size: 1,
    };

    /// Read the cell sizes a node declares for its children.
    ///
    /// # Errors
    ///
    /// [`FirmwareFault::CellWidth`] when a value does not fit in 64 bits or
    /// an address has no cells.
    pub fn of(node: &FdtNode<'_, '_>) -> Result<Self, FirmwareFault> {
        let address = prop_u32(node, "#address-cells").unwrap_or(Self::DEFAULT.address);
        let size = prop_u32(node, "#size-cells").unwrap_or(Self::DEFAULT.size);
        if !(1..=2).contains(&address) || size > 2 {
            log::error!(
                "{}: unsupported #address-cells={} #size-cells={}",
                node_name(node),
                address,
                size
            );
            return Err(FirmwareFault::CellWidth);
        }
        Ok(Self { address, size })
    }

    /// Read the cell sizes without range checks, for walks that only need
    /// to step over wide addresses (PCI buses use 3 address cells).
    #[must_use]
    pub fn raw(node: &FdtNode<'_, '_>) -> Self {
        Self {
            address: prop_u32(node, "#address-cells").unwrap_or(Self::DEFAULT.address),
            size: prop_u32(node, "#size-cells").unwrap_or(Self::DEFAULT.size),
        }
    }

    /// Bytes in one `(address, size)` tuple.
    #[inline]
    #[must_use]
    pub const fn tuple_bytes(&self) -> usize {
        (self.address + self.size) as usize * 4
    }
}

/// Decode a big-endian number of 0, 1 or 2 cells.
///
/// # Errors
///
/// [`FirmwareFault::CellWidth`] for wider values, [`FirmwareFault::BadReg`]
/// when `bytes` is not a whole number of cells.
pub fn read_number(bytes: &[u8]) -> Result<u64, FirmwareFault> {
    match bytes.len() {
        0 => Ok(0),
        4 => Ok(u64::from(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))),
        8 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            Ok(u64::from_be_bytes(raw))
        }
        n if n % 4 == 0 => Err(FirmwareFault::CellWidth),
        _ => Err(FirmwareFault::BadReg),
    }
}

/// Split a `reg`-style value into `(base, size)` pairs.
///
/// # Errors
///
/// [`FirmwareFault::BadReg`] if the value is not a whole number of tuples.
pub fn read_reg(value: &[u8], cells: CellSizes) -> Result<Vec<(u64, u64)>, FirmwareFault> {
    let tuple = cells.tuple_bytes();
    if value.len() % tuple != 0 {
        return Err(FirmwareFault::BadReg);
    }
    let split = cells.address as usize * 4;
    value
        .chunks_exact(tuple)
        .map(|chunk| Ok((read_number(&chunk[..split])?, read_number(&chunk[split..])?)))
        .collect()
}

/// Read a one-cell property.
#[must_use]
pub fn prop_u32(node: &FdtNode<'_, '_>, name: &str) -> Option<u32> {
    let value = node.property(name)?.value;
    let raw: [u8; 4] = value.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(raw))
}

/// Read a property holding one number of 1 or 2 cells.
#[must_use]
pub fn prop_number(node: &FdtNode<'_, '_>, name: &str) -> Option<u64> {
    let value = node.property(name)?.value;
    match value.len() {
        4 | 8 => read_number(value).ok(),
        _ => None,
    }
}

/// Read a property holding exactly `cells` cells.
///
/// # Returns
///
/// `Ok(None)` if the property is absent.
///
/// # Errors
///
/// [`FirmwareFault::BadReg`] on a length mismatch.
pub fn prop_cells(
    node: &FdtNode<'_, '_>,
    name: &str,
    cells: u32,
) -> Result<Option<u64>, FirmwareFault> {
    let Some(prop) = node.property(name) else {
        return Ok(None);
    };
    if prop.value.len() != cells as usize * 4 {
        log::error!("{}: invalid {} property", node_name(node), name);
        return Err(FirmwareFault::BadReg);
    }
    read_number(prop.value).map(Some)
}

/// Read a list of one-cell values.
#[must_use]
pub fn prop_u32_list(node: &FdtNode<'_, '_>, name: &str) -> Option<Vec<u32>> {
    let value = node.property(name)?.value;
    Some(
        value
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

#[must_use]
pub fn has_prop(node: &FdtNode<'_, '_>, name: &str) -> bool {
    node.property(name).is_some()
}

/// Read a string property, without its terminator.
#[must_use]
pub fn prop_str<'a>(node: &FdtNode<'_, 'a>, name: &str) -> Option<&'a str> {
    let value = node.property(name)?.value;
    let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
    core::str::from_utf8(&value[..end]).ok()
}

/// A node is usable unless its `status` says otherwise.
#[must_use]
pub fn is_available(node: &FdtNode<'_, '_>) -> bool {
    matches!(prop_str(node, "status"), None | Some("okay" | "ok"))
}

#[must_use]
pub fn is_compatible(node: &FdtNode<'_, '_>, compat: &str) -> bool {
    node.compatible().is_some_and(|c| c.all().any(|s| s == compat))
}

/// Node name for log messages.
#[must_use]
pub fn node_name<'a>(node: &FdtNode<'_, 'a>) -> &'a str {
    if node.name.is_empty() { "/" } else { node.name }
}
