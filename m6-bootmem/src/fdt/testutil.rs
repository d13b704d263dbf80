//! Flattened device tree writer for tests.

use alloc::string::String;
use alloc::vec::Vec;

const FDT_MAGIC: u32 = 0xd00d_feed;
const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_END: u32 = 9;
const HEADER_SIZE: usize = 40;

/// Builds a version 17 blob node by node.
#[derive(Default)]
pub struct FdtBuilder {
    rsvmap: Vec<(u64, u64)>,
    structs: Vec<u8>,
    strings: Vec<u8>,
    depth: usize,
}

impl FdtBuilder {
    /// Start a blob with an open root node.
    pub fn new() -> Self {
        let mut b = Self::default();
        b.begin("");
        b
    }

    /// Start a blob whose root uses 2 address and 2 size cells.
    pub fn with_root_cells() -> Self {
        let mut b = Self::new();
        b.prop_u32("#address-cells", 2).prop_u32("#size-cells", 2);
        b
    }

    /// Add a `/memreserve/` entry.
    pub fn memreserve(&mut self, addr: u64, size: u64) -> &mut Self {
        self.rsvmap.push((addr, size));
        self
    }

    pub fn begin(&mut self, name: &str) -> &mut Self {
        self.word(FDT_BEGIN_NODE);
        self.structs.extend_from_slice(name.as_bytes());
        self.structs.push(0);
        self.pad();
        self.depth += 1;
        self
    }

    pub fn end(&mut self) -> &mut Self {
        self.word(FDT_END_NODE);
        self.depth -= 1;
        self
    }

    pub fn prop(&mut self, name: &str, value: &[u8]) -> &mut Self {
        let nameoff = self.string_offset(name);
        self.word(FDT_PROP);
        self.word(value.len() as u32);
        self.word(nameoff);
        self.structs.extend_from_slice(value);
        self.pad();
        self
    }

    pub fn prop_empty(&mut self, name: &str) -> &mut Self {
        self.prop(name, &[])
    }

    pub fn prop_u32(&mut self, name: &str, value: u32) -> &mut Self {
        self.prop(name, &value.to_be_bytes())
    }

    pub fn prop_u64(&mut self, name: &str, value: u64) -> &mut Self {
        self.prop(name, &value.to_be_bytes())
    }

    pub fn prop_cells(&mut self, name: &str, cells: &[u32]) -> &mut Self {
        let raw: Vec<u8> = cells.iter().flat_map(|c| c.to_be_bytes()).collect();
        self.prop(name, &raw)
    }

    pub fn prop_str(&mut self, name: &str, value: &str) -> &mut Self {
        let mut raw: Vec<u8> = value.as_bytes().to_vec();
        raw.push(0);
        self.prop(name, &raw)
    }

    pub fn prop_strs(&mut self, name: &str, values: &[&str]) -> &mut Self {
        let mut raw = Vec::new();
        for v in values {
            raw.extend_from_slice(v.as_bytes());
            raw.push(0);
        }
        self.prop(name, &raw)
    }

    /// A `reg`-style property with 2 address and 2 size cells per tuple.
    pub fn prop_reg(&mut self, name: &str, ranges: &[(u64, u64)]) -> &mut Self {
        let raw: Vec<u8> = ranges
            .iter()
            .flat_map(|(base, size)| base.to_be_bytes().into_iter().chain(size.to_be_bytes()))
            .collect();
        self.prop(name, &raw)
    }

    /// Close any open nodes and produce the blob.
    pub fn finish(&mut self) -> Vec<u8> {
        while self.depth > 0 {
            self.end();
        }
        self.word(FDT_END);

        let off_rsvmap = HEADER_SIZE;
        let rsvmap_len = (self.rsvmap.len() + 1) * 16;
        let off_struct = off_rsvmap + rsvmap_len;
        let off_strings = off_struct + self.structs.len();
        let total = off_strings + self.strings.len();

        let mut out = Vec::with_capacity(total);
        for word in [
            FDT_MAGIC,
            total as u32,
            off_struct as u32,
            off_strings as u32,
            off_rsvmap as u32,
            17,
            16,
            0,
            self.strings.len() as u32,
            self.structs.len() as u32,
        ] {
            out.extend_from_slice(&word.to_be_bytes());
        }
        for (addr, size) in self.rsvmap.iter().chain(core::iter::once(&(0, 0))) {
            out.extend_from_slice(&addr.to_be_bytes());
            out.extend_from_slice(&size.to_be_bytes());
        }
        out.extend_from_slice(&self.structs);
        out.extend_from_slice(&self.strings);
        out
    }

    fn word(&mut self, value: u32) {
        self.structs.extend_from_slice(&value.to_be_bytes());
    }

    fn pad(&mut self) {
        while self.structs.len() % 4 != 0 {
            self.structs.push(0);
        }
    }

    fn string_offset(&mut self, name: &str) -> u32 {
        let mut needle = String::from(name);
        needle.push('\0');
        let hay = &self.strings;
        let found = (0..hay.len())
            .filter(|&i| i == 0 || hay[i - 1] == 0)
            .find(|&i| hay[i..].starts_with(needle.as_bytes()));
        match found {
            Some(off) => off as u32,
            None => {
                let off = self.strings.len() as u32;
                self.strings.extend_from_slice(needle.as_bytes());
                off
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_output_parses() {
        let blob = FdtBuilder::with_root_cells()
            .prop_str("model", "test board")
            .begin("memory@80000000")
            .prop_str("device_type", "memory")
            .prop_reg("reg", &[(0x8000_0000, 0x4000_0000)])
            .end()
            .memreserve(0x8100_0000, 0x1000)
            .finish();
        let fdt = fdt::Fdt::new(&blob).unwrap();
        assert_eq!(fdt.total_size(), blob.len());
        let mem = fdt.find_node("/memory@80000000").unwrap();
        assert_eq!(mem.property("reg").unwrap().value.len(), 16);
        assert_eq!(fdt.memory_reservations().count(), 1);
    }
}
