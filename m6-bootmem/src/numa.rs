//! NUMA Node Binding
//!
//! Binds memory ranges and CPUs to nodes, fills the distance table and
//! allocates per-node data.
//!
//! # Design
//!
//! Initialisation is attempted with the firmware description first. Any
//! inconsistency in it (a bad distance, an out of range id, a memory range
//! left without a node) abandons the attempt and the whole of RAM is
//! registered as node 0 instead, with NUMA switched off. Only failures
//! that leave no way forward, such as an unplaceable node data block, are
//! reported to the caller.
//!
//! # Distance Table
//!
//! A `MAX_NUMNODES` square of bytes allocated from the region table,
//! defaulting to [`LOCAL_DISTANCE`] on the diagonal and
//! [`REMOTE_DISTANCE`] elsewhere.

use alloc::vec;
use alloc::vec::Vec;

use m6_common::memory::{PAGE_SIZE, SMP_CACHE_BYTES};
use m6_common::numa::{LOCAL_DISTANCE, MAX_NUMNODES, REMOTE_DISTANCE};
use m6_common::{NodeId, NodeMask, Pa, Pfn};
use m6_memblock::{Memblock, RangeKind, ALLOC_ACCESSIBLE};

use crate::error::{BootError, FirmwareFault};
use crate::fdt::{DistanceEntry, MemoryNode};
use crate::smp::{CpuMask, CpuTopology};
use crate::zones::{Zone, NR_ZONES};

/// Bytes reserved for each node's data (`sizeof(pg_data_t)` rounded to a
/// cache line).
pub const PGLIST_DATA_SIZE: u64 = 6144;

const DISTANCE_TABLE_SIZE: u64 = (MAX_NUMNODES * MAX_NUMNODES) as u64;

/// Per-node data (`pg_data_t`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    pub id: NodeId,
    /// Where the structure itself lives
    pub phys: u64,
    pub start_pfn: Pfn,
    /// Frames from the node's first to its last bound frame, holes included
    pub spanned_pages: u64,
    /// Frames of memory bound to the node; filled in by the zone planner
    pub present_pages: u64,
    pub zones: [Zone; NR_ZONES],
}

impl NodeData {
    #[inline]
    #[must_use]
    pub fn end_pfn(&self) -> Pfn {
        self.start_pfn.add(self.spanned_pages)
    }
}

/// Distance map as found in the device tree.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DistanceMap {
    #[default]
    Absent,
    Entries(Vec<DistanceEntry>),
    /// A distance map node that could not be read
    Malformed,
}

/// NUMA description gathered from the device tree.
#[derive(Debug, Clone, Default)]
pub struct NumaFirmware {
    /// Raw `numa-node-id` of each CPU node carrying one
    pub cpu_nids: Vec<u32>,
    pub memory: Vec<MemoryNode>,
    pub distances: DistanceMap,
}

/// NUMA state (`numa_distance`, `node_data`, node maps).
#[derive(Debug, Clone)]
pub struct Numa {
    distance: Vec<u8>,
    distance_cnt: usize,
    distance_phys: Option<u64>,
    parsed: NodeMask,
    online: NodeMask,
    possible: NodeMask,
    numa_off: bool,
    node_data: Vec<Option<NodeData>>,
    cpu_to_node: Vec<NodeId>,
    node_cpus: [CpuMask; MAX_NUMNODES],
}

impl Numa {
    /// State before initialisation; `numa_off` comes from `numa=off`.
    #[must_use]
    pub fn new(numa_off: bool) -> Self {
        Self {
            distance: Vec::new(),
            distance_cnt: 0,
            distance_phys: None,
            parsed: NodeMask::EMPTY,
            online: NodeMask::EMPTY,
            possible: NodeMask::EMPTY,
            numa_off,
            node_data: vec![None; MAX_NUMNODES],
            cpu_to_node: vec![NodeId::ZERO; m6_common::memory::NR_CPUS],
            node_cpus: [CpuMask::EMPTY; MAX_NUMNODES],
        }
    }

    /// Bind memory to nodes and register them (`arch_numa_init`).
    ///
    /// # Arguments
    ///
    /// * `firmware` - device tree description, `None` when the build has
    ///   no NUMA support
    /// * `strict` - reject distance maps that end up asymmetric
    /// * `max_pfn` - end of RAM; tables are allocated below it
    ///
    /// # Errors
    ///
    /// [`BootError::OutOfAddressSpace`] when node data or the distance
    /// table cannot be placed even for the single fallback node.
    pub fn init(
        &mut self,
        memblock: &mut Memblock,
        firmware: Option<&NumaFirmware>,
        strict: bool,
        max_pfn: Pfn,
    ) -> Result<(), BootError> {
        if let Some(fw) = firmware.filter(|_| !self.numa_off) {
            match self.try_init(memblock, max_pfn, |numa, mb| numa.of_numa_init(mb, fw, strict)) {
                Ok(()) => return Ok(()),
                Err(err @ BootError::OutOfAddressSpace { what: "node data", .. }) => return Err(err),
                Err(err) => log::debug!("firmware NUMA description rejected: {}", err),
            }
        }
        self.try_init(memblock, max_pfn, Self::dummy_init)
    }

    /// `numa_init`
    fn try_init(
        &mut self,
        memblock: &mut Memblock,
        max_pfn: Pfn,
        init: impl FnOnce(&mut Self, &mut Memblock) -> Result<(), BootError>,
    ) -> Result<(), BootError> {
        self.parsed = NodeMask::EMPTY;
        self.possible = NodeMask::EMPTY;
        self.online = NodeMask::EMPTY;

        self.alloc_distance(memblock, max_pfn)?;
        let result = init(self, memblock).and_then(|()| {
            if self.parsed.is_empty() {
                log::info!("No NUMA configuration found");
                return Err(BootError::NoNumaConfig);
            }
            self.register_nodes(memblock)
        });
        if result.is_err() {
            self.free_distance(memblock);
        }
        result
    }

    fn alloc_distance(&mut self, memblock: &mut Memblock, max_pfn: Pfn) -> Result<(), BootError> {
        let phys = memblock
            .alloc_range(DISTANCE_TABLE_SIZE, PAGE_SIZE, 0, max_pfn.phys().as_u64(), None)
            .map_err(|_| {
                log::warn!("cannot allocate the NUMA distance table");
                BootError::OutOfAddressSpace {
                    what: "distance table",
                    size: DISTANCE_TABLE_SIZE,
                }
            })?;
        self.distance_phys = Some(phys);
        self.distance_cnt = MAX_NUMNODES;
        self.distance = (0..MAX_NUMNODES * MAX_NUMNODES)
            .map(|i| {
                if i / MAX_NUMNODES == i % MAX_NUMNODES {
                    LOCAL_DISTANCE
                } else {
                    REMOTE_DISTANCE
                }
            })
            .collect();
        log::debug!("Initialized distance table, cnt={}", self.distance_cnt);
        Ok(())
    }

    fn free_distance(&mut self, memblock: &mut Memblock) {
        if let Some(phys) = self.distance_phys.take() {
            memblock.free(phys, DISTANCE_TABLE_SIZE);
        }
        self.distance.clear();
        self.distance_cnt = 0;
    }

    /// `of_numa_init`
    fn of_numa_init(
        &mut self,
        memblock: &mut Memblock,
        fw: &NumaFirmware,
        strict: bool,
    ) -> Result<(), BootError> {
        for &nid in &fw.cpu_nids {
            log::debug!("CPU on {}", nid);
            match NodeId::new(nid) {
                Some(nid) => self.parsed.set(nid),
                None => log::warn!("Node id {} exceeds maximum value", nid),
            }
        }

        for mem in &fw.memory {
            let Some(raw) = mem.nid else {
                continue;
            };
            let Some(nid) = NodeId::new(raw) else {
                log::warn!("Node id {} exceeds maximum value", raw);
                log::error!("bad property in memory node");
                return Err(BootError::NodeOutOfRange { nid: raw });
            };
            memblock.set_node(mem.base, mem.size, Some(nid), RangeKind::Memory);
            self.parsed.set(nid);
        }

        match &fw.distances {
            DistanceMap::Absent => Ok(()),
            DistanceMap::Malformed => Err(BootError::BadFirmware {
                fault: FirmwareFault::MissingProperty,
                addr: 0,
            }),
            DistanceMap::Entries(entries) => self.parse_distance_map(entries, strict),
        }
    }

    /// `of_numa_parse_distance_map_v1`
    fn parse_distance_map(&mut self, entries: &[DistanceEntry], strict: bool) -> Result<(), BootError> {
        log::info!("parsing numa-distance-map-v1");
        let mut explicit = [[false; MAX_NUMNODES]; MAX_NUMNODES];
        for e in entries {
            if NodeId::new(e.from).is_some() && NodeId::new(e.to).is_some() {
                explicit[e.from as usize][e.to as usize] = true;
            }
        }

        for e in entries {
            let invalid = (e.from == e.to && e.distance != u32::from(LOCAL_DISTANCE))
                || (e.from != e.to && e.distance <= u32::from(LOCAL_DISTANCE))
                || e.distance > u32::from(u8::MAX);
            let (Some(from), Some(to)) = (NodeId::new(e.from), NodeId::new(e.to)) else {
                log::warn!(
                    "Warning: node ids are out of bound, from={} to={} distance={}",
                    e.from,
                    e.to,
                    e.distance
                );
                return Err(BootError::InvalidDistance {
                    from: e.from,
                    to: e.to,
                    distance: e.distance,
                });
            };
            if invalid {
                log::error!("Invalid distance[node{} -> node{}] = {}", e.from, e.to, e.distance);
                return Err(BootError::InvalidDistance {
                    from: e.from,
                    to: e.to,
                    distance: e.distance,
                });
            }

            self.set_distance(from, to, e.distance as u8);
            if e.to > e.from && !explicit[to.index()][from.index()] {
                self.set_distance(to, from, e.distance as u8);
            }
        }

        if strict {
            for a in 0..MAX_NUMNODES {
                for b in a + 1..MAX_NUMNODES {
                    let ab = self.distance[a * self.distance_cnt + b];
                    let ba = self.distance[b * self.distance_cnt + a];
                    if ab != ba {
                        log::error!("Asymmetric distance between node{} and node{}: {} != {}", a, b, ab, ba);
                        return Err(BootError::InvalidDistance {
                            from: a as u32,
                            to: b as u32,
                            distance: u32::from(ab),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn set_distance(&mut self, from: NodeId, to: NodeId, distance: u8) {
        if from.index() >= self.distance_cnt || to.index() >= self.distance_cnt {
            return;
        }
        self.distance[from.index() * self.distance_cnt + to.index()] = distance;
    }

    /// `dummy_numa_init`
    fn dummy_init(&mut self, memblock: &mut Memblock) -> Result<(), BootError> {
        if self.numa_off {
            log::info!("NUMA disabled");
        }
        let start = memblock.start_of_dram();
        let end = memblock.end_of_dram();
        log::info!("Faking a node at [mem {:#018x}-{:#018x}]", start, end.wrapping_sub(1));
        memblock.set_node(start, end - start, Some(NodeId::ZERO), RangeKind::Memory);
        self.parsed.set(NodeId::ZERO);
        self.numa_off = true;
        Ok(())
    }

    /// `numa_register_nodes`
    fn register_nodes(&mut self, memblock: &mut Memblock) -> Result<(), BootError> {
        if let Some(r) = memblock.memory().iter().find(|r| r.nid.is_none()) {
            log::warn!(
                "Warning: invalid memblk node -1 [mem {:#010x}-{:#010x}]",
                r.base,
                r.end() - 1
            );
            return Err(BootError::UnboundMemory { base: r.base });
        }

        let parsed = self.parsed;
        for nid in parsed.iter() {
            let (start, end) = memblock
                .get_pfn_range_for_nid(nid)
                .unwrap_or((Pfn(0), Pfn(0)));
            self.setup_node_data(memblock, nid, start, end)?;
            self.online.set(nid);
        }
        self.possible = self.parsed;
        Ok(())
    }

    /// `setup_node_data`
    fn setup_node_data(
        &mut self,
        memblock: &mut Memblock,
        nid: NodeId,
        start: Pfn,
        end: Pfn,
    ) -> Result<(), BootError> {
        if start >= end {
            log::info!("Initmem setup node {} [<memory-less node>]", nid);
        }
        let phys = memblock
            .alloc_range(PGLIST_DATA_SIZE, SMP_CACHE_BYTES, 0, ALLOC_ACCESSIBLE, Some(nid))
            .map_err(|_| {
                log::error!("Cannot allocate {} bytes for node {} data", PGLIST_DATA_SIZE, nid);
                BootError::OutOfAddressSpace {
                    what: "node data",
                    size: PGLIST_DATA_SIZE,
                }
            })?;
        log::info!(
            "NODE_DATA [mem {:#010x}-{:#010x}]",
            phys,
            phys + PGLIST_DATA_SIZE - 1
        );

        let home = memblock
            .memory()
            .iter()
            .find(|r| r.contains(phys))
            .and_then(|r| r.nid);
        if home != Some(nid) {
            log::warn!(
                "NODE_DATA({}) on node {}",
                nid,
                home.map_or(-1, |n| n.as_u32() as i64)
            );
        }

        self.node_data[nid.index()] = Some(NodeData {
            id: nid,
            phys,
            start_pfn: start,
            spanned_pages: end.as_u64().saturating_sub(start.as_u64()),
            present_pages: 0,
            zones: Zone::empty_set(),
        });
        Ok(())
    }

    /// Map the possible CPUs to nodes (`early_map_cpu_to_node` for each,
    /// then the per-node masks).
    pub fn map_cpus(&mut self, topo: &CpuTopology) {
        self.node_cpus = [CpuMask::EMPTY; MAX_NUMNODES];
        for cpu in topo.cpus() {
            let nid = cpu
                .firmware_nid
                .and_then(NodeId::new)
                .filter(|nid| !self.numa_off && self.online.contains(*nid))
                .unwrap_or(NodeId::ZERO);
            self.cpu_to_node[cpu.logical_id as usize] = nid;
            self.node_cpus[nid.index()].set(cpu.logical_id);
        }
    }

    // -- Queries

    /// `__node_distance`
    #[must_use]
    pub fn node_distance(&self, from: NodeId, to: NodeId) -> u8 {
        if from.index() >= self.distance_cnt || to.index() >= self.distance_cnt {
            return if from == to { LOCAL_DISTANCE } else { REMOTE_DISTANCE };
        }
        self.distance[from.index() * self.distance_cnt + to.index()]
    }

    /// `NODE_DATA`
    #[must_use]
    pub fn node_data(&self, nid: NodeId) -> Option<&NodeData> {
        self.node_data.get(nid.index())?.as_ref()
    }

    pub(crate) fn node_data_mut(&mut self, nid: NodeId) -> Option<&mut NodeData> {
        self.node_data.get_mut(nid.index())?.as_mut()
    }

    /// Registered node data in node order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeData> + '_ {
        self.node_data.iter().flatten()
    }

    #[inline]
    #[must_use]
    pub const fn online(&self) -> NodeMask {
        self.online
    }

    #[inline]
    #[must_use]
    pub const fn possible(&self) -> NodeMask {
        self.possible
    }

    /// NUMA ended up disabled, by `numa=off` or by fallback.
    #[inline]
    #[must_use]
    pub const fn numa_off(&self) -> bool {
        self.numa_off
    }

    /// `cpu_to_node`
    #[must_use]
    pub fn cpu_to_node(&self, cpu: u32) -> NodeId {
        self.cpu_to_node.get(cpu as usize).copied().unwrap_or(NodeId::ZERO)
    }

    /// `cpumask_of_node`
    #[must_use]
    pub fn cpumask_of_node(&self, nid: NodeId) -> CpuMask {
        self.node_cpus[nid.index()]
    }

    /// Node owning a physical address (`early_pfn_to_nid`).
    #[must_use]
    pub fn phys_to_nid(memblock: &Memblock, pa: Pa) -> Option<NodeId> {
        memblock
            .memory()
            .iter()
            .find(|r| r.contains(pa.as_u64()))
            .and_then(|r| r.nid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fdt::CpuNode;
    use m6_common::memory::SZ_1G;

    const MAX_PFN: Pfn = Pfn(0x100_0000);

    fn four_nodes() -> (Memblock, NumaFirmware) {
        let mut mb = Memblock::new();
        let mut memory = Vec::new();
        for nid in 0..4u32 {
            let base = 0x8000_0000 + u64::from(nid) * 16 * SZ_1G;
            mb.add(base, 16 * SZ_1G).unwrap();
            memory.push(MemoryNode {
                base,
                size: 16 * SZ_1G,
                nid: Some(nid),
                hotpluggable: false,
            });
        }
        let entry = |from, to, distance| DistanceEntry { from, to, distance };
        let fw = NumaFirmware {
            cpu_nids: vec![0, 1, 2, 3],
            memory,
            distances: DistanceMap::Entries(vec![
                entry(0, 0, 10),
                entry(0, 1, 15),
                entry(0, 2, 20),
                entry(0, 3, 25),
                entry(1, 1, 10),
                entry(1, 2, 25),
                entry(1, 3, 30),
                entry(2, 2, 10),
                entry(2, 3, 15),
                entry(3, 3, 10),
            ]),
        };
        (mb, fw)
    }

    #[test]
    fn test_four_node_firmware() {
        let (mut mb, fw) = four_nodes();
        let mut numa = Numa::new(false);
        numa.init(&mut mb, Some(&fw), false, MAX_PFN).unwrap();

        assert!(!numa.numa_off());
        assert_eq!(numa.online().weight(), 4);
        assert_eq!(numa.possible(), numa.online());
        let n = |i| NodeId::new(i).unwrap();
        assert_eq!(numa.node_distance(n(0), n(3)), 25);
        assert_eq!(numa.node_distance(n(3), n(0)), 25);
        assert_eq!(numa.node_distance(n(2), n(2)), LOCAL_DISTANCE);
        // ids outside the populated part of the table keep the defaults
        assert_eq!(numa.node_distance(n(7), n(8)), REMOTE_DISTANCE);

        for nid in numa.online().iter() {
            let nd = numa.node_data(nid).unwrap();
            assert_eq!(nd.spanned_pages, 0x40_0000);
            assert_eq!(Numa::phys_to_nid(&mb, Pa(nd.phys)), Some(nid));
        }
    }

    #[test]
    fn test_explicit_reverse_distance_wins() {
        let (mut mb, mut fw) = four_nodes();
        if let DistanceMap::Entries(entries) = &mut fw.distances {
            entries.insert(
                0,
                DistanceEntry {
                    from: 1,
                    to: 0,
                    distance: 40,
                },
            );
        }
        let mut numa = Numa::new(false);
        numa.init(&mut mb, Some(&fw), false, MAX_PFN).unwrap();
        let n = |i| NodeId::new(i).unwrap();
        assert_eq!(numa.node_distance(n(0), n(1)), 15);
        assert_eq!(numa.node_distance(n(1), n(0)), 40);

        let (mut mb, _) = four_nodes();
        let mut numa = Numa::new(false);
        numa.init(&mut mb, Some(&fw), true, MAX_PFN).unwrap();
        assert!(numa.numa_off());
        assert_eq!(numa.node_distance(n(1), n(0)), REMOTE_DISTANCE);
    }

    #[test]
    fn test_invalid_distance_falls_back_to_dummy() {
        let (mut mb, mut fw) = four_nodes();
        fw.distances = DistanceMap::Entries(vec![DistanceEntry {
            from: 0,
            to: 1,
            distance: 10,
        }]);
        let mut numa = Numa::new(false);
        numa.init(&mut mb, Some(&fw), false, MAX_PFN).unwrap();

        assert!(numa.numa_off());
        assert_eq!(numa.online().weight(), 1);
        assert!(mb.memory().iter().all(|r| r.nid == Some(NodeId::ZERO)));
        let nd = numa.node_data(NodeId::ZERO).unwrap();
        assert_eq!(nd.spanned_pages, 4 * 16 * SZ_1G / PAGE_SIZE);
    }

    #[test]
    fn test_unbound_memory_falls_back() {
        let (mut mb, mut fw) = four_nodes();
        fw.memory[2].nid = None;
        let mut numa = Numa::new(false);
        numa.init(&mut mb, Some(&fw), false, MAX_PFN).unwrap();
        assert!(numa.numa_off());
    }

    #[test]
    fn test_out_of_range_memory_node_falls_back() {
        let (mut mb, mut fw) = four_nodes();
        fw.memory[0].nid = Some(MAX_NUMNODES as u32);
        let mut numa = Numa::new(false);
        numa.init(&mut mb, Some(&fw), false, MAX_PFN).unwrap();
        assert!(numa.numa_off());
    }

    #[test]
    fn test_numa_off_and_no_firmware() {
        let (mut mb, fw) = four_nodes();
        let mut numa = Numa::new(true);
        numa.init(&mut mb, Some(&fw), false, MAX_PFN).unwrap();
        assert!(numa.numa_off());
        assert_eq!(numa.online().weight(), 1);

        let mut mb = Memblock::new();
        mb.add(0x8000_0000, 0x8000_0000).unwrap();
        let mut numa = Numa::new(false);
        numa.init(&mut mb, None, false, Pfn(0x10_0000)).unwrap();
        assert!(numa.numa_off());
        assert!(numa.node_data(NodeId::ZERO).is_some());
        // the distance table stays reserved
        assert!(mb.reserved_size() >= DISTANCE_TABLE_SIZE + PGLIST_DATA_SIZE);
    }

    #[test]
    fn test_map_cpus() {
        let (mut mb, fw) = four_nodes();
        let mut numa = Numa::new(false);
        numa.init(&mut mb, Some(&fw), false, MAX_PFN).unwrap();

        let node = |name, hwid, nid| CpuNode {
            name,
            hwid: Some(hwid),
            nid,
            enable_method: Some("psci"),
            release_addr: None,
        };
        let topo = CpuTopology::from_nodes(
            &[
                node("cpu@0", 0, Some(0)),
                node("cpu@1", 1, Some(3)),
                node("cpu@2", 2, None),
                node("cpu@3", 3, Some(99)),
            ],
            0,
        );
        numa.map_cpus(&topo);

        let n = |i| NodeId::new(i).unwrap();
        assert_eq!(numa.cpu_to_node(1), n(3));
        assert_eq!(numa.cpu_to_node(2), n(0));
        assert_eq!(numa.cpu_to_node(3), n(0));
        assert_eq!(numa.cpumask_of_node(n(0)).weight(), 3);
        assert!(numa.cpumask_of_node(n(3)).contains(1));
    }
}
