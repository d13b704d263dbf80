//! CPU Logical Map
//!
//! Assigns logical CPU ids to the CPU nodes of the device tree and builds
//! the MPIDR hash used to index per-CPU save areas by hardware id.
//!
//! # Design
//!
//! Logical id 0 always belongs to the boot CPU, whose hardware id comes
//! from `MPIDR_EL1` and not from the tree. Every other CPU node consumes
//! the next id in tree order, even when it is rejected, so ids stay stable
//! when firmware disables a core.
//!
//! ```text
//! /cpus/cpu@0    (boot)   -> 0
//! /cpus/cpu@1             -> 1
//! /cpus/cpu@bad  (no reg) -> 2 (unused)
//! /cpus/cpu@3             -> 3
//! ```

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use m6_common::memory::NR_CPUS;

use crate::fdt::CpuNode;

/// Hardware id of a logical CPU slot that holds no CPU.
pub const INVALID_HWID: u64 = u64::MAX;

/// `MPIDR_LEVEL_SHIFT` for affinity levels 0 to 3.
const LEVEL_SHIFT: [u32; 4] = [0, 8, 16, 32];

// -- CpuMask

const MASK_WORDS: usize = NR_CPUS / 64;

/// Set of logical CPUs (`cpumask_t`).
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuMask([u64; MASK_WORDS]);

impl CpuMask {
    pub const EMPTY: Self = Self([0; MASK_WORDS]);

    /// Add `cpu`; ids at or above `NR_CPUS` are ignored.
    #[inline]
    pub fn set(&mut self, cpu: u32) {
        if let Some(word) = self.0.get_mut(cpu as usize / 64) {
            *word |= 1 << (cpu % 64);
        }
    }

    /// Remove `cpu`; ids at or above `NR_CPUS` are ignored.
    #[inline]
    pub fn clear(&mut self, cpu: u32) {
        if let Some(word) = self.0.get_mut(cpu as usize / 64) {
            *word &= !(1 << (cpu % 64));
        }
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, cpu: u32) -> bool {
        (cpu as usize) < NR_CPUS && self.0[cpu as usize / 64] & (1 << (cpu % 64)) != 0
    }

    #[must_use]
    pub fn weight(&self) -> u32 {
        self.0.iter().map(|w| w.count_ones()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&w| w == 0)
    }

    /// Iterate member CPUs in increasing order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..NR_CPUS as u32).filter(|&cpu| self.contains(cpu))
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

// -- Enable methods

/// How a secondary CPU is released from firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnableMethod {
    Psci,
    /// Spin on a mailbox until the release address is written
    SpinTable { release_addr: u64 },
    ParkingProtocol,
}

impl EnableMethod {
    /// Decode an `enable-method` string (`init_cpu_ops`).
    ///
    /// # Returns
    ///
    /// `None` for unknown methods and for spin-table CPUs without a
    /// release address.
    fn parse(node: &CpuNode<'_>, method: &str) -> Option<Self> {
        match method {
            "psci" => Some(Self::Psci),
            "spin-table" => match node.release_addr {
                Some(release_addr) => Some(Self::SpinTable { release_addr }),
                None => {
                    log::error!("{}: missing or invalid cpu-release-addr property", node.name);
                    None
                }
            },
            "parking-protocol" => Some(Self::ParkingProtocol),
            other => {
                log::warn!("Unsupported enable-method: {}", other);
                None
            }
        }
    }
}

impl fmt::Display for EnableMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Psci => write!(f, "psci"),
            Self::SpinTable { .. } => write!(f, "spin-table"),
            Self::ParkingProtocol => write!(f, "parking-protocol"),
        }
    }
}

// -- Topology

/// A possible CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cpu {
    pub logical_id: u32,
    /// Affinity fields of `MPIDR_EL1`
    pub mpidr: u64,
    /// `None` only for a boot CPU whose node has no `enable-method`
    pub enable_method: Option<EnableMethod>,
    /// `numa-node-id` as found in the tree
    pub firmware_nid: Option<u32>,
}

/// Logical CPU map (`__cpu_logical_map`) and the possible CPUs.
#[derive(Debug, Clone)]
pub struct CpuTopology {
    logical_map: Vec<u64>,
    cpus: Vec<Cpu>,
    possible: CpuMask,
    boot_found: bool,
}

impl CpuTopology {
    /// A topology holding only the boot CPU.
    #[must_use]
    pub fn boot_only(boot_hwid: u64) -> Self {
        let mut possible = CpuMask::EMPTY;
        possible.set(0);
        Self {
            logical_map: vec![boot_hwid],
            cpus: vec![Cpu {
                logical_id: 0,
                mpidr: boot_hwid,
                enable_method: None,
                firmware_nid: None,
            }],
            possible,
            boot_found: false,
        }
    }

    /// Assign logical ids to CPU nodes and decide which CPUs are possible
    /// (`of_parse_and_init_cpus` followed by `smp_init_cpus`).
    ///
    /// # Arguments
    ///
    /// * `nodes` - CPU nodes in tree order
    /// * `boot_hwid` - affinity of the CPU running this code
    #[must_use]
    pub fn from_nodes(nodes: &[CpuNode<'_>], boot_hwid: u64) -> Self {
        let mut topo = Self::boot_only(boot_hwid);
        let mut boot_node: Option<&CpuNode<'_>> = None;
        let mut slots: Vec<Option<&CpuNode<'_>>> = vec![None];
        let mut cpu_count: usize = 1;

        for node in nodes {
            if let Some(hwid) = node.hwid {
                if topo.logical_map[1..].contains(&hwid) {
                    log::error!("{}: duplicate cpu reg properties in the DT", node.name);
                } else if hwid == boot_hwid {
                    if boot_node.is_some() {
                        log::error!("{}: duplicate boot cpu reg property in DT", node.name);
                    } else {
                        boot_node = Some(node);
                        continue;
                    }
                } else if cpu_count < NR_CPUS {
                    log::debug!("cpu logical map {:#x}", hwid);
                    topo.logical_map.resize(cpu_count + 1, INVALID_HWID);
                    slots.resize(cpu_count + 1, None);
                    topo.logical_map[cpu_count] = hwid;
                    slots[cpu_count] = Some(node);
                }
            }
            cpu_count += 1;
        }

        if cpu_count > NR_CPUS {
            log::warn!(
                "Number of cores ({}) exceeds configured maximum of {} - clipping",
                cpu_count,
                NR_CPUS
            );
        }

        let Some(boot) = boot_node else {
            log::error!("missing boot CPU MPIDR, not enabling secondaries");
            return topo;
        };
        topo.boot_found = true;
        topo.cpus[0].enable_method = boot.enable_method.and_then(|m| EnableMethod::parse(boot, m));
        topo.cpus[0].firmware_nid = boot.nid;

        for (cpu, slot) in slots.iter().enumerate().skip(1) {
            let Some(node) = slot else {
                continue;
            };
            let method = match node.enable_method {
                Some(name) => EnableMethod::parse(node, name),
                None => {
                    log::error!("{}: missing enable-method property", node.name);
                    None
                }
            };
            let Some(method) = method else {
                topo.logical_map[cpu] = INVALID_HWID;
                continue;
            };
            topo.possible.set(cpu as u32);
            topo.cpus.push(Cpu {
                logical_id: cpu as u32,
                mpidr: topo.logical_map[cpu],
                enable_method: Some(method),
                firmware_nid: node.nid,
            });
        }
        topo
    }

    /// The boot CPU's hardware id appeared in the tree.
    #[inline]
    #[must_use]
    pub const fn boot_cpu_valid(&self) -> bool {
        self.boot_found
    }

    /// Hardware id of a logical CPU (`cpu_logical_map`).
    #[must_use]
    pub fn logical_map(&self, cpu: u32) -> u64 {
        self.logical_map.get(cpu as usize).copied().unwrap_or(INVALID_HWID)
    }

    /// Logical id of a hardware id (`get_logical_index`).
    #[must_use]
    pub fn logical_index(&self, mpidr: u64) -> Option<u32> {
        self.cpus.iter().find(|c| c.mpidr == mpidr).map(|c| c.logical_id)
    }

    #[inline]
    #[must_use]
    pub const fn possible(&self) -> CpuMask {
        self.possible
    }

    /// Possible CPUs in logical id order.
    #[must_use]
    pub fn cpus(&self) -> &[Cpu] {
        &self.cpus
    }

    #[must_use]
    pub fn num_possible(&self) -> u32 {
        self.possible.weight()
    }
}

// -- MPIDR hash

/// Compression of MPIDR values into a dense index (`mpidr_hash`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpidrHash {
    /// Affinity bits that differ between possible CPUs
    pub mask: u64,
    pub shift_aff: [u32; 4],
    /// Width of the hash
    pub bits: u32,
}

impl MpidrHash {
    /// Build the hash over the possible CPUs (`smp_build_mpidr_hash`).
    #[must_use]
    pub fn build(topo: &CpuTopology) -> Self {
        let boot = topo.logical_map(0);
        let mask = topo.cpus.iter().fold(0, |acc, cpu| acc | (cpu.mpidr ^ boot));
        log::debug!("mask of set bits {:#x}", mask);

        let mut fs = [0u32; 4];
        let mut bits = [0u32; 4];
        for level in 0..4 {
            let affinity = (mask >> LEVEL_SHIFT[level]) & 0xff;
            if affinity != 0 {
                fs[level] = affinity.trailing_zeros();
                bits[level] = 64 - affinity.leading_zeros() - fs[level];
            }
        }

        let shift_aff = [
            LEVEL_SHIFT[0] + fs[0],
            LEVEL_SHIFT[1] + fs[1] - bits[0],
            LEVEL_SHIFT[2] + fs[2] - (bits[0] + bits[1]),
            LEVEL_SHIFT[3] + fs[3] - (bits[0] + bits[1] + bits[2]),
        ];
        let hash = Self {
            mask,
            shift_aff,
            bits: bits.iter().sum(),
        };
        log::debug!(
            "MPIDR hash: aff0[{}] aff1[{}] aff2[{}] aff3[{}] mask[{:#x}] bits[{}]",
            shift_aff[0],
            shift_aff[1],
            shift_aff[2],
            shift_aff[3],
            mask,
            hash.bits
        );

        if hash.size() > 4 * u64::from(topo.num_possible()) {
            log::warn!("Large number of MPIDR hash buckets detected");
        }
        if !hash.is_injective(topo) {
            log::error!("MPIDR hash collision between possible CPUs");
        }
        hash
    }

    /// Number of buckets.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        1 << self.bits
    }

    /// Index of an MPIDR value.
    #[must_use]
    pub fn hash(&self, mpidr: u64) -> u64 {
        (0..4)
            .map(|level| {
                let field = 0xffu64 << LEVEL_SHIFT[level];
                (mpidr & self.mask & field) >> self.shift_aff[level]
            })
            .sum()
    }

    fn is_injective(&self, topo: &CpuTopology) -> bool {
        let hashes: Vec<u64> = topo.cpus.iter().map(|c| self.hash(c.mpidr)).collect();
        hashes
            .iter()
            .enumerate()
            .all(|(i, h)| hashes[i + 1..].iter().all(|other| other != h) && *h < self.size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &'static str, hwid: Option<u64>, method: Option<&'static str>) -> CpuNode<'static> {
        CpuNode {
            name,
            hwid,
            nid: None,
            enable_method: method,
            release_addr: None,
        }
    }

    #[test]
    fn test_cpumask_ignores_ids_past_nr_cpus() {
        let mut mask = CpuMask::EMPTY;
        mask.set(0);
        mask.set(NR_CPUS as u32 - 1);
        mask.set(NR_CPUS as u32);
        mask.set(u32::MAX);
        assert_eq!(mask.weight(), 2);
        assert!(!mask.contains(NR_CPUS as u32));

        mask.clear(NR_CPUS as u32);
        mask.clear(NR_CPUS as u32 - 1);
        assert_eq!(mask.iter().collect::<Vec<_>>(), [0]);
    }

    #[test]
    fn test_logical_ids_follow_tree_order() {
        let nodes = [
            node("cpu@0", Some(0), Some("psci")),
            node("cpu@1", Some(1), Some("psci")),
            node("cpu@bad", None, Some("psci")),
            node("cpu@3", Some(3), Some("psci")),
        ];
        let topo = CpuTopology::from_nodes(&nodes, 0);

        assert!(topo.boot_cpu_valid());
        assert_eq!(topo.logical_map(0), 0);
        assert_eq!(topo.logical_map(1), 1);
        // the invalid node still consumed id 2
        assert_eq!(topo.logical_map(2), INVALID_HWID);
        assert_eq!(topo.logical_map(3), 3);
        assert_eq!(topo.num_possible(), 3);
        assert_eq!(topo.logical_index(3), Some(3));
    }

    #[test]
    fn test_boot_cpu_not_first_in_tree() {
        let nodes = [
            node("cpu@100", Some(0x100), Some("psci")),
            node("cpu@0", Some(0), Some("psci")),
        ];
        let topo = CpuTopology::from_nodes(&nodes, 0);
        assert_eq!(topo.logical_map(0), 0);
        assert_eq!(topo.logical_map(1), 0x100);
        assert_eq!(topo.num_possible(), 2);
    }

    #[test]
    fn test_duplicates_are_skipped() {
        let nodes = [
            node("cpu@0", Some(0), Some("psci")),
            node("cpu@0-again", Some(0), Some("psci")),
            node("cpu@1", Some(1), Some("psci")),
            node("cpu@1-again", Some(1), Some("psci")),
        ];
        let topo = CpuTopology::from_nodes(&nodes, 0);
        // second boot node consumed id 1, cpu@1 took id 2
        assert_eq!(topo.logical_map(1), INVALID_HWID);
        assert_eq!(topo.logical_map(2), 1);
        assert_eq!(topo.logical_map(3), INVALID_HWID);
        assert_eq!(topo.num_possible(), 2);
    }

    #[test]
    fn test_missing_enable_method_disables_secondary() {
        let mut spin = node("cpu@2", Some(2), Some("spin-table"));
        let nodes = [
            node("cpu@0", Some(0), None),
            node("cpu@1", Some(1), None),
            spin,
        ];
        let topo = CpuTopology::from_nodes(&nodes, 0);
        assert_eq!(topo.num_possible(), 1);
        assert_eq!(topo.logical_map(1), INVALID_HWID);
        assert_eq!(topo.logical_map(2), INVALID_HWID);

        spin.release_addr = Some(0x8000_fff8);
        let topo = CpuTopology::from_nodes(&[node("cpu@0", Some(0), None), spin], 0);
        assert_eq!(topo.num_possible(), 2);
        assert_eq!(
            topo.cpus()[1].enable_method,
            Some(EnableMethod::SpinTable {
                release_addr: 0x8000_fff8
            })
        );
    }

    #[test]
    fn test_missing_boot_cpu_keeps_secondaries_off() {
        let nodes = [node("cpu@1", Some(1), Some("psci"))];
        let topo = CpuTopology::from_nodes(&nodes, 0);
        assert!(!topo.boot_cpu_valid());
        assert_eq!(topo.num_possible(), 1);
    }

    #[test]
    fn test_mpidr_hash_two_clusters() {
        let nodes = [
            node("cpu@0", Some(0x000), Some("psci")),
            node("cpu@1", Some(0x001), Some("psci")),
            node("cpu@100", Some(0x100), Some("psci")),
            node("cpu@101", Some(0x101), Some("psci")),
        ];
        let topo = CpuTopology::from_nodes(&nodes, 0);
        let hash = MpidrHash::build(&topo);

        assert_eq!(hash.mask, 0x101);
        assert_eq!(hash.bits, 2);
        assert_eq!(hash.shift_aff, [0, 7, 14, 30]);
        let mut seen: Vec<u64> = topo.cpus().iter().map(|c| hash.hash(c.mpidr)).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_mpidr_hash_single_cpu() {
        let topo = CpuTopology::boot_only(0x8000_0000 & crate::cpu::MPIDR_HWID_BITMASK);
        let hash = MpidrHash::build(&topo);
        assert_eq!(hash.mask, 0);
        assert_eq!(hash.bits, 0);
        assert_eq!(hash.hash(0), 0);
    }

    #[test]
    fn test_cpumask_ops() {
        let mut mask = CpuMask::EMPTY;
        assert!(mask.is_empty());
        mask.set(0);
        mask.set(130);
        assert!(mask.contains(130));
        assert!(!mask.contains(129));
        assert_eq!(mask.weight(), 2);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 130]);
        mask.clear(0);
        assert_eq!(mask.weight(), 1);
        assert!(!mask.contains(NR_CPUS as u32));
    }
}
