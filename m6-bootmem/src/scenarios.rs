//! Whole-pipeline boots of reference boards.

use alloc::vec::Vec;

use m6_cma::{ContigRange, GfpFlags, MigrateError};
use m6_common::memory::{SZ_1G, SZ_1M, SZ_2M};
use m6_common::{NodeId, Pa, Pfn, Va};
use m6_memblock::{Memblock, RegionFlags};

use crate::archinit::MemoryLayout;
use crate::boot::{BootArgs, BootCtx, Platform, System};
use crate::config::KernelConfig;
use crate::cpu::BootCpu;
use crate::error::BootError;
use crate::fdt::testutil::FdtBuilder;
use crate::layout::KernelImage;
use crate::reserve::CRASH_ALIGN;
use crate::zones::ZoneType;

const DT_PHYS: u64 = 0xbf00_0000;

const IMAGE: KernelImage = KernelImage {
    text: 0xa020_0000,
    stext: 0xa021_0000,
    end: 0xa220_0000,
};

struct IdentityTables;

impl Platform for IdentityTables {
    fn paging_init(&mut self, _: &mut Memblock, _: &MemoryLayout) -> Result<(), BootError> {
        Ok(())
    }
}

/// Page allocator that always manages to empty a range.
struct Movable;

impl ContigRange for Movable {
    fn alloc_contig_range(&self, _: Pfn, _: u64, _: GfpFlags) -> Result<(), MigrateError> {
        Ok(())
    }

    fn free_contig_range(&self, _: Pfn, _: u64) {}
}

fn cpu(va_bits: u32) -> BootCpu {
    BootCpu {
        mpidr: 0,
        va_bits,
        pa_range_bits: 48,
        entered_el2: false,
        vhe: false,
    }
}

fn args<'a>(config: KernelConfig, cpu: BootCpu, dtb: &'a [u8]) -> BootArgs<'a> {
    BootArgs {
        config,
        cpu,
        image: IMAGE,
        dt_phys: DT_PHYS,
        dtb: Some(dtb),
    }
}

fn boot(config: KernelConfig, dtb: &[u8]) -> System {
    let mut ctx = BootCtx::new(args(config, cpu(48), dtb)).unwrap();
    ctx.paging_init(&mut IdentityTables).unwrap();
    let mut mem = ctx.bootmem_init(&IdentityTables).unwrap();
    mem.smp_init();
    mem.handoff()
}

/// A board with one CPU and one memory node, plus whatever `extra` adds
/// under the root.
fn single_bank(base: u64, size: u64, bootargs: &str, extra: impl FnOnce(&mut FdtBuilder)) -> Vec<u8> {
    let mut b = FdtBuilder::with_root_cells();
    b.prop_str("compatible", "linux,dummy-virt")
        .begin("chosen")
        .prop_str("bootargs", bootargs)
        .end()
        .begin("memory@0")
        .prop_str("device_type", "memory")
        .prop_reg("reg", &[(base, size)])
        .end()
        .begin("cpus")
        .prop_u32("#address-cells", 2)
        .prop_u32("#size-cells", 0)
        .begin("cpu@0")
        .prop_str("device_type", "cpu")
        .prop_u64("reg", 0)
        .prop_str("enable-method", "psci")
        .end()
        .end();
    extra(&mut b);
    b.finish()
}

fn no_numa() -> KernelConfig {
    KernelConfig {
        numa: false,
        ..KernelConfig::DEFAULT
    }
}

#[test]
fn test_plain_board() {
    let dtb = single_bank(0x8000_0000, 0x8000_0000, "", |_| {});

    let ctx = BootCtx::new(args(no_numa(), cpu(48), &dtb)).unwrap();
    let memory = ctx.memblock().memory();
    assert_eq!(memory.len(), 1);
    assert_eq!(memory[0].base, 0x8000_0000);
    assert_eq!(memory[0].size, 0x8000_0000);
    assert_eq!(memory[0].flags, RegionFlags::NONE);
    assert_eq!(memory[0].nid, None);

    let system = boot(no_numa(), &dtb);
    assert_eq!(system.machine.as_deref(), Some("linux,dummy-virt"));
    assert_eq!(system.memstart(), 0x8000_0000);
    assert_eq!(system.arm64_dma_phys_limit(), 0x1_0000_0000);
    let max = system.zones.max_zone_pfns;
    assert_eq!(max[ZoneType::Dma32.index()], Pfn(0x10_0000));
    assert_eq!(max[ZoneType::Normal.index()], Pfn(0x10_0000));
    assert!(max[ZoneType::Dma.index()] <= max[ZoneType::Dma32.index()]);
    assert_eq!(system.dma.default_area(), None);
    assert!(system.cma.is_empty());
    assert_eq!(system.crashk, None);

    // pfn_valid follows memory exactly at the edges of DRAM
    for pfn in [0x7_ffff, 0x8_0000, 0xf_ffff, 0x10_0000] {
        let pfn = Pfn(pfn);
        assert_eq!(system.pfn_valid(pfn), system.memblock.is_memory(pfn.phys().as_u64()));
    }
}

#[test]
fn test_large_dram_and_52_bit_shift() {
    let dtb = single_bank(0x8000_0000, 0x10_0000_0000, "", |_| {});

    let system = boot(no_numa(), &dtb);
    assert_eq!(system.memstart(), 0x8000_0000);
    assert_eq!(system.memblock.phys_mem_size(), 64 * SZ_1G);

    let config = KernelConfig {
        va_bits: 52,
        ..no_numa()
    };
    let ctx = BootCtx::new(args(config, cpu(48), &dtb)).unwrap();
    let linear = ctx.layout().linear;
    let shift = crate::config::page_offset_for(48) - crate::config::page_offset_for(52);
    assert_eq!(linear.memstart, 0x8000_0000u64.wrapping_sub(shift));
    assert_eq!(linear.phys_to_virt(Pa(0x1_0000_0000)), Va(0xffff_0000_8000_0000));
}

#[test]
fn test_four_node_board() {
    const NODE_SIZE: u64 = 16 * SZ_1G;
    let matrix = [
        0, 0, 10, 0, 1, 15, 0, 2, 20, 0, 3, 25, //
        1, 1, 10, 1, 2, 25, 1, 3, 30, //
        2, 2, 10, 2, 3, 15, //
        3, 3, 10,
    ];

    let mut b = FdtBuilder::with_root_cells();
    b.prop_str("model", "hip07-d05");
    for nid in 0..4u32 {
        let base = 0x8000_0000 + u64::from(nid) * NODE_SIZE;
        b.begin(&alloc::format!("memory@{:x}", base))
            .prop_str("device_type", "memory")
            .prop_reg("reg", &[(base, NODE_SIZE)])
            .prop_u32("numa-node-id", nid)
            .end();
    }
    b.begin("cpus")
        .prop_u32("#address-cells", 2)
        .prop_u32("#size-cells", 0);
    for cpu in 0..8u32 {
        b.begin(&alloc::format!("cpu@{:x}", cpu * 0x100))
            .prop_str("device_type", "cpu")
            .prop_u64("reg", u64::from(cpu) * 0x100)
            .prop_str("enable-method", "psci")
            .prop_u32("numa-node-id", cpu / 2)
            .end();
    }
    b.end()
        .begin("distance-map")
        .prop_str("compatible", "numa-distance-map-v1")
        .prop_cells("distance-matrix", &matrix)
        .end();
    let dtb = b.finish();

    let system = boot(KernelConfig::DEFAULT, &dtb);
    assert_eq!(system.numa.online().iter().map(NodeId::as_u32).collect::<Vec<_>>(), [0, 1, 2, 3]);

    let n = |i| NodeId::new(i).unwrap();
    assert_eq!(system.node_distance(n(0), n(3)), 25);
    assert_eq!(system.node_distance(n(3), n(0)), 25);
    assert_eq!(system.node_distance(n(1), n(3)), 30);
    for a in 0..4 {
        assert_eq!(system.node_distance(n(a), n(a)), 10);
        for b in (0..4).filter(|&b| b != a) {
            assert!(system.node_distance(n(a), n(b)) > 10);
        }
    }

    for nd in system.numa.nodes() {
        let base = 0x8000_0000 + u64::from(nd.id.as_u32()) * NODE_SIZE;
        assert_eq!(nd.spanned_pages, 0x40_0000);
        assert_eq!(nd.start_pfn, Pa(base).pfn_down());
        assert!(nd.phys >= base && nd.phys < base + NODE_SIZE);
        let bound: u64 = system
            .memblock
            .memory()
            .iter()
            .filter(|r| r.nid == Some(nd.id))
            .map(|r| r.size >> 12)
            .sum();
        assert_eq!(bound, nd.spanned_pages);
        let cpus = system.numa.cpumask_of_node(nd.id);
        assert_eq!(cpus.weight(), 2);
    }
    assert_eq!(system.topology.num_possible(), 8);
}

#[test]
fn test_node_with_hole() {
    let mut b = FdtBuilder::with_root_cells();
    b.prop_str("compatible", "linux,dummy-virt")
        .begin("memory@80000000")
        .prop_str("device_type", "memory")
        .prop_reg("reg", &[(0x8000_0000, SZ_1G), (0x1_0000_0000, SZ_1G)])
        .prop_u32("numa-node-id", 0)
        .end()
        .begin("memory@200000000")
        .prop_str("device_type", "memory")
        .prop_reg("reg", &[(0x2_0000_0000, SZ_1G)])
        .prop_u32("numa-node-id", 1)
        .end()
        .begin("cpus")
        .prop_u32("#address-cells", 2)
        .prop_u32("#size-cells", 0);
    for cpu in 0..2u32 {
        b.begin(&alloc::format!("cpu@{:x}", cpu))
            .prop_str("device_type", "cpu")
            .prop_u64("reg", u64::from(cpu))
            .prop_str("enable-method", "psci")
            .prop_u32("numa-node-id", cpu)
            .end();
    }
    b.end();
    let dtb = b.finish();

    let system = boot(KernelConfig::DEFAULT, &dtb);
    let n = |i| NodeId::new(i).unwrap();
    let node0 = system.numa.node_data(n(0)).unwrap();
    let node1 = system.numa.node_data(n(1)).unwrap();

    // The span covers the hole between the two banks; present pages are
    // exactly the memory bound to the node.
    assert_eq!(node0.start_pfn, Pfn(0x8_0000));
    assert_eq!(node0.spanned_pages, 0xc_0000);
    assert_eq!(node0.end_pfn(), Pfn(0x14_0000));
    assert_eq!(node1.spanned_pages, 0x4_0000);
    for nd in [node0, node1] {
        let bound: u64 = system
            .memblock
            .memory()
            .iter()
            .filter(|r| r.nid == Some(nd.id))
            .map(|r| r.size >> 12)
            .sum();
        assert_eq!(nd.present_pages, bound);
    }
    assert_eq!(node0.present_pages, 0x8_0000);
    assert!(!system.pfn_valid(Pfn(0xc_0000)));
    assert!(system.pfn_valid(Pfn(0x10_0000)));
}

#[test]
fn test_default_cma_from_cmdline() {
    let dtb = single_bank(0x8000_0000, 0x8000_0000, "cma=128M@0x80000000-0x88000000", |_| {});
    let system = boot(no_numa(), &dtb);

    let id = system.dma.default_area().unwrap();
    let area = system.cma.get(id);
    assert_eq!(area.base(), 0x8000_0000);
    assert_eq!(area.size(), 0x800_0000);
    assert!(area.is_active());
    assert!(system.memblock.is_region_reserved(0x8000_0000, 0x800_0000));

    let pfn = area.alloc(256, 0, false, &Movable).unwrap();
    assert_eq!(pfn, Pfn(0x8_0000));
    area.with_bitmap(|bitmap| {
        assert!(bitmap.all_set(0, 256));
        assert!(!bitmap.test(256));
        assert_eq!(bitmap.weight(), 256);
    });
}

#[test]
fn test_cmdline_overrides_dt_default_pool() {
    let dtb = single_bank(0x8000_0000, 0x8000_0000, "cma=128M", |b| {
        b.begin("reserved-memory")
            .prop_u32("#address-cells", 2)
            .prop_u32("#size-cells", 2)
            .prop_empty("ranges")
            .begin("linux,cma@90000000")
            .prop_str("compatible", "shared-dma-pool")
            .prop_empty("reusable")
            .prop_empty("linux,cma-default")
            .prop_reg("reg", &[(0x9000_0000, 64 * SZ_1M)])
            .end()
            .end();
    });
    let system = boot(no_numa(), &dtb);

    assert_eq!(system.cma.len(), 1);
    let area = system.cma.get(system.dma.default_area().unwrap());
    assert_eq!(area.size(), 128 * SZ_1M);
    assert_ne!(area.base(), 0x9000_0000);
    assert!(!system.memblock.is_region_reserved(0x9000_0000, 64 * SZ_1M));
    assert!(system.layout.reserved_mem.is_empty());
}

#[test]
fn test_crash_kernel_below_dma_limit() {
    let dtb = single_bank(0x8000_0000, 4 * SZ_1G, "crashkernel=256M", |_| {});
    let system = boot(no_numa(), &dtb);

    assert_eq!(system.arm64_dma_phys_limit(), 0x1_0000_0000);
    let crash = system.crashk.unwrap();
    assert_eq!(crash.size(), 256 * SZ_1M);
    assert_eq!(crash.start % CRASH_ALIGN, 0);
    assert_eq!(CRASH_ALIGN, SZ_2M);
    assert!(crash.end < 0x1_0000_0000);
    assert!(system.memblock.is_region_reserved(crash.start, crash.size()));
}
