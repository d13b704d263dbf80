//! Boot Memory Pipeline
//!
//! Drives the bring-up from the device tree pointer handed over by the
//! bootloader to a frozen [`System`] the page allocator starts from.
//!
//! # Design
//!
//! The pipeline is split at the point where the architecture installs
//! its final page tables:
//!
//! ```text
//! BootCtx::new            early_fdt_map, setup_machine_fdt,
//!                         arm64_memblock_init
//! BootCtx::paging_init    Platform hook
//! BootCtx::bootmem_init   NUMA, hugetlb CMA, per-node CMA, hyp pool,
//!   -> Bootmem            sparse sections, zones, default CMA,
//!                         crash kernel
//! Bootmem::smp_init       logical CPU map, MPIDR hash, CPU to node
//! Bootmem::handoff        CMA activation, managed pages
//!   -> System             frozen with publish()
//! ```
//!
//! Each step consumes or extends the state of the previous one, so stages
//! cannot run out of order. Every step reports a [`BootFailure`] naming
//! its stage; [`boot`] turns those into [`fatal`](crate::error::fatal)
//! aborts. Optional reservations (CMA, crash kernel) log their failures
//! and carry on.
//!
//! # Safety Invariants
//!
//! After [`Bootmem`] exists, `memory` ranges, `memstart`, node spans and
//! zone boundaries no longer change. Later steps only add to the reserved
//! table and the CMA registry.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use spin::Once;

use m6_cma::{CmaRegistry, ContigRange, DmaContiguous, DmaDevice, FreedTo, GfpFlags};
use m6_common::memory::{PHYS_ADDR_MAX, SZ_1M};
use m6_common::{NodeId, Pa, Pfn, Va};
use m6_memblock::Memblock;

use crate::archinit::{self, ArchInit, MemoryLayout};
use crate::cmdline::BootParams;
use crate::config::KernelConfig;
use crate::cpu::BootCpu;
use crate::error::{BootError, BootFailure, BootStage};
use crate::fdt::{self, ChosenInfo, CmaSinks, CpuNode, FdtBlob};
use crate::layout::KernelImage;
use crate::numa::{DistanceMap, Numa, NumaFirmware};
use crate::reserve::{self, CrashKernel, HugetlbCma, HypMemory};
use crate::smp::{CpuTopology, MpidrHash};
use crate::sparse::{self, Sparse};
use crate::zones::{self, ZonePlan};

// -- Platform seam

/// Architecture services outside memory bring-up.
pub trait Platform {
    /// Build the kernel page tables over the linear map and switch to
    /// them (`paging_init`). Table pages come from `memblock`.
    ///
    /// # Errors
    ///
    /// Any failure is fatal to boot.
    fn paging_init(&mut self, memblock: &mut Memblock, layout: &MemoryLayout) -> Result<(), BootError>;

    /// Highest CPU address reachable by DMA according to ACPI IORT;
    /// [`PHYS_ADDR_MAX`] on device tree systems.
    fn acpi_dma_limit(&self) -> u64 {
        PHYS_ADDR_MAX
    }
}

/// What the boot CPU knows at entry.
#[derive(Debug, Clone, Copy)]
pub struct BootArgs<'a> {
    pub config: KernelConfig,
    pub cpu: BootCpu,
    pub image: KernelImage,
    /// Physical address of the device tree (`x0` at entry)
    pub dt_phys: u64,
    /// The blob as seen through the early mapping
    pub dtb: Option<&'a [u8]>,
}

// -- Device tree ingest

/// Everything `setup_machine_fdt` pulls out of the device tree.
#[derive(Debug, Clone)]
struct MachineFdt<'a> {
    machine: Option<&'a str>,
    chosen: ChosenInfo<'a>,
    params: BootParams,
    cpu_nodes: Vec<CpuNode<'a>>,
    numa: Option<NumaFirmware>,
    dt_dma_limit: u64,
}

/// Reserve the blob, register memory and collect topology
/// (`setup_machine_fdt`).
fn setup_machine_fdt<'a>(
    blob: &FdtBlob<'a>,
    memblock: &mut Memblock,
    config: &KernelConfig,
) -> Result<MachineFdt<'a>, BootError> {
    memblock.reserve(blob.phys(), blob.size())?;

    let chosen = fdt::scan_chosen(blob)?;
    let params = BootParams::parse(chosen.bootargs);

    let memory = fdt::scan_memory(blob, memblock, config.numa)?;
    if let Some((base, size)) = chosen.usable_range {
        log::info!("usable memory range [{:#018x}-{:#018x}]", base, base + size - 1);
        memblock.cap_memory_range(base, size);
    }

    let machine = blob.machine_name();
    if let Some(name) = machine {
        log::info!("Machine model: {}", name);
    }

    let cpu_nodes = fdt::scan_cpus(blob)?;
    let numa = if config.numa {
        let distances = match fdt::scan_distance_map(blob) {
            Ok(Some(entries)) => DistanceMap::Entries(entries),
            Ok(None) => DistanceMap::Absent,
            Err(err) => {
                log::warn!("NUMA: {}", err);
                DistanceMap::Malformed
            }
        };
        Some(NumaFirmware {
            cpu_nids: cpu_nodes.iter().filter_map(|c| c.nid).collect(),
            memory,
            distances,
        })
    } else {
        None
    };

    Ok(MachineFdt {
        machine,
        chosen,
        params,
        cpu_nodes,
        numa,
        dt_dma_limit: fdt::max_dma_cpu_address(blob),
    })
}

// -- Before bootmem_init

/// Boot state up to the final page tables.
#[derive(Debug)]
pub struct BootCtx<'a> {
    config: KernelConfig,
    cpu: BootCpu,
    fdt: MachineFdt<'a>,
    memblock: Memblock,
    layout: MemoryLayout,
    registry: CmaRegistry,
    dma: DmaContiguous,
}

impl<'a> BootCtx<'a> {
    /// Map and ingest the device tree, then fix the linear map
    /// (`setup_machine_fdt` and `arm64_memblock_init`).
    ///
    /// # Errors
    ///
    /// - [`BootStage::EarlyFdtMap`]: the blob is missing or invalid
    /// - [`BootStage::SetupMachineFdt`]: malformed memory, CPU or chosen
    ///   nodes
    /// - [`BootStage::MemblockInit`]: no memory left, reserved-memory
    ///   errors
    pub fn new(args: BootArgs<'a>) -> Result<Self, BootFailure> {
        let config = args.config;
        let blob = fdt::early_fdt_map(args.dt_phys, args.dtb)
            .map_err(BootFailure::at(BootStage::EarlyFdtMap))?;

        let mut memblock = Memblock::new();
        let machine = setup_machine_fdt(&blob, &mut memblock, &config)
            .map_err(BootFailure::at(BootStage::SetupMachineFdt))?;

        let mut dma = DmaContiguous::new(machine.params.cma, machine.params.cma_pernuma);
        dma.set_alignment(config.cma_alignment);
        let mut registry = CmaRegistry::new(1 + config.cma_areas);

        let seed = if config.randomize_base && !machine.params.nokaslr {
            (machine.chosen.kaslr_seed & 0xffff) as u16
        } else {
            0
        };
        let arch = ArchInit {
            config: &config,
            cpu: &args.cpu,
            image: args.image,
            mem_limit: machine.params.mem_limit,
            initrd: machine.chosen.initrd,
            memstart_offset_seed: seed,
        };
        let sinks = if config.cma {
            Some(CmaSinks {
                dma: &mut dma,
                registry: &mut registry,
            })
        } else {
            None
        };
        let layout = archinit::arm64_memblock_init(&mut memblock, &arch, &blob, sinks)
            .map_err(BootFailure::at(BootStage::MemblockInit))?;

        Ok(Self {
            config,
            cpu: args.cpu,
            fdt: machine,
            memblock,
            layout,
            registry,
            dma,
        })
    }

    #[must_use]
    pub fn memblock(&self) -> &Memblock {
        &self.memblock
    }

    #[must_use]
    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    #[must_use]
    pub fn params(&self) -> &BootParams {
        &self.fdt.params
    }

    /// Hand the region table to the platform for the final page tables.
    ///
    /// # Errors
    ///
    /// Whatever the platform reports, tagged [`BootStage::PagingInit`].
    pub fn paging_init<P: Platform + ?Sized>(&mut self, platform: &mut P) -> Result<(), BootFailure> {
        platform
            .paging_init(&mut self.memblock, &self.layout)
            .map_err(BootFailure::at(BootStage::PagingInit))
    }

    /// Bind memory to nodes, make the late reservations and size the
    /// zones (`bootmem_init`).
    ///
    /// # Errors
    ///
    /// - [`BootStage::Numa`]: even the fallback node could not be set up
    /// - [`BootStage::HypReserve`]: the protected hypervisor pool failed
    /// - [`BootStage::Sparse`]: the section table overflowed
    pub fn bootmem_init<P: Platform + ?Sized>(self, platform: &P) -> Result<Bootmem<'a>, BootFailure> {
        let Self {
            config,
            cpu,
            fdt,
            mut memblock,
            layout,
            mut registry,
            mut dma,
        } = self;
        let params = &fdt.params;

        let min = Pa(memblock.start_of_dram()).pfn_up();
        let max = Pa(memblock.end_of_dram()).pfn_down();
        log::debug!("bootmem_init: min_low_pfn {:#x} max_pfn {:#x}", min.0, max.0);

        let mut numa = Numa::new(params.numa_off);
        numa.init(&mut memblock, fdt.numa.as_ref(), config.strict_distance_map, max)
            .map_err(BootFailure::at(BootStage::Numa))?;

        let hugetlb = if config.cma && config.hugetlb_cma {
            reserve::hugetlb_cma_reserve(&mut registry, &mut memblock, numa.online(), params.hugetlb_cma)
        } else {
            HugetlbCma::default()
        };
        if config.cma && config.dma_pernuma_cma {
            dma.pernuma_reserve(&mut registry, &mut memblock, numa.online());
        }

        let hyp = reserve::kvm_hyp_reserve(&config, &cpu, params.kvm_mode, &mut memblock)
            .map_err(BootFailure::at(BootStage::HypReserve))?;

        let mut sparse = Sparse::new(config.pa_bits);
        sparse
            .init(&mut memblock)
            .map_err(BootFailure::at(BootStage::Sparse))?;

        let zones = ZonePlan::new(&config, &memblock, fdt.dt_dma_limit, platform.acpi_dma_limit(), max);
        zones.free_area_init(&memblock, &mut numa);

        if config.cma {
            dma.reserve(
                &mut registry,
                &mut memblock,
                zones.arm64_dma_phys_limit,
                config.cma_size_mbytes * SZ_1M,
            );
        }

        let crashk = if config.kexec_core {
            reserve::reserve_crashkernel(
                params.crashkernel.as_deref(),
                &mut memblock,
                zones.arm64_dma_phys_limit,
            )
        } else {
            None
        };

        memblock.dump();

        let topology = CpuTopology::boot_only(cpu.hwid());
        let mpidr_hash = MpidrHash::build(&topology);
        Ok(Bootmem {
            config,
            fdt,
            memblock,
            layout,
            registry,
            dma,
            numa,
            sparse,
            zones,
            hugetlb,
            hyp,
            crashk,
            boot_hwid: cpu.hwid(),
            topology,
            mpidr_hash,
        })
    }
}

// -- After bootmem_init

/// Boot state with nodes, sections and zones fixed.
#[derive(Debug)]
pub struct Bootmem<'a> {
    config: KernelConfig,
    fdt: MachineFdt<'a>,
    memblock: Memblock,
    layout: MemoryLayout,
    registry: CmaRegistry,
    dma: DmaContiguous,
    numa: Numa,
    sparse: Sparse,
    zones: ZonePlan,
    hugetlb: HugetlbCma,
    hyp: Option<HypMemory>,
    crashk: Option<CrashKernel>,
    boot_hwid: u64,
    topology: CpuTopology,
    mpidr_hash: MpidrHash,
}

impl Bootmem<'_> {
    #[must_use]
    pub fn memblock(&self) -> &Memblock {
        &self.memblock
    }

    #[must_use]
    pub fn numa(&self) -> &Numa {
        &self.numa
    }

    #[must_use]
    pub fn zones(&self) -> &ZonePlan {
        &self.zones
    }

    /// Enumerate the CPUs and bind them to nodes (`smp_init_cpus` and
    /// `numa_store_cpu_info`).
    pub fn smp_init(&mut self) {
        self.topology = CpuTopology::from_nodes(&self.fdt.cpu_nodes, self.boot_hwid);
        self.mpidr_hash = MpidrHash::build(&self.topology);
        self.numa.map_cpus(&self.topology);
        log::info!("smp: {} possible CPUs", self.topology.num_possible());
    }

    /// Activate CMA and count the frames the page allocator receives
    /// (`mem_init`).
    #[must_use]
    pub fn handoff(self) -> System {
        let Self {
            config,
            fdt,
            mut memblock,
            layout,
            mut registry,
            dma,
            mut numa,
            sparse,
            zones,
            hugetlb,
            hyp,
            crashk,
            topology,
            mpidr_hash,
            ..
        } = self;

        registry.activate(&mut memblock, |pfn| zones::zone_of(&numa, pfn));
        zones::compute_managed(&mut numa, &memblock, &registry);

        let system = System {
            config,
            params: fdt.params,
            machine: fdt.machine.map(ToString::to_string),
            memblock,
            layout,
            numa,
            sparse,
            zones,
            cma: registry,
            dma,
            hugetlb,
            hyp,
            crashk,
            topology,
            mpidr_hash,
        };
        log::info!(
            "Memory: {}K/{}K available ({}K cma-reserved)",
            system.totalram_pages() << 2,
            system.memblock.phys_mem_size() >> 10,
            system.cma.total_pages() << 2
        );
        system
    }
}

// -- Frozen state

/// Memory state once boot is over.
#[derive(Debug)]
pub struct System {
    pub config: KernelConfig,
    pub params: BootParams,
    pub machine: Option<String>,
    pub memblock: Memblock,
    pub layout: MemoryLayout,
    pub numa: Numa,
    pub sparse: Sparse,
    pub zones: ZonePlan,
    pub cma: CmaRegistry,
    pub dma: DmaContiguous,
    pub hugetlb: HugetlbCma,
    pub hyp: Option<HypMemory>,
    /// `crashk_res`
    pub crashk: Option<CrashKernel>,
    pub topology: CpuTopology,
    pub mpidr_hash: MpidrHash,
}

impl System {
    /// `memstart_addr`
    #[inline]
    #[must_use]
    pub const fn memstart(&self) -> u64 {
        self.layout.linear.memstart
    }

    /// `arm64_dma_phys_limit`
    #[inline]
    #[must_use]
    pub const fn arm64_dma_phys_limit(&self) -> u64 {
        self.zones.arm64_dma_phys_limit
    }

    #[inline]
    #[must_use]
    pub const fn phys_to_virt(&self, pa: Pa) -> Va {
        self.layout.linear.phys_to_virt(pa)
    }

    /// Whether `pfn` has a memory map entry.
    #[must_use]
    pub fn pfn_valid(&self, pfn: Pfn) -> bool {
        self.sparse.pfn_valid(&self.memblock, pfn)
    }

    /// Whether `pfn` is RAM covered by the linear map.
    #[must_use]
    pub fn pfn_is_map_memory(&self, pfn: Pfn) -> bool {
        sparse::pfn_is_map_memory(&self.memblock, pfn)
    }

    /// `__node_distance`
    #[must_use]
    pub fn node_distance(&self, from: NodeId, to: NodeId) -> u8 {
        self.numa.node_distance(from, to)
    }

    /// Frames handed to the page allocator (`totalram_pages`).
    #[must_use]
    pub fn totalram_pages(&self) -> u64 {
        self.numa
            .nodes()
            .flat_map(|nd| nd.zones.iter())
            .map(|z| z.managed)
            .sum()
    }

    /// `dma_alloc_contiguous`
    #[must_use]
    pub fn dma_alloc_contiguous(
        &self,
        dev: &DmaDevice,
        size: u64,
        gfp: GfpFlags,
        ops: &dyn ContigRange,
    ) -> Option<Pfn> {
        self.dma.alloc(&self.cma, dev, size, gfp, ops)
    }

    /// `dma_free_contiguous`
    pub fn dma_free_contiguous(
        &self,
        dev: &DmaDevice,
        pfn: Pfn,
        size: u64,
        ops: &dyn ContigRange,
    ) -> FreedTo {
        self.dma.free(&self.cma, dev, pfn, size, ops)
    }
}

static SYSTEM: Once<System> = Once::new();

/// Freeze the boot result for the rest of the kernel. Only the first call
/// stores its argument; later ones get the existing state back.
pub fn publish(system: System) -> &'static System {
    SYSTEM.call_once(|| system)
}

/// The published state, if boot has finished.
#[must_use]
pub fn system() -> Option<&'static System> {
    SYSTEM.get()
}

/// Run the whole bring-up, aborting on the first fatal error.
///
/// Installs the boot logger first; an early console registered with
/// [`set_early_console`](crate::logging::set_early_console) sees every
/// stage.
pub fn boot<P: Platform + ?Sized>(args: BootArgs<'_>, platform: &mut P) -> &'static System {
    crate::logging::init();
    match try_boot(args, platform) {
        Ok(system) => publish(system),
        Err(failure) => failure.fatal(),
    }
}

fn try_boot<P: Platform + ?Sized>(args: BootArgs<'_>, platform: &mut P) -> Result<System, BootFailure> {
    let mut ctx = BootCtx::new(args)?;
    ctx.paging_init(platform)?;
    let mut mem = ctx.bootmem_init(platform)?;
    mem.smp_init();
    Ok(mem.handoff())
}
