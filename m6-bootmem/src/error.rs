//! Boot Memory Errors
//!
//! Every stage of the bring-up reports failures as a [`BootError`]. Only
//! the pipeline decides what is fatal: stages with a fallback (NUMA falls
//! back to a single node, CMA and crash kernel reservations are optional)
//! log and continue, everything else ends in [`fatal`].

use core::fmt;

use m6_memblock::MemblockError;

/// What was wrong with the firmware description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareFault {
    /// The blob is missing or its header or structure cannot be parsed
    Unparseable,
    /// The blob is not 8-byte aligned
    Misaligned,
    /// The blob is larger than the early mapping
    TooLarge,
    /// `#address-cells` or `#size-cells` outside what fits in 64 bits
    CellWidth,
    /// A `reg`-like property is not a whole number of tuples
    BadReg,
    /// A reserved-memory node is both `reusable` and `no-map`
    ReusableNoMap,
    /// A required property is absent
    MissingProperty,
}

impl fmt::Display for FirmwareFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unparseable => write!(f, "device tree blob is not valid"),
            Self::Misaligned => write!(f, "device tree blob is not 8-byte aligned"),
            Self::TooLarge => write!(f, "device tree blob is too large"),
            Self::CellWidth => write!(f, "unsupported cell width"),
            Self::BadReg => write!(f, "malformed reg property"),
            Self::ReusableNoMap => write!(f, "reserved region is both reusable and no-map"),
            Self::MissingProperty => write!(f, "required property missing"),
        }
    }
}

/// Boot-time memory bring-up errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum BootError {
    /// Malformed or contradictory firmware data at `addr`
    BadFirmware { fault: FirmwareFault, addr: u64 },
    /// No room left for a required allocation
    OutOfAddressSpace { what: &'static str, size: u64 },
    /// Clipping left no usable RAM
    NoMemory,
    /// A node id from firmware is `>= MAX_NUMNODES`
    NodeOutOfRange { nid: u32 },
    /// A memory range has no valid node after NUMA parsing
    UnboundMemory { base: u64 },
    /// A distance entry breaks the local/remote rule
    InvalidDistance { from: u32, to: u32, distance: u32 },
    /// Firmware described no NUMA topology
    NoNumaConfig,
    /// More memory ranges than the hypervisor can track
    HypRegionOverflow { regions: usize },
    /// A frame lies beyond the sparse section table
    SectionOverflow { pfn: u64 },
    /// A CMA pool violates the CMA alignment
    CmaMisaligned { base: u64, size: u64 },
}

impl BootError {
    /// The physical address most relevant to the failure, 0 if none.
    #[must_use]
    pub const fn address(&self) -> u64 {
        match *self {
            Self::BadFirmware { addr, .. } => addr,
            Self::UnboundMemory { base } => base,
            Self::SectionOverflow { pfn } => pfn << m6_common::memory::PAGE_SHIFT,
            Self::CmaMisaligned { base, .. } => base,
            _ => 0,
        }
    }
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadFirmware { fault, addr } => write!(f, "bad firmware at {:#x}: {}", addr, fault),
            Self::OutOfAddressSpace { what, size } => {
                write!(f, "cannot allocate {:#x} bytes for {}", size, what)
            }
            Self::NoMemory => write!(f, "no usable memory left"),
            Self::NodeOutOfRange { nid } => write!(f, "node id {} exceeds maximum value", nid),
            Self::UnboundMemory { base } => write!(f, "memory at {:#x} has no valid node", base),
            Self::InvalidDistance { from, to, distance } => {
                write!(f, "invalid distance[node{} -> node{}] = {}", from, to, distance)
            }
            Self::NoNumaConfig => write!(f, "no NUMA configuration found"),
            Self::HypRegionOverflow { regions } => {
                write!(f, "{} memory regions exceed the hypervisor table", regions)
            }
            Self::SectionOverflow { pfn } => write!(f, "pfn {:#x} beyond the section table", pfn),
            Self::CmaMisaligned { base, size } => {
                write!(f, "CMA region {:#x}+{:#x} is misaligned", base, size)
            }
        }
    }
}

impl From<MemblockError> for BootError {
    fn from(err: MemblockError) -> Self {
        match err {
            MemblockError::Overflow { base, .. } => Self::BadFirmware {
                fault: FirmwareFault::BadReg,
                addr: base,
            },
            MemblockError::OutOfSpace { size, .. } => Self::OutOfAddressSpace {
                what: "memblock",
                size,
            },
        }
    }
}

/// Pipeline stage, used to label fatal errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStage {
    EarlyFdtMap,
    SetupMachineFdt,
    MemblockInit,
    PagingInit,
    Numa,
    HugetlbCma,
    PernumaCma,
    HypReserve,
    Sparse,
    Zones,
    DmaContiguous,
    CrashKernel,
    Handoff,
}

impl fmt::Display for BootStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EarlyFdtMap => "early_fdt_map",
            Self::SetupMachineFdt => "setup_machine_fdt",
            Self::MemblockInit => "arm64_memblock_init",
            Self::PagingInit => "paging_init",
            Self::Numa => "numa_init",
            Self::HugetlbCma => "hugetlb_cma_reserve",
            Self::PernumaCma => "dma_pernuma_cma_reserve",
            Self::HypReserve => "kvm_hyp_reserve",
            Self::Sparse => "sparse_init",
            Self::Zones => "zone_sizes_init",
            Self::DmaContiguous => "dma_contiguous_reserve",
            Self::CrashKernel => "reserve_crashkernel",
            Self::Handoff => "mem_init",
        };
        f.write_str(name)
    }
}

/// A [`BootError`] tagged with the stage that raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootFailure {
    pub stage: BootStage,
    pub error: BootError,
}

impl BootFailure {
    /// Tag errors of `stage`, for use with `map_err`.
    pub fn at(stage: BootStage) -> impl FnOnce(BootError) -> Self {
        move |error| Self { stage, error }
    }

    /// Give up on this failure, see [`fatal`].
    pub fn fatal(self) -> ! {
        fatal(self.stage, self.error)
    }
}

impl fmt::Display for BootFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage, self.error)
    }
}

/// Abort boot: log the stage and offending address, then panic. The
/// kernel panic handler parks the CPU.
pub fn fatal(stage: BootStage, err: BootError) -> ! {
    log::error!("{}: {} (address {:#x})", stage, err, err.address());
    panic!("{}: {}", stage, err);
}
