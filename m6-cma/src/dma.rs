//! DMA Contiguous Pools
//!
//! Front end used by the DMA mapping layer: a global default area (from
//! `cma=`, from a `linux,cma-default` device tree pool, or from the build
//! default size), optional per-node areas (`cma_pernuma=`), and per-device
//! areas bound from the device tree.

use m6_common::memory::{page_align, PAGE_SHIFT, SZ_1M};
use m6_common::numa::MAX_NUMNODES;
use m6_common::size::memparse;
use m6_common::{NodeId, NodeMask, Pfn};
use m6_memblock::Memblock;

use crate::area::CmaId;
use crate::error::CmaError;
use crate::migrate::{ContigRange, GfpFlags};
use crate::registry::{CmaDeclaration, CmaRegistry, CMA_MIN_ALIGNMENT};

/// Largest alignment order honoured for DMA allocations
/// (`CONFIG_CMA_ALIGNMENT`).
pub const DEFAULT_CMA_ALIGNMENT: u32 = 8;

/// A parsed `cma=size[@base[-limit]]` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmaCmdline {
    pub size: u64,
    pub base: u64,
    /// 0 when no upper bound was given
    pub limit: u64,
}

impl CmaCmdline {
    /// Parse the value of a `cma=` parameter.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let (size, rest) = memparse(value)?;
        let Some(rest) = rest.strip_prefix('@') else {
            return Some(Self {
                size,
                base: 0,
                limit: 0,
            });
        };
        let (base, rest) = memparse(rest)?;
        let limit = match rest.strip_prefix('-') {
            Some(rest) => memparse(rest)?.0,
            None => base.wrapping_add(size),
        };
        Some(Self { size, base, limit })
    }
}

/// What a device tree `shared-dma-pool` node asked for.
#[derive(Debug, Clone, Copy)]
pub struct ReservedPool<'a> {
    pub name: &'a str,
    pub base: u64,
    pub size: u64,
    pub reusable: bool,
    pub no_map: bool,
    /// Carries `linux,cma-default`
    pub default: bool,
}

/// Outcome of [`DmaContiguous::setup_reserved_pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolSetup {
    /// The pool became a CMA area
    Created(CmaId),
    /// A command line `cma=` overrides this default pool
    Bypassed,
}

/// Where [`DmaContiguous::free`] put pages back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreedTo {
    Device(CmaId),
    PerNode(NodeId),
    Default,
    /// Not CMA memory: the caller returns it to the buddy allocator
    Buddy,
}

/// The DMA view of one device.
#[derive(Debug, Clone, Copy, Default)]
pub struct DmaDevice {
    /// Area bound to the device from its `memory-region`
    pub cma_area: Option<CmaId>,
    pub nid: Option<NodeId>,
}

/// Global and per-node DMA contiguous areas.
#[derive(Debug, Clone)]
pub struct DmaContiguous {
    default_area: Option<CmaId>,
    pernuma: [Option<CmaId>; MAX_NUMNODES],
    cmdline: Option<CmaCmdline>,
    pernuma_size: u64,
    alignment: u32,
}

impl Default for DmaContiguous {
    fn default() -> Self {
        Self::new(None, 0)
    }
}

impl DmaContiguous {
    /// Create the front end from the parsed `cma=` and `cma_pernuma=`
    /// parameters.
    #[must_use]
    pub fn new(cmdline: Option<CmaCmdline>, pernuma_size: u64) -> Self {
        Self {
            default_area: None,
            pernuma: [None; MAX_NUMNODES],
            cmdline,
            pernuma_size,
            alignment: DEFAULT_CMA_ALIGNMENT,
        }
    }

    /// Override the maximum allocation alignment order.
    pub fn set_alignment(&mut self, order: u32) {
        self.alignment = order;
    }

    /// The global default area (`dma_contiguous_default_area`).
    #[must_use]
    pub fn default_area(&self) -> Option<CmaId> {
        self.default_area
    }

    #[must_use]
    pub fn pernuma_area(&self, nid: NodeId) -> Option<CmaId> {
        self.pernuma[nid.index()]
    }

    #[must_use]
    pub fn cmdline(&self) -> Option<CmaCmdline> {
        self.cmdline
    }

    /// Register a device tree `shared-dma-pool` marked `reusable`
    /// (`rmem_cma_setup`). The range is already reserved.
    ///
    /// # Errors
    ///
    /// - [`CmaError::InvalidRange`] if the pool is not reusable or is `no-map`
    /// - [`CmaError::Misaligned`] if the pool breaks the CMA alignment
    /// - any error of [`CmaRegistry::init_reserved_mem`]
    pub fn setup_reserved_pool(
        &mut self,
        registry: &mut CmaRegistry,
        memblock: &Memblock,
        pool: &ReservedPool<'_>,
    ) -> Result<PoolSetup, CmaError> {
        if self.cmdline.is_some() && pool.default {
            log::info!(
                "Reserved memory: bypass {} node, using cmdline CMA params instead",
                pool.name
            );
            return Ok(PoolSetup::Bypassed);
        }
        if !pool.reusable || pool.no_map {
            return Err(CmaError::InvalidRange);
        }
        let mask = CMA_MIN_ALIGNMENT - 1;
        if pool.base & mask != 0 || pool.size & mask != 0 {
            log::error!("Reserved memory: incorrect alignment of CMA region");
            return Err(CmaError::Misaligned {
                base: pool.base,
                size: pool.size,
                align: CMA_MIN_ALIGNMENT,
            });
        }

        let id = registry
            .init_reserved_mem(memblock, pool.base, pool.size, 0, Some(pool.name), None)
            .inspect_err(|_| log::error!("Reserved memory: unable to setup CMA region"))?;
        if pool.default {
            self.default_area = Some(id);
        }
        log::info!(
            "Reserved memory: created CMA memory pool at {:#x}, size {} MiB",
            pool.base,
            pool.size / SZ_1M
        );
        Ok(PoolSetup::Created(id))
    }

    /// Reserve the default area below `limit` (`dma_contiguous_reserve`).
    ///
    /// The command line wins; otherwise `default_size` bytes are used.
    /// Nothing happens if a default area already exists.
    pub fn reserve(
        &mut self,
        registry: &mut CmaRegistry,
        memblock: &mut Memblock,
        limit: u64,
        default_size: u64,
    ) {
        log::debug!("dma_contiguous_reserve(limit {:#x})", limit);

        let (size, base, limit, fixed) = match self.cmdline {
            Some(cmd) => {
                let limit = match cmd.limit {
                    0 => limit,
                    l => l.min(limit),
                };
                let fixed = cmd.limit != 0 && cmd.base.wrapping_add(cmd.size) == cmd.limit;
                (cmd.size, cmd.base, limit, fixed)
            }
            None => (default_size, 0, limit, false),
        };

        if size == 0 || self.default_area.is_some() {
            return;
        }
        log::debug!("dma_contiguous_reserve: reserving {} MiB for global area", size / SZ_1M);
        match reserve_area(registry, memblock, size, base, limit, fixed) {
            Ok(id) => self.default_area = Some(id),
            Err(err) => log::error!("dma_contiguous_reserve: failed to reserve global area: {}", err),
        }
    }

    /// Reserve one area on each online node (`dma_pernuma_cma_reserve`).
    pub fn pernuma_reserve(
        &mut self,
        registry: &mut CmaRegistry,
        memblock: &mut Memblock,
        online: NodeMask,
    ) {
        if self.pernuma_size == 0 {
            return;
        }
        for nid in online.iter() {
            let name = alloc::format!("pernuma{}", nid);
            let decl = CmaDeclaration {
                nid: Some(nid),
                ..CmaDeclaration::new(self.pernuma_size, &name)
            };
            match registry.declare_contiguous_nid(memblock, &decl) {
                Ok(id) => {
                    self.pernuma[nid.index()] = Some(id);
                    log::debug!(
                        "dma_pernuma_cma_reserve: reserved {} MiB on node {}",
                        self.pernuma_size / SZ_1M,
                        nid
                    );
                }
                Err(err) => log::warn!(
                    "dma_pernuma_cma_reserve: reservation failed: err {}, node {}",
                    err,
                    nid
                ),
            }
        }
    }

    fn alloc_aligned(
        &self,
        registry: &CmaRegistry,
        id: CmaId,
        size: u64,
        gfp: GfpFlags,
        ops: &dyn ContigRange,
    ) -> Option<Pfn> {
        let align = get_order(size).min(self.alignment);
        let no_warn = gfp.contains(GfpFlags::NOWARN);
        registry
            .get(id)
            .alloc(page_align(size) >> PAGE_SHIFT, align, no_warn, ops)
            .ok()
    }

    /// Allocate `size` bytes of contiguous memory for `dev`
    /// (`dma_alloc_contiguous`).
    ///
    /// The device's own area is tried first. Single pages are left to the
    /// buddy allocator. Otherwise the device node's area is tried (unless
    /// the caller needs a DMA zone), then the default area.
    #[must_use]
    pub fn alloc(
        &self,
        registry: &CmaRegistry,
        dev: &DmaDevice,
        size: u64,
        gfp: GfpFlags,
        ops: &dyn ContigRange,
    ) -> Option<Pfn> {
        if !gfp.allows_blocking() {
            return None;
        }
        if let Some(id) = dev.cma_area {
            return self.alloc_aligned(registry, id, size, gfp, ops);
        }
        if size <= m6_common::memory::PAGE_SIZE {
            return None;
        }
        if let Some(nid) = dev.nid {
            if !gfp.intersects(GfpFlags::DMA | GfpFlags::DMA32) {
                if let Some(id) = self.pernuma[nid.index()] {
                    if let Some(pfn) = self.alloc_aligned(registry, id, size, gfp, ops) {
                        return Some(pfn);
                    }
                }
            }
        }
        let id = self.default_area?;
        self.alloc_aligned(registry, id, size, gfp, ops)
    }

    /// Release memory from [`alloc`](Self::alloc) (`dma_free_contiguous`).
    pub fn free(
        &self,
        registry: &CmaRegistry,
        dev: &DmaDevice,
        pfn: Pfn,
        size: u64,
        ops: &dyn ContigRange,
    ) -> FreedTo {
        let count = page_align(size) >> PAGE_SHIFT;
        if let Some(id) = dev.cma_area {
            if registry.get(id).release(pfn, count, ops).is_ok() {
                return FreedTo::Device(id);
            }
            return FreedTo::Buddy;
        }
        for (idx, area) in self.pernuma.iter().enumerate() {
            let Some(id) = area else { continue };
            if registry.get(*id).release(pfn, count, ops).is_ok() {
                if let Some(nid) = NodeId::new(idx as u32) {
                    return FreedTo::PerNode(nid);
                }
            }
        }
        if let Some(id) = self.default_area {
            if registry.get(id).release(pfn, count, ops).is_ok() {
                return FreedTo::Default;
            }
        }
        FreedTo::Buddy
    }
}

/// Reserve a device-private area (`dma_contiguous_reserve_area`).
///
/// # Errors
///
/// Any error of [`CmaRegistry::declare_contiguous_nid`].
pub fn reserve_area(
    registry: &mut CmaRegistry,
    memblock: &mut Memblock,
    size: u64,
    base: u64,
    limit: u64,
    fixed: bool,
) -> Result<CmaId, CmaError> {
    let decl = CmaDeclaration {
        base,
        limit,
        fixed,
        ..CmaDeclaration::new(size, "reserved")
    };
    registry.declare_contiguous_nid(memblock, &decl)
}

/// Buddy order covering `size` bytes (`get_order`).
#[must_use]
pub fn get_order(size: u64) -> u32 {
    let pages = page_align(size.max(1)) >> PAGE_SHIFT;
    m6_common::addr::fls64(pages - 1)
}
