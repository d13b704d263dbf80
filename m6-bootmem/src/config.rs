//! Build Configuration
//!
//! Compile-time choices that shape the memory layout, gathered in one
//! `Copy` struct so alternative builds (for example a 52-bit VA kernel) can
//! be exercised side by side. [`KernelConfig::DEFAULT`] matches a stock
//! arm64 defconfig with a 4 KiB granule.

/// Kernel build configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Kernel virtual address width (48 or 52)
    pub va_bits: u32,
    /// Physical address width (`PHYS_MASK_SHIFT`, 48 or 52)
    pub pa_bits: u32,
    /// Provide ZONE_DMA sized from firmware DMA limits
    pub zone_dma: bool,
    /// Provide ZONE_DMA32 below 4 GiB
    pub zone_dma32: bool,
    /// NUMA support
    pub numa: bool,
    /// Contiguous memory allocator
    pub cma: bool,
    /// Default global CMA size in MiB when `cma=` is absent
    pub cma_size_mbytes: u64,
    /// Extra CMA area slots (`CONFIG_CMA_AREAS`)
    pub cma_areas: usize,
    /// Largest alignment order for DMA CMA allocations
    pub cma_alignment: u32,
    /// Per-node CMA areas for DMA
    pub dma_pernuma_cma: bool,
    /// Gigantic page CMA areas (`hugetlb_cma=`)
    pub hugetlb_cma: bool,
    /// Randomise the linear map base
    pub randomize_base: bool,
    /// Crash kernel reservation
    pub kexec_core: bool,
    /// Initial ramdisk support
    pub blk_dev_initrd: bool,
    /// Protected KVM hypervisor pool
    pub kvm: bool,
    /// Reject distance maps that are not symmetric
    pub strict_distance_map: bool,
}

impl KernelConfig {
    pub const DEFAULT: Self = Self {
        va_bits: 48,
        pa_bits: 48,
        zone_dma: true,
        zone_dma32: true,
        numa: true,
        cma: true,
        cma_size_mbytes: 0,
        cma_areas: 19,
        cma_alignment: 8,
        dma_pernuma_cma: true,
        hugetlb_cma: true,
        randomize_base: true,
        kexec_core: true,
        blk_dev_initrd: true,
        kvm: true,
        strict_distance_map: false,
    };

    /// Smallest VA width any CPU running this build may offer.
    #[must_use]
    pub const fn va_bits_min(&self) -> u32 {
        if self.va_bits > 48 { 48 } else { self.va_bits }
    }

    /// `PAGE_OFFSET` of this build.
    #[must_use]
    pub const fn page_offset(&self) -> u64 {
        page_offset_for(self.va_bits)
    }

    /// End of the linear region (`PAGE_END`).
    #[must_use]
    pub const fn page_end(&self) -> u64 {
        page_offset_for(self.va_bits_min() - 1)
    }

    /// Largest valid physical address plus one (`PHYS_MASK + 1`).
    #[must_use]
    pub const fn phys_limit(&self) -> u64 {
        1 << self.pa_bits
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Base of the linear map for a VA width (`_PAGE_OFFSET(va)`).
#[inline]
#[must_use]
pub const fn page_offset_for(va_bits: u32) -> u64 {
    u64::MAX << va_bits
}
