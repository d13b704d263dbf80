//! Linear Map Layout
//!
//! All of RAM is mapped once into the kernel half of the address space,
//! starting at `PAGE_OFFSET`. The physical address that lands on
//! `PAGE_OFFSET` is `memstart`; it need not be RAM, and after the 52-bit
//! correction it need not even be a valid physical address, so every
//! conversion here uses wrapping arithmetic.
//!
//! ```text
//! PAGE_OFFSET                                  PAGE_END
//!      |<------------------ L ------------------->|
//!      | memstart ... start_of_dram ... end_of_dram |
//! ```

use m6_common::{Pa, Va};

use crate::config::{page_offset_for, KernelConfig};
use crate::cpu::BootCpu;

/// Physical placement of the kernel image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelImage {
    /// Start of the image (`_text`)
    pub text: u64,
    /// Start of executable code (`_stext`)
    pub stext: u64,
    /// End of the image including BSS and initial page tables (`_end`)
    pub end: u64,
}

impl KernelImage {
    /// Bytes from `_text` to `_end`.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.end - self.text
    }
}

/// Linear map parameters fixed by `arm64_memblock_init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearMap {
    /// Physical address of `PAGE_OFFSET` (`memstart_addr`)
    pub memstart: u64,
    /// `PAGE_OFFSET` of the build
    pub page_offset: u64,
    /// `PAGE_END` of the build
    pub page_end: u64,
    /// VA width in use (`vabits_actual`)
    pub vabits_actual: u32,
}

impl LinearMap {
    /// Layout before `memstart` is known.
    #[must_use]
    pub const fn new(config: &KernelConfig, cpu: &BootCpu) -> Self {
        Self {
            memstart: 0,
            page_offset: config.page_offset(),
            page_end: config.page_end(),
            vabits_actual: vabits_actual(config, cpu),
        }
    }

    /// Bytes of physical memory the linear map can cover.
    #[inline]
    #[must_use]
    pub const fn region_size(&self) -> u64 {
        self.page_end.wrapping_sub(page_offset_for(self.vabits_actual))
    }

    /// `__phys_to_virt`
    #[inline]
    #[must_use]
    pub const fn phys_to_virt(&self, pa: Pa) -> Va {
        Va(pa.0.wrapping_sub(self.memstart) | self.page_offset)
    }

    /// `__lm_to_phys`; only meaningful for linear addresses.
    #[inline]
    #[must_use]
    pub const fn virt_to_phys(&self, va: Va) -> Pa {
        Pa((va.0 & !self.page_offset).wrapping_add(self.memstart))
    }

    /// `__is_lm_address`
    #[inline]
    #[must_use]
    pub const fn is_linear(&self, va: Va) -> bool {
        va.0.wrapping_sub(self.page_offset) < self.page_end.wrapping_sub(self.page_offset)
    }
}

/// VA width the MMU will be programmed with.
#[must_use]
pub const fn vabits_actual(config: &KernelConfig, cpu: &BootCpu) -> u32 {
    if config.va_bits == 52 && cpu.va_bits < 52 {
        48
    } else {
        config.va_bits
    }
}
