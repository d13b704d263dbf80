//! Boot CPU Identification
//!
//! The few properties of the boot CPU that shape the memory layout. On
//! arm64 targets they are read from system registers; elsewhere (and in
//! tests) they are supplied by the caller.

/// Bits of `MPIDR_EL1` that identify a CPU (Aff3 and Aff2..Aff0).
pub const MPIDR_HWID_BITMASK: u64 = 0xff_00ff_ffff;

/// Properties of the CPU running the boot path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootCpu {
    /// Raw `MPIDR_EL1`
    pub mpidr: u64,
    /// Virtual address width the MMU supports (48 or 52)
    pub va_bits: u32,
    /// Physical address width from `ID_AA64MMFR0_EL1.PARange`
    pub pa_range_bits: u32,
    /// The kernel was entered at EL2
    pub entered_el2: bool,
    /// The kernel runs at EL2 with VHE
    pub vhe: bool,
}

impl BootCpu {
    /// Hardware id used for the logical CPU map.
    #[inline]
    #[must_use]
    pub const fn hwid(&self) -> u64 {
        self.mpidr & MPIDR_HWID_BITMASK
    }

    /// EL2 is available to host a hypervisor (`is_hyp_mode_available`).
    #[inline]
    #[must_use]
    pub const fn hyp_mode_available(&self) -> bool {
        self.entered_el2
    }

    /// The kernel itself is the hypervisor (`is_kernel_in_hyp_mode`).
    #[inline]
    #[must_use]
    pub const fn kernel_in_hyp_mode(&self) -> bool {
        self.vhe
    }

    /// Read the boot CPU's identification registers.
    ///
    /// # Arguments
    ///
    /// * `entered_el2` - boot mode recorded by the entry code before any
    ///   exception level switch
    #[cfg(target_arch = "aarch64")]
    #[must_use]
    pub fn detect(entered_el2: bool) -> Self {
        use aarch64_cpu::registers::{CurrentEL, Readable, ID_AA64MMFR0_EL1, MPIDR_EL1};

        let parange = ID_AA64MMFR0_EL1.read(ID_AA64MMFR0_EL1::PARange);
        let el = CurrentEL.read(CurrentEL::EL);

        let mmfr2: u64;
        // SAFETY: ID_AA64MMFR2_EL1 is readable at EL1 and above and has no
        // side effects.
        unsafe {
            core::arch::asm!("mrs {}, ID_AA64MMFR2_EL1", out(reg) mmfr2, options(nomem, nostack));
        }
        let varange = (mmfr2 >> 16) & 0xf;

        Self {
            mpidr: MPIDR_EL1.get(),
            va_bits: if varange == 1 { 52 } else { 48 },
            pa_range_bits: parange_to_phys_shift(parange),
            entered_el2: entered_el2 || el == 2,
            vhe: el == 2,
        }
    }
}

/// Decode `ID_AA64MMFR0_EL1.PARange` into an address width.
#[must_use]
pub const fn parange_to_phys_shift(parange: u64) -> u32 {
    match parange {
        0 => 32,
        1 => 36,
        2 => 40,
        3 => 42,
        4 => 44,
        5 => 48,
        6 => 52,
        // Reserved encodings are treated as the largest supported width.
        _ => 52,
    }
}
