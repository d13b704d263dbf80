//! ARM64 Memory Layout Enforcement
//!
//! Trims the region table filled from firmware to what the linear map can
//! cover and fixes `memstart`, the physical base of the linear map.
//!
//! # Ordering
//!
//! 1. drop memory above the supported physical address width
//! 2. `memstart` = start of DRAM rounded down to [`MEMSTART_ALIGN`]
//! 3. drop memory beyond the reach of the linear map, keeping the kernel
//! 4. if the kernel forced memory past that reach, slide `memstart` up and
//!    drop memory below it
//! 5. 52-bit VA builds on 48-bit CPUs shift `memstart` down
//! 6. `mem=`: cap RAM, then re-add the kernel image
//! 7. initrd: re-add and reserve when it is linearly mapped
//! 8. KASLR: randomise `memstart` within the slack of the linear map
//! 9. reserve the kernel image
//! 10. reserved-memory scan (may declare CMA pools)
//! 11. `high_memory`

use alloc::vec::Vec;

use m6_common::addr::{align_down, align_up};
use m6_common::memory::{page_align, MEMSTART_ALIGN, PAGE_MASK};
use m6_common::{Pa, Va};
use m6_memblock::Memblock;

use crate::config::{page_offset_for, KernelConfig};
use crate::cpu::BootCpu;
use crate::error::BootError;
use crate::fdt::{self, CmaSinks, FdtBlob, ReservedMem};
use crate::layout::{KernelImage, LinearMap};

/// Largest linear map usable by an nVHE hypervisor on LVA hardware.
const NVHE_LINEAR_LIMIT: u64 = 1 << 51;

/// Inputs of [`arm64_memblock_init`] besides the region table.
#[derive(Debug, Clone, Copy)]
pub struct ArchInit<'p> {
    pub config: &'p KernelConfig,
    pub cpu: &'p BootCpu,
    pub image: KernelImage,
    /// `mem=`
    pub mem_limit: Option<u64>,
    /// Physical `[start, end)` of the initrd
    pub initrd: Option<(u64, u64)>,
    /// Low 16 bits of the KASLR seed, 0 when randomisation is off
    pub memstart_offset_seed: u16,
}

/// The initial ramdisk once it is known to be linearly mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Initrd {
    pub phys_start: u64,
    pub phys_size: u64,
    /// Linear address of the first byte (`initrd_start`)
    pub start: Va,
    /// Linear address past the last byte (`initrd_end`)
    pub end: Va,
}

/// Outcome of [`arm64_memblock_init`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryLayout {
    pub linear: LinearMap,
    /// Bytes the linear map covers after any nVHE cap
    pub linear_region_size: u64,
    pub initrd: Option<Initrd>,
    /// Linear address past the end of DRAM
    pub high_memory: Va,
    /// Regions claimed by `/reserved-memory`
    pub reserved_mem: Vec<ReservedMem>,
}

/// Enforce the linear map contract on the region table.
///
/// # Arguments
///
/// * `memblock` - table as filled by the memory node scan
/// * `args` - build, CPU and boot loader inputs
/// * `fdt` - the device tree, for the reserved-memory pass
/// * `cma` - CMA state reusable pools are declared into
///
/// # Errors
///
/// - [`BootError::NoMemory`] if no RAM is left after clipping
/// - any error of [`fdt::scan_reserved`]
pub fn arm64_memblock_init<'a>(
    memblock: &mut Memblock,
    args: &ArchInit<'_>,
    fdt: &'a FdtBlob<'a>,
    cma: Option<CmaSinks<'_>>,
) -> Result<MemoryLayout, BootError> {
    let config = args.config;
    let cpu = args.cpu;
    let image = args.image;
    let mut linear = LinearMap::new(config, cpu);
    let mut region_size = linear.region_size();

    if config.kvm
        && linear.vabits_actual == 52
        && cpu.hyp_mode_available()
        && !cpu.kernel_in_hyp_mode()
    {
        log::info!("Capping linear region to 51 bits for KVM in nVHE mode on LVA capable hardware.");
        region_size = region_size.min(NVHE_LINEAR_LIMIT);
    }

    // 1
    memblock.remove(config.phys_limit(), u64::MAX);
    if memblock.memory().is_empty() {
        log::error!("no memory below {:#x}", config.phys_limit());
        return Err(BootError::NoMemory);
    }

    // 2
    let mut memstart = align_down(memblock.start_of_dram(), MEMSTART_ALIGN);
    if memblock.end_of_dram() - memstart > region_size {
        log::warn!("Memory doesn't fit in the linear mapping, VA_BITS too small");
    }

    // 3
    let reach = memstart.saturating_add(region_size);
    memblock.remove(reach.max(image.end), u64::MAX);

    // 4
    if reach < memblock.end_of_dram() {
        memstart = align_up(memblock.end_of_dram() - region_size, MEMSTART_ALIGN);
        memblock.remove(0, memstart);
    }

    // 5
    if config.va_bits == 52 && linear.vabits_actual != 52 {
        memstart = memstart.wrapping_sub(page_offset_for(48).wrapping_sub(page_offset_for(52)));
    }

    // 6
    if let Some(limit) = args.mem_limit {
        memblock.mem_limit_remove_map(limit);
        memblock.add(image.text, image.size())?;
    }

    // 7
    let initrd = match args.initrd {
        Some((start, end)) if config.blk_dev_initrd && end > start => {
            let base = start & !PAGE_MASK;
            let size = page_align(end) - base;
            let dram = memblock.start_of_dram();
            if base < dram || base + size > dram.saturating_add(region_size) {
                log::warn!(
                    "initrd not fully accessible via the linear mapping -- please check your bootloader ..."
                );
                None
            } else {
                // clears any flags the range picked up
                memblock.remove(base, size);
                memblock.add(base, size)?;
                memblock.reserve(base, size)?;
                Some((start, end - start))
            }
        }
        _ => None,
    };

    // 8
    if config.randomize_base && args.memstart_offset_seed > 0 {
        let pa_reach = 1u64 << cpu.pa_range_bits;
        if let Some(range) = region_size.checked_sub(pa_reach).filter(|&r| r >= MEMSTART_ALIGN) {
            let slots = range / MEMSTART_ALIGN;
            let nudge = (slots * u64::from(args.memstart_offset_seed)) >> 16;
            memstart = memstart.wrapping_sub(MEMSTART_ALIGN * nudge);
        }
    }
    linear.memstart = memstart;

    // 9
    memblock.reserve(image.stext, image.end - image.stext)?;
    let initrd = initrd.map(|(phys_start, phys_size)| {
        let start = linear.phys_to_virt(Pa(phys_start));
        Initrd {
            phys_start,
            phys_size,
            start,
            end: Va(start.0 + phys_size),
        }
    });

    // 10
    let reserved_mem = fdt::scan_reserved(fdt, memblock, cma)?;

    if memblock.memory().is_empty() {
        return Err(BootError::NoMemory);
    }

    // 11
    let high_memory = Va(linear.phys_to_virt(Pa(memblock.end_of_dram() - 1)).0 + 1);

    log::info!(
        "memstart_addr {:#x}, linear region {:#x} bytes, DRAM [{:#018x}-{:#018x}]",
        memstart,
        region_size,
        memblock.start_of_dram(),
        memblock.end_of_dram() - 1
    );

    Ok(MemoryLayout {
        linear,
        linear_region_size: region_size,
        initrd,
        high_memory,
        reserved_mem,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fdt::early_fdt_map;
    use crate::fdt::testutil::FdtBuilder;
    use m6_common::memory::{SZ_1G, SZ_2M};

    const IMAGE: KernelImage = KernelImage {
        text: 0xa020_0000,
        stext: 0xa021_0000,
        end: 0xa220_0000,
    };

    fn cpu() -> BootCpu {
        BootCpu {
            mpidr: 0,
            va_bits: 48,
            pa_range_bits: 48,
            entered_el2: false,
            vhe: false,
        }
    }

    fn run(
        memblock: &mut Memblock,
        config: &KernelConfig,
        cpu: &BootCpu,
        image: KernelImage,
        tweak: impl FnOnce(&mut ArchInit<'_>),
    ) -> Result<MemoryLayout, BootError> {
        let blob = FdtBuilder::with_root_cells().finish();
        let fdt = early_fdt_map(0xbf00_0000, Some(&blob))?;
        let mut args = ArchInit {
            config,
            cpu,
            image,
            mem_limit: None,
            initrd: None,
            memstart_offset_seed: 0,
        };
        tweak(&mut args);
        arm64_memblock_init(memblock, &args, &fdt, None)
    }

    #[test]
    fn test_plain_board() {
        let mut mb = Memblock::new();
        mb.add(0x8000_0000, 0x8000_0000).unwrap();
        let layout = run(&mut mb, &KernelConfig::DEFAULT, &cpu(), IMAGE, |_| {}).unwrap();

        assert_eq!(layout.linear.memstart, 0x8000_0000);
        assert_eq!(layout.linear_region_size, 1 << 47);
        assert_eq!(mb.memory().len(), 1);
        assert!(mb.is_reserved(IMAGE.stext));
        assert!(!mb.is_reserved(IMAGE.text));
        assert_eq!(layout.high_memory, Va(0xffff_0000_8000_0000));
    }

    #[test]
    fn test_memory_above_pa_width_is_dropped() {
        let mut mb = Memblock::new();
        mb.add(0x8000_0000, 0x8000_0000).unwrap();
        mb.add(1 << 48, SZ_1G).unwrap();
        run(&mut mb, &KernelConfig::DEFAULT, &cpu(), IMAGE, |_| {}).unwrap();
        assert_eq!(mb.end_of_dram(), 0x1_0000_0000);

        let mut mb = Memblock::new();
        mb.add(1 << 48, SZ_1G).unwrap();
        assert_eq!(
            run(&mut mb, &KernelConfig::DEFAULT, &cpu(), IMAGE, |_| {}),
            Err(BootError::NoMemory)
        );
    }

    #[test]
    fn test_memory_beyond_linear_reach_is_clipped() {
        let mut mb = Memblock::new();
        mb.add(0x4000_0000, SZ_1G).unwrap();
        mb.add((1 << 47) + (1 << 44), SZ_1G).unwrap();
        let image = KernelImage {
            text: 0x4020_0000,
            stext: 0x4021_0000,
            end: 0x4220_0000,
        };
        let layout = run(&mut mb, &KernelConfig::DEFAULT, &cpu(), image, |_| {}).unwrap();
        assert_eq!(layout.linear.memstart, 0x4000_0000);
        assert_eq!(mb.end_of_dram(), 0x8000_0000);
    }

    #[test]
    fn test_high_kernel_slides_memstart() {
        let top = 1u64 << 47;
        let mut mb = Memblock::new();
        mb.add(0x4000_0000, SZ_1G).unwrap();
        mb.add(top, 2 * SZ_1G).unwrap();
        let image = KernelImage {
            text: top + 0x6000_0000,
            stext: top + 0x6001_0000,
            end: top + 0x6220_0000,
        };
        let layout = run(&mut mb, &KernelConfig::DEFAULT, &cpu(), image, |_| {}).unwrap();

        assert_eq!(layout.linear.memstart, 0x8000_0000);
        assert_eq!(mb.start_of_dram(), top);
        assert_eq!(mb.end_of_dram(), top + 0x6220_0000);
        assert!(layout.linear.memstart + layout.linear_region_size >= mb.end_of_dram());
    }

    #[test]
    fn test_52bit_build_on_48bit_cpu() {
        let config = KernelConfig {
            va_bits: 52,
            pa_bits: 52,
            ..KernelConfig::DEFAULT
        };
        let mut mb = Memblock::new();
        mb.add(0x8000_0000, 0x10_0000_0000).unwrap();
        let layout = run(&mut mb, &config, &cpu(), IMAGE, |_| {}).unwrap();

        assert_eq!(layout.linear.memstart, 0xfff1_0000_8000_0000);
        assert_eq!(
            layout.linear.phys_to_virt(Pa(0x1_0000_0000)),
            Va(0xffff_0000_8000_0000)
        );
        assert_eq!(
            layout.linear.virt_to_phys(Va(0xffff_0000_8000_0000)),
            Pa(0x1_0000_0000)
        );
    }

    #[test]
    fn test_mem_limit_keeps_kernel() {
        let mut mb = Memblock::new();
        mb.add(0x8000_0000, 0x8000_0000).unwrap();
        run(&mut mb, &KernelConfig::DEFAULT, &cpu(), IMAGE, |a| {
            a.mem_limit = Some(0x1000_0000);
        })
        .unwrap();

        assert_eq!(mb.memory().len(), 2);
        assert_eq!(mb.memory()[0].base, 0x8000_0000);
        assert_eq!(mb.memory()[0].size, 0x1000_0000);
        assert_eq!(mb.memory()[1].base, IMAGE.text);
        assert_eq!(mb.memory()[1].end(), IMAGE.end);
    }

    #[test]
    fn test_initrd_reserved_when_mapped() {
        let mut mb = Memblock::new();
        mb.add(0x8000_0000, 0x8000_0000).unwrap();
        let layout = run(&mut mb, &KernelConfig::DEFAULT, &cpu(), IMAGE, |a| {
            a.initrd = Some((0xb000_0800, 0xb020_0000));
        })
        .unwrap();

        let initrd = layout.initrd.unwrap();
        assert_eq!(initrd.phys_size, 0x1f_f800);
        assert_eq!(initrd.start, Va(0xffff_0000_3000_0800));
        assert!(mb.is_reserved(0xb000_0000));
        assert!(mb.is_reserved(0xb01f_f000));
    }

    #[test]
    fn test_initrd_outside_linear_map_is_ignored() {
        let mut mb = Memblock::new();
        mb.add(0x8000_0000, 0x8000_0000).unwrap();
        let layout = run(&mut mb, &KernelConfig::DEFAULT, &cpu(), IMAGE, |a| {
            a.initrd = Some((0x4000_0000, 0x4000_0000 + SZ_2M));
        })
        .unwrap();
        assert_eq!(layout.initrd, None);
        assert!(!mb.is_memory(0x4000_0000));
    }

    #[test]
    fn test_kaslr_nudges_memstart() {
        let small_pa = BootCpu {
            pa_range_bits: 40,
            ..cpu()
        };
        let mut mb = Memblock::new();
        mb.add(0x8000_0000, 0x8000_0000).unwrap();
        let layout = run(&mut mb, &KernelConfig::DEFAULT, &small_pa, IMAGE, |a| {
            a.memstart_offset_seed = 0x8000;
        })
        .unwrap();

        let slots = ((1u64 << 47) - (1u64 << 40)) / MEMSTART_ALIGN;
        let nudge = (slots * 0x8000) >> 16;
        assert_eq!(
            layout.linear.memstart,
            0x8000_0000u64.wrapping_sub(MEMSTART_ALIGN * nudge)
        );

        // no slack when the PA range fills the linear map
        let mut mb = Memblock::new();
        mb.add(0x8000_0000, 0x8000_0000).unwrap();
        let layout = run(&mut mb, &KernelConfig::DEFAULT, &cpu(), IMAGE, |a| {
            a.memstart_offset_seed = 0x8000;
        })
        .unwrap();
        assert_eq!(layout.linear.memstart, 0x8000_0000);
    }

    #[test]
    fn test_nvhe_caps_linear_region() {
        let config = KernelConfig {
            va_bits: 52,
            pa_bits: 52,
            ..KernelConfig::DEFAULT
        };
        let lva = BootCpu {
            va_bits: 52,
            entered_el2: true,
            ..cpu()
        };
        let mut mb = Memblock::new();
        mb.add(0x8000_0000, 0x8000_0000).unwrap();
        let layout = run(&mut mb, &config, &lva, IMAGE, |_| {}).unwrap();
        assert_eq!(layout.linear_region_size, 1 << 51);
    }
}
