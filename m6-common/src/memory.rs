//! Memory Geometry Constants
//!
//! Page, block, section and alignment constants for a 4 KiB translation
//! granule, plus the handful of derived sizes the boot memory code needs.

/// Size constants
pub const SZ_1K: u64 = 1 << 10;
pub const SZ_1M: u64 = 1 << 20;
pub const SZ_2M: u64 = 2 << 20;
pub const SZ_4M: u64 = 4 << 20;
pub const SZ_1G: u64 = 1 << 30;
pub const SZ_4G: u64 = 1 << 32;

// -- Translation granule

/// Page shift for the 4 KiB granule
pub const PAGE_SHIFT: u32 = 12;
/// Page size in bytes
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
/// Mask of the in-page offset bits
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// Level-2 block shift (2 MiB)
pub const PMD_SHIFT: u32 = 21;
/// Level-2 block size
pub const PMD_SIZE: u64 = 1 << PMD_SHIFT;
/// Level-1 block shift (1 GiB)
pub const PUD_SHIFT: u32 = 30;
/// Level-1 block size
pub const PUD_SIZE: u64 = 1 << PUD_SHIFT;

/// Entries in one translation table page
pub const PTRS_PER_TABLE: u64 = PAGE_SIZE / 8;

/// Alignment of `memstart_addr` so the linear map can use level-1 blocks
pub const MEMSTART_ALIGN: u64 = PUD_SIZE;

// -- Buddy allocator geometry

/// Number of buddy orders (`MAX_ORDER`)
pub const MAX_ORDER: u32 = 11;
/// Order of a pageblock (huge page order at 4 KiB)
pub const PAGEBLOCK_ORDER: u32 = PMD_SHIFT - PAGE_SHIFT;
/// Pages per pageblock
pub const PAGEBLOCK_NR_PAGES: u64 = 1 << PAGEBLOCK_ORDER;

/// Bytes of `struct page` per frame in the vmemmap
pub const STRUCT_PAGE_SIZE: u64 = 64;
/// L1 cache line size used for node data alignment
pub const SMP_CACHE_BYTES: u64 = 64;

// -- Sparse memory model

/// Bytes covered by one memory section, log2
pub const SECTION_SIZE_BITS: u32 = 27;
/// Frames per section, log2
pub const PFN_SECTION_SHIFT: u32 = SECTION_SIZE_BITS - PAGE_SHIFT;
/// Frames per section
pub const PAGES_PER_SECTION: u64 = 1 << PFN_SECTION_SHIFT;
/// Sub-section granularity, log2 (2 MiB)
pub const SUBSECTION_SHIFT: u32 = 21;
/// Frames per sub-section
pub const PAGES_PER_SUBSECTION: u64 = 1 << (SUBSECTION_SHIFT - PAGE_SHIFT);
/// Sub-sections per section
pub const SUBSECTIONS_PER_SECTION: u64 = 1 << (SECTION_SIZE_BITS - SUBSECTION_SHIFT);

// -- Platform limits

/// Largest physical address width the kernel can be configured for
pub const MAX_PHYS_MASK_SHIFT: u32 = 52;
/// Largest addressable physical address
pub const PHYS_ADDR_MAX: u64 = u64::MAX;
/// Maximum number of possible CPUs
pub const NR_CPUS: usize = 256;

// Compile-time verification of geometry constants
const _: () = assert!(PAGE_SIZE.is_power_of_two(), "PAGE_SIZE must be a power of two");
const _: () = assert!(PAGE_SHIFT == 12, "4KB page shift must be 12");
const _: () = assert!(PTRS_PER_TABLE == 512, "4KB granule tables hold 512 entries");
const _: () = assert!(PAGEBLOCK_ORDER == 9, "pageblock order is 9 at 4KB");
const _: () = assert!(PAGES_PER_SECTION == 32768, "128MB sections hold 32768 pages");
const _: () = assert!(SUBSECTIONS_PER_SECTION == 64, "64 sub-sections per section");

/// Number of frames needed to cover `bytes`.
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

/// Round a byte count up to whole pages (`PAGE_ALIGN`).
#[inline]
#[must_use]
pub const fn page_align(bytes: u64) -> u64 {
    crate::addr::align_up(bytes, PAGE_SIZE)
}
