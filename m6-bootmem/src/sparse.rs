//! Sparse Section Table
//!
//! Physical address space is cut into 128 MiB sections. A section that
//! holds any RAM gets a memory map (64 bytes per frame, backed by 2 MiB
//! blocks) and a usage block (subsection bitmap plus pageblock flags).
//!
//! # Design
//!
//! Sections are grouped under roots of [`SECTIONS_PER_ROOT`] entries and a
//! root only exists once a section under it is touched, so a sparse 52-bit
//! physical space costs nothing for the holes.
//!
//! ```text
//! roots[nr / 256] -> [MemSection; 256]
//!                        flags | nid | mem_map | usage | subsection map
//! ```
//!
//! Early sections are the ones found at boot. Their frames are validated
//! against the region table because the memory map covers the whole
//! section even where RAM does not. Hot-added sections are validated by
//! their subsection map instead.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use m6_common::addr::align_up;
use m6_common::memory::{
    PAGE_SHIFT, PAGE_SIZE, PAGES_PER_SECTION, PAGES_PER_SUBSECTION, PFN_SECTION_SHIFT, PMD_SIZE,
    SECTION_SIZE_BITS, SMP_CACHE_BYTES, STRUCT_PAGE_SIZE, SUBSECTIONS_PER_SECTION,
};
use m6_common::{NodeId, Pa, Pfn};
use m6_memblock::{Memblock, ALLOC_ACCESSIBLE};

use crate::error::BootError;

/// Sections under one root (one page of section descriptors)
pub const SECTIONS_PER_ROOT: u64 = PAGE_SIZE / 16;

/// Bytes of memory map per section, rounded to a 2 MiB block
pub const SECTION_MAP_SIZE: u64 = align_up(PAGES_PER_SECTION * STRUCT_PAGE_SIZE, PMD_SIZE);

/// Bytes of usage block per section: a 64-bit subsection map and four
/// bits of pageblock flags per pageblock.
pub const SECTION_USAGE_SIZE: u64 = 8 + (PAGES_PER_SECTION / 512) * 4 / 8;

const ROOT_SIZE: u64 = PAGE_SIZE;

/// Section state bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct SectionFlags(u8);

impl SectionFlags {
    pub const NONE: Self = Self(0);
    /// Some frame of the section is RAM
    pub const PRESENT: Self = Self(1 << 0);
    /// A memory map backs the section
    pub const HAS_MEM_MAP: Self = Self(1 << 1);
    /// The frames are handed to the page allocator
    pub const ONLINE: Self = Self(1 << 2);
    /// Found at boot rather than hot-added
    pub const IS_EARLY: Self = Self(1 << 3);

    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[inline]
    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl fmt::Debug for SectionFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::PRESENT, "PRESENT"),
            (Self::HAS_MEM_MAP, "HAS_MEM_MAP"),
            (Self::ONLINE, "ONLINE"),
            (Self::IS_EARLY, "IS_EARLY"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}

/// One section descriptor (`struct mem_section`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemSection {
    pub flags: SectionFlags,
    pub nid: Option<NodeId>,
    /// Physical base of the section's memory map, 0 when absent
    pub mem_map: u64,
    /// Physical base of the usage block, 0 when absent
    pub usage: u64,
    /// One bit per 2 MiB subsection holding RAM
    pub subsection_map: u64,
}

impl MemSection {
    const EMPTY: Self = Self {
        flags: SectionFlags::NONE,
        nid: None,
        mem_map: 0,
        usage: 0,
        subsection_map: 0,
    };

    #[inline]
    #[must_use]
    pub const fn present(&self) -> bool {
        self.flags.contains(SectionFlags::PRESENT)
    }

    /// `valid_section`
    #[inline]
    #[must_use]
    pub const fn valid(&self) -> bool {
        self.flags.contains(SectionFlags::HAS_MEM_MAP)
    }

    #[inline]
    #[must_use]
    pub const fn early(&self) -> bool {
        self.flags.contains(SectionFlags::IS_EARLY)
    }

    #[inline]
    #[must_use]
    pub const fn online(&self) -> bool {
        self.flags.contains(SectionFlags::ONLINE)
    }
}

/// Hotplug failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionError {
    /// The range is empty, crosses a section or is not subsection aligned
    InvalidRange { pfn: u64, nr_pages: u64 },
    /// The frame is beyond the section table
    OutOfRange { pfn: u64 },
    /// Boot-time sections cannot be added to or removed
    Early { pfn: u64 },
    /// Part of the range is already populated
    Exists { pfn: u64 },
    /// Part of the range was never added
    NotPresent { pfn: u64 },
    /// No room for the memory map
    NoMemory { pfn: u64 },
}

impl fmt::Display for SectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRange { pfn, nr_pages } => {
                write!(f, "invalid section range {:#x}+{:#x}", pfn, nr_pages)
            }
            Self::OutOfRange { pfn } => write!(f, "pfn {:#x} beyond the section table", pfn),
            Self::Early { pfn } => write!(f, "section of pfn {:#x} is a boot section", pfn),
            Self::Exists { pfn } => write!(f, "subsections at pfn {:#x} already present", pfn),
            Self::NotPresent { pfn } => write!(f, "subsections at pfn {:#x} not present", pfn),
            Self::NoMemory { pfn } => write!(f, "no memory map for pfn {:#x}", pfn),
        }
    }
}

#[inline]
#[must_use]
pub const fn pfn_to_section_nr(pfn: Pfn) -> u64 {
    pfn.0 >> PFN_SECTION_SHIFT
}

#[inline]
#[must_use]
pub const fn section_nr_to_pfn(nr: u64) -> Pfn {
    Pfn(nr << PFN_SECTION_SHIFT)
}

/// Bits of the subsection map covered by `[pfn, pfn + nr_pages)` within
/// its section.
fn subsection_mask(pfn: Pfn, nr_pages: u64) -> u64 {
    let first = (pfn.0 & (PAGES_PER_SECTION - 1)) / PAGES_PER_SUBSECTION;
    let last = ((pfn.0 + nr_pages - 1) & (PAGES_PER_SECTION - 1)) / PAGES_PER_SUBSECTION;
    let width = last - first + 1;
    if width >= SUBSECTIONS_PER_SECTION {
        u64::MAX
    } else {
        ((1u64 << width) - 1) << first
    }
}

/// The section table (`mem_section`).
#[derive(Debug, Clone)]
pub struct Sparse {
    roots: Vec<Option<Box<[MemSection; SECTIONS_PER_ROOT as usize]>>>,
    nr_sections: u64,
}

impl Sparse {
    /// Empty table covering `1 << pa_bits` bytes.
    #[must_use]
    pub fn new(pa_bits: u32) -> Self {
        let nr_sections = 1u64 << (pa_bits - SECTION_SIZE_BITS);
        let nr_roots = nr_sections.div_ceil(SECTIONS_PER_ROOT);
        Self {
            roots: (0..nr_roots).map(|_| None).collect(),
            nr_sections,
        }
    }

    /// `NR_MEM_SECTIONS`
    #[inline]
    #[must_use]
    pub const fn nr_sections(&self) -> u64 {
        self.nr_sections
    }

    /// Section descriptor, `None` when its root was never allocated.
    #[must_use]
    pub fn section(&self, nr: u64) -> Option<&MemSection> {
        let root = self.roots.get((nr / SECTIONS_PER_ROOT) as usize)?.as_ref()?;
        root.get((nr % SECTIONS_PER_ROOT) as usize)
    }

    fn section_mut(&mut self, nr: u64) -> Option<&mut MemSection> {
        let root = self.roots.get_mut((nr / SECTIONS_PER_ROOT) as usize)?.as_mut()?;
        root.get_mut((nr % SECTIONS_PER_ROOT) as usize)
    }

    /// Present section numbers in increasing order.
    pub fn present_sections(&self) -> impl Iterator<Item = u64> + '_ {
        self.roots
            .iter()
            .enumerate()
            .filter_map(|(i, root)| root.as_ref().map(|r| (i as u64, r)))
            .flat_map(|(i, root)| {
                root.iter()
                    .enumerate()
                    .filter(|(_, ms)| ms.present())
                    .map(move |(j, _)| i * SECTIONS_PER_ROOT + j as u64)
            })
    }

    /// `sparse_index_init`: make sure the root for section `nr` exists.
    fn index_init(&mut self, memblock: &mut Memblock, nr: u64, nid: NodeId) -> Result<(), BootError> {
        let idx = (nr / SECTIONS_PER_ROOT) as usize;
        if self.roots[idx].is_some() {
            return Ok(());
        }
        memblock
            .alloc_try_nid(ROOT_SIZE, SMP_CACHE_BYTES, 0, ALLOC_ACCESSIBLE, Some(nid))
            .map_err(|_| BootError::OutOfAddressSpace {
                what: "section root",
                size: ROOT_SIZE,
            })?;
        self.roots[idx] = Some(Box::new([MemSection::EMPTY; SECTIONS_PER_ROOT as usize]));
        Ok(())
    }

    /// Mark the sections covering `[start, end)` present on `nid`
    /// (`memory_present`).
    ///
    /// # Errors
    ///
    /// [`BootError::SectionOverflow`] when the range runs past the table,
    /// [`BootError::OutOfAddressSpace`] when a root cannot be allocated.
    pub fn memory_present(
        &mut self,
        memblock: &mut Memblock,
        nid: NodeId,
        start: Pfn,
        end: Pfn,
    ) -> Result<(), BootError> {
        if end <= start {
            return Ok(());
        }
        let last = pfn_to_section_nr(Pfn(end.0 - 1));
        if last >= self.nr_sections {
            log::error!(
                "memory [{:#x}-{:#x}) exceeds {} sections",
                start.phys().as_u64(),
                end.phys().as_u64(),
                self.nr_sections
            );
            return Err(BootError::SectionOverflow { pfn: end.0 - 1 });
        }

        for nr in pfn_to_section_nr(start)..=last {
            self.index_init(memblock, nr, nid)?;
            if let Some(ms) = self.section_mut(nr) {
                if !ms.present() {
                    ms.nid = Some(nid);
                    ms.flags = ms.flags.union(SectionFlags::PRESENT);
                }
            }
        }
        Ok(())
    }

    /// Build the early section table from the region table (`sparse_init`).
    ///
    /// Present sections are processed in runs sharing a node. Each run gets
    /// one usage allocation and one memory map buffer on its node; a
    /// section that cannot get a memory map is dropped along with the rest
    /// of its run.
    ///
    /// # Errors
    ///
    /// Only the section table itself is fatal: overflow or an unplaceable
    /// root. Missing memory maps leave memory unusable but are not errors.
    pub fn init(&mut self, memblock: &mut Memblock) -> Result<(), BootError> {
        let ranges: Vec<(Pfn, Pfn, Option<NodeId>)> = memblock.mem_pfn_ranges(None).collect();
        for &(start, end, nid) in &ranges {
            self.memory_present(memblock, nid.unwrap_or(NodeId::ZERO), start, end)?;
        }

        let present: Vec<(u64, NodeId)> = self
            .present_sections()
            .map(|nr| {
                let nid = self.section(nr).and_then(|ms| ms.nid).unwrap_or(NodeId::ZERO);
                (nr, nid)
            })
            .collect();

        for run in present.chunk_by(|a, b| a.1 == b.1) {
            let nid = run[0].1;
            let sections: Vec<u64> = run.iter().map(|&(nr, _)| nr).collect();
            self.init_nid(memblock, nid, &sections);
        }

        for (start, end, _) in ranges {
            self.subsection_map_init(start, end.0 - start.0);
        }

        let early = self.present_sections().count();
        log::info!(
            "sparse: {} sections of {} MiB, {} present",
            self.nr_sections,
            1u64 << (SECTION_SIZE_BITS - 20),
            early
        );
        Ok(())
    }

    /// `sparse_init_nid`
    fn init_nid(&mut self, memblock: &mut Memblock, nid: NodeId, sections: &[u64]) {
        let map_count = sections.len() as u64;
        let usage_size = SECTION_USAGE_SIZE * map_count;

        let Ok(mut usage) =
            memblock.alloc_try_nid(usage_size, SMP_CACHE_BYTES, 0, ALLOC_ACCESSIBLE, Some(nid))
        else {
            log::error!("sparse_init_nid: node[{}] usemap allocation failed", nid);
            self.mark_absent(sections);
            return;
        };

        // sparse_buffer_init
        let buffer_size = SECTION_MAP_SIZE * map_count;
        let buffer = memblock
            .alloc_range_nid(buffer_size, SECTION_MAP_SIZE, 0, ALLOC_ACCESSIBLE, Some(nid), true)
            .ok();
        let mut cursor = buffer;

        for (i, &nr) in sections.iter().enumerate() {
            let map = match cursor {
                Some(ptr) if buffer.is_some_and(|b| ptr + SECTION_MAP_SIZE <= b + buffer_size) => {
                    cursor = Some(ptr + SECTION_MAP_SIZE);
                    Some(ptr)
                }
                _ => memblock
                    .alloc_try_nid(SECTION_MAP_SIZE, SECTION_MAP_SIZE, 0, ALLOC_ACCESSIBLE, Some(nid))
                    .ok(),
            };
            let Some(map) = map else {
                log::error!(
                    "sparse_init_nid: node[{}] memory map backing failed. Some memory will not be available.",
                    nid
                );
                self.mark_absent(&sections[i..]);
                break;
            };
            if let Some(ms) = self.section_mut(nr) {
                ms.mem_map = map;
                ms.usage = usage;
                ms.flags = ms
                    .flags
                    .union(SectionFlags::HAS_MEM_MAP)
                    .union(SectionFlags::IS_EARLY)
                    .union(SectionFlags::ONLINE);
            }
            usage += SECTION_USAGE_SIZE;
        }

        // sparse_buffer_fini
        if let (Some(base), Some(ptr)) = (buffer, cursor) {
            let end = base + buffer_size;
            if ptr < end {
                memblock.free(ptr, end - ptr);
            }
        }
    }

    fn mark_absent(&mut self, sections: &[u64]) {
        for &nr in sections {
            if let Some(ms) = self.section_mut(nr) {
                *ms = MemSection::EMPTY;
            }
        }
    }

    /// Set the subsection bits for `[pfn, pfn + nr_pages)` across sections
    /// (`subsection_map_init`).
    fn subsection_map_init(&mut self, mut pfn: Pfn, mut nr_pages: u64) {
        while nr_pages > 0 {
            let nr = pfn_to_section_nr(pfn);
            let in_section = (PAGES_PER_SECTION - (pfn.0 & (PAGES_PER_SECTION - 1))).min(nr_pages);
            if let Some(ms) = self.section_mut(nr).filter(|ms| ms.valid()) {
                ms.subsection_map |= subsection_mask(pfn, in_section);
            }
            pfn = pfn.add(in_section);
            nr_pages -= in_section;
        }
    }

    // -- Queries

    /// Check whether a frame has a valid `struct page` describing RAM.
    #[must_use]
    pub fn pfn_valid(&self, memblock: &Memblock, pfn: Pfn) -> bool {
        let addr = pfn.phys();
        if addr.pfn_down() != pfn {
            return false;
        }
        let nr = pfn_to_section_nr(pfn);
        if nr >= self.nr_sections {
            return false;
        }
        let Some(ms) = self.section(nr).filter(|ms| ms.valid()) else {
            return false;
        };
        if !ms.early() {
            return ms.subsection_map & subsection_mask(pfn, 1) != 0;
        }
        memblock.is_memory(addr.as_u64())
    }

    /// Physical address of the `struct page` describing `pfn`.
    #[must_use]
    pub fn memmap_phys(&self, pfn: Pfn) -> Option<Pa> {
        let ms = self.section(pfn_to_section_nr(pfn)).filter(|ms| ms.valid())?;
        let index = pfn.0 & (PAGES_PER_SECTION - 1);
        Some(Pa(ms.mem_map + index * STRUCT_PAGE_SIZE))
    }

    // -- Hotplug

    fn check_span(&self, pfn: Pfn, nr_pages: u64) -> Result<u64, SectionError> {
        let invalid = SectionError::InvalidRange { pfn: pfn.0, nr_pages };
        if nr_pages == 0
            || pfn.0 % PAGES_PER_SUBSECTION != 0
            || nr_pages % PAGES_PER_SUBSECTION != 0
            || pfn_to_section_nr(pfn) != pfn_to_section_nr(Pfn(pfn.0 + nr_pages - 1))
        {
            return Err(invalid);
        }
        let nr = pfn_to_section_nr(pfn);
        if nr >= self.nr_sections {
            return Err(SectionError::OutOfRange { pfn: pfn.0 });
        }
        Ok(nr)
    }

    /// Hot-add `[pfn, pfn + nr_pages)` within one section
    /// (`sparse_add_section`).
    ///
    /// # Errors
    ///
    /// See [`SectionError`]; the table is unchanged on error.
    pub fn add_section(
        &mut self,
        memblock: &mut Memblock,
        nid: NodeId,
        pfn: Pfn,
        nr_pages: u64,
    ) -> Result<(), SectionError> {
        let nr = self.check_span(pfn, nr_pages)?;
        self.index_init(memblock, nr, nid)
            .map_err(|_| SectionError::NoMemory { pfn: pfn.0 })?;

        let mask = subsection_mask(pfn, nr_pages);
        let current = *self.section(nr).ok_or(SectionError::NoMemory { pfn: pfn.0 })?;
        if current.early() {
            return Err(SectionError::Early { pfn: pfn.0 });
        }
        if current.subsection_map & mask != 0 {
            return Err(SectionError::Exists { pfn: pfn.0 });
        }

        let mut section = current;
        if !section.valid() {
            let size = SECTION_MAP_SIZE + SECTION_USAGE_SIZE;
            let map = memblock
                .alloc_try_nid(size, SECTION_MAP_SIZE, 0, ALLOC_ACCESSIBLE, Some(nid))
                .map_err(|_| SectionError::NoMemory { pfn: pfn.0 })?;
            section.mem_map = map;
            section.usage = map + SECTION_MAP_SIZE;
            section.nid = Some(nid);
            section.flags = SectionFlags::PRESENT.union(SectionFlags::HAS_MEM_MAP);
        }
        section.subsection_map |= mask;

        if let Some(ms) = self.section_mut(nr) {
            *ms = section;
        }
        log::debug!("sparse: added pfn {:#x}+{:#x} to section {}", pfn.0, nr_pages, nr);
        Ok(())
    }

    /// Hot-remove `[pfn, pfn + nr_pages)`; the memory map is released once
    /// the section holds no subsection (`sparse_remove_section`).
    ///
    /// # Errors
    ///
    /// See [`SectionError`]; the table is unchanged on error.
    pub fn remove_section(
        &mut self,
        memblock: &mut Memblock,
        pfn: Pfn,
        nr_pages: u64,
    ) -> Result<(), SectionError> {
        let nr = self.check_span(pfn, nr_pages)?;
        let mask = subsection_mask(pfn, nr_pages);
        let ms = self
            .section_mut(nr)
            .filter(|ms| ms.valid())
            .ok_or(SectionError::NotPresent { pfn: pfn.0 })?;
        if ms.early() {
            return Err(SectionError::Early { pfn: pfn.0 });
        }
        if ms.subsection_map & mask != mask {
            return Err(SectionError::NotPresent { pfn: pfn.0 });
        }

        ms.subsection_map &= !mask;
        if ms.subsection_map == 0 {
            let map = ms.mem_map;
            *ms = MemSection::EMPTY;
            memblock.free(map, SECTION_MAP_SIZE + SECTION_USAGE_SIZE);
        }
        Ok(())
    }

    /// Mark the sections covering `[start, end)` online or offline
    /// (`online_mem_sections`).
    pub fn set_online(&mut self, start: Pfn, end: Pfn, online: bool) {
        if end <= start {
            return;
        }
        for nr in pfn_to_section_nr(start)..=pfn_to_section_nr(Pfn(end.0 - 1)) {
            if let Some(ms) = self.section_mut(nr).filter(|ms| ms.present()) {
                ms.flags = if online {
                    ms.flags.union(SectionFlags::ONLINE)
                } else {
                    ms.flags.difference(SectionFlags::ONLINE)
                };
            }
        }
    }
}

/// Check whether a frame is RAM in the linear map (`pfn_is_map_memory`).
#[must_use]
pub fn pfn_is_map_memory(memblock: &Memblock, pfn: Pfn) -> bool {
    let addr = pfn.phys();
    if addr.0 >> PAGE_SHIFT != pfn.0 {
        return false;
    }
    memblock.is_map_memory(addr.as_u64())
}
