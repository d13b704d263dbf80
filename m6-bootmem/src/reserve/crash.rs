//! Crash Kernel Reservation
//!
//! `crashkernel=` takes one of two forms:
//!
//! ```text
//! crashkernel=size[@base]
//! crashkernel=start-[end]:size[,start-[end]:size...][@base]
//! ```
//!
//! The second picks the size of the first range containing the total
//! amount of RAM; an omitted `end` is unbounded.

use m6_common::memory::{page_align, SZ_2M};
use m6_common::size::memparse;
use m6_memblock::Memblock;

/// Alignment required by the arm64 boot protocol
pub const CRASH_ALIGN: u64 = SZ_2M;

/// The reserved range (`crashk_res`); `end` is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashKernel {
    pub start: u64,
    pub end: u64,
}

impl CrashKernel {
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Parse a `crashkernel=` value against `system_ram` bytes of RAM.
///
/// # Returns
///
/// `(size, base)` where a base of 0 means "anywhere", or `None` when the
/// value is malformed. A range list that matches nothing yields a size of
/// 0.
#[must_use]
pub fn parse_crashkernel(value: &str, system_ram: u64) -> Option<(u64, u64)> {
    let size_part = value.split('@').next().unwrap_or(value);
    if size_part.contains(':') {
        parse_ranges(value, system_ram)
    } else {
        parse_simple(value)
    }
}

fn parse_simple(value: &str) -> Option<(u64, u64)> {
    let Some((size, rest)) = memparse(value) else {
        log::warn!("crashkernel: memory value expected");
        return None;
    };
    match rest.strip_prefix('@') {
        Some(base) => match memparse(base) {
            Some((base, "")) => Some((size, base)),
            _ => {
                log::warn!("crashkernel: memory value expected after '@'");
                None
            }
        },
        None if rest.is_empty() => Some((size, 0)),
        None => {
            log::warn!("crashkernel: unrecognized char: {}", rest);
            None
        }
    }
}

fn parse_ranges(value: &str, system_ram: u64) -> Option<(u64, u64)> {
    let mut cur = value;
    let mut crash_size = 0;

    loop {
        let Some((start, rest)) = memparse(cur) else {
            log::warn!("crashkernel: memory value expected");
            return None;
        };
        let Some(rest) = rest.strip_prefix('-') else {
            log::warn!("crashkernel: '-' expected");
            return None;
        };
        let (end, rest) = if rest.starts_with(':') {
            (u64::MAX, rest)
        } else {
            let Some((end, rest)) = memparse(rest) else {
                log::warn!("crashkernel: memory value expected");
                return None;
            };
            if end <= start {
                log::warn!("crashkernel: end <= start");
                return None;
            }
            (end, rest)
        };
        let Some(rest) = rest.strip_prefix(':') else {
            log::warn!("crashkernel: ':' expected");
            return None;
        };
        let Some((size, rest)) = memparse(rest) else {
            log::warn!("crashkernel: memory value expected");
            return None;
        };
        if size >= system_ram {
            log::warn!("crashkernel: invalid size");
            return None;
        }
        cur = rest;
        if system_ram >= start && system_ram < end {
            crash_size = size;
            break;
        }
        match cur.strip_prefix(',') {
            Some(next) => cur = next,
            None => break,
        }
    }

    if crash_size == 0 {
        log::info!("crashkernel size resulted in zero bytes");
        return Some((0, 0));
    }
    let base = match cur.find('@') {
        Some(at) => match memparse(&cur[at + 1..]) {
            Some((base, _)) => base,
            None => {
                log::warn!("crashkernel: memory value expected after '@'");
                return None;
            }
        },
        None => 0,
    };
    Some((crash_size, base))
}

/// Reserve memory for a crash kernel below `dma_phys_limit`
/// (`reserve_crashkernel`).
///
/// An explicit base is honoured exactly; otherwise the highest free,
/// [`CRASH_ALIGN`]ed range below the limit is used. Failure is logged and
/// leaves the table untouched.
pub fn reserve_crashkernel(
    value: Option<&str>,
    memblock: &mut Memblock,
    dma_phys_limit: u64,
) -> Option<CrashKernel> {
    let (size, base) = parse_crashkernel(value?, memblock.phys_mem_size())?;
    if size == 0 {
        return None;
    }
    let size = page_align(size);

    let (min, max) = match base {
        0 => (0, dma_phys_limit),
        base => (base, base.saturating_add(size)),
    };
    let Ok(base) = memblock.alloc_range(size, CRASH_ALIGN, min, max, None) else {
        log::warn!("cannot allocate crashkernel (size:{:#x})", size);
        return None;
    };

    log::info!(
        "crashkernel reserved: {:#018x} - {:#018x} ({} MB)",
        base,
        base + size,
        size >> 20
    );
    Some(CrashKernel {
        start: base,
        end: base + size - 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use m6_common::memory::{SZ_1G, SZ_1M};

    #[test]
    fn test_parse_simple() {
        assert_eq!(parse_crashkernel("256M", SZ_1G), Some((256 * SZ_1M, 0)));
        assert_eq!(
            parse_crashkernel("512M@0x90000000", SZ_1G),
            Some((512 * SZ_1M, 0x9000_0000))
        );
        assert_eq!(parse_crashkernel("256Mx", SZ_1G), None);
        assert_eq!(parse_crashkernel("256M@", SZ_1G), None);
        assert_eq!(parse_crashkernel("", SZ_1G), None);
    }

    #[test]
    fn test_parse_ranges() {
        let ranges = "512M-2G:64M,2G-:128M";
        assert_eq!(parse_crashkernel(ranges, SZ_1G), Some((64 * SZ_1M, 0)));
        assert_eq!(parse_crashkernel(ranges, 8 * SZ_1G), Some((128 * SZ_1M, 0)));
        assert_eq!(parse_crashkernel(ranges, 256 * SZ_1M), Some((0, 0)));
        assert_eq!(
            parse_crashkernel("1G-:256M@0x90000000", 4 * SZ_1G),
            Some((256 * SZ_1M, 0x9000_0000))
        );
    }

    #[test]
    fn test_parse_ranges_rejects_garbage() {
        assert_eq!(parse_crashkernel("2G-1G:64M", 4 * SZ_1G), None);
        assert_eq!(parse_crashkernel("1G:64M", 4 * SZ_1G), None);
        assert_eq!(parse_crashkernel("1G-2G:", 4 * SZ_1G), None);
        assert_eq!(parse_crashkernel("1G-:8G", 4 * SZ_1G), None);
    }

    #[test]
    fn test_reserve_below_dma_limit() {
        let mut mb = Memblock::new();
        mb.add(0x8000_0000, 4 * SZ_1G).unwrap();
        let crash = reserve_crashkernel(Some("256M"), &mut mb, 0x1_0000_0000).unwrap();
        assert_eq!(crash.size(), 256 * SZ_1M);
        assert_eq!(crash.start % CRASH_ALIGN, 0);
        assert!(crash.end < 0x1_0000_0000);
        assert!(mb.is_region_reserved(crash.start, crash.size()));
    }

    #[test]
    fn test_reserve_at_fixed_base() {
        let mut mb = Memblock::new();
        mb.add(0x8000_0000, 2 * SZ_1G).unwrap();
        let crash = reserve_crashkernel(Some("128M@0x90000000"), &mut mb, 0x1_0000_0000).unwrap();
        assert_eq!(crash.start, 0x9000_0000);

        // the same base again is taken
        assert_eq!(reserve_crashkernel(Some("128M@0x90000000"), &mut mb, 0x1_0000_0000), None);
        // unaligned base
        assert_eq!(reserve_crashkernel(Some("16M@0xa0100000"), &mut mb, 0x1_0000_0000), None);
    }

    #[test]
    fn test_no_room() {
        let mut mb = Memblock::new();
        mb.add(0x8000_0000, 128 * SZ_1M).unwrap();
        let reserved = mb.reserved_size();
        assert_eq!(reserve_crashkernel(Some("256M"), &mut mb, 0x1_0000_0000), None);
        assert_eq!(reserve_crashkernel(None, &mut mb, 0x1_0000_0000), None);
        assert_eq!(mb.reserved_size(), reserved);
    }
}
