//! Early Command Line Parameters
//!
//! Only the parameters memory bring-up consumes are recognised; everything
//! else on the command line is ignored here. Values follow the kernel's
//! `memparse` syntax (`K`, `M`, `G`... suffixes).

use alloc::string::String;

use m6_cma::CmaCmdline;
use m6_common::memory::PAGE_MASK;
use m6_common::size::{memparse, parse_size};

/// Value of `kvm-arm.mode=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KvmMode {
    #[default]
    Default,
    /// Protected mode: the hypervisor owns a private memory pool
    Protected,
    Nvhe,
    None,
}

/// Parsed early parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootParams {
    /// `mem=`: cap on usable RAM in bytes, page aligned
    pub mem_limit: Option<u64>,
    /// `cma=size[@base[-limit]]`
    pub cma: Option<CmaCmdline>,
    /// `cma_pernuma=size`
    pub cma_pernuma: u64,
    /// `numa=off`
    pub numa_off: bool,
    /// Raw `crashkernel=` value; its meaning depends on the RAM size
    pub crashkernel: Option<String>,
    /// `hugetlb_cma=size`
    pub hugetlb_cma: u64,
    /// `nokaslr`
    pub nokaslr: bool,
    pub kvm_mode: KvmMode,
}

impl BootParams {
    /// Parse a command line. Later occurrences of a parameter win.
    #[must_use]
    pub fn parse(cmdline: &str) -> Self {
        let mut params = Self::default();
        for arg in cmdline.split_ascii_whitespace() {
            let (key, value) = match arg.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (arg, None),
            };
            params.apply(key, value);
        }
        params
    }

    fn apply(&mut self, key: &str, value: Option<&str>) {
        match (key, value) {
            ("mem", Some(value)) => {
                if let Some((limit, _)) = memparse(value) {
                    let limit = limit & !PAGE_MASK;
                    log::info!("Memory limited to {}MB", limit >> 20);
                    self.mem_limit = Some(limit);
                }
            }
            ("cma", Some(value)) => match CmaCmdline::parse(value) {
                Some(cma) => self.cma = Some(cma),
                None => log::error!("Kernel command line: cma={} is invalid", value),
            },
            ("cma_pernuma", Some(value)) => self.cma_pernuma = parse_size(value).unwrap_or(0),
            ("numa", Some(value)) => {
                if value.starts_with("off") {
                    self.numa_off = true;
                }
            }
            ("crashkernel", Some(value)) => self.crashkernel = Some(value.into()),
            ("hugetlb_cma", Some(value)) => self.hugetlb_cma = parse_size(value).unwrap_or(0),
            ("nokaslr", None) => self.nokaslr = true,
            ("kvm-arm.mode", Some(value)) => {
                self.kvm_mode = match value {
                    "protected" => KvmMode::Protected,
                    "nvhe" => KvmMode::Nvhe,
                    "none" => KvmMode::None,
                    _ => {
                        log::warn!("kvm-arm.mode={} not recognised", value);
                        self.kvm_mode
                    }
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use m6_common::memory::SZ_1M;

    #[test]
    fn test_parse_memory_params() {
        let p = BootParams::parse(
            "console=ttyAMA0 mem=1G cma=128M@0x80000000-0x88000000 cma_pernuma=16M nokaslr",
        );
        assert_eq!(p.mem_limit, Some(1 << 30));
        assert_eq!(
            p.cma,
            Some(CmaCmdline {
                size: 128 * SZ_1M,
                base: 0x8000_0000,
                limit: 0x8800_0000
            })
        );
        assert_eq!(p.cma_pernuma, 16 * SZ_1M);
        assert!(p.nokaslr);
        assert!(!p.numa_off);
    }

    #[test]
    fn test_mem_limit_is_page_aligned() {
        let p = BootParams::parse("mem=0x12345678");
        assert_eq!(p.mem_limit, Some(0x1234_5000));
    }

    #[test]
    fn test_numa_kvm_crash() {
        let p = BootParams::parse("numa=off kvm-arm.mode=protected crashkernel=512M@0x90000000");
        assert!(p.numa_off);
        assert_eq!(p.kvm_mode, KvmMode::Protected);
        assert_eq!(p.crashkernel.as_deref(), Some("512M@0x90000000"));
    }

    #[test]
    fn test_unknown_and_bad_values_ignored() {
        let p = BootParams::parse("cma=bogus quiet nokaslr=1 kvm-arm.mode=weird");
        assert_eq!(p.cma, None);
        assert!(!p.nokaslr);
        assert_eq!(p.kvm_mode, KvmMode::Default);
    }
}
