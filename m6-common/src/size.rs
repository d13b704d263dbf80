//! Size Parsing
//!
//! Parser for the size grammar used by memory related kernel parameters:
//! an unsigned integer (decimal, `0x` hexadecimal or `0` octal) followed by
//! an optional binary suffix `K`, `M`, `G`, `T`, `P` or `E` in either case.

/// Parse a size prefix of `s`.
///
/// # Returns
///
/// The parsed value and the unparsed remainder of `s`, or `None` when `s`
/// does not start with a number. Values that overflow saturate to
/// `u64::MAX`.
#[must_use]
pub fn memparse(s: &str) -> Option<(u64, &str)> {
    let bytes = s.as_bytes();
    let (radix, mut idx) = match bytes {
        [b'0', b'x' | b'X', c, ..] if c.is_ascii_hexdigit() => (16, 2),
        [b'0', c, ..] if c.is_ascii_digit() => (8, 1),
        _ => (10, 0),
    };

    let start = idx;
    let mut value: u64 = 0;
    while let Some(digit) = bytes.get(idx).and_then(|&c| (c as char).to_digit(radix)) {
        value = value
            .saturating_mul(u64::from(radix))
            .saturating_add(u64::from(digit));
        idx += 1;
    }
    if idx == start {
        return None;
    }

    let shift = match bytes.get(idx) {
        Some(b'E' | b'e') => 60,
        Some(b'P' | b'p') => 50,
        Some(b'T' | b't') => 40,
        Some(b'G' | b'g') => 30,
        Some(b'M' | b'm') => 20,
        Some(b'K' | b'k') => 10,
        _ => 0,
    };
    if shift != 0 {
        idx += 1;
        value = if value.leading_zeros() >= shift {
            value << shift
        } else {
            u64::MAX
        };
    }

    Some((value, &s[idx..]))
}

/// Parse a complete size string with no trailing characters.
#[must_use]
pub fn parse_size(s: &str) -> Option<u64> {
    match memparse(s)? {
        (value, "") => Some(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memparse_suffixes() {
        assert_eq!(memparse("128M"), Some((128 << 20, "")));
        assert_eq!(memparse("1g"), Some((1 << 30, "")));
        assert_eq!(memparse("4K@x"), Some((4096, "@x")));
        assert_eq!(memparse("512"), Some((512, "")));
    }

    #[test]
    fn test_memparse_radix() {
        assert_eq!(memparse("0x80000000-0x88000000"), Some((0x8000_0000, "-0x88000000")));
        assert_eq!(memparse("010"), Some((8, "")));
        assert_eq!(memparse("0"), Some((0, "")));
    }

    #[test]
    fn test_memparse_rejects_garbage() {
        assert_eq!(memparse(""), None);
        assert_eq!(memparse("M"), None);
        assert_eq!(parse_size("12Mx"), None);
    }

    #[test]
    fn test_memparse_saturates() {
        assert_eq!(memparse("100000E"), Some((u64::MAX, "")));
    }
}
