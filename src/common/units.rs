//! Size arithmetic shared by every layer.

use anyhow::Result;
use regex::Regex;

pub const SECTOR: u64 = 512;

/// 4MiB physical extents, for vgmerge compatibility.
pub const LVM_PE_SIZE: u64 = 4 * 1024 * 1024;

/// Round down to a multiple of `align`.
pub fn align_down(size: u64, align: u64) -> u64 {
    (size / align) * align
}

/// Round up to a multiple of `align`.
pub fn align_up(size: u64, align: u64) -> u64 {
    size.div_ceil(align) * align
}

/// Convert a byte count to 512-byte sectors. Byte counts at the block
/// layer are always sector-aligned; anything else is a logic error.
pub fn bytes_to_sectors(bytes: u64) -> u64 {
    assert!(bytes % SECTOR == 0, "{bytes} is not sector-aligned");
    bytes / SECTOR
}

/// Parse a size argument: a decimal integer with an optional one-letter
/// 1024-based suffix (b, k, m, g, t, p, e).
pub fn parse_size_arg(arg: &str) -> Result<u64> {
    let re = Regex::new(r"^(?i)([0-9]+)([bkmgtpe])?$").expect("static regex");
    let caps = re.captures(arg).ok_or_else(|| {
        anyhow::anyhow!(
            "size must be a decimal integer with an optional one-character \
             unit suffix (bkmgtpe)"
        )
    })?;

    let value: u64 = caps[1].parse()?;
    let unit = caps
        .get(2)
        .map(|m| m.as_str().to_ascii_lowercase())
        .unwrap_or_else(|| "b".to_string());

    let exponent = "bkmgtpe"
        .find(&unit)
        .expect("suffix constrained by the regex") as u32;

    value
        .checked_mul(1024u64.pow(exponent))
        .ok_or_else(|| anyhow::anyhow!("size argument overflows"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_bytes() {
        assert_eq!(parse_size_arg("0").unwrap(), 0);
        assert_eq!(parse_size_arg("512").unwrap(), 512);
        assert_eq!(parse_size_arg("512b").unwrap(), 512);
    }

    #[test]
    fn suffixes_are_powers_of_1024() {
        assert_eq!(parse_size_arg("1k").unwrap(), 1024);
        assert_eq!(parse_size_arg("3m").unwrap(), 3 * 1024 * 1024);
        assert_eq!(parse_size_arg("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size_arg("1t").unwrap(), 1u64 << 40);
        assert_eq!(parse_size_arg("1p").unwrap(), 1u64 << 50);
        assert_eq!(parse_size_arg("1e").unwrap(), 1u64 << 60);
    }

    #[test]
    fn suffixes_are_case_insensitive() {
        assert_eq!(parse_size_arg("5G").unwrap(), parse_size_arg("5g").unwrap());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_size_arg("").is_err());
        assert!(parse_size_arg("12x").is_err());
        assert!(parse_size_arg("k").is_err());
        assert!(parse_size_arg("-1k").is_err());
        assert!(parse_size_arg("1 k").is_err());
        assert!(parse_size_arg("16e").is_err()); // overflows u64
    }

    #[test]
    fn alignment() {
        assert_eq!(align_down(4097, 4096), 4096);
        assert_eq!(align_down(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
        assert_eq!(align_up(4096, 4096), 4096);
    }

    #[test]
    fn sector_conversion() {
        assert_eq!(bytes_to_sectors(1024 * 1024), 2048);
    }

    #[test]
    #[should_panic]
    fn unaligned_sector_conversion_panics() {
        bytes_to_sectors(513);
    }
}
