//! Size strings for the `-l` budget
//!
//! Accepts a decimal number followed by an optional single-letter binary suffix:
//! - `100`  -> 100 bytes
//! - `100K` -> 100 * 1024
//! - `512M` -> 512 * 2^20
//! - `2G`   -> 2 * 2^30
//!
//! Suffixes are case-insensitive. Fractions are allowed (`1.5G`).

use crate::error::{EmuError, Result};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Parse a size string into bytes
pub fn parse_size(input: &str) -> Result<u64> {
    let text = input.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, suffix) = text.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| EmuError::InvalidSize(input.to_string()))?;

    let multiplier = match suffix.to_ascii_lowercase().as_str() {
        "" => 1,
        "k" => KIB,
        "m" => MIB,
        "g" => GIB,
        _ => return Err(EmuError::InvalidSize(input.to_string())),
    };

    Ok((value * multiplier as f64) as u64)
}

/// Bytes expressed in GiB, as printed on report lines
pub fn to_gib(bytes: u64) -> f64 {
    bytes as f64 / GIB as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_bytes() {
        assert_eq!(parse_size("100").unwrap(), 100);
        assert_eq!(parse_size("0").unwrap(), 0);
    }

    #[test]
    fn test_suffixes_both_cases() {
        assert_eq!(parse_size("2G").unwrap(), 2 * GIB);
        assert_eq!(parse_size("2g").unwrap(), 2 * GIB);
        assert_eq!(parse_size("512M").unwrap(), 512 * MIB);
        assert_eq!(parse_size("512m").unwrap(), 512 * MIB);
        assert_eq!(parse_size("100K").unwrap(), 100 * 1024);
        assert_eq!(parse_size("100k").unwrap(), 100 * 1024);
    }

    #[test]
    fn test_fractional_size() {
        assert_eq!(parse_size("1.5G").unwrap(), 3 * GIB / 2);
    }

    #[test]
    fn test_unknown_suffix_rejected() {
        assert!(parse_size("10T").is_err());
        assert!(parse_size("10MB").is_err());
    }

    #[test]
    fn test_missing_number_rejected() {
        assert!(parse_size("").is_err());
        assert!(parse_size("G").is_err());
        assert!(parse_size("-5M").is_err());
    }

    #[test]
    fn test_to_gib() {
        assert!((to_gib(GIB) - 1.0).abs() < f64::EPSILON);
        assert!((to_gib(512 * MIB) - 0.5).abs() < f64::EPSILON);
    }
}
