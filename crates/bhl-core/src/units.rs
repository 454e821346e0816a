// SPDX-License-Identifier: MIT OR Apache-2.0
//! Human byte/bit unit parsing and rendering.
//!
//! Size fields in the configuration accept human notation in both SI and IEC
//! prefixes ("10 MiB", "10.5 MB", "800 Mib", "0 B"). Values are kept as
//! human strings for display and converted to bytes at backend invocation.
//! A lowercase trailing `b` means bits (used for transfer speeds), an
//! uppercase `B` means bytes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Unit parse failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnitError {
    #[error("empty size value")]
    Empty,
    #[error("cannot parse size value '{0}'")]
    Malformed(String),
    #[error("unknown size unit '{0}'")]
    UnknownUnit(String),
}

/// A byte quantity parsed from human notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ByteSize(u64);

const IEC_UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];
const IEC_BIT_UNITS: [&str; 7] = ["b", "Kib", "Mib", "Gib", "Tib", "Pib", "Eib"];

impl ByteSize {
    /// Wrap a raw byte count.
    pub fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Raw byte count.
    pub fn bytes(&self) -> u64 {
        self.0
    }

    /// Kibibytes, rounded down. Transfer rate flags take KiB/s.
    pub fn kib(&self) -> u64 {
        self.0 / 1024
    }

    /// Render as an IEC byte string with one decimal, e.g. `10.0 MiB`.
    pub fn human_iec_bytes(&self) -> String {
        render_iec(self.0, &IEC_UNITS)
    }

    /// Render as an IEC bit string with one decimal, e.g. `800.0 Mib`.
    pub fn human_iec_bits(&self) -> String {
        render_iec(self.0.saturating_mul(8), &IEC_BIT_UNITS)
    }
}

fn render_iec(value: u64, units: &[&str; 7]) -> String {
    if value == 0 {
        return format!("0 {}", units[0]);
    }
    let mut scaled = value as f64;
    let mut idx = 0;
    while scaled >= 1024.0 && idx < units.len() - 1 {
        scaled /= 1024.0;
        idx += 1;
    }
    if idx == 0 {
        format!("{value} {}", units[0])
    } else {
        format!("{scaled:.1} {}", units[idx])
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.human_iec_bytes())
    }
}

impl FromStr for ByteSize {
    type Err = UnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(UnitError::Empty);
        }

        let split_at = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
            .unwrap_or(trimmed.len());
        let (number, unit) = trimmed.split_at(split_at);
        let number = number.trim();
        let unit = unit.trim();

        let value: f64 = number
            .parse()
            .map_err(|_| UnitError::Malformed(trimmed.to_string()))?;
        if value < 0.0 {
            return Err(UnitError::Malformed(trimmed.to_string()));
        }

        let (multiplier, is_bits) = unit_multiplier(unit)?;
        let mut bytes = value * multiplier;
        if is_bits {
            bytes /= 8.0;
        }
        Ok(Self(bytes.round() as u64))
    }
}

/// Multiplier for a unit suffix plus whether it denotes bits.
fn unit_multiplier(unit: &str) -> Result<(f64, bool), UnitError> {
    if unit.is_empty() {
        // Bare numbers are bytes.
        return Ok((1.0, false));
    }

    let is_bits = match unit.chars().last() {
        Some('b') => true,
        Some('B') => false,
        _ => return Err(UnitError::UnknownUnit(unit.to_string())),
    };

    let prefix = &unit[..unit.len() - 1];
    let (prefix, binary) = match prefix.strip_suffix(['i', 'I']) {
        Some(rest) => (rest, true),
        None => (prefix, false),
    };

    let exponent = match prefix.to_ascii_uppercase().as_str() {
        "" => 0,
        "K" => 1,
        "M" => 2,
        "G" => 3,
        "T" => 4,
        "P" => 5,
        "E" => 6,
        _ => return Err(UnitError::UnknownUnit(unit.to_string())),
    };

    let base: f64 = if binary { 1024.0 } else { 1000.0 };
    Ok((base.powi(exponent), is_bits))
}

/// Parse a percent value such as `5%` or `5 %`. Only `prune_max_unused`
/// accepts this form.
pub fn parse_percent(s: &str) -> Option<u32> {
    let trimmed = s.trim();
    let number = trimmed.strip_suffix('%')?.trim();
    let value: u32 = number.parse().ok()?;
    (value <= 100).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_iec_bytes() {
        assert_eq!("10 MiB".parse::<ByteSize>().unwrap().bytes(), 10 * 1024 * 1024);
        assert_eq!("10MiB".parse::<ByteSize>().unwrap().bytes(), 10 * 1024 * 1024);
        assert_eq!("1 KiB".parse::<ByteSize>().unwrap().bytes(), 1024);
    }

    #[test]
    fn parses_si_bytes() {
        assert_eq!("10.5 MB".parse::<ByteSize>().unwrap().bytes(), 10_500_000);
        assert_eq!("1 KB".parse::<ByteSize>().unwrap().bytes(), 1000);
    }

    #[test]
    fn parses_bits() {
        // 800 mebibits = 800 * 1024 * 1024 / 8 bytes.
        assert_eq!(
            "800 Mib".parse::<ByteSize>().unwrap().bytes(),
            800 * 1024 * 1024 / 8
        );
        assert_eq!("8 Kib".parse::<ByteSize>().unwrap().bytes(), 1024);
    }

    #[test]
    fn parses_zero_and_bare_numbers() {
        assert_eq!("0 B".parse::<ByteSize>().unwrap().bytes(), 0);
        assert_eq!("12345".parse::<ByteSize>().unwrap().bytes(), 12345);
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<ByteSize>().is_err());
        assert!("ten MiB".parse::<ByteSize>().is_err());
        assert!("10 XiB".parse::<ByteSize>().is_err());
        assert!("-5 MiB".parse::<ByteSize>().is_err());
    }

    #[test]
    fn renders_iec_bytes() {
        assert_eq!(ByteSize::from_bytes(10 * 1024 * 1024).human_iec_bytes(), "10.0 MiB");
        assert_eq!(ByteSize::from_bytes(0).human_iec_bytes(), "0 B");
        assert_eq!(ByteSize::from_bytes(512).human_iec_bytes(), "512 B");
        assert_eq!(ByteSize::from_bytes(1536).human_iec_bytes(), "1.5 KiB");
    }

    #[test]
    fn renders_iec_bits() {
        assert_eq!(
            ByteSize::from_bytes(800 * 1024 * 1024 / 8).human_iec_bits(),
            "800.0 Mib"
        );
        assert_eq!(ByteSize::from_bytes(0).human_iec_bits(), "0 b");
    }

    #[test]
    fn expand_unexpand_is_idempotent_at_byte_level() {
        for input in ["10 MiB", "10.0 MiB", "1.5 KiB", "0 B", "512 B"] {
            let parsed: ByteSize = input.parse().unwrap();
            let rendered = parsed.human_iec_bytes();
            let reparsed: ByteSize = rendered.parse().unwrap();
            assert_eq!(parsed, reparsed, "roundtrip of {input}");
        }
    }

    #[test]
    fn unit_alias_equality() {
        let a: ByteSize = "10 MiB".parse().unwrap();
        let b: ByteSize = "10.0 MiB".parse().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn kib_conversion_for_rate_limits() {
        let speed: ByteSize = "800 Mib".parse().unwrap();
        assert_eq!(speed.kib(), 800 * 1024 / 8);
    }

    #[test]
    fn percent_only_parses_valid_percentages() {
        assert_eq!(parse_percent("5%"), Some(5));
        assert_eq!(parse_percent("5 %"), Some(5));
        assert_eq!(parse_percent("100%"), Some(100));
        assert_eq!(parse_percent("101%"), None);
        assert_eq!(parse_percent("5"), None);
        assert_eq!(parse_percent("abc%"), None);
    }
}
