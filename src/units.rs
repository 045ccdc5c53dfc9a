//! Shell-facing size/bandwidth unit parsing. Lives outside the core per
//! spec.md §6: `ControllerAPI` itself takes already-parsed `u64`/`f64`
//! values, since unit parsing is an external-collaborator concern.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnitError {
    #[error("invalid_argument: empty size/bandwidth value")]
    Empty,
    #[error("invalid_argument: {0}")]
    BadNumber(String),
    #[error("invalid_argument: unrecognized unit suffix in {0:?}")]
    UnknownSuffix(String),
}

/// Parses a decimal byte-size shorthand (`KB`, `MB`, `GB`, `TB`, `PB`,
/// case-insensitive, decimal/1000-based per spec.md §6). A bare number is
/// taken as bytes.
pub fn parse_bytes(input: &str) -> Result<u64, UnitError> {
    const UNITS: &[(&str, u64)] = &[
        ("PB", 1_000_000_000_000_000),
        ("TB", 1_000_000_000_000),
        ("GB", 1_000_000_000),
        ("MB", 1_000_000),
        ("KB", 1_000),
        ("B", 1),
    ];
    let (value, multiplier) = split_suffix(input, UNITS)?;
    Ok((value * multiplier as f64).round() as u64)
}

/// Parses a decimal bits-per-second shorthand (`Mbps`, `Gbps`). A bare
/// number is taken as bits/second.
pub fn parse_bps(input: &str) -> Result<u64, UnitError> {
    const UNITS: &[(&str, u64)] = &[
        ("Gbps", 1_000_000_000),
        ("Mbps", 1_000_000),
        ("Kbps", 1_000),
        ("bps", 1),
    ];
    let (value, multiplier) = split_suffix(input, UNITS)?;
    Ok((value * multiplier as f64).round() as u64)
}

fn split_suffix(input: &str, units: &[(&str, u64)]) -> Result<(f64, u64), UnitError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(UnitError::Empty);
    }
    let upper = trimmed.to_ascii_uppercase();
    for &(suffix, multiplier) in units {
        if upper.ends_with(&suffix.to_ascii_uppercase()) {
            let number_part = &trimmed[..trimmed.len() - suffix.len()];
            if number_part.is_empty() {
                continue;
            }
            let value: f64 = number_part
                .trim()
                .parse()
                .map_err(|_| UnitError::BadNumber(number_part.to_string()))?;
            return Ok((value, multiplier));
        }
    }
    trimmed
        .parse::<f64>()
        .map(|v| (v, 1))
        .map_err(|_| UnitError::UnknownSuffix(trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal_byte_suffixes() {
        assert_eq!(parse_bytes("64KB").unwrap(), 64_000);
        assert_eq!(parse_bytes("1MB").unwrap(), 1_000_000);
        assert_eq!(parse_bytes("2GB").unwrap(), 2_000_000_000);
        assert_eq!(parse_bytes("1024").unwrap(), 1024);
    }

    #[test]
    fn parses_bandwidth_suffixes() {
        assert_eq!(parse_bps("1Gbps").unwrap(), 1_000_000_000);
        assert_eq!(parse_bps("500Mbps").unwrap(), 500_000_000);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_bytes("").is_err());
        assert!(parse_bytes("abc").is_err());
    }
}
