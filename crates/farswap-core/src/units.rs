//! Size parsing and formatting for chunk sizes and memory figures.

use crate::{Error, Result};

/// One gibibyte, the unit of all thresholds and the default chunk size.
pub const ONE_GB: u64 = 1 << 30;

/// One mebibyte.
pub const ONE_MB: u64 = 1 << 20;

/// Parse size string (e.g., "1G", "512M", "64K") to bytes.
///
/// # Errors
///
/// Returns [`Error::InvalidConfig`] if the number or suffix is not recognized.
pub fn parse_size(size: &str) -> Result<u64> {
    let size = size.trim().to_uppercase();
    let size = size.strip_suffix("IB").unwrap_or(&size);

    let (num_str, multiplier) = match size.chars().last() {
        Some('K') => (&size[..size.len() - 1], 1u64 << 10),
        Some('M') => (&size[..size.len() - 1], ONE_MB),
        Some('G') => (&size[..size.len() - 1], ONE_GB),
        Some('T') => (&size[..size.len() - 1], 1u64 << 40),
        _ => (size, 1u64),
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("invalid size number: {num_str}")))?;
    num.checked_mul(multiplier)
        .ok_or_else(|| Error::InvalidConfig(format!("size overflows u64: {size}")))
}

/// Format bytes as human-readable string.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;

    if bytes >= ONE_GB {
        format!("{:.1}G", bytes as f64 / ONE_GB as f64)
    } else if bytes >= ONE_MB {
        format!("{:.1}M", bytes as f64 / ONE_MB as f64)
    } else if bytes >= KB {
        format!("{:.1}K", bytes as f64 / KB as f64)
    } else {
        format!("{bytes}B")
    }
}

/// Convert a byte count to fractional gibibytes.
#[must_use]
pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / ONE_GB as f64
}
