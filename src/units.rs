//! Byte size parsing.
//!
//! Converts human-readable sizes such as `"10GiB"` into bytes. Binary
//! suffixes use a 1024 multiplier, decimal suffixes 1000. An empty string
//! parses to zero, which callers interpret as "no limit".

use crate::error::{CowvolError, Result};

/// Parse a size string (e.g. `"10GiB"`, `"500MB"`, `"1073741824"`) into bytes.
pub fn parse_byte_size(value: &str) -> Result<u64> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(0);
    }

    let invalid = || CowvolError::InvalidSize { value: value.to_string() };

    // Split into numeric part and suffix.
    let split = value.find(|c: char| !c.is_ascii_digit()).unwrap_or(value.len());
    let (digits, suffix) = value.split_at(split);
    let count: u64 = digits.parse().map_err(|_| invalid())?;

    let multiplier: u64 = match suffix.trim() {
        "" | "B" => 1,
        "kB" | "KB" => 1000,
        "MB" => 1000_u64.pow(2),
        "GB" => 1000_u64.pow(3),
        "TB" => 1000_u64.pow(4),
        "PB" => 1000_u64.pow(5),
        "EB" => 1000_u64.pow(6),
        "KiB" | "kiB" => 1024,
        "MiB" => 1024_u64.pow(2),
        "GiB" => 1024_u64.pow(3),
        "TiB" => 1024_u64.pow(4),
        "PiB" => 1024_u64.pow(5),
        "EiB" => 1024_u64.pow(6),
        _ => return Err(invalid()),
    };

    count.checked_mul(multiplier).ok_or_else(invalid)
}
