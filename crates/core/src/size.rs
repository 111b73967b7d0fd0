//! Human-readable byte sizes such as `10GB` or `512 MiB`.

use crate::error::{Error, Result};

/// Parse a byte size with an optional unit suffix.
///
/// Decimal (`KB`, `MB`, `GB`, `TB`) and binary (`KiB`, `MiB`, `GiB`, `TiB`)
/// units are both accepted, case-insensitively. A bare number is bytes.
pub fn parse_byte_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    if number.is_empty() {
        return Err(Error::InvalidSize(input.to_string()));
    }

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1_000,
        "m" | "mb" => 1_000_000,
        "g" | "gb" => 1_000_000_000,
        "t" | "tb" => 1_000_000_000_000,
        "kib" => 1 << 10,
        "mib" => 1 << 20,
        "gib" => 1 << 30,
        "tib" => 1 << 40,
        _ => return Err(Error::InvalidSize(input.to_string())),
    };

    if let Ok(whole) = number.parse::<u64>() {
        return whole
            .checked_mul(multiplier)
            .ok_or_else(|| Error::InvalidSize(format!("{input} overflows u64")));
    }

    let fractional: f64 = number
        .parse()
        .map_err(|_| Error::InvalidSize(input.to_string()))?;
    let bytes = fractional * multiplier as f64;
    if !bytes.is_finite() || bytes < 0.0 || bytes > u64::MAX as f64 {
        return Err(Error::InvalidSize(input.to_string()));
    }
    Ok(bytes.round() as u64)
}
