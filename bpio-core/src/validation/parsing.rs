//! Parsing of parameter strings
//!
//! Engine parameters arrive as a flat string map. These helpers turn the
//! values into typed settings without any allocation.

use crate::FormatError;

/// Parse a byte size with an optional unit suffix
///
/// Accepts plain numbers and the suffixes `b`, `kb`, `mb`, `gb`
/// (case-insensitive, binary multiples), e.g. `"16Kb"` or `"2 GB"`.
pub fn parse_size(value: &str) -> Result<u64, FormatError> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let base: u64 = digits.parse().map_err(|_| FormatError::InvalidRange)?;

    let unit = unit.trim();
    let multiplier: u64 = if unit.is_empty() || unit.eq_ignore_ascii_case("b") {
        1
    } else if unit.eq_ignore_ascii_case("kb") || unit.eq_ignore_ascii_case("k") {
        1 << 10
    } else if unit.eq_ignore_ascii_case("mb") || unit.eq_ignore_ascii_case("m") {
        1 << 20
    } else if unit.eq_ignore_ascii_case("gb") || unit.eq_ignore_ascii_case("g") {
        1 << 30
    } else {
        return Err(FormatError::InvalidRange);
    };

    base.checked_mul(multiplier)
        .ok_or(FormatError::ArraySizeOverflow)
}

/// Parse an on/off style flag
pub fn parse_flag(value: &str) -> Result<bool, FormatError> {
    let value = value.trim();
    const ON: [&str; 4] = ["on", "true", "yes", "1"];
    const OFF: [&str; 4] = ["off", "false", "no", "0"];

    if ON.iter().any(|v| value.eq_ignore_ascii_case(v)) {
        Ok(true)
    } else if OFF.iter().any(|v| value.eq_ignore_ascii_case(v)) {
        Ok(false)
    } else {
        Err(FormatError::InvalidRange)
    }
}

/// Parse a non-negative integer
pub fn parse_u64(value: &str) -> Result<u64, FormatError> {
    value.trim().parse().map_err(|_| FormatError::InvalidRange)
}

/// Parse a floating point number of seconds or a factor
pub fn parse_f64(value: &str) -> Result<f64, FormatError> {
    let parsed: f64 = value.trim().parse().map_err(|_| FormatError::InvalidRange)?;
    if parsed.is_nan() {
        return Err(FormatError::InvalidRange);
    }
    Ok(parsed)
}
