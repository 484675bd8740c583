//! `0x`-prefixed hex quantities as used by Ethereum JSON-RPC.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuantityError {
    #[error("invalid hex quantity: {0}")]
    InvalidHex(String),
    #[error("expected a hex string, got {0}")]
    NotAString(String),
}

fn digits(s: &str) -> Result<&str, QuantityError> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .ok_or_else(|| QuantityError::InvalidHex(s.to_string()))?;
    if digits.is_empty() {
        return Err(QuantityError::InvalidHex(s.to_string()));
    }
    Ok(digits)
}

/// Parses a hex quantity such as `"0x1b4"`.
///
/// # Errors
/// Returns `QuantityError::InvalidHex` when the prefix is missing or the digits overflow.
pub fn parse_quantity_u64(s: &str) -> Result<u64, QuantityError> {
    u64::from_str_radix(digits(s)?, 16).map_err(|_| QuantityError::InvalidHex(s.to_string()))
}

/// Like [`parse_quantity_u64`] but for 128-bit values such as balances or total difficulty.
///
/// # Errors
/// Returns `QuantityError::InvalidHex` when the prefix is missing or the digits overflow.
pub fn parse_quantity_u128(s: &str) -> Result<u128, QuantityError> {
    u128::from_str_radix(digits(s)?, 16).map_err(|_| QuantityError::InvalidHex(s.to_string()))
}

/// Block numbers are tracked as `i64` so that `-1` can mean "none seen yet".
///
/// # Errors
/// Returns `QuantityError::InvalidHex` for malformed input or values above `i64::MAX`.
pub fn parse_quantity_i64(s: &str) -> Result<i64, QuantityError> {
    let value = parse_quantity_u64(s)?;
    i64::try_from(value).map_err(|_| QuantityError::InvalidHex(s.to_string()))
}

/// Extracts a `u64` quantity from a JSON string value.
///
/// # Errors
/// Returns `QuantityError::NotAString` when the value is not a string.
pub fn value_as_u64(value: &Value) -> Result<u64, QuantityError> {
    value
        .as_str()
        .ok_or_else(|| QuantityError::NotAString(value.to_string()))
        .and_then(parse_quantity_u64)
}

/// Extracts a `u128` quantity from a JSON string value.
///
/// # Errors
/// Returns `QuantityError::NotAString` when the value is not a string.
pub fn value_as_u128(value: &Value) -> Result<u128, QuantityError> {
    value
        .as_str()
        .ok_or_else(|| QuantityError::NotAString(value.to_string()))
        .and_then(parse_quantity_u128)
}

#[must_use]
pub fn format_quantity(value: u64) -> String {
    format!("0x{value:x}")
}
