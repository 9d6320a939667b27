//! Kubernetes storage quantities
//!
//! Only the forms that appear in storage requests are accepted: a plain
//! integer, or an integer/decimal number with a decimal (`k M G T P E`) or
//! binary (`Ki Mi Gi Ti Pi Ei`) suffix.

use std::cmp::Ordering;
use std::fmt;

use crate::Error;

const BINARY_SUFFIXES: &[(&str, u32)] = &[
    ("Ki", 1),
    ("Mi", 2),
    ("Gi", 3),
    ("Ti", 4),
    ("Pi", 5),
    ("Ei", 6),
];

const DECIMAL_SUFFIXES: &[(&str, u32)] = &[
    ("k", 1),
    ("M", 2),
    ("G", 3),
    ("T", 4),
    ("P", 5),
    ("E", 6),
];

/// A parsed storage size, keeping the original text for round-tripping
#[derive(Clone, Debug)]
pub struct StorageSize {
    raw: String,
    bytes: u128,
}

impl StorageSize {
    /// Parse a quantity; `field` names where the value came from for error reporting
    pub fn parse(field: &str, raw: &str) -> Result<Self, Error> {
        let trimmed = raw.trim();
        let invalid = |msg: &str| Error::config(field, raw, msg);

        if trimmed.is_empty() {
            return Err(invalid("storage size is empty"));
        }

        let (number, multiplier) =
            split_suffix(trimmed).ok_or_else(|| invalid("unknown unit suffix"))?;
        let bytes = scale(number, multiplier).ok_or_else(|| invalid("not a valid quantity"))?;

        if bytes == 0 {
            return Err(invalid("storage size must be greater than zero"));
        }

        Ok(Self {
            raw: trimmed.to_string(),
            bytes,
        })
    }

    /// Size in bytes
    pub fn bytes(&self) -> u128 {
        self.bytes
    }

    /// The quantity as originally written
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl PartialEq for StorageSize {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for StorageSize {}

impl PartialOrd for StorageSize {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StorageSize {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl fmt::Display for StorageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn split_suffix(value: &str) -> Option<(&str, u128)> {
    for (suffix, power) in BINARY_SUFFIXES {
        if let Some(number) = value.strip_suffix(suffix) {
            return Some((number, 1024u128.pow(*power)));
        }
    }
    for (suffix, power) in DECIMAL_SUFFIXES {
        if let Some(number) = value.strip_suffix(suffix) {
            return Some((number, 1000u128.pow(*power)));
        }
    }
    if value.chars().last().map(|c| c.is_ascii_digit()).unwrap_or(false) {
        return Some((value, 1));
    }
    None
}

/// `number * multiplier`, rounding fractional bytes up
fn scale(number: &str, multiplier: u128) -> Option<u128> {
    let (whole, fraction) = match number.split_once('.') {
        Some((w, f)) => (w, f),
        None => (number, ""),
    };
    if whole.is_empty() && fraction.is_empty() {
        return None;
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }

    let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut bytes = whole.checked_mul(multiplier)?;

    if !fraction.is_empty() {
        let digits = u32::try_from(fraction.len()).ok()?;
        let denom = 10u128.checked_pow(digits)?;
        let numer: u128 = fraction.parse().ok()?;
        let scaled = numer.checked_mul(multiplier)?;
        bytes = bytes.checked_add(scaled.div_ceil(denom))?;
    }
    Some(bytes)
}
