//! Per-user quota documents and the limits a claim asks for.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Additional-config key holding the requested maximum object count.
pub const MAX_OBJECTS_KEY: &str = "maxObjects";
/// Additional-config key holding the requested maximum size (a byte quantity).
pub const MAX_SIZE_KEY: &str = "maxSize";

/// The quota currently stored for a user.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct UserQuota {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub max_objects: Option<i64>,
    /// Bytes.
    #[serde(default)]
    pub max_size: Option<i64>,
}

/// A quota write. Fields left `None` are not sent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QuotaSpec {
    pub uid: String,
    pub enabled: Option<bool>,
    pub max_objects: Option<i64>,
    pub max_size: Option<i64>,
}

/// Quota limits requested by a claim, still in their string form.
///
/// Empty strings in the claim's config are absent here; the conversion happens
/// once, in [`QuotaLimits::from_additional_config`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QuotaLimits {
    pub max_objects: Option<String>,
    pub max_size: Option<String>,
}

/// Parsed quota limits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParsedLimits {
    pub max_objects: Option<i64>,
    pub max_size: Option<i64>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid {field} value `{value}`: {reason}")]
pub struct QuantityError {
    pub field: &'static str,
    pub value: String,
    pub reason: String,
}

impl QuotaLimits {
    pub fn from_additional_config(config: &BTreeMap<String, String>) -> Self {
        let get = |key: &str| {
            config
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            max_objects: get(MAX_OBJECTS_KEY),
            max_size: get(MAX_SIZE_KEY),
        }
    }

    /// Parse both limits. Object counts are plain integers, sizes are byte quantities.
    pub fn parse(&self) -> Result<ParsedLimits, QuantityError> {
        let max_objects = self
            .max_objects
            .as_deref()
            .map(|raw| {
                raw.parse::<i64>().map_err(|err| QuantityError {
                    field: MAX_OBJECTS_KEY,
                    value: raw.to_string(),
                    reason: err.to_string(),
                })
            })
            .transpose()?;
        let max_size = self
            .max_size
            .as_deref()
            .map(|raw| {
                parse_quantity(raw).map_err(|reason| QuantityError {
                    field: MAX_SIZE_KEY,
                    value: raw.to_string(),
                    reason,
                })
            })
            .transpose()?;
        Ok(ParsedLimits {
            max_objects,
            max_size,
        })
    }
}

const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ki", 10),
    ("Mi", 20),
    ("Gi", 30),
    ("Ti", 40),
    ("Pi", 50),
    ("Ei", 60),
];

const DECIMAL_SUFFIXES: [(&str, i32); 7] = [
    ("m", -3),
    ("k", 3),
    ("M", 6),
    ("G", 9),
    ("T", 12),
    ("P", 15),
    ("E", 18),
];

/// Parse a Kubernetes-style resource quantity into a whole number of units.
///
/// Accepts an optionally signed decimal number followed by a binary suffix
/// (`Ki`..`Ei`), a decimal suffix (`m`, `k`..`E`), a decimal exponent
/// (`e3`, `E-2`) or nothing. Fractional results round up, away from zero.
pub fn parse_quantity(raw: &str) -> Result<i64, String> {
    let s = raw.trim();
    if s.is_empty() {
        return Err("empty quantity".into());
    }

    let (negative, unsigned) = match s.as_bytes()[0] {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };

    let number_len = unsigned
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(unsigned.len());
    let (number, suffix) = unsigned.split_at(number_len);

    let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return Err("missing numeric value".into());
    }
    if frac_part.contains('.') {
        return Err("more than one decimal point".into());
    }

    // value = mantissa / 10^scale, kept exact in 128-bit integers
    let digits = format!("{}{}", int_part, frac_part);
    let mut mantissa: u128 = if digits.is_empty() {
        0
    } else {
        digits.parse().map_err(|_| "number too large".to_string())?
    };
    let overflow = || "quantity overflows".to_string();
    let mut scale = i32::try_from(frac_part.len()).map_err(|_| overflow())?;

    if let Some(&(_, shift)) = BINARY_SUFFIXES.iter().find(|(sfx, _)| *sfx == suffix) {
        mantissa = mantissa
            .checked_mul(1u128 << shift)
            .ok_or_else(overflow)?;
    } else if let Some(&(_, exp)) = DECIMAL_SUFFIXES.iter().find(|(sfx, _)| *sfx == suffix) {
        scale = scale.checked_sub(exp).ok_or_else(overflow)?;
    } else if let Some(exp) = suffix
        .strip_prefix('e')
        .or_else(|| suffix.strip_prefix('E'))
    {
        let exp: i32 = exp
            .parse()
            .map_err(|_| format!("unknown suffix `{}`", suffix))?;
        scale = scale.checked_sub(exp).ok_or_else(overflow)?;
    } else if !suffix.is_empty() {
        return Err(format!("unknown suffix `{}`", suffix));
    }

    let magnitude = if scale <= 0 {
        10u128
            .checked_pow(scale.unsigned_abs())
            .and_then(|m| mantissa.checked_mul(m))
            .ok_or_else(overflow)?
    } else {
        match 10u128.checked_pow(scale as u32) {
            Some(div) => mantissa.div_ceil(div),
            None => u128::from(mantissa != 0),
        }
    };

    let magnitude = i64::try_from(magnitude).map_err(|_| overflow())?;
    Ok(if negative { -magnitude } else { magnitude })
}
