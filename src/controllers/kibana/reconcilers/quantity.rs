use std::sync::OnceLock;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use regex::Regex;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid quantity {0}")]
    InvalidQuantity(String),
    #[error("Invalid memory unit {0}")]
    InvalidMemoryUnit(String),
}

fn multiplier(unit: &str) -> Option<f64> {
    Some(match unit {
        "" => 1.0,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "m" => 1e-3,
        _ => return None,
    })
}

/// Reads a memory quantity (`1Gi`, `512M`, `1073741824`, `1.5Gi`) as a number of bytes.
pub fn to_bytes(quantity: &Quantity) -> Result<i64, ParseError> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let re = REGEX.get_or_init(|| {
        Regex::new(r"^([0-9]+(?:\.[0-9]+)?)([[:alpha:]]{0,2})$").expect("static regex is valid")
    });

    let raw = quantity.0.trim();
    let caps = re
        .captures(raw)
        .ok_or_else(|| ParseError::InvalidQuantity(raw.to_string()))?;
    let amount: f64 = caps[1]
        .parse()
        .map_err(|_| ParseError::InvalidQuantity(raw.to_string()))?;
    let unit = &caps[2];
    let multiplier = multiplier(unit).ok_or_else(|| ParseError::InvalidMemoryUnit(unit.to_string()))?;
    Ok((amount * multiplier) as i64)
}
