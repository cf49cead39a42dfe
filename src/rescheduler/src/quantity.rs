//! Kubernetes resource quantities (`100m`, `1.5`, `512Mi`, `1G`, `2e3`).

use controller_core::{Error, Result};

const BINARY_SUFFIXES: [(&str, f64); 6] = [
    ("Ki", 1024.0),
    ("Mi", 1_048_576.0),
    ("Gi", 1_073_741_824.0),
    ("Ti", 1_099_511_627_776.0),
    ("Pi", 1_125_899_906_842_624.0),
    ("Ei", 1_152_921_504_606_846_976.0),
];

const DECIMAL_SUFFIXES: [(&str, f64); 9] = [
    ("n", 1e-9),
    ("u", 1e-6),
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

/// Parse a quantity into its value in base units.
pub fn parse_quantity(quantity: &str) -> Result<f64> {
    let quantity = quantity.trim();
    let (number, multiplier) = BINARY_SUFFIXES
        .iter()
        .chain(DECIMAL_SUFFIXES.iter())
        .find_map(|(suffix, multiplier)| quantity.strip_suffix(suffix).map(|n| (n, *multiplier)))
        .unwrap_or((quantity, 1.0));

    let value: f64 = number
        .parse()
        .map_err(|_| Error::MalformedObject(format!("invalid quantity {quantity:?}")))?;
    if !value.is_finite() || value < 0.0 {
        return Err(Error::MalformedObject(format!("invalid quantity {quantity:?}")));
    }
    Ok(value * multiplier)
}

/// CPU quantity in millicores, rounded up the way the API server does.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn cpu_millis(quantity: &str) -> Result<u64> {
    Ok(round_up(parse_quantity(quantity)? * 1000.0) as u64)
}

/// Memory quantity in bytes.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn memory_bytes(quantity: &str) -> Result<u64> {
    Ok(round_up(parse_quantity(quantity)?) as u64)
}

// Float noise from the suffix multipliers must not push a whole value up by one.
fn round_up(value: f64) -> f64 {
    ((value * 1e6).round() / 1e6).ceil()
}
