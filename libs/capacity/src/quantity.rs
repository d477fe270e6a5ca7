//! Kubernetes resource quantities as approximate floats.
//!
//! CPU comes out in cores (`"250m"` → `0.25`), memory in bytes
//! (`"1Gi"` → `1073741824.0`). Precision loss is acceptable for sizing.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::error::QuantityError;

/// Parses a quantity string: `<signed number><suffix>` where the suffix is a
/// binary SI (`Ki`..`Ei`), decimal SI (`n`..`E`) or decimal exponent (`e3`).
pub fn parse_quantity(input: &str) -> Result<f64, QuantityError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(QuantityError::new(input, "empty"));
    }

    let number_end = s
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || c == '.' || ((c == '+' || c == '-') && i == 0)))
        .map_or(s.len(), |(i, _)| i);
    let (number, suffix) = s.split_at(number_end);

    if number.is_empty() || number == "+" || number == "-" {
        return Err(QuantityError::new(input, "missing numeric part"));
    }
    let value: f64 = number
        .parse()
        .map_err(|_| QuantityError::new(input, "malformed number"))?;

    let multiplier = suffix_multiplier(suffix).ok_or_else(|| QuantityError::new(input, "unknown suffix"))?;
    Ok(value * multiplier)
}

fn suffix_multiplier(suffix: &str) -> Option<f64> {
    let multiplier = match suffix {
        "" => 1.0,
        "Ki" => 1024_f64,
        "Mi" => 1024_f64.powi(2),
        "Gi" => 1024_f64.powi(3),
        "Ti" => 1024_f64.powi(4),
        "Pi" => 1024_f64.powi(5),
        "Ei" => 1024_f64.powi(6),
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        _ => {
            let exponent = suffix.strip_prefix(['e', 'E'])?;
            let exponent: i32 = exponent.parse().ok()?;
            10_f64.powi(exponent)
        }
    };
    Some(multiplier)
}

/// Convenience for optional quantities out of resource maps; absent is zero.
pub fn quantity_value(quantity: Option<&Quantity>) -> Result<f64, QuantityError> {
    quantity.map_or(Ok(0.0), |q| parse_quantity(&q.0))
}
