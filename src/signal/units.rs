//! Linear unit conversion for derived signals.

use crate::error::{DeviceError, DeviceResult};

/// Scale of a unit relative to the base unit of its dimension.
fn unit_scale(unit: &str) -> Option<(&'static str, f64)> {
    let scale = match unit {
        "m" => ("length", 1.0),
        "mm" => ("length", 1e-3),
        "um" | "µm" | "micron" => ("length", 1e-6),
        "nm" => ("length", 1e-9),
        "s" => ("time", 1.0),
        "ms" => ("time", 1e-3),
        "us" | "µs" => ("time", 1e-6),
        "ns" => ("time", 1e-9),
        "rad" => ("angle", 1.0),
        "mrad" => ("angle", 1e-3),
        "urad" | "µrad" => ("angle", 1e-6),
        "deg" | "degree" => ("angle", std::f64::consts::PI / 180.0),
        "eV" => ("energy", 1.0),
        "keV" => ("energy", 1e3),
        _ => return None,
    };
    Some(scale)
}

/// Convert `value` from `from` units to `to` units.
///
/// Fails with `Unsupported` for unknown units or mismatched dimensions.
pub fn convert_unit(value: f64, from: &str, to: &str) -> DeviceResult<f64> {
    if from == to {
        return Ok(value);
    }
    let unknown = |unit: &str| DeviceError::Unsupported(format!("unknown unit '{}'", unit));
    let (from_dim, from_scale) = unit_scale(from).ok_or_else(|| unknown(from))?;
    let (to_dim, to_scale) = unit_scale(to).ok_or_else(|| unknown(to))?;
    if from_dim != to_dim {
        return Err(DeviceError::Unsupported(format!(
            "cannot convert {} ({}) to {} ({})",
            from, from_dim, to, to_dim
        )));
    }
    Ok(value * from_scale / to_scale)
}
