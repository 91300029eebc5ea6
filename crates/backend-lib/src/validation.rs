// ============================
// crates/backend-lib/src/validation.rs
// ============================
//! Input validation for the realtime core.

use crate::error::AppError;
use chrono::Duration;
use regex::Regex;
use std::sync::LazyLock;

static EXTENSION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,5})\s*([mh])?$").unwrap());

/// Parse a tracking-window extension. Accepted shapes: a plain integer
/// (minutes), `<N>m`, or `<N>h`.
pub fn parse_extension(raw: &str) -> Result<Duration, AppError> {
    let caps = EXTENSION_REGEX.captures(raw.trim()).ok_or_else(|| {
        AppError::Validation(format!(
            "invalid duration '{raw}': expected minutes, <N>m or <N>h"
        ))
    })?;

    let amount: i64 = caps[1]
        .parse()
        .map_err(|_| AppError::Validation(format!("invalid duration '{raw}'")))?;
    if amount == 0 {
        return Err(AppError::Validation("duration must be positive".to_string()));
    }

    match caps.get(2).map(|m| m.as_str()) {
        Some("h") => Ok(Duration::hours(amount)),
        _ => Ok(Duration::minutes(amount)),
    }
}

/// Reject coordinates outside the WGS84 value range.
pub fn validate_coordinates(latitude: f64, longitude: f64) -> Result<(), AppError> {
    if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
        return Err(AppError::Validation(format!("latitude {latitude} out of range")));
    }
    if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
        return Err(AppError::Validation(format!(
            "longitude {longitude} out of range"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_extension() {
        assert_eq!(parse_extension("90").unwrap(), Duration::minutes(90));
        assert_eq!(parse_extension("15m").unwrap(), Duration::minutes(15));
        assert_eq!(parse_extension("2h").unwrap(), Duration::hours(2));
        assert_eq!(parse_extension(" 45 m ").unwrap(), Duration::minutes(45));

        assert!(parse_extension("").is_err());
        assert!(parse_extension("0").is_err());
        assert!(parse_extension("-5").is_err());
        assert!(parse_extension("1.5h").is_err());
        assert!(parse_extension("2d").is_err());
        assert!(parse_extension("soon").is_err());
    }

    #[test]
    fn test_validate_coordinates() {
        assert!(validate_coordinates(48.2082, 16.3738).is_ok());
        assert!(validate_coordinates(-90.0, 180.0).is_ok());

        assert!(validate_coordinates(90.1, 0.0).is_err());
        assert!(validate_coordinates(0.0, -180.5).is_err());
        assert!(validate_coordinates(f64::NAN, 0.0).is_err());
    }
}
