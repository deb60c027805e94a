//! Human duration strings (`30s`, `5m`, `2h`, `1d`)

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DurationError {
    #[error("Invalid duration format: {0}")]
    InvalidFormat(String),

    #[error("Invalid duration value: {0}")]
    InvalidValue(String),

    #[error("Duration value cannot be negative")]
    Negative,

    #[error("Invalid duration unit: {0} (use s/m/h/d)")]
    InvalidUnit(String),

    #[error("Duration too long: {0}")]
    Overflow(String),
}

/// Parse a duration into seconds; an empty string is permanent (0)
///
/// # Errors
/// Returns an error for unknown units, negative values or non-numeric input
pub fn parse_duration(input: &str) -> Result<u32, DurationError> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(0);
    }

    let Some(unit) = input.chars().last() else {
        return Ok(0);
    };
    let value = &input[..input.len() - unit.len_utf8()];
    if value.is_empty() {
        return Err(DurationError::InvalidFormat(input.to_string()));
    }

    let value: i64 = value
        .parse()
        .map_err(|_| DurationError::InvalidValue(value.to_string()))?;
    if value < 0 {
        return Err(DurationError::Negative);
    }

    let multiplier = match unit.to_ascii_lowercase() {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        'd' => 86_400,
        other => return Err(DurationError::InvalidUnit(other.to_string())),
    };

    value
        .checked_mul(multiplier)
        .and_then(|secs| u32::try_from(secs).ok())
        .ok_or_else(|| DurationError::Overflow(input.to_string()))
}

/// Render seconds in the largest whole unit, "permanent" for 0
#[must_use]
pub fn format_duration(secs: u32) -> String {
    match secs {
        0 => "permanent".to_string(),
        s if s < 60 => plural(s, "second"),
        s if s < 3600 => plural(s / 60, "minute"),
        s if s < 86_400 => plural(s / 3600, "hour"),
        s => plural(s / 86_400, "day"),
    }
}

fn plural(n: u32, unit: &str) -> String {
    if n == 1 {
        format!("1 {unit}")
    } else {
        format!("{n} {unit}s")
    }
}
