//! Duration parsing with day units
//!
//! Accepts a sequence of `<integer><unit>` terms where unit is one of
//! `d`, `h`, `m`, `s` or `ms`. Terms may be separated by any amount of
//! whitespace, and leading/trailing whitespace is ignored:
//!
//! ```
//! use std::time::Duration;
//! use planegate_common::duration::parse_duration;
//!
//! assert_eq!(parse_duration("90d").unwrap(), Duration::from_secs(90 * 86_400));
//! assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5_400));
//! assert_eq!(parse_duration("10d 1h").unwrap(), Duration::from_secs(10 * 86_400 + 3_600));
//! ```
//!
//! Negative values and decimals are rejected.

use std::time::Duration;

use thiserror::Error;

/// Errors from [`parse_duration`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationError {
    /// Input is empty or whitespace only
    #[error("duration is empty")]
    Empty,

    /// A term has no leading number
    #[error("invalid duration {input:?}: expected a number at offset {offset}")]
    MissingNumber {
        /// Original input
        input: String,
        /// Byte offset of the bad term
        offset: usize,
    },

    /// A number is followed by no unit or an unknown one
    #[error("invalid duration {input:?}: unknown unit {unit:?}")]
    UnknownUnit {
        /// Original input
        input: String,
        /// The unit as written
        unit: String,
    },

    /// The total does not fit in a `Duration`
    #[error("duration {0:?} is too large")]
    Overflow(String),
}

/// Parse a duration string such as `"10d 1h 30m"`.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DurationError::Empty);
    }

    let bytes = trimmed.as_bytes();
    let mut pos = 0;
    let mut total_ms: u64 = 0;

    while pos < bytes.len() {
        if bytes[pos].is_ascii_whitespace() {
            pos += 1;
            continue;
        }

        let num_start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
        }
        if pos == num_start {
            return Err(DurationError::MissingNumber {
                input: input.to_string(),
                offset: num_start,
            });
        }
        let value: u64 = trimmed[num_start..pos]
            .parse()
            .map_err(|_| DurationError::Overflow(input.to_string()))?;

        let unit_start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_alphabetic() {
            pos += 1;
        }
        let unit = &trimmed[unit_start..pos];
        let unit_ms = match unit {
            "d" => 86_400_000,
            "h" => 3_600_000,
            "m" => 60_000,
            "s" => 1_000,
            "ms" => 1,
            _ => {
                let shown = if unit.is_empty() {
                    trimmed[unit_start..].chars().take(1).collect()
                } else {
                    unit.to_string()
                };
                return Err(DurationError::UnknownUnit {
                    input: input.to_string(),
                    unit: shown,
                });
            }
        };

        total_ms = value
            .checked_mul(unit_ms)
            .and_then(|ms| total_ms.checked_add(ms))
            .ok_or_else(|| DurationError::Overflow(input.to_string()))?;
    }

    Ok(Duration::from_millis(total_ms))
}

/// Check that `input` is a parseable duration.
pub fn validate_duration(input: &str) -> Result<(), DurationError> {
    parse_duration(input).map(|_| ())
}

/// Format a duration using the largest whole units, e.g. `"1d2h"`.
///
/// The output is accepted by [`parse_duration`].
pub fn format_duration(duration: Duration) -> String {
    let mut ms = duration.as_millis();
    if ms == 0 {
        return "0s".to_string();
    }

    let mut out = String::new();
    for (suffix, size) in [
        ("d", 86_400_000u128),
        ("h", 3_600_000),
        ("m", 60_000),
        ("s", 1_000),
        ("ms", 1),
    ] {
        if ms >= size {
            out.push_str(&format!("{}{}", ms / size, suffix));
            ms %= size;
        }
    }
    out
}
