//! Interval tokens such as `"1m"` or `"4h"`.

use crate::{Error, Result};

/// Seconds per unit letter. `M` is a 30-day month.
fn unit_seconds(unit: char) -> Option<u64> {
    match unit {
        's' => Some(1),
        'm' => Some(60),
        'h' => Some(60 * 60),
        'd' => Some(60 * 60 * 24),
        'w' => Some(60 * 60 * 24 * 7),
        'M' => Some(60 * 60 * 24 * 30),
        _ => None,
    }
}

/// Convert an interval token (one or two digits then a unit in `smhdwM`) to seconds.
///
/// Returns `None` if the token does not match.
pub fn parse_interval(token: &str) -> Option<u64> {
    let unit = token.chars().last()?;
    let digits = &token[..token.len() - unit.len_utf8()];
    if digits.is_empty() || digits.len() > 2 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let count: u64 = digits.parse().ok()?;
    Some(count * unit_seconds(unit)?)
}

/// Like [`parse_interval`] but as a configuration error, for callers that
/// cannot continue without a valid interval.
pub fn interval_seconds(token: &str) -> Result<u64> {
    parse_interval(token)
        .ok_or_else(|| Error::Config(format!("unparseable interval token '{token}'")))
}

/// Interval length in milliseconds.
pub fn interval_millis(token: &str) -> Result<i64> {
    Ok(interval_seconds(token)? as i64 * 1000)
}
