//! Parsing of human-readable schedule times
//!
//! Accepts relative durations ("30m", "2h", "1 day"), RFC 3339 timestamps
//! and natural language ("tomorrow 3pm", "next monday 10am"). The reference
//! time is passed in so callers control the clock.

use chrono::{DateTime, Duration, Utc};

use crate::error::{FanoutError, Result};

/// Resolve `input` to an absolute UTC time relative to `now`
pub fn parse_schedule(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(FanoutError::InvalidInput(
            "Schedule string cannot be empty".to_string(),
        ));
    }

    if let Ok(duration) = parse_duration(input) {
        return now
            .checked_add_signed(duration)
            .ok_or_else(|| FanoutError::InvalidInput("Schedule time out of range".to_string()));
    }

    if let Ok(at) = DateTime::parse_from_rfc3339(input) {
        return Ok(at.with_timezone(&Utc));
    }

    chrono_english::parse_date_string(input, now, chrono_english::Dialect::Us).map_err(|e| {
        FanoutError::InvalidInput(format!("Could not parse schedule '{}': {}", input, e))
    })
}

/// Parse a humantime duration ("90s", "5m", "2h 30m") into a chrono duration
pub fn parse_duration(input: &str) -> Result<Duration> {
    let std_duration = humantime::parse_duration(input)
        .map_err(|e| FanoutError::InvalidInput(format!("Could not parse duration '{}': {}", input, e)))?;

    Duration::from_std(std_duration)
        .map_err(|_| FanoutError::InvalidInput("Duration out of range".to_string()))
}
