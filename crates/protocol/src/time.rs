//! 12-hour timestamp parsing
//!
//! The extension records times with the browser's `toLocaleString("en-US")`,
//! which produces `MM/DD/YYYY, HH:MM:SS AM|PM`. The hour arrives on the
//! 12-hour clock, so parsing normalizes it: hour 12 with `AM` becomes hour 0,
//! and `PM` adds 12 hours unless the hour is already 12. No timezone
//! conversion happens here; a fixed label is attached when the event is
//! written to the calendar.

use chrono::{NaiveDateTime, TimeDelta, Timelike};
use thiserror::Error;

const CLOCK_FORMAT: &str = "%m/%d/%Y, %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeParseError {
    #[error("timestamp {0:?} is missing an AM/PM suffix")]
    MissingMeridiem(String),
    #[error("unknown meridiem {0:?}, expected AM or PM")]
    UnknownMeridiem(String),
    #[error("malformed timestamp {input:?}: {source}")]
    Malformed {
        input: String,
        #[source]
        source: chrono::ParseError,
    },
}

/// Parse an extension-recorded timestamp into a naive date-time.
pub fn parse_recorded_time(input: &str) -> Result<NaiveDateTime, TimeParseError> {
    let (clock, meridiem) = input
        .rsplit_once(' ')
        .ok_or_else(|| TimeParseError::MissingMeridiem(input.to_string()))?;

    let parsed =
        NaiveDateTime::parse_from_str(clock, CLOCK_FORMAT).map_err(|source| {
            TimeParseError::Malformed {
                input: input.to_string(),
                source,
            }
        })?;

    let normalized = match meridiem {
        "AM" if parsed.hour() == 12 => parsed - TimeDelta::hours(12),
        "AM" => parsed,
        "PM" if parsed.hour() == 12 => parsed,
        "PM" => parsed + TimeDelta::hours(12),
        other => return Err(TimeParseError::UnknownMeridiem(other.to_string())),
    };

    Ok(normalized)
}

/// The inverse 12-hour formatter.
pub fn format_recorded_time(time: NaiveDateTime) -> String {
    time.format("%m/%d/%Y, %I:%M:%S %p").to_string()
}
