//! Splitting a requested range into backend-sized query windows, and the
//! duration tokens the backend understands as a query step.

use std::{fmt, str::FromStr};

use time::{macros::format_description, Duration, OffsetDateTime, UtcOffset};

use crate::AcquireError;

/// A contiguous sub-range `[start, end)` of an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeWindow {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

impl TimeWindow {
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> Result<Self, AcquireError> {
        if start >= end {
            return Err(AcquireError::InvalidRange { start, end });
        }
        Ok(TimeWindow { start, end })
    }

    pub fn span(&self) -> Duration {
        self.end - self.start
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", iso8601(self.start), iso8601(self.end))
    }
}

/// Split `[start, end)` into consecutive windows no longer than `max_span`.
///
/// An empty range yields no windows. The last window is cut short so that
/// its end is exactly `end`.
pub fn plan_windows(
    start: OffsetDateTime,
    end: OffsetDateTime,
    max_span: Duration,
) -> Result<Vec<TimeWindow>, AcquireError> {
    if end < start {
        return Err(AcquireError::InvalidRange { start, end });
    }
    if !max_span.is_positive() {
        return Err(AcquireError::InvalidRequest(format!(
            "window span must be positive, got {}",
            max_span
        )));
    }

    let mut windows = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let next = cursor
            .checked_add(max_span)
            .map_or(end, |candidate| candidate.min(end));
        windows.push(TimeWindow {
            start: cursor,
            end: next,
        });
        cursor = next;
    }
    Ok(windows)
}

/// Format a timestamp as `YYYY-MM-DDTHH:MM:SSZ` in UTC.
pub fn iso8601(ts: OffsetDateTime) -> String {
    let description = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]Z");
    let utc = ts.to_offset(UtcOffset::UTC);
    utc.format(description).unwrap_or_else(|_| utc.to_string())
}

/// Unix seconds as the backend accepts them in `start`/`end`/`time` parameters.
pub fn unix_seconds(ts: OffsetDateTime) -> String {
    let nanos = ts.unix_timestamp_nanos();
    if nanos % 1_000_000_000 == 0 {
        ts.unix_timestamp().to_string()
    } else {
        format!("{:.3}", nanos as f64 / 1e9)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error("invalid step `{0}`: expected <count><s|m|h|d|w|y>")]
    Invalid(String),
    #[error("unknown step unit `{0}`: expected minutes, hours, days, weeks or years")]
    UnknownUnit(String),
}

const UNITS: [(&str, i64); 6] = [
    ("y", 365 * 86_400),
    ("w", 7 * 86_400),
    ("d", 86_400),
    ("h", 3_600),
    ("m", 60),
    ("s", 1),
];

/// A backend duration token such as `1m`, `6h` or `1d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Step(Duration);

impl Step {
    pub const MINUTE: Step = Step(Duration::MINUTE);

    pub fn from_duration(duration: Duration) -> Result<Self, StepError> {
        if duration.whole_seconds() <= 0 || duration.subsec_nanoseconds() != 0 {
            return Err(StepError::Invalid(duration.to_string()));
        }
        Ok(Step(duration))
    }

    /// Build a step from a count and a spelled-out unit, e.g. `(15, "minutes")`.
    pub fn from_parts(count: u32, unit: &str) -> Result<Self, StepError> {
        let suffix = match unit.to_lowercase().as_str() {
            "seconds" => "s",
            "minutes" => "m",
            "hours" => "h",
            "days" => "d",
            "weeks" => "w",
            "years" => "y",
            _ => return Err(StepError::UnknownUnit(unit.to_string())),
        };
        format!("{}{}", count, suffix).parse()
    }

    pub fn duration(&self) -> Duration {
        self.0
    }
}

impl FromStr for Step {
    type Err = StepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim();
        let split = token
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| StepError::Invalid(s.to_string()))?;
        let (count, unit) = token.split_at(split);
        let count: i64 = count
            .parse()
            .map_err(|_| StepError::Invalid(s.to_string()))?;
        let (_, unit_secs) = UNITS
            .iter()
            .find(|(suffix, _)| *suffix == unit)
            .ok_or_else(|| StepError::Invalid(s.to_string()))?;
        let secs = count
            .checked_mul(*unit_secs)
            .ok_or_else(|| StepError::Invalid(s.to_string()))?;
        Step::from_duration(Duration::seconds(secs)).map_err(|_| StepError::Invalid(s.to_string()))
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.whole_seconds();
        let (suffix, unit_secs) = UNITS
            .iter()
            .find(|(_, unit_secs)| secs % unit_secs == 0)
            .unwrap_or(&("s", 1));
        write!(f, "{}{}", secs / unit_secs, suffix)
    }
}
