/*!
 * Wall-clock handling for HomeFlow.
 *
 * This module provides the clock abstraction used to evaluate rule windows
 * and calendar timers, time-of-day ranges and calendar specifications.
 * Durations are measured by the tokio timer; wall-clock time is only read
 * through a [`Clock`] so tests can pin it.
 */
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{Datelike, Local, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A source of local wall-clock time
pub trait Clock: Send + Sync + fmt::Debug {
    /// The current local date and time
    fn now(&self) -> NaiveDateTime;

    /// The current local time of day
    fn time_of_day(&self) -> NaiveTime {
        self.now().time()
    }
}

/// A shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// The host's local clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    /// Create a clock pinned at the given instant
    pub fn new(now: NaiveDateTime) -> Self {
        Self { now: Mutex::new(now) }
    }

    /// Create a clock pinned at a time of day on an arbitrary fixed date
    pub fn at_time(time: NaiveTime) -> Self {
        let date = chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default();
        Self::new(date.and_time(time))
    }

    /// Move the clock to the given instant
    pub fn set(&self, now: NaiveDateTime) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    /// Move the clock to a time of day, keeping the date
    pub fn set_time(&self, time: NaiveTime) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = now.date().and_time(time);
    }

    /// Advance the clock
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Parse a clock string.
///
/// Accepts `H:MM`, `H:MM AM/PM`, `H:MM:SS` and `H:MM:SS AM/PM`.
pub fn parse_clock_time(s: &str) -> Result<NaiveTime> {
    let s = s.trim().to_uppercase();
    const FORMATS: [&str; 6] = ["%I:%M %p", "%I:%M:%S %p", "%I:%M%p", "%I:%M:%S%p", "%H:%M:%S", "%H:%M"];

    FORMATS
        .iter()
        .find_map(|format| NaiveTime::parse_from_str(&s, format).ok())
        .ok_or_else(|| Error::parse(format!("Invalid time of day: {}", s)))
}

/// An inclusive time-of-day window, possibly crossing midnight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Window start
    pub start: NaiveTime,
    /// Window end
    pub end: NaiveTime,
}

impl TimeRange {
    /// Create a window
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Build a window from optional clock strings.
    ///
    /// A missing start opens at midnight and a missing end closes at
    /// 23:59:59. Returns `None` when neither bound is given.
    pub fn from_bounds(start: Option<&str>, end: Option<&str>) -> Result<Option<Self>> {
        if start.is_none() && end.is_none() {
            return Ok(None);
        }
        let start = match start {
            Some(s) => parse_clock_time(s)?,
            None => NaiveTime::MIN,
        };
        let end = match end {
            Some(s) => parse_clock_time(s)?,
            None => NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN),
        };
        Ok(Some(Self::new(start, end)))
    }

    /// Whether the window wraps past midnight
    pub fn crosses_midnight(&self) -> bool {
        self.start > self.end
    }

    /// Whether a time of day falls inside the window
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.crosses_midnight() {
            time >= self.start || time <= self.end
        } else {
            time >= self.start && time <= self.end
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M:%S"), self.end.format("%H:%M:%S"))
    }
}

/// One field of a calendar specification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldSet {
    /// Matches every value
    Any,
    /// Matches only the listed values
    Only(BTreeSet<u32>),
}

impl FieldSet {
    /// A field matching a single value
    pub fn one(value: u32) -> Self {
        FieldSet::Only(BTreeSet::from([value]))
    }

    /// Whether the field accepts a value
    pub fn matches(&self, value: u32) -> bool {
        match self {
            FieldSet::Any => true,
            FieldSet::Only(values) => values.contains(&value),
        }
    }

    /// Parse `*`, `5`, `1,3,5`, `1-5` or `*/15` within `min..=max`
    pub fn parse(s: &str, min: u32, max: u32) -> Result<Self> {
        let s = s.trim();
        if s == "*" {
            return Ok(FieldSet::Any);
        }

        let number = |raw: &str| -> Result<u32> {
            let value: u32 = raw
                .trim()
                .parse()
                .map_err(|_| Error::parse(format!("Invalid calendar value: {}", raw)))?;
            if value < min || value > max {
                return Err(Error::parse(format!(
                    "Calendar value {} outside {}..={}",
                    value, min, max
                )));
            }
            Ok(value)
        };

        let mut values = BTreeSet::new();
        for part in s.split(',') {
            if let Some(step) = part.strip_prefix("*/") {
                let step = number(step)?.max(1);
                values.extend((min..=max).step_by(step as usize));
            } else if let Some((from, to)) = part.split_once('-') {
                let (from, to) = (number(from)?, number(to)?);
                if from > to {
                    return Err(Error::parse(format!("Inverted calendar range: {}", part)));
                }
                values.extend(from..=to);
            } else {
                values.insert(number(part)?);
            }
        }
        Ok(FieldSet::Only(values))
    }

    fn validate(&self, min: u32, max: u32, name: &str) -> Result<()> {
        if let FieldSet::Only(values) = self {
            if values.is_empty() {
                return Err(Error::parse(format!("Empty calendar field: {}", name)));
            }
            if let Some(bad) = values.iter().find(|v| **v < min || **v > max) {
                return Err(Error::parse(format!(
                    "Calendar {} {} outside {}..={}",
                    name, bad, min, max
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for FieldSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldSet::Any => f.write_str("*"),
            FieldSet::Only(values) => {
                let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                f.write_str(&parts.join(","))
            }
        }
    }
}

/// Field bounds: second, minute, hour, day, month, weekday (0 = Monday)
const FIELD_BOUNDS: [(u32, u32, &str); 6] = [
    (0, 59, "second"),
    (0, 59, "minute"),
    (0, 23, "hour"),
    (1, 31, "day"),
    (1, 12, "month"),
    (0, 6, "weekday"),
];

/// A six-field calendar specification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronSpec {
    /// Second of the minute
    pub second: FieldSet,
    /// Minute of the hour
    pub minute: FieldSet,
    /// Hour of the day
    pub hour: FieldSet,
    /// Day of the month
    pub day: FieldSet,
    /// Month of the year
    pub month: FieldSet,
    /// Day of the week, 0 = Monday
    pub weekday: FieldSet,
}

impl CronSpec {
    /// Build a specification from six fields, validating their bounds
    pub fn new(fields: [FieldSet; 6]) -> Result<Self> {
        for (field, (min, max, name)) in fields.iter().zip(FIELD_BOUNDS.iter()) {
            field.validate(*min, *max, name)?;
        }
        let [second, minute, hour, day, month, weekday] = fields;
        Ok(Self {
            second,
            minute,
            hour,
            day,
            month,
            weekday,
        })
    }

    /// Fire once a day at the given time
    pub fn at(time: NaiveTime) -> Self {
        Self {
            second: FieldSet::one(time.second()),
            minute: FieldSet::one(time.minute()),
            hour: FieldSet::one(time.hour()),
            day: FieldSet::Any,
            month: FieldSet::Any,
            weekday: FieldSet::Any,
        }
    }

    /// Parse six textual fields
    pub fn from_fields<S: AsRef<str>>(fields: &[S]) -> Result<Self> {
        if fields.len() != 6 {
            return Err(Error::parse(format!(
                "Calendar specification needs 6 fields, got {}",
                fields.len()
            )));
        }
        let mut parsed = Vec::with_capacity(6);
        for (raw, (min, max, _)) in fields.iter().zip(FIELD_BOUNDS.iter()) {
            parsed.push(FieldSet::parse(raw.as_ref(), *min, *max)?);
        }
        let fields: [FieldSet; 6] = parsed
            .try_into()
            .map_err(|_| Error::parse("Calendar specification needs 6 fields"))?;
        Self::new(fields)
    }

    /// Whether the specification matches an instant, to the second
    pub fn matches(&self, when: &NaiveDateTime) -> bool {
        self.second.matches(when.second())
            && self.minute.matches(when.minute())
            && self.hour.matches(when.hour())
            && self.day.matches(when.day())
            && self.month.matches(when.month())
            && self.weekday.matches(when.weekday().num_days_from_monday())
    }
}

impl FromStr for CronSpec {
    type Err = Error;

    /// Parse six whitespace-separated fields, or a clock string
    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() == 6 {
            return Self::from_fields(&fields);
        }
        parse_clock_time(s).map(Self::at)
    }
}

impl fmt::Display for CronSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {}",
            self.second, self.minute, self.hour, self.day, self.month, self.weekday
        )
    }
}
