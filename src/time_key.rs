use std::fmt;
use std::str::FromStr;
use chrono::{DateTime, DurationRound, NaiveDateTime, SecondsFormat, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Naive layouts seen from providers, interpreted in a caller supplied timezone
const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Canonical key for hourly time series samples.
///
/// The key is the start of the UTC hour an instant falls into. Two instants within the same
/// UTC hour produce the same key, which is what makes stored samples unique per user and hour.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HourKey(DateTime<Utc>);

impl HourKey {
    /// Returns the key of the UTC hour the given instant falls into
    ///
    /// # Arguments
    ///
    /// * 'instant' - any instant, in any timezone
    pub fn from_instant<T: TimeZone>(instant: &DateTime<T>) -> Result<HourKey, TimeKeyError> {
        let utc = instant.with_timezone(&Utc);
        let hour = utc
            .duration_trunc(TimeDelta::hours(1))
            .map_err(|e| TimeKeyError::MalformedTimestamp(format!("{}: {}", utc.to_rfc3339(), e)))?;

        Ok(HourKey(hour))
    }

    /// Parses a timestamp and returns its hour key
    ///
    /// # Arguments
    ///
    /// * 'timestamp' - timestamp with or without offset
    /// * 'tz' - timezone used when the timestamp carries no offset
    pub fn parse(timestamp: &str, tz: Tz) -> Result<HourKey, TimeKeyError> {
        HourKey::from_instant(&parse_instant(timestamp, tz)?)
    }

    /// The instant the hour starts at
    pub fn instant(&self) -> DateTime<Utc> {
        self.0
    }

    /// Returns the key a number of hours away from this one
    pub fn add_hours(&self, hours: i64) -> Result<HourKey, TimeKeyError> {
        self.0
            .checked_add_signed(TimeDelta::hours(hours))
            .map(HourKey)
            .ok_or_else(|| TimeKeyError::MalformedTimestamp(format!("{} + {}h", self, hours)))
    }
}

impl fmt::Display for HourKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339_opts(SecondsFormat::Secs, true))
    }
}

/// Parses the canonical string form, naive timestamps are taken as UTC
impl FromStr for HourKey {
    type Err = TimeKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HourKey::parse(s, chrono_tz::UTC)
    }
}

impl Serialize for HourKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for HourKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        HourKey::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Parses a timestamp into an absolute instant
///
/// Accepts RFC 3339 (any offset), the market document form without seconds (`2024-01-01T23:00Z`)
/// and naive wall-clock forms, the latter interpreted in `tz`. An ambiguous wall-clock time
/// (repeated hour when DST ends) resolves to the earlier instant.
///
/// # Arguments
///
/// * 'timestamp' - the timestamp to parse
/// * 'tz' - timezone for naive timestamps
pub fn parse_instant(timestamp: &str, tz: Tz) -> Result<DateTime<Utc>, TimeKeyError> {
    let timestamp = timestamp.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(timestamp) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%MZ") {
        return Ok(naive.and_utc());
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(timestamp, format) {
            return tz
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(|| TimeKeyError::MalformedTimestamp(format!("{} does not exist in {}", timestamp, tz)));
        }
    }

    Err(TimeKeyError::MalformedTimestamp(timestamp.to_string()))
}

/// Returns local midnight of a day relative to the day `now` falls into
///
/// # Arguments
///
/// * 'now' - reference instant
/// * 'tz' - the local timezone
/// * 'day_index' - 0 is today, -1 is yesterday, 1 is tomorrow etc.
pub fn local_day_start(now: DateTime<Utc>, tz: Tz, day_index: i64) -> Result<DateTime<Tz>, TimeKeyError> {
    let date = now
        .with_timezone(&tz)
        .date_naive()
        .checked_add_signed(TimeDelta::days(day_index))
        .ok_or_else(|| TimeKeyError::MalformedTimestamp(format!("{} + {} days", now, day_index)))?;

    local_time(date.and_time(chrono::NaiveTime::MIN), tz)
}

/// Resolves a local wall-clock time, choosing the earlier instant when ambiguous
///
/// # Arguments
///
/// * 'naive' - wall-clock time
/// * 'tz' - the local timezone
pub fn local_time(naive: NaiveDateTime, tz: Tz) -> Result<DateTime<Tz>, TimeKeyError> {
    tz.from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| TimeKeyError::MalformedTimestamp(format!("{} does not exist in {}", naive, tz)))
}

#[derive(Debug, Error)]
pub enum TimeKeyError {
    #[error("MalformedTimestamp: {0}")]
    MalformedTimestamp(String),
}
