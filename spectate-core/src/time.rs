//! Vendor time formats: millisecond durations and "Jul 2, 2015 10:47:51 AM" timestamps.

use std::fmt;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Day and hour are not padded, minutes and seconds are.
const LOL_TIME_FORMAT: &str = "%b %-d, %Y %-I:%M:%S %p";

/// Number of milliseconds between two points in time, as sent on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DurationMs(pub i64);

impl DurationMs {
    pub const fn from_millis(ms: i64) -> Self {
        DurationMs(ms)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Negative durations clamp to zero.
    pub fn to_duration(self) -> Duration {
        Duration::from_millis(self.0.max(0) as u64)
    }

    pub fn from_duration(d: Duration) -> Self {
        DurationMs(i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
    }

    /// Integer division; a divisor below 1 is treated as 1.
    pub fn divided_by(self, divisor: i64) -> Self {
        DurationMs(self.0 / divisor.max(1))
    }
}

/// Error parsing a vendor timestamp.
#[derive(Debug, thiserror::Error)]
#[error("invalid timestamp {text:?}: {source}")]
pub struct TimeParseError {
    text: String,
    #[source]
    source: chrono::ParseError,
}

/// Timestamp that (de)serializes itself in the vendor text format.
///
/// The default value is the "zero" time (`Jan 1, 0001 12:00:00 AM`), which the remote
/// server and the stored files use for "unknown".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LolTime(NaiveDateTime);

impl LolTime {
    pub fn new(at: NaiveDateTime) -> Self {
        LolTime(at)
    }

    pub fn zero() -> Self {
        let date = NaiveDate::from_ymd_opt(1, 1, 1).unwrap_or(NaiveDate::MIN);
        LolTime(date.and_time(NaiveTime::default()))
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::zero()
    }

    pub fn parse(text: &str) -> Result<Self, TimeParseError> {
        NaiveDateTime::parse_from_str(text, LOL_TIME_FORMAT)
            .map(LolTime)
            .map_err(|source| TimeParseError {
                text: text.to_string(),
                source,
            })
    }

    pub fn datetime(&self) -> NaiveDateTime {
        self.0
    }

    /// Adds a duration, saturating at the original value on overflow.
    pub fn add(&self, d: DurationMs) -> Self {
        chrono::Duration::try_milliseconds(d.0)
            .and_then(|delta| self.0.checked_add_signed(delta))
            .map(LolTime)
            .unwrap_or(*self)
    }
}

impl Default for LolTime {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Display for LolTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(LOL_TIME_FORMAT))
    }
}

impl Serialize for LolTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LolTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        LolTime::parse(&text).map_err(serde::de::Error::custom)
    }
}
