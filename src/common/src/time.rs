//! Time bounds for the retention window.
//!
//! A bound is written as one of:
//! - `0` (or an empty string): unbounded on that side
//! - an RFC3339 timestamp: `2024-01-01T00:00:00Z`
//! - a duration relative to the start of a run, optionally signed: `-30d`, `36h`
//! - an integer, bare or quoted: unix timestamp in milliseconds (`0` still
//!   means unbounded)
//!
//! Bounds are resolved into millisecond timestamps before any block is
//! evaluated, so the retention check itself never sees the unbounded sentinel.

use chrono::{DateTime, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// One side of a retention window as configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeBound {
    /// No limit on this side.
    #[default]
    Unbounded,
    /// A fixed point in time.
    Absolute(DateTime<Utc>),
    /// An offset from the start of the run.
    Relative { negative: bool, offset: Duration },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TimeBoundError {
    #[error("invalid time bound '{input}': expected 0, unix milliseconds, an RFC3339 time or a duration like -30d")]
    Invalid { input: String },

    #[error("time bound '{input}' is out of range")]
    OutOfRange { input: String },
}

impl TimeBound {
    /// Resolve as the lower edge of a window. Unbounded becomes `i64::MIN`.
    pub fn resolve_min(&self, now: DateTime<Utc>) -> Result<i64, TimeBoundError> {
        Ok(self.resolve(now)?.unwrap_or(i64::MIN))
    }

    /// Resolve as the upper edge of a window. Unbounded becomes `i64::MAX`.
    pub fn resolve_max(&self, now: DateTime<Utc>) -> Result<i64, TimeBoundError> {
        Ok(self.resolve(now)?.unwrap_or(i64::MAX))
    }

    pub fn is_unbounded(&self) -> bool {
        matches!(self, TimeBound::Unbounded)
    }

    fn resolve(&self, now: DateTime<Utc>) -> Result<Option<i64>, TimeBoundError> {
        match self {
            TimeBound::Unbounded => Ok(None),
            TimeBound::Absolute(at) => Ok(Some(at.timestamp_millis())),
            TimeBound::Relative { negative, offset } => {
                let out_of_range = || TimeBoundError::OutOfRange {
                    input: self.to_string(),
                };
                let offset = chrono::Duration::from_std(*offset).map_err(|_| out_of_range())?;
                let at = if *negative {
                    now.checked_sub_signed(offset)
                } else {
                    now.checked_add_signed(offset)
                };
                at.map(|t| Some(t.timestamp_millis())).ok_or_else(out_of_range)
            }
        }
    }
}

impl FromStr for TimeBound {
    type Err = TimeBoundError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        if input.is_empty() || input == "0" {
            return Ok(TimeBound::Unbounded);
        }

        let digits = input.strip_prefix('-').unwrap_or(input);
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            let out_of_range = || TimeBoundError::OutOfRange {
                input: input.to_string(),
            };
            let millis: i64 = input.parse().map_err(|_| out_of_range())?;
            return DateTime::from_timestamp_millis(millis)
                .map(TimeBound::Absolute)
                .ok_or_else(out_of_range);
        }

        if let Ok(at) = DateTime::parse_from_rfc3339(input) {
            return Ok(TimeBound::Absolute(at.with_timezone(&Utc)));
        }

        let (negative, rest) = match input.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, input.strip_prefix('+').unwrap_or(input)),
        };

        humantime::parse_duration(rest.trim())
            .map(|offset| TimeBound::Relative { negative, offset })
            .map_err(|_| TimeBoundError::Invalid {
                input: input.to_string(),
            })
    }
}

impl fmt::Display for TimeBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeBound::Unbounded => write!(f, "0"),
            TimeBound::Absolute(at) => write!(f, "{}", at.to_rfc3339()),
            TimeBound::Relative { negative, offset } => {
                let sign = if *negative { "-" } else { "" };
                write!(f, "{sign}{}", humantime::format_duration(*offset))
            }
        }
    }
}

impl Serialize for TimeBound {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

struct TimeBoundVisitor;

impl Visitor<'_> for TimeBoundVisitor {
    type Value = TimeBound;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("0, an RFC3339 timestamp, a signed duration or unix milliseconds")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        v.parse().map_err(E::custom)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        if v == 0 {
            return Ok(TimeBound::Unbounded);
        }
        DateTime::from_timestamp_millis(v)
            .map(TimeBound::Absolute)
            .ok_or_else(|| E::custom(format!("timestamp {v} is out of range")))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        let v = i64::try_from(v).map_err(|_| E::custom(format!("timestamp {v} is out of range")))?;
        self.visit_i64(v)
    }
}

impl<'de> Deserialize<'de> for TimeBound {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(TimeBoundVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_zero_is_unbounded() {
        assert_eq!("0".parse::<TimeBound>().unwrap(), TimeBound::Unbounded);
        assert_eq!("".parse::<TimeBound>().unwrap(), TimeBound::Unbounded);
        assert_eq!("  0 ".parse::<TimeBound>().unwrap(), TimeBound::Unbounded);
    }

    #[test]
    fn test_unbounded_resolves_to_extremes() {
        let bound = TimeBound::Unbounded;
        assert_eq!(bound.resolve_min(now()).unwrap(), i64::MIN);
        assert_eq!(bound.resolve_max(now()).unwrap(), i64::MAX);
    }

    #[test]
    fn test_rfc3339_is_absolute() {
        let bound: TimeBound = "2024-01-01T00:00:00Z".parse().unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(bound, TimeBound::Absolute(expected));
        assert_eq!(bound.resolve_min(now()).unwrap(), expected.timestamp_millis());
        assert_eq!(bound.resolve_max(now()).unwrap(), expected.timestamp_millis());
    }

    #[test]
    fn test_negative_duration_is_in_the_past() {
        let bound: TimeBound = "-2h".parse().unwrap();
        assert_eq!(
            bound.resolve_min(now()).unwrap(),
            (now() - chrono::Duration::hours(2)).timestamp_millis()
        );
    }

    #[test]
    fn test_positive_duration_is_in_the_future() {
        let bound: TimeBound = "+1d".parse().unwrap();
        assert_eq!(
            bound.resolve_max(now()).unwrap(),
            (now() + chrono::Duration::days(1)).timestamp_millis()
        );

        let unsigned: TimeBound = "1d".parse().unwrap();
        assert_eq!(unsigned, bound);
    }

    #[test]
    fn test_integer_string_is_unix_millis() {
        let bound: TimeBound = "1717243200000".parse().unwrap();
        assert_eq!(bound, TimeBound::Absolute(now()));
        assert_eq!(bound.resolve_min(now()).unwrap(), 1_717_243_200_000);

        let before_epoch: TimeBound = "-1000".parse().unwrap();
        assert_eq!(
            before_epoch,
            TimeBound::Absolute(DateTime::from_timestamp_millis(-1000).unwrap())
        );

        let err = "99999999999999999999".parse::<TimeBound>().unwrap_err();
        assert!(matches!(err, TimeBoundError::OutOfRange { .. }));
    }

    #[test]
    fn test_invalid_bound() {
        let err = "yesterday".parse::<TimeBound>().unwrap_err();
        assert_eq!(
            err,
            TimeBoundError::Invalid {
                input: "yesterday".to_string()
            }
        );
    }

    #[test]
    fn test_display_round_trips() {
        for input in ["0", "-30days", "2024-01-01T00:00:00+00:00", "12h"] {
            let bound: TimeBound = input.parse().unwrap();
            let reparsed: TimeBound = bound.to_string().parse().unwrap();
            assert_eq!(bound, reparsed, "round trip of {input}");
        }
    }

    #[test]
    fn test_deserialize_integers() {
        #[derive(Deserialize)]
        struct Wrapper {
            bound: TimeBound,
        }

        let unbounded: Wrapper = serde_json::from_str(r#"{"bound": 0}"#).unwrap();
        assert_eq!(unbounded.bound, TimeBound::Unbounded);

        let absolute: Wrapper = serde_json::from_str(r#"{"bound": 1717243200000}"#).unwrap();
        assert_eq!(absolute.bound, TimeBound::Absolute(now()));

        let quoted: Wrapper = serde_json::from_str(r#"{"bound": "1717243200000"}"#).unwrap();
        assert_eq!(quoted.bound, TimeBound::Absolute(now()));

        let relative: Wrapper = serde_json::from_str(r#"{"bound": "-1h"}"#).unwrap();
        assert!(matches!(
            relative.bound,
            TimeBound::Relative { negative: true, .. }
        ));
    }
}
