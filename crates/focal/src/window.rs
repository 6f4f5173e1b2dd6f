//! Time windows and the anchors used to resolve them.
//!
//! All windows are half-open: `[start, end)`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// A half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Inclusive lower bound.
    pub start: DateTime<Utc>,
    /// Exclusive upper bound.
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Create a window, rejecting `start >= end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, ConfigError> {
        if start >= end {
            return Err(ConfigError::Invalid(format!(
                "window start {} must be before end {}",
                start.to_rfc3339(),
                end.to_rfc3339()
            )));
        }
        Ok(Self { start, end })
    }

    /// Whether the window covers no time at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Whether two windows share any instant.
    #[must_use]
    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Remove every window in `covered` from this one.
    ///
    /// Returns the uncovered gaps, oldest first. Gaps that touch are not
    /// merged with each other because they cannot touch: each is bounded by a
    /// covered window or by this window's edge.
    #[must_use]
    pub fn subtract(&self, covered: &[TimeWindow]) -> Vec<TimeWindow> {
        let mut sorted: Vec<&TimeWindow> = covered.iter().filter(|w| w.overlaps(self)).collect();
        sorted.sort_by_key(|w| w.start);

        let mut gaps = Vec::new();
        let mut cursor = self.start;
        for window in sorted {
            if window.start > cursor {
                gaps.push(TimeWindow {
                    start: cursor,
                    end: window.start.min(self.end),
                });
            }
            if window.end > cursor {
                cursor = window.end;
            }
            if cursor >= self.end {
                break;
            }
        }
        if cursor < self.end {
            gaps.push(TimeWindow {
                start: cursor,
                end: self.end,
            });
        }
        gaps
    }

    /// Split into consecutive chunks of at most `max`, oldest first.
    #[must_use]
    pub fn chunks(&self, max: Option<Duration>) -> Vec<TimeWindow> {
        let Some(max) = max.filter(|m| *m > Duration::zero()) else {
            return vec![*self];
        };
        let mut out = Vec::new();
        let mut start = self.start;
        while start < self.end {
            let end = (start + max).min(self.end);
            out.push(TimeWindow { start, end });
            start = end;
        }
        out
    }

    /// Split into chunks of at most `max`, newest first.
    #[must_use]
    pub fn chunks_newest_first(&self, max: Option<Duration>) -> Vec<TimeWindow> {
        let mut out = self.chunks(max);
        out.reverse();
        out
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}..{}",
            self.start.format(RFC3339_SECONDS),
            self.end.format(RFC3339_SECONDS)
        )
    }
}

/// Timestamp format accepted by the search endpoints.
pub const RFC3339_SECONDS: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Format a timestamp the way the API expects it.
#[must_use]
pub fn api_timestamp(at: DateTime<Utc>) -> String {
    at.format(RFC3339_SECONDS).to_string()
}

/// Parse an RFC-3339 timestamp into UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ConfigError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ConfigError::Invalid(format!("invalid timestamp '{raw}': {e}")))
}

/// Midnight (UTC) of the day containing `at`.
#[must_use]
pub fn start_of_day(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Earliest and latest creation time of tweets already collected for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSpan {
    pub first: DateTime<Utc>,
    pub last: DateTime<Utc>,
}

/// A symbolic or literal point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TimeAnchor {
    /// Earliest tweet already collected for the event.
    FirstTime,
    /// Latest tweet already collected for the event.
    LastTime,
    /// Collection time.
    Now,
    /// A literal timestamp.
    At(DateTime<Utc>),
}

impl TimeAnchor {
    /// Resolve to a concrete timestamp.
    pub fn resolve(
        self,
        span: Option<EventSpan>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ConfigError> {
        match self {
            Self::At(at) => Ok(at),
            Self::Now => Ok(now),
            Self::FirstTime => span
                .map(|s| s.first)
                .ok_or_else(|| ConfigError::Invalid("first_time requires previously collected tweets".into())),
            Self::LastTime => span
                .map(|s| s.last)
                .ok_or_else(|| ConfigError::Invalid("last_time requires previously collected tweets".into())),
        }
    }
}

impl FromStr for TimeAnchor {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "first_time" => Ok(Self::FirstTime),
            "last_time" => Ok(Self::LastTime),
            "now" => Ok(Self::Now),
            other => parse_timestamp(other).map(Self::At),
        }
    }
}

impl TryFrom<String> for TimeAnchor {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for TimeAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirstTime => f.write_str("first_time"),
            Self::LastTime => f.write_str("last_time"),
            Self::Now => f.write_str("now"),
            Self::At(at) => write!(f, "{}", at.format(RFC3339_SECONDS)),
        }
    }
}

impl From<TimeAnchor> for String {
    fn from(anchor: TimeAnchor) -> Self {
        anchor.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 8, day, hour, 0, 0).unwrap()
    }

    fn window(a: DateTime<Utc>, b: DateTime<Utc>) -> TimeWindow {
        TimeWindow::new(a, b).unwrap()
    }

    #[test]
    fn test_new_rejects_inverted_window() {
        assert!(TimeWindow::new(at(2, 0), at(1, 0)).is_err());
        assert!(TimeWindow::new(at(1, 0), at(1, 0)).is_err());
    }

    #[test]
    fn test_subtract_middle_hole() {
        let requested = window(at(1, 0), at(4, 0));
        let gaps = requested.subtract(&[window(at(2, 0), at(3, 0))]);
        assert_eq!(gaps, vec![window(at(1, 0), at(2, 0)), window(at(3, 0), at(4, 0))]);
    }

    #[test]
    fn test_subtract_fully_covered() {
        let requested = window(at(1, 0), at(2, 0));
        let gaps = requested.subtract(&[window(at(1, 0), at(1, 12)), window(at(1, 12), at(3, 0))]);
        assert!(gaps.is_empty());
    }

    #[test]
    fn test_subtract_ignores_outside_windows() {
        let requested = window(at(2, 0), at(3, 0));
        let gaps = requested.subtract(&[window(at(5, 0), at(6, 0))]);
        assert_eq!(gaps, vec![requested]);
    }

    #[test]
    fn test_chunks_cover_window_exactly() {
        let requested = window(at(1, 0), at(3, 12));
        let chunks = requested.chunks(Some(Duration::days(1)));
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].start, requested.start);
        assert_eq!(chunks[2].end, requested.end);
        assert!(chunks.windows(2).all(|pair| pair[0].end == pair[1].start));

        let newest = requested.chunks_newest_first(Some(Duration::days(1)));
        assert_eq!(newest[0], chunks[2]);
    }

    #[test]
    fn test_anchor_parsing_and_resolution() {
        let span = EventSpan {
            first: at(1, 5),
            last: at(3, 7),
        };
        let now = at(10, 0);

        let first: TimeAnchor = "first_time".parse().unwrap();
        assert_eq!(first.resolve(Some(span), now).unwrap(), at(1, 5));
        let last: TimeAnchor = "last_time".parse().unwrap();
        assert_eq!(last.resolve(Some(span), now).unwrap(), at(3, 7));
        let literal: TimeAnchor = "2021-08-02T00:00:00Z".parse().unwrap();
        assert_eq!(literal.resolve(None, now).unwrap(), at(2, 0));
        assert!(TimeAnchor::FirstTime.resolve(None, now).is_err());
        assert!("yesterday".parse::<TimeAnchor>().is_err());
    }

    #[test]
    fn test_start_of_day() {
        assert_eq!(start_of_day(at(3, 17)), at(3, 0));
    }
}
