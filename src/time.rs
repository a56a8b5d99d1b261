//! Validity intervals.
//!
//! Every claim carries the span of real-world time during which it holds.
//! Intervals are half-open, `[from, until)`, and an absent `until` means the
//! claim is still true: the end is treated as +∞ everywhere.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// The end point of an interval, ordered so that `Open` sorts after every
/// concrete instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IntervalEnd {
    /// A concrete (exclusive) end.
    At(DateTime<Utc>),
    /// Still true.
    Open,
}

/// A validity interval (half-open: `[from, until)`).
///
/// # Examples
///
/// ```
/// use kyrograph::Interval;
/// use chrono::{TimeZone, Utc};
///
/// let from = Utc.with_ymd_and_hms(2015, 1, 1, 0, 0, 0).unwrap();
/// let until = Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, 0).unwrap();
/// let span = Interval::new(from, Some(until)).unwrap();
///
/// assert!(span.contains(from));
/// assert!(!span.contains(until));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    /// Start of the interval (inclusive).
    pub from: DateTime<Utc>,

    /// End of the interval (exclusive). None means still true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
}

impl Interval {
    /// Creates an interval.
    ///
    /// `from == until` is accepted: the validity rule is `from <= until`.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidInterval` if `from > until`.
    pub fn new(from: DateTime<Utc>, until: Option<DateTime<Utc>>) -> Result<Self, ValidationError> {
        let span = Self { from, until };
        span.validate()?;
        Ok(span)
    }

    /// Creates a closed interval `[from, until)`.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidInterval` if `from > until`.
    pub fn closed(from: DateTime<Utc>, until: DateTime<Utc>) -> Result<Self, ValidationError> {
        Self::new(from, Some(until))
    }

    /// Creates an open-ended interval starting at the given time.
    #[must_use]
    pub const fn starting_at(from: DateTime<Utc>) -> Self {
        Self { from, until: None }
    }

    /// Creates an open-ended interval starting now.
    #[must_use]
    pub fn from_now() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Re-checks `from <= until`. Deserialized intervals bypass `new`.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidInterval` on an inverted interval.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.until {
            Some(until) if self.from > until => Err(ValidationError::InvalidInterval {
                from: self.from,
                until,
            }),
            _ => Ok(()),
        }
    }

    /// Whether the interval has no end.
    pub const fn is_open_ended(&self) -> bool {
        self.until.is_none()
    }

    /// The end as an ordered bound, open ends sorting last.
    #[must_use]
    pub const fn end(&self) -> IntervalEnd {
        match self.until {
            Some(until) => IntervalEnd::At(until),
            None => IntervalEnd::Open,
        }
    }

    /// Check if a timestamp falls within this interval `[from, until)`.
    #[must_use]
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        time >= self.from && self.until.map_or(true, |until| time < until)
    }

    /// True if the two intervals share at least one instant.
    ///
    /// A zero-length interval `[t, t)` contains no instant but is still
    /// treated as overlapping an interval that contains `t`, so point-in-time
    /// claims participate in conflict checks.
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        if self.is_instant() {
            return other.contains(self.from) || (other.is_instant() && other.from == self.from);
        }
        if other.is_instant() {
            return self.contains(other.from);
        }
        IntervalEnd::At(self.from) < other.end() && IntervalEnd::At(other.from) < self.end()
    }

    /// True for the degenerate `[t, t)` interval.
    #[must_use]
    pub fn is_instant(&self) -> bool {
        self.until == Some(self.from)
    }

    /// Returns the intersection of two intervals, if any.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        if !self.overlaps(other) {
            return None;
        }

        let from = self.from.max(other.from);
        let until = match (self.until, other.until) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };

        Some(Self {
            from,
            until: until.map(|u| u.max(from)),
        })
    }

    /// Length of the interval; `None` when open-ended.
    pub fn duration(&self) -> Option<Duration> {
        self.until.map(|until| until - self.from)
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.until {
            Some(until) => write!(f, "[{} → {})", self.from.to_rfc3339(), until.to_rfc3339()),
            None => write!(f, "[{} → ∞)", self.from.to_rfc3339()),
        }
    }
}
