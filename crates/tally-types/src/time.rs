//! Timestamps, validity windows and clocks.

use crate::{Result, TypesError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp from unix milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns unix milliseconds.
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Reads the system wall clock.
    pub fn now() -> Self {
        Self(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    /// Returns this timestamp shifted forward.
    pub fn plus(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_millis() as u64))
    }

    /// Returns this timestamp shifted backward.
    pub fn minus(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration.as_millis() as u64))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A validity window attached to a transaction.
///
/// `from` is inclusive and `until` is exclusive; either bound may be open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Earliest valid instant, inclusive.
    pub from: Option<Timestamp>,
    /// First invalid instant, exclusive.
    pub until: Option<Timestamp>,
}

impl TimeWindow {
    /// A window bounded on both sides.
    pub fn between(from: Timestamp, until: Timestamp) -> Result<Self> {
        if from >= until {
            return Err(TypesError::InvalidTimeWindow(format!(
                "from {} is not before until {}",
                from, until
            )));
        }
        Ok(Self {
            from: Some(from),
            until: Some(until),
        })
    }

    /// A window open towards the future.
    pub const fn from_only(from: Timestamp) -> Self {
        Self {
            from: Some(from),
            until: None,
        }
    }

    /// A window open towards the past.
    pub const fn until_only(until: Timestamp) -> Self {
        Self {
            from: None,
            until: Some(until),
        }
    }

    /// A window centred on `midpoint` with the given tolerance either side.
    pub fn with_tolerance(midpoint: Timestamp, tolerance: Duration) -> Self {
        Self {
            from: Some(midpoint.minus(tolerance)),
            until: Some(midpoint.plus(tolerance)),
        }
    }

    /// Returns true if `instant` lies inside the window.
    pub fn contains(&self, instant: Timestamp) -> bool {
        let after_start = self.from.map_or(true, |from| instant >= from);
        let before_end = self.until.map_or(true, |until| instant < until);
        after_start && before_end
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.from, self.until) {
            (Some(from), Some(until)) => write!(f, "[{}, {})", from, until),
            (Some(from), None) => write!(f, "[{}, ∞)", from),
            (None, Some(until)) => write!(f, "(-∞, {})", until),
            (None, None) => write!(f, "(-∞, ∞)"),
        }
    }
}

/// Source of wall-clock time for time-window validation.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> Timestamp;
}

/// The operating system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// A clock that only moves when told to. Used by simulations and tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: AtomicU64::new(start.as_millis()),
        }
    }

    /// Moves the clock to `instant`.
    pub fn set(&self, instant: Timestamp) {
        self.millis.store(instant.as_millis(), Ordering::SeqCst);
    }

    /// Advances the clock.
    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.millis.load(Ordering::SeqCst))
    }
}
