//! Capture timestamps and the clock they are read from

use std::fmt;
use std::ops::Sub;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A point in time, either absolute (since the Unix epoch) or relative to an
/// acquisition start. The unset state is a valid value meaning "never
/// captured".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(Option<Duration>);

impl Timestamp {
    pub const UNSET: Timestamp = Timestamp(None);

    pub fn now() -> Self {
        SystemClock.now()
    }

    pub fn from_duration(elapsed: Duration) -> Self {
        Self(Some(elapsed))
    }

    /// Negative or non-finite values give an unset timestamp.
    pub fn from_secs_f64(secs: f64) -> Self {
        Self(Duration::try_from_secs_f64(secs).ok())
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    pub fn as_duration(&self) -> Option<Duration> {
        self.0
    }

    pub fn as_secs_f64(&self) -> Option<f64> {
        self.0.map(|d| d.as_secs_f64())
    }
}

/// `stored - start`: unset minus anything stays unset, an unset baseline
/// counts as zero, and a baseline later than the value saturates to zero.
impl Sub for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Timestamp) -> Timestamp {
        match (self.0, rhs.0) {
            (None, _) => Timestamp::UNSET,
            (Some(lhs), None) => Timestamp(Some(lhs)),
            (Some(lhs), Some(rhs)) => Timestamp(Some(lhs.saturating_sub(rhs))),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(d) => write!(f, "{:.6}s", d.as_secs_f64()),
            None => f.write_str("unset"),
        }
    }
}

/// Source of "now" for capture timestamps
pub trait Clock {
    fn now(&self) -> Timestamp;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(Some(since_epoch))
    }
}
