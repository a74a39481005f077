//! Time, duration and bounds types.
//!
//! All instants are 64-bit nanosecond counts since the Unix epoch. Query
//! inputs may be relative to the query's `now`; [`TimeSpec`] captures that
//! distinction and is resolved to an absolute [`Time`] at the
//! planning/execution boundary.

use serde::{Deserialize, Serialize};

/// A monotonic instant: nanoseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Time(pub i64);

impl Time {
    /// The minimum representable instant.
    pub const MIN: Time = Time(i64::MIN);
    /// The maximum representable instant.
    pub const MAX: Time = Time(i64::MAX);

    /// Nanoseconds since the epoch.
    pub const fn nanos(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Add<Duration> for Time {
    type Output = Time;

    fn add(self, rhs: Duration) -> Time {
        Time(self.0.saturating_add(rhs.0))
    }
}

impl std::ops::Sub<Duration> for Time {
    type Output = Time;

    fn sub(self, rhs: Duration) -> Time {
        Time(self.0.saturating_sub(rhs.0))
    }
}

impl std::ops::Sub for Time {
    type Output = Duration;

    fn sub(self, rhs: Time) -> Duration {
        Duration(self.0.saturating_sub(rhs.0))
    }
}

/// A signed span of time in nanoseconds.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Duration(pub i64);

impl Duration {
    /// Zero duration.
    pub const ZERO: Duration = Duration(0);

    /// A duration of `n` nanoseconds.
    pub const fn nanoseconds(n: i64) -> Duration {
        Duration(n)
    }

    /// A duration of `n` seconds.
    pub const fn seconds(n: i64) -> Duration {
        Duration(n * 1_000_000_000)
    }

    /// A duration of `n` minutes.
    pub const fn minutes(n: i64) -> Duration {
        Duration(n * 60 * 1_000_000_000)
    }

    /// A duration of `n` hours.
    pub const fn hours(n: i64) -> Duration {
        Duration(n * 3600 * 1_000_000_000)
    }

    /// Nanosecond count.
    pub const fn nanos(self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Duration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

/// A half-open time range `[start, stop)`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Bounds {
    /// Inclusive start.
    pub start: Time,
    /// Exclusive stop.
    pub stop: Time,
}

impl Bounds {
    /// Create bounds from start and stop.
    pub const fn new(start: Time, stop: Time) -> Self {
        Self { start, stop }
    }

    /// The widest representable bounds.
    pub const fn all() -> Self {
        Self {
            start: Time::MIN,
            stop: Time::MAX,
        }
    }

    /// Whether `t` falls inside the half-open range.
    pub fn contains(&self, t: Time) -> bool {
        t >= self.start && t < self.stop
    }

    /// Whether the range holds no instants.
    pub fn is_empty(&self) -> bool {
        self.start >= self.stop
    }

    /// The duration covered by the bounds.
    pub fn duration(&self) -> Duration {
        self.stop - self.start
    }
}

impl std::fmt::Display for Bounds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.stop)
    }
}

/// A time that may be absolute or relative to the query's `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimeSpec {
    /// A fixed instant.
    Absolute(Time),
    /// An offset applied to `now` at resolution time. Zero means `now`.
    Relative(Duration),
}

impl TimeSpec {
    /// The minimum representable instant.
    pub const MIN: TimeSpec = TimeSpec::Absolute(Time::MIN);

    /// The query's `now`.
    pub const fn now() -> TimeSpec {
        TimeSpec::Relative(Duration::ZERO)
    }

    /// Resolve against a concrete `now`.
    pub fn resolve(self, now: Time) -> Time {
        match self {
            TimeSpec::Absolute(t) => t,
            TimeSpec::Relative(d) => now + d,
        }
    }

    /// Whether this spec depends on `now`.
    pub const fn is_relative(self) -> bool {
        matches!(self, TimeSpec::Relative(_))
    }
}

impl Default for TimeSpec {
    fn default() -> Self {
        TimeSpec::now()
    }
}

/// Unresolved bounds: a pair of [`TimeSpec`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundsSpec {
    /// Inclusive start.
    pub start: TimeSpec,
    /// Exclusive stop.
    pub stop: TimeSpec,
}

impl BoundsSpec {
    /// Create a bounds spec.
    pub const fn new(start: TimeSpec, stop: TimeSpec) -> Self {
        Self { start, stop }
    }

    /// The query-wide default window: everything up to `now`.
    pub const fn default_window() -> Self {
        Self {
            start: TimeSpec::MIN,
            stop: TimeSpec::now(),
        }
    }

    /// Resolve both endpoints against a concrete `now`.
    pub fn resolve(self, now: Time) -> Bounds {
        Bounds {
            start: self.start.resolve(now),
            stop: self.stop.resolve(now),
        }
    }
}

impl Default for BoundsSpec {
    fn default() -> Self {
        Self::default_window()
    }
}
