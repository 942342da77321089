//! Monotonic timestamps.
//!
//! Every clock in cordon reports a [`Time`]: nanoseconds elapsed since the
//! clock's own epoch. The delay scheduler keys its deadlines on whole
//! milliseconds, so the millisecond views here are the ones that matter for
//! coalescing.

use core::fmt;
use std::ops::Add;
use std::time::Duration;

/// A monotonic instant measured from a clock's epoch.
///
/// With [`WallClock`](crate::time::WallClock) the epoch is the moment the
/// clock was created; with [`VirtualClock`](crate::time::VirtualClock) it is
/// whatever the test says it is.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(u64);

impl Time {
    /// The epoch.
    pub const ZERO: Self = Self(0);

    /// The maximum representable instant.
    pub const MAX: Self = Self(u64::MAX);

    /// Creates a time from nanoseconds since epoch.
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Creates a time from milliseconds since epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    /// Creates a time from seconds since epoch.
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1_000_000_000))
    }

    /// Returns nanoseconds since epoch.
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Returns whole milliseconds since epoch (truncated).
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Adds milliseconds, saturating on overflow.
    #[must_use]
    pub const fn saturating_add_millis(self, millis: u64) -> Self {
        Self(self.0.saturating_add(millis.saturating_mul(1_000_000)))
    }

    /// Returns the elapsed time since `earlier`, or zero if `earlier` is later.
    #[must_use]
    pub const fn saturating_since(self, earlier: Self) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0.saturating_add(rhs.as_nanos() as u64))
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Time({}ns)", self.0)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1_000_000_000 {
            write!(
                f,
                "{}.{:03}s",
                self.0 / 1_000_000_000,
                (self.0 / 1_000_000) % 1000
            )
        } else {
            write!(f, "{}ms", self.0 / 1_000_000)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_round_trip_truncates() {
        assert_eq!(Time::from_millis(1500).as_millis(), 1500);
        assert_eq!(Time::from_nanos(1_999_999).as_millis(), 1);
        assert_eq!(Time::from_secs(2).as_millis(), 2000);
    }

    #[test]
    fn add_millis_saturates() {
        let near_max = Time::from_nanos(u64::MAX - 10);
        assert_eq!(near_max.saturating_add_millis(1), Time::MAX);
        assert_eq!(Time::ZERO + Duration::from_millis(3), Time::from_millis(3));
    }

    #[test]
    fn saturating_since_never_negative() {
        let early = Time::from_millis(10);
        let late = Time::from_millis(25);
        assert_eq!(late.saturating_since(early), Duration::from_millis(15));
        assert_eq!(early.saturating_since(late), Duration::ZERO);
    }

    #[test]
    fn display_picks_unit() {
        assert_eq!(Time::from_millis(250).to_string(), "250ms");
        assert_eq!(Time::from_millis(1250).to_string(), "1.250s");
    }
}
