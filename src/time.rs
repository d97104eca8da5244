/*! Time structures.

The stack has no clock of its own. The host reports elapsed time through
[`Stack::tick`](crate::iface::Stack::tick) and every timeout is expressed as a
[Duration] with millisecond resolution.
*/

use core::{fmt, ops};

/// A relative amount of time, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration {
    millis: u64,
}

impl Duration {
    pub const ZERO: Duration = Duration::from_millis(0);
    pub const MAX: Duration = Duration::from_millis(u64::MAX);

    /// Create a new `Duration` from a number of milliseconds.
    pub const fn from_millis(millis: u64) -> Duration {
        Duration { millis }
    }

    /// Create a new `Duration` from a number of seconds.
    pub const fn from_secs(secs: u64) -> Duration {
        Duration {
            millis: secs.saturating_mul(1000),
        }
    }

    /// The total number of milliseconds in this `Duration`.
    pub const fn total_millis(&self) -> u64 {
        self.millis
    }

    pub const fn is_zero(&self) -> bool {
        self.millis == 0
    }

    pub const fn saturating_sub(self, rhs: Duration) -> Duration {
        Duration::from_millis(self.millis.saturating_sub(rhs.millis))
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:03}s", self.millis / 1000, self.millis % 1000)
    }
}

impl ops::Add<Duration> for Duration {
    type Output = Duration;

    fn add(self, rhs: Duration) -> Duration {
        Duration::from_millis(self.millis.saturating_add(rhs.millis))
    }
}

impl ops::Sub<Duration> for Duration {
    type Output = Duration;

    fn sub(self, rhs: Duration) -> Duration {
        Duration::from_millis(
            self.millis
                .checked_sub(rhs.millis)
                .expect("overflow when subtracting durations"),
        )
    }
}

impl ops::Mul<u32> for Duration {
    type Output = Duration;

    fn mul(self, rhs: u32) -> Duration {
        Duration::from_millis(self.millis.saturating_mul(rhs as u64))
    }
}

impl ops::Shl<u32> for Duration {
    type Output = Duration;

    fn shl(self, rhs: u32) -> Duration {
        Duration::from_millis(self.millis.checked_shl(rhs).unwrap_or(u64::MAX))
    }
}

impl From<::core::time::Duration> for Duration {
    fn from(other: ::core::time::Duration) -> Duration {
        Duration::from_millis(other.as_millis().min(u64::MAX as u128) as u64)
    }
}

impl From<Duration> for ::core::time::Duration {
    fn from(val: Duration) -> Self {
        ::core::time::Duration::from_millis(val.total_millis())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_duration_ops() {
        assert_eq!(
            Duration::from_millis(40) + Duration::from_millis(2),
            Duration::from_millis(42)
        );
        assert_eq!(Duration::from_millis(555) * 4, Duration::from_millis(2220));
        assert_eq!(Duration::from_secs(1) << 3, Duration::from_secs(8));
        assert_eq!(
            Duration::from_millis(3).saturating_sub(Duration::from_millis(5)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_shift_saturates() {
        assert_eq!(Duration::from_secs(1) << 64, Duration::MAX);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Duration::from_millis(1250)), "1.250s");
    }

    #[test]
    #[should_panic(expected = "overflow when subtracting durations")]
    fn test_sub_from_zero_overflow() {
        let _ = Duration::ZERO - Duration::from_millis(1);
    }
}
