use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::Sub,
    time::Duration,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A point in wall-clock time, usable on both wasm and native targets.
/// Holds the duration since the Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Instant(Duration);

impl Instant {
    /// The current wall-clock time
    #[must_use = "Getting the time has no effect"]
    pub fn now() -> Self {
        #[cfg(target_arch = "wasm32")]
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        fn since_epoch() -> Duration {
            Duration::from_millis(js_sys::Date::now() as u64)
        }

        #[cfg(not(target_arch = "wasm32"))]
        fn since_epoch() -> Duration {
            std::time::SystemTime::now()
                .duration_since(std::time::SystemTime::UNIX_EPOCH)
                .expect("system clock should not be before 1970")
        }

        Self(since_epoch())
    }

    /// Constructs an [`Instant`] from integer milliseconds since the Unix epoch
    #[must_use = "Creating an instant has no effect"]
    #[inline]
    pub const fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    /// Milliseconds since the Unix epoch
    #[must_use = "Getting the milliseconds has no effect"]
    #[inline]
    pub const fn as_millis(self) -> u128 {
        self.0.as_millis()
    }

    /// Time elapsed between `self` and now; zero if `self` is in the future
    #[must_use = "Getting the elapsed time has no effect"]
    pub fn elapsed(self) -> Duration {
        Self::now().0.saturating_sub(self.0)
    }
}

impl Sub for Instant {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0.saturating_sub(rhs.0)
    }
}

impl Display for Instant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_millis())
    }
}

impl Debug for Instant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Instant").field(&self.0.as_millis()).finish()
    }
}

impl Serialize for Instant {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        u64::try_from(self.0.as_millis())
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Instant {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u64::deserialize(deserializer).map(Self::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_round_trip() {
        let instant = Instant::from_millis(1_234_567);
        assert_eq!(instant.as_millis(), 1_234_567);
        let json = serde_json::to_string(&instant).expect("should serialize");
        assert_eq!(json, "1234567");
        let back: Instant = serde_json::from_str(&json).expect("should deserialize");
        assert_eq!(back, instant);
    }

    #[test]
    fn saturating_difference() {
        let earlier = Instant::from_millis(1_000);
        let later = Instant::from_millis(3_500);
        assert_eq!(later - earlier, Duration::from_millis(2_500));
        assert_eq!(earlier - later, Duration::ZERO);
    }
}
