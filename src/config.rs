use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::const_default::ConstDefault;

/// Retry policy & delay configuration
pub mod retry;

/// A configuration option that can be left to inherit from a lower priority
/// configuration layer, or set explicitly
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum SetOption<T> {
    /// Will inherit the option from lower priority configuration
    Inherit,
    /// Will use this option
    Set(T),
}

impl<T: Default> Default for SetOption<T> {
    fn default() -> Self {
        Self::set(T::default())
    }
}

impl<T: ConstDefault> ConstDefault for SetOption<T> {
    const DEFAULT: Self = Self::const_default();
}

impl<T: ConstDefault> SetOption<T> {
    /// Gets the default for `T` as a const [`SetOption::Set`]
    #[must_use = "Gets the default, has no effect if unused"]
    pub const fn const_default() -> Self {
        Self::set(T::DEFAULT)
    }
}

impl<T> SetOption<T> {
    /// Creates a new option that will inherit
    #[inline]
    #[must_use = "No need to create if you don't use it"]
    pub const fn inherit() -> Self {
        Self::Inherit
    }

    /// Creates a new option that will use `value`
    #[inline]
    #[must_use = "No need to create if you don't use it"]
    pub const fn set(value: T) -> Self {
        Self::Set(value)
    }

    /// Converts into the set value, if any
    #[inline]
    #[must_use = "Has no effect other than to read the option"]
    pub fn into_set(self) -> Option<T> {
        match self {
            Self::Inherit => None,
            Self::Set(value) => Some(value),
        }
    }

    /// Keeps `self` when set, otherwise falls back to `lower`
    #[inline]
    #[must_use = "Has no effect other than to produce the merged option"]
    pub fn or(self, lower: Self) -> Self {
        match self {
            Self::Inherit => lower,
            set @ Self::Set(_) => set,
        }
    }

    /// The set value, or the type default
    #[inline]
    #[must_use = "Has no effect other than to read the option"]
    pub fn unwrap_or_default(self) -> T
    where
        T: Default,
    {
        self.into_set().unwrap_or_default()
    }
}

/// How long an entry with no observers remains cached before it is removed
///
/// Defaults to five minutes in the browser and [`GcTime::Infinite`] on
/// native targets, where there is no tab lifetime to bound memory by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GcTime {
    /// Permanently remains in cache
    Infinite,
    /// Remains in cache for `Duration` after its last observer detaches
    Duration(Duration),
}

impl Default for GcTime {
    fn default() -> Self {
        Self::const_default()
    }
}

impl ConstDefault for GcTime {
    const DEFAULT: Self = Self::const_default();
}

impl GcTime {
    /// Gets the default for [`GcTime`] as a const
    #[must_use = "Gets the default, has no effect if unused"]
    #[inline]
    pub const fn const_default() -> Self {
        if cfg!(target_arch = "wasm32") {
            Self::Duration(Duration::from_secs(5 * 60))
        } else {
            Self::Infinite
        }
    }

    /// The longer of the two times; once an entry has been observed with a
    /// long lifetime it never shortens
    #[must_use = "Has no effect other than to produce the merged time"]
    pub(crate) fn max(self, other: Self) -> Self {
        match (self, other) {
            (Self::Infinite, _) | (_, Self::Infinite) => Self::Infinite,
            (Self::Duration(a), Self::Duration(b)) => Self::Duration(a.max(b)),
        }
    }
}

/// How long fetched data counts as fresh
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StaleTime {
    /// Fresh for `Duration` after a successful fetch
    Duration(Duration),
    /// Never becomes stale
    Infinite,
}

impl Default for StaleTime {
    fn default() -> Self {
        Self::const_default()
    }
}

impl ConstDefault for StaleTime {
    const DEFAULT: Self = Self::const_default();
}

impl StaleTime {
    /// Gets the default for [`StaleTime`] as a const: immediately stale
    #[must_use = "Gets the default, has no effect if unused"]
    #[inline]
    pub const fn const_default() -> Self {
        Self::Duration(Duration::ZERO)
    }
}

/// How fetches behave with respect to connectivity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkMode {
    /// Only fetch while online; otherwise the fetch pauses until the
    /// connection returns
    Online,
    /// Ignore the connectivity state entirely
    Always,
    /// Always run the first attempt; retries respect connectivity
    OfflineFirst,
}

impl ConstDefault for NetworkMode {
    const DEFAULT: Self = Self::const_default();
}

impl Default for NetworkMode {
    fn default() -> Self {
        Self::const_default()
    }
}

impl NetworkMode {
    /// Gets the default for [`NetworkMode`] as a const
    #[must_use = "Gets the default, has no effect if unused"]
    #[inline]
    pub const fn const_default() -> Self {
        Self::Online
    }

    /// Whether a first attempt may run given the connectivity state
    pub(crate) const fn can_start(self, online: bool) -> bool {
        match self {
            Self::Online => online,
            Self::Always | Self::OfflineFirst => true,
        }
    }

    /// Whether a paused or retrying attempt may proceed
    pub(crate) const fn can_continue(self, online: bool) -> bool {
        match self {
            Self::Always => true,
            Self::Online | Self::OfflineFirst => online,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_option_layering_is_first_set_wins()  {
        let merged = SetOption::<u32>::Inherit
            .or(SetOption::set(7))
            .or(SetOption::set(9));
        assert_eq!(merged.into_set(), Some(7));

        let inherited = SetOption::<u32>::Inherit.or(SetOption::Inherit);
        assert_eq!(inherited.unwrap_or_default(), 0);
    }

    #[test]
    fn gc_time_never_shortens() {
        let short = GcTime::Duration(Duration::from_secs(1));
        let long = GcTime::Duration(Duration::from_secs(60));
        assert_eq!(short.max(long), long);
        assert_eq!(long.max(short), long);
        assert_eq!(short.max(GcTime::Infinite), GcTime::Infinite);
    }

    #[test]
    fn network_mode_gating() {
        assert!(!NetworkMode::Online.can_start(false));
        assert!(NetworkMode::Always.can_start(false));
        assert!(NetworkMode::OfflineFirst.can_start(false));

        assert!(!NetworkMode::OfflineFirst.can_continue(false));
        assert!(NetworkMode::Always.can_continue(false));
        assert!(NetworkMode::Online.can_continue(true));
    }
}
