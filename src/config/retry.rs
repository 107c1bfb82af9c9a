use std::{
    fmt::{self, Debug, Formatter},
    rc::Rc,
    time::Duration,
};

use crate::{const_default::ConstDefault, error::QueryError};

type DelayFn = Rc<dyn Fn(u32, &QueryError) -> Duration>;
type RetryFn = Rc<dyn Fn(u32, &QueryError) -> bool>;

// Already small as possible
#[allow(variant_size_differences)]
/// Control whether a failed attempt is retried
/// Default: retry 3 times in the browser, never on native targets
pub enum RetryPolicy {
    /// Retry when the closure returns true, given the failure count and error
    Func(RetryFn),
    /// Retry infinitely
    Infinite,
    /// Retry for a set number of times
    Num(u32),
}

impl Clone for RetryPolicy {
    fn clone(&self) -> Self {
        match *self {
            Self::Func(ref func) => Self::Func(Rc::clone(func)),
            Self::Infinite => Self::Infinite,
            Self::Num(n) => Self::Num(n),
        }
    }
}

impl Debug for RetryPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Func(_) => f.debug_tuple("RetryPolicy::Func").field(&"..").finish(),
            Self::Infinite => f.debug_tuple("RetryPolicy::Infinite").finish(),
            Self::Num(ref n) => f.debug_tuple("RetryPolicy::Num").field(n).finish(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::const_default()
    }
}

impl ConstDefault for RetryPolicy {
    const DEFAULT: Self = Self::const_default();
}

impl RetryPolicy {
    /// Gets the default for [`RetryPolicy`] as a const
    #[must_use = "Gets the default, has no effect if unused"]
    #[inline]
    pub const fn const_default() -> Self {
        if cfg!(target_arch = "wasm32") {
            Self::Num(3)
        } else {
            Self::Num(0)
        }
    }
}

/// Control how long to wait between retries
/// Default: exponential backoff from a 1000ms base, capped at 30s
pub enum RetryDelay {
    /// Wait `initial * 2^failure_count` between retries
    Backoff {
        /// Base delay, doubled for each failure including the first
        initial: Duration,
        /// Don't go above this amount of time
        maximum: Duration,
    },
    /// Always wait a set time between retries
    Always(Duration),
    /// Wait for the time returned from the closure, given the failure count and error
    DelayFn(DelayFn),
}

impl Clone for RetryDelay {
    fn clone(&self) -> Self {
        match *self {
            Self::DelayFn(ref func) => Self::DelayFn(Rc::clone(func)),
            Self::Backoff { initial, maximum } => Self::Backoff { initial, maximum },
            Self::Always(a) => Self::Always(a),
        }
    }
}

impl Debug for RetryDelay {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Backoff {
                ref initial,
                ref maximum,
            } => f
                .debug_struct("RetryDelay::Backoff")
                .field("initial", initial)
                .field("maximum", maximum)
                .finish(),
            Self::Always(ref dur) => f.debug_tuple("RetryDelay::Always").field(dur).finish(),
            Self::DelayFn(_) => f.debug_tuple("RetryDelay::DelayFn").field(&"..").finish(),
        }
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self::const_default()
    }
}

impl ConstDefault for RetryDelay {
    const DEFAULT: Self = Self::const_default();
}

impl RetryDelay {
    /// Gets the default for [`RetryDelay`] as a const
    #[must_use = "Gets the default, has no effect if unused"]
    #[inline]
    pub const fn const_default() -> Self {
        Self::Backoff {
            initial: Duration::from_millis(1000),
            maximum: Duration::from_secs(30),
        }
    }
}

/// Configuration for how failed queries and mutations are retried
#[derive(Debug)]
pub struct RetryConfig {
    /// See [`RetryPolicy`]
    pub policy: RetryPolicy,
    /// See [`RetryDelay`]
    pub delay: RetryDelay,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            policy: RetryPolicy::default(),
            delay: RetryDelay::default(),
        }
    }
}

impl Clone for RetryConfig {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy.clone(),
            delay: self.delay.clone(),
        }
    }
}

impl ConstDefault for RetryConfig {
    const DEFAULT: Self = Self::const_default();
}

impl RetryConfig {
    /// Gets the default for [`RetryConfig`] as a const
    #[must_use = "Gets the default, has no effect if unused"]
    #[inline]
    pub const fn const_default() -> Self {
        Self {
            policy: RetryPolicy::const_default(),
            delay: RetryDelay::const_default(),
        }
    }

    /// Creates a retry policy that doesn't retry
    /// Delay is set to default
    #[must_use = "No reason to create if not used"]
    pub fn none() -> Self {
        Self {
            policy: RetryPolicy::Num(0),
            delay: RetryDelay::default(),
        }
    }

    /// Sets the retry policy to infinite
    // Possible drop, can't be const
    #[allow(clippy::missing_const_for_fn)]
    #[must_use = "Builder pattern"]
    #[inline]
    pub fn infinite(mut self) -> Self {
        self.policy = RetryPolicy::Infinite;
        self
    }

    /// Sets the retry policy to `num` times
    // Possible drop, can't be const
    #[allow(clippy::missing_const_for_fn)]
    #[must_use = "Builder pattern"]
    #[inline]
    pub fn num(mut self, num: u32) -> Self {
        self.policy = RetryPolicy::Num(num);
        self
    }

    /// Sets the retry policy to use the provided closure
    // Possible drop, can't be const
    #[allow(clippy::missing_const_for_fn)]
    #[must_use = "Builder pattern"]
    #[inline]
    pub fn policy_fn(mut self, func: impl Fn(u32, &QueryError) -> bool + 'static) -> Self {
        self.policy = RetryPolicy::Func(Rc::new(func));
        self
    }

    /// Sets the retry delay to backoff with the provided parameters
    // Possible drop, can't be const
    #[allow(clippy::missing_const_for_fn)]
    #[must_use = "Builder pattern"]
    #[inline]
    pub fn backoff(mut self, initial: Duration, maximum: Duration) -> Self {
        self.delay = RetryDelay::Backoff { initial, maximum };
        self
    }

    /// Sets the retry delay to always be `duration`
    // Possible drop, can't be const
    #[allow(clippy::missing_const_for_fn)]
    #[must_use = "Builder pattern"]
    #[inline]
    pub fn always(mut self, duration: Duration) -> Self {
        self.delay = RetryDelay::Always(duration);
        self
    }

    /// Sets the retry delay to use the provided closure
    // Possible drop, can't be const
    #[allow(clippy::missing_const_for_fn)]
    #[must_use = "Builder pattern"]
    #[inline]
    pub fn delay_fn(mut self, func: impl Fn(u32, &QueryError) -> Duration + 'static) -> Self {
        self.delay = RetryDelay::DelayFn(Rc::new(func));
        self
    }

    /// How long to wait before the retry for the given failure, or `None`
    /// when the policy denies another attempt
    ///
    /// `failure_count` counts the failure that just happened: 1 for the
    /// first failed attempt.
    pub(crate) fn retry_delay(&self, failure_count: u32, error: &QueryError) -> Option<Duration> {
        match self.policy {
            RetryPolicy::Func(ref func) if func(failure_count, error) => Some(()),
            RetryPolicy::Infinite => Some(()),
            RetryPolicy::Num(ref n) if failure_count <= *n => Some(()),
            _ => None,
        }?;

        Some(match self.delay {
            RetryDelay::Always(ref d) => *d,
            RetryDelay::Backoff {
                ref initial,
                ref maximum,
            } => initial
                .saturating_mul(2_u32.saturating_pow(failure_count))
                .min(*maximum),
            RetryDelay::DelayFn(ref func) => func(failure_count, error),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn num_policy_bounds_retries() {
        let config = RetryConfig::default().num(2);
        let err = QueryError::message("boom");
        assert!(config.retry_delay(1, &err).is_some());
        assert!(config.retry_delay(2, &err).is_some());
        assert!(config.retry_delay(3, &err).is_none());
    }

    #[test]
    fn zero_retries_denies_immediately() {
        let config = RetryConfig::none();
        assert!(config
            .retry_delay(1, &QueryError::message("boom"))
            .is_none());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = RetryConfig::default()
            .infinite()
            .backoff(Duration::from_millis(1000), Duration::from_secs(30));
        let err = QueryError::message("boom");
        assert_eq!(config.retry_delay(1, &err), Some(Duration::from_millis(2000)));
        assert_eq!(config.retry_delay(2, &err), Some(Duration::from_millis(4000)));
        assert_eq!(config.retry_delay(4, &err), Some(Duration::from_millis(16000)));
        assert_eq!(config.retry_delay(5, &err), Some(Duration::from_secs(30)));
        assert_eq!(config.retry_delay(31, &err), Some(Duration::from_secs(30)));
    }

    #[test]
    fn predicate_policy_sees_count_and_error() {
        let config = RetryConfig::default()
            .policy_fn(|count, error| count < 5 && !error.is_cancelled());
        assert!(config
            .retry_delay(1, &QueryError::message("transient"))
            .is_some());
        assert!(config
            .retry_delay(1, &QueryError::Cancelled(Default::default()))
            .is_none());
    }
}
