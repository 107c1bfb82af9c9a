use std::rc::Rc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Options carried by a cancellation, controlling how the owning query
/// handles the aborted fetch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOptions {
    /// Restore the data snapshot taken before the fetch started
    pub revert: bool,
    /// Suppress observer notifications for the cancellation transition
    pub silent: bool,
}

impl CancelOptions {
    /// Cancellation that reverts to the pre-fetch snapshot
    #[must_use = "Creating options has no effect"]
    #[inline]
    pub const fn reverting() -> Self {
        Self {
            revert: true,
            silent: false,
        }
    }

    /// Cancellation that does not notify observers
    #[must_use = "Creating options has no effect"]
    #[inline]
    pub const fn silent() -> Self {
        Self {
            revert: false,
            silent: true,
        }
    }
}

/// Error produced by a query or mutation attempt
///
/// Cancellations are part of the error domain so that a settled attempt can
/// always be described by a single `Result`, but they are distinguished by
/// variant: a [`QueryError::Cancelled`] never counts as a fetch failure and
/// is never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum QueryError {
    /// The attempt was cancelled before it settled
    #[error("fetch was cancelled")]
    Cancelled(CancelOptions),
    /// The user-supplied function rejected
    #[error("{0}")]
    Message(Rc<str>),
}

impl QueryError {
    /// Creates a rejection error from anything string-like
    #[must_use = "Creating an error has no effect"]
    pub fn message(msg: impl Into<Rc<str>>) -> Self {
        Self::Message(msg.into())
    }

    /// Whether this error is a cancellation
    #[must_use = "Has no effect other than to check the variant"]
    #[inline]
    pub const fn is_cancelled(&self) -> bool {
        matches!(*self, Self::Cancelled(_))
    }

    /// The cancel options, if this error is a cancellation
    #[must_use = "Has no effect other than to read the options"]
    #[inline]
    pub const fn cancel_options(&self) -> Option<CancelOptions> {
        match *self {
            Self::Cancelled(opts) => Some(opts),
            Self::Message(_) => None,
        }
    }
}

impl From<&str> for QueryError {
    fn from(msg: &str) -> Self {
        Self::message(msg)
    }
}

impl From<String> for QueryError {
    fn from(msg: String) -> Self {
        Self::message(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_distinguished() {
        let err = QueryError::Cancelled(CancelOptions::reverting());
        assert!(err.is_cancelled());
        assert_eq!(
            err.cancel_options(),
            Some(CancelOptions {
                revert: true,
                silent: false
            })
        );
        assert!(!QueryError::message("boom").is_cancelled());
    }

    #[test]
    fn display_uses_message() {
        assert_eq!(QueryError::message("boom").to_string(), "boom");
    }
}
