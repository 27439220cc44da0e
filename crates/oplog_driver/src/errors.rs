//! Error classification for the driver.
//!
//! Mirrors the `errors` crate's convention of tagging an `anyhow::Error`
//! chain with a small classifiable type via `.context(...)`, scaled down to
//! what a library driver (rather than a web-facing server) needs: the
//! `errors` crate's HTTP-status/gRPC-code/Sentry-routing machinery is out of
//! scope here.

use thiserror::Error;

/// Classification attached to an `anyhow::Error` via `.context(DriverError::..)`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// A programmer invariant was violated (e.g. overflow of `published` by
    /// more than one, insert of an already-cached id, unexpected phase on
    /// entry to a routine, or an unsupported oplog op kind). Fatal: raised
    /// synchronously at the point of detection to aid debugging.
    #[error("driver invariant violated: {0}")]
    Invariant(String),

    /// At least one fetch in a batch failed; this is the first such error,
    /// tagged via `.context(...)` onto the underlying fetcher error.
    #[error("fetch failed: {0}")]
    Fetch(String),
}

/// Shorthand for raising a fatal invariant violation.
macro_rules! invariant {
    ($($arg:tt)*) => {
        return Err(anyhow::Error::new($crate::errors::DriverError::Invariant(format!($($arg)*))))
    };
}

/// Shorthand for asserting a fatal invariant.
macro_rules! ensure_invariant {
    ($cond:expr, $($arg:tt)*) => {
        if !($cond) {
            return Err(anyhow::Error::new($crate::errors::DriverError::Invariant(format!($($arg)*))));
        }
    };
}

pub(crate) use ensure_invariant;
pub(crate) use invariant;
