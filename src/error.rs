//! Error types for counter creation and regulation control.

use std::io;

use thiserror::Error;

use crate::WorkerId;

/// Failures surfaced by a [`crate::CounterProvider`] or a
/// [`crate::BudgetCounter`].
#[derive(Debug, Error)]
pub enum CounterError {
    /// The PMU or the requested configuration is not supported on this
    /// machine (EOPNOTSUPP-class).
    #[error("performance counter not supported")]
    Unsupported,

    /// The requested event id does not name a hardware event (ENOENT-class).
    #[error("no such hardware event")]
    NoSuchEvent,

    /// The counter exists but rejected the operation in its current state,
    /// e.g. `set_period_left` while running.
    #[error("counter in wrong state: {0}")]
    BadState(&'static str),

    #[error("counter I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Top-level regulator errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Creating a worker's counter, throttler or timer failed. Already
    /// created workers have been torn down again in reverse order.
    #[error("setup of worker {worker} failed: {source}")]
    Setup {
        worker: WorkerId,
        #[source]
        source: CounterError,
    },

    /// A configuration write carried an unknown name or an out-of-range
    /// value. State is unchanged.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested transition is not legal from the current lifecycle
    /// state.
    #[error("regulator is {0:?}")]
    Lifecycle(crate::State),

    #[error(transparent)]
    Counter(#[from] CounterError),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Error {
        Error::InvalidArgument(msg.into())
    }
}
