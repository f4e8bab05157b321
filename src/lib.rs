//! Adaptive per-core memory-bandwidth regulation on top of hardware
//! performance counters (http://man7.org/linux/man-pages/man2/perf_event_open.2.html)
//!
//! Each designated worker core gets an LLC read-miss counter with a sample
//! period equal to its current event budget. When the budget is exhausted the
//! counter overflows and the worker is stalled by a high-priority spin task
//! until the next regulation interval reloads the budget. A coordinator loop
//! on a separate core measures per-interval consumption, predicts the next
//! interval's demand with an online NLMS model and divides the machine-wide
//! bandwidth pool among the workers.
//!
//! ```no_run
//! use std::sync::Arc;
//! use bwguard::{Plan, Regulator};
//! use bwguard::linux::PerfCounterProvider;
//!
//! let regulator = Regulator::new(Plan::default(), Arc::new(PerfCounterProvider))
//!     .expect("Could not create regulator");
//! regulator.apply("enable_regulation", "1").expect("Could not enable");
//! ```

use std::sync::Arc;

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod model;
pub mod overflow;
pub mod pid;
pub mod rt;
pub mod sim;
pub mod stats;
pub mod throttle;
pub mod timer;
pub mod units;
pub mod wait;
pub mod worker;

#[cfg(target_os = "linux")]
pub mod linux;

pub use crate::config::{Controller, Params, Plan, Setting};
pub use crate::error::{CounterError, Error};
pub use crate::events::EventId;
pub use crate::lifecycle::{Regulator, State};

/// Identifies a worker slot. Worker ids are `1..=N`; id 0 is reserved for the
/// coordinator and never regulated.
pub type WorkerId = u8;

/// A logical CPU number a worker or the coordinator is pinned to.
pub type CoreId = usize;

/// Invoked from the overflow path with the id of the worker whose counter
/// exhausted its budget. Runs in the counter backend's deferred context; it
/// must not block.
pub type OverflowHandler = Arc<dyn Fn(WorkerId) + Send + Sync>;

/// A per-core event counter with sample-period overflow, as consumed by the
/// regulation engine.
///
/// The contract mirrors a pinned hardware PMU counter:
///
/// * `stop` commits the running count; between `stop` and `start` no overflow
///   is delivered.
/// * `set_period_left` installs the number of events remaining before the
///   next overflow and is only legal while the counter is stopped.
/// * `read_total` returns the cumulative count since creation and is
///   monotonic within the counter's lifetime.
pub trait BudgetCounter: Send + Sync {
    /// Allow the counter to count its designated event.
    fn enable(&self) -> Result<(), CounterError>;

    /// Stop counting until the next `enable`.
    fn disable(&self) -> Result<(), CounterError>;

    /// Stop counting and commit the current count.
    fn stop(&self) -> Result<(), CounterError>;

    /// Resume counting with the previously installed remaining period.
    fn start(&self) -> Result<(), CounterError>;

    /// Install the remaining events before the next overflow. Only legal
    /// while stopped.
    fn set_period_left(&self, events: u64) -> Result<(), CounterError>;

    /// Cumulative event count since creation.
    fn read_total(&self) -> Result<u64, CounterError>;
}

/// Creates [`BudgetCounter`]s pinned to worker cores.
///
/// Implemented by the Linux perf_event backend and by the simulated backend
/// used in tests.
pub trait CounterProvider: Send + Sync {
    /// Configure a counter for `event` pinned to `core`, sampling every
    /// `sample_period` events, excluding kernel-mode counting, initially
    /// disabled. `overflow` is invoked with `worker` each time the counter
    /// reaches the end of its period.
    fn create(
        &self,
        worker: WorkerId,
        core: CoreId,
        sample_period: u64,
        event: EventId,
        overflow: OverflowHandler,
    ) -> Result<Arc<dyn BudgetCounter>, CounterError>;
}
