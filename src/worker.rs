//! Per-worker state.
//!
//! Each worker is split in two: [`WorkerShared`], the atomics touched from
//! the timer tick, the overflow path, the throttler and the coordinator; and
//! [`Worker`], the record owned behind the regulator's worker table, which
//! additionally carries the coordinator-only model state and the owning
//! handles for the counter, timer and throttler.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::HIST_SIZE;
use crate::model::Model;
use crate::pid::PidController;
use crate::throttle::Throttler;
use crate::timer::RegulationTimer;
use crate::wait::WaitQueue;
use crate::{BudgetCounter, CoreId, WorkerId};

/// Lock-free worker state shared across contexts.
///
/// `budget_events` is published by the coordinator (release) and consumed by
/// the worker's timer tick (acquire). `throttled` is set by the overflow
/// path, cleared by the timer tick and polled by the throttler, all with
/// acquire/release ordering.
#[derive(Debug)]
pub struct WorkerShared {
    pub id: WorkerId,
    pub core: CoreId,
    /// Event budget the next timer tick installs as the counter's remaining
    /// period. Zero means "not yet published"; the tick substitutes the
    /// setpoint floor.
    pub budget_events: AtomicU64,
    /// Whether the worker core is currently stalled.
    pub throttled: AtomicBool,
    /// Cooperative shutdown flag for the throttler task.
    pub shutdown: AtomicBool,
    /// Parks the throttler between throttle episodes.
    pub throttle_wake: WaitQueue,
    /// Number of throttle episodes entered; diagnostic.
    pub throttle_episodes: AtomicU64,
}

impl WorkerShared {
    pub fn new(id: WorkerId, core: CoreId) -> Arc<WorkerShared> {
        Arc::new(WorkerShared {
            id,
            core,
            budget_events: AtomicU64::new(0),
            throttled: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            throttle_wake: WaitQueue::new(),
            throttle_episodes: AtomicU64::new(0),
        })
    }

    /// Publish a throttle state and, when stalling, wake the throttler.
    pub fn publish_throttle(&self, throttled: bool) {
        self.throttled.store(throttled, Ordering::Release);
        if throttled {
            self.throttle_wake.notify_all();
        }
    }
}

/// The full worker record. Fields other than `shared` and `counter` are only
/// touched by the coordinator and the lifecycle.
pub struct Worker {
    pub shared: Arc<WorkerShared>,
    /// Present whenever a counter exists (disabled in INITIAL, counting in
    /// RUNNING).
    pub counter: Option<Arc<dyn BudgetCounter>>,
    /// Running while regulation is enabled.
    pub timer: Option<RegulationTimer>,
    /// Alive for the worker's whole lifetime.
    pub throttler: Option<Throttler>,

    /// Prediction model, coordinator-only.
    pub model: Model,
    /// PID state, used instead of the model under `Controller::Pid`.
    pub pid: PidController,
    /// Ring of the last `HIST_SIZE` per-interval bandwidths (MB/s).
    pub hist: [u64; HIST_SIZE],
    /// Ring write cursor; position of the most recent sample.
    pub ri: usize,
    /// Counter total at the previous coordinator read.
    pub prev_total: u64,
    /// Bandwidth measured in the most recent interval (MB/s).
    pub last_delta_mb: u64,
    /// Estimate published for the upcoming interval (MB/s).
    pub next_estimate: i64,
    /// Estimate that the current interval was regulated against (MB/s).
    pub prev_estimate: i64,
}

impl Worker {
    pub fn new(shared: Arc<WorkerShared>) -> Worker {
        Worker {
            shared,
            counter: None,
            timer: None,
            throttler: None,
            model: Model::new(),
            pid: PidController::new(),
            hist: [0; HIST_SIZE],
            ri: 0,
            prev_total: 0,
            last_delta_mb: 0,
            next_estimate: 0,
            prev_estimate: 0,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.shared.id
    }

    /// Forget measurement-derived state; used when a counter is recreated.
    pub fn reset_measurement(&mut self) {
        self.prev_total = 0;
        self.last_delta_mb = 0;
        self.pid.reset();
    }
}

/// Point-in-time view of one worker for the status surface and tests.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub core: CoreId,
    pub throttled: bool,
    pub budget_events: u64,
    pub last_delta_mb: u64,
    pub next_estimate: i64,
    pub prev_estimate: i64,
    pub weights_q16: [i64; HIST_SIZE],
    pub throttle_episodes: u64,
}

impl Worker {
    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            id: self.shared.id,
            core: self.shared.core,
            throttled: self.shared.throttled.load(Ordering::Acquire),
            budget_events: self.shared.budget_events.load(Ordering::Acquire),
            last_delta_mb: self.last_delta_mb,
            next_estimate: self.next_estimate,
            prev_estimate: self.prev_estimate,
            weights_q16: self.model.weights_q16(),
            throttle_episodes: self.shared.throttle_episodes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_throttle_round_trip() {
        let s = WorkerShared::new(1, 1);
        assert!(!s.throttled.load(Ordering::Acquire));
        s.publish_throttle(true);
        assert!(s.throttled.load(Ordering::Acquire));
        s.publish_throttle(false);
        assert!(!s.throttled.load(Ordering::Acquire));
    }

    #[test]
    fn status_reflects_shared_fields() {
        let mut w = Worker::new(WorkerShared::new(2, 3));
        w.shared.budget_events.store(4096, Ordering::Release);
        w.last_delta_mb = 123;
        let st = w.status();
        assert_eq!(st.id, 2);
        assert_eq!(st.core, 3);
        assert_eq!(st.budget_events, 4096);
        assert_eq!(st.last_delta_mb, 123);
    }
}
