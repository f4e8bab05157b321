//! The per-worker regulation interval timer.
//!
//! A pinned thread fires every `regulation_interval_ms`: it stops the
//! counter, installs the coordinator's published budget as the remaining
//! period, clears the throttle flag and restarts the counter. The next
//! deadline is always computed from "now", so a long preemption drops ticks
//! instead of replaying them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::config::Params;
use crate::rt;
use crate::units;
use crate::worker::WorkerShared;
use crate::{BudgetCounter, CounterError};

/// One regulation tick.
///
/// The counter stays stopped for the whole budget-reload window, so no
/// overflow can interleave with the reload. Clearing `throttled` releases the
/// throttler's inner busy-loop; no wake is needed because the spin polls the
/// flag. A zero published budget is replaced by the floor so the counter is
/// never reloaded with an empty period.
pub fn run_tick(
    shared: &WorkerShared,
    counter: &dyn BudgetCounter,
    floor_events: u64,
) -> Result<(), CounterError> {
    counter.stop()?;
    let mut budget = shared.budget_events.load(Ordering::Acquire);
    if budget == 0 {
        budget = floor_events.max(1);
    }
    counter.set_period_left(budget)?;
    shared.throttled.store(false, Ordering::Release);
    counter.start()?;
    Ok(())
}

/// Owning handle for a worker's tick thread.
pub struct RegulationTimer {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl RegulationTimer {
    /// Start the periodic tick for `shared`, pinned to the worker's core.
    /// `setpoint_mb` provides the budget floor.
    pub fn start(
        shared: Arc<WorkerShared>,
        counter: Arc<dyn BudgetCounter>,
        params: Arc<Params>,
        setpoint_mb: u64,
    ) -> std::io::Result<RegulationTimer> {
        let cancel = Arc::new(AtomicBool::new(false));
        let thread_cancel = cancel.clone();
        let handle = thread::Builder::new()
            .name(format!("regtimer/{}", shared.id))
            .spawn(move || timer_main(shared, counter, params, setpoint_mb, thread_cancel))?;
        Ok(RegulationTimer { cancel, handle })
    }

    /// Cancel the timer and wait for any in-flight tick to complete.
    /// Permitted from any core.
    pub fn cancel(self) {
        self.cancel.store(true, Ordering::Release);
        let _ = self.handle.join();
    }
}

fn timer_main(
    shared: Arc<WorkerShared>,
    counter: Arc<dyn BudgetCounter>,
    params: Arc<Params>,
    setpoint_mb: u64,
    cancel: Arc<AtomicBool>,
) {
    if let Err(e) = rt::pin_to_core(shared.core) {
        warn!(
            "regtimer/{}: could not pin to core {}: {}",
            shared.id, shared.core, e
        );
    }
    info!("regtimer/{}: started on core {}", shared.id, shared.core);

    let mut deadline = Instant::now() + interval(&params);
    loop {
        rt::sleep_until(deadline);
        if cancel.load(Ordering::Acquire) {
            break;
        }

        let interval_ms = params.regulation_interval_ms();
        let floor = units::events_for_mb(setpoint_mb, interval_ms);
        if let Err(e) = run_tick(&shared, counter.as_ref(), floor) {
            // A tick that races a disable sees a dead counter; the next
            // lifecycle action tears this timer down.
            warn!("regtimer/{}: tick failed: {}", shared.id, e);
        }
        // Forward from now, dropping any missed ticks.
        deadline = Instant::now() + Duration::from_millis(u64::from(interval_ms));
    }

    info!("regtimer/{}: exit", shared.id);
}

fn interval(params: &Params) -> Duration {
    Duration::from_millis(u64::from(params.regulation_interval_ms()))
}
