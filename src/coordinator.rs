//! The coordinator loop.
//!
//! A single thread on a non-worker core. Each pass it reads every worker's
//! counter, converts the interval delta to MB/s, feeds the history ring, asks
//! the model for the next interval's demand, divides the machine-wide pool
//! when cumulative demand exceeds it, publishes the resulting event budgets
//! and trains the model on the previous interval's error. Outside RUNNING it
//! parks on the lifecycle wake-queue and keeps every worker's throttle state
//! consistent with the lifecycle state.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::{info, trace, warn};

use crate::config::{Controller, HIST_SIZE};
use crate::lifecycle::{RegulatorInner, State};
use crate::rt;
use crate::units;

/// Thread body; exits when the lifecycle reaches STOPPED.
pub(crate) fn coordinator_main(inner: Arc<RegulatorInner>) {
    if let Err(e) = rt::pin_to_core(inner.plan.coordinator_core) {
        warn!(
            "coordinator: could not pin to core {}: {}",
            inner.plan.coordinator_core, e
        );
    }
    info!("coordinator: running on core {}", inner.plan.coordinator_core);

    // Workers start out forced-throttled until regulation is enabled.
    let mut observed = State::Initial;
    inner.force_throttle_all(true);

    loop {
        let state = inner.state();
        if state != observed {
            match state {
                State::Running => inner.force_throttle_all(false),
                State::Initial => inner.force_throttle_all(true),
                State::Stopped => {}
            }
            observed = state;
        }
        match state {
            State::Stopped => break,
            State::Initial => {
                inner
                    .state_wake
                    .wait_timeout_until(Duration::from_millis(100), || {
                        inner.state() != State::Initial
                    });
            }
            State::Running => {
                coordinator_pass(&inner);
                let pace = u64::from(inner.params.regulation_interval_ms());
                inner
                    .state_wake
                    .wait_timeout_until(Duration::from_millis(pace), || {
                        inner.state() != State::Running
                    });
            }
        }
    }

    info!("coordinator: exit");
}

/// One regulation pass over all workers.
///
/// Runs in two stages so the capacity split does not depend on worker order:
/// first measure and predict everywhere, then scale against the pool and
/// publish. A worker whose counter is missing or unreadable is skipped for
/// this pass; a negative prediction resets that worker's model and leaves
/// its previous budget in place.
pub(crate) fn coordinator_pass(inner: &RegulatorInner) {
    let interval_ms = inner.params.regulation_interval_ms();
    let window = inner.params.sliding_window_size();
    let available = inner.plan.bw_total_available_mb;
    let mut workers = inner.workers.lock();

    let n = workers.len();
    let mut measured = vec![false; n];
    let mut publish = vec![false; n];
    let mut demand: u64 = 0;

    for (idx, w) in workers.iter_mut().enumerate() {
        let counter = match &w.counter {
            Some(c) => c.clone(),
            None => continue,
        };
        let total = match counter.read_total() {
            Ok(t) => t,
            Err(e) => {
                warn!("worker {}: counter read failed: {}", w.id(), e);
                continue;
            }
        };
        let delta_events = total.saturating_sub(w.prev_total);
        w.prev_total = total;
        let delta_mb = units::mb_for_events(delta_events, interval_ms);
        w.last_delta_mb = delta_mb;
        w.hist[w.ri] = delta_mb;
        inner.stats.record(w.id(), delta_mb, window);
        measured[idx] = true;

        match inner.plan.controller {
            Controller::Lms => {
                let estimate =
                    w.model.predict(&w.hist, w.ri) + inner.plan.setpoint_of(w.id()) as i64;
                if estimate < 0 {
                    warn!(
                        "worker {}: negative estimate {}, resetting weights",
                        w.id(),
                        estimate
                    );
                    w.model.reset_weights();
                    w.model.decrease_learning_rate(10);
                    w.next_estimate = 2 * delta_mb as i64;
                } else {
                    w.model.reset_learning_rate();
                    w.next_estimate = estimate;
                    demand += estimate as u64;
                    publish[idx] = true;
                }
            }
            Controller::Pid => {
                // Steer measured usage toward the setpoint instead of
                // predicting demand.
                let target = inner.plan.setpoint_of(w.id()) as i64;
                let average = inner.stats.average_mb(w.id()).unwrap_or(delta_mb) as i64;
                let error = target - average;
                let mut alloc = delta_mb as i64;
                if error != 0 {
                    alloc += w.pid.correction(error);
                    if alloc < 0 {
                        alloc = 0;
                    }
                }
                w.next_estimate = alloc;
                demand += alloc as u64;
                publish[idx] = true;
            }
        }
    }

    for (idx, w) in workers.iter_mut().enumerate() {
        if !measured[idx] {
            continue;
        }
        if publish[idx] {
            let estimate = w.next_estimate as u64;
            let alloc = if demand > available {
                estimate * available / demand
            } else {
                estimate
            };
            let budget = units::events_for_mb(alloc, interval_ms);
            w.shared.budget_events.store(budget, Ordering::Release);

            let error = w.last_delta_mb as i64 - w.prev_estimate;
            if inner.plan.controller == Controller::Lms {
                w.model.update(error, &w.hist, w.ri);
            }
            trace!(
                "worker {}: used={} est={} alloc={} err={} budget={}",
                w.id(),
                w.last_delta_mb,
                w.next_estimate,
                alloc,
                error,
                budget
            );
        }
        w.ri = (w.ri + 1) % HIST_SIZE;
        w.prev_estimate = w.next_estimate;
    }
}
