//! Regulator lifecycle: worker setup, the INITIAL/RUNNING/STOPPED state
//! machine and strictly reverse-order teardown.
//!
//! In INITIAL every worker exists with a disabled counter, a parked throttler
//! and no timer, and is forced-throttled. Enabling regulation recreates each
//! counter with the overflow callback installed, enables it and starts the
//! pinned interval timer; the RUNNING publication wakes the coordinator,
//! which clears the throttle flags. Disabling reverses exactly that much.
//! Dropping the regulator tears everything down in the inverse order of
//! creation, coordinator last-in-first-out included.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{info, warn};
use parking_lot::Mutex;

use crate::config::{Params, Plan, Setting};
use crate::coordinator;
use crate::error::{CounterError, Error};
use crate::overflow;
use crate::stats::Stats;
use crate::throttle::Throttler;
use crate::timer::RegulationTimer;
use crate::units;
use crate::wait::WaitQueue;
use crate::worker::{Worker, WorkerShared, WorkerStatus};
use crate::{BudgetCounter, CounterProvider, OverflowHandler, WorkerId};

/// Lifecycle states. STOPPED is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    Initial = 0,
    Running = 1,
    Stopped = 2,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Initial,
            1 => State::Running,
            _ => State::Stopped,
        }
    }
}

/// State shared between the control surface, the coordinator thread and the
/// per-worker contexts.
pub(crate) struct RegulatorInner {
    pub(crate) plan: Plan,
    pub(crate) params: Arc<Params>,
    pub(crate) state: AtomicU8,
    pub(crate) state_wake: WaitQueue,
    /// Lock-free per-worker state, indexed by `worker_id - 1`. Lives for the
    /// regulator's whole lifetime so the overflow path never takes a lock.
    pub(crate) shareds: Vec<Arc<WorkerShared>>,
    pub(crate) workers: Mutex<Vec<Worker>>,
    pub(crate) provider: Arc<dyn CounterProvider>,
    pub(crate) stats: Stats,
    overflow: OverflowHandler,
}

impl RegulatorInner {
    pub(crate) fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
        self.state_wake.notify_all();
    }

    /// Publish one throttle value to every worker (wakes throttlers when
    /// stalling).
    pub(crate) fn force_throttle_all(&self, throttled: bool) {
        for shared in &self.shareds {
            shared.publish_throttle(throttled);
        }
    }

    /// Initial worker setup: parked throttler, then a disabled counter.
    /// Undoes its own completed steps on failure.
    fn create_worker(&self, id: WorkerId) -> Result<Worker, CounterError> {
        let shared = self.shareds[id as usize - 1].clone();
        let mut worker = Worker::new(shared.clone());

        let throttler = Throttler::spawn(shared.clone(), shared.core).map_err(CounterError::Io)?;
        worker.throttler = Some(throttler);

        match self.create_counter(id) {
            Ok(counter) => {
                worker.counter = Some(counter);
                Ok(worker)
            }
            Err(e) => {
                shared.shutdown.store(true, Ordering::Release);
                if let Some(t) = worker.throttler.take() {
                    t.join(&shared);
                }
                Err(e)
            }
        }
    }

    /// A disabled counter for `id` with the overflow callback installed and
    /// the setpoint-equivalent sample period.
    fn create_counter(&self, id: WorkerId) -> Result<Arc<dyn BudgetCounter>, CounterError> {
        let period = units::events_for_mb(
            self.plan.setpoint_of(id),
            self.params.regulation_interval_ms(),
        )
        .max(1);
        self.provider.create(
            id,
            self.plan.core_of(id),
            period,
            self.params.llc_miss_event_id(),
            self.overflow.clone(),
        )
    }

    /// Recreate and enable the counter for one worker. Shared by the full
    /// start path and the timerless test harness.
    fn start_counter(&self, worker: &mut Worker) -> Result<Arc<dyn BudgetCounter>, CounterError> {
        worker.counter = None;
        let counter = self.create_counter(worker.id())?;
        counter.enable()?;
        worker.reset_measurement();
        worker.counter = Some(counter.clone());
        Ok(counter)
    }

    /// INITIAL -> RUNNING step for one worker: fresh enabled counter, then
    /// the pinned interval timer.
    fn start_regulation(&self, worker: &mut Worker) -> Result<(), CounterError> {
        let counter = self.start_counter(worker)?;
        let timer = RegulationTimer::start(
            worker.shared.clone(),
            counter,
            self.params.clone(),
            self.plan.setpoint_of(worker.id()),
        );
        match timer {
            Ok(t) => {
                worker.timer = Some(t);
                Ok(())
            }
            Err(e) => {
                if let Some(c) = worker.counter.take() {
                    let _ = c.disable();
                }
                Err(CounterError::Io(e))
            }
        }
    }

    /// RUNNING -> INITIAL step for one worker: disable the counter, cancel
    /// the timer (legal from any core; waits for an in-flight tick), release
    /// the counter.
    fn stop_regulation(&self, worker: &mut Worker) {
        if let Some(c) = &worker.counter {
            let _ = c.disable();
        }
        if let Some(t) = worker.timer.take() {
            t.cancel();
        }
        worker.counter = None;
    }

    /// Full teardown of one worker, inverse of its creation order.
    fn teardown_worker(&self, mut worker: Worker) {
        if let Some(t) = worker.timer.take() {
            t.cancel();
        }
        worker.shared.shutdown.store(true, Ordering::Release);
        worker.shared.throttled.store(false, Ordering::Release);
        if let Some(t) = worker.throttler.take() {
            t.join(&worker.shared);
        }
        worker.counter = None;
        info!("worker {}: torn down", worker.shared.id);
    }
}

#[cfg(test)]
impl RegulatorInner {
    /// Enable running counters without interval timers, so tests can drive
    /// passes and ticks synchronously.
    pub(crate) fn enable_counters_only(&self) -> Result<(), CounterError> {
        let mut workers = self.workers.lock();
        for worker in workers.iter_mut() {
            let _ = self.start_counter(worker)?;
        }
        drop(workers);
        self.set_state(State::Running);
        self.force_throttle_all(false);
        Ok(())
    }
}

/// The regulation engine. Construction brings every worker up in INITIAL
/// (forced-throttled, counters disabled); `apply("enable_regulation", "1")`
/// or [`Regulator::set_enabled`] starts regulation. Dropping the regulator
/// stops everything.
pub struct Regulator {
    inner: Arc<RegulatorInner>,
    coordinator: Option<JoinHandle<()>>,
}

impl Regulator {
    /// Create all workers and the coordinator thread. On a partial setup
    /// failure, already-created workers are torn down in reverse order and
    /// the error names the worker that failed.
    pub fn new(plan: Plan, provider: Arc<dyn CounterProvider>) -> Result<Regulator, Error> {
        Regulator::build(plan, provider, true)
    }

    /// Test constructor: no coordinator thread.
    #[cfg(test)]
    pub(crate) fn new_inert(
        plan: Plan,
        provider: Arc<dyn CounterProvider>,
    ) -> Result<Regulator, Error> {
        Regulator::build(plan, provider, false)
    }

    fn build(
        plan: Plan,
        provider: Arc<dyn CounterProvider>,
        spawn_coordinator: bool,
    ) -> Result<Regulator, Error> {
        plan.validate()?;
        let params = Arc::new(Params::default());
        let shareds: Vec<Arc<WorkerShared>> = plan
            .worker_ids()
            .map(|id| WorkerShared::new(id, plan.core_of(id)))
            .collect();
        let overflow = overflow::make_handler(shareds.clone(), plan.coordinator_core);
        let stats = Stats::new(&plan.initial_setpoint_mb);

        let inner = Arc::new(RegulatorInner {
            plan,
            params,
            state: AtomicU8::new(State::Initial as u8),
            state_wake: WaitQueue::new(),
            shareds,
            workers: Mutex::new(Vec::new()),
            provider,
            stats,
            overflow,
        });

        let mut workers: Vec<Worker> = Vec::new();
        for id in inner.plan.worker_ids() {
            match inner.create_worker(id) {
                Ok(w) => workers.push(w),
                Err(source) => {
                    while let Some(w) = workers.pop() {
                        inner.teardown_worker(w);
                    }
                    return Err(Error::Setup { worker: id, source });
                }
            }
        }
        inner.force_throttle_all(true);
        *inner.workers.lock() = workers;
        info!(
            "regulator: {} workers in INITIAL, pool {} MB/s",
            inner.plan.worker_count(),
            inner.plan.bw_total_available_mb
        );

        let coordinator = if spawn_coordinator {
            let thread_inner = inner.clone();
            let spawned = thread::Builder::new()
                .name("coordinator/0".to_string())
                .spawn(move || coordinator::coordinator_main(thread_inner));
            match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    let mut workers = std::mem::take(&mut *inner.workers.lock());
                    while let Some(w) = workers.pop() {
                        inner.teardown_worker(w);
                    }
                    return Err(Error::Counter(CounterError::Io(e)));
                }
            }
        } else {
            None
        };

        Ok(Regulator { inner, coordinator })
    }

    pub(crate) fn inner(&self) -> &Arc<RegulatorInner> {
        &self.inner
    }

    pub fn state(&self) -> State {
        self.inner.state()
    }

    /// Drive the INITIAL <-> RUNNING transitions.
    ///
    /// Enabling publishes RUNNING, then starts each worker's regulation; a
    /// per-worker failure rolls the already-started workers back, restores
    /// INITIAL and reports the failing worker. Both directions are idempotent.
    pub fn set_enabled(&self, on: bool) -> Result<(), Error> {
        let current = self.inner.state();
        if current == State::Stopped {
            return Err(Error::Lifecycle(current));
        }
        if on {
            if current == State::Running {
                info!("regulation already enabled");
                return Ok(());
            }
            // RUNNING is visible before any start_regulation call returns.
            self.inner.set_state(State::Running);
            let mut workers = self.inner.workers.lock();
            for i in 0..workers.len() {
                let id = workers[i].id();
                if let Err(source) = self.inner.start_regulation(&mut workers[i]) {
                    for j in (0..i).rev() {
                        self.inner.stop_regulation(&mut workers[j]);
                    }
                    drop(workers);
                    self.inner.set_state(State::Initial);
                    return Err(Error::Setup { worker: id, source });
                }
            }
            info!("regulation enabled");
        } else {
            if current == State::Initial {
                info!("regulation already disabled");
                return Ok(());
            }
            let mut workers = self.inner.workers.lock();
            for w in workers.iter_mut() {
                self.inner.stop_regulation(w);
            }
            drop(workers);
            self.inner.set_state(State::Initial);
            info!("regulation disabled");
        }
        Ok(())
    }

    /// Configuration surface: apply one `name`/`value` write.
    pub fn apply(&self, name: &str, value: &str) -> Result<(), Error> {
        match Setting::parse(name, value)? {
            Setting::EnableRegulation(on) => self.set_enabled(on),
            setting => {
                self.inner.params.store(setting);
                Ok(())
            }
        }
    }

    /// Configuration surface: render one endpoint's current value.
    pub fn render(&self, name: &str) -> Option<String> {
        if name == "enable_regulation" {
            let on = self.inner.state() == State::Running;
            return Some(u8::from(on).to_string());
        }
        self.inner.params.render(name)
    }

    /// Point-in-time view of all workers, in worker-id order.
    pub fn status(&self) -> Vec<WorkerStatus> {
        self.inner.workers.lock().iter().map(Worker::status).collect()
    }

    /// Sliding-window average bandwidth for one worker, MB/s.
    pub fn average_mb(&self, worker: WorkerId) -> Option<u64> {
        self.inner.stats.average_mb(worker)
    }

    pub fn params(&self) -> &Params {
        &self.inner.params
    }

    fn shutdown_in_place(&mut self) {
        if self.inner.state() == State::Stopped && self.coordinator.is_none() {
            return;
        }
        self.inner.set_state(State::Stopped);
        if let Some(handle) = self.coordinator.take() {
            if handle.join().is_err() {
                warn!("coordinator panicked");
            }
        }
        let mut workers = std::mem::take(&mut *self.inner.workers.lock());
        while let Some(w) = workers.pop() {
            self.inner.teardown_worker(w);
        }
        info!("regulator stopped");
    }

    /// Stop regulation and release every worker, coordinator first, workers
    /// in reverse creation order.
    pub fn shutdown(mut self) {
        self.shutdown_in_place();
    }
}

impl Drop for Regulator {
    fn drop(&mut self) {
        self.shutdown_in_place();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Op, SimProvider};

    #[test]
    fn initial_state_is_throttled_with_disabled_counters() {
        let provider = Arc::new(SimProvider::new());
        let r = Regulator::new_inert(Plan::default(), provider.clone()).unwrap();
        assert_eq!(r.state(), State::Initial);
        for st in r.status() {
            assert!(st.throttled);
        }
        // Counters exist but are not counting.
        for id in 1..=4 {
            let c = provider.counter(id).unwrap();
            assert!(!c.is_counting());
        }
        let ops = provider.ops();
        assert_eq!(
            ops,
            vec![Op::Create(1), Op::Create(2), Op::Create(3), Op::Create(4)]
        );
    }

    #[test]
    fn enable_recreates_counters_and_clears_throttle() {
        let provider = Arc::new(SimProvider::new());
        let r = Regulator::new_inert(Plan::default(), provider.clone()).unwrap();
        provider.clear_ops();

        r.set_enabled(true).unwrap();
        assert_eq!(r.state(), State::Running);
        let ops = provider.ops();
        for id in 1..=4u8 {
            assert!(ops.contains(&Op::Create(id)), "no new counter for {}", id);
            assert!(ops.contains(&Op::Enable(id)), "counter {} not enabled", id);
        }
        // Inert build has no coordinator; emulate its RUNNING action.
        r.inner().force_throttle_all(false);
        for st in r.status() {
            assert!(!st.throttled);
        }
        // Idempotent.
        r.set_enabled(true).unwrap();
    }

    #[test]
    fn disable_cancels_timers_and_releases_counters() {
        let provider = Arc::new(SimProvider::new());
        let r = Regulator::new_inert(Plan::default(), provider.clone()).unwrap();
        r.set_enabled(true).unwrap();
        provider.clear_ops();

        r.set_enabled(false).unwrap();
        assert_eq!(r.state(), State::Initial);
        let ops = provider.ops();
        for id in 1..=4u8 {
            assert!(ops.contains(&Op::Disable(id)), "counter {} not disabled", id);
            assert!(ops.contains(&Op::Release(id)), "counter {} not released", id);
        }
        // Timers are gone: no tick traffic arrives anymore.
        provider.clear_ops();
        std::thread::sleep(std::time::Duration::from_millis(15));
        assert!(provider.ops().is_empty());
        // Idempotent.
        r.set_enabled(false).unwrap();
    }

    #[test]
    fn partial_setup_failure_unwinds_in_reverse() {
        let provider = Arc::new(SimProvider::new());
        provider.fail_create_for(3);
        let err = Regulator::new_inert(Plan::default(), provider.clone());
        match err {
            Err(Error::Setup { worker, .. }) => assert_eq!(worker, 3),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        let ops = provider.ops();
        assert_eq!(
            ops,
            vec![
                Op::Create(1),
                Op::Create(2),
                Op::Release(2),
                Op::Release(1)
            ]
        );
    }

    #[test]
    fn enable_failure_rolls_back_started_workers() {
        let provider = Arc::new(SimProvider::new());
        let r = Regulator::new_inert(Plan::default(), provider.clone()).unwrap();
        provider.fail_create_for(2);
        provider.clear_ops();

        let err = r.set_enabled(true);
        assert!(matches!(err, Err(Error::Setup { worker: 2, .. })));
        assert_eq!(r.state(), State::Initial);
        let ops = provider.ops();
        // Worker 1 was started and rolled back again.
        assert!(ops.contains(&Op::Create(1)));
        assert!(ops.contains(&Op::Enable(1)));
        assert!(ops.contains(&Op::Disable(1)));
    }

    #[test]
    fn shutdown_tears_down_in_reverse_order() {
        let provider = Arc::new(SimProvider::new());
        let r = Regulator::new_inert(Plan::default(), provider.clone()).unwrap();
        provider.clear_ops();
        drop(r);
        let releases: Vec<Op> = provider
            .ops()
            .into_iter()
            .filter(|op| matches!(op, Op::Release(_)))
            .collect();
        assert_eq!(
            releases,
            vec![
                Op::Release(4),
                Op::Release(3),
                Op::Release(2),
                Op::Release(1)
            ]
        );
    }

    #[test]
    fn stopped_regulator_rejects_enable() {
        let provider = Arc::new(SimProvider::new());
        let mut r = Regulator::new_inert(Plan::default(), provider).unwrap();
        r.shutdown_in_place();
        assert!(matches!(
            r.set_enabled(true),
            Err(Error::Lifecycle(State::Stopped))
        ));
    }

    #[test]
    fn render_covers_all_endpoints() {
        let provider = Arc::new(SimProvider::new());
        let r = Regulator::new_inert(Plan::default(), provider).unwrap();
        assert_eq!(r.render("enable_regulation").unwrap(), "0");
        assert_eq!(r.render("regulation_interval_ms").unwrap(), "1");
        assert_eq!(r.render("observation_interval_ms").unwrap(), "1000");
        assert_eq!(r.render("sliding_window_size").unwrap(), "25");
        assert!(r.render("llc_miss_event_id").is_some());
        r.apply("sliding_window_size", "10").unwrap();
        assert_eq!(r.render("sliding_window_size").unwrap(), "10");
    }
}
