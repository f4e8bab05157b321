//! A simulated counter backend.
//!
//! Implements the [`BudgetCounter`] contract exactly (stop/start gating,
//! period-left reload, one overflow per exhausted period) with traffic
//! injected by the test instead of a PMU. Every operation is appended to a
//! shared op log so tests can assert ordering properties (reload values,
//! reverse-order teardown, enable/disable cycles).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::CounterError;
use crate::events::EventId;
use crate::{BudgetCounter, CoreId, CounterProvider, OverflowHandler, WorkerId};

/// One recorded counter operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Create(WorkerId),
    Enable(WorkerId),
    Disable(WorkerId),
    Stop(WorkerId),
    Start(WorkerId),
    SetPeriod(WorkerId, u64),
    Release(WorkerId),
}

#[derive(Debug, Default, Clone)]
pub struct OpLog {
    ops: Arc<Mutex<Vec<Op>>>,
}

impl OpLog {
    fn push(&self, op: Op) {
        self.ops.lock().push(op);
    }

    pub fn snapshot(&self) -> Vec<Op> {
        self.ops.lock().clone()
    }

    pub fn clear(&self) {
        self.ops.lock().clear();
    }
}

/// A single simulated counter.
pub struct SimCounter {
    worker: WorkerId,
    enabled: AtomicBool,
    counting: AtomicBool,
    total: AtomicU64,
    period_left: AtomicU64,
    overflow: OverflowHandler,
    log: OpLog,
}

impl SimCounter {
    fn new(worker: WorkerId, sample_period: u64, overflow: OverflowHandler, log: OpLog) -> SimCounter {
        SimCounter {
            worker,
            enabled: AtomicBool::new(false),
            counting: AtomicBool::new(false),
            total: AtomicU64::new(0),
            period_left: AtomicU64::new(sample_period),
            overflow,
            log,
        }
    }

    /// Inject `events` of traffic. Counts only while enabled and started;
    /// fires the overflow callback once when the remaining period hits zero.
    pub fn advance(&self, events: u64) {
        if !self.is_counting() {
            return;
        }
        self.total.fetch_add(events, Ordering::AcqRel);
        let mut left = self.period_left.load(Ordering::Acquire);
        loop {
            if left == 0 {
                // Period already exhausted; traffic accumulates without a
                // second overflow until the next reload.
                return;
            }
            let next = left.saturating_sub(events);
            match self.period_left.compare_exchange(
                left,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if next == 0 {
                        (self.overflow)(self.worker);
                    }
                    return;
                }
                Err(actual) => left = actual,
            }
        }
    }

    pub fn is_counting(&self) -> bool {
        self.enabled.load(Ordering::Acquire) && self.counting.load(Ordering::Acquire)
    }

    pub fn period_left(&self) -> u64 {
        self.period_left.load(Ordering::Acquire)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }
}

impl BudgetCounter for SimCounter {
    fn enable(&self) -> Result<(), CounterError> {
        self.enabled.store(true, Ordering::Release);
        self.counting.store(true, Ordering::Release);
        self.log.push(Op::Enable(self.worker));
        Ok(())
    }

    fn disable(&self) -> Result<(), CounterError> {
        self.enabled.store(false, Ordering::Release);
        self.counting.store(false, Ordering::Release);
        self.log.push(Op::Disable(self.worker));
        Ok(())
    }

    fn stop(&self) -> Result<(), CounterError> {
        self.counting.store(false, Ordering::Release);
        self.log.push(Op::Stop(self.worker));
        Ok(())
    }

    fn start(&self) -> Result<(), CounterError> {
        if !self.enabled.load(Ordering::Acquire) {
            return Err(CounterError::BadState("start on disabled counter"));
        }
        self.counting.store(true, Ordering::Release);
        self.log.push(Op::Start(self.worker));
        Ok(())
    }

    fn set_period_left(&self, events: u64) -> Result<(), CounterError> {
        if self.counting.load(Ordering::Acquire) {
            return Err(CounterError::BadState("set_period_left while counting"));
        }
        self.period_left.store(events, Ordering::Release);
        self.log.push(Op::SetPeriod(self.worker, events));
        Ok(())
    }

    fn read_total(&self) -> Result<u64, CounterError> {
        Ok(self.total.load(Ordering::Acquire))
    }
}

impl Drop for SimCounter {
    fn drop(&mut self) {
        self.log.push(Op::Release(self.worker));
    }
}

/// Simulated [`CounterProvider`]. Hands tests the concrete counters it
/// created (weakly, so release order stays observable) and can be told to
/// fail creation for a specific worker.
#[derive(Default)]
pub struct SimProvider {
    log: OpLog,
    counters: Mutex<HashMap<WorkerId, Weak<SimCounter>>>,
    fail_create_for: Mutex<Option<WorkerId>>,
}

impl SimProvider {
    pub fn new() -> SimProvider {
        SimProvider::default()
    }

    /// The concrete counter most recently created for `worker`, if alive.
    pub fn counter(&self, worker: WorkerId) -> Option<Arc<SimCounter>> {
        self.counters.lock().get(&worker).and_then(Weak::upgrade)
    }

    /// Make the next `create` for `worker` fail with `Unsupported`.
    pub fn fail_create_for(&self, worker: WorkerId) {
        *self.fail_create_for.lock() = Some(worker);
    }

    pub fn ops(&self) -> Vec<Op> {
        self.log.snapshot()
    }

    pub fn clear_ops(&self) {
        self.log.clear();
    }
}

impl CounterProvider for SimProvider {
    fn create(
        &self,
        worker: WorkerId,
        _core: CoreId,
        sample_period: u64,
        _event: EventId,
        overflow: OverflowHandler,
    ) -> Result<Arc<dyn BudgetCounter>, CounterError> {
        if *self.fail_create_for.lock() == Some(worker) {
            *self.fail_create_for.lock() = None;
            return Err(CounterError::Unsupported);
        }
        let counter = Arc::new(SimCounter::new(worker, sample_period, overflow, self.log.clone()));
        self.log.push(Op::Create(worker));
        self.counters.lock().insert(worker, Arc::downgrade(&counter));
        Ok(counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn provider_and_counter() -> (SimProvider, Arc<SimCounter>, Arc<AtomicUsize>) {
        let provider = SimProvider::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f2 = fired.clone();
        let _ = provider
            .create(
                1,
                1,
                100,
                EventId(0x17),
                Arc::new(move |_| {
                    f2.fetch_add(1, Ordering::AcqRel);
                }),
            )
            .unwrap();
        let sim = provider.counter(1).unwrap();
        (provider, sim, fired)
    }

    #[test]
    fn counts_only_while_enabled_and_started() {
        let (_p, c, _fired) = provider_and_counter();
        c.advance(10);
        assert_eq!(c.total(), 0);
        c.enable().unwrap();
        c.advance(10);
        assert_eq!(c.total(), 10);
        c.stop().unwrap();
        c.advance(10);
        assert_eq!(c.total(), 10);
    }

    #[test]
    fn one_overflow_per_period() {
        let (_p, c, fired) = provider_and_counter();
        c.enable().unwrap();
        c.advance(60);
        assert_eq!(fired.load(Ordering::Acquire), 0);
        c.advance(60);
        assert_eq!(fired.load(Ordering::Acquire), 1);
        // Further traffic accumulates without a second overflow.
        c.advance(500);
        assert_eq!(fired.load(Ordering::Acquire), 1);
        assert_eq!(c.total(), 620);

        // Reload re-arms the overflow.
        c.stop().unwrap();
        c.set_period_left(50).unwrap();
        c.start().unwrap();
        c.advance(50);
        assert_eq!(fired.load(Ordering::Acquire), 2);
    }

    #[test]
    fn set_period_rejected_while_counting() {
        let (_p, c, _fired) = provider_and_counter();
        c.enable().unwrap();
        assert!(matches!(
            c.set_period_left(10),
            Err(CounterError::BadState(_))
        ));
        c.stop().unwrap();
        assert!(c.set_period_left(10).is_ok());
    }

    #[test]
    fn create_failure_injection() {
        let p = SimProvider::new();
        p.fail_create_for(2);
        assert!(p
            .create(2, 2, 10, EventId(0), Arc::new(|_| {}))
            .is_err());
        // Only the requested worker fails, and only once.
        assert!(p.create(2, 2, 10, EventId(0), Arc::new(|_| {})).is_ok());
    }

    #[test]
    fn release_recorded_on_drop() {
        let p = SimProvider::new();
        let c = p.create(3, 3, 10, EventId(0), Arc::new(|_| {})).unwrap();
        drop(c);
        let ops = p.ops();
        assert_eq!(ops, vec![Op::Create(3), Op::Release(3)]);
    }
}
