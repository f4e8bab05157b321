//! The deferred overflow path.
//!
//! Counter backends call [`overflow_work`] from their deferred context (the
//! Linux backend's per-counter watcher thread) when a worker's budget is
//! exhausted. The work item stalls the identified worker and wakes its
//! throttler. The worker id is threaded explicitly through the callback; the
//! current-core checks are diagnostics for miswired backends.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{error, trace, warn};

use crate::rt;
use crate::worker::WorkerShared;
use crate::{CoreId, OverflowHandler, WorkerId};

/// Build the overflow handler shared by all of a regulator's counters.
pub fn make_handler(
    shareds: Vec<Arc<WorkerShared>>,
    coordinator_core: CoreId,
) -> OverflowHandler {
    Arc::new(move |worker| overflow_work(&shareds, coordinator_core, worker))
}

/// Throttle `worker` in response to a counter overflow.
///
/// An out-of-range worker id is refused; an unexpected current core is only
/// logged, since test backends invoke the handler from unpinned threads.
pub fn overflow_work(shareds: &[Arc<WorkerShared>], coordinator_core: CoreId, worker: WorkerId) {
    if worker == 0 || worker as usize > shareds.len() {
        error!("overflow work for unknown worker {}", worker);
        return;
    }
    let shared = &shareds[worker as usize - 1];

    if let Some(core) = rt::current_core() {
        if core == coordinator_core {
            warn!(
                "overflow work for worker {} executing on coordinator core {}",
                worker, coordinator_core
            );
        } else if core != shared.core {
            trace!(
                "overflow work for worker {} on core {} (expected {})",
                worker,
                core,
                shared.core
            );
        }
    }

    if shared.throttled.swap(true, Ordering::AcqRel) {
        // Already stalled; a second overflow in the same interval is possible
        // only if the reload raced us, and is harmless.
        trace!("worker {} already throttled", worker);
        return;
    }
    trace!("worker {}: budget exhausted, throttling", worker);
    shared.throttle_wake.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttles_the_identified_worker() {
        let shareds = vec![WorkerShared::new(1, 1), WorkerShared::new(2, 2)];
        overflow_work(&shareds, 0, 2);
        assert!(!shareds[0].throttled.load(Ordering::Acquire));
        assert!(shareds[1].throttled.load(Ordering::Acquire));
    }

    #[test]
    fn refuses_out_of_range_ids() {
        let shareds = vec![WorkerShared::new(1, 1)];
        overflow_work(&shareds, 0, 0);
        overflow_work(&shareds, 0, 9);
        assert!(!shareds[0].throttled.load(Ordering::Acquire));
    }

    #[test]
    fn handler_routes_by_worker_id() {
        let shareds = vec![WorkerShared::new(1, 1), WorkerShared::new(2, 2)];
        let handler = make_handler(shareds.clone(), 0);
        handler(1);
        assert!(shareds[0].throttled.load(Ordering::Acquire));
        assert!(!shareds[1].throttled.load(Ordering::Acquire));
    }
}
