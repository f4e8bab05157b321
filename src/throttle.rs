//! The throttler task: one FIFO-priority thread per worker, pinned to that
//! worker's core.
//!
//! While its worker's throttle flag is set, the task busy-waits at top
//! scheduling priority. Its mere presence starves application code on the
//! core, which suppresses new LLC-miss traffic until the next regulation
//! interval clears the flag.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{info, trace, warn};

use crate::rt;
use crate::worker::WorkerShared;
use crate::CoreId;

/// Owning handle for a throttler thread. Joining requires the shutdown flag
/// to be set and the wake-queue notified first.
pub struct Throttler {
    handle: JoinHandle<()>,
}

impl Throttler {
    /// Spawn the throttler for `shared`, pinned to `core`.
    pub fn spawn(shared: Arc<WorkerShared>, core: CoreId) -> std::io::Result<Throttler> {
        let handle = thread::Builder::new()
            .name(format!("throttler/{}", shared.id))
            .spawn(move || throttler_main(shared, core))?;
        Ok(Throttler { handle })
    }

    /// Wake the task out of its wait and join it. The caller must have set
    /// `shared.shutdown` beforehand.
    pub fn join(self, shared: &WorkerShared) {
        shared.throttle_wake.notify_all();
        if self.handle.join().is_err() {
            warn!("throttler/{} panicked", shared.id);
        }
    }
}

fn throttler_main(shared: Arc<WorkerShared>, core: CoreId) {
    if let Err(e) = rt::pin_to_core(core) {
        warn!("throttler/{}: could not pin to core {}: {}", shared.id, core, e);
    }
    if let Err(e) = rt::set_fifo_priority(rt::THROTTLER_PRIORITY) {
        // Without CAP_SYS_NICE the spin still works, it just competes with
        // the regulated load instead of starving it.
        warn!("throttler/{}: no FIFO priority: {}", shared.id, e);
    }
    info!("throttler/{}: running on core {}", shared.id, core);

    loop {
        shared.throttle_wake.wait_until(|| {
            shared.throttled.load(Ordering::Acquire) || shared.shutdown.load(Ordering::Acquire)
        });
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        trace!("throttler/{}: stalling core {}", shared.id, core);
        shared.throttle_episodes.fetch_add(1, Ordering::Relaxed);
        while shared.throttled.load(Ordering::Acquire) && !shared.shutdown.load(Ordering::Acquire) {
            fence(Ordering::SeqCst);
            std::hint::spin_loop();
        }
    }

    info!("throttler/{}: exit", shared.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn spins_while_throttled_and_exits_on_shutdown() {
        let shared = WorkerShared::new(1, 0);
        let t = Throttler::spawn(shared.clone(), 0).expect("Could not spawn throttler");

        shared.publish_throttle(true);
        // The episode counter proves the busy-wait executed.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while shared.throttle_episodes.load(Ordering::Relaxed) == 0 {
            assert!(std::time::Instant::now() < deadline, "throttler never woke");
            thread::yield_now();
        }

        shared.publish_throttle(false);
        shared.shutdown.store(true, Ordering::Release);
        t.join(&shared);
    }

    #[test]
    fn parked_task_joins_without_throttle() {
        let shared = WorkerShared::new(2, 0);
        let t = Throttler::spawn(shared.clone(), 0).expect("Could not spawn throttler");
        thread::sleep(Duration::from_millis(5));
        shared.shutdown.store(true, Ordering::Release);
        t.join(&shared);
        assert_eq!(shared.throttle_episodes.load(Ordering::Relaxed), 0);
    }
}
