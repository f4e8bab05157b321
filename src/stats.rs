//! Sliding-window utilization statistics, one window per worker.
//!
//! The coordinator records each interval's measured bandwidth; readers take
//! cheap snapshots for the status surface. The window length follows the
//! `sliding_window_size` parameter and is applied on the next record.

use parking_lot::Mutex;

use crate::config::MAX_WINDOW;
use crate::WorkerId;

#[derive(Debug, Clone)]
struct Window {
    samples: Vec<u64>,
    idx: usize,
    avg_mb: u64,
}

impl Window {
    fn with_seed(seed_mb: u64) -> Window {
        Window {
            samples: vec![seed_mb],
            idx: 1,
            avg_mb: seed_mb,
        }
    }

    fn record(&mut self, used_mb: u64, window: usize) {
        // Shrink immediately on a smaller window; grow by appending.
        if self.samples.len() > window {
            self.samples.truncate(window);
            self.idx %= window;
        }
        if self.samples.len() < window {
            self.samples.push(used_mb);
            self.idx = self.samples.len() % window;
        } else {
            self.samples[self.idx] = used_mb;
            self.idx = (self.idx + 1) % window;
        }
        let sum: u64 = self.samples.iter().sum();
        self.avg_mb = sum / self.samples.len() as u64;
    }
}

/// Per-worker utilization windows.
#[derive(Debug)]
pub struct Stats {
    windows: Mutex<Vec<Window>>,
}

impl Stats {
    /// One window per worker, each seeded with the worker's initial setpoint
    /// so the average is meaningful before regulation has history.
    pub fn new(setpoints_mb: &[u64]) -> Stats {
        Stats {
            windows: Mutex::new(setpoints_mb.iter().map(|&s| Window::with_seed(s)).collect()),
        }
    }

    /// Record one interval's measured bandwidth for `worker`.
    pub fn record(&self, worker: WorkerId, used_mb: u64, window_size: u32) {
        let window = window_size.clamp(1, MAX_WINDOW) as usize;
        let mut windows = self.windows.lock();
        if let Some(w) = windows.get_mut(worker as usize - 1) {
            w.record(used_mb, window);
        }
    }

    /// Sliding-window average bandwidth for `worker`, in MB/s.
    pub fn average_mb(&self, worker: WorkerId) -> Option<u64> {
        self.windows
            .lock()
            .get(worker as usize - 1)
            .map(|w| w.avg_mb)
    }
}
