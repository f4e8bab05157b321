//! The PID budget controller, the predecessor of the NLMS predictor.
//!
//! Regulates each worker's measured bandwidth toward its setpoint instead of
//! predicting demand. Gains are carried as inverse integer divisors; the
//! integral term runs over a sliding window of the last `TI` errors, kept in
//! a small FIFO, so a long disturbance cannot wind the sum up without bound.

use std::collections::VecDeque;

use log::trace;

/// Kp = 1/9
const KP_INV: i64 = 9;
/// Ki = 1/50, over the integral window
const KI_INV: i64 = 50;
/// Kd = 1
const KD_INV: i64 = 1;
/// Integral window length, in regulation intervals.
const TI: usize = 30;
/// Derivative horizon.
const TD: i64 = 30;

/// Per-worker PID state.
#[derive(Debug, Clone, Default)]
pub struct PidController {
    errors: VecDeque<i64>,
    sum_of_err: i64,
}

impl PidController {
    pub fn new() -> PidController {
        PidController {
            errors: VecDeque::with_capacity(TI + 1),
            sum_of_err: 0,
        }
    }

    /// Budget correction in MB/s for the observed `error_mb`
    /// (setpoint minus measured average).
    pub fn correction(&mut self, error_mb: i64) -> i64 {
        self.errors.push_back(error_mb);
        let removed = if self.errors.len() > TI {
            self.errors.pop_front().unwrap_or(0)
        } else {
            0
        };
        self.sum_of_err = self.sum_of_err + error_mb - removed;

        let p = error_mb / KP_INV;
        let i = self.sum_of_err / (TI as i64 * KI_INV);
        let d = (error_mb - removed) / (TD * KD_INV);
        let out = p + i + d;
        trace!("pid: e={} P={} I={} D={} out={}", error_mb, p, i, d, out);
        out
    }

    /// Drop accumulated state, e.g. when regulation restarts.
    pub fn reset(&mut self) {
        self.errors.clear();
        self.sum_of_err = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proportional_term_dominates_first_sample() {
        let mut pid = PidController::new();
        // P = 900/9 = 100, I = 900/1500 = 0, D = 900/30 = 30.
        assert_eq!(pid.correction(900), 130);
    }

    #[test]
    fn correction_sign_follows_error() {
        let mut pid = PidController::new();
        assert!(pid.correction(1800) > 0);
        let mut pid = PidController::new();
        assert!(pid.correction(-1800) < 0);
        let mut pid = PidController::new();
        assert_eq!(pid.correction(0), 0);
    }

    #[test]
    fn integral_term_accumulates_persistent_error() {
        let mut pid = PidController::new();
        let first = pid.correction(450);
        let mut last = first;
        for _ in 0..TI - 1 {
            last = pid.correction(450);
        }
        // Same error, larger output, purely from the integral term.
        assert!(last > first);
    }

    #[test]
    fn integral_window_is_bounded() {
        let mut pid = PidController::new();
        for _ in 0..10 * TI {
            pid.correction(300);
        }
        // Window full: sum is capped at TI * error.
        assert_eq!(pid.sum_of_err, TI as i64 * 300);
        // And a settled error keeps the output constant.
        let a = pid.correction(300);
        let b = pid.correction(300);
        assert_eq!(a, b);
    }

    #[test]
    fn reset_clears_accumulated_state() {
        let mut pid = PidController::new();
        for _ in 0..TI {
            pid.correction(500);
        }
        pid.reset();
        assert_eq!(pid.correction(900), 130);
    }
}
