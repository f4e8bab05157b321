//! Online demand predictor: a length-H linear model over the recent history
//! ring, trained by normalized least-mean-squares.
//!
//! Weights are Q16 fixed-point (`1.0 == 1 << 16`) so the whole model runs in
//! integer arithmetic; no floating point is ever touched on the hot path.
//! The learning rate is carried as an inverse integer divisor, like the
//! original controller constants.

use log::debug;

use crate::config::HIST_SIZE;

/// Q16 scale shift.
const WEIGHT_SHIFT: u32 = 16;
/// Q16 representation of 1.0.
const WEIGHT_ONE: i64 = 1 << WEIGHT_SHIFT;

/// Default learning rate, expressed as its inverse (1e-6).
pub const DEFAULT_LRATE_INV: u64 = 1_000_000;

/// Round a Q16 accumulator to the nearest integer, ties away from zero.
fn round_q16(acc: i64) -> i64 {
    if acc >= 0 {
        (acc + (1 << (WEIGHT_SHIFT - 1))) >> WEIGHT_SHIFT
    } else {
        -((-acc + (1 << (WEIGHT_SHIFT - 1))) >> WEIGHT_SHIFT)
    }
}

/// Per-worker prediction model.
#[derive(Debug, Clone)]
pub struct Model {
    /// Q16 coefficients; `weights[0]` applies to the most recent sample.
    weights: [i64; HIST_SIZE],
    /// Inverse learning rate; larger means slower adaptation.
    lrate_inv: u64,
}

impl Default for Model {
    fn default() -> Model {
        Model::new()
    }
}

impl Model {
    pub fn new() -> Model {
        Model {
            weights: [WEIGHT_ONE / HIST_SIZE as i64; HIST_SIZE],
            lrate_inv: DEFAULT_LRATE_INV,
        }
    }

    /// Restore the uniform `1/H` initialization.
    pub fn reset_weights(&mut self) {
        self.weights = [WEIGHT_ONE / HIST_SIZE as i64; HIST_SIZE];
    }

    /// Divide the learning rate by `factor`.
    pub fn decrease_learning_rate(&mut self, factor: u64) {
        self.lrate_inv = self.lrate_inv.saturating_mul(factor.max(1));
        debug!("learning rate decreased to 1/{}", self.lrate_inv);
    }

    /// Restore the default learning rate.
    pub fn reset_learning_rate(&mut self) {
        self.lrate_inv = DEFAULT_LRATE_INV;
    }

    pub fn learning_rate_inv(&self) -> u64 {
        self.lrate_inv
    }

    /// Q16 weight snapshot, most-recent-sample coefficient first.
    pub fn weights_q16(&self) -> [i64; HIST_SIZE] {
        self.weights
    }

    #[cfg(test)]
    pub(crate) fn set_weights_q16(&mut self, weights: [i64; HIST_SIZE]) {
        self.weights = weights;
    }

    /// Next-interval demand estimate in MB/s, given the history ring and its
    /// write cursor `ri` (position of the most recent sample).
    ///
    /// `weights[0]` multiplies `hist[ri]`, `weights[1]` the sample before it,
    /// and so on backwards around the ring.
    pub fn predict(&self, hist: &[u64; HIST_SIZE], ri: usize) -> i64 {
        let mut acc: i64 = 0;
        for (k, &w) in self.weights.iter().enumerate() {
            let x = hist[(ri + HIST_SIZE - k) % HIST_SIZE] as i64;
            acc = acc.saturating_add(w.saturating_mul(x));
        }
        round_q16(acc)
    }

    /// NLMS weight update for the observed estimation error (MB/s).
    ///
    /// The norm is the scaled L2 of the history ring; an all-zero ring skips
    /// the update entirely (nothing to attribute the error to).
    pub fn update(&mut self, error_mb: i64, hist: &[u64; HIST_SIZE], ri: usize) {
        let mut norm2: u64 = 0;
        for &h in hist.iter() {
            norm2 += h.saturating_mul(h) >> WEIGHT_SHIFT;
        }
        if norm2 == 0 {
            return;
        }
        let sign: i64 = if error_mb < 0 { -1 } else { 1 };
        let magnitude = error_mb.unsigned_abs();
        for k in 0..HIST_SIZE {
            let x = hist[(ri + HIST_SIZE - k) % HIST_SIZE];
            let scaled = (magnitude.saturating_mul(x) / norm2).saturating_mul(WEIGHT_ONE as u64);
            let delta = (scaled / self.lrate_inv) as i64;
            self.weights[k] += sign * delta;
        }
    }
}
