//! Galactic predictive scheduling
//!
//! Each strand may carry a `GalacticExecStats` record tracking four
//! quantities as Galactic values: the primal holds the latest measurement
//! and the x tangent holds an exponentially-weighted derivative
//! (`tangent := (1 - alpha) * tangent + alpha * (new - old)`). Prediction
//! is first-order: `primal + tangent * horizon`.
//!
//! Priority moves by gradient descent: when the predicted execution time
//! misses the target by more than the tolerance, a step accumulates into
//! `priority_delta_accum`; once the accumulator reaches a whole unit and
//! the cooldown has elapsed, the integer priority adjusts by the rounded
//! value. The learning rate adapts against prediction accuracy and stays
//! clamped to its band.

use seraph_core::{Galactic, Scalar};

/// Q64.64 fraction `num / den` without going through floating point.
fn frac(num: u64, den: u64) -> Scalar {
    Scalar::from_bits(((num as u128) << 64) / den as u128)
}

/// Default smoothing factor: 0.1.
fn default_alpha() -> Scalar {
    frac(1, 10)
}

/// Learning-rate clamp band.
fn eta_min() -> Scalar {
    frac(1, 1000)
}

fn eta_max() -> Scalar {
    frac(1, 2)
}

/// Ticks between priority adjustments.
pub const PRIORITY_COOLDOWN_TICKS: u64 = 100;

/// Accuracy thresholds, in percent.
const ACCURACY_LOW: u64 = 60;
const ACCURACY_HIGH: u64 = 90;

#[derive(Debug, Clone)]
pub struct GalacticExecStats {
    /// Execution time per quantum: primal measured, x tangent smoothed.
    pub exec_time: Galactic,
    pub cpu_usage: Galactic,
    pub wait_time: Galactic,
    pub response_time: Galactic,

    pub alpha: Scalar,
    pub learning_rate: Scalar,
    /// Target execution time the gradient chases.
    pub target_exec: Scalar,
    pub priority_delta_accum: Scalar,
    pub last_priority_change_tick: u64,

    predictions_made: u64,
    predictions_accurate: u64,
    /// Prediction for the next quantum, scored when it arrives.
    pending_prediction: Option<Scalar>,
}

impl GalacticExecStats {
    pub fn new(target_exec: Scalar) -> Self {
        GalacticExecStats {
            exec_time: Galactic::ZERO,
            cpu_usage: Galactic::ZERO,
            wait_time: Galactic::ZERO,
            response_time: Galactic::ZERO,
            alpha: default_alpha(),
            learning_rate: frac(1, 10),
            target_exec,
            priority_delta_accum: Scalar::ZERO,
            last_priority_change_tick: 0,
            predictions_made: 0,
            predictions_accurate: 0,
            pending_prediction: None,
        }
    }

    /// Tolerance: 20% of the target.
    fn tolerance(&self) -> Scalar {
        self.target_exec.mul(frac(1, 5)).abs()
    }

    /// EMA update of one tracked quantity.
    fn track(value: &mut Galactic, alpha: Scalar, measured: Scalar) {
        let old = value.w;
        let delta = measured.sub(old);
        let one_minus = Scalar::ONE.sub(alpha);
        value.x = one_minus.mul(value.x).add(alpha.mul(delta));
        value.w = measured;
    }

    /// Record a completed quantum. Scores the previous prediction, then
    /// updates the four tracked quantities.
    pub fn record_quantum(
        &mut self,
        exec: Scalar,
        cpu: Scalar,
        wait: Scalar,
        response: Scalar,
    ) {
        if let Some(predicted) = self.pending_prediction.take() {
            self.predictions_made += 1;
            if predicted.sub(exec).abs().lt(self.tolerance()).to_bool() == Some(true) {
                self.predictions_accurate += 1;
            }
        }
        Self::track(&mut self.exec_time, self.alpha, exec);
        Self::track(&mut self.cpu_usage, self.alpha, cpu);
        Self::track(&mut self.wait_time, self.alpha, wait);
        Self::track(&mut self.response_time, self.alpha, response);
    }

    /// First-order prediction of the next quantum's execution time, also
    /// remembered for accuracy scoring.
    pub fn predict_exec(&mut self, horizon: Scalar) -> Scalar {
        let predicted = self.exec_time.predict(horizon);
        self.pending_prediction = Some(predicted);
        predicted
    }

    /// Accuracy in percent; 100 when no predictions were scored yet.
    pub fn accuracy_percent(&self) -> u64 {
        if self.predictions_made == 0 {
            return 100;
        }
        self.predictions_accurate * 100 / self.predictions_made
    }

    /// One gradient step. Returns an integer priority delta when the
    /// accumulator crossed a whole unit and the cooldown allows a change.
    pub fn gradient_step(&mut self, horizon: Scalar, now_tick: u64) -> Option<i32> {
        let predicted = self.predict_exec(horizon);
        let error = predicted.sub(self.target_exec);
        if error.abs().lt(self.tolerance()).to_bool() != Some(false) {
            return None;
        }

        // -eta * error * sign(tangent)
        let tangent = self.exec_time.x;
        let sign = if tangent.is_negative() {
            Scalar::from_int(-1)
        } else {
            Scalar::ONE
        };
        let step = self.learning_rate.mul(error).mul(sign).neg();
        self.priority_delta_accum = self.priority_delta_accum.add(step);

        if self.priority_delta_accum.abs().lt(Scalar::ONE).to_bool() == Some(true) {
            return None;
        }
        if now_tick.saturating_sub(self.last_priority_change_tick) < PRIORITY_COOLDOWN_TICKS {
            return None;
        }
        // Round to the nearest integer and reset the accumulator.
        let half = frac(1, 2);
        let rounded = if self.priority_delta_accum.is_negative() {
            self.priority_delta_accum.sub(half).trunc()
        } else {
            self.priority_delta_accum.add(half).trunc()
        };
        self.priority_delta_accum = Scalar::ZERO;
        self.last_priority_change_tick = now_tick;
        Some(rounded as i32)
    }

    /// Raise the learning rate by 10% under poor accuracy, drop it by 10%
    /// under excellent accuracy; always clamp.
    pub fn adapt_learning_rate(&mut self) {
        let acc = self.accuracy_percent();
        if acc < ACCURACY_LOW {
            self.learning_rate = self.learning_rate.mul(frac(11, 10));
        } else if acc > ACCURACY_HIGH {
            self.learning_rate = self.learning_rate.mul(frac(9, 10));
        }
        if self.learning_rate.lt(eta_min()).to_bool() == Some(true) {
            self.learning_rate = eta_min();
        }
        if eta_max().lt(self.learning_rate).to_bool() == Some(true) {
            self.learning_rate = eta_max();
        }
    }

    /// A strand has converged when the tangent is flat, the accumulator is
    /// near empty, and predictions hold up.
    pub fn converged(&self) -> bool {
        self.exec_time.x.abs().lt(frac(1, 20)).to_bool() == Some(true)
            && self.priority_delta_accum.abs().lt(frac(1, 10)).to_bool() == Some(true)
            && self.accuracy_percent() > ACCURACY_HIGH
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: i64) -> Scalar {
        Scalar::from_int(v)
    }

    /// Q64.64 truncation makes exact decimal comparisons brittle; allow a
    /// thousandth of slack.
    fn close(a: Scalar, b: Scalar) -> bool {
        a.sub(b).abs().lt(frac(1, 1000)).to_bool() == Some(true)
    }

    #[test]
    fn tangent_follows_ema() {
        let mut stats = GalacticExecStats::new(s(10));
        stats.record_quantum(s(10), s(1), s(0), s(0));
        // First sample: old primal was 0, delta 10, tangent = 0.9*0 + 0.1*10 = 1
        assert_eq!(stats.exec_time.w, s(10));
        assert!(close(stats.exec_time.x, s(1)));
        // Steady input decays the tangent: 0.9*1 + 0.1*0 = 0.9
        stats.record_quantum(s(10), s(1), s(0), s(0));
        assert!(close(stats.exec_time.x, frac(9, 10)));
    }

    #[test]
    fn prediction_is_first_order() {
        let mut stats = GalacticExecStats::new(s(10));
        stats.exec_time = Galactic::new(s(10), s(2), Scalar::ZERO, Scalar::ZERO);
        assert_eq!(stats.predict_exec(s(3)), s(16));
    }

    #[test]
    fn accuracy_scores_pending_predictions() {
        let mut stats = GalacticExecStats::new(s(10));
        stats.exec_time = Galactic::new(s(10), Scalar::ZERO, Scalar::ZERO, Scalar::ZERO);
        // Predict 10, observe 10: accurate (tolerance is 2).
        stats.predict_exec(s(1));
        stats.record_quantum(s(10), s(0), s(0), s(0));
        assert_eq!(stats.accuracy_percent(), 100);
        // Predict ~10, observe 50: inaccurate.
        stats.predict_exec(s(1));
        stats.record_quantum(s(50), s(0), s(0), s(0));
        assert_eq!(stats.accuracy_percent(), 50);
    }

    #[test]
    fn within_tolerance_takes_no_step() {
        let mut stats = GalacticExecStats::new(s(10));
        stats.exec_time = Galactic::new(s(10), s(1), Scalar::ZERO, Scalar::ZERO);
        // predicted = 10 + 1*0 = 10 = target
        assert_eq!(stats.gradient_step(Scalar::ZERO, 1000), None);
        assert_eq!(stats.priority_delta_accum, Scalar::ZERO);
    }

    #[test]
    fn gradient_accumulates_then_steps() {
        let mut stats = GalacticExecStats::new(s(10));
        stats.learning_rate = frac(1, 2);
        stats.exec_time = Galactic::new(s(30), s(1), Scalar::ZERO, Scalar::ZERO);
        // predicted = 30, error = 20, step = -0.5*20 = -10: crosses 1
        // immediately, but the cooldown starts satisfied (tick 1000).
        let delta = stats.gradient_step(Scalar::ZERO, 1000);
        assert_eq!(delta, Some(-10));
        assert_eq!(stats.priority_delta_accum, Scalar::ZERO);
        assert_eq!(stats.last_priority_change_tick, 1000);
    }

    #[test]
    fn cooldown_blocks_consecutive_changes() {
        let mut stats = GalacticExecStats::new(s(10));
        stats.learning_rate = frac(1, 2);
        stats.exec_time = Galactic::new(s(30), s(1), Scalar::ZERO, Scalar::ZERO);
        assert!(stats.gradient_step(Scalar::ZERO, 1000).is_some());
        // 50 ticks later: accumulates again but the cooldown refuses.
        assert_eq!(stats.gradient_step(Scalar::ZERO, 1050), None);
        // Past the cooldown it fires.
        assert!(stats.gradient_step(Scalar::ZERO, 1100).is_some());
    }

    #[test]
    fn learning_rate_adapts_and_clamps() {
        let mut stats = GalacticExecStats::new(s(10));
        stats.learning_rate = frac(1, 10);
        // Force poor accuracy.
        stats.predictions_made = 10;
        stats.predictions_accurate = 1;
        stats.adapt_learning_rate();
        assert_eq!(stats.learning_rate, frac(1, 10).mul(frac(11, 10)));

        // Excellent accuracy decays it.
        stats.predictions_accurate = 10;
        let before = stats.learning_rate;
        stats.adapt_learning_rate();
        assert_eq!(stats.learning_rate, before.mul(frac(9, 10)));

        // Clamp floor.
        stats.learning_rate = frac(1, 10_000);
        stats.predictions_accurate = 10;
        stats.adapt_learning_rate();
        assert_eq!(stats.learning_rate, eta_min());
    }

    #[test]
    fn convergence_predicate() {
        let mut stats = GalacticExecStats::new(s(10));
        stats.exec_time = Galactic::new(s(10), frac(1, 100), Scalar::ZERO, Scalar::ZERO);
        stats.priority_delta_accum = frac(1, 100);
        stats.predictions_made = 20;
        stats.predictions_accurate = 19;
        assert!(stats.converged());

        stats.exec_time.x = s(1); // steep tangent
        assert!(!stats.converged());
    }
}
