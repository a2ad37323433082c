//! Probability adjustment policy.

/// Computes a corrective probability from the target QPS, the measured QPS
/// and the probability currently in effect.
pub trait ProbabilityCalculator: Send + Sync {
    fn calculate(&self, target_qps: f64, cur_qps: f64, old_probability: f64) -> f64;
}

/// Scales the probability proportionally to `target_qps / cur_qps`, capping
/// the per-round change in both directions so a single noisy measurement
/// cannot swing the probability by more than a factor of `1 + cap`.
///
/// With the default cap of `1.0` a probability can at most double or halve
/// per round.
#[derive(Debug, Clone, Copy)]
pub struct PercentageIncreaseCappedCalculator {
    cap: f64,
}

impl PercentageIncreaseCappedCalculator {
    pub fn new(cap: f64) -> Self {
        Self { cap }
    }
}

impl ProbabilityCalculator for PercentageIncreaseCappedCalculator {
    fn calculate(&self, target_qps: f64, cur_qps: f64, old_probability: f64) -> f64 {
        let factor = target_qps / cur_qps;
        let max_factor = 1.0 + self.cap;
        old_probability * factor.clamp(1.0 / max_factor, max_factor)
    }
}
