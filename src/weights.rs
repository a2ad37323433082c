//! Memoized recency weights for the throughput ring.

use std::collections::HashMap;

/// Base of the exponential decay applied to older buckets.
const DECAY_BASE: f64 = 2.0;

/// Caches normalized exponential-decay weight vectors by length.
///
/// For a vector of length `n`, index 0 (the most recent bucket) carries the
/// largest weight, weights never increase with age, and the vector sums
/// to 1. Vectors are immutable once computed.
#[derive(Debug, Default)]
pub struct WeightsCache {
    cache: HashMap<usize, Vec<f64>>,
}

impl WeightsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the weight vector for `length` QPS samples, computing and
    /// memoizing it on first use.
    pub fn weights(&mut self, length: usize) -> &[f64] {
        self.cache
            .entry(length)
            .or_insert_with(|| compute_weights(length))
    }
}

fn compute_weights(length: usize) -> Vec<f64> {
    let mut weights: Vec<f64> = (0..length).map(|i| DECAY_BASE.powi(-(i as i32))).collect();
    let sum: f64 = weights.iter().sum();
    for weight in &mut weights {
        *weight /= sum;
    }
    weights
}
