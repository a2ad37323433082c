//! Processor configuration.
//!
//! `ProcessorConfig` is validated once at construction; the only values that
//! may change afterwards live in [`MutableConfig`], which the calculation
//! loop re-reads on every round.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors reported when a [`ProcessorConfig`] fails validation.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("CalculationInterval must be less than LookbackInterval")]
    Intervals,

    #[error("CalculationInterval and LookbackInterval must be greater than 0")]
    NonZeroIntervals,

    #[error("FollowerLeaseRefreshInterval cannot be less than LeaderLeaseRefreshInterval")]
    LockIntervals,

    #[error("LookbackQPSCount cannot be less than 1")]
    LookbackQpsCount,
}

/// Runtime-adjustable sampling targets.
///
/// Values are stored as `f64` bit patterns in atomics so the calculation loop
/// can read them per operation without taking a lock.
#[derive(Debug)]
pub struct MutableConfig {
    target_qps: AtomicU64,
    qps_equivalence_threshold: AtomicU64,
}

impl MutableConfig {
    pub fn new(target_qps: f64, qps_equivalence_threshold: f64) -> Self {
        Self {
            target_qps: AtomicU64::new(target_qps.to_bits()),
            qps_equivalence_threshold: AtomicU64::new(qps_equivalence_threshold.to_bits()),
        }
    }

    /// Desired sampled-spans-per-second for every operation.
    pub fn target_qps(&self) -> f64 {
        f64::from_bits(self.target_qps.load(Ordering::Relaxed))
    }

    pub fn set_target_qps(&self, target_qps: f64) {
        self.target_qps.store(target_qps.to_bits(), Ordering::Relaxed);
    }

    /// Measured QPS within this distance of the target is left alone.
    pub fn qps_equivalence_threshold(&self) -> f64 {
        f64::from_bits(self.qps_equivalence_threshold.load(Ordering::Relaxed))
    }

    pub fn set_qps_equivalence_threshold(&self, threshold: f64) {
        self.qps_equivalence_threshold
            .store(threshold.to_bits(), Ordering::Relaxed);
    }
}

impl Default for MutableConfig {
    fn default() -> Self {
        Self::new(1.0, 0.3)
    }
}

/// Static configuration for the sampling processor.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Tick period of the calculation loop.
    pub calculation_interval: Duration,

    /// Total amount of throughput history kept in memory. Determines the ring
    /// size as `lookback_interval / calculation_interval` buckets.
    pub lookback_interval: Duration,

    /// Maximum number of buckets fed into the weighted QPS per operation.
    pub lookback_qps_count: usize,

    /// Grace period subtracted from `now` on throughput queries, so spans
    /// that arrive late into the store are still counted.
    pub delay: Duration,

    /// Lock retry cadence while this host holds the leader lease.
    pub leader_lease_refresh_interval: Duration,

    /// Lock retry cadence while this host is a follower.
    pub follower_lease_refresh_interval: Duration,

    /// Lower clamp applied to every calculated probability.
    pub min_sampling_probability: f64,

    /// Probability assigned to operations seen for the first time, and echoed
    /// in default strategy responses.
    pub default_sampling_probability: f64,

    /// Service-wide lower bound echoed into strategy responses.
    pub lower_bound_traces_per_second: f64,

    /// Runtime-adjustable targets, read per operation per round.
    pub mutable: Arc<MutableConfig>,
}

impl ProcessorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lookback_interval < self.calculation_interval {
            return Err(ConfigError::Intervals);
        }
        if self.calculation_interval.is_zero() || self.lookback_interval.is_zero() {
            return Err(ConfigError::NonZeroIntervals);
        }
        if self.follower_lease_refresh_interval < self.leader_lease_refresh_interval {
            return Err(ConfigError::LockIntervals);
        }
        if self.lookback_qps_count < 1 {
            return Err(ConfigError::LookbackQpsCount);
        }
        Ok(())
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            calculation_interval: Duration::from_secs(60),
            lookback_interval: Duration::from_secs(600),
            lookback_qps_count: 5,
            delay: Duration::from_secs(120),
            leader_lease_refresh_interval: Duration::from_secs(5),
            follower_lease_refresh_interval: Duration::from_secs(60),
            min_sampling_probability: 1e-5,
            default_sampling_probability: 0.001,
            lower_bound_traces_per_second: 1.0 / 60.0,
            mutable: Arc::new(MutableConfig::default()),
        }
    }
}
