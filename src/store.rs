//! Contract for the throughput/probability store consumed by the processor.
//!
//! The store is an external collaborator (Cassandra, Postgres, ...); the
//! processor only depends on this trait and tolerates any of its calls
//! failing.

use std::collections::{HashMap, HashSet};
use std::time::SystemTime;

use async_trait::async_trait;

/// Error type surfaced by store implementations.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Sampled-span throughput for one `(service, operation)` pair over a time
/// range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Throughput {
    pub service: String,
    pub operation: String,
    pub count: i64,

    /// Sampling probabilities observed in-band while these spans were
    /// collected, as decimal strings with four digits after the point
    /// (e.g. `"0.0010"`). Used to detect whether the upstream sampler honors
    /// the adaptive rate.
    pub probabilities: HashSet<String>,
}

/// `service -> operation -> probability` as persisted by the leader.
pub type ServiceOperationProbabilities = HashMap<String, HashMap<String, f64>>;

/// `service -> operation -> weighted QPS` matching the probabilities entry.
pub type ServiceOperationQPS = HashMap<String, HashMap<String, f64>>;

/// Persistence layer for throughput observations and calculated
/// probabilities.
#[async_trait]
pub trait SamplingStore: Send + Sync {
    /// Returns the throughput of all service operations in `[start, end)`.
    async fn get_throughput(
        &self,
        start: SystemTime,
        end: SystemTime,
    ) -> Result<Vec<Throughput>, StoreError>;

    /// Returns the most recently persisted sampling probabilities.
    async fn get_latest_probabilities(&self)
        -> Result<ServiceOperationProbabilities, StoreError>;

    /// Upserts the calculated probabilities and QPS, keyed by hostname.
    async fn insert_probabilities_and_qps(
        &self,
        hostname: &str,
        probabilities: ServiceOperationProbabilities,
        qps: ServiceOperationQPS,
    ) -> Result<(), StoreError>;
}
