//! Distributed lock contract used for leader election.

use async_trait::async_trait;

/// Error type surfaced by lock implementations.
pub type LockError = Box<dyn std::error::Error + Send + Sync>;

/// Lease-based mutual exclusion across the collector fleet.
///
/// Implementations must guarantee that at most one host holds the named
/// lease at a time, for a lease duration at least as long as the leader
/// refresh cadence.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Attempts to acquire or refresh the named lease. Returns `true` when
    /// this host holds the lease after the call.
    async fn acquire(&self, name: &str) -> Result<bool, LockError>;
}
