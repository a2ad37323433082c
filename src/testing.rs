//! In-memory store and lock fakes for driving the processor in tests.
//!
//! Both fakes are scriptable from the outside while the processor loops run,
//! so tests can stage throughput, flip lock ownership and inspect persisted
//! probabilities without a real backend.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;

use crate::lock::{DistributedLock, LockError};
use crate::store::{
    SamplingStore, ServiceOperationProbabilities, ServiceOperationQPS, StoreError, Throughput,
};

/// Builds a throughput row, formatting the given probabilities the way
/// upstream samplers stamp them into the store.
pub fn throughput(service: &str, operation: &str, count: i64, probabilities: &[f64]) -> Throughput {
    Throughput {
        service: service.to_string(),
        operation: operation.to_string(),
        count,
        probabilities: probabilities.iter().map(|p| format!("{p:.4}")).collect(),
    }
}

/// One persisted `(hostname, probabilities, qps)` triple.
#[derive(Debug, Clone)]
pub struct InsertedProbabilities {
    pub hostname: String,
    pub probabilities: ServiceOperationProbabilities,
    pub qps: ServiceOperationQPS,
}

#[derive(Default)]
struct StoreInner {
    throughput: VecDeque<Vec<Throughput>>,
    latest_probabilities: ServiceOperationProbabilities,
    inserts: Vec<InsertedProbabilities>,
}

/// Scriptable in-memory [`SamplingStore`].
///
/// `get_throughput` pops one staged batch per call and returns an empty batch
/// once the queue is drained.
#[derive(Default)]
pub struct InMemorySamplingStore {
    inner: Mutex<StoreInner>,
    fail_throughput: AtomicBool,
    fail_probabilities: AtomicBool,
    throughput_calls: AtomicUsize,
}

impl InMemorySamplingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Stages one `get_throughput` response batch.
    pub fn push_throughput(&self, rows: Vec<Throughput>) {
        self.inner.lock().unwrap().throughput.push_back(rows);
    }

    pub fn set_latest_probabilities(&self, probabilities: ServiceOperationProbabilities) {
        self.inner.lock().unwrap().latest_probabilities = probabilities;
    }

    /// Makes subsequent `get_throughput` calls fail.
    pub fn set_fail_throughput(&self, fail: bool) {
        self.fail_throughput.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent `get_latest_probabilities` calls fail.
    pub fn set_fail_probabilities(&self, fail: bool) {
        self.fail_probabilities.store(fail, Ordering::SeqCst);
    }

    /// Everything persisted through `insert_probabilities_and_qps`, oldest
    /// first.
    pub fn inserts(&self) -> Vec<InsertedProbabilities> {
        self.inner.lock().unwrap().inserts.clone()
    }

    pub fn throughput_calls(&self) -> usize {
        self.throughput_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SamplingStore for InMemorySamplingStore {
    async fn get_throughput(
        &self,
        _start: SystemTime,
        _end: SystemTime,
    ) -> Result<Vec<Throughput>, StoreError> {
        self.throughput_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_throughput.load(Ordering::SeqCst) {
            return Err("throughput read failed".into());
        }
        Ok(self
            .inner
            .lock()
            .unwrap()
            .throughput
            .pop_front()
            .unwrap_or_default())
    }

    async fn get_latest_probabilities(
        &self,
    ) -> Result<ServiceOperationProbabilities, StoreError> {
        if self.fail_probabilities.load(Ordering::SeqCst) {
            return Err("probabilities read failed".into());
        }
        Ok(self.inner.lock().unwrap().latest_probabilities.clone())
    }

    async fn insert_probabilities_and_qps(
        &self,
        hostname: &str,
        probabilities: ServiceOperationProbabilities,
        qps: ServiceOperationQPS,
    ) -> Result<(), StoreError> {
        self.inner.lock().unwrap().inserts.push(InsertedProbabilities {
            hostname: hostname.to_string(),
            probabilities,
            qps,
        });
        Ok(())
    }
}

/// A [`DistributedLock`] whose outcome is set by the test.
///
/// Each processor under test gets its own instance; flipping `set_acquired`
/// models the lease moving between hosts.
#[derive(Default)]
pub struct StaticLock {
    acquired: AtomicBool,
    fail: AtomicBool,
}

impl StaticLock {
    pub fn new(acquired: bool) -> Arc<Self> {
        Arc::new(Self {
            acquired: AtomicBool::new(acquired),
            fail: AtomicBool::new(false),
        })
    }

    pub fn set_acquired(&self, acquired: bool) {
        self.acquired.store(acquired, Ordering::SeqCst);
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DistributedLock for StaticLock {
    async fn acquire(&self, _name: &str) -> Result<bool, LockError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err("lock backend unavailable".into());
        }
        Ok(self.acquired.load(Ordering::SeqCst))
    }
}
