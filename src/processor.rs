//! Adaptive sampling processor.
//!
//! Retrieves service throughput over a lookback window and calculates
//! per-operation sampling probabilities such that each operation is sampled
//! at a configured target QPS. Discrete buckets of operation throughput are
//! aggregated into a bounded ring, recency-weighted into a QPS estimate, and
//! fed through a capped adjustment policy.
//!
//! One processor runs per collector host. Leader election through a
//! distributed lock ensures only a single host calculates and persists
//! probabilities; all other hosts follow by refreshing their local cache
//! from the store.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime};

use rand::Rng;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::cache::{SamplingCache, SamplingCacheEntry};
use crate::calculation::{PercentageIncreaseCappedCalculator, ProbabilityCalculator};
use crate::config::{ConfigError, ProcessorConfig};
use crate::lock::DistributedLock;
use crate::metrics::ProcessorMetrics;
use crate::store::{
    SamplingStore, ServiceOperationProbabilities, ServiceOperationQPS, Throughput,
};
use crate::strategy::{
    OperationSamplingStrategy, PerOperationSamplingStrategies, ProbabilisticSamplingStrategy,
    SamplingStrategyResponse, SamplingStrategyType,
};
use crate::weights::WeightsCache;

const MAX_SAMPLING_PROBABILITY: f64 = 1.0;

/// Name of the lease contended for across the fleet.
const SAMPLING_LOCK: &str = "sampling_lock";

/// How often a follower refreshes its probabilities from the store.
const DEFAULT_FOLLOWER_PROBABILITY_INTERVAL: Duration = Duration::from_secs(20);

/// Number of past sampling-status snapshots the calculation loop keeps.
const SAMPLING_CACHE_SIZE: usize = 25;

type ServiceOperationThroughput = HashMap<String, HashMap<String, Throughput>>;

/// Aggregated throughput for one calculation interval.
#[derive(Debug, Clone)]
struct ThroughputBucket {
    throughput: ServiceOperationThroughput,
    interval: Duration,
    end_time: SystemTime,
}

#[derive(Default)]
struct SharedState {
    /// Latest calculated sampling probabilities for service operations.
    probabilities: ServiceOperationProbabilities,

    /// Weighted QPS matching each probabilities entry.
    qps: ServiceOperationQPS,

    /// Ring of aggregated throughput buckets, most recent at the head.
    throughputs: VecDeque<Arc<ThroughputBucket>>,

    /// Strategy responses for every service in `probabilities`.
    strategy_responses: HashMap<String, SamplingStrategyResponse>,
}

/// Calculates sampling probabilities per operation so that each operation is
/// sampled at the target QPS, and serves the resulting strategies.
///
/// Create with [`Processor::new`], wrap in an [`Arc`], then [`start`] the
/// periodic loops and [`stop`] them when shutting the collector down.
///
/// [`start`]: Processor::start
/// [`stop`]: Processor::stop
pub struct Processor {
    config: ProcessorConfig,
    hostname: String,
    store: Arc<dyn SamplingStore>,
    lock: Arc<dyn DistributedLock>,

    /// Whether this host currently holds the leader lease.
    is_leader: AtomicBool,

    /// Ring capacity: `lookback_interval / calculation_interval`.
    buckets: usize,

    state: RwLock<SharedState>,
    probability_calculator: Box<dyn ProbabilityCalculator>,
    follower_probability_interval: Duration,
    metrics: ProcessorMetrics,
    shutdown_tx: watch::Sender<bool>,
}

impl Processor {
    /// Creates a new sampling processor. Fails if the configuration is
    /// invalid.
    pub fn new(
        config: ProcessorConfig,
        hostname: impl Into<String>,
        store: Arc<dyn SamplingStore>,
        lock: Arc<dyn DistributedLock>,
        meter: &opentelemetry::metrics::Meter,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let buckets =
            (config.lookback_interval.as_nanos() / config.calculation_interval.as_nanos()) as usize;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            config,
            hostname: hostname.into(),
            store,
            lock,
            is_leader: AtomicBool::new(false),
            buckets,
            state: RwLock::new(SharedState::default()),
            probability_calculator: Box::new(PercentageIncreaseCappedCalculator::new(1.0)),
            follower_probability_interval: DEFAULT_FOLLOWER_PROBABILITY_INTERVAL,
            metrics: ProcessorMetrics::new(meter),
            shutdown_tx,
        })
    }

    /// Overrides how often a follower refreshes probabilities from the
    /// store. Defaults to 20 seconds.
    pub fn with_follower_probability_interval(mut self, interval: Duration) -> Self {
        self.follower_probability_interval = interval;
        self
    }

    /// Loads the latest persisted probabilities and launches the lock,
    /// calculation and follower-refresh loops.
    pub async fn start(self: Arc<Self>) {
        log::info!("starting sampling processor on {}", self.hostname);
        self.set_leader(false);
        self.load_probabilities().await;
        self.generate_strategy_responses();
        tokio::spawn(Arc::clone(&self).run_acquire_lock_loop(self.shutdown_tx.subscribe()));
        tokio::spawn(Arc::clone(&self).run_calculation_loop(self.shutdown_tx.subscribe()));
        tokio::spawn(Arc::clone(&self).run_update_probabilities_loop(self.shutdown_tx.subscribe()));
    }

    /// Signals all loops to terminate at their next suspension point. Does
    /// not wait for them.
    pub fn stop(&self) {
        log::info!("stopping sampling processor on {}", self.hostname);
        let _ = self.shutdown_tx.send(true);
    }

    /// Whether this host currently holds the leader lease.
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    fn set_leader(&self, is_leader: bool) {
        self.is_leader.store(is_leader, Ordering::Release);
    }

    /// Returns the cached sampling strategy for `service`, or a default
    /// response if the service has no calculated probabilities yet.
    pub fn get_sampling_strategy_response(&self, service: &str) -> SamplingStrategyResponse {
        let state = self.state.read().unwrap();
        if let Some(strategy) = state.strategy_responses.get(service) {
            return strategy.clone();
        }
        self.default_sampling_strategy_response()
    }

    async fn load_probabilities(&self) {
        let probabilities = match self.store.get_latest_probabilities().await {
            Ok(probabilities) => probabilities,
            Err(err) => {
                log::warn!("failed to initialize probabilities: {err}");
                return;
            }
        };
        let mut state = self.state.write().unwrap();
        state.probabilities = probabilities;
    }

    /// Contends for the leader lease. A healthy leader re-acquires on a short
    /// cadence so the lease never expires under it; followers retry on the
    /// longer cadence.
    async fn run_acquire_lock_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tokio::select! {
            _ = add_jitter(self.config.leader_lease_refresh_interval) => {}
            _ = shutdown.changed() => return,
        }
        loop {
            let retry_in = self.acquire_lock().await;
            tokio::select! {
                _ = tokio::time::sleep(retry_in) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Attempts one lock acquisition and returns the interval to sleep
    /// before the next attempt.
    async fn acquire_lock(&self) -> Duration {
        match self.lock.acquire(SAMPLING_LOCK).await {
            Ok(acquired) => {
                self.set_leader(acquired);
                if acquired {
                    // Re-acquire on a short cadence to retain the lease.
                    self.config.leader_lease_refresh_interval
                } else {
                    self.config.follower_lease_refresh_interval
                }
            }
            Err(err) => {
                // The flag keeps its last known value; retry on the longer
                // cadence.
                log::error!("failed to acquire sampling lock: {err}");
                self.config.follower_lease_refresh_interval
            }
        }
    }

    /// Refreshes the local probability cache from the store while this host
    /// is not the leader. The leader serves its own calculations instead.
    async fn run_update_probabilities_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tokio::select! {
            _ = add_jitter(self.follower_probability_interval) => {}
            _ = shutdown.changed() => return,
        }
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.follower_probability_interval,
            self.follower_probability_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.update_probabilities().await,
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn update_probabilities(&self) {
        if self.is_leader() {
            return;
        }
        let probabilities = match self.store.get_latest_probabilities().await {
            Ok(probabilities) => probabilities,
            Err(err) => {
                log::warn!("failed to refresh probabilities: {err}");
                return;
            }
        };
        // Leadership may have changed while the read was in flight; a fresh
        // leader owns the local state now.
        if self.is_leader() {
            return;
        }
        {
            let mut state = self.state.write().unwrap();
            state.probabilities = probabilities;
        }
        self.generate_strategy_responses();
    }

    /// Fetches and aggregates throughput every calculation interval, keeping
    /// the ring warm on every host. Probabilities are only recalculated and
    /// persisted while this host holds the leader lease.
    async fn run_calculation_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut last_checked = SystemTime::now() - self.config.delay;
        self.initialize_throughput(last_checked).await;

        // Status snapshots and memoized weights are only touched from this
        // task and need no locking.
        let mut weights_cache = WeightsCache::new();
        let mut sampling_cache: VecDeque<SamplingCache> = VecDeque::new();

        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.calculation_interval,
            self.config.calculation_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let calculated = self
                        .calculation_tick(&mut last_checked, &mut weights_cache, &mut sampling_cache)
                        .await;
                    if calculated {
                        // Persisting happens off the lock; if a later round
                        // lands before this write completes, at worst one
                        // snapshot is skipped.
                        let processor = Arc::clone(&self);
                        tokio::spawn(async move { processor.save_probabilities_and_qps().await });
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Runs one calculation tick. Returns `true` when a new probability set
    /// was published and should be persisted.
    async fn calculation_tick(
        &self,
        last_checked: &mut SystemTime,
        weights_cache: &mut WeightsCache,
        sampling_cache: &mut VecDeque<SamplingCache>,
    ) -> bool {
        let end_time = SystemTime::now() - self.config.delay;
        let start_time = *last_checked;
        let throughput = match self.store.get_throughput(start_time, end_time).await {
            Ok(throughput) => throughput,
            Err(err) => {
                // The window is retried on the next tick.
                log::error!("failed to get throughput from storage: {err}");
                return false;
            }
        };
        let interval = end_time.duration_since(start_time).unwrap_or_default();
        self.prepend_throughput_bucket(ThroughputBucket {
            throughput: aggregate_throughput(throughput),
            interval,
            end_time,
        });
        *last_checked = end_time;

        if !self.is_leader() {
            return false;
        }
        let started = Instant::now();
        let (probabilities, qps) =
            self.calculate_probabilities_and_qps(weights_cache, sampling_cache);
        {
            let mut state = self.state.write().unwrap();
            state.probabilities = probabilities;
            state.qps = qps;
        }
        self.generate_strategy_responses();
        self.metrics
            .calculate_probabilities_duration
            .record(started.elapsed().as_secs_f64(), &[]);
        true
    }

    async fn save_probabilities_and_qps(&self) {
        let (probabilities, qps) = {
            let state = self.state.read().unwrap();
            (state.probabilities.clone(), state.qps.clone())
        };
        if let Err(err) = self
            .store
            .insert_probabilities_and_qps(&self.hostname, probabilities, qps)
            .await
        {
            log::warn!("could not save probabilities: {err}");
        }
    }

    /// Backfills the ring from the store so a host that just became leader
    /// has history to calculate from. Walks backward from `end_time` one
    /// interval at a time; stops at the first empty or failed read.
    async fn initialize_throughput(&self, mut end_time: SystemTime) {
        for _ in 0..self.buckets {
            let start_time = end_time - self.config.calculation_interval;
            let throughput = match self.store.get_throughput(start_time, end_time).await {
                Ok(throughput) => throughput,
                Err(err) => {
                    log::error!("failed to get throughput from storage: {err}");
                    return;
                }
            };
            if throughput.is_empty() {
                return;
            }
            let bucket = ThroughputBucket {
                throughput: aggregate_throughput(throughput),
                interval: self.config.calculation_interval,
                end_time,
            };
            self.state
                .write()
                .unwrap()
                .throughputs
                .push_back(Arc::new(bucket));
            end_time = start_time;
        }
    }

    fn prepend_throughput_bucket(&self, bucket: ThroughputBucket) {
        let mut state = self.state.write().unwrap();
        state.throughputs.push_front(Arc::new(bucket));
        state.throughputs.truncate(self.buckets);
    }

    /// Derives the per-operation weighted QPS and probability for every
    /// operation present in the ring. Runs entirely on a snapshot taken
    /// under the shared lock.
    fn calculate_probabilities_and_qps(
        &self,
        weights_cache: &mut WeightsCache,
        sampling_cache: &mut VecDeque<SamplingCache>,
    ) -> (ServiceOperationProbabilities, ServiceOperationQPS) {
        let (ring, old_probabilities) = {
            let state = self.state.read().unwrap();
            (
                state.throughputs.iter().cloned().collect::<Vec<_>>(),
                state.probabilities.clone(),
            )
        };

        sampling_cache.push_front(SamplingCache::default());
        sampling_cache.truncate(SAMPLING_CACHE_SIZE);

        let latest_bucket = ring.first().map(|bucket| bucket.as_ref());
        let mut probabilities: ServiceOperationProbabilities = HashMap::new();
        let mut qps: ServiceOperationQPS = HashMap::new();
        let mut total_operations: u64 = 0;
        for (service, operation_qps) in self.generate_operation_qps(&ring) {
            for (operation, samples) in operation_qps {
                total_operations += 1;
                let weighted_qps = calculate_weighted_qps(weights_cache, &samples);
                let probability = self.calculate_probability(
                    &service,
                    &operation,
                    weighted_qps,
                    &old_probabilities,
                    latest_bucket,
                    sampling_cache,
                );
                qps.entry(service.clone())
                    .or_default()
                    .insert(operation.clone(), weighted_qps);
                probabilities
                    .entry(service.clone())
                    .or_default()
                    .insert(operation, probability);
            }
        }
        self.metrics.operations_calculated.record(total_operations, &[]);
        (probabilities, qps)
    }

    /// Collects up to `lookback_qps_count` per-bucket QPS samples for every
    /// operation in the ring, most recent first.
    fn generate_operation_qps(
        &self,
        ring: &[Arc<ThroughputBucket>],
    ) -> HashMap<String, HashMap<String, Vec<f64>>> {
        let mut qps: HashMap<String, HashMap<String, Vec<f64>>> = HashMap::new();
        for bucket in ring {
            for (service, operations) in &bucket.throughput {
                let service_qps = qps.entry(service.clone()).or_default();
                for (operation, throughput) in operations {
                    let samples = service_qps.entry(operation.clone()).or_default();
                    if samples.len() >= self.config.lookback_qps_count {
                        continue;
                    }
                    samples.push(calculate_qps(throughput.count, bucket.interval));
                }
            }
        }
        qps
    }

    fn calculate_probability(
        &self,
        service: &str,
        operation: &str,
        qps: f64,
        old_probabilities: &ServiceOperationProbabilities,
        latest_bucket: Option<&ThroughputBucket>,
        sampling_cache: &mut VecDeque<SamplingCache>,
    ) -> f64 {
        let old_probability = old_probabilities
            .get(service)
            .and_then(|operations| operations.get(operation))
            .copied()
            .unwrap_or(self.config.default_sampling_probability);

        let using_adaptive = self.using_adaptive_sampling(
            old_probability,
            service,
            operation,
            latest_bucket,
            sampling_cache,
        );
        if let Some(snapshot) = sampling_cache.front_mut() {
            snapshot.set(
                service,
                operation,
                SamplingCacheEntry {
                    probability: old_probability,
                    using_adaptive,
                },
            );
        }

        let target_qps = self.config.mutable.target_qps();
        if (qps - target_qps).abs() < self.config.mutable.qps_equivalence_threshold()
            || !using_adaptive
        {
            return old_probability;
        }
        let new_probability = if float_equals(qps, 0.0) {
            // No spans sampled at all: double the probability so the
            // operation emits at least one sampled span again.
            old_probability * 2.0
        } else {
            self.probability_calculator
                .calculate(target_qps, qps, old_probability)
        };
        new_probability.clamp(self.config.min_sampling_probability, MAX_SAMPLING_PROBABILITY)
    }

    /// Decides whether the upstream sampler for this operation is honoring
    /// the adaptively calculated rate.
    fn using_adaptive_sampling(
        &self,
        probability: f64,
        service: &str,
        operation: &str,
        latest_bucket: Option<&ThroughputBucket>,
        sampling_cache: &VecDeque<SamplingCache>,
    ) -> bool {
        if float_equals(probability, self.config.default_sampling_probability) {
            // First time this operation is seen: assume it is adaptive. If it
            // isn't, the next round's probability will no longer equal the
            // default and the check below takes over.
            return true;
        }
        let operation_throughput = latest_bucket
            .and_then(|bucket| bucket.throughput.get(service))
            .and_then(|operations| operations.get(operation));
        if let Some(throughput) = operation_throughput {
            return throughput
                .probabilities
                .contains(&truncate_probability(probability));
        }
        // No recorded throughput for this operation this round: fall back to
        // the previous round's classification so a transient throughput gap
        // does not drop the operation out of adaptive control.
        if let Some(previous) = sampling_cache.get(1) {
            if let Some(entry) = previous.get(service, operation) {
                return entry.using_adaptive
                    && !float_equals(entry.probability, self.config.default_sampling_probability);
            }
        }
        false
    }

    /// Rebuilds the strategy-response cache from the current probabilities.
    fn generate_strategy_responses(&self) {
        let probabilities = {
            let state = self.state.read().unwrap();
            state.probabilities.clone()
        };
        let mut strategies = HashMap::with_capacity(probabilities.len());
        for (service, operation_probabilities) in &probabilities {
            let mut response = self.default_sampling_strategy_response();
            response.operation_sampling.per_operation_strategies = operation_probabilities
                .iter()
                .map(|(operation, probability)| OperationSamplingStrategy {
                    operation: operation.clone(),
                    probabilistic_sampling: ProbabilisticSamplingStrategy {
                        sampling_rate: *probability,
                    },
                })
                .collect();
            strategies.insert(service.clone(), response);
        }
        let mut state = self.state.write().unwrap();
        state.strategy_responses = strategies;
    }

    fn default_sampling_strategy_response(&self) -> SamplingStrategyResponse {
        SamplingStrategyResponse {
            strategy_type: SamplingStrategyType::Probabilistic,
            operation_sampling: PerOperationSamplingStrategies {
                default_sampling_probability: self.config.default_sampling_probability,
                default_lower_bound_traces_per_second: self.config.lower_bound_traces_per_second,
                per_operation_strategies: Vec::new(),
            },
        }
    }
}

/// Aggregates raw throughput rows into `service -> operation -> Throughput`,
/// summing counts and unioning observed probabilities on collision.
fn aggregate_throughput(rows: Vec<Throughput>) -> ServiceOperationThroughput {
    let mut aggregated: ServiceOperationThroughput = HashMap::new();
    for row in rows {
        let operations = aggregated.entry(row.service.clone()).or_default();
        match operations.get_mut(&row.operation) {
            Some(existing) => {
                existing.count += row.count;
                existing.probabilities.extend(row.probabilities);
            }
            None => {
                operations.insert(row.operation.clone(), row);
            }
        }
    }
    aggregated
}

fn calculate_qps(count: i64, interval: Duration) -> f64 {
    count as f64 / interval.as_secs_f64()
}

/// Weighted mean of the QPS samples, biased towards the most recent sample
/// at the head of the slice.
fn calculate_weighted_qps(weights_cache: &mut WeightsCache, all_qps: &[f64]) -> f64 {
    if all_qps.is_empty() {
        return 0.0;
    }
    let weights = weights_cache.weights(all_qps.len());
    all_qps.iter().zip(weights).map(|(qps, weight)| qps * weight).sum()
}

/// Formats a probability the way upstream samplers stamp it into throughput
/// records: truncated to four decimal digits.
fn truncate_probability(probability: f64) -> String {
    format!("{:.4}", (probability * 10_000.0).trunc() / 10_000.0)
}

fn float_equals(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-10
}

fn jitter_duration(amount: Duration) -> Duration {
    let half = amount / 2;
    let extra = rand::thread_rng().gen_range(0..half.as_nanos().max(1) as u64);
    half + Duration::from_nanos(extra)
}

/// Sleeps for a uniformly random duration in `[amount/2, amount)`. Spreads
/// lock contention after a fleet-wide restart and smooths read load on the
/// lock backend.
async fn add_jitter(amount: Duration) {
    tokio::time::sleep(jitter_duration(amount)).await;
}
