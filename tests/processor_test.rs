//! Loop-level tests driving the processor through its public API, backed by
//! the in-memory store and lock fakes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use adaptive_sampling::testing::{throughput, InMemorySamplingStore, StaticLock};
use adaptive_sampling::{MutableConfig, Processor, ProcessorConfig};

fn fast_config() -> ProcessorConfig {
    ProcessorConfig {
        calculation_interval: Duration::from_millis(50),
        lookback_interval: Duration::from_millis(100),
        lookback_qps_count: 2,
        delay: Duration::ZERO,
        leader_lease_refresh_interval: Duration::from_millis(20),
        follower_lease_refresh_interval: Duration::from_millis(40),
        min_sampling_probability: 1e-5,
        default_sampling_probability: 0.001,
        lower_bound_traces_per_second: 1.0 / 60.0,
        mutable: Arc::new(MutableConfig::new(1.0, 0.3)),
    }
}

fn meter() -> opentelemetry::metrics::Meter {
    opentelemetry::global::meter("adaptive-sampling-test")
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Polls `condition` every 10ms until it holds or `timeout` elapses.
async fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_leader_calculates_and_persists() {
    init_logging();
    let store = InMemorySamplingStore::new();
    let lock = StaticLock::new(true);
    let processor = Arc::new(
        Processor::new(fast_config(), "collector-1", store.clone(), lock, &meter()).unwrap(),
    );
    for _ in 0..50 {
        store.push_throughput(vec![throughput("svc-a", "op-x", 5, &[])]);
    }
    processor.clone().start().await;

    assert!(wait_for(|| processor.is_leader(), Duration::from_secs(2)).await);
    assert!(
        wait_for(
            || store
                .inserts()
                .iter()
                .any(|insert| insert.probabilities.contains_key("svc-a")),
            Duration::from_secs(2),
        )
        .await,
        "leader never persisted probabilities"
    );
    processor.stop();

    let insert = store
        .inserts()
        .into_iter()
        .find(|insert| insert.probabilities.contains_key("svc-a"))
        .unwrap();
    assert_eq!(insert.hostname, "collector-1");
    let probability = insert.probabilities["svc-a"]["op-x"];
    assert!((1e-5..=1.0).contains(&probability));
    assert!(insert.qps["svc-a"]["op-x"] >= 0.0);

    let response = processor.get_sampling_strategy_response("svc-a");
    assert!(response
        .operation_sampling
        .per_operation_strategies
        .iter()
        .any(|strategy| strategy.operation == "op-x"));
}

#[tokio::test]
async fn test_follower_refreshes_probabilities_from_store() {
    init_logging();
    let store = InMemorySamplingStore::new();
    let lock = StaticLock::new(false);
    let processor = Arc::new(
        Processor::new(fast_config(), "collector-2", store.clone(), lock, &meter())
            .unwrap()
            .with_follower_probability_interval(Duration::from_millis(50)),
    );
    processor.clone().start().await;

    // Written by some other host's leader after this follower started.
    store.set_latest_probabilities(HashMap::from([(
        "svc-b".to_string(),
        HashMap::from([("op-y".to_string(), 0.42)]),
    )]));

    assert!(
        wait_for(
            || {
                processor
                    .get_sampling_strategy_response("svc-b")
                    .operation_sampling
                    .per_operation_strategies
                    .iter()
                    .any(|strategy| {
                        strategy.operation == "op-y"
                            && strategy.probabilistic_sampling.sampling_rate == 0.42
                    })
            },
            Duration::from_secs(2),
        )
        .await,
        "follower never picked up the persisted probabilities"
    );
    assert!(!processor.is_leader());
    // A follower only ever reads.
    assert!(store.inserts().is_empty());
    processor.stop();
}

#[tokio::test]
async fn test_start_loads_persisted_probabilities() {
    init_logging();
    let store = InMemorySamplingStore::new();
    let lock = StaticLock::new(false);
    store.set_latest_probabilities(HashMap::from([(
        "svc-c".to_string(),
        HashMap::from([("op-z".to_string(), 0.33)]),
    )]));
    let processor = Arc::new(
        Processor::new(fast_config(), "collector-3", store.clone(), lock, &meter()).unwrap(),
    );
    processor.clone().start().await;

    // Served immediately, before any refresh tick.
    let response = processor.get_sampling_strategy_response("svc-c");
    assert_eq!(
        response.operation_sampling.per_operation_strategies[0].operation,
        "op-z"
    );
    assert_eq!(
        response.operation_sampling.per_operation_strategies[0]
            .probabilistic_sampling
            .sampling_rate,
        0.33
    );
    processor.stop();
}

#[tokio::test]
async fn test_leadership_failover() {
    init_logging();
    let store = InMemorySamplingStore::new();
    let lock_a = StaticLock::new(true);
    let lock_b = StaticLock::new(false);
    let processor_a = Arc::new(
        Processor::new(
            fast_config(),
            "collector-a",
            store.clone(),
            lock_a.clone(),
            &meter(),
        )
        .unwrap(),
    );
    let processor_b = Arc::new(
        Processor::new(
            fast_config(),
            "collector-b",
            store.clone(),
            lock_b.clone(),
            &meter(),
        )
        .unwrap(),
    );
    processor_a.clone().start().await;
    processor_b.clone().start().await;

    assert!(wait_for(|| processor_a.is_leader(), Duration::from_secs(2)).await);
    assert!(!processor_b.is_leader());
    assert!(
        wait_for(
            || store.inserts().iter().any(|insert| insert.hostname == "collector-a"),
            Duration::from_secs(2),
        )
        .await
    );

    // The leader dies and its lease expires.
    processor_a.stop();
    lock_a.set_acquired(false);
    lock_b.set_acquired(true);

    assert!(
        wait_for(|| processor_b.is_leader(), Duration::from_secs(2)).await,
        "standby never took over the lease"
    );
    assert!(
        wait_for(
            || store.inserts().iter().any(|insert| insert.hostname == "collector-b"),
            Duration::from_secs(2),
        )
        .await,
        "new leader never persisted probabilities"
    );
    processor_b.stop();
}

#[tokio::test]
async fn test_throughput_read_failure_skips_persistence() {
    init_logging();
    let store = InMemorySamplingStore::new();
    let lock = StaticLock::new(true);
    store.set_fail_throughput(true);
    let processor = Arc::new(
        Processor::new(fast_config(), "collector-4", store.clone(), lock, &meter()).unwrap(),
    );
    processor.clone().start().await;

    assert!(wait_for(|| processor.is_leader(), Duration::from_secs(2)).await);
    assert!(
        wait_for(|| store.throughput_calls() >= 3, Duration::from_secs(2)).await,
        "calculation loop stopped retrying"
    );
    // Failed reads mean no bucket and no calculation.
    assert!(store.inserts().is_empty());

    store.set_fail_throughput(false);
    assert!(
        wait_for(|| !store.inserts().is_empty(), Duration::from_secs(2)).await,
        "loop did not recover after the store came back"
    );
    processor.stop();
}

#[tokio::test]
async fn test_lock_error_keeps_leader_state() {
    init_logging();
    let store = InMemorySamplingStore::new();
    let lock = StaticLock::new(true);
    let processor = Arc::new(
        Processor::new(fast_config(), "collector-5", store.clone(), lock.clone(), &meter())
            .unwrap(),
    );
    processor.clone().start().await;
    assert!(wait_for(|| processor.is_leader(), Duration::from_secs(2)).await);

    // The lock backend starts erroring: the flag is left as-is.
    lock.set_fail(true);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(processor.is_leader());
    processor.stop();
}

#[tokio::test]
async fn test_stop_terminates_loops() {
    init_logging();
    let store = InMemorySamplingStore::new();
    let lock = StaticLock::new(false);
    let processor = Arc::new(
        Processor::new(fast_config(), "collector-6", store.clone(), lock, &meter()).unwrap(),
    );
    processor.clone().start().await;
    assert!(wait_for(|| store.throughput_calls() >= 2, Duration::from_secs(2)).await);

    processor.stop();
    // Let any in-flight tick drain, then verify the loops went quiet.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let calls_after_stop = store.throughput_calls();
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(store.throughput_calls(), calls_after_stop);
}
