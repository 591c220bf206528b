//! Connection pool behaviour tests against the mock broker.
//!
//! Run with:
//! ```bash
//! cargo test -p broker-pool --test pool
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use broker_pool::{
    BrokerConnection, ConnectionPool, PoolConfig, PoolError, RetryPolicy, TransportError,
};
use broker_testing::fixtures::{mock_connection_config, no_delay_retry, pool_config};
use broker_testing::mock::{ConnectOutcome, MockBroker, MockConnector};
use parking_lot::Mutex;
use tokio::time::Instant;

async fn filled_pool(broker: &MockBroker, size: u32) -> ConnectionPool<MockConnector> {
    ConnectionPool::initialize(
        broker.connector(),
        mock_connection_config(),
        pool_config(size, 3),
    )
    .await
    .expect("pool should initialize")
}

fn lazy_pool(broker: &MockBroker, size: u32) -> ConnectionPool<MockConnector> {
    ConnectionPool::new(broker.connector(), mock_connection_config(), pool_config(size, 3))
        .expect("config should be valid")
}

// =============================================================================
// Initialization
// =============================================================================

#[tokio::test]
async fn test_initialize_fills_exactly_pool_size() {
    let broker = MockBroker::default();
    let pool = filled_pool(&broker, 5).await;

    assert_eq!(pool.idle_count(), 5);
    assert_eq!(broker.connect_calls(), 5);
    assert_eq!(broker.open_connections(), 5);

    let status = pool.status();
    assert_eq!(status.idle, 5);
    assert_eq!(status.pool_size, 5);
    assert_eq!(status.created, 5);
    assert_eq!(status.exhausted, 0);
}

#[tokio::test]
async fn test_initialize_with_unreachable_broker_degrades_to_empty_pool() {
    let broker = MockBroker::builder().unavailable().build();

    let pool = ConnectionPool::initialize(
        broker.connector(),
        mock_connection_config(),
        pool_config(5, 3),
    )
    .await
    .expect("an unreachable broker must not fail startup");

    assert_eq!(broker.connect_calls(), 3);
    assert_eq!(pool.idle_count(), 0);
}

#[tokio::test]
async fn test_fill_reports_exhausted_retry_budget() {
    let broker = MockBroker::builder().unavailable().build();
    let pool = lazy_pool(&broker, 5);

    let report = pool.fill().await.unwrap();

    assert_eq!(report.attempts, 3);
    assert_eq!(report.opened, 0);
    assert_eq!(broker.connect_calls(), 3);
}

#[tokio::test]
async fn test_broker_recovering_on_third_attempt() {
    let broker = MockBroker::builder().fail_next(2).build();
    let pool = ConnectionPool::new(
        broker.connector(),
        mock_connection_config(),
        PoolConfig::new().pool_size(5).retry(no_delay_retry(30)),
    )
    .unwrap();

    let report = pool.fill().await.unwrap();

    assert_eq!(report.attempts, 3);
    assert_eq!(report.opened, 5);
    assert_eq!(pool.idle_count(), 5);
    // Two failed probes, then the probe plus four more.
    assert_eq!(broker.connect_calls(), 7);
}

#[tokio::test]
async fn test_partial_fill_is_rolled_back_and_retried() {
    let broker = MockBroker::builder()
        .succeed_next(2)
        .then(ConnectOutcome::Fail)
        .build();
    let pool = lazy_pool(&broker, 3);

    let report = pool.fill().await.unwrap();

    assert_eq!(report.attempts, 2);
    assert_eq!(pool.idle_count(), 3);
    assert_eq!(broker.connect_calls(), 6);
    assert_eq!(broker.close_calls(), 2, "partial connections should be closed");
    assert_eq!(broker.open_connections(), 3);
}

#[tokio::test]
async fn test_partial_fills_count_against_retry_bound() {
    let broker = MockBroker::builder()
        .succeed_next(1)
        .fail_next(1)
        .succeed_next(1)
        .fail_next(1)
        .unavailable()
        .build();
    let pool = ConnectionPool::new(
        broker.connector(),
        mock_connection_config(),
        pool_config(2, 2),
    )
    .unwrap();

    let report = pool.fill().await.unwrap();

    assert_eq!(report.attempts, 2);
    assert_eq!(report.opened, 0);
    assert_eq!(broker.connect_calls(), 4);
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn test_invalid_parameters_fail_fast() {
    let broker = MockBroker::builder().then(ConnectOutcome::Fatal).build();

    let result = ConnectionPool::initialize(
        broker.connector(),
        mock_connection_config(),
        pool_config(5, 30),
    )
    .await;

    assert!(matches!(
        result,
        Err(PoolError::Connection(TransportError::InvalidParameters(_)))
    ));
    assert_eq!(broker.connect_calls(), 1);
}

#[tokio::test]
async fn test_invalid_configuration_is_rejected_before_connecting() {
    let broker = MockBroker::default();

    let result = ConnectionPool::builder(broker.connector())
        .connection_config(mock_connection_config().host(""))
        .build()
        .await;
    assert!(matches!(result, Err(PoolError::Configuration(_))));

    let result = ConnectionPool::builder(broker.connector())
        .pool_size(0)
        .build()
        .await;
    assert!(matches!(result, Err(PoolError::Configuration(_))));

    assert_eq!(broker.connect_calls(), 0);
}

#[tokio::test]
async fn test_builder_options_reach_pool() {
    let broker = MockBroker::default();
    let pool = ConnectionPool::builder(broker.connector())
        .connection_config(mock_connection_config().port(5673))
        .pool_size(2)
        .max_retries(4)
        .retry_delay(Duration::ZERO)
        .build()
        .await
        .unwrap();

    assert_eq!(pool.idle_count(), 2);
    assert_eq!(pool.config().retry.max_retries, 4);
    assert_eq!(pool.connection_config().address(), "mock-broker:5673");
}

#[tokio::test]
async fn test_fill_on_full_pool_opens_nothing() {
    let broker = MockBroker::default();
    let pool = filled_pool(&broker, 3).await;

    let report = pool.fill().await.unwrap();

    assert_eq!(report.attempts, 0);
    assert_eq!(report.opened, 0);
    assert_eq!(pool.idle_count(), 3);
    assert_eq!(broker.connect_calls(), 3);
}

#[tokio::test]
async fn test_fill_counts_lent_connections() {
    let broker = MockBroker::default();
    let pool = lazy_pool(&broker, 3);

    let conn = pool.acquire().await.unwrap();
    let report = pool.fill().await.unwrap();
    assert_eq!(report.opened, 2);

    pool.release(conn);
    assert_eq!(pool.idle_count(), 3);
    assert_eq!(broker.open_connections(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_fill_sleeps_between_attempts_but_not_after_the_last() {
    let broker = MockBroker::builder().unavailable().build();
    let pool = ConnectionPool::new(
        broker.connector(),
        mock_connection_config(),
        PoolConfig::new()
            .pool_size(3)
            .max_retries(4)
            .retry_delay(Duration::from_secs(5)),
    )
    .unwrap();

    let start = Instant::now();
    let report = pool.fill().await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(report.attempts, 4);
    // Three sleeps between four attempts.
    assert!(elapsed >= Duration::from_secs(15), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(20), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_fill_backoff_grows_between_attempts() {
    let broker = MockBroker::builder().unavailable().build();
    let retry = RetryPolicy::new()
        .max_retries(4)
        .initial_backoff(Duration::from_secs(1))
        .max_backoff(Duration::from_secs(3))
        .backoff_multiplier(2.0)
        .jitter(false);
    let pool = ConnectionPool::new(
        broker.connector(),
        mock_connection_config(),
        PoolConfig::new().pool_size(2).retry(retry),
    )
    .unwrap();

    let start = Instant::now();
    pool.fill().await.unwrap();
    let elapsed = start.elapsed();

    // 1s, 2s, then 4s capped at 3s.
    assert!(elapsed >= Duration::from_secs(6), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(7), "{elapsed:?}");
    assert_eq!(broker.connect_calls(), 4);
}

// =============================================================================
// Acquire / release
// =============================================================================

#[tokio::test]
async fn test_acquire_release_round_trip_keeps_size() {
    let broker = MockBroker::default();
    let pool = filled_pool(&broker, 3).await;

    for _ in 0..10 {
        let conn = pool.acquire().await.unwrap();
        assert_eq!(pool.idle_count(), 2);
        pool.release(conn);
        assert_eq!(pool.idle_count(), 3);
    }
    assert_eq!(broker.connect_calls(), 3);
}

#[tokio::test]
async fn test_acquire_all_then_release_all_keeps_identities() {
    let broker = MockBroker::default();
    let pool = filled_pool(&broker, 5).await;
    let mut before = pool.idle_ids();
    before.sort_unstable();

    let mut held = Vec::new();
    for _ in 0..5 {
        held.push(pool.acquire().await.unwrap());
    }
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(pool.status().in_use, 5);
    assert!(held.iter().all(|c| c.is_open()));

    for conn in held {
        pool.release(conn);
    }

    let mut after = pool.idle_ids();
    after.sort_unstable();
    assert_eq!(before, after);
    assert_eq!(pool.status().in_use, 0);
    assert_eq!(broker.connect_calls(), 5);
}

#[tokio::test]
async fn test_last_released_is_first_acquired() {
    let broker = MockBroker::default();
    let pool = filled_pool(&broker, 3).await;

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    let (a_id, b_id) = (a.id(), b.id());

    pool.release(b);
    pool.release(a);

    assert_eq!(pool.acquire().await.unwrap().id(), a_id);
    assert_eq!(pool.acquire().await.unwrap().id(), b_id);
}

#[tokio::test]
async fn test_acquire_tracks_checkout_count() {
    let broker = MockBroker::default();
    let pool = filled_pool(&broker, 1).await;

    for _ in 0..3 {
        let conn = pool.acquire().await.unwrap();
        pool.release(conn);
    }

    let conn = pool.acquire().await.unwrap();
    assert_eq!(conn.metadata().checkout_count, 4);
}

#[tokio::test]
async fn test_stale_connection_is_replaced_and_never_reinserted() {
    let broker = MockBroker::default();
    let pool = filled_pool(&broker, 1).await;
    let stale_id = pool.idle_ids()[0];

    broker.kill_all();
    let conn = pool.acquire().await.unwrap();

    assert_ne!(conn.id(), stale_id);
    assert!(conn.is_open());
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(broker.connect_calls(), 2);

    pool.release(conn);
    assert!(!pool.idle_ids().contains(&stale_id));
    assert_eq!(pool.status().stale_discarded, 1);
}

#[tokio::test]
async fn test_stale_connection_is_closed_when_discarded() {
    let broker = MockBroker::default();
    let pool = filled_pool(&broker, 1).await;

    broker.kill_all();
    let _conn = pool.acquire().await.unwrap();

    assert_eq!(broker.close_calls(), 1);
}

#[tokio::test]
async fn test_stale_close_failure_does_not_fail_acquire() {
    let broker = MockBroker::default();
    let pool = filled_pool(&broker, 1).await;

    broker.kill_all();
    broker.set_fail_close(true);
    let conn = pool.acquire().await.unwrap();

    assert!(conn.is_open());
    assert_eq!(broker.close_calls(), 1);
}

#[tokio::test]
async fn test_stale_replacement_failure_propagates() {
    let broker = MockBroker::default();
    let pool = filled_pool(&broker, 1).await;

    broker.kill_all();
    broker.set_available(false);

    let err = pool.acquire().await.unwrap_err();
    assert!(err.to_string().contains("could not obtain a broker connection"));
    assert_eq!(pool.idle_count(), 0, "stale connection must not be reinserted");
}

#[tokio::test]
async fn test_exhausted_pool_opens_connections_on_demand() {
    let broker = MockBroker::default();
    let pool = filled_pool(&broker, 2).await;

    let mut held = Vec::new();
    for _ in 0..5 {
        held.push(pool.acquire().await.unwrap());
    }

    assert_eq!(broker.connect_calls(), 5);
    assert_eq!(pool.status().exhausted, 3);

    for conn in held {
        pool.release(conn);
    }
    // The pool is a cache, not an admission gate.
    assert_eq!(pool.idle_count(), 5);
}

#[tokio::test]
async fn test_acquire_on_never_initialized_pool() {
    let broker = MockBroker::default();
    let pool = lazy_pool(&broker, 5);

    let conn = pool.acquire().await.unwrap();

    assert!(conn.is_open());
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(broker.connect_calls(), 1);
}

#[tokio::test]
async fn test_on_demand_failure_propagates() {
    let broker = MockBroker::builder().unavailable().build();
    let pool = lazy_pool(&broker, 5);

    let err = pool.acquire().await.unwrap_err();

    assert!(matches!(err, PoolError::Connection(TransportError::Connect(_))));
    assert!(err.is_transient());
    assert_eq!(broker.connect_calls(), 1, "acquire must not retry");
}

#[tokio::test]
async fn test_release_drops_closed_connection() {
    let broker = MockBroker::default();
    let pool = filled_pool(&broker, 2).await;

    let conn = pool.acquire().await.unwrap();
    conn.kill();
    pool.release(conn);

    assert_eq!(pool.idle_count(), 1);
}

#[tokio::test]
async fn test_pooled_connection_returns_on_drop() {
    let broker = MockBroker::default();
    let pool = filled_pool(&broker, 2).await;

    {
        let conn = pool.get().await.unwrap();
        assert!(conn.is_open());
        assert_eq!(pool.idle_count(), 1);
    }

    assert_eq!(pool.idle_count(), 2);
}

#[tokio::test]
async fn test_detached_connection_is_not_returned() {
    let broker = MockBroker::default();
    let pool = filled_pool(&broker, 2).await;

    let handle = pool.get().await.unwrap().detach().unwrap();
    assert_eq!(pool.idle_count(), 1);

    pool.release(handle);
    assert_eq!(pool.idle_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_never_share_a_connection() {
    let broker = MockBroker::default();
    let pool = filled_pool(&broker, 4).await;
    let in_use: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(HashSet::new()));

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let pool = pool.clone();
        let in_use = Arc::clone(&in_use);
        tasks.push(tokio::spawn(async move {
            for _ in 0..50 {
                let conn = pool.acquire().await.unwrap();
                assert!(
                    in_use.lock().insert(conn.id()),
                    "connection {} handed to two callers",
                    conn.id()
                );
                tokio::task::yield_now().await;
                in_use.lock().remove(&conn.id());
                pool.release(conn);
            }
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }

    assert!(in_use.lock().is_empty());
    assert_eq!(pool.idle_count(), broker.connections_created());
    assert!(pool.idle_count() >= 4);
}

// =============================================================================
// Teardown
// =============================================================================

#[tokio::test]
async fn test_close_all_is_idempotent_and_pool_stays_usable() {
    let broker = MockBroker::default();
    let pool = filled_pool(&broker, 3).await;

    pool.close_all().await;
    pool.close_all().await;

    assert_eq!(pool.idle_count(), 0);
    assert_eq!(broker.close_calls(), 3);
    assert_eq!(broker.open_connections(), 0);

    let conn = pool.acquire().await.unwrap();
    assert!(conn.is_open());
    assert_eq!(pool.status().exhausted, 1);
}

#[tokio::test]
async fn test_close_all_tolerates_close_failures() {
    let broker = MockBroker::builder().fail_close(true).build();
    let pool = filled_pool(&broker, 3).await;

    pool.close_all().await;

    assert_eq!(pool.idle_count(), 0);
    assert_eq!(broker.close_calls(), 3);
    assert_eq!(pool.status().close_failures, 3);
}

#[tokio::test]
async fn test_close_all_skips_already_closed_connections() {
    let broker = MockBroker::default();
    let pool = filled_pool(&broker, 3).await;

    broker.kill_all();
    pool.close_all().await;

    assert_eq!(broker.close_calls(), 0);
    assert_eq!(pool.idle_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_close_all_stops_health_check_in_progress() {
    let broker = MockBroker::builder()
        .connect_delay(Duration::from_millis(500))
        .build();
    // The fill takes 1s; the monitor starts then and first checks at 2s.
    let pool = ConnectionPool::builder(broker.connector())
        .connection_config(mock_connection_config())
        .pool_size(2)
        .retry_delay(Duration::ZERO)
        .health_check_interval(Duration::from_secs(1))
        .build()
        .await
        .unwrap();

    broker.kill_all();
    // Land inside the monitor's first replacement connect.
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    pool.close_all().await;
    assert_eq!(pool.idle_count(), 0);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(broker.open_connections(), 0);
}

// =============================================================================
// Health checking
// =============================================================================

#[tokio::test]
async fn test_health_check_prunes_and_replenishes() {
    let broker = MockBroker::default();
    let pool = filled_pool(&broker, 3).await;

    let conn = pool.acquire().await.unwrap();
    let broker_id = conn.broker_id();
    pool.release(conn);
    assert!(broker.kill(broker_id));

    let report = pool.health_check().await;

    assert_eq!(report.pruned, 1);
    assert_eq!(report.opened, 1);
    assert_eq!(report.idle, 3);
    assert_eq!(broker.open_connections(), 3);
}

#[tokio::test]
async fn test_health_check_with_broker_down_only_prunes() {
    let broker = MockBroker::default();
    let pool = filled_pool(&broker, 3).await;

    broker.kill_all();
    broker.set_available(false);
    let report = pool.health_check().await;

    assert_eq!(report.pruned, 3);
    assert_eq!(report.opened, 0);
    assert_eq!(report.idle, 0);
    assert_eq!(pool.status().stale_discarded, 3);
}

#[tokio::test]
async fn test_replenish_tops_up_to_pool_size() {
    let broker = MockBroker::default();
    let pool = lazy_pool(&broker, 4);

    assert_eq!(pool.replenish().await, 4);
    assert_eq!(pool.replenish().await, 0);
    assert_eq!(pool.idle_count(), 4);
}

#[tokio::test]
async fn test_health_check_does_not_replace_lent_connections() {
    let broker = MockBroker::default();
    let pool = filled_pool(&broker, 3).await;

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(pool.acquire().await.unwrap());
    }
    let report = pool.health_check().await;
    assert_eq!(report.opened, 0);

    for conn in held {
        pool.release(conn);
    }
    assert_eq!(pool.idle_count(), 3);
    assert_eq!(broker.open_connections(), 3);
}

#[tokio::test]
async fn test_replenish_replaces_connection_closed_while_lent() {
    let broker = MockBroker::default();
    let pool = filled_pool(&broker, 2).await;

    let conn = pool.acquire().await.unwrap();
    conn.kill();
    pool.release(conn);
    assert_eq!(pool.status().in_use, 0);

    assert_eq!(pool.replenish().await, 1);
    assert_eq!(pool.idle_count(), 2);
}

#[tokio::test]
async fn test_health_monitor_restores_pool_after_broker_restart() {
    let broker = MockBroker::default();
    let pool = ConnectionPool::builder(broker.connector())
        .connection_config(mock_connection_config())
        .pool_size(2)
        .retry_delay(Duration::ZERO)
        .health_check_interval(Duration::from_millis(20))
        .build()
        .await
        .unwrap();

    broker.kill_all();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(pool.idle_count(), 2);
    assert_eq!(broker.open_connections(), 2);

    pool.close_all().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.idle_count(), 0, "close_all should stop the monitor");
}

#[tokio::test]
async fn test_health_monitor_exits_when_pool_dropped() {
    let broker = MockBroker::default();
    let pool = lazy_pool(&broker, 1);

    let monitor = pool.spawn_health_monitor(Duration::from_millis(10));
    drop(pool);

    tokio::time::timeout(Duration::from_secs(1), monitor)
        .await
        .expect("monitor should exit once the pool is dropped")
        .unwrap();
}
