//! Integration tests across pool, retry, coordinator, checker and cache.

use resync_core::classify::is_version_mismatch;
use resync_core::{
    ApiError, ApiReply, ClientHandle, ClientPool, ConsistencyChecker, Credentials, Lag,
    MemoryBackend, Outcome, Phase, PoolConfig, ProviderConfig, Reconciler, ResourceBackend,
    Retrier, RetryConfig, StaticTokenAuthenticator, SyncError, Timeouts, UpdateCoordinator,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

fn fast_retry() -> RetryConfig {
    RetryConfig::default()
        .with_initial_delay(Duration::from_millis(2))
        .with_max_delay(Duration::from_millis(10))
}

fn provider_config(capacity: usize) -> ProviderConfig {
    ProviderConfig::new("memory://", Credentials::new("client", "secret"))
        .with_pool(PoolConfig::new(capacity))
        .with_retry(fast_retry())
}

fn shared_pool(config: &ProviderConfig) -> Arc<ClientPool<ClientHandle>> {
    let auth = Arc::new(StaticTokenAuthenticator::new("token"));
    let factory = ClientHandle::factory(config, auth);
    Arc::new(ClientPool::init(config.pool.clone(), factory).unwrap())
}

#[test]
fn fourth_worker_blocks_until_release() {
    let pool = Arc::new(ClientPool::init(PoolConfig::new(3), Ok::<usize, SyncError>).unwrap());
    let barrier = Arc::new(Barrier::new(4));
    let (acquired_tx, acquired_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Arc::new(parking_lot::Mutex::new(release_rx));

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let pool = Arc::clone(&pool);
            let barrier = Arc::clone(&barrier);
            let acquired_tx = acquired_tx.clone();
            let release_rx = Arc::clone(&release_rx);
            thread::spawn(move || {
                barrier.wait();
                let client = pool.acquire().unwrap();
                acquired_tx.send((worker, *client)).unwrap();
                let _ = release_rx.lock().recv();
            })
        })
        .collect();

    let mut first = Vec::new();
    for _ in 0..3 {
        first.push(acquired_rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }
    assert!(acquired_rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(pool.metrics().active, 3);

    release_tx.send(()).unwrap();
    let (_, slot) = acquired_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(first.iter().any(|(_, held)| *held == slot));
    assert!(pool.metrics().active <= 3);

    for _ in 0..3 {
        release_tx.send(()).unwrap();
    }
    for worker in workers {
        worker.join().unwrap();
    }
    let metrics = pool.metrics();
    assert_eq!(metrics.active, 0);
    assert_eq!(metrics.available, 3);
    assert_eq!(metrics.total_acquires, 4);
}

#[test]
fn outstanding_handles_never_exceed_capacity() {
    let pool = Arc::new(ClientPool::init(PoolConfig::new(3), Ok::<usize, SyncError>).unwrap());
    let outstanding = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let outstanding = Arc::clone(&outstanding);
            let peak = Arc::clone(&peak);
            thread::spawn(move || {
                for _ in 0..50 {
                    let _client = pool.acquire().unwrap();
                    let now = outstanding.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::yield_now();
                    outstanding.fetch_sub(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(pool.metrics().total_acquires, 400);
    assert_eq!(pool.metrics().available, 3);
}

#[test]
fn retry_returns_within_deadline_plus_one_backoff() {
    let retrier = Retrier::new(
        RetryConfig::default()
            .with_initial_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(50))
            .with_jitter(false),
    );
    let deadline = Duration::from_millis(120);
    let started = Instant::now();
    let err = retrier
        .with_retries::<(), _>(deadline, |_| {
            Outcome::Retryable(SyncError::api(
                Phase::Read,
                "queue",
                None,
                ApiError::status(429, "too.many.requests", "slow down"),
            ))
        })
        .unwrap_err();

    assert!(err.is_deadline_exceeded());
    assert!(started.elapsed() < deadline + Duration::from_millis(50) + Duration::from_millis(100));
}

#[test]
fn fatal_on_attempt_k_stops_retrying() {
    let calls = AtomicUsize::new(0);
    let err = Retrier::new(fast_retry())
        .with_retries::<(), _>(Duration::from_secs(30), |ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            if ctx.attempt < 3 {
                Outcome::Retryable(SyncError::NotFound {
                    resource_type: "queue".into(),
                    key: "q".into(),
                })
            } else {
                Outcome::Fatal(SyncError::InvalidPayload("rejected".into()))
            }
        })
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(matches!(err, SyncError::InvalidPayload(_)));
}

#[test]
fn update_converges_in_m_plus_one_attempts() {
    let backend = MemoryBackend::new();
    let id = backend.insert("group", json!({"name": "ops"}));
    let contention = 4;
    backend.inject_conflicts(&id, contention);

    let client = ClientHandle::new(0, "memory://", "token", Default::default());
    let coordinator = UpdateCoordinator::new(Retrier::new(fast_retry()), is_version_mismatch);

    let updated = coordinator
        .update(
            Duration::from_secs(5),
            "group",
            &id,
            || backend.get(&client, "group", &id),
            |current: &Value, version| {
                assert_eq!(current["version"], version);
                backend.update(&client, "group", &id, &json!({"name": "ops-2", "version": version}))
            },
        )
        .unwrap();

    assert_eq!(updated.attempts, contention + 1);
    assert_eq!(updated.conflicts, contention);
    assert_eq!(updated.value["name"], "ops-2");
}

#[test]
fn cache_fast_path_after_export() {
    let backend = Arc::new(MemoryBackend::new());
    for id in ["A", "B", "C"] {
        backend.insert("user", json!({"id": id, "name": format!("user {id}")}));
    }
    let config = provider_config(2);
    let reconciler = Reconciler::new(&config, shared_pool(&config), Arc::clone(&backend)).unwrap();

    reconciler.export("user").unwrap();
    backend.reset_calls();

    let a = reconciler.read("user", "A").unwrap().unwrap();
    assert_eq!(a["name"], "user A");
    assert_eq!(backend.calls().total(), 0);

    assert_eq!(reconciler.read("user", "D").unwrap(), None);
    assert_eq!(backend.calls().gets, 1);
}

fn confirm_with_reads(found_reads: usize, deadline: Duration) -> (Result<u32, SyncError>, usize) {
    let checker = ConsistencyChecker::new(Retrier::new(fast_retry()));
    let reads = AtomicUsize::new(0);
    let result = checker.confirm_deleted(deadline, "user", "u-1", || {
        let n = reads.fetch_add(1, Ordering::SeqCst);
        if n < found_reads {
            Ok(json!({"id": "u-1"}))
        } else {
            Err(SyncError::api(
                Phase::Verify,
                "user",
                Some("u-1"),
                ApiError::status(404, "not.found", "gone"),
            ))
        }
    });
    (result, reads.load(Ordering::SeqCst))
}

#[test]
fn delete_confirmation_inversion() {
    let (result, reads) = confirm_with_reads(0, Duration::from_secs(1));
    assert_eq!(result.unwrap(), 1);
    assert_eq!(reads, 1);

    let (result, reads) = confirm_with_reads(2, Duration::from_secs(1));
    assert_eq!(result.unwrap(), 3);
    assert_eq!(reads, 3);

    let (result, _) = confirm_with_reads(usize::MAX, Duration::from_millis(30));
    let err = result.unwrap_err();
    assert!(err.is_deadline_exceeded());
    assert!(matches!(err.last_retryable(), Some(SyncError::StillExists { .. })));
    assert!(err.to_string().contains("still exists"));
}

#[test]
fn zero_deadline_makes_exactly_one_attempt() {
    let calls = AtomicUsize::new(0);
    let result = Retrier::default().with_retries(Duration::ZERO, |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        Outcome::<()>::Retryable(SyncError::NotFound {
            resource_type: "queue".into(),
            key: "q".into(),
        })
    });
    assert!(result.unwrap_err().is_deadline_exceeded());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn full_lifecycle_under_lag_and_rate_limits() {
    let backend = Arc::new(MemoryBackend::with_lag(Lag::uniform(Duration::from_millis(15))));
    let config = provider_config(3).with_timeouts(Timeouts {
        create_verify: Duration::from_secs(2),
        update: Duration::from_secs(2),
        delete: Duration::from_secs(2),
        name_lookup: Duration::from_secs(2),
        ..Timeouts::default()
    });
    let reconciler = Reconciler::new(&config, shared_pool(&config), Arc::clone(&backend)).unwrap();

    backend.inject_rate_limit(2);
    let created = reconciler
        .create("queue", &json!({"name": "support", "members": [{"id": "u1"}, {"id": "u2"}]}))
        .unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    assert_eq!(reconciler.lookup_by_name("queue", "support").unwrap(), id);

    let updated = reconciler
        .update("queue", &id, &json!({"members": [{"id": "u2"}, {"id": "u1"}], "description": "tier 1"}))
        .unwrap();
    assert_eq!(updated["description"], "tier 1");

    reconciler.delete("queue", &id).unwrap();
    assert!(backend.snapshot("queue", &id).is_none());

    let stats = reconciler.stats();
    assert_eq!((stats.creates, stats.updates, stats.deletes), (1, 1, 1));
    assert_eq!(reconciler.pool().metrics().active, 0);
}

#[test]
fn pool_init_fails_on_bad_credentials() {
    let config = provider_config(6);
    let auth = Arc::new(StaticTokenAuthenticator::new("token").failing_after(3));
    let result = ClientPool::init(config.pool.clone(), ClientHandle::factory(&config, auth));
    match result {
        Err(SyncError::PoolInit { source, .. }) => {
            assert!(matches!(*source, SyncError::Authentication(_)));
        }
        other => panic!("expected PoolInit error, got {other:?}"),
    }
}

#[test]
fn retry_when_and_reply_metadata() {
    let attempts = AtomicUsize::new(0);
    let reply: ApiReply<u32> = Retrier::new(fast_retry())
        .retry_when(&is_version_mismatch, || {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(SyncError::api(
                    Phase::Delete,
                    "group",
                    Some("g"),
                    ApiError::status(409, "version.mismatch", "stale"),
                ))
            } else {
                Ok(ApiReply::new(7, 204))
            }
        })
        .unwrap();
    assert_eq!(reply.response.status, 204);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}
