//! Test fixtures and reconciler helpers.
//!
//! Provides convenience functions for wiring an in-memory backend, a client
//! pool and a reconciler with retry timings short enough for tests.

use resync_core::{
    ClientHandle, ClientPool, Credentials, Lag, MemoryBackend, PoolConfig, ProviderConfig,
    Reconciler, RetryConfig, StaticTokenAuthenticator, Timeouts, TransportSettings,
};
use std::sync::Arc;
use std::time::Duration;

/// Retry configuration with millisecond backoff.
pub fn fast_retry() -> RetryConfig {
    RetryConfig::default()
        .with_initial_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(10))
}

/// Timeouts scaled down for tests.
pub fn short_timeouts() -> Timeouts {
    Timeouts {
        name_lookup: Duration::from_secs(2),
        delete: Duration::from_secs(2),
        slow_delete: Duration::from_secs(5),
        read: Duration::from_secs(2),
        create_verify: Duration::from_secs(2),
        update: Duration::from_secs(2),
    }
}

/// Provider configuration for an in-memory backend.
pub fn test_config(capacity: usize) -> ProviderConfig {
    ProviderConfig::new("memory://", Credentials::new("test-client", "test-secret"))
        .with_pool(PoolConfig::new(capacity))
        .with_retry(fast_retry())
        .with_timeouts(short_timeouts())
}

/// A standalone client handle for calling a backend directly.
pub fn test_client() -> ClientHandle {
    ClientHandle::new(0, "memory://", "test-token", TransportSettings::default())
}

/// A reconciler over a memory backend, with handles to every part.
pub struct TestHarness {
    /// The simulated backend.
    pub backend: Arc<MemoryBackend>,
    /// The shared client pool.
    pub pool: Arc<ClientPool<ClientHandle>>,
    /// The reconciler under test.
    pub reconciler: Reconciler<MemoryBackend>,
}

impl TestHarness {
    /// Creates a harness with no propagation lag.
    pub fn new(capacity: usize) -> Self {
        Self::with_backend(capacity, MemoryBackend::new())
    }

    /// Creates a harness whose backend lags by `lag` after every write.
    pub fn lagging(capacity: usize, lag: Duration) -> Self {
        Self::with_backend(capacity, MemoryBackend::with_lag(Lag::uniform(lag)))
    }

    /// Creates a harness around an existing backend.
    pub fn with_backend(capacity: usize, backend: MemoryBackend) -> Self {
        let config = test_config(capacity);
        let auth = Arc::new(StaticTokenAuthenticator::new("test-token"));
        let pool = Arc::new(
            ClientPool::init(config.pool.clone(), ClientHandle::factory(&config, auth))
                .expect("Failed to initialize client pool"),
        );
        let backend = Arc::new(backend);
        let reconciler = Reconciler::new(&config, Arc::clone(&pool), Arc::clone(&backend))
            .expect("Invalid retry configuration");

        Self {
            backend,
            pool,
            reconciler,
        }
    }
}

/// Runs a test with a fresh harness.
///
/// # Example
///
/// ```rust,ignore
/// use resync_testkit::with_harness;
///
/// #[test]
/// fn my_test() {
///     with_harness(2, |h| {
///         h.reconciler.export("user").unwrap();
///     });
/// }
/// ```
pub fn with_harness<F, R>(capacity: usize, f: F) -> R
where
    F: FnOnce(&TestHarness) -> R,
{
    let harness = TestHarness::new(capacity);
    f(&harness)
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;
    use serde_json::json;

    /// Seeds `count` resources named `{resource_type}-{i}`. Returns their ids.
    pub fn seed(backend: &MemoryBackend, resource_type: &str, count: usize) -> Vec<String> {
        (0..count)
            .map(|i| {
                backend.insert(
                    resource_type,
                    json!({
                        "name": format!("{resource_type}-{i}"),
                        "description": format!("seeded {i}"),
                        "members": [],
                    }),
                )
            })
            .collect()
    }

    /// A harness whose backend already holds `count` resources of one type.
    pub fn populated_harness(resource_type: &str, count: usize) -> (TestHarness, Vec<String>) {
        let harness = TestHarness::new(4);
        let ids = seed(&harness.backend, resource_type, count);
        (harness, ids)
    }
}
