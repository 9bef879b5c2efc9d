//! Stress tests for resync.
//!
//! These tests verify pool bounds and reconciler convergence under heavy
//! concurrent load.

use crate::fixtures::{scenarios, TestHarness};
use resync_core::ClientPool;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
    /// Highest number of clients observed checked out at once.
    pub peak_concurrency: usize,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
            peak_concurrency: 0,
        }
    }

    /// Records the observed peak concurrency.
    #[must_use]
    pub fn with_peak_concurrency(mut self, peak: usize) -> Self {
        self.peak_concurrency = peak;
        self
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
        println!("Peak concurrency: {}", self.peak_concurrency);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of operations to perform.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Number of distinct resources.
    pub resource_count: usize,
    /// Version conflicts injected per resource before each update.
    pub conflicts_per_update: u32,
    /// Time a checked-out client is held.
    pub hold: Duration,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 1_000,
            threads: 8,
            resource_count: 32,
            conflicts_per_update: 0,
            hold: Duration::ZERO,
        }
    }
}

/// Run a concurrent acquire/release stress test against a pool.
///
/// Every thread acquires, holds and releases a client in a loop. The peak
/// number of simultaneously held clients is recorded in the result.
pub fn stress_pool_churn<C: Send + 'static>(pool: &ClientPool<C>, config: &StressConfig) -> StressTestResult {
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let outstanding = AtomicUsize::new(0);
    let peak = AtomicUsize::new(0);
    let ops_per_thread = config.operations / config.threads.max(1);

    let start = Instant::now();

    thread::scope(|scope| {
        for _ in 0..config.threads {
            scope.spawn(|| {
                for _ in 0..ops_per_thread {
                    match pool.acquire() {
                        Ok(client) => {
                            let now = outstanding.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            if config.hold.is_zero() {
                                thread::yield_now();
                            } else {
                                thread::sleep(config.hold);
                            }
                            outstanding.fetch_sub(1, Ordering::SeqCst);
                            drop(client);
                            successful.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            });
        }
    });

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
    .with_peak_concurrency(peak.load(Ordering::SeqCst))
}

/// Run a concurrent update stress test through the reconciler.
///
/// Resources are partitioned across threads so every verification reads
/// back the owning thread's last write. Conflicts are injected before
/// each update when configured.
pub fn stress_concurrent_updates(
    harness: &TestHarness,
    resource_type: &str,
    config: &StressConfig,
) -> StressTestResult {
    let ids = scenarios::seed(&harness.backend, resource_type, config.resource_count);
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let threads = config.threads.max(1);
    let ops_per_thread = config.operations / threads;

    let start = Instant::now();

    thread::scope(|scope| {
        for t in 0..threads {
            let owned: Vec<&String> = ids.iter().skip(t).step_by(threads).collect();
            let successful = &successful;
            let failed = &failed;
            scope.spawn(move || {
                if owned.is_empty() {
                    return;
                }
                for i in 0..ops_per_thread {
                    let id = owned[i % owned.len()];
                    if config.conflicts_per_update > 0 {
                        harness.backend.inject_conflicts(id, config.conflicts_per_update);
                    }
                    let patch = json!({"description": format!("thread {t} op {i}")});
                    match harness.reconciler.update(resource_type, id, &patch) {
                        Ok(_) => successful.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            });
        }
    });

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

/// Run a create/read/delete lifecycle stress test through the reconciler.
pub fn stress_lifecycle(
    harness: &TestHarness,
    resource_type: &str,
    config: &StressConfig,
) -> StressTestResult {
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let threads = config.threads.max(1);
    let ops_per_thread = config.operations / threads;

    let start = Instant::now();

    thread::scope(|scope| {
        for t in 0..threads {
            let successful = &successful;
            let failed = &failed;
            scope.spawn(move || {
                for i in 0..ops_per_thread {
                    let desired = json!({"name": format!("{resource_type}-{t}-{i}")});
                    let result = harness
                        .reconciler
                        .create(resource_type, &desired)
                        .and_then(|created| {
                            let id = created["id"].as_str().unwrap_or_default().to_string();
                            harness.reconciler.read(resource_type, &id)?;
                            harness.reconciler.delete(resource_type, &id)
                        });
                    match result {
                        Ok(_) => successful.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            });
        }
    });

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use resync_core::{PoolConfig, SyncError};

    #[test]
    fn test_pool_churn() {
        let pool = ClientPool::init(PoolConfig::new(4), Ok::<usize, SyncError>).unwrap();
        let config = StressConfig {
            operations: 2_000,
            threads: 16,
            ..Default::default()
        };

        let result = stress_pool_churn(&pool, &config);
        result.print_summary("Pool Churn");

        assert_eq!(result.failed_ops, 0);
        assert!(result.peak_concurrency <= 4);
        assert_eq!(pool.metrics().active, 0);
        assert_eq!(pool.metrics().available, 4);
    }

    #[test]
    fn test_pool_churn_with_hold() {
        let pool = ClientPool::init(PoolConfig::new(2), Ok::<usize, SyncError>).unwrap();
        let config = StressConfig {
            operations: 40,
            threads: 8,
            hold: Duration::from_millis(2),
            ..Default::default()
        };

        let result = stress_pool_churn(&pool, &config);
        assert_eq!(result.successful_ops, 40);
        assert_eq!(result.peak_concurrency, 2);
    }

    #[test]
    fn test_concurrent_updates() {
        let harness = TestHarness::new(4);
        let config = StressConfig {
            operations: 64,
            threads: 4,
            resource_count: 8,
            ..Default::default()
        };

        let result = stress_concurrent_updates(&harness, "queue", &config);
        result.print_summary("Concurrent Updates");

        assert_eq!(result.failed_ops, 0);
        assert_eq!(harness.reconciler.stats().updates, 64);
        assert_eq!(harness.pool.metrics().active, 0);
    }

    #[test]
    fn test_concurrent_updates_with_conflicts() {
        let harness = TestHarness::new(3);
        let config = StressConfig {
            operations: 24,
            threads: 3,
            resource_count: 6,
            conflicts_per_update: 2,
            ..Default::default()
        };

        let result = stress_concurrent_updates(&harness, "group", &config);

        assert_eq!(result.failed_ops, 0);
        assert_eq!(harness.reconciler.stats().conflicts_resolved, 48);
    }

    #[test]
    fn test_lifecycle_under_lag() {
        let harness = TestHarness::lagging(3, Duration::from_millis(5));
        let config = StressConfig {
            operations: 12,
            threads: 4,
            ..Default::default()
        };

        let result = stress_lifecycle(&harness, "skill", &config);
        result.print_summary("Lifecycle Under Lag");

        assert_eq!(result.failed_ops, 0);
        assert_eq!(harness.backend.len("skill"), 0);
        let stats = harness.reconciler.stats();
        assert_eq!((stats.creates, stats.deletes), (12, 12));
    }
}
