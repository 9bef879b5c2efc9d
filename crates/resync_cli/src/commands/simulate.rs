//! Simulate command implementation.

use resync_core::{
    ClientHandle, ClientPool, Credentials, Lag, MemoryBackend, PoolConfig, PoolMetrics,
    ProviderConfig, ReconcileStats, Reconciler, RetryConfig, StaticTokenAuthenticator, SyncError,
};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    /// Number of pooled clients.
    pub pool_size: usize,
    /// Number of concurrent workers.
    pub workers: usize,
    /// Number of resources to reconcile.
    pub resources: usize,
    /// Version conflicts injected per resource.
    pub conflicts: u32,
    /// Propagation lag in milliseconds.
    pub lag_ms: u64,
}

/// Pool state after a simulation.
#[derive(Debug, Serialize)]
pub struct PoolReport {
    /// Pool capacity.
    pub capacity: usize,
    /// Handles still checked out.
    pub active: usize,
    /// Handles idle in the pool.
    pub available: usize,
    /// Successful acquires.
    pub total_acquires: u64,
    /// Releases.
    pub total_releases: u64,
    /// Acquires that timed out.
    pub acquire_timeouts: u64,
}

impl From<PoolMetrics> for PoolReport {
    fn from(m: PoolMetrics) -> Self {
        Self {
            capacity: m.capacity,
            active: m.active,
            available: m.available,
            total_acquires: m.total_acquires,
            total_releases: m.total_releases,
            acquire_timeouts: m.acquire_timeouts,
        }
    }
}

/// Simulation result.
#[derive(Debug, Serialize)]
pub struct SimulateReport {
    /// Resources that completed the full lifecycle.
    pub completed: usize,
    /// Resources whose lifecycle failed.
    pub failed: usize,
    /// Wall-clock time in milliseconds.
    pub elapsed_ms: u128,
    /// Reconciler counters.
    pub stats: ReconcileStats,
    /// Pool state after all workers finished.
    pub pool: PoolReport,
    #[serde(skip)]
    metrics: Option<PoolMetrics>,
}

fn simulation_backoff() -> RetryConfig {
    RetryConfig::default()
        .with_initial_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(500))
}

/// Runs create, update, read and delete for every resource across workers.
pub fn simulate(options: &SimulateOptions) -> Result<SimulateReport, SyncError> {
    if options.workers == 0 {
        return Err(SyncError::InvalidConfig("workers must be at least 1".into()));
    }

    let config = ProviderConfig::new("memory://", Credentials::new("simulator", "simulator"))
        .with_pool(PoolConfig::new(options.pool_size))
        .with_retry(simulation_backoff());
    config.validate()?;

    let backend = Arc::new(MemoryBackend::with_lag(Lag::uniform(Duration::from_millis(
        options.lag_ms,
    ))));
    let auth = Arc::new(StaticTokenAuthenticator::new("simulated-token"));
    let pool = Arc::new(ClientPool::init(
        config.pool.clone(),
        ClientHandle::factory(&config, auth),
    )?);
    let reconciler = Reconciler::new(&config, Arc::clone(&pool), Arc::clone(&backend))?;

    info!(
        pool_size = options.pool_size,
        workers = options.workers,
        resources = options.resources,
        "starting simulation"
    );

    let completed = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let start = Instant::now();

    thread::scope(|scope| {
        for worker in 0..options.workers {
            let reconciler = &reconciler;
            let backend = &backend;
            let completed = &completed;
            let failed = &failed;
            scope.spawn(move || {
                for n in (worker..options.resources).step_by(options.workers) {
                    let result = lifecycle(reconciler, backend, n, options.conflicts);
                    match result {
                        Ok(()) => completed.fetch_add(1, Ordering::Relaxed),
                        Err(e) => {
                            warn!(resource = n, error = %e, "lifecycle failed");
                            failed.fetch_add(1, Ordering::Relaxed)
                        }
                    };
                }
            });
        }
    });

    let metrics = pool.metrics();
    Ok(SimulateReport {
        completed: completed.load(Ordering::Relaxed),
        failed: failed.load(Ordering::Relaxed),
        elapsed_ms: start.elapsed().as_millis(),
        stats: reconciler.stats(),
        pool: metrics.into(),
        metrics: Some(metrics),
    })
}

fn lifecycle(
    reconciler: &Reconciler<MemoryBackend>,
    backend: &MemoryBackend,
    n: usize,
    conflicts: u32,
) -> Result<(), SyncError> {
    let created = reconciler.create(
        "queue",
        &json!({
            "name": format!("queue-{n}"),
            "members": [{"id": format!("agent-{n}")}, {"id": "supervisor"}],
        }),
    )?;
    let id = created["id"].as_str().unwrap_or_default().to_string();

    if conflicts > 0 {
        backend.inject_conflicts(&id, conflicts);
    }
    reconciler.update(
        "queue",
        &id,
        &json!({"description": format!("reconciled by simulation {n}")}),
    )?;
    reconciler.read("queue", &id)?;
    reconciler.delete("queue", &id)?;
    Ok(())
}

/// Runs the simulate command.
pub fn run(options: &SimulateOptions, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let report = simulate(options)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            println!("Simulation Summary");
            println!("==================");
            println!("Completed: {}", report.completed);
            println!("Failed: {}", report.failed);
            println!("Elapsed: {}ms", report.elapsed_ms);
            println!();
            println!("Creates: {}", report.stats.creates);
            println!("Updates: {}", report.stats.updates);
            println!("Deletes: {}", report.stats.deletes);
            println!("Reads: {}", report.stats.reads);
            println!("Conflicts resolved: {}", report.stats.conflicts_resolved);
            println!("Verify attempts: {}", report.stats.verify_attempts);
            println!("Cache hits: {}", report.stats.cache_hits);
            if let Some(metrics) = &report.metrics {
                println!();
                println!("Pool: {}", metrics);
            }
        }
    }

    if report.failed > 0 {
        return Err(format!("{} resource(s) failed to reconcile", report.failed).into());
    }
    Ok(())
}
