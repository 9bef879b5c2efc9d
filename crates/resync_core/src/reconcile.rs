//! Reconciliation of individual resources.
//!
//! Every operation follows the same shape: acquire a client from the pool,
//! perform the write (coordinated for updates), verify it against the
//! backend with the same client, and release the client. Reads and exports
//! go through the per-type cache.

use crate::backend::{resource_id, ResourceBackend};
use crate::cache::CacheRegistry;
use crate::classify::{is_version_mismatch, never};
use crate::client::ClientHandle;
use crate::config::{ProviderConfig, Timeouts};
use crate::consistency::{is_tombstoned, ConsistencyChecker};
use crate::coordinator::UpdateCoordinator;
use crate::error::{SyncError, SyncResult};
use crate::pool::ClientPool;
use crate::proxy::ResourceProxy;
use crate::retry::{NotFoundPolicy, Outcome, Retrier};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Counters for reconciliation work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    /// Resources created.
    pub creates: u64,
    /// Reads served.
    pub reads: u64,
    /// Resources updated.
    pub updates: u64,
    /// Resources deleted.
    pub deletes: u64,
    /// Version conflicts resolved by re-fetching.
    pub conflicts_resolved: u64,
    /// Read-back attempts spent verifying writes.
    pub verify_attempts: u64,
    /// Reads served from the cache.
    pub cache_hits: u64,
}

#[derive(Default)]
struct Counters {
    creates: AtomicU64,
    reads: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    conflicts_resolved: AtomicU64,
    verify_attempts: AtomicU64,
    cache_hits: AtomicU64,
}

/// Applies desired state to the backend through a shared client pool.
pub struct Reconciler<B> {
    pool: Arc<ClientPool<ClientHandle>>,
    backend: Arc<B>,
    caches: CacheRegistry,
    retrier: Retrier,
    coordinator: UpdateCoordinator,
    checker: ConsistencyChecker,
    timeouts: Timeouts,
    slow_delete: HashSet<String>,
    counters: Counters,
}

impl<B: ResourceBackend> Reconciler<B> {
    /// Creates a reconciler. Fails if the retry curve is not capped
    /// exponential.
    pub fn new(
        config: &ProviderConfig,
        pool: Arc<ClientPool<ClientHandle>>,
        backend: Arc<B>,
    ) -> SyncResult<Self> {
        config.retry.validate()?;
        let retrier = Retrier::new(config.retry.clone());
        Ok(Self {
            pool,
            backend,
            caches: CacheRegistry::new(),
            coordinator: UpdateCoordinator::new(retrier.clone(), is_version_mismatch),
            checker: ConsistencyChecker::new(retrier.clone()),
            retrier,
            timeouts: config.timeouts.clone(),
            slow_delete: HashSet::new(),
            counters: Counters::default(),
        })
    }

    /// Confirms deletes of `resource_type` under the slow-delete budget.
    pub fn with_slow_delete(mut self, resource_type: &str) -> Self {
        self.slow_delete.insert(resource_type.to_string());
        self
    }

    /// The shared pool.
    pub fn pool(&self) -> &Arc<ClientPool<ClientHandle>> {
        &self.pool
    }

    /// The per-type caches.
    pub fn caches(&self) -> &CacheRegistry {
        &self.caches
    }

    /// The timeout table in effect.
    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Returns a proxy for `resource_type` sharing this reconciler's cache.
    pub fn proxy(&self, resource_type: &str) -> ResourceProxy<B> {
        ResourceProxy::new(
            Arc::clone(&self.backend),
            resource_type,
            self.caches.for_type(resource_type),
            self.retrier.clone(),
            self.timeouts.clone(),
        )
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ReconcileStats {
        let c = &self.counters;
        ReconcileStats {
            creates: c.creates.load(Ordering::Relaxed),
            reads: c.reads.load(Ordering::Relaxed),
            updates: c.updates.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
            conflicts_resolved: c.conflicts_resolved.load(Ordering::Relaxed),
            verify_attempts: c.verify_attempts.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
        }
    }

    /// Creates a resource and waits until it reads back as written.
    pub fn create(&self, resource_type: &str, desired: &Value) -> SyncResult<Value> {
        if !desired.is_object() {
            return Err(SyncError::InvalidPayload(format!(
                "{resource_type} body must be a JSON object"
            )));
        }
        let client = self.pool.acquire()?;
        let proxy = self.proxy(resource_type);

        let created = proxy.create(&client, desired)?;
        let id = resource_id(&created)
            .ok_or_else(|| SyncError::InvalidResponse {
                resource_type: resource_type.to_string(),
                reason: "created resource has no id".into(),
            })?
            .to_string();

        let verified = self.verify(self.timeouts.create_verify, &proxy, &client, &id, desired)?;
        self.counters.creates.fetch_add(1, Ordering::Relaxed);
        info!(resource_type, id = %id, "created");
        Ok(verified)
    }

    /// Reads a resource. Returns `None` if it no longer exists.
    pub fn read(&self, resource_type: &str, id: &str) -> SyncResult<Option<Value>> {
        let client = self.pool.acquire()?;
        let proxy = self.proxy(resource_type);

        let state = self
            .retrier
            .with_retries_for_read(self.timeouts.read, NotFoundPolicy::Gone, |_| {
                Outcome::from_result(proxy.get_by_id(&client, id), &never)
            })?;
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        self.counters
            .cache_hits
            .fetch_add(proxy.cache_hits(), Ordering::Relaxed);
        Ok(state.found())
    }

    /// Applies `patch` with optimistic concurrency and waits until it reads back.
    pub fn update(&self, resource_type: &str, id: &str, patch: &Value) -> SyncResult<Value> {
        let Some(fields) = patch.as_object() else {
            return Err(SyncError::InvalidPayload(format!(
                "{resource_type} patch must be a JSON object"
            )));
        };
        let client = self.pool.acquire()?;
        let proxy = self.proxy(resource_type);

        let updated = self.coordinator.update(
            self.timeouts.update,
            resource_type,
            id,
            || self.backend.get(&client, resource_type, id),
            |_, version| {
                self.backend
                    .update(&client, resource_type, id, &versioned_body(fields, version))
            },
        )?;
        proxy.evict(id);

        let verified = self.verify(self.timeouts.update, &proxy, &client, id, patch)?;
        self.counters.updates.fetch_add(1, Ordering::Relaxed);
        self.counters
            .conflicts_resolved
            .fetch_add(u64::from(updated.conflicts), Ordering::Relaxed);
        info!(resource_type, id, attempts = updated.attempts, conflicts = updated.conflicts, "updated");
        Ok(verified)
    }

    /// Deletes a resource and waits until reads report it gone.
    ///
    /// Returns the read-back attempts used.
    pub fn delete(&self, resource_type: &str, id: &str) -> SyncResult<u32> {
        let client = self.pool.acquire()?;
        let proxy = self.proxy(resource_type);

        self.retrier.retry_when(&is_version_mismatch, || {
            match proxy.delete(&client, id) {
                Err(err) if err.is_not_found() => Ok(()),
                other => other,
            }
        })?;

        let budget = if self.slow_delete.contains(resource_type) {
            self.timeouts.slow_delete
        } else {
            self.timeouts.delete
        };
        let attempts = self.checker.confirm_deleted_when(
            budget,
            resource_type,
            id,
            || proxy.fetch(&client, id),
            is_tombstoned,
        )?;

        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.counters
            .verify_attempts
            .fetch_add(u64::from(attempts), Ordering::Relaxed);
        info!(resource_type, id, attempts, "deleted");
        Ok(attempts)
    }

    /// Resolves a resource id from its name.
    pub fn lookup_by_name(&self, resource_type: &str, name: &str) -> SyncResult<String> {
        let client = self.pool.acquire()?;
        self.proxy(resource_type).find_id_by_name(&client, name)
    }

    /// Lists every resource of a type, warming the cache for later reads.
    pub fn export(&self, resource_type: &str) -> SyncResult<Vec<Value>> {
        let client = self.pool.acquire()?;
        self.proxy(resource_type).list_all(&client)
    }

    fn verify(
        &self,
        deadline: Duration,
        proxy: &ResourceProxy<B>,
        client: &ClientHandle,
        id: &str,
        desired: &Value,
    ) -> SyncResult<Value> {
        let mut reads = 0u64;
        let result = self.checker.check_state(
            deadline,
            proxy.resource_type(),
            Some(id),
            desired,
            || {
                reads += 1;
                proxy.fetch(client, id)
            },
        );
        self.counters
            .verify_attempts
            .fetch_add(reads, Ordering::Relaxed);
        result
    }
}

fn versioned_body(fields: &Map<String, Value>, version: u64) -> Value {
    let mut body = fields.clone();
    body.insert("version".into(), Value::from(version));
    Value::Object(body)
}

impl<B> std::fmt::Debug for Reconciler<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("pool", &self.pool)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}
