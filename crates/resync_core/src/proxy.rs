//! Typed access to one resource type, fronted by the resource cache.

use crate::backend::{resource_id, ResourceBackend};
use crate::cache::ResourceCache;
use crate::classify::{is_rate_limited, never};
use crate::client::ClientHandle;
use crate::config::Timeouts;
use crate::error::{Phase, SyncError, SyncResult};
use crate::retry::{deadline_from, Outcome, Retrier};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Default listing page size.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// CRUD for a single resource type.
pub struct ResourceProxy<B> {
    backend: Arc<B>,
    resource_type: String,
    cache: Arc<ResourceCache<Value>>,
    retrier: Retrier,
    timeouts: Timeouts,
    page_size: u32,
    cache_hits: AtomicU64,
}

impl<B: ResourceBackend> ResourceProxy<B> {
    /// Creates a proxy.
    pub fn new(
        backend: Arc<B>,
        resource_type: impl Into<String>,
        cache: Arc<ResourceCache<Value>>,
        retrier: Retrier,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            backend,
            resource_type: resource_type.into(),
            cache,
            retrier,
            timeouts,
            page_size: DEFAULT_PAGE_SIZE,
            cache_hits: AtomicU64::new(0),
        }
    }

    /// Sets the listing page size.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Resource type served by this proxy.
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Reads served from the cache.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Lists every resource, page by page, and caches each one by id.
    pub fn list_all(&self, client: &ClientHandle) -> SyncResult<Vec<Value>> {
        let entities = self.fetch_all(client, self.timeouts.read)?;
        let added = self.cache.populate(
            entities
                .iter()
                .filter_map(|e| resource_id(e).map(|id| (id.to_string(), e.clone()))),
        );
        info!(resource_type = %self.resource_type, count = entities.len(), cached = added, "listed resources");
        Ok(entities)
    }

    /// Reads every page, retrying each one for at most `budget` from the
    /// start of the listing.
    fn fetch_all(&self, client: &ClientHandle, budget: Duration) -> SyncResult<Vec<Value>> {
        let deadline = deadline_from(Instant::now(), budget);
        let mut entities = Vec::new();
        let mut page_number = 1;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let page = self.retrier.with_retries(remaining, |_| {
                let result = self
                    .backend
                    .list_page(client, &self.resource_type, page_number, self.page_size)
                    .map(|reply| reply.value)
                    .map_err(|e| SyncError::api(Phase::List, &self.resource_type, None, e));
                Outcome::from_result(result, &never)
            })?;
            entities.extend(page.entities.iter().cloned());
            if !page.has_more() {
                return Ok(entities);
            }
            page_number += 1;
        }
    }

    /// Returns the cached entity if present, otherwise reads it.
    pub fn get_by_id(&self, client: &ClientHandle, id: &str) -> SyncResult<Value> {
        if let Some(entity) = self.cache.get(id) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(resource_type = %self.resource_type, id, "cache hit");
            return Ok(entity);
        }
        self.fetch(client, id)
    }

    /// Reads an entity from the backend, bypassing the cache.
    pub fn fetch(&self, client: &ClientHandle, id: &str) -> SyncResult<Value> {
        self.backend
            .get(client, &self.resource_type, id)
            .map(|reply| reply.value)
            .map_err(|e| SyncError::api(Phase::Read, &self.resource_type, Some(id), e))
    }

    /// Finds the id of the resource called `name`.
    ///
    /// A freshly created resource may take a while to show up in listings,
    /// so absence is retried until the lookup budget is spent. Listing
    /// retries share the same budget.
    pub fn find_id_by_name(&self, client: &ClientHandle, name: &str) -> SyncResult<String> {
        self.retrier.with_retries(self.timeouts.name_lookup, |ctx| {
            let entities = match self.fetch_all(client, ctx.remaining()) {
                Ok(entities) => entities,
                Err(err) => return Outcome::Fatal(err),
            };
            let found = entities.iter().find_map(|entity| {
                let matches = entity.get("name").and_then(Value::as_str) == Some(name);
                matches.then(|| resource_id(entity)).flatten()
            });
            match found {
                Some(id) => Outcome::Success(id.to_string()),
                None => Outcome::Retryable(SyncError::NotFound {
                    resource_type: self.resource_type.clone(),
                    key: name.to_string(),
                }),
            }
        })
        .map_err(|err| match err {
            SyncError::DeadlineExceeded { last, .. } if last.is_not_found() => *last,
            other => other,
        })
    }

    /// Creates a resource. Rate-limited attempts are retried.
    pub fn create(&self, client: &ClientHandle, body: &Value) -> SyncResult<Value> {
        self.retrier.retry_when(&is_rate_limited, || {
            self.backend
                .create(client, &self.resource_type, body)
                .map(|reply| reply.value)
                .map_err(|e| SyncError::api(Phase::Create, &self.resource_type, None, e))
        })
    }

    /// Issues a delete and evicts the cached copy.
    pub fn delete(&self, client: &ClientHandle, id: &str) -> SyncResult<()> {
        self.cache.delete(id);
        self.backend
            .delete(client, &self.resource_type, id)
            .map(|_| ())
            .map_err(|e| SyncError::api(Phase::Delete, &self.resource_type, Some(id), e))
    }

    /// Drops the cached copy of `id`.
    pub fn evict(&self, id: &str) {
        self.cache.delete(id);
    }
}

impl<B> std::fmt::Debug for ResourceProxy<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceProxy")
            .field("resource_type", &self.resource_type)
            .field("cached", &self.cache.len())
            .field("page_size", &self.page_size)
            .finish()
    }
}
