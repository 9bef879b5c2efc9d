//! In-memory backend with injectable eventual-consistency faults.
//!
//! Reads lag behind writes by configurable amounts, updates can be made to
//! collide with a simulated concurrent writer, and bursts of rate limiting
//! can be queued. Used by tests and by `resync simulate`.

use crate::api::{ApiError, ApiReply, ApiResult};
use crate::backend::{ListPage, ResourceBackend};
use crate::client::ClientHandle;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;
use uuid::Uuid;

/// Propagation delays applied to reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lag {
    /// How long a created resource reads as 404.
    pub create: Duration,
    /// How long reads return the pre-update body.
    pub update: Duration,
    /// How long a deleted resource stays readable.
    pub delete: Duration,
}

impl Lag {
    /// The same lag for every kind of write.
    pub fn uniform(lag: Duration) -> Self {
        Self {
            create: lag,
            update: lag,
            delete: lag,
        }
    }
}

/// Per-operation call counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// `get` calls.
    pub gets: u64,
    /// `list_page` calls.
    pub lists: u64,
    /// `create` calls.
    pub creates: u64,
    /// `update` calls.
    pub updates: u64,
    /// `delete` calls.
    pub deletes: u64,
}

impl CallCounts {
    /// Sum of every counter.
    pub fn total(&self) -> u64 {
        self.gets + self.lists + self.creates + self.updates + self.deletes
    }
}

#[derive(Default)]
struct Counters {
    gets: AtomicU64,
    lists: AtomicU64,
    creates: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
}

#[derive(Debug, Clone)]
struct Stored {
    current: Value,
    previous: Option<Value>,
    visible_at: Instant,
    stale_until: Instant,
    deleted_at: Option<Instant>,
}

#[derive(Default)]
struct State {
    resources: HashMap<String, BTreeMap<String, Stored>>,
    conflicts: HashMap<String, u32>,
    rate_limited: u32,
}

/// Versioned in-memory resource store.
pub struct MemoryBackend {
    state: Mutex<State>,
    lag: Lag,
    tombstones: bool,
    counters: Counters,
}

fn not_found(resource_type: &str, id: &str) -> ApiError {
    ApiError::status(404, "not.found", format!("{resource_type} {id} not found"))
}

fn version_of(value: &Value) -> u64 {
    value.get("version").and_then(Value::as_u64).unwrap_or(0)
}

impl MemoryBackend {
    /// Creates a backend where every write is visible immediately.
    pub fn new() -> Self {
        Self::with_lag(Lag::default())
    }

    /// Creates a backend with the given propagation lag.
    pub fn with_lag(lag: Lag) -> Self {
        Self {
            state: Mutex::new(State::default()),
            lag,
            tombstones: false,
            counters: Counters::default(),
        }
    }

    /// Deleted resources read as `state: "deleted"` while the delete lag lasts.
    pub fn with_tombstones(mut self) -> Self {
        self.tombstones = true;
        self
    }

    /// The configured lag.
    pub fn lag(&self) -> Lag {
        self.lag
    }

    /// Seeds a resource that is visible immediately. Returns its id.
    pub fn insert(&self, resource_type: &str, value: Value) -> String {
        let mut body = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let id = body
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        body.insert("id".into(), Value::from(id.clone()));
        body.entry("version").or_insert(Value::from(1));

        let now = Instant::now();
        self.state
            .lock()
            .resources
            .entry(resource_type.to_string())
            .or_default()
            .insert(
                id.clone(),
                Stored {
                    current: Value::Object(body),
                    previous: None,
                    visible_at: now,
                    stale_until: now,
                    deleted_at: None,
                },
            );
        id
    }

    /// Makes the next `count` writes to `id` collide with a concurrent writer.
    ///
    /// A colliding update bumps the stored version and fails with 409. A
    /// colliding delete fails with 409 without other effect.
    pub fn inject_conflicts(&self, id: &str, count: u32) {
        *self.state.lock().conflicts.entry(id.to_string()).or_default() += count;
    }

    /// Makes the next `count` calls fail with 429.
    pub fn inject_rate_limit(&self, count: u32) {
        self.state.lock().rate_limited += count;
    }

    /// Latest stored representation, ignoring lag. Not counted as a call.
    pub fn snapshot(&self, resource_type: &str, id: &str) -> Option<Value> {
        let state = self.state.lock();
        let stored = state.resources.get(resource_type)?.get(id)?;
        if stored.deleted_at.is_some() {
            return None;
        }
        Some(stored.current.clone())
    }

    /// Number of live resources of a type, ignoring lag.
    pub fn len(&self, resource_type: &str) -> usize {
        self.state
            .lock()
            .resources
            .get(resource_type)
            .map(|items| items.values().filter(|s| s.deleted_at.is_none()).count())
            .unwrap_or(0)
    }

    /// Returns true if no live resources of the type exist.
    pub fn is_empty(&self, resource_type: &str) -> bool {
        self.len(resource_type) == 0
    }

    /// Call counts so far.
    pub fn calls(&self) -> CallCounts {
        CallCounts {
            gets: self.counters.gets.load(Ordering::SeqCst),
            lists: self.counters.lists.load(Ordering::SeqCst),
            creates: self.counters.creates.load(Ordering::SeqCst),
            updates: self.counters.updates.load(Ordering::SeqCst),
            deletes: self.counters.deletes.load(Ordering::SeqCst),
        }
    }

    /// Resets call counts.
    pub fn reset_calls(&self) {
        for counter in [
            &self.counters.gets,
            &self.counters.lists,
            &self.counters.creates,
            &self.counters.updates,
            &self.counters.deletes,
        ] {
            counter.store(0, Ordering::SeqCst);
        }
    }

    fn admit(&self, state: &mut State, client: &ClientHandle) -> Result<(), ApiError> {
        if client.access_token().is_empty() {
            return Err(ApiError::status(401, "authentication.required", "missing bearer token"));
        }
        if state.rate_limited > 0 {
            state.rate_limited -= 1;
            return Err(ApiError::status(429, "too.many.requests", "rate limit exceeded"));
        }
        Ok(())
    }

    fn take_conflict(state: &mut State, id: &str) -> bool {
        match state.conflicts.get_mut(id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn tombstone(body: &Value) -> Value {
        let mut body = body.clone();
        if let Some(map) = body.as_object_mut() {
            map.insert("state".into(), Value::from("deleted"));
        }
        body
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("lag", &self.lag)
            .field("tombstones", &self.tombstones)
            .field("calls", &self.calls())
            .finish()
    }
}

impl ResourceBackend for MemoryBackend {
    fn get(&self, client: &ClientHandle, resource_type: &str, id: &str) -> ApiResult<Value> {
        self.counters.gets.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        self.admit(&mut state, client)?;

        let now = Instant::now();
        let items = state
            .resources
            .get_mut(resource_type)
            .ok_or_else(|| not_found(resource_type, id))?;
        let stored = items.get(id).ok_or_else(|| not_found(resource_type, id))?;

        if let Some(deleted_at) = stored.deleted_at {
            if now.duration_since(deleted_at) >= self.lag.delete {
                items.remove(id);
                return Err(not_found(resource_type, id));
            }
            let body = if self.tombstones {
                Self::tombstone(&stored.current)
            } else {
                stored.current.clone()
            };
            return Ok(ApiReply::ok(body));
        }
        if now < stored.visible_at {
            trace!(resource_type, id, "read before create propagated");
            return Err(not_found(resource_type, id));
        }
        match &stored.previous {
            Some(previous) if now < stored.stale_until => Ok(ApiReply::ok(previous.clone())),
            _ => Ok(ApiReply::ok(stored.current.clone())),
        }
    }

    fn list_page(
        &self,
        client: &ClientHandle,
        resource_type: &str,
        page_number: u32,
        page_size: u32,
    ) -> ApiResult<ListPage> {
        self.counters.lists.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        self.admit(&mut state, client)?;

        if page_number == 0 || page_size == 0 {
            return Err(ApiError::status(400, "bad.request", "pageNumber and pageSize start at 1"));
        }

        let now = Instant::now();
        let visible: Vec<&Value> = state
            .resources
            .get(resource_type)
            .map(|items| {
                items
                    .values()
                    .filter(|s| s.deleted_at.is_none() && now >= s.visible_at)
                    .map(|s| match &s.previous {
                        Some(previous) if now < s.stale_until => previous,
                        _ => &s.current,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let size = page_size as usize;
        let page_count = visible.len().div_ceil(size).max(1) as u32;
        let entities = visible
            .into_iter()
            .skip((page_number as usize - 1) * size)
            .take(size)
            .cloned()
            .collect();

        Ok(ApiReply::ok(ListPage {
            entities,
            page_number,
            page_count,
        }))
    }

    fn create(&self, client: &ClientHandle, resource_type: &str, body: &Value) -> ApiResult<Value> {
        self.counters.creates.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        self.admit(&mut state, client)?;

        let Some(fields) = body.as_object() else {
            return Err(ApiError::status(400, "bad.request", "body must be an object"));
        };

        let id = Uuid::new_v4().to_string();
        let mut stored = fields.clone();
        stored.insert("id".into(), Value::from(id.clone()));
        stored.insert("version".into(), Value::from(1));
        stored.insert("selfUri".into(), Value::from(format!("/api/v2/{resource_type}/{id}")));
        let value = Value::Object(stored);

        let now = Instant::now();
        state.resources.entry(resource_type.to_string()).or_default().insert(
            id,
            Stored {
                current: value.clone(),
                previous: None,
                visible_at: now + self.lag.create,
                stale_until: now,
                deleted_at: None,
            },
        );
        Ok(ApiReply::new(value, 201))
    }

    fn update(
        &self,
        client: &ClientHandle,
        resource_type: &str,
        id: &str,
        body: &Value,
    ) -> ApiResult<Value> {
        self.counters.updates.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        self.admit(&mut state, client)?;

        let Some(fields) = body.as_object() else {
            return Err(ApiError::status(400, "bad.request", "body must be an object"));
        };
        let conflict = Self::take_conflict(&mut state, id);

        let stored = state
            .resources
            .get_mut(resource_type)
            .and_then(|items| items.get_mut(id))
            .filter(|s| s.deleted_at.is_none())
            .ok_or_else(|| not_found(resource_type, id))?;

        let stored_version = version_of(&stored.current);
        if conflict {
            if let Some(map) = stored.current.as_object_mut() {
                map.insert("version".into(), Value::from(stored_version + 1));
            }
            return Err(ApiError::status(
                409,
                "version.mismatch",
                format!("{resource_type} {id} was modified concurrently"),
            ));
        }

        let expected = fields.get("version").and_then(Value::as_u64);
        if expected != Some(stored_version) {
            return Err(ApiError::status(
                409,
                "version.mismatch",
                format!(
                    "expected version {stored_version}, got {}",
                    expected.map_or_else(|| "none".to_string(), |v| v.to_string())
                ),
            ));
        }

        let previous = stored.current.clone();
        if let Some(map) = stored.current.as_object_mut() {
            for (key, value) in fields {
                if matches!(key.as_str(), "id" | "version" | "selfUri") {
                    continue;
                }
                map.insert(key.clone(), value.clone());
            }
            map.insert("version".into(), Value::from(stored_version + 1));
        }
        let now = Instant::now();
        stored.previous = Some(previous);
        stored.stale_until = now + self.lag.update;

        Ok(ApiReply::ok(stored.current.clone()))
    }

    fn delete(&self, client: &ClientHandle, resource_type: &str, id: &str) -> ApiResult<()> {
        self.counters.deletes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        self.admit(&mut state, client)?;

        let conflict = Self::take_conflict(&mut state, id);
        let items = state
            .resources
            .get_mut(resource_type)
            .ok_or_else(|| not_found(resource_type, id))?;
        if !items.get(id).is_some_and(|s| s.deleted_at.is_none()) {
            return Err(not_found(resource_type, id));
        }
        if conflict {
            return Err(ApiError::status(
                409,
                "version.mismatch",
                format!("{resource_type} {id} was modified concurrently"),
            ));
        }

        if self.lag.delete.is_zero() {
            items.remove(id);
        } else if let Some(stored) = items.get_mut(id) {
            stored.deleted_at = Some(Instant::now());
        }
        Ok(ApiReply::new((), 204))
    }
}
