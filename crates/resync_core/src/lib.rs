//! # resync core
//!
//! Resilient synchronization against a rate-limited, eventually consistent
//! REST backend.
//!
//! This crate provides:
//! - A bounded pool of pre-authorized clients shared by concurrent workers
//! - Deadline-bounded and attempt-bounded retry with classified failures
//! - Optimistic-concurrency updates with fresh-version retries
//! - Read-after-write verification by subset equality
//! - A per-type resource cache filled by bulk enumeration
//! - HTTP and in-memory backends behind one trait
//!
//! ## Architecture
//!
//! A [`Reconciler`] owns no clients itself. Every operation:
//! 1. Acquires a client from the shared [`ClientPool`]
//! 2. Performs the write, through the [`UpdateCoordinator`] for updates
//! 3. Verifies the write with the [`ConsistencyChecker`] using the same client
//! 4. Releases the client
//!
//! ## Key Invariants
//!
//! - At most `capacity` clients are ever checked out
//! - No retry loop runs past its deadline
//! - A version is only submitted by the attempt that read it
//! - A write is reported successful only once it reads back

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

mod api;
mod backend;
mod cache;
pub mod classify;
mod client;
mod config;
mod consistency;
mod coordinator;
mod error;
mod http;
mod memory;
mod pool;
mod proxy;
mod reconcile;
mod retry;

pub use api::{ApiError, ApiErrorBody, ApiReply, ApiResponse, ApiResult};
pub use backend::{resource_id, ListPage, ResourceBackend};
pub use cache::{CacheRegistry, ResourceCache};
pub use classify::Classifier;
pub use client::{Authenticator, ClientHandle, Credentials, StaticTokenAuthenticator, TransportSettings};
pub use config::{
    PoolConfig, ProviderConfig, RetryConfig, Timeouts, CREATE_VERIFY_TIMEOUT, DEFAULT_POOL_CAPACITY,
    DELETE_TIMEOUT, MAX_POOL_CAPACITY, MIN_POOL_CAPACITY, NAME_LOOKUP_TIMEOUT, POOL_INIT_TIMEOUT,
    READ_TIMEOUT, SLOW_DELETE_TIMEOUT, UPDATE_TIMEOUT,
};
pub use consistency::{is_tombstoned, subset_matches, ConsistencyChecker, FieldMismatch};
pub use coordinator::{UpdateCoordinator, Updated, Versioned};
pub use error::{Phase, SyncError, SyncResult};
pub use http::{HttpBackend, HttpClient, HttpRequest, HttpResponse, Method};
pub use memory::{CallCounts, Lag, MemoryBackend};
pub use pool::{with_pooled_client, ClientPool, PoolMetrics, PooledClient};
pub use proxy::{ResourceProxy, DEFAULT_PAGE_SIZE};
pub use reconcile::{ReconcileStats, Reconciler};
pub use retry::{
    classify_api_error, retry_when, with_retries, NotFoundPolicy, Outcome, ReadState, Retrier,
    RetryContext,
};
