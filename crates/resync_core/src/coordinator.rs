//! Optimistic-concurrency updates.
//!
//! The backend rejects a write whose `version` is not the current one. Each
//! attempt therefore reads the current representation, submits the update
//! with the version it just read, and starts over from the read if another
//! writer got there first. A version never outlives the attempt that read
//! it.

use crate::api::ApiResult;
use crate::classify::{never, Classifier};
use crate::error::{Phase, SyncError, SyncResult};
use crate::retry::{classify_api_error, Outcome, Retrier};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A representation carrying an optimistic-concurrency version.
pub trait Versioned {
    /// Current version, if the representation has one.
    fn version(&self) -> Option<u64>;
}

impl Versioned for Value {
    fn version(&self) -> Option<u64> {
        self.get("version").and_then(Value::as_u64)
    }
}

/// Result of a coordinated update.
#[derive(Debug, Clone, PartialEq)]
pub struct Updated<T> {
    /// Value returned by the successful write.
    pub value: T,
    /// Fetch/apply cycles used.
    pub attempts: u32,
    /// Writes rejected because the version was stale.
    pub conflicts: u32,
}

enum UpdateStep<R> {
    Fetch,
    Apply { current: R, version: u64 },
}

/// Drives fetch/apply cycles until a write lands or the deadline passes.
#[derive(Clone)]
pub struct UpdateCoordinator {
    retrier: Retrier,
    conflict: Arc<dyn Classifier>,
}

impl UpdateCoordinator {
    /// Creates a coordinator that treats responses matching `conflict` as
    /// version conflicts.
    pub fn new(retrier: Retrier, conflict: impl Classifier + 'static) -> Self {
        Self {
            retrier,
            conflict: Arc::new(conflict),
        }
    }

    /// Updates `id` with fresh-version retries.
    ///
    /// `fetch` reads the current representation; `apply` receives it with
    /// its version and submits the write. Conflicts and transient failures
    /// restart from `fetch`; any other failure is returned immediately.
    pub fn update<R, T, Fe, Ap>(
        &self,
        deadline: Duration,
        resource_type: &str,
        id: &str,
        mut fetch: Fe,
        mut apply: Ap,
    ) -> SyncResult<Updated<T>>
    where
        R: Versioned,
        Fe: FnMut() -> ApiResult<R>,
        Ap: FnMut(&R, u64) -> ApiResult<T>,
    {
        let mut attempts = 0;
        let mut conflicts = 0;

        let value = self.retrier.with_retries(deadline, |ctx| {
            attempts = ctx.attempt;
            let mut step = UpdateStep::Fetch;
            loop {
                step = match step {
                    UpdateStep::Fetch => match fetch() {
                        Ok(reply) => match reply.value.version() {
                            Some(version) => UpdateStep::Apply {
                                current: reply.value,
                                version,
                            },
                            None => return Outcome::Fatal(SyncError::MissingVersion),
                        },
                        Err(err) => {
                            let err = SyncError::api(Phase::Fetch, resource_type, Some(id), err);
                            return classify_api_error(err, &never);
                        }
                    },
                    UpdateStep::Apply { current, version } => match apply(&current, version) {
                        Ok(reply) => return Outcome::Success(reply.value),
                        Err(err) => {
                            let is_conflict = self.conflict.matches(&err.response);
                            let err = SyncError::api(Phase::Apply, resource_type, Some(id), err);
                            if is_conflict {
                                conflicts += 1;
                                debug!(resource_type, id, version, attempt = ctx.attempt, "version conflict");
                                return Outcome::Retryable(err);
                            }
                            return classify_api_error(err, &never);
                        }
                    },
                };
            }
        })?;

        Ok(Updated {
            value,
            attempts,
            conflicts,
        })
    }
}

impl std::fmt::Debug for UpdateCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateCoordinator")
            .field("retrier", &self.retrier)
            .finish_non_exhaustive()
    }
}
