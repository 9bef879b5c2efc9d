//! Deadline-bounded and attempt-bounded retry loops.
//!
//! [`Retrier::with_retries`] keeps calling an operation until it succeeds,
//! fails fatally, or the deadline passes. Every attempt reports an
//! [`Outcome`]; only `Retryable` outcomes are tried again. Sleeps follow the
//! configured backoff curve and are clipped so no sleep runs past the
//! deadline.
//!
//! [`Retrier::retry_when`] is the attempt-bounded variant used around single
//! mutations: it retries transient failures and failures the caller's
//! classifier matches.

use crate::classify::{is_transient, Classifier};
use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Result of a single attempt.
#[derive(Debug)]
pub enum Outcome<T> {
    /// The attempt produced a value.
    Success(T),
    /// The attempt failed but may succeed later.
    Retryable(SyncError),
    /// The attempt failed and retrying will not help.
    Fatal(SyncError),
}

impl<T> Outcome<T> {
    /// Classifies a result: errors the classifier matches (and transient
    /// failures) become retryable, everything else is fatal.
    pub fn from_result<C: Classifier + ?Sized>(result: SyncResult<T>, retryable: &C) -> Self {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(err) => classify_api_error(err, retryable),
        }
    }

    /// Returns true for `Success`.
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }
}

/// Turns an error into an outcome.
///
/// Rate limits, gateway failures and transport failures are always
/// retryable. Other backend errors are retryable only if `retryable`
/// matches. Errors that did not come from a backend call are fatal.
pub fn classify_api_error<T, C: Classifier + ?Sized>(err: SyncError, retryable: &C) -> Outcome<T> {
    match err.api_response() {
        Some(response) if is_transient(response) || retryable.matches(response) => {
            Outcome::Retryable(err)
        }
        _ => Outcome::Fatal(err),
    }
}

/// What a read should do when the resource does not exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundPolicy {
    /// Keep retrying; the resource may not have propagated yet.
    Retry,
    /// Report the resource as gone.
    Gone,
    /// Fail immediately.
    Fail,
}

/// Result of a read that tolerates absence.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadState<T> {
    /// The resource was read.
    Found(T),
    /// The resource does not exist.
    Gone,
}

impl<T> ReadState<T> {
    /// Returns the value, if found.
    pub fn found(self) -> Option<T> {
        match self {
            ReadState::Found(value) => Some(value),
            ReadState::Gone => None,
        }
    }
}

/// Attempt metadata handed to each attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext {
    /// 1-based attempt number.
    pub attempt: u32,
    /// When the first attempt started.
    pub started: Instant,
    /// When retrying stops.
    pub deadline: Instant,
}

impl RetryContext {
    /// Time left before the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Time since the first attempt started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

pub(crate) fn deadline_from(start: Instant, budget: Duration) -> Instant {
    start
        .checked_add(budget)
        .unwrap_or_else(|| start + Duration::from_secs(60 * 60 * 24 * 365))
}

/// Runs retry loops with a shared backoff configuration.
#[derive(Debug, Clone, Default)]
pub struct Retrier {
    config: RetryConfig,
}

impl Retrier {
    /// Creates a retrier.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the backoff configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Retries `op` until it succeeds, fails fatally, or `deadline` elapses.
    ///
    /// The first attempt always runs, even with a zero deadline. When the
    /// deadline passes the last retryable error is returned inside
    /// [`SyncError::DeadlineExceeded`].
    pub fn with_retries<T, F>(&self, deadline: Duration, mut op: F) -> SyncResult<T>
    where
        F: FnMut(&RetryContext) -> Outcome<T>,
    {
        let started = Instant::now();
        let deadline_at = deadline_from(started, deadline);
        let mut attempt = 0u32;

        loop {
            attempt = attempt.saturating_add(1);
            let ctx = RetryContext {
                attempt,
                started,
                deadline: deadline_at,
            };

            let err = match op(&ctx) {
                Outcome::Success(value) => {
                    if attempt > 1 {
                        debug!(attempt, elapsed = ?started.elapsed(), "succeeded after retrying");
                    }
                    return Ok(value);
                }
                Outcome::Fatal(err) => return Err(err),
                Outcome::Retryable(err) => err,
            };

            let remaining = ctx.remaining();
            if remaining.is_zero() {
                warn!(attempt, error = %err, "deadline exceeded");
                return Err(SyncError::DeadlineExceeded {
                    attempts: attempt,
                    elapsed: started.elapsed(),
                    last: Box::new(err),
                });
            }

            let delay = self.config.delay_for_attempt(attempt).min(remaining);
            debug!(attempt, ?delay, error = %err, "retrying");
            std::thread::sleep(delay);
        }
    }

    /// Like [`with_retries`](Self::with_retries), with explicit handling of
    /// not-found failures.
    pub fn with_retries_for_read<T, F>(
        &self,
        deadline: Duration,
        policy: NotFoundPolicy,
        mut op: F,
    ) -> SyncResult<ReadState<T>>
    where
        F: FnMut(&RetryContext) -> Outcome<T>,
    {
        self.with_retries(deadline, |ctx| match op(ctx) {
            Outcome::Success(value) => Outcome::Success(ReadState::Found(value)),
            Outcome::Retryable(err) | Outcome::Fatal(err) if err.is_not_found() => match policy {
                NotFoundPolicy::Retry => Outcome::Retryable(err),
                NotFoundPolicy::Gone => Outcome::Success(ReadState::Gone),
                NotFoundPolicy::Fail => Outcome::Fatal(err),
            },
            Outcome::Retryable(err) => Outcome::Retryable(err),
            Outcome::Fatal(err) => Outcome::Fatal(err),
        })
    }

    /// Retries `op` while its failure is transient or matches `classifier`,
    /// up to `max_attempts` attempts.
    pub fn retry_when<T, C, F>(&self, classifier: &C, mut op: F) -> SyncResult<T>
    where
        C: Classifier + ?Sized,
        F: FnMut() -> SyncResult<T>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let err = match op() {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let matched = err
                .api_response()
                .is_some_and(|response| is_transient(response) || classifier.matches(response));
            if !matched {
                return Err(err);
            }
            if attempt >= max_attempts {
                warn!(attempt, error = %err, "retry limit exceeded");
                return Err(SyncError::RetryLimitExceeded {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.config.delay_for_attempt(attempt);
            debug!(attempt, ?delay, error = %err, "retrying on classified failure");
            std::thread::sleep(delay);
        }
    }
}

/// [`Retrier::with_retries`] with the default backoff.
pub fn with_retries<T, F>(deadline: Duration, op: F) -> SyncResult<T>
where
    F: FnMut(&RetryContext) -> Outcome<T>,
{
    Retrier::default().with_retries(deadline, op)
}

/// [`Retrier::retry_when`] with the default backoff.
pub fn retry_when<T, C, F>(classifier: &C, op: F) -> SyncResult<T>
where
    C: Classifier + ?Sized,
    F: FnMut() -> SyncResult<T>,
{
    Retrier::default().retry_when(classifier, op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::classify::{is_status_404, is_version_mismatch, never};
    use crate::error::Phase;

    fn fast() -> Retrier {
        Retrier::new(
            RetryConfig::new(4)
                .with_initial_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(4)),
        )
    }

    fn api_err(status: u16) -> SyncError {
        SyncError::api(Phase::Read, "queue", Some("q-1"), ApiError::status(status, "x", "failed"))
    }

    #[test]
    fn succeeds_after_retryable_failures() {
        let mut calls = 0;
        let value = fast()
            .with_retries(Duration::from_secs(5), |ctx| {
                calls += 1;
                assert_eq!(ctx.attempt, calls);
                if calls < 3 {
                    Outcome::Retryable(api_err(404))
                } else {
                    Outcome::Success(calls)
                }
            })
            .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn fatal_short_circuits() {
        let mut calls = 0;
        let err = fast()
            .with_retries::<(), _>(Duration::from_secs(5), |_| {
                calls += 1;
                Outcome::Fatal(api_err(400))
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert_eq!(err.api_response().map(|r| r.status), Some(400));
    }

    #[test]
    fn zero_deadline_runs_once() {
        let mut calls = 0;
        let err = fast()
            .with_retries::<(), _>(Duration::ZERO, |_| {
                calls += 1;
                Outcome::Retryable(api_err(503))
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        match err {
            SyncError::DeadlineExceeded { attempts, last, .. } => {
                assert_eq!(attempts, 1);
                assert_eq!(last.api_response().map(|r| r.status), Some(503));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn deadline_bounds_total_time() {
        let retrier = Retrier::new(
            RetryConfig::default()
                .with_initial_delay(Duration::from_millis(20))
                .with_max_delay(Duration::from_millis(40)),
        );
        let started = Instant::now();
        let err = retrier
            .with_retries::<(), _>(Duration::from_millis(100), |_| Outcome::Retryable(api_err(404)))
            .unwrap_err();
        assert!(err.is_deadline_exceeded());
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn read_policies() {
        let retrier = fast();

        let gone = retrier
            .with_retries_for_read::<(), _>(Duration::from_secs(1), NotFoundPolicy::Gone, |_| {
                Outcome::Fatal(api_err(404))
            })
            .unwrap();
        assert_eq!(gone, ReadState::Gone);

        let mut calls = 0;
        let err = retrier
            .with_retries_for_read::<(), _>(Duration::from_secs(1), NotFoundPolicy::Fail, |_| {
                calls += 1;
                Outcome::Retryable(api_err(404))
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(err.is_not_found());

        let mut calls = 0;
        let found = retrier
            .with_retries_for_read(Duration::from_secs(1), NotFoundPolicy::Retry, |_| {
                calls += 1;
                if calls == 1 {
                    Outcome::Fatal(api_err(404))
                } else {
                    Outcome::Success("q")
                }
            })
            .unwrap();
        assert_eq!(found.found(), Some("q"));
    }

    #[test]
    fn retry_when_only_retries_matching_failures() {
        let mut calls = 0;
        let value = fast()
            .retry_when(&is_version_mismatch, || {
                calls += 1;
                if calls < 3 {
                    Err(api_err(409))
                } else {
                    Ok("deleted")
                }
            })
            .unwrap();
        assert_eq!(value, "deleted");

        let mut calls = 0;
        let err = fast()
            .retry_when::<(), _, _>(&is_version_mismatch, || {
                calls += 1;
                Err(api_err(404))
            })
            .unwrap_err();
        assert_eq!(calls, 1);
        assert!(err.is_not_found());
    }

    #[test]
    fn retry_when_retries_transient_failures() {
        let mut calls = 0;
        let value = fast()
            .retry_when(&never, || {
                calls += 1;
                match calls {
                    1 => Err(api_err(429)),
                    2 => Err(api_err(503)),
                    _ => Ok(calls),
                }
            })
            .unwrap();
        assert_eq!(value, 3);

        let mut calls = 0;
        let err = fast()
            .retry_when::<(), _, _>(&never, || {
                calls += 1;
                Err(api_err(429))
            })
            .unwrap_err();
        assert_eq!(calls, 4);
        assert!(matches!(err, SyncError::RetryLimitExceeded { attempts: 4, .. }));
    }

    #[test]
    fn retry_when_is_attempt_bounded() {
        let mut calls = 0;
        let err = fast()
            .retry_when::<(), _, _>(&is_status_404, || {
                calls += 1;
                Err(api_err(404))
            })
            .unwrap_err();
        assert_eq!(calls, 4);
        assert!(matches!(err, SyncError::RetryLimitExceeded { attempts: 4, .. }));
    }

    #[test]
    fn classification() {
        let outcome: Outcome<()> = classify_api_error(api_err(429), &never);
        assert!(matches!(outcome, Outcome::Retryable(_)));

        let outcome: Outcome<()> = classify_api_error(api_err(404), &never);
        assert!(matches!(outcome, Outcome::Fatal(_)));

        let outcome: Outcome<()> = classify_api_error(api_err(404), &is_status_404);
        assert!(matches!(outcome, Outcome::Retryable(_)));

        let outcome: Outcome<()> = classify_api_error(SyncError::PoolClosed, &is_status_404);
        assert!(matches!(outcome, Outcome::Fatal(_)));

        assert!(Outcome::from_result(Ok(1), &never).is_success());
    }
}
