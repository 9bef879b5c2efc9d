//! Read-after-write verification against an eventually consistent backend.
//!
//! A mutation is considered visible once a read returns a representation
//! whose fields are a superset of what was written. Computed fields the
//! caller never set are ignored, and arrays compare without regard to
//! order since the backend is free to reorder them.

use crate::classify::never;
use crate::error::{SyncError, SyncResult};
use crate::retry::{classify_api_error, NotFoundPolicy, Outcome, ReadState, Retrier};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// First field at which the remote representation differs from the desired one.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMismatch {
    /// Dotted path of the field (`members[1].role`).
    pub path: String,
    /// Desired value.
    pub expected: Value,
    /// Remote value, `None` when the field is absent.
    pub actual: Option<Value>,
}

impl fmt::Display for FieldMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = if self.path.is_empty() { "<root>" } else { &self.path };
        match &self.actual {
            Some(actual) => write!(f, "field {path}: expected {}, found {actual}", self.expected),
            None => write!(f, "field {path}: expected {}, found nothing", self.expected),
        }
    }
}

/// Checks that every field set in `desired` has the same value in `actual`.
///
/// - `null` in `desired` means "not set" and always matches.
/// - Objects compare only the keys present in `desired`.
/// - Arrays must have the same length; each desired element must match a
///   distinct actual element, in any order.
/// - An empty desired array matches an absent or `null` field.
/// - Numbers compare by value (`1` equals `1.0`).
pub fn subset_matches(desired: &Value, actual: &Value) -> Result<(), FieldMismatch> {
    compare(String::new(), desired, Some(actual))
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn mismatch(path: String, desired: &Value, actual: Option<&Value>) -> Result<(), FieldMismatch> {
    Err(FieldMismatch {
        path,
        expected: desired.clone(),
        actual: actual.cloned(),
    })
}

fn compare(path: String, desired: &Value, actual: Option<&Value>) -> Result<(), FieldMismatch> {
    let actual = actual.filter(|v| !v.is_null());

    match desired {
        Value::Null => Ok(()),
        Value::Object(fields) => {
            let remote = actual.and_then(Value::as_object);
            if actual.is_some() && remote.is_none() {
                return mismatch(path, desired, actual);
            }
            for (key, value) in fields {
                compare(join(&path, key), value, remote.and_then(|r| r.get(key)))?;
            }
            Ok(())
        }
        Value::Array(items) => match actual {
            None if items.is_empty() => Ok(()),
            Some(Value::Array(remote)) if remote.len() == items.len() => {
                match unmatched_element(items, remote) {
                    Some(i) => mismatch(format!("{path}[{i}]"), &items[i], None),
                    None => Ok(()),
                }
            }
            _ => mismatch(path, desired, actual),
        },
        Value::Number(n) => match actual {
            Some(Value::Number(m)) if n == m || n.as_f64() == m.as_f64() => Ok(()),
            _ => mismatch(path, desired, actual),
        },
        scalar => match actual {
            Some(value) if value == scalar => Ok(()),
            _ => mismatch(path, desired, actual),
        },
    }
}

/// Pairs every desired element with a distinct remote element it matches.
///
/// Returns the index of the first desired element left without a partner
/// in a maximum matching, or `None` when all of them are paired.
fn unmatched_element(items: &[Value], remote: &[Value]) -> Option<usize> {
    let candidates: Vec<Vec<usize>> = items
        .iter()
        .map(|item| {
            remote
                .iter()
                .enumerate()
                .filter_map(|(j, candidate)| {
                    compare(String::new(), item, Some(candidate)).is_ok().then_some(j)
                })
                .collect()
        })
        .collect();

    // owner[j] is the desired element currently paired with remote[j].
    let mut owner: Vec<Option<usize>> = vec![None; remote.len()];
    for i in 0..items.len() {
        let mut seen = vec![false; remote.len()];
        if !assign(i, &candidates, &mut owner, &mut seen) {
            return Some(i);
        }
    }
    None
}

fn assign(
    i: usize,
    candidates: &[Vec<usize>],
    owner: &mut [Option<usize>],
    seen: &mut [bool],
) -> bool {
    for &j in &candidates[i] {
        if seen[j] {
            continue;
        }
        seen[j] = true;
        let free = match owner[j] {
            None => true,
            Some(other) => assign(other, candidates, owner, seen),
        };
        if free {
            owner[j] = Some(i);
            return true;
        }
    }
    false
}

/// Returns true for objects reporting `state: "deleted"`.
pub fn is_tombstoned(value: &Value) -> bool {
    value
        .get("state")
        .and_then(Value::as_str)
        .is_some_and(|state| state.eq_ignore_ascii_case("deleted"))
}

/// Polls the backend until it reflects a mutation.
#[derive(Debug, Clone, Default)]
pub struct ConsistencyChecker {
    retrier: Retrier,
}

impl ConsistencyChecker {
    /// Creates a checker.
    pub fn new(retrier: Retrier) -> Self {
        Self { retrier }
    }

    /// Re-reads until the remote state contains `desired`.
    ///
    /// Not-found reads and mismatches are retried until `deadline`. Returns
    /// the matching remote representation. A resource that never became
    /// readable fails with [`SyncError::NotYetVisible`] as the last error.
    pub fn check_state<F>(
        &self,
        deadline: Duration,
        resource_type: &str,
        id: Option<&str>,
        desired: &Value,
        mut read: F,
    ) -> SyncResult<Value>
    where
        F: FnMut() -> SyncResult<Value>,
    {
        let state = self
            .retrier
            .with_retries_for_read(deadline, NotFoundPolicy::Retry, |ctx| match read() {
                Ok(actual) => match subset_matches(desired, &actual) {
                    Ok(()) => Outcome::Success(actual),
                    Err(mismatch) => {
                        debug!(
                            resource_type,
                            id = id.unwrap_or_default(),
                            attempt = ctx.attempt,
                            %mismatch,
                            "remote state not yet consistent"
                        );
                        Outcome::Retryable(SyncError::Mismatch {
                            resource_type: resource_type.to_string(),
                            id: id.map(str::to_string),
                            mismatch,
                        })
                    }
                },
                Err(err) if err.is_not_found() => match id {
                    Some(id) => Outcome::Retryable(SyncError::NotYetVisible {
                        resource_type: resource_type.to_string(),
                        id: id.to_string(),
                    }),
                    None => Outcome::Retryable(err),
                },
                Err(err) => classify_api_error(err, &never),
            })?;

        match state {
            ReadState::Found(actual) => Ok(actual),
            ReadState::Gone => Err(SyncError::NotFound {
                resource_type: resource_type.to_string(),
                key: id.unwrap_or_default().to_string(),
            }),
        }
    }

    /// Re-reads until the resource is gone. Returns the attempts used.
    pub fn confirm_deleted<F>(
        &self,
        deadline: Duration,
        resource_type: &str,
        id: &str,
        read: F,
    ) -> SyncResult<u32>
    where
        F: FnMut() -> SyncResult<Value>,
    {
        self.confirm_deleted_when(deadline, resource_type, id, read, |_| false)
    }

    /// Re-reads until the resource is gone or `tombstoned` accepts what the
    /// backend returned. Returns the attempts used.
    pub fn confirm_deleted_when<F, P>(
        &self,
        deadline: Duration,
        resource_type: &str,
        id: &str,
        mut read: F,
        tombstoned: P,
    ) -> SyncResult<u32>
    where
        F: FnMut() -> SyncResult<Value>,
        P: Fn(&Value) -> bool,
    {
        self.retrier.with_retries(deadline, |ctx| match read() {
            Ok(value) if tombstoned(&value) => Outcome::Success(ctx.attempt),
            Ok(_) => Outcome::Retryable(SyncError::StillExists {
                resource_type: resource_type.to_string(),
                id: id.to_string(),
            }),
            Err(err) if err.is_not_found() => Outcome::Success(ctx.attempt),
            Err(err) => classify_api_error(err, &never),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::config::RetryConfig;
    use crate::error::Phase;
    use serde_json::json;

    fn checker() -> ConsistencyChecker {
        ConsistencyChecker::new(Retrier::new(
            RetryConfig::default()
                .with_initial_delay(Duration::from_millis(1))
                .with_max_delay(Duration::from_millis(2)),
        ))
    }

    fn not_found() -> SyncError {
        SyncError::api(Phase::Verify, "user", Some("u-1"), ApiError::status(404, "not.found", "no such user"))
    }

    #[test]
    fn computed_fields_are_ignored() {
        let desired = json!({"name": "support", "division": {"id": "d1"}});
        let actual = json!({
            "id": "q-1",
            "name": "support",
            "version": 3,
            "division": {"id": "d1", "name": "Home", "selfUri": "/d1"}
        });
        assert!(subset_matches(&desired, &actual).is_ok());
    }

    #[test]
    fn reports_first_differing_field() {
        let desired = json!({"name": "support", "division": {"id": "d2"}});
        let actual = json!({"name": "support", "division": {"id": "d1"}});
        let err = subset_matches(&desired, &actual).unwrap_err();
        assert_eq!(err.path, "division.id");
        assert_eq!(err.expected, json!("d2"));
        assert_eq!(err.actual, Some(json!("d1")));
        assert_eq!(err.to_string(), r#"field division.id: expected "d2", found "d1""#);
    }

    #[test]
    fn null_means_unset() {
        let desired = json!({"description": null, "name": "a"});
        assert!(subset_matches(&desired, &json!({"name": "a"})).is_ok());
    }

    #[test]
    fn arrays_compare_unordered() {
        let desired = json!({"skills": [{"id": "b"}, {"id": "a"}]});
        let actual = json!({"skills": [{"id": "a", "name": "A"}, {"id": "b", "name": "B"}]});
        assert!(subset_matches(&desired, &actual).is_ok());

        let shorter = json!({"skills": [{"id": "a"}]});
        assert!(subset_matches(&shorter, &actual).is_err());

        let duplicated = json!({"skills": [{"id": "a"}, {"id": "a"}]});
        assert!(subset_matches(&duplicated, &actual).is_err());
    }

    #[test]
    fn arrays_pair_loose_elements_after_specific_ones() {
        let desired = json!({"m": [{"id": "a"}, {"id": "a", "r": "x"}]});
        let actual = json!({"m": [{"id": "a", "r": "x"}, {"id": "a", "r": "y"}]});
        assert!(subset_matches(&desired, &actual).is_ok());

        let reversed = json!({"m": [{"id": "a", "r": "y"}, {"id": "a", "r": "x"}]});
        assert!(subset_matches(&desired, &reversed).is_ok());

        let unpaired = json!({"m": [{"id": "a", "r": "x"}, {"id": "a", "r": "x"}]});
        let err = subset_matches(&unpaired, &actual).unwrap_err();
        assert_eq!(err.path, "m[1]");
    }

    #[test]
    fn empty_array_matches_absent_field() {
        let desired = json!({"members": []});
        assert!(subset_matches(&desired, &json!({})).is_ok());
        assert!(subset_matches(&desired, &json!({"members": null})).is_ok());
        assert!(subset_matches(&desired, &json!({"members": [1]})).is_err());
        assert!(subset_matches(&json!({"members": [1]}), &json!({})).is_err());
    }

    #[test]
    fn numbers_compare_by_value() {
        assert!(subset_matches(&json!({"w": 1}), &json!({"w": 1.0})).is_ok());
        assert!(subset_matches(&json!({"w": 1}), &json!({"w": 2})).is_err());
        assert!(subset_matches(&json!({"w": 1}), &json!({"w": "1"})).is_err());
    }

    #[test]
    fn check_state_waits_for_propagation() {
        let desired = json!({"name": "new"});
        let mut reads = 0;
        let value = checker()
            .check_state(Duration::from_secs(2), "queue", Some("q-1"), &desired, || {
                reads += 1;
                match reads {
                    1 => Err(not_found()),
                    2 => Ok(json!({"name": "old"})),
                    _ => Ok(json!({"name": "new", "version": 2})),
                }
            })
            .unwrap();
        assert_eq!(reads, 3);
        assert_eq!(value["version"], 2);
    }

    #[test]
    fn check_state_reports_invisible_resource() {
        let err = checker()
            .check_state(Duration::from_millis(10), "user", Some("u-1"), &json!({}), || {
                Err(not_found())
            })
            .unwrap_err();
        assert!(matches!(
            err.last_retryable(),
            Some(SyncError::NotYetVisible { .. })
        ));
    }

    #[test]
    fn check_state_retries_not_found_without_id() {
        let mut reads = 0;
        let value = checker()
            .check_state(Duration::from_secs(2), "user", None, &json!({"name": "ann"}), || {
                reads += 1;
                if reads < 3 {
                    Err(not_found())
                } else {
                    Ok(json!({"id": "u-1", "name": "ann"}))
                }
            })
            .unwrap();
        assert_eq!(reads, 3);
        assert_eq!(value["id"], "u-1");

        let err = checker()
            .check_state(Duration::from_millis(10), "user", None, &json!({}), || Err(not_found()))
            .unwrap_err();
        assert!(err.is_deadline_exceeded());
        assert!(err.last_retryable().is_some_and(SyncError::is_not_found));
    }

    #[test]
    fn check_state_reports_last_mismatch() {
        let err = checker()
            .check_state(Duration::from_millis(20), "queue", None, &json!({"name": "new"}), || {
                Ok(json!({"name": "old"}))
            })
            .unwrap_err();
        assert!(matches!(
            err.last_retryable(),
            Some(SyncError::Mismatch { .. })
        ));
    }

    #[test]
    fn confirm_deleted_counts_attempts() {
        let mut reads = 0;
        let attempts = checker()
            .confirm_deleted(Duration::from_secs(2), "user", "u-1", || {
                reads += 1;
                if reads < 3 {
                    Ok(json!({"id": "u-1"}))
                } else {
                    Err(not_found())
                }
            })
            .unwrap();
        assert_eq!(attempts, 3);
    }

    #[test]
    fn confirm_deleted_accepts_tombstones() {
        let attempts = checker()
            .confirm_deleted_when(
                Duration::from_secs(1),
                "group",
                "g-1",
                || Ok(json!({"id": "g-1", "state": "deleted"})),
                is_tombstoned,
            )
            .unwrap();
        assert_eq!(attempts, 1);
    }

    #[test]
    fn confirm_deleted_fails_fast_on_other_errors() {
        let mut reads = 0;
        let err = checker()
            .confirm_deleted(Duration::from_secs(1), "user", "u-1", || {
                reads += 1;
                Err(SyncError::api(Phase::Verify, "user", Some("u-1"), ApiError::status(403, "forbidden", "no")))
            })
            .unwrap_err();
        assert_eq!(reads, 1);
        assert_eq!(err.api_response().map(|r| r.status), Some(403));
    }
}
