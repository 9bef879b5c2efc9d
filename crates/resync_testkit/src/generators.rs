//! Property-based test generators using proptest.
//!
//! Provides strategies for resource payloads, desired/actual pairs that
//! must read back as consistent, and valid backoff curves.

use proptest::prelude::*;
use resync_core::RetryConfig;
use serde_json::{Map, Value};
use std::time::Duration;

/// Strategy for generating resource type names.
pub fn resource_type_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z_]{2,15}").expect("Invalid regex")
}

/// Strategy for generating field names.
pub fn field_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-zA-Z]{0,11}").expect("Invalid regex")
}

/// Strategy for generating non-null scalar JSON values.
pub fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(Value::from),
        prop::string::string_regex("[a-zA-Z0-9 ._-]{0,24}")
            .expect("Invalid regex")
            .prop_map(Value::String),
    ]
}

/// Strategy for generating field values: scalars or arrays of scalars.
pub fn field_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        3 => scalar_strategy(),
        1 => prop::collection::vec(scalar_strategy(), 0..6).prop_map(Value::Array),
    ]
}

/// Strategy for generating a desired resource body.
pub fn desired_strategy() -> impl Strategy<Value = Value> {
    prop::collection::btree_map(field_name_strategy(), field_value_strategy(), 1..8)
        .prop_map(|fields| Value::Object(fields.into_iter().collect()))
}

/// A desired body and a remote body that should satisfy it.
#[derive(Debug, Clone)]
pub struct ConsistentPair {
    /// The body the caller asked for.
    pub desired: Value,
    /// The body the backend reports.
    pub actual: Value,
}

/// Strategy for generating a desired body with a superset of it as the
/// remote state.
///
/// The remote body carries extra server-assigned fields and lists every
/// array in a rotated order.
pub fn consistent_pair_strategy() -> impl Strategy<Value = ConsistentPair> {
    (
        desired_strategy(),
        prop::collection::btree_map(field_name_strategy(), scalar_strategy(), 0..4),
        any::<usize>(),
    )
        .prop_map(|(desired, extras, rotation)| {
            let mut actual = Map::new();
            for (key, value) in extras {
                actual.insert(format!("server_{key}"), value);
            }
            if let Value::Object(fields) = &desired {
                for (key, value) in fields {
                    actual.insert(key.clone(), rotated(value, rotation));
                }
            }
            actual.insert("version".into(), Value::from(1));
            ConsistentPair {
                desired,
                actual: Value::Object(actual),
            }
        })
}

fn rotated(value: &Value, rotation: usize) -> Value {
    match value {
        Value::Array(items) if !items.is_empty() => {
            let mut items = items.clone();
            let by = rotation % items.len();
            items.rotate_left(by);
            Value::Array(items)
        }
        other => other.clone(),
    }
}

/// Strategy for generating valid retry configurations.
pub fn retry_config_strategy() -> impl Strategy<Value = RetryConfig> {
    (1u64..500, 1u64..=40, 11u32..=40, 1u32..=20).prop_map(
        |(initial_ms, spread, multiplier_tenths, attempts)| {
            RetryConfig::new(attempts)
                .with_initial_delay(Duration::from_millis(initial_ms))
                .with_max_delay(Duration::from_millis(initial_ms * spread))
                .with_backoff_multiplier(f64::from(multiplier_tenths) / 10.0)
        },
    )
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resync_core::subset_matches;

    proptest! {
        #![proptest_config(PropTestConfig::default().to_proptest_config())]

        #[test]
        fn superset_satisfies_desired(pair in consistent_pair_strategy()) {
            prop_assert!(subset_matches(&pair.desired, &pair.actual).is_ok());
        }

        #[test]
        fn desired_matches_itself(desired in desired_strategy()) {
            prop_assert!(subset_matches(&desired, &desired).is_ok());
        }

        #[test]
        fn changed_field_is_reported(pair in consistent_pair_strategy(), key in field_name_strategy()) {
            let mut desired = pair.desired.clone();
            let field = format!("changed_{key}");
            desired[&field] = Value::from("expected");
            let mut actual = pair.actual.clone();
            actual[&field] = Value::from("something else");

            let mismatch = subset_matches(&desired, &actual).unwrap_err();
            prop_assert_eq!(mismatch.path, field);
        }

        #[test]
        fn missing_field_is_reported(pair in consistent_pair_strategy()) {
            let mut desired = pair.desired.clone();
            desired["absent_field"] = Value::from(7);
            let mismatch = subset_matches(&desired, &pair.actual).unwrap_err();
            prop_assert!(mismatch.actual.is_none());
        }
    }

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn backoff_grows_then_plateaus(config in retry_config_strategy()) {
            prop_assert!(config.validate().is_ok());

            let mut previous = Duration::ZERO;
            for attempt in 1..64 {
                let delay = config.nominal_delay(attempt);
                prop_assert!(delay <= config.max_delay);
                prop_assert!(delay >= previous);
                if previous == config.max_delay {
                    prop_assert_eq!(delay, config.max_delay);
                }
                previous = delay;
            }
            prop_assert_eq!(config.nominal_delay(63), config.max_delay);
        }

        #[test]
        fn jitter_stays_within_a_quarter(config in retry_config_strategy(), attempt in 1u32..16) {
            let nominal = config.nominal_delay(attempt);
            let jittered = config.delay_for_attempt(attempt);
            prop_assert!(jittered >= nominal);
            prop_assert!(jittered <= nominal.mul_f64(1.25) + Duration::from_micros(1));
        }

        #[test]
        fn resource_type_is_lowercase(name in resource_type_strategy()) {
            prop_assert!(name.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }
}
