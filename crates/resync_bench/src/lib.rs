//! Benchmark utilities.

use rand::Rng;
use serde_json::{json, Map, Value};

/// Generate a resource body with `fields` scalar fields and a member list.
pub fn random_resource(fields: usize, members: usize) -> Value {
    let mut rng = rand::thread_rng();
    let mut body = Map::new();
    for i in 0..fields {
        body.insert(format!("field{i}"), Value::from(rng.gen::<u32>()));
    }
    let members: Vec<Value> = (0..members)
        .map(|i| json!({"id": format!("member-{i}"), "weight": rng.gen_range(0..100)}))
        .collect();
    body.insert("members".into(), Value::Array(members));
    Value::Object(body)
}

/// Returns `desired` as the backend would report it: extra server fields
/// and the member list reversed.
pub fn remote_view(desired: &Value) -> Value {
    let mut remote = desired.clone();
    if let Some(map) = remote.as_object_mut() {
        map.insert("id".into(), Value::from("bench-id"));
        map.insert("version".into(), Value::from(3));
        map.insert("selfUri".into(), Value::from("/api/v2/queue/bench-id"));
        if let Some(Value::Array(members)) = map.get_mut("members") {
            members.reverse();
        }
    }
    remote
}

/// Generate a batch of resource ids.
pub fn generate_ids(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("resource-{i:06}")).collect()
}
