//! Deduplication fingerprint of (workflow name, input).
//!
//! Two start requests with the same workflow name and semantically equal
//! input produce the same hash, which the store uses to find an execution
//! that is already running.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Compute the lowercase hex SHA-256 of `{"input": .., "workflow_name": ..}`.
///
/// Object keys are sorted at every level before encoding so the digest does
/// not depend on the order in which the input was built.
pub fn generate_input_hash(workflow_name: &str, input: &Value) -> Result<String, serde_json::Error> {
    let mut envelope = Map::new();
    envelope.insert("input".to_string(), canonicalize(input));
    envelope.insert(
        "workflow_name".to_string(),
        Value::String(workflow_name.to_string()),
    );

    let bytes = serde_json::to_vec(&Value::Object(envelope))?;
    let digest = Sha256::digest(&bytes);
    Ok(format!("{:x}", digest))
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
