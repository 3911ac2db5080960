//! Event identity
//!
//! The provider-supplied id wins. Without one the id is a digest of the
//! provider and the exact payload bytes, so a re-delivery of identical bytes
//! maps to the same id and any change to the payload maps to a new one.

use serde_json::Value;
use sha2::{Digest, Sha256};

const DERIVED_PREFIX: &str = "derived_";

/// Look up a dot-separated path (`data.object.id`) in a JSON document
pub fn lookup_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(payload, |node, segment| node.get(segment))
}

/// Provider-supplied id at `field`, when it is a non-empty string or an integer
pub fn extract_event_id(payload: &Value, field: &str) -> Option<String> {
    match lookup_path(payload, field)? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
        _ => None,
    }
}

pub fn derive_event_id(provider_id: &str, raw_payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(raw_payload);
    format!("{}{}", DERIVED_PREFIX, hex::encode(hasher.finalize()))
}

/// Extracted id if present, derived id otherwise
pub fn resolve_event_id(provider_id: &str, raw_payload: &[u8], parsed: Option<&Value>, field: &str) -> String {
    parsed
        .and_then(|payload| extract_event_id(payload, field))
        .unwrap_or_else(|| derive_event_id(provider_id, raw_payload))
}
