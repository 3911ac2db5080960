//! Payload shape validation
//!
//! Runs after the signature check and before any business logic. A payload
//! with a valid signature is still rejected when it is not a JSON object,
//! nests deeper than allowed, or lacks a required field.

use serde_json::{Map, Value};

use hg_common::{HookGuardError, InboundRequest, ProviderConfig, Result, SecurityViolation, ValidationFailure};
use hg_verify::lookup_path;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Parse the raw body into a JSON document and check it against the
/// provider's shape rules. Form-encoded bodies become a flat string object.
pub fn parse_and_validate(provider: &ProviderConfig, request: &InboundRequest, max_depth: usize) -> Result<Value> {
    let payload = if is_form(request) {
        parse_form(&request.raw_body)?
    } else {
        serde_json::from_slice::<Value>(&request.raw_body)
            .map_err(|e| SecurityViolation::MalformedPayload(format!("invalid JSON: {}", e)))?
    };

    if !payload.is_object() {
        return Err(SecurityViolation::MalformedPayload("top-level value must be an object".to_string()).into());
    }

    let depth = nesting_depth(&payload);
    if depth > max_depth {
        return Err(SecurityViolation::MalformedPayload(format!(
            "nesting depth {} exceeds limit of {}",
            depth, max_depth
        ))
        .into());
    }

    for field in &provider.required_fields {
        match lookup_path(&payload, field) {
            None | Some(Value::Null) => {
                return Err(ValidationFailure::MissingField(field.clone()).into());
            }
            Some(_) => {}
        }
    }

    if let Some(value) = lookup_path(&payload, &provider.event_type_field) {
        if !value.is_string() && !value.is_null() {
            return Err(HookGuardError::from(ValidationFailure::InvalidField {
                field: provider.event_type_field.clone(),
                message: "event type must be a string".to_string(),
            }));
        }
    }

    Ok(payload)
}

/// Containers on the deepest path; scalars are depth 0
pub fn nesting_depth(value: &Value) -> usize {
    let mut deepest = 0;
    let mut stack = vec![(value, 0usize)];

    while let Some((node, depth)) = stack.pop() {
        match node {
            Value::Object(map) => {
                deepest = deepest.max(depth + 1);
                stack.extend(map.values().map(|child| (child, depth + 1)));
            }
            Value::Array(items) => {
                deepest = deepest.max(depth + 1);
                stack.extend(items.iter().map(|child| (child, depth + 1)));
            }
            _ => {}
        }
    }
    deepest
}

fn is_form(request: &InboundRequest) -> bool {
    request
        .header("content-type")
        .map(|ct| ct.to_ascii_lowercase().starts_with(FORM_CONTENT_TYPE))
        .unwrap_or(false)
}

fn parse_form(body: &[u8]) -> Result<Value> {
    let text = std::str::from_utf8(body)
        .map_err(|_| SecurityViolation::MalformedPayload("form body is not UTF-8".to_string()))?;

    let mut fields = Map::new();
    for pair in text.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        fields.insert(decode(key)?, Value::String(decode(value)?));
    }
    Ok(Value::Object(fields))
}

fn decode(raw: &str) -> Result<String> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .map_err(|_| SecurityViolation::MalformedPayload(format!("invalid percent-encoding in '{}'", raw)).into())
}
