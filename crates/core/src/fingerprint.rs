//! Request fingerprints for idempotency matching.
//!
//! A fingerprint is the SHA-256 hex digest of the compact JSON encoding of
//! the fields that define a request. `serde_json::Map` is backed by a
//! `BTreeMap`, so object keys are emitted sorted and two parameter objects
//! that differ only in key order fingerprint identically.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

fn digest(fields: Value) -> String {
    let canonical = fields.to_string();
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

/// Missing parameters and an empty object mean the same request.
fn normalize(parameters: &Value) -> Value {
    match parameters {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    }
}

pub fn provision(service_id: &str, plan_id: &str, parameters: &Value) -> String {
    digest(json!(["provision", service_id, plan_id, normalize(parameters)]))
}

pub fn deprovision(service_id: &str, plan_id: &str) -> String {
    digest(json!(["deprovision", service_id, plan_id]))
}

pub fn bind(binding_id: &str, service_id: &str, plan_id: &str, parameters: &Value) -> String {
    digest(json!([
        "bind",
        binding_id,
        service_id,
        plan_id,
        normalize(parameters)
    ]))
}

pub fn unbind(binding_id: &str, service_id: &str, plan_id: &str) -> String {
    digest(json!(["unbind", binding_id, service_id, plan_id]))
}
