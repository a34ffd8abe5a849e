//! Typed requests and responses of the lifecycle engine.

use broker_storage::{
    BindingRecord, BindingState, InstanceRecord, InstanceState, OperationKind, OperationRecord,
    OperationStatus,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    /// Opaque JSON object. `null` is treated the same as `{}`.
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub accepts_incomplete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeprovisionRequest {
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub accepts_incomplete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindRequest {
    pub instance_id: String,
    pub binding_id: String,
    pub service_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub accepts_incomplete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnbindRequest {
    pub instance_id: String,
    pub binding_id: String,
    pub service_id: String,
    pub plan_id: String,
    #[serde(default)]
    pub accepts_incomplete: bool,
}

/// What a lifecycle operation produced.
///
/// This is also the shape stored in the idempotency record once an
/// operation is settled, so a replay returns exactly the same value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LifecycleResponse {
    Succeeded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dashboard_url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credentials: Option<serde_json::Value>,
    },
    Accepted { operation_id: String },
}

impl LifecycleResponse {
    pub(crate) fn empty_success() -> Self {
        LifecycleResponse::Succeeded {
            dashboard_url: None,
            credentials: None,
        }
    }
}

/// A response plus whether it was replayed from the idempotency store.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub response: LifecycleResponse,
    /// `true` when no new work was started for this request.
    pub replayed: bool,
}

impl Decision {
    pub(crate) fn fresh(response: LifecycleResponse) -> Self {
        Self {
            response,
            replayed: false,
        }
    }

    pub(crate) fn replay(response: LifecycleResponse) -> Self {
        Self {
            response,
            replayed: true,
        }
    }
}

/// Pollable view of an operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationState {
    pub operation_id: String,
    pub kind: OperationKind,
    pub instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding_id: Option<String>,
    pub status: OperationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl From<OperationRecord> for OperationState {
    fn from(op: OperationRecord) -> Self {
        Self {
            operation_id: op.operation_id,
            kind: op.kind,
            instance_id: op.target.instance_id,
            binding_id: op.target.binding_id,
            status: op.status,
            description: op.description,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceView {
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub parameters: serde_json::Value,
    pub state: InstanceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
}

impl From<InstanceRecord> for InstanceView {
    fn from(r: InstanceRecord) -> Self {
        Self {
            instance_id: r.instance_id,
            service_id: r.service_id,
            plan_id: r.plan_id,
            parameters: r.parameters,
            state: r.state,
            dashboard_url: r.dashboard_url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BindingView {
    pub instance_id: String,
    pub binding_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub parameters: serde_json::Value,
    pub state: BindingState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<serde_json::Value>,
}

impl From<BindingRecord> for BindingView {
    fn from(r: BindingRecord) -> Self {
        Self {
            instance_id: r.instance_id,
            binding_id: r.binding_id,
            service_id: r.service_id,
            plan_id: r.plan_id,
            parameters: r.parameters,
            state: r.state,
            credentials: r.credentials,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_is_tagged_by_outcome() {
        let accepted = LifecycleResponse::Accepted {
            operation_id: "op-1".into(),
        };
        assert_eq!(
            serde_json::to_value(&accepted).unwrap(),
            serde_json::json!({"outcome": "accepted", "operation_id": "op-1"})
        );
        assert_eq!(
            serde_json::to_value(LifecycleResponse::empty_success()).unwrap(),
            serde_json::json!({"outcome": "succeeded"})
        );
    }

    #[test]
    fn request_defaults_optional_fields() {
        let req: ProvisionRequest = serde_json::from_value(serde_json::json!({
            "instance_id": "i-1",
            "service_id": "svc",
            "plan_id": "plan",
        }))
        .unwrap();
        assert!(req.parameters.is_null());
        assert!(!req.accepts_incomplete);
    }
}
