use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// The four lifecycle operations a broker exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Provision,
    Deprovision,
    Bind,
    Unbind,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Provision => "provision",
            OperationKind::Deprovision => "deprovision",
            OperationKind::Bind => "bind",
            OperationKind::Unbind => "unbind",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Provisioning,
    Succeeded,
    Failed,
    Deprovisioning,
    Gone,
}

impl InstanceState {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Provisioning => "provisioning",
            InstanceState::Succeeded => "succeeded",
            InstanceState::Failed => "failed",
            InstanceState::Deprovisioning => "deprovisioning",
            InstanceState::Gone => "gone",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingState {
    Binding,
    Bound,
    /// The provisioner failed to create or remove the binding.
    Failed,
    Unbinding,
    Gone,
}

impl BindingState {
    pub fn as_str(self) -> &'static str {
        match self {
            BindingState::Binding => "binding",
            BindingState::Bound => "bound",
            BindingState::Failed => "failed",
            BindingState::Unbinding => "unbinding",
            BindingState::Gone => "gone",
        }
    }

    /// Whether the binding still counts against deprovisioning its instance.
    pub fn is_live(self) -> bool {
        self != BindingState::Gone
    }
}

impl fmt::Display for BindingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    InProgress,
    Succeeded,
    Failed,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        self != OperationStatus::InProgress
    }

    /// Wire form used by the last-operation endpoints.
    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::InProgress => "in progress",
            OperationStatus::Succeeded => "succeeded",
            OperationStatus::Failed => "failed",
        }
    }
}

/// A service instance as stored in the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub parameters: serde_json::Value,
    pub state: InstanceState,
    pub dashboard_url: Option<String>,
    pub last_operation_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// A service binding as stored in the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingRecord {
    pub instance_id: String,
    pub binding_id: String,
    pub service_id: String,
    pub plan_id: String,
    pub parameters: serde_json::Value,
    /// Provisioner-generated credentials. `None` until the binding is `Bound`.
    pub credentials: Option<serde_json::Value>,
    pub state: BindingState,
    pub last_operation_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// The resource an operation acts on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationTarget {
    pub instance_id: String,
    pub binding_id: Option<String>,
}

impl OperationTarget {
    pub fn instance(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            binding_id: None,
        }
    }

    pub fn binding(instance_id: impl Into<String>, binding_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            binding_id: Some(binding_id.into()),
        }
    }
}

/// A tracked lifecycle operation, pollable until terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub operation_id: String,
    pub kind: OperationKind,
    pub target: OperationTarget,
    pub status: OperationStatus,
    pub description: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

/// Idempotency key: `(kind, instance_id, binding_id?)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub kind: OperationKind,
    pub instance_id: String,
    pub binding_id: Option<String>,
}

impl IdempotencyKey {
    pub fn instance(kind: OperationKind, instance_id: impl Into<String>) -> Self {
        Self {
            kind,
            instance_id: instance_id.into(),
            binding_id: None,
        }
    }

    pub fn binding(
        kind: OperationKind,
        instance_id: impl Into<String>,
        binding_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            instance_id: instance_id.into(),
            binding_id: Some(binding_id.into()),
        }
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.binding_id {
            Some(binding_id) => write!(f, "{}:{}/{}", self.kind, self.instance_id, binding_id),
            None => write!(f, "{}:{}", self.kind, self.instance_id),
        }
    }
}

/// Last-seen request fingerprint and the result snapshot returned for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub fingerprint: String,
    /// Opaque to storage; the lifecycle engine owns its shape.
    pub result: serde_json::Value,
    /// Incremented on every `update_result`. Starts at 0.
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

/// Outcome of `put_if_absent_or_matching`.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyClaim {
    /// No record existed; the given result is now stored at version 0.
    Claimed(IdempotencyRecord),
    /// A record with the same fingerprint already existed and is returned unchanged.
    Existing(IdempotencyRecord),
}
