//! Decision-point hooks.
//!
//! The engine reports what it decided to a [`LifecycleObserver`] instead of
//! logging inline. [`TracingObserver`] is the default and turns every hook
//! into a structured `tracing` event.

use broker_storage::{OperationKind, OperationTarget};

use crate::error::BrokerError;

pub trait LifecycleObserver: Send + Sync + 'static {
    /// A resource moved from one state to another.
    fn transition(&self, kind: OperationKind, target: &OperationTarget, from: &str, to: &str);

    /// A request was answered from the idempotency store.
    fn replayed(&self, kind: OperationKind, target: &OperationTarget);

    /// A request was refused without calling the provisioner.
    fn rejected(&self, kind: OperationKind, target: &OperationTarget, error: &BrokerError);

    fn provisioner_failed(&self, kind: OperationKind, target: &OperationTarget, detail: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl LifecycleObserver for TracingObserver {
    fn transition(&self, kind: OperationKind, target: &OperationTarget, from: &str, to: &str) {
        tracing::info!(
            kind = %kind,
            instance_id = %target.instance_id,
            binding_id = target.binding_id.as_deref(),
            from,
            to,
            "state transition"
        );
    }

    fn replayed(&self, kind: OperationKind, target: &OperationTarget) {
        tracing::debug!(
            kind = %kind,
            instance_id = %target.instance_id,
            binding_id = target.binding_id.as_deref(),
            "replayed recorded result"
        );
    }

    fn rejected(&self, kind: OperationKind, target: &OperationTarget, error: &BrokerError) {
        tracing::warn!(
            kind = %kind,
            instance_id = %target.instance_id,
            binding_id = target.binding_id.as_deref(),
            code = error.code(),
            "{error}"
        );
    }

    fn provisioner_failed(&self, kind: OperationKind, target: &OperationTarget, detail: &str) {
        tracing::error!(
            kind = %kind,
            instance_id = %target.instance_id,
            binding_id = target.binding_id.as_deref(),
            detail,
            "provisioner failed"
        );
    }
}
