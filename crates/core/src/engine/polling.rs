//! Read paths and retention.
//!
//! Nothing here mutates lifecycle state. The only writes are removals of
//! operations and `Gone` resources whose retention window has passed.

use broker_storage::{BindingState, BrokerStorage, InstanceState};
use serde::Serialize;

use super::LifecycleEngine;
use crate::error::BrokerError;
use crate::request::{BindingView, InstanceView, OperationState};

/// What one retention sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub operations: usize,
    pub instances: usize,
    pub bindings: usize,
}

impl<S: BrokerStorage> LifecycleEngine<S> {
    /// Status and description of an operation. Expired operations are
    /// purged on sight and reported as not found.
    pub async fn poll_operation(&self, operation_id: &str) -> Result<OperationState, BrokerError> {
        let not_found = || BrokerError::OperationNotFound {
            operation_id: operation_id.to_string(),
        };
        if self
            .storage
            .purge_operation_if_expired(operation_id, self.retention_cutoff())
            .await?
        {
            return Err(not_found());
        }
        self.storage
            .get_operation(operation_id)
            .await?
            .map(OperationState::from)
            .ok_or_else(not_found)
    }

    /// Poll an instance-level operation. Without an explicit id the
    /// instance's most recent operation is used.
    pub async fn last_operation(
        &self,
        instance_id: &str,
        operation_id: Option<&str>,
    ) -> Result<OperationState, BrokerError> {
        let instance = self
            .storage
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| BrokerError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })?;
        let operation_id = operation_id
            .map(str::to_string)
            .or(instance.last_operation_id)
            .ok_or_else(|| BrokerError::OperationNotFound {
                operation_id: String::new(),
            })?;
        let state = self.poll_operation(&operation_id).await?;
        if state.instance_id != instance_id || state.binding_id.is_some() {
            return Err(BrokerError::OperationNotFound { operation_id });
        }
        Ok(state)
    }

    pub async fn last_binding_operation(
        &self,
        instance_id: &str,
        binding_id: &str,
        operation_id: Option<&str>,
    ) -> Result<OperationState, BrokerError> {
        let binding = self
            .storage
            .get_binding(instance_id, binding_id)
            .await?
            .ok_or_else(|| BrokerError::BindingNotFound {
                instance_id: instance_id.to_string(),
                binding_id: binding_id.to_string(),
            })?;
        let operation_id = operation_id
            .map(str::to_string)
            .or(binding.last_operation_id)
            .ok_or_else(|| BrokerError::OperationNotFound {
                operation_id: String::new(),
            })?;
        let state = self.poll_operation(&operation_id).await?;
        if state.instance_id != instance_id || state.binding_id.as_deref() != Some(binding_id) {
            return Err(BrokerError::OperationNotFound { operation_id });
        }
        Ok(state)
    }

    pub async fn fetch_instance(&self, instance_id: &str) -> Result<InstanceView, BrokerError> {
        self.storage
            .get_instance(instance_id)
            .await?
            .filter(|i| i.state != InstanceState::Gone)
            .map(InstanceView::from)
            .ok_or_else(|| BrokerError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })
    }

    pub async fn fetch_binding(
        &self,
        instance_id: &str,
        binding_id: &str,
    ) -> Result<BindingView, BrokerError> {
        self.storage
            .get_binding(instance_id, binding_id)
            .await?
            .filter(|b| b.state != BindingState::Gone)
            .map(BindingView::from)
            .ok_or_else(|| BrokerError::BindingNotFound {
                instance_id: instance_id.to_string(),
                binding_id: binding_id.to_string(),
            })
    }

    /// Remove completed operations past retention, and evict `Gone`
    /// instances and bindings past retention together with their
    /// idempotency records, which frees their ids.
    pub async fn collect_garbage(&self) -> Result<GcReport, BrokerError> {
        let cutoff = self.retention_cutoff();
        let mut report = GcReport {
            operations: self.storage.purge_completed_operations(cutoff).await?,
            ..GcReport::default()
        };

        for candidate in self.storage.list_gone_instances(cutoff).await? {
            let _guard = self.locks.acquire(&candidate.instance_id).await;
            let still_expired = self
                .storage
                .get_instance(&candidate.instance_id)
                .await?
                .is_some_and(|i| i.state == InstanceState::Gone && i.updated_at <= cutoff);
            if still_expired {
                self.evict_instance(&candidate.instance_id).await?;
                report.instances += 1;
            }
        }

        for candidate in self.storage.list_gone_bindings(cutoff).await? {
            let _guard = self.locks.acquire(&candidate.instance_id).await;
            let still_expired = self
                .storage
                .get_binding(&candidate.instance_id, &candidate.binding_id)
                .await?
                .is_some_and(|b| b.state == BindingState::Gone && b.updated_at <= cutoff);
            if still_expired {
                self.evict_binding(&candidate.instance_id, &candidate.binding_id)
                    .await?;
                report.bindings += 1;
            }
        }

        Ok(report)
    }
}
