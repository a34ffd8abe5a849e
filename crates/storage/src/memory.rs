//! In-process storage backend.
//!
//! Every primitive runs under one mutex, which makes each call atomic with
//! respect to every other call. Durability ends with the process; a
//! production deployment supplies its own implementation of the traits and
//! validates it with [`crate::conformance`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::StorageError;
use crate::record::{
    BindingRecord, BindingState, IdempotencyClaim, IdempotencyKey, IdempotencyRecord,
    InstanceRecord, InstanceState, OperationKind, OperationRecord, OperationStatus,
    OperationTarget,
};
use crate::traits::{IdempotencyStore, LifecycleStore, OperationTracker};

#[derive(Default)]
struct Inner {
    idempotency: BTreeMap<IdempotencyKey, IdempotencyRecord>,
    operations: HashMap<String, OperationRecord>,
    instances: HashMap<String, InstanceRecord>,
    /// Keyed by (instance_id, binding_id).
    bindings: BTreeMap<(String, String), BindingRecord>,
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StorageError> {
        self.inner
            .lock()
            .map_err(|_| StorageError::Backend("memory storage lock poisoned".to_string()))
    }
}

#[async_trait]
impl IdempotencyStore for MemoryStorage {
    async fn get_idempotency(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, StorageError> {
        Ok(self.lock()?.idempotency.get(key).cloned())
    }

    async fn put_if_absent_or_matching(
        &self,
        key: &IdempotencyKey,
        fingerprint: &str,
        result: serde_json::Value,
    ) -> Result<IdempotencyClaim, StorageError> {
        let mut inner = self.lock()?;
        if let Some(existing) = inner.idempotency.get(key) {
            if existing.fingerprint == fingerprint {
                return Ok(IdempotencyClaim::Existing(existing.clone()));
            }
            return Err(StorageError::FingerprintConflict {
                key: key.clone(),
                stored_fingerprint: existing.fingerprint.clone(),
            });
        }

        let record = IdempotencyRecord {
            key: key.clone(),
            fingerprint: fingerprint.to_string(),
            result,
            version: 0,
            recorded_at: OffsetDateTime::now_utc(),
        };
        inner.idempotency.insert(key.clone(), record.clone());
        Ok(IdempotencyClaim::Claimed(record))
    }

    async fn update_result(
        &self,
        key: &IdempotencyKey,
        expected_version: i64,
        result: serde_json::Value,
    ) -> Result<i64, StorageError> {
        let mut inner = self.lock()?;
        let record = inner
            .idempotency
            .get_mut(key)
            .ok_or_else(|| StorageError::RecordNotFound { key: key.clone() })?;
        if record.version != expected_version {
            return Err(StorageError::ConcurrentConflict {
                key: key.clone(),
                expected_version,
            });
        }
        record.result = result;
        record.version += 1;
        record.recorded_at = OffsetDateTime::now_utc();
        Ok(record.version)
    }

    async fn remove_idempotency(&self, key: &IdempotencyKey) -> Result<(), StorageError> {
        self.lock()?.idempotency.remove(key);
        Ok(())
    }

    async fn list_idempotency_for_instance(
        &self,
        instance_id: &str,
    ) -> Result<Vec<IdempotencyRecord>, StorageError> {
        Ok(self
            .lock()?
            .idempotency
            .values()
            .filter(|r| r.key.instance_id == instance_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl OperationTracker for MemoryStorage {
    async fn create_operation(
        &self,
        kind: OperationKind,
        target: OperationTarget,
    ) -> Result<OperationRecord, StorageError> {
        let record = OperationRecord {
            operation_id: uuid::Uuid::new_v4().to_string(),
            kind,
            target,
            status: OperationStatus::InProgress,
            description: None,
            created_at: OffsetDateTime::now_utc(),
            completed_at: None,
        };
        self.lock()?
            .operations
            .insert(record.operation_id.clone(), record.clone());
        Ok(record)
    }

    async fn complete_operation(
        &self,
        operation_id: &str,
        status: OperationStatus,
        description: Option<String>,
    ) -> Result<bool, StorageError> {
        if !status.is_terminal() {
            return Err(StorageError::NonTerminalCompletion {
                operation_id: operation_id.to_string(),
            });
        }
        let mut inner = self.lock()?;
        let record = inner.operations.get_mut(operation_id).ok_or_else(|| {
            StorageError::OperationNotFound {
                operation_id: operation_id.to_string(),
            }
        })?;
        if record.status.is_terminal() {
            return Ok(false);
        }
        record.status = status;
        if description.is_some() {
            record.description = description;
        }
        record.completed_at = Some(OffsetDateTime::now_utc());
        Ok(true)
    }

    async fn update_description(
        &self,
        operation_id: &str,
        description: String,
    ) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        let record = inner.operations.get_mut(operation_id).ok_or_else(|| {
            StorageError::OperationNotFound {
                operation_id: operation_id.to_string(),
            }
        })?;
        if !record.status.is_terminal() {
            record.description = Some(description);
        }
        Ok(())
    }

    async fn get_operation(
        &self,
        operation_id: &str,
    ) -> Result<Option<OperationRecord>, StorageError> {
        Ok(self.lock()?.operations.get(operation_id).cloned())
    }

    async fn purge_operation_if_expired(
        &self,
        operation_id: &str,
        completed_before: OffsetDateTime,
    ) -> Result<bool, StorageError> {
        let mut inner = self.lock()?;
        let expired = inner
            .operations
            .get(operation_id)
            .and_then(|r| r.completed_at)
            .is_some_and(|at| at <= completed_before);
        if expired {
            inner.operations.remove(operation_id);
        }
        Ok(expired)
    }

    async fn purge_completed_operations(
        &self,
        completed_before: OffsetDateTime,
    ) -> Result<usize, StorageError> {
        let mut inner = self.lock()?;
        let before = inner.operations.len();
        inner
            .operations
            .retain(|_, r| !r.completed_at.is_some_and(|at| at <= completed_before));
        Ok(before - inner.operations.len())
    }
}

#[async_trait]
impl LifecycleStore for MemoryStorage {
    async fn get_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceRecord>, StorageError> {
        Ok(self.lock()?.instances.get(instance_id).cloned())
    }

    async fn put_instance(&self, record: InstanceRecord) -> Result<(), StorageError> {
        self.lock()?
            .instances
            .insert(record.instance_id.clone(), record);
        Ok(())
    }

    async fn remove_instance(&self, instance_id: &str) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        inner.instances.remove(instance_id);
        inner.bindings.retain(|(owner, _), _| owner != instance_id);
        Ok(())
    }

    async fn list_gone_instances(
        &self,
        updated_before: OffsetDateTime,
    ) -> Result<Vec<InstanceRecord>, StorageError> {
        Ok(self
            .lock()?
            .instances
            .values()
            .filter(|r| r.state == InstanceState::Gone && r.updated_at <= updated_before)
            .cloned()
            .collect())
    }

    async fn get_binding(
        &self,
        instance_id: &str,
        binding_id: &str,
    ) -> Result<Option<BindingRecord>, StorageError> {
        Ok(self
            .lock()?
            .bindings
            .get(&(instance_id.to_string(), binding_id.to_string()))
            .cloned())
    }

    async fn put_binding(&self, record: BindingRecord) -> Result<(), StorageError> {
        self.lock()?.bindings.insert(
            (record.instance_id.clone(), record.binding_id.clone()),
            record,
        );
        Ok(())
    }

    async fn remove_binding(
        &self,
        instance_id: &str,
        binding_id: &str,
    ) -> Result<(), StorageError> {
        self.lock()?
            .bindings
            .remove(&(instance_id.to_string(), binding_id.to_string()));
        Ok(())
    }

    async fn list_bindings(&self, instance_id: &str) -> Result<Vec<BindingRecord>, StorageError> {
        Ok(self
            .lock()?
            .bindings
            .values()
            .filter(|b| b.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn list_gone_bindings(
        &self,
        updated_before: OffsetDateTime,
    ) -> Result<Vec<BindingRecord>, StorageError> {
        Ok(self
            .lock()?
            .bindings
            .values()
            .filter(|b| b.state == BindingState::Gone && b.updated_at <= updated_before)
            .cloned()
            .collect())
    }
}
