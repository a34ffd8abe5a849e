use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::StorageError;
use crate::record::{
    BindingRecord, IdempotencyClaim, IdempotencyKey, IdempotencyRecord, InstanceRecord,
    OperationKind, OperationRecord, OperationStatus, OperationTarget,
};

/// Durable map from idempotency key to request fingerprint and result.
///
/// ## Compare-and-set
///
/// `put_if_absent_or_matching` is the single primitive the lifecycle engine
/// relies on for idempotency. It MUST be atomic with respect to concurrent
/// callers sharing a key: two racing callers with the same key observe
/// exactly one `Claimed` between them.
///
/// ## OCC
///
/// `update_result` is conditional on `version = expected_version`. If the
/// stored version differs the method returns
/// `Err(StorageError::ConcurrentConflict { .. })` and nothing is written.
#[async_trait]
pub trait IdempotencyStore: Send + Sync + 'static {
    async fn get_idempotency(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, StorageError>;

    /// Store `(fingerprint, result)` if the key is absent, or return the stored
    /// record if its fingerprint matches.
    ///
    /// Returns `Err(StorageError::FingerprintConflict)` if the fingerprint differs.
    async fn put_if_absent_or_matching(
        &self,
        key: &IdempotencyKey,
        fingerprint: &str,
        result: serde_json::Value,
    ) -> Result<IdempotencyClaim, StorageError>;

    /// Replace the stored result. Returns the new version number on success.
    async fn update_result(
        &self,
        key: &IdempotencyKey,
        expected_version: i64,
        result: serde_json::Value,
    ) -> Result<i64, StorageError>;

    /// Remove a record. Removing an absent key is not an error.
    async fn remove_idempotency(&self, key: &IdempotencyKey) -> Result<(), StorageError>;

    /// All records whose key belongs to `instance_id`, bindings included.
    async fn list_idempotency_for_instance(
        &self,
        instance_id: &str,
    ) -> Result<Vec<IdempotencyRecord>, StorageError>;
}

/// Durable record of lifecycle operations.
///
/// Status is monotonic: `InProgress -> {Succeeded | Failed}`. Completing an
/// operation that is already terminal is a no-op and returns `Ok(false)`.
#[async_trait]
pub trait OperationTracker: Send + Sync + 'static {
    /// Create a new `InProgress` operation with a freshly generated id.
    async fn create_operation(
        &self,
        kind: OperationKind,
        target: OperationTarget,
    ) -> Result<OperationRecord, StorageError>;

    /// Move an operation to a terminal status.
    ///
    /// Returns `Ok(true)` if this call performed the transition.
    /// Returns `Err(StorageError::NonTerminalCompletion)` if `status` is `InProgress`.
    async fn complete_operation(
        &self,
        operation_id: &str,
        status: OperationStatus,
        description: Option<String>,
    ) -> Result<bool, StorageError>;

    /// Replace the progress description of an in-progress operation.
    /// Ignored once the operation is terminal.
    async fn update_description(
        &self,
        operation_id: &str,
        description: String,
    ) -> Result<(), StorageError>;

    async fn get_operation(&self, operation_id: &str)
        -> Result<Option<OperationRecord>, StorageError>;

    /// Remove a single operation if it is terminal and completed at or before
    /// `completed_before`. Returns whether it was removed.
    async fn purge_operation_if_expired(
        &self,
        operation_id: &str,
        completed_before: OffsetDateTime,
    ) -> Result<bool, StorageError>;

    /// Remove every terminal operation completed at or before `completed_before`.
    async fn purge_completed_operations(
        &self,
        completed_before: OffsetDateTime,
    ) -> Result<usize, StorageError>;
}

/// Current state of instances and bindings.
#[async_trait]
pub trait LifecycleStore: Send + Sync + 'static {
    async fn get_instance(&self, instance_id: &str)
        -> Result<Option<InstanceRecord>, StorageError>;

    /// Insert or replace an instance.
    async fn put_instance(&self, record: InstanceRecord) -> Result<(), StorageError>;

    /// Remove an instance and all of its bindings.
    async fn remove_instance(&self, instance_id: &str) -> Result<(), StorageError>;

    /// Instances last updated at or before `updated_before`, in `Gone` state.
    async fn list_gone_instances(
        &self,
        updated_before: OffsetDateTime,
    ) -> Result<Vec<InstanceRecord>, StorageError>;

    async fn get_binding(
        &self,
        instance_id: &str,
        binding_id: &str,
    ) -> Result<Option<BindingRecord>, StorageError>;

    /// Insert or replace a binding.
    async fn put_binding(&self, record: BindingRecord) -> Result<(), StorageError>;

    async fn remove_binding(&self, instance_id: &str, binding_id: &str)
        -> Result<(), StorageError>;

    async fn list_bindings(&self, instance_id: &str) -> Result<Vec<BindingRecord>, StorageError>;

    /// Bindings last updated at or before `updated_before`, in `Gone` state.
    async fn list_gone_bindings(
        &self,
        updated_before: OffsetDateTime,
    ) -> Result<Vec<BindingRecord>, StorageError>;
}

/// Everything the lifecycle engine needs from a backend.
///
/// Implementations must be `Send + Sync + 'static` to be shared across async
/// tasks and axum application state.
pub trait BrokerStorage: IdempotencyStore + OperationTracker + LifecycleStore {}

impl<T> BrokerStorage for T where T: IdempotencyStore + OperationTracker + LifecycleStore {}
