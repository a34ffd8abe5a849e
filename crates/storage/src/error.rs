use crate::record::IdempotencyKey;

/// All errors that can be returned by a broker storage implementation.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A record exists for this idempotency key with a different request
    /// fingerprint. The stored record is left untouched.
    #[error("fingerprint conflict on {key}: stored {stored_fingerprint}")]
    FingerprintConflict {
        key: IdempotencyKey,
        stored_fingerprint: String,
    },

    /// Optimistic concurrency control conflict: another writer updated the
    /// idempotency record since it was read.
    #[error("concurrent conflict on {key}: expected version {expected_version}")]
    ConcurrentConflict {
        key: IdempotencyKey,
        expected_version: i64,
    },

    /// No idempotency record for the given key.
    #[error("idempotency record not found: {key}")]
    RecordNotFound { key: IdempotencyKey },

    /// Operation record not found.
    #[error("operation not found: {operation_id}")]
    OperationNotFound { operation_id: String },

    /// An operation may only be completed with a terminal status.
    #[error("operation {operation_id} cannot be completed with non-terminal status")]
    NonTerminalCompletion { operation_id: String },

    /// A backend-specific storage error (connection, lock poisoning, serialization).
    #[error("storage backend error: {0}")]
    Backend(String),
}
