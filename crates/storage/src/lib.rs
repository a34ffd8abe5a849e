pub mod conformance;
mod error;
mod memory;
mod record;
mod traits;

pub use error::StorageError;
pub use memory::MemoryStorage;
pub use record::{
    BindingRecord, BindingState, IdempotencyClaim, IdempotencyKey, IdempotencyRecord,
    InstanceRecord, InstanceState, OperationKind, OperationRecord, OperationStatus,
    OperationTarget,
};
pub use traits::{BrokerStorage, IdempotencyStore, LifecycleStore, OperationTracker};
