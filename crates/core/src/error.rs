use broker_storage::{InstanceState, StorageError};

/// Every way a lifecycle request can be refused or fail.
///
/// All variants are returned as values; none of them is raised as a panic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The service/plan pair does not resolve in the catalog.
    #[error("unknown service '{service_id}' or plan '{plan_id}'")]
    InvalidPlan { service_id: String, plan_id: String },

    /// The instance exists with different attributes, or its id may not be reused.
    #[error("service instance '{instance_id}' already exists with different attributes")]
    InstanceConflict { instance_id: String },

    /// The service offering does not support bindings.
    #[error("service '{service_id}' is not bindable")]
    NotBindable { service_id: String },

    #[error("service instance '{instance_id}' does not exist")]
    InstanceNotFound { instance_id: String },

    /// The instance is not in a state that allows the request.
    #[error("service instance '{instance_id}' is {state}")]
    InstanceNotReady {
        instance_id: String,
        state: InstanceState,
    },

    #[error("service instance '{instance_id}' still has {count} live binding(s)")]
    InstanceHasBindings { instance_id: String, count: usize },

    #[error("service binding '{binding_id}' on instance '{instance_id}' already exists with different attributes")]
    BindingConflict {
        instance_id: String,
        binding_id: String,
    },

    #[error("service binding '{binding_id}' on instance '{instance_id}' does not exist")]
    BindingNotFound {
        instance_id: String,
        binding_id: String,
    },

    /// The request can only be served asynchronously and the caller did not
    /// accept an incomplete response.
    #[error("this service plan requires client support for asynchronous service operations")]
    AsyncRequired,

    /// Another operation on the same resource is still running.
    #[error("another operation for service instance '{instance_id}' is in progress")]
    ConcurrencyError { instance_id: String },

    #[error("operation '{operation_id}' does not exist or has expired")]
    OperationNotFound { operation_id: String },

    #[error("provisioner failed: {0}")]
    ProvisionerFailure(String),

    /// Idempotency guarantees cannot be upheld; the request was not processed.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl BrokerError {
    /// Stable machine-readable code, used as the `error` field of transport
    /// error bodies and in logs.
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::InvalidPlan { .. } => "InvalidPlan",
            BrokerError::InstanceConflict { .. } => "InstanceConflict",
            BrokerError::NotBindable { .. } => "NotBindable",
            BrokerError::InstanceNotFound { .. } => "InstanceNotFound",
            BrokerError::InstanceNotReady { .. } => "InstanceNotReady",
            BrokerError::InstanceHasBindings { .. } => "InstanceHasBindings",
            BrokerError::BindingConflict { .. } => "BindingConflict",
            BrokerError::BindingNotFound { .. } => "BindingNotFound",
            BrokerError::AsyncRequired => "AsyncRequired",
            BrokerError::ConcurrencyError { .. } => "ConcurrencyError",
            BrokerError::OperationNotFound { .. } => "OperationNotFound",
            BrokerError::ProvisionerFailure(_) => "ProvisionerFailure",
            BrokerError::StorageUnavailable(_) => "StorageUnavailable",
        }
    }
}

impl From<StorageError> for BrokerError {
    fn from(e: StorageError) -> Self {
        BrokerError::StorageUnavailable(e.to_string())
    }
}
