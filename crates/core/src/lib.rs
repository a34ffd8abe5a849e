//! Lifecycle core of the service broker.
//!
//! The [`LifecycleEngine`] implements provision, deprovision, bind, unbind
//! and operation polling on top of a [`broker_storage::BrokerStorage`]
//! backend. Backing-service work is delegated to a [`Provisioner`]; service
//! and plan ids are checked against a [`CatalogValidator`]; decision points
//! are reported to a [`LifecycleObserver`].
//!
//! Every operation is idempotent per `(kind, instance_id, binding_id?)`: a
//! retried request with the same fingerprint replays the recorded result
//! instead of calling the provisioner again, and a request with a different
//! fingerprint is rejected as a conflict.

pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod observer;
pub mod provisioner;
pub mod request;

pub use catalog::{Catalog, CatalogError, CatalogValidator, PlanDescriptor, StaticCatalog};
pub use config::EngineConfig;
pub use engine::{GcReport, LifecycleEngine};
pub use error::BrokerError;
pub use observer::{LifecycleObserver, TracingObserver};
pub use provisioner::{
    completion_channel, CompletionDetail, CompletionNotifier, CompletionReceiver,
    OperationContext, Provisioner, ProvisionerError, ProvisionerEvent, ProvisionerOutcome,
    SandboxProvisioner,
};
pub use request::{
    BindRequest, BindingView, Decision, DeprovisionRequest, InstanceView, LifecycleResponse,
    OperationState, ProvisionRequest, UnbindRequest,
};
