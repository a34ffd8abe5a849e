//! The backing-service collaborator.
//!
//! A [`Provisioner`] performs the real work behind each lifecycle operation.
//! It either finishes inside the call ([`ProvisionerOutcome::Immediate`]) or
//! accepts the work and reports back later through a [`CompletionNotifier`].

mod sandbox;

pub use sandbox::SandboxProvisioner;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::catalog::PlanDescriptor;
use crate::request::{BindRequest, DeprovisionRequest, ProvisionRequest, UnbindRequest};

/// Per-call facts handed to the provisioner alongside the request.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationContext {
    /// Tracked operation for this call. Async completions must carry it.
    pub operation_id: String,
    pub plan: PlanDescriptor,
    pub accepts_incomplete: bool,
}

/// What a finished operation produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionDetail {
    pub description: Option<String>,
    /// Provision only.
    pub dashboard_url: Option<String>,
    /// Bind only.
    pub credentials: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProvisionerOutcome {
    Immediate(CompletionDetail),
    /// Work continues in the background; a `Completed` event follows.
    AsyncAccepted { description: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisionerError {
    #[error("{0}")]
    Failed(String),
    #[error("backing service unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Provisioner: Send + Sync + 'static {
    async fn provision(
        &self,
        request: &ProvisionRequest,
        ctx: &OperationContext,
    ) -> Result<ProvisionerOutcome, ProvisionerError>;

    async fn deprovision(
        &self,
        request: &DeprovisionRequest,
        ctx: &OperationContext,
    ) -> Result<ProvisionerOutcome, ProvisionerError>;

    async fn bind(
        &self,
        request: &BindRequest,
        ctx: &OperationContext,
    ) -> Result<ProvisionerOutcome, ProvisionerError>;

    async fn unbind(
        &self,
        request: &UnbindRequest,
        ctx: &OperationContext,
    ) -> Result<ProvisionerOutcome, ProvisionerError>;

    /// Whether provisioning `plan` can only complete asynchronously. Checked
    /// before any state is written, so a caller that does not accept
    /// incomplete responses gets `AsyncRequired` with nothing started.
    fn requires_async(&self, plan: &PlanDescriptor) -> bool {
        plan.requires_async
    }

    /// Whether deprovisioning also removes the instance's bindings. When
    /// `false`, deprovisioning an instance with live bindings is refused.
    fn cascades_bindings(&self) -> bool {
        false
    }
}

/// Messages from a provisioner about operations it accepted asynchronously.
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisionerEvent {
    Progress {
        operation_id: String,
        description: String,
    },
    Completed {
        operation_id: String,
        result: Result<CompletionDetail, ProvisionerError>,
    },
}

/// Sending half of the completion channel, held by the provisioner.
#[derive(Debug, Clone)]
pub struct CompletionNotifier {
    tx: mpsc::UnboundedSender<ProvisionerEvent>,
}

impl CompletionNotifier {
    /// Returns `false` if the engine's listener has stopped.
    pub fn progress(&self, operation_id: &str, description: impl Into<String>) -> bool {
        self.send(ProvisionerEvent::Progress {
            operation_id: operation_id.to_string(),
            description: description.into(),
        })
    }

    pub fn succeed(&self, operation_id: &str, detail: CompletionDetail) -> bool {
        self.send(ProvisionerEvent::Completed {
            operation_id: operation_id.to_string(),
            result: Ok(detail),
        })
    }

    pub fn fail(&self, operation_id: &str, error: ProvisionerError) -> bool {
        self.send(ProvisionerEvent::Completed {
            operation_id: operation_id.to_string(),
            result: Err(error),
        })
    }

    fn send(&self, event: ProvisionerEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Receiving half of the completion channel, drained by the engine.
#[derive(Debug)]
pub struct CompletionReceiver {
    rx: mpsc::UnboundedReceiver<ProvisionerEvent>,
}

impl CompletionReceiver {
    pub async fn recv(&mut self) -> Option<ProvisionerEvent> {
        self.rx.recv().await
    }
}

pub fn completion_channel() -> (CompletionNotifier, CompletionReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CompletionNotifier { tx }, CompletionReceiver { rx })
}
