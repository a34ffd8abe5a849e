//! Persisting provisioner results, immediate and asynchronous.

use std::sync::Arc;
use std::time::Duration;

use broker_storage::{BrokerStorage, OperationKind, OperationStatus, OperationTarget, StorageError};
use tokio::task::JoinHandle;

use super::snapshot::RecordedOutcome;
use super::{key_for, LifecycleEngine};
use crate::error::BrokerError;
use crate::provisioner::{
    CompletionDetail, CompletionReceiver, ProvisionerError, ProvisionerEvent, ProvisionerOutcome,
};
use crate::request::{Decision, LifecycleResponse};

/// Writes of a terminal result are tried this many times before the
/// operation is failed.
const TERMINAL_WRITE_ATTEMPTS: u32 = 3;
const TERMINAL_WRITE_BACKOFF: Duration = Duration::from_millis(20);

fn success_response(kind: OperationKind, detail: &CompletionDetail) -> LifecycleResponse {
    match kind {
        OperationKind::Provision => LifecycleResponse::Succeeded {
            dashboard_url: detail.dashboard_url.clone(),
            credentials: None,
        },
        OperationKind::Bind => LifecycleResponse::Succeeded {
            dashboard_url: None,
            credentials: detail.credentials.clone(),
        },
        OperationKind::Deprovision | OperationKind::Unbind => LifecycleResponse::empty_success(),
    }
}

impl<S: BrokerStorage> LifecycleEngine<S> {
    /// Turn what the provisioner returned into the caller's decision.
    pub(super) async fn settle(
        &self,
        kind: OperationKind,
        target: &OperationTarget,
        operation_id: &str,
        accepts_incomplete: bool,
        outcome: Result<ProvisionerOutcome, ProvisionerError>,
    ) -> Result<Decision, BrokerError> {
        match outcome {
            Ok(ProvisionerOutcome::Immediate(detail)) => self
                .finish(kind, target, operation_id, Ok(detail))
                .await
                .map(Decision::fresh),
            Ok(ProvisionerOutcome::AsyncAccepted { description }) => {
                self.accept(kind, target, operation_id, description, accepts_incomplete)
                    .await
            }
            Err(e) => self
                .finish(kind, target, operation_id, Err(e))
                .await
                .map(Decision::fresh),
        }
    }

    async fn accept(
        &self,
        kind: OperationKind,
        target: &OperationTarget,
        operation_id: &str,
        description: Option<String>,
        accepts_incomplete: bool,
    ) -> Result<Decision, BrokerError> {
        {
            let _guard = self.locks.acquire(&target.instance_id).await;
            if let Some(description) = description {
                self.storage
                    .update_description(operation_id, description)
                    .await?;
            }
            // The completion may already have been applied.
            let key = key_for(kind, target);
            if let Some(record) = self.storage.get_idempotency(&key).await? {
                let current = RecordedOutcome::from_value(&record.result)?;
                if matches!(&current, RecordedOutcome::Pending { operation_id: id } if id == operation_id)
                {
                    let accepted = RecordedOutcome::Accepted {
                        operation_id: operation_id.to_string(),
                    };
                    self.storage
                        .update_result(&key, record.version, accepted.to_value()?)
                        .await?;
                }
            }
        }

        if accepts_incomplete {
            Ok(Decision::fresh(LifecycleResponse::Accepted {
                operation_id: operation_id.to_string(),
            }))
        } else {
            Err(BrokerError::AsyncRequired)
        }
    }

    /// Persist the terminal result of an operation.
    ///
    /// An operation that is already terminal is left untouched. When storage
    /// keeps failing, the operation is failed and its claim released so the
    /// request can be retried.
    pub(super) async fn finish(
        &self,
        kind: OperationKind,
        target: &OperationTarget,
        operation_id: &str,
        result: Result<CompletionDetail, ProvisionerError>,
    ) -> Result<LifecycleResponse, BrokerError> {
        let _guard = self.locks.acquire(&target.instance_id).await;

        let outcome = match &result {
            Ok(detail) => Ok(success_response(kind, detail)),
            Err(e) => Err(e.to_string()),
        };

        let op = self
            .storage
            .get_operation(operation_id)
            .await?
            .ok_or_else(|| BrokerError::OperationNotFound {
                operation_id: operation_id.to_string(),
            })?;
        if op.status.is_terminal() {
            return outcome.map_err(BrokerError::ProvisionerFailure);
        }

        let mut attempt = 1;
        loop {
            match self
                .record_terminal(kind, target, operation_id, &result, &outcome)
                .await
            {
                Ok(()) => break,
                Err(BrokerError::StorageUnavailable(_)) if attempt < TERMINAL_WRITE_ATTEMPTS => {
                    tokio::time::sleep(TERMINAL_WRITE_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        operation_id,
                        code = e.code(),
                        attempts = attempt,
                        "could not record operation result: {e}"
                    );
                    self.abandon(&key_for(kind, target), operation_id, &e).await;
                    return Err(e);
                }
            }
        }

        if let Err(detail) = &outcome {
            self.observer.provisioner_failed(kind, target, detail);
        }
        outcome.map_err(BrokerError::ProvisionerFailure)
    }

    /// Resource state, then the idempotency snapshot, then the operation
    /// status. Every step may be repeated.
    async fn record_terminal(
        &self,
        kind: OperationKind,
        target: &OperationTarget,
        operation_id: &str,
        result: &Result<CompletionDetail, ProvisionerError>,
        outcome: &Result<LifecycleResponse, String>,
    ) -> Result<(), BrokerError> {
        let detail = result.as_ref().ok();
        match kind {
            OperationKind::Provision | OperationKind::Deprovision => {
                self.settle_instance(kind, target, operation_id, detail)
                    .await?
            }
            OperationKind::Bind | OperationKind::Unbind => {
                self.settle_binding(kind, target, operation_id, detail)
                    .await?
            }
        }

        let snapshot = match outcome {
            Ok(response) => RecordedOutcome::Succeeded {
                operation_id: operation_id.to_string(),
                response: response.clone(),
            },
            Err(detail) => RecordedOutcome::Failed {
                operation_id: operation_id.to_string(),
                description: detail.clone(),
            },
        };
        self.replace_snapshot(&key_for(kind, target), operation_id, snapshot)
            .await?;

        let (status, description) = match result {
            Ok(detail) => (OperationStatus::Succeeded, detail.description.clone()),
            Err(e) => (OperationStatus::Failed, Some(e.to_string())),
        };
        self.storage
            .complete_operation(operation_id, status, description)
            .await?;
        Ok(())
    }

    /// Apply one message from the completion channel.
    pub async fn handle_event(&self, event: ProvisionerEvent) -> Result<(), BrokerError> {
        match event {
            ProvisionerEvent::Progress {
                operation_id,
                description,
            } => match self
                .storage
                .update_description(&operation_id, description)
                .await
            {
                Ok(()) | Err(StorageError::OperationNotFound { .. }) => Ok(()),
                Err(e) => Err(e.into()),
            },
            ProvisionerEvent::Completed {
                operation_id,
                result,
            } => {
                let op = self
                    .storage
                    .get_operation(&operation_id)
                    .await?
                    .ok_or_else(|| BrokerError::OperationNotFound {
                        operation_id: operation_id.clone(),
                    })?;
                if op.status.is_terminal() {
                    return Ok(());
                }
                match self.finish(op.kind, &op.target, &operation_id, result).await {
                    Ok(_) | Err(BrokerError::ProvisionerFailure(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Drain the completion channel on a background task until every
    /// notifier is dropped.
    pub fn spawn_event_listener(self: &Arc<Self>, mut events: CompletionReceiver) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(e) = engine.handle_event(event).await {
                    tracing::warn!(code = e.code(), "provisioner event not applied: {e}");
                }
            }
            tracing::debug!("completion channel closed");
        })
    }
}
