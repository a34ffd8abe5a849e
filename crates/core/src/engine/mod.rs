//! The lifecycle state machine.
//!
//! Each operation runs in three phases:
//!
//! 1. Under the instance's lock: validate, consult the idempotency record,
//!    create the tracked operation, claim the record as `Pending`, and move
//!    the resource into its transitional state.
//! 2. Without the lock: call the provisioner.
//! 3. Under the lock again: persist the terminal state (immediate result),
//!    or mark the record `Accepted` and leave the rest to the completion
//!    channel (async result).
//!
//! A duplicate request arriving during phase 2 sees the `Pending` claim and
//! is refused with `ConcurrencyError`; it never reaches the provisioner.

mod binding;
mod completion;
mod instance;
mod locks;
mod polling;
mod snapshot;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use broker_storage::{
    BrokerStorage, IdempotencyClaim, IdempotencyKey, OperationKind, OperationRecord,
    OperationStatus, OperationTarget, StorageError,
};
use time::OffsetDateTime;

use self::locks::KeyedLocks;
use self::snapshot::RecordedOutcome;
use crate::catalog::{CatalogValidator, PlanDescriptor};
use crate::config::EngineConfig;
use crate::error::BrokerError;
use crate::observer::{LifecycleObserver, TracingObserver};
use crate::provisioner::Provisioner;
use crate::request::{Decision, LifecycleResponse};

pub use self::polling::GcReport;

pub struct LifecycleEngine<S: BrokerStorage> {
    storage: Arc<S>,
    catalog: Arc<dyn CatalogValidator>,
    provisioner: Arc<dyn Provisioner>,
    observer: Arc<dyn LifecycleObserver>,
    config: EngineConfig,
    locks: KeyedLocks,
}

/// What the idempotency record says to do with a request.
enum Replay {
    /// Answer from the record; the provisioner is not called.
    Answer(Decision),
    Proceed(Claim),
}

enum Claim {
    /// No record exists for the key.
    Fresh,
    /// A failed attempt is recorded at `version` and may be retried.
    Retry { version: i64 },
}

impl<S: BrokerStorage> LifecycleEngine<S> {
    pub fn new(
        storage: Arc<S>,
        catalog: Arc<dyn CatalogValidator>,
        provisioner: Arc<dyn Provisioner>,
        config: EngineConfig,
    ) -> Self {
        Self {
            storage,
            catalog,
            provisioner,
            observer: Arc::new(TracingObserver),
            config,
            locks: KeyedLocks::default(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn resolve_plan(&self, service_id: &str, plan_id: &str) -> Result<PlanDescriptor, BrokerError> {
        self.catalog
            .resolve(service_id, plan_id)
            .ok_or_else(|| BrokerError::InvalidPlan {
                service_id: service_id.to_string(),
                plan_id: plan_id.to_string(),
            })
    }

    /// Completed operations and `Gone` resources older than this are expired.
    fn retention_cutoff(&self) -> OffsetDateTime {
        let now = OffsetDateTime::now_utc();
        now.checked_sub(self.config.retention_window())
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    /// Report the outcome of a public operation to the observer.
    fn observe(
        &self,
        kind: OperationKind,
        target: &OperationTarget,
        result: Result<Decision, BrokerError>,
    ) -> Result<Decision, BrokerError> {
        match &result {
            Ok(decision) if decision.replayed => self.observer.replayed(kind, target),
            Err(BrokerError::ProvisionerFailure(_)) | Ok(_) => {}
            Err(e) => self.observer.rejected(kind, target, e),
        }
        result
    }

    /// Must be called with the instance lock held.
    async fn check_replay(
        &self,
        key: &IdempotencyKey,
        fingerprint: &str,
        accepts_incomplete: bool,
        conflict: BrokerError,
    ) -> Result<Replay, BrokerError> {
        let Some(record) = self.storage.get_idempotency(key).await? else {
            return Ok(Replay::Proceed(Claim::Fresh));
        };
        if record.fingerprint != fingerprint {
            return Err(conflict);
        }
        match RecordedOutcome::from_value(&record.result)? {
            RecordedOutcome::Succeeded { response, .. } => {
                Ok(Replay::Answer(Decision::replay(response)))
            }
            RecordedOutcome::Accepted { operation_id } => {
                if accepts_incomplete {
                    Ok(Replay::Answer(Decision::replay(LifecycleResponse::Accepted {
                        operation_id,
                    })))
                } else {
                    Err(BrokerError::AsyncRequired)
                }
            }
            RecordedOutcome::Pending { operation_id } => {
                // A claim whose operation failed or vanished was abandoned.
                match self.storage.get_operation(&operation_id).await? {
                    Some(op) if op.status != OperationStatus::Failed => {
                        Err(BrokerError::ConcurrencyError {
                            instance_id: key.instance_id.clone(),
                        })
                    }
                    _ => Ok(Replay::Proceed(Claim::Retry {
                        version: record.version,
                    })),
                }
            }
            RecordedOutcome::Failed { .. } => Ok(Replay::Proceed(Claim::Retry {
                version: record.version,
            })),
        }
    }

    /// Create the tracked operation and claim the idempotency record for it.
    ///
    /// Must be called with the instance lock held.
    async fn claim(
        &self,
        key: &IdempotencyKey,
        fingerprint: &str,
        claim: Claim,
        conflict: BrokerError,
    ) -> Result<OperationRecord, BrokerError> {
        let op = self
            .storage
            .create_operation(key.kind, target_of(key))
            .await?;
        let pending = RecordedOutcome::Pending {
            operation_id: op.operation_id.clone(),
        }
        .to_value()?;

        let claimed = match claim {
            Claim::Fresh => self
                .storage
                .put_if_absent_or_matching(key, fingerprint, pending)
                .await
                .and_then(|c| match c {
                    IdempotencyClaim::Claimed(_) => Ok(()),
                    IdempotencyClaim::Existing(_) => Err(StorageError::ConcurrentConflict {
                        key: key.clone(),
                        expected_version: 0,
                    }),
                }),
            Claim::Retry { version } => self
                .storage
                .update_result(key, version, pending)
                .await
                .map(|_| ()),
        };

        match claimed {
            Ok(()) => Ok(op),
            Err(e) => {
                let err = match e {
                    StorageError::FingerprintConflict { .. } => conflict,
                    StorageError::ConcurrentConflict { .. } => BrokerError::ConcurrencyError {
                        instance_id: key.instance_id.clone(),
                    },
                    other => BrokerError::from(other),
                };
                let closed = self
                    .storage
                    .complete_operation(
                        &op.operation_id,
                        OperationStatus::Failed,
                        Some(err.to_string()),
                    )
                    .await;
                if let Err(e) = closed {
                    tracing::warn!(
                        operation_id = %op.operation_id,
                        error = %e,
                        "could not close unclaimed operation"
                    );
                }
                Err(err)
            }
        }
    }

    /// Replace the record's snapshot if it still belongs to `operation_id`.
    async fn replace_snapshot(
        &self,
        key: &IdempotencyKey,
        operation_id: &str,
        snapshot: RecordedOutcome,
    ) -> Result<(), BrokerError> {
        let Some(record) = self.storage.get_idempotency(key).await? else {
            return Ok(());
        };
        let current = RecordedOutcome::from_value(&record.result)?;
        if current.operation_id() != operation_id {
            return Ok(());
        }
        self.storage
            .update_result(key, record.version, snapshot.to_value()?)
            .await?;
        Ok(())
    }

    /// Whether `operation_id` names an operation still running. A resource
    /// left in a transitional state by a failed operation is not busy.
    async fn in_flight(&self, operation_id: Option<&str>) -> Result<bool, BrokerError> {
        let Some(operation_id) = operation_id else {
            return Ok(false);
        };
        Ok(self
            .storage
            .get_operation(operation_id)
            .await?
            .is_some_and(|op| !op.status.is_terminal()))
    }

    /// Undo a claim after a storage failure, so a retry is not blocked by a
    /// `Pending` record nobody will ever complete.
    async fn abandon(&self, key: &IdempotencyKey, operation_id: &str, cause: &BrokerError) {
        let description = cause.to_string();
        let snapshot = RecordedOutcome::Failed {
            operation_id: operation_id.to_string(),
            description: description.clone(),
        };
        if let Err(e) = self.replace_snapshot(key, operation_id, snapshot).await {
            tracing::warn!(%key, operation_id, error = %e, "could not release idempotency claim");
        }
        if let Err(e) = self
            .storage
            .complete_operation(operation_id, OperationStatus::Failed, Some(description))
            .await
        {
            tracing::warn!(operation_id, error = %e, "could not fail abandoned operation");
        }
    }
}

pub(crate) fn key_for(kind: OperationKind, target: &OperationTarget) -> IdempotencyKey {
    IdempotencyKey {
        kind,
        instance_id: target.instance_id.clone(),
        binding_id: target.binding_id.clone(),
    }
}

fn target_of(key: &IdempotencyKey) -> OperationTarget {
    OperationTarget {
        instance_id: key.instance_id.clone(),
        binding_id: key.binding_id.clone(),
    }
}

/// `null` parameters are stored as an empty object.
fn stored_parameters(parameters: &serde_json::Value) -> serde_json::Value {
    match parameters {
        serde_json::Value::Null => serde_json::Value::Object(Default::default()),
        other => other.clone(),
    }
}
