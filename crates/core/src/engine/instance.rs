use broker_storage::{
    BrokerStorage, IdempotencyKey, InstanceRecord, InstanceState, OperationKind, OperationTarget,
};
use time::OffsetDateTime;

use super::{stored_parameters, Claim, LifecycleEngine, Replay};
use crate::error::BrokerError;
use crate::fingerprint;
use crate::provisioner::{CompletionDetail, OperationContext};
use crate::request::{Decision, DeprovisionRequest, ProvisionRequest};

impl<S: BrokerStorage> LifecycleEngine<S> {
    /// Create a service instance, or replay the result of an identical
    /// earlier request.
    pub async fn provision(&self, request: ProvisionRequest) -> Result<Decision, BrokerError> {
        let target = OperationTarget::instance(&request.instance_id);
        let result = self.run_provision(&request, &target).await;
        self.observe(OperationKind::Provision, &target, result)
    }

    /// Remove a service instance, or replay the result of an identical
    /// earlier request.
    pub async fn deprovision(&self, request: DeprovisionRequest) -> Result<Decision, BrokerError> {
        let target = OperationTarget::instance(&request.instance_id);
        let result = self.run_deprovision(&request, &target).await;
        self.observe(OperationKind::Deprovision, &target, result)
    }

    async fn run_provision(
        &self,
        request: &ProvisionRequest,
        target: &OperationTarget,
    ) -> Result<Decision, BrokerError> {
        let plan = self.resolve_plan(&request.service_id, &request.plan_id)?;
        let key = IdempotencyKey::instance(OperationKind::Provision, &request.instance_id);
        let fingerprint =
            fingerprint::provision(&request.service_id, &request.plan_id, &request.parameters);
        let conflict = || BrokerError::InstanceConflict {
            instance_id: request.instance_id.clone(),
        };

        let guard = self.locks.acquire(&request.instance_id).await;

        let mut existing = self.storage.get_instance(&request.instance_id).await?;
        if existing
            .as_ref()
            .is_some_and(|i| i.state == InstanceState::Gone)
        {
            if !self.config.allow_id_reuse {
                return Err(conflict());
            }
            self.evict_instance(&request.instance_id).await?;
            existing = None;
        }

        let claim = match self
            .check_replay(&key, &fingerprint, request.accepts_incomplete, conflict())
            .await?
        {
            Replay::Answer(decision) => return Ok(decision),
            Replay::Proceed(claim) => claim,
        };
        if matches!(claim, Claim::Fresh) && existing.is_some() {
            return Err(conflict());
        }
        if self.provisioner.requires_async(&plan) && !request.accepts_incomplete {
            return Err(BrokerError::AsyncRequired);
        }

        let op = self.claim(&key, &fingerprint, claim, conflict()).await?;
        let record = InstanceRecord {
            instance_id: request.instance_id.clone(),
            service_id: request.service_id.clone(),
            plan_id: request.plan_id.clone(),
            parameters: stored_parameters(&request.parameters),
            state: InstanceState::Provisioning,
            dashboard_url: None,
            last_operation_id: Some(op.operation_id.clone()),
            updated_at: OffsetDateTime::now_utc(),
        };
        if let Err(e) = self.storage.put_instance(record).await {
            let err = BrokerError::from(e);
            self.abandon(&key, &op.operation_id, &err).await;
            return Err(err);
        }
        let from = existing.map_or("absent", |i| i.state.as_str());
        self.observer
            .transition(OperationKind::Provision, target, from, "provisioning");
        drop(guard);

        let ctx = OperationContext {
            operation_id: op.operation_id.clone(),
            plan,
            accepts_incomplete: request.accepts_incomplete,
        };
        let outcome = self.provisioner.provision(request, &ctx).await;
        self.settle(
            OperationKind::Provision,
            target,
            &op.operation_id,
            request.accepts_incomplete,
            outcome,
        )
        .await
    }

    async fn run_deprovision(
        &self,
        request: &DeprovisionRequest,
        target: &OperationTarget,
    ) -> Result<Decision, BrokerError> {
        let plan = self.resolve_plan(&request.service_id, &request.plan_id)?;
        let key = IdempotencyKey::instance(OperationKind::Deprovision, &request.instance_id);
        let fingerprint = fingerprint::deprovision(&request.service_id, &request.plan_id);
        let not_found = || BrokerError::InstanceNotFound {
            instance_id: request.instance_id.clone(),
        };

        let guard = self.locks.acquire(&request.instance_id).await;

        // A completed deprovision is answered from its record even though
        // the instance is now gone.
        let claim = match self
            .check_replay(
                &key,
                &fingerprint,
                request.accepts_incomplete,
                BrokerError::InstanceConflict {
                    instance_id: request.instance_id.clone(),
                },
            )
            .await?
        {
            Replay::Answer(decision) => return Ok(decision),
            Replay::Proceed(claim) => claim,
        };

        let mut instance = self
            .storage
            .get_instance(&request.instance_id)
            .await?
            .filter(|i| i.state != InstanceState::Gone)
            .ok_or_else(not_found)?;
        if matches!(
            instance.state,
            InstanceState::Provisioning | InstanceState::Deprovisioning
        ) && self.in_flight(instance.last_operation_id.as_deref()).await?
        {
            return Err(BrokerError::ConcurrencyError {
                instance_id: request.instance_id.clone(),
            });
        }
        if !self.provisioner.cascades_bindings() {
            let live = self
                .storage
                .list_bindings(&request.instance_id)
                .await?
                .iter()
                .filter(|b| b.state.is_live())
                .count();
            if live > 0 {
                return Err(BrokerError::InstanceHasBindings {
                    instance_id: request.instance_id.clone(),
                    count: live,
                });
            }
        }

        let op = self
            .claim(
                &key,
                &fingerprint,
                claim,
                BrokerError::InstanceConflict {
                    instance_id: request.instance_id.clone(),
                },
            )
            .await?;
        let from = instance.state;
        instance.state = InstanceState::Deprovisioning;
        instance.last_operation_id = Some(op.operation_id.clone());
        instance.updated_at = OffsetDateTime::now_utc();
        if let Err(e) = self.storage.put_instance(instance).await {
            let err = BrokerError::from(e);
            self.abandon(&key, &op.operation_id, &err).await;
            return Err(err);
        }
        self.observer.transition(
            OperationKind::Deprovision,
            target,
            from.as_str(),
            "deprovisioning",
        );
        drop(guard);

        let ctx = OperationContext {
            operation_id: op.operation_id.clone(),
            plan,
            accepts_incomplete: request.accepts_incomplete,
        };
        let outcome = self.provisioner.deprovision(request, &ctx).await;
        self.settle(
            OperationKind::Deprovision,
            target,
            &op.operation_id,
            request.accepts_incomplete,
            outcome,
        )
        .await
    }

    /// Move an instance to its terminal state. `detail` is `None` when the
    /// provisioner failed. Must be called with the instance lock held.
    pub(super) async fn settle_instance(
        &self,
        kind: OperationKind,
        target: &OperationTarget,
        operation_id: &str,
        detail: Option<&CompletionDetail>,
    ) -> Result<(), BrokerError> {
        let Some(mut instance) = self.storage.get_instance(&target.instance_id).await? else {
            return Ok(());
        };
        if instance.last_operation_id.as_deref() != Some(operation_id) {
            return Ok(());
        }
        let now = OffsetDateTime::now_utc();
        let from = instance.state;
        instance.state = match (kind, detail) {
            (OperationKind::Provision, Some(detail)) => {
                instance.dashboard_url = detail.dashboard_url.clone();
                InstanceState::Succeeded
            }
            (OperationKind::Deprovision, Some(_)) => {
                if self.provisioner.cascades_bindings() {
                    self.cascade_bindings_gone(&target.instance_id, now).await?;
                }
                InstanceState::Gone
            }
            _ => InstanceState::Failed,
        };
        instance.updated_at = now;
        let to = instance.state;
        self.storage.put_instance(instance).await?;
        self.observer
            .transition(kind, target, from.as_str(), to.as_str());
        Ok(())
    }

    /// Drop every idempotency record of an instance, its bindings' included,
    /// then the instance itself.
    pub(super) async fn evict_instance(&self, instance_id: &str) -> Result<(), BrokerError> {
        for record in self
            .storage
            .list_idempotency_for_instance(instance_id)
            .await?
        {
            self.storage.remove_idempotency(&record.key).await?;
        }
        self.storage.remove_instance(instance_id).await?;
        Ok(())
    }
}
