use broker_storage::{
    BindingRecord, BindingState, BrokerStorage, IdempotencyKey, InstanceState, OperationKind,
    OperationTarget,
};
use time::OffsetDateTime;

use super::{stored_parameters, Claim, LifecycleEngine, Replay};
use crate::error::BrokerError;
use crate::fingerprint;
use crate::provisioner::{CompletionDetail, OperationContext};
use crate::request::{BindRequest, Decision, UnbindRequest};

impl<S: BrokerStorage> LifecycleEngine<S> {
    /// Create a binding and its credentials. Credentials are generated once
    /// per fingerprint; replays return the same ones.
    pub async fn bind(&self, request: BindRequest) -> Result<Decision, BrokerError> {
        let target = OperationTarget::binding(&request.instance_id, &request.binding_id);
        let result = self.run_bind(&request, &target).await;
        self.observe(OperationKind::Bind, &target, result)
    }

    pub async fn unbind(&self, request: UnbindRequest) -> Result<Decision, BrokerError> {
        let target = OperationTarget::binding(&request.instance_id, &request.binding_id);
        let result = self.run_unbind(&request, &target).await;
        self.observe(OperationKind::Unbind, &target, result)
    }

    async fn run_bind(
        &self,
        request: &BindRequest,
        target: &OperationTarget,
    ) -> Result<Decision, BrokerError> {
        let plan = self.resolve_plan(&request.service_id, &request.plan_id)?;
        if !plan.bindable {
            return Err(BrokerError::NotBindable {
                service_id: request.service_id.clone(),
            });
        }
        let key = IdempotencyKey::binding(
            OperationKind::Bind,
            &request.instance_id,
            &request.binding_id,
        );
        let fingerprint = fingerprint::bind(
            &request.binding_id,
            &request.service_id,
            &request.plan_id,
            &request.parameters,
        );
        let conflict = || BrokerError::BindingConflict {
            instance_id: request.instance_id.clone(),
            binding_id: request.binding_id.clone(),
        };

        let guard = self.locks.acquire(&request.instance_id).await;

        let mut existing = self
            .storage
            .get_binding(&request.instance_id, &request.binding_id)
            .await?;
        if existing
            .as_ref()
            .is_some_and(|b| b.state == BindingState::Gone)
        {
            if !self.config.allow_id_reuse {
                return Err(conflict());
            }
            self.evict_binding(&request.instance_id, &request.binding_id)
                .await?;
            existing = None;
        }

        let claim = match self
            .check_replay(&key, &fingerprint, request.accepts_incomplete, conflict())
            .await?
        {
            Replay::Answer(decision) => return Ok(decision),
            Replay::Proceed(claim) => claim,
        };

        let instance = self
            .storage
            .get_instance(&request.instance_id)
            .await?
            .filter(|i| i.state != InstanceState::Gone)
            .ok_or_else(|| BrokerError::InstanceNotFound {
                instance_id: request.instance_id.clone(),
            })?;
        if instance.state != InstanceState::Succeeded {
            return Err(BrokerError::InstanceNotReady {
                instance_id: request.instance_id.clone(),
                state: instance.state,
            });
        }
        if matches!(claim, Claim::Fresh) && existing.is_some() {
            return Err(conflict());
        }

        let op = self.claim(&key, &fingerprint, claim, conflict()).await?;
        let record = BindingRecord {
            instance_id: request.instance_id.clone(),
            binding_id: request.binding_id.clone(),
            service_id: request.service_id.clone(),
            plan_id: request.plan_id.clone(),
            parameters: stored_parameters(&request.parameters),
            credentials: None,
            state: BindingState::Binding,
            last_operation_id: Some(op.operation_id.clone()),
            updated_at: OffsetDateTime::now_utc(),
        };
        if let Err(e) = self.storage.put_binding(record).await {
            let err = BrokerError::from(e);
            self.abandon(&key, &op.operation_id, &err).await;
            return Err(err);
        }
        let from = existing.map_or("absent", |b| b.state.as_str());
        self.observer
            .transition(OperationKind::Bind, target, from, "binding");
        drop(guard);

        let ctx = OperationContext {
            operation_id: op.operation_id.clone(),
            plan,
            accepts_incomplete: request.accepts_incomplete,
        };
        let outcome = self.provisioner.bind(request, &ctx).await;
        self.settle(
            OperationKind::Bind,
            target,
            &op.operation_id,
            request.accepts_incomplete,
            outcome,
        )
        .await
    }

    async fn run_unbind(
        &self,
        request: &UnbindRequest,
        target: &OperationTarget,
    ) -> Result<Decision, BrokerError> {
        let plan = self.resolve_plan(&request.service_id, &request.plan_id)?;
        let key = IdempotencyKey::binding(
            OperationKind::Unbind,
            &request.instance_id,
            &request.binding_id,
        );
        let fingerprint =
            fingerprint::unbind(&request.binding_id, &request.service_id, &request.plan_id);
        let conflict = || BrokerError::BindingConflict {
            instance_id: request.instance_id.clone(),
            binding_id: request.binding_id.clone(),
        };

        let guard = self.locks.acquire(&request.instance_id).await;

        let claim = match self
            .check_replay(&key, &fingerprint, request.accepts_incomplete, conflict())
            .await?
        {
            Replay::Answer(decision) => return Ok(decision),
            Replay::Proceed(claim) => claim,
        };

        let mut binding = self
            .storage
            .get_binding(&request.instance_id, &request.binding_id)
            .await?
            .filter(|b| b.state != BindingState::Gone)
            .ok_or_else(|| BrokerError::BindingNotFound {
                instance_id: request.instance_id.clone(),
                binding_id: request.binding_id.clone(),
            })?;
        if matches!(binding.state, BindingState::Binding | BindingState::Unbinding)
            && self.in_flight(binding.last_operation_id.as_deref()).await?
        {
            return Err(BrokerError::ConcurrencyError {
                instance_id: request.instance_id.clone(),
            });
        }

        let op = self.claim(&key, &fingerprint, claim, conflict()).await?;
        let from = binding.state;
        binding.state = BindingState::Unbinding;
        binding.last_operation_id = Some(op.operation_id.clone());
        binding.updated_at = OffsetDateTime::now_utc();
        if let Err(e) = self.storage.put_binding(binding).await {
            let err = BrokerError::from(e);
            self.abandon(&key, &op.operation_id, &err).await;
            return Err(err);
        }
        self.observer
            .transition(OperationKind::Unbind, target, from.as_str(), "unbinding");
        drop(guard);

        let ctx = OperationContext {
            operation_id: op.operation_id.clone(),
            plan,
            accepts_incomplete: request.accepts_incomplete,
        };
        let outcome = self.provisioner.unbind(request, &ctx).await;
        self.settle(
            OperationKind::Unbind,
            target,
            &op.operation_id,
            request.accepts_incomplete,
            outcome,
        )
        .await
    }

    /// Must be called with the instance lock held.
    pub(super) async fn settle_binding(
        &self,
        kind: OperationKind,
        target: &OperationTarget,
        operation_id: &str,
        detail: Option<&CompletionDetail>,
    ) -> Result<(), BrokerError> {
        let Some(binding_id) = target.binding_id.as_deref() else {
            return Ok(());
        };
        let Some(mut binding) = self
            .storage
            .get_binding(&target.instance_id, binding_id)
            .await?
        else {
            return Ok(());
        };
        if binding.last_operation_id.as_deref() != Some(operation_id) {
            return Ok(());
        }
        let from = binding.state;
        binding.state = match (kind, detail) {
            (OperationKind::Bind, Some(detail)) => {
                binding.credentials = detail.credentials.clone();
                BindingState::Bound
            }
            (OperationKind::Unbind, Some(_)) => BindingState::Gone,
            _ => BindingState::Failed,
        };
        binding.updated_at = OffsetDateTime::now_utc();
        let to = binding.state;
        self.storage.put_binding(binding).await?;
        self.observer
            .transition(kind, target, from.as_str(), to.as_str());
        Ok(())
    }

    /// Mark every live binding of an instance `Gone`, for provisioners that
    /// remove bindings along with the instance.
    pub(super) async fn cascade_bindings_gone(
        &self,
        instance_id: &str,
        now: OffsetDateTime,
    ) -> Result<(), BrokerError> {
        for mut binding in self.storage.list_bindings(instance_id).await? {
            if !binding.state.is_live() {
                continue;
            }
            let target = OperationTarget::binding(instance_id, &binding.binding_id);
            let from = binding.state;
            binding.state = BindingState::Gone;
            binding.updated_at = now;
            self.storage.put_binding(binding).await?;
            self.observer.transition(
                OperationKind::Deprovision,
                &target,
                from.as_str(),
                BindingState::Gone.as_str(),
            );
        }
        Ok(())
    }

    pub(super) async fn evict_binding(
        &self,
        instance_id: &str,
        binding_id: &str,
    ) -> Result<(), BrokerError> {
        for kind in [OperationKind::Bind, OperationKind::Unbind] {
            self.storage
                .remove_idempotency(&IdempotencyKey::binding(kind, instance_id, binding_id))
                .await?;
        }
        self.storage.remove_binding(instance_id, binding_id).await?;
        Ok(())
    }
}
