use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use broker_storage::{
    BindingRecord, BindingState, IdempotencyClaim, IdempotencyKey, IdempotencyRecord,
    IdempotencyStore, InstanceRecord, InstanceState, LifecycleStore, MemoryStorage,
    OperationKind, OperationRecord, OperationStatus, OperationTarget, OperationTracker,
    StorageError,
};
use serde_json::json;
use time::OffsetDateTime;

use super::snapshot::RecordedOutcome;
use super::LifecycleEngine;
use crate::catalog::{Catalog, ServiceOffering, ServicePlan, StaticCatalog};
use crate::config::EngineConfig;
use crate::error::BrokerError;
use crate::observer::LifecycleObserver;
use crate::provisioner::{
    completion_channel, CompletionDetail, OperationContext, Provisioner, ProvisionerError,
    ProvisionerEvent, ProvisionerOutcome, SandboxProvisioner,
};
use crate::request::{
    BindRequest, DeprovisionRequest, LifecycleResponse, ProvisionRequest, UnbindRequest,
};

// ──────────────────────────────────────────────
// Fixtures
// ──────────────────────────────────────────────

#[derive(Default)]
struct FakeProvisioner {
    provisions: AtomicUsize,
    deprovisions: AtomicUsize,
    binds: AtomicUsize,
    unbinds: AtomicUsize,
    go_async: AtomicBool,
    fail_next: AtomicBool,
    cascade: bool,
    delay: Option<Duration>,
    during_call: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl FakeProvisioner {
    /// Run `hook` inside the next provisioner call.
    fn during_next_call(&self, hook: impl FnOnce() + Send + 'static) {
        *self.during_call.lock().unwrap() = Some(Box::new(hook));
    }

    async fn respond(
        &self,
        detail: CompletionDetail,
    ) -> Result<ProvisionerOutcome, ProvisionerError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let hook = self.during_call.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        if self.fail_next.swap(false, SeqCst) {
            return Err(ProvisionerError::Failed("backend exploded".into()));
        }
        if self.go_async.load(SeqCst) {
            return Ok(ProvisionerOutcome::AsyncAccepted {
                description: Some("working".into()),
            });
        }
        Ok(ProvisionerOutcome::Immediate(detail))
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn provision(
        &self,
        request: &ProvisionRequest,
        _ctx: &OperationContext,
    ) -> Result<ProvisionerOutcome, ProvisionerError> {
        self.provisions.fetch_add(1, SeqCst);
        self.respond(CompletionDetail {
            description: Some("ready".into()),
            dashboard_url: Some(format!("https://dash.example.com/{}", request.instance_id)),
            credentials: None,
        })
        .await
    }

    async fn deprovision(
        &self,
        _request: &DeprovisionRequest,
        _ctx: &OperationContext,
    ) -> Result<ProvisionerOutcome, ProvisionerError> {
        self.deprovisions.fetch_add(1, SeqCst);
        self.respond(CompletionDetail::default()).await
    }

    async fn bind(
        &self,
        _request: &BindRequest,
        _ctx: &OperationContext,
    ) -> Result<ProvisionerOutcome, ProvisionerError> {
        self.binds.fetch_add(1, SeqCst);
        self.respond(CompletionDetail {
            credentials: Some(json!({"password": uuid::Uuid::new_v4().to_string()})),
            ..Default::default()
        })
        .await
    }

    async fn unbind(
        &self,
        _request: &UnbindRequest,
        _ctx: &OperationContext,
    ) -> Result<ProvisionerOutcome, ProvisionerError> {
        self.unbinds.fetch_add(1, SeqCst);
        self.respond(CompletionDetail::default()).await
    }

    fn cascades_bindings(&self) -> bool {
        self.cascade
    }
}

fn plan(id: &str, requires_async: bool) -> ServicePlan {
    ServicePlan {
        id: id.into(),
        name: id.into(),
        description: String::new(),
        requires_async,
    }
}

fn catalog() -> Arc<StaticCatalog> {
    Arc::new(
        StaticCatalog::new(Catalog {
            services: vec![
                ServiceOffering {
                    id: "svc".into(),
                    name: "database".into(),
                    description: String::new(),
                    bindable: true,
                    tags: vec![],
                    plans: vec![plan("small", false), plan("slow", true)],
                },
                ServiceOffering {
                    id: "cache".into(),
                    name: "cache".into(),
                    description: String::new(),
                    bindable: false,
                    tags: vec![],
                    plans: vec![plan("basic", false)],
                },
            ],
        })
        .unwrap(),
    )
}

fn engine(provisioner: Arc<FakeProvisioner>) -> LifecycleEngine<MemoryStorage> {
    engine_with(provisioner, EngineConfig::default())
}

fn engine_with(
    provisioner: Arc<FakeProvisioner>,
    config: EngineConfig,
) -> LifecycleEngine<MemoryStorage> {
    LifecycleEngine::new(Arc::new(MemoryStorage::new()), catalog(), provisioner, config)
}

fn provision_req(instance_id: &str) -> ProvisionRequest {
    ProvisionRequest {
        instance_id: instance_id.into(),
        service_id: "svc".into(),
        plan_id: "small".into(),
        parameters: json!({"size": 1}),
        accepts_incomplete: false,
    }
}

fn deprovision_req(instance_id: &str) -> DeprovisionRequest {
    DeprovisionRequest {
        instance_id: instance_id.into(),
        service_id: "svc".into(),
        plan_id: "small".into(),
        accepts_incomplete: false,
    }
}

fn bind_req(instance_id: &str, binding_id: &str) -> BindRequest {
    BindRequest {
        instance_id: instance_id.into(),
        binding_id: binding_id.into(),
        service_id: "svc".into(),
        plan_id: "small".into(),
        parameters: json!({}),
        accepts_incomplete: false,
    }
}

fn unbind_req(instance_id: &str, binding_id: &str) -> UnbindRequest {
    UnbindRequest {
        instance_id: instance_id.into(),
        binding_id: binding_id.into(),
        service_id: "svc".into(),
        plan_id: "small".into(),
        accepts_incomplete: false,
    }
}

fn accepted_id(response: &LifecycleResponse) -> String {
    match response {
        LifecycleResponse::Accepted { operation_id } => operation_id.clone(),
        other => panic!("expected Accepted, got {other:?}"),
    }
}

async fn last_operation_id(engine: &LifecycleEngine<MemoryStorage>, instance_id: &str) -> String {
    engine
        .storage()
        .get_instance(instance_id)
        .await
        .unwrap()
        .and_then(|i| i.last_operation_id)
        .unwrap()
}

// ──────────────────────────────────────────────
// Provision
// ──────────────────────────────────────────────

#[tokio::test]
async fn repeated_provision_replays_without_calling_provisioner() {
    let fake = Arc::new(FakeProvisioner::default());
    let engine = engine(fake.clone());

    let first = engine.provision(provision_req("i-1")).await.unwrap();
    let second = engine.provision(provision_req("i-1")).await.unwrap();

    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(first.response, second.response);
    assert_eq!(fake.provisions.load(SeqCst), 1);

    let instance = engine.fetch_instance("i-1").await.unwrap();
    assert_eq!(instance.state, InstanceState::Succeeded);
    assert_eq!(
        instance.dashboard_url.as_deref(),
        Some("https://dash.example.com/i-1")
    );
}

#[tokio::test]
async fn conflicting_provision_leaves_instance_unchanged() {
    let fake = Arc::new(FakeProvisioner::default());
    let engine = engine(fake.clone());
    engine.provision(provision_req("i-1")).await.unwrap();

    let mut other = provision_req("i-1");
    other.parameters = json!({"size": 2});
    let err = engine.provision(other).await.unwrap_err();

    assert_eq!(
        err,
        BrokerError::InstanceConflict {
            instance_id: "i-1".into()
        }
    );
    assert_eq!(fake.provisions.load(SeqCst), 1);
    let instance = engine.fetch_instance("i-1").await.unwrap();
    assert_eq!(instance.parameters, json!({"size": 1}));
    assert_eq!(instance.state, InstanceState::Succeeded);
}

#[tokio::test]
async fn unknown_plan_is_rejected_before_any_write() {
    let fake = Arc::new(FakeProvisioner::default());
    let engine = engine(fake.clone());
    let mut req = provision_req("i-1");
    req.plan_id = "huge".into();

    let err = engine.provision(req).await.unwrap_err();

    assert_eq!(
        err,
        BrokerError::InvalidPlan {
            service_id: "svc".into(),
            plan_id: "huge".into()
        }
    );
    assert!(engine.storage().get_instance("i-1").await.unwrap().is_none());
    assert_eq!(fake.provisions.load(SeqCst), 0);
}

#[tokio::test]
async fn async_only_plan_requires_accepts_incomplete() {
    let fake = Arc::new(FakeProvisioner::default());
    let engine = engine(fake.clone());
    let mut req = provision_req("i-1");
    req.plan_id = "slow".into();

    let err = engine.provision(req).await.unwrap_err();

    assert_eq!(err, BrokerError::AsyncRequired);
    assert_eq!(fake.provisions.load(SeqCst), 0);
    assert!(engine.storage().get_instance("i-1").await.unwrap().is_none());
    let key = IdempotencyKey::instance(OperationKind::Provision, "i-1");
    assert!(engine.storage().get_idempotency(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn failed_provision_is_retried_on_replay() {
    let fake = Arc::new(FakeProvisioner::default());
    let engine = engine(fake.clone());
    fake.fail_next.store(true, SeqCst);

    let err = engine.provision(provision_req("i-1")).await.unwrap_err();
    assert_eq!(
        err,
        BrokerError::ProvisionerFailure("backend exploded".into())
    );
    assert_eq!(
        engine.fetch_instance("i-1").await.unwrap().state,
        InstanceState::Failed
    );
    let failed_op = last_operation_id(&engine, "i-1").await;
    let state = engine.poll_operation(&failed_op).await.unwrap();
    assert_eq!(state.status, OperationStatus::Failed);

    let retried = engine.provision(provision_req("i-1")).await.unwrap();
    assert!(!retried.replayed);
    assert_eq!(fake.provisions.load(SeqCst), 2);
    assert_eq!(
        engine.fetch_instance("i-1").await.unwrap().state,
        InstanceState::Succeeded
    );
}

#[tokio::test]
async fn concurrent_identical_provisions_call_provisioner_once() {
    let fake = Arc::new(FakeProvisioner {
        delay: Some(Duration::from_millis(50)),
        ..Default::default()
    });
    let engine = Arc::new(engine(fake.clone()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            engine.provision(provision_req("i-1")).await
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(BrokerError::ConcurrencyError { instance_id }) => assert_eq!(instance_id, "i-1"),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(succeeded >= 1);
    assert_eq!(fake.provisions.load(SeqCst), 1);

    let replay = engine.provision(provision_req("i-1")).await.unwrap();
    assert!(replay.replayed);
}

#[tokio::test]
async fn lock_table_is_empty_between_operations() {
    let engine = engine(Arc::new(FakeProvisioner::default()));
    for i in 0..200 {
        engine.provision(provision_req(&format!("i-{i}"))).await.unwrap();
    }
    engine.bind(bind_req("i-0", "b-1")).await.unwrap();
    engine.unbind(unbind_req("i-0", "b-1")).await.unwrap();
    engine.deprovision(deprovision_req("i-0")).await.unwrap();

    assert_eq!(engine.locks.len(), 0);
}

#[tokio::test]
async fn gone_instance_id_is_not_reused_by_default() {
    let fake = Arc::new(FakeProvisioner::default());
    let engine = engine(fake.clone());
    engine.provision(provision_req("i-1")).await.unwrap();
    engine.deprovision(deprovision_req("i-1")).await.unwrap();

    let err = engine.provision(provision_req("i-1")).await.unwrap_err();

    assert_eq!(
        err,
        BrokerError::InstanceConflict {
            instance_id: "i-1".into()
        }
    );
    assert_eq!(fake.provisions.load(SeqCst), 1);
}

#[tokio::test]
async fn gone_instance_id_is_reused_when_allowed() {
    let fake = Arc::new(FakeProvisioner::default());
    let engine = engine_with(
        fake.clone(),
        EngineConfig {
            allow_id_reuse: true,
            ..EngineConfig::default()
        },
    );
    engine.provision(provision_req("i-1")).await.unwrap();
    engine.deprovision(deprovision_req("i-1")).await.unwrap();

    let mut again = provision_req("i-1");
    again.parameters = json!({"size": 3});
    let decision = engine.provision(again).await.unwrap();

    assert!(!decision.replayed);
    assert_eq!(fake.provisions.load(SeqCst), 2);
    let instance = engine.fetch_instance("i-1").await.unwrap();
    assert_eq!(instance.parameters, json!({"size": 3}));
}

// ──────────────────────────────────────────────
// Async provision
// ──────────────────────────────────────────────

#[tokio::test]
async fn async_provision_is_polled_replayed_and_completed() {
    let fake = Arc::new(FakeProvisioner::default());
    fake.go_async.store(true, SeqCst);
    let engine = engine(fake.clone());
    let mut req = provision_req("i-1");
    req.accepts_incomplete = true;

    let accepted = engine.provision(req.clone()).await.unwrap();
    let operation_id = accepted_id(&accepted.response);

    let state = engine.poll_operation(&operation_id).await.unwrap();
    assert_eq!(state.status, OperationStatus::InProgress);
    assert_eq!(state.description.as_deref(), Some("working"));

    let replay = engine.provision(req.clone()).await.unwrap();
    assert!(replay.replayed);
    assert_eq!(replay.response, accepted.response);

    let mut sync_req = req.clone();
    sync_req.accepts_incomplete = false;
    assert_eq!(
        engine.provision(sync_req).await.unwrap_err(),
        BrokerError::AsyncRequired
    );

    let completed = ProvisionerEvent::Completed {
        operation_id: operation_id.clone(),
        result: Ok(CompletionDetail {
            description: Some("done".into()),
            dashboard_url: Some("https://dash.example.com/async".into()),
            credentials: None,
        }),
    };
    engine.handle_event(completed.clone()).await.unwrap();
    // A duplicate completion changes nothing.
    engine.handle_event(completed).await.unwrap();

    let state = engine.poll_operation(&operation_id).await.unwrap();
    assert_eq!(state.status, OperationStatus::Succeeded);
    assert_eq!(state.description.as_deref(), Some("done"));

    let after = engine.provision(req).await.unwrap();
    assert!(after.replayed);
    assert_eq!(
        after.response,
        LifecycleResponse::Succeeded {
            dashboard_url: Some("https://dash.example.com/async".into()),
            credentials: None,
        }
    );
    assert_eq!(fake.provisions.load(SeqCst), 1);

    let last = engine.last_operation("i-1", None).await.unwrap();
    assert_eq!(last.operation_id, operation_id);
    assert_eq!(last.kind, OperationKind::Provision);
}

#[tokio::test]
async fn async_failure_marks_operation_and_instance_failed() {
    let fake = Arc::new(FakeProvisioner::default());
    fake.go_async.store(true, SeqCst);
    let engine = engine(fake.clone());
    let mut req = provision_req("i-1");
    req.accepts_incomplete = true;

    let operation_id = accepted_id(&engine.provision(req.clone()).await.unwrap().response);
    engine
        .handle_event(ProvisionerEvent::Progress {
            operation_id: operation_id.clone(),
            description: "50%".into(),
        })
        .await
        .unwrap();
    assert_eq!(
        engine
            .poll_operation(&operation_id)
            .await
            .unwrap()
            .description
            .as_deref(),
        Some("50%")
    );

    engine
        .handle_event(ProvisionerEvent::Completed {
            operation_id: operation_id.clone(),
            result: Err(ProvisionerError::Failed("disk full".into())),
        })
        .await
        .unwrap();

    let state = engine.poll_operation(&operation_id).await.unwrap();
    assert_eq!(state.status, OperationStatus::Failed);
    assert_eq!(state.description.as_deref(), Some("disk full"));
    assert_eq!(
        engine.fetch_instance("i-1").await.unwrap().state,
        InstanceState::Failed
    );

    fake.go_async.store(false, SeqCst);
    let retried = engine.provision(req).await.unwrap();
    assert!(!retried.replayed);
    assert!(matches!(
        retried.response,
        LifecycleResponse::Succeeded { .. }
    ));
    assert_eq!(fake.provisions.load(SeqCst), 2);
}

#[tokio::test]
async fn async_result_without_accepts_incomplete_stays_tracked() {
    let fake = Arc::new(FakeProvisioner::default());
    fake.go_async.store(true, SeqCst);
    let engine = engine(fake.clone());

    let err = engine.provision(provision_req("i-1")).await.unwrap_err();
    assert_eq!(err, BrokerError::AsyncRequired);
    let operation_id = last_operation_id(&engine, "i-1").await;
    assert_eq!(
        engine.poll_operation(&operation_id).await.unwrap().status,
        OperationStatus::InProgress
    );
    let key = IdempotencyKey::instance(OperationKind::Provision, "i-1");
    let record = engine.storage().get_idempotency(&key).await.unwrap().unwrap();
    assert_eq!(
        RecordedOutcome::from_value(&record.result).unwrap(),
        RecordedOutcome::Accepted {
            operation_id: operation_id.clone()
        }
    );

    // The work is already under way: repeats never reach the provisioner.
    let err = engine.provision(provision_req("i-1")).await.unwrap_err();
    assert_eq!(err, BrokerError::AsyncRequired);
    let mut req = provision_req("i-1");
    req.accepts_incomplete = true;
    let replay = engine.provision(req).await.unwrap();
    assert!(replay.replayed);
    assert_eq!(accepted_id(&replay.response), operation_id);
    assert_eq!(fake.provisions.load(SeqCst), 1);

    engine
        .handle_event(ProvisionerEvent::Completed {
            operation_id,
            result: Ok(CompletionDetail::default()),
        })
        .await
        .unwrap();
    assert_eq!(
        engine.fetch_instance("i-1").await.unwrap().state,
        InstanceState::Succeeded
    );
}

#[tokio::test]
async fn completion_for_unknown_operation_is_reported() {
    let engine = engine(Arc::new(FakeProvisioner::default()));
    let err = engine
        .handle_event(ProvisionerEvent::Completed {
            operation_id: "nope".into(),
            result: Ok(CompletionDetail::default()),
        })
        .await
        .unwrap_err();
    assert_eq!(
        err,
        BrokerError::OperationNotFound {
            operation_id: "nope".into()
        }
    );
}

#[tokio::test]
async fn sandbox_completion_flows_through_event_listener() {
    let (notifier, events) = completion_channel();
    let sandbox = SandboxProvisioner::new(notifier).with_async_delay(Duration::from_millis(10));
    let engine = Arc::new(LifecycleEngine::new(
        Arc::new(MemoryStorage::new()),
        catalog(),
        Arc::new(sandbox),
        EngineConfig::default(),
    ));
    let listener = engine.spawn_event_listener(events);

    let mut req = provision_req("i-1");
    req.accepts_incomplete = true;
    let operation_id = accepted_id(&engine.provision(req).await.unwrap().response);

    let mut status = OperationStatus::InProgress;
    for _ in 0..200 {
        status = engine.poll_operation(&operation_id).await.unwrap().status;
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(status, OperationStatus::Succeeded);
    assert_eq!(
        engine.fetch_instance("i-1").await.unwrap().state,
        InstanceState::Succeeded
    );
    listener.abort();
}

// ──────────────────────────────────────────────
// Deprovision
// ──────────────────────────────────────────────

#[tokio::test]
async fn deprovision_refused_while_bound_then_allowed_after_unbind() {
    let fake = Arc::new(FakeProvisioner::default());
    let engine = engine(fake.clone());
    engine.provision(provision_req("i-1")).await.unwrap();
    engine.bind(bind_req("i-1", "b-1")).await.unwrap();

    let err = engine.deprovision(deprovision_req("i-1")).await.unwrap_err();
    assert_eq!(
        err,
        BrokerError::InstanceHasBindings {
            instance_id: "i-1".into(),
            count: 1
        }
    );
    assert_eq!(fake.deprovisions.load(SeqCst), 0);

    engine.unbind(unbind_req("i-1", "b-1")).await.unwrap();
    let decision = engine.deprovision(deprovision_req("i-1")).await.unwrap();

    assert_eq!(decision.response, LifecycleResponse::empty_success());
    assert_eq!(fake.deprovisions.load(SeqCst), 1);
    assert!(matches!(
        engine.fetch_instance("i-1").await,
        Err(BrokerError::InstanceNotFound { .. })
    ));
}

#[tokio::test]
async fn deprovision_of_missing_instance_is_not_found() {
    let engine = engine(Arc::new(FakeProvisioner::default()));
    let err = engine.deprovision(deprovision_req("ghost")).await.unwrap_err();
    assert_eq!(
        err,
        BrokerError::InstanceNotFound {
            instance_id: "ghost".into()
        }
    );
}

#[tokio::test]
async fn repeated_deprovision_replays_success() {
    let fake = Arc::new(FakeProvisioner::default());
    let engine = engine(fake.clone());
    engine.provision(provision_req("i-1")).await.unwrap();

    let first = engine.deprovision(deprovision_req("i-1")).await.unwrap();
    let second = engine.deprovision(deprovision_req("i-1")).await.unwrap();

    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(fake.deprovisions.load(SeqCst), 1);
}

#[tokio::test]
async fn deprovision_while_provisioning_is_a_concurrency_error() {
    let fake = Arc::new(FakeProvisioner::default());
    fake.go_async.store(true, SeqCst);
    let engine = engine(fake.clone());
    let mut req = provision_req("i-1");
    req.accepts_incomplete = true;
    engine.provision(req).await.unwrap();

    let err = engine.deprovision(deprovision_req("i-1")).await.unwrap_err();
    assert_eq!(
        err,
        BrokerError::ConcurrencyError {
            instance_id: "i-1".into()
        }
    );
    assert_eq!(fake.deprovisions.load(SeqCst), 0);
}

#[tokio::test]
async fn cascading_provisioner_removes_bindings_with_instance() {
    let fake = Arc::new(FakeProvisioner {
        cascade: true,
        ..Default::default()
    });
    let engine = engine(fake.clone());
    engine.provision(provision_req("i-1")).await.unwrap();
    engine.bind(bind_req("i-1", "b-1")).await.unwrap();

    engine.deprovision(deprovision_req("i-1")).await.unwrap();

    assert!(matches!(
        engine.fetch_binding("i-1", "b-1").await,
        Err(BrokerError::BindingNotFound { .. })
    ));
    let stored = engine
        .storage()
        .get_binding("i-1", "b-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, BindingState::Gone);
}

// ──────────────────────────────────────────────
// Bind / unbind
// ──────────────────────────────────────────────

#[tokio::test]
async fn bind_on_provisioning_instance_is_not_ready() {
    let fake = Arc::new(FakeProvisioner::default());
    fake.go_async.store(true, SeqCst);
    let engine = engine(fake.clone());
    let mut req = provision_req("i-1");
    req.accepts_incomplete = true;
    engine.provision(req).await.unwrap();

    let err = engine.bind(bind_req("i-1", "b-1")).await.unwrap_err();

    assert_eq!(
        err,
        BrokerError::InstanceNotReady {
            instance_id: "i-1".into(),
            state: InstanceState::Provisioning
        }
    );
    assert_eq!(fake.binds.load(SeqCst), 0);
}

#[tokio::test]
async fn bind_on_missing_instance_is_not_found() {
    let engine = engine(Arc::new(FakeProvisioner::default()));
    let err = engine.bind(bind_req("ghost", "b-1")).await.unwrap_err();
    assert_eq!(
        err,
        BrokerError::InstanceNotFound {
            instance_id: "ghost".into()
        }
    );
}

#[tokio::test]
async fn repeated_bind_returns_identical_credentials() {
    let fake = Arc::new(FakeProvisioner::default());
    let engine = engine(fake.clone());
    engine.provision(provision_req("i-1")).await.unwrap();

    let first = engine.bind(bind_req("i-1", "b-1")).await.unwrap();
    let second = engine.bind(bind_req("i-1", "b-1")).await.unwrap();

    assert!(second.replayed);
    assert_eq!(first.response, second.response);
    assert_eq!(fake.binds.load(SeqCst), 1);
    let LifecycleResponse::Succeeded {
        credentials: Some(credentials),
        ..
    } = first.response
    else {
        panic!("expected credentials");
    };
    let view = engine.fetch_binding("i-1", "b-1").await.unwrap();
    assert_eq!(view.state, BindingState::Bound);
    assert_eq!(view.credentials, Some(credentials));
}

#[tokio::test]
async fn conflicting_bind_is_rejected() {
    let fake = Arc::new(FakeProvisioner::default());
    let engine = engine(fake.clone());
    engine.provision(provision_req("i-1")).await.unwrap();
    engine.bind(bind_req("i-1", "b-1")).await.unwrap();

    let mut other = bind_req("i-1", "b-1");
    other.parameters = json!({"role": "admin"});
    let err = engine.bind(other).await.unwrap_err();

    assert_eq!(
        err,
        BrokerError::BindingConflict {
            instance_id: "i-1".into(),
            binding_id: "b-1".into()
        }
    );
    assert_eq!(fake.binds.load(SeqCst), 1);
}

#[tokio::test]
async fn non_bindable_offering_is_rejected_before_any_write() {
    let fake = Arc::new(FakeProvisioner::default());
    let engine = engine(fake.clone());
    let mut req = bind_req("i-1", "b-1");
    req.service_id = "cache".into();
    req.plan_id = "basic".into();

    let err = engine.bind(req).await.unwrap_err();

    assert_eq!(
        err,
        BrokerError::NotBindable {
            service_id: "cache".into()
        }
    );
    assert_eq!(fake.binds.load(SeqCst), 0);
    let key = IdempotencyKey::binding(OperationKind::Bind, "i-1", "b-1");
    assert!(engine.storage().get_idempotency(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn failed_bind_leaves_binding_failed_and_can_be_retried() {
    let fake = Arc::new(FakeProvisioner::default());
    let engine = engine(fake.clone());
    engine.provision(provision_req("i-1")).await.unwrap();
    fake.fail_next.store(true, SeqCst);

    assert!(matches!(
        engine.bind(bind_req("i-1", "b-1")).await,
        Err(BrokerError::ProvisionerFailure(_))
    ));
    assert_eq!(
        engine.fetch_binding("i-1", "b-1").await.unwrap().state,
        BindingState::Failed
    );

    engine.bind(bind_req("i-1", "b-1")).await.unwrap();
    assert_eq!(fake.binds.load(SeqCst), 2);
    assert_eq!(
        engine.fetch_binding("i-1", "b-1").await.unwrap().state,
        BindingState::Bound
    );
}

#[tokio::test]
async fn async_bind_completes_through_event() {
    let fake = Arc::new(FakeProvisioner::default());
    let engine = engine(fake.clone());
    engine.provision(provision_req("i-1")).await.unwrap();
    fake.go_async.store(true, SeqCst);
    let mut req = bind_req("i-1", "b-1");
    req.accepts_incomplete = true;

    let operation_id = accepted_id(&engine.bind(req.clone()).await.unwrap().response);
    engine
        .handle_event(ProvisionerEvent::Completed {
            operation_id: operation_id.clone(),
            result: Ok(CompletionDetail {
                credentials: Some(json!({"password": "late"})),
                ..Default::default()
            }),
        })
        .await
        .unwrap();

    let state = engine
        .last_binding_operation("i-1", "b-1", Some(operation_id.as_str()))
        .await
        .unwrap();
    assert_eq!(state.status, OperationStatus::Succeeded);
    let replay = engine.bind(req).await.unwrap();
    assert_eq!(
        replay.response,
        LifecycleResponse::Succeeded {
            dashboard_url: None,
            credentials: Some(json!({"password": "late"})),
        }
    );
}

#[tokio::test]
async fn unbind_of_never_created_binding_is_not_found() {
    let fake = Arc::new(FakeProvisioner::default());
    let engine = engine(fake.clone());
    engine.provision(provision_req("i-1")).await.unwrap();

    let err = engine.unbind(unbind_req("i-1", "b-404")).await.unwrap_err();

    assert_eq!(
        err,
        BrokerError::BindingNotFound {
            instance_id: "i-1".into(),
            binding_id: "b-404".into()
        }
    );
    assert_eq!(fake.unbinds.load(SeqCst), 0);
}

#[tokio::test]
async fn repeated_unbind_replays_success() {
    let fake = Arc::new(FakeProvisioner::default());
    let engine = engine(fake.clone());
    engine.provision(provision_req("i-1")).await.unwrap();
    engine.bind(bind_req("i-1", "b-1")).await.unwrap();

    engine.unbind(unbind_req("i-1", "b-1")).await.unwrap();
    let again = engine.unbind(unbind_req("i-1", "b-1")).await.unwrap();

    assert!(again.replayed);
    assert_eq!(fake.unbinds.load(SeqCst), 1);
}

// ──────────────────────────────────────────────
// Polling and retention
// ──────────────────────────────────────────────

#[tokio::test]
async fn unknown_operation_is_not_found() {
    let engine = engine(Arc::new(FakeProvisioner::default()));
    assert_eq!(
        engine.poll_operation("missing").await.unwrap_err(),
        BrokerError::OperationNotFound {
            operation_id: "missing".into()
        }
    );
}

#[tokio::test]
async fn operation_of_another_instance_is_not_found() {
    let engine = engine(Arc::new(FakeProvisioner::default()));
    engine.provision(provision_req("i-1")).await.unwrap();
    engine.provision(provision_req("i-2")).await.unwrap();
    let foreign = last_operation_id(&engine, "i-2").await;

    let err = engine
        .last_operation("i-1", Some(foreign.as_str()))
        .await
        .unwrap_err();

    assert_eq!(err, BrokerError::OperationNotFound { operation_id: foreign });
}

#[tokio::test]
async fn expired_operations_and_gone_resources_are_collected() {
    let fake = Arc::new(FakeProvisioner::default());
    let engine = engine_with(
        fake.clone(),
        EngineConfig {
            retention: Duration::ZERO,
            ..EngineConfig::default()
        },
    );
    engine.provision(provision_req("i-1")).await.unwrap();
    let provision_op = last_operation_id(&engine, "i-1").await;
    assert!(matches!(
        engine.poll_operation(&provision_op).await,
        Err(BrokerError::OperationNotFound { .. })
    ));

    engine.deprovision(deprovision_req("i-1")).await.unwrap();
    let report = engine.collect_garbage().await.unwrap();
    assert_eq!(report.instances, 1);
    assert_eq!(report.operations, 1);

    // Records are gone: the deprovision no longer replays, and the id is free.
    assert_eq!(
        engine.deprovision(deprovision_req("i-1")).await.unwrap_err(),
        BrokerError::InstanceNotFound {
            instance_id: "i-1".into()
        }
    );
    let decision = engine.provision(provision_req("i-1")).await.unwrap();
    assert!(!decision.replayed);
    assert_eq!(fake.provisions.load(SeqCst), 2);
}

#[tokio::test]
async fn gone_bindings_are_collected() {
    let fake = Arc::new(FakeProvisioner::default());
    let engine = engine_with(
        fake.clone(),
        EngineConfig {
            retention: Duration::ZERO,
            ..EngineConfig::default()
        },
    );
    engine.provision(provision_req("i-1")).await.unwrap();
    engine.bind(bind_req("i-1", "b-1")).await.unwrap();
    engine.unbind(unbind_req("i-1", "b-1")).await.unwrap();

    let report = engine.collect_garbage().await.unwrap();
    assert_eq!(report.bindings, 1);
    assert_eq!(report.instances, 0);

    let mut rebind = bind_req("i-1", "b-1");
    rebind.parameters = json!({"role": "reader"});
    engine.bind(rebind).await.unwrap();
    assert_eq!(fake.binds.load(SeqCst), 2);
}

#[tokio::test]
async fn retention_keeps_recent_operations() {
    let engine = engine(Arc::new(FakeProvisioner::default()));
    engine.provision(provision_req("i-1")).await.unwrap();
    let op = last_operation_id(&engine, "i-1").await;

    let report = engine.collect_garbage().await.unwrap();

    assert_eq!(report, super::GcReport::default());
    assert_eq!(
        engine.poll_operation(&op).await.unwrap().status,
        OperationStatus::Succeeded
    );
}

// ──────────────────────────────────────────────
// Storage failures
// ──────────────────────────────────────────────

/// Wraps `MemoryStorage`; fails every call while `down`, and only
/// instance writes while `instance_writes_down`. `failing_instance_writes`
/// fails that many instance writes, then recovers.
#[derive(Default)]
struct FlakyStorage {
    inner: MemoryStorage,
    down: AtomicBool,
    instance_writes_down: AtomicBool,
    failing_instance_writes: AtomicUsize,
}

impl FlakyStorage {
    fn check(&self) -> Result<(), StorageError> {
        if self.down.load(SeqCst) {
            return Err(StorageError::Backend("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for FlakyStorage {
    async fn get_idempotency(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, StorageError> {
        self.check()?;
        self.inner.get_idempotency(key).await
    }

    async fn put_if_absent_or_matching(
        &self,
        key: &IdempotencyKey,
        fingerprint: &str,
        result: serde_json::Value,
    ) -> Result<IdempotencyClaim, StorageError> {
        self.check()?;
        self.inner
            .put_if_absent_or_matching(key, fingerprint, result)
            .await
    }

    async fn update_result(
        &self,
        key: &IdempotencyKey,
        expected_version: i64,
        result: serde_json::Value,
    ) -> Result<i64, StorageError> {
        self.check()?;
        self.inner.update_result(key, expected_version, result).await
    }

    async fn remove_idempotency(&self, key: &IdempotencyKey) -> Result<(), StorageError> {
        self.check()?;
        self.inner.remove_idempotency(key).await
    }

    async fn list_idempotency_for_instance(
        &self,
        instance_id: &str,
    ) -> Result<Vec<IdempotencyRecord>, StorageError> {
        self.check()?;
        self.inner.list_idempotency_for_instance(instance_id).await
    }
}

#[async_trait]
impl OperationTracker for FlakyStorage {
    async fn create_operation(
        &self,
        kind: OperationKind,
        target: OperationTarget,
    ) -> Result<OperationRecord, StorageError> {
        self.check()?;
        self.inner.create_operation(kind, target).await
    }

    async fn complete_operation(
        &self,
        operation_id: &str,
        status: OperationStatus,
        description: Option<String>,
    ) -> Result<bool, StorageError> {
        self.check()?;
        self.inner
            .complete_operation(operation_id, status, description)
            .await
    }

    async fn update_description(
        &self,
        operation_id: &str,
        description: String,
    ) -> Result<(), StorageError> {
        self.check()?;
        self.inner.update_description(operation_id, description).await
    }

    async fn get_operation(
        &self,
        operation_id: &str,
    ) -> Result<Option<OperationRecord>, StorageError> {
        self.check()?;
        self.inner.get_operation(operation_id).await
    }

    async fn purge_operation_if_expired(
        &self,
        operation_id: &str,
        completed_before: OffsetDateTime,
    ) -> Result<bool, StorageError> {
        self.check()?;
        self.inner
            .purge_operation_if_expired(operation_id, completed_before)
            .await
    }

    async fn purge_completed_operations(
        &self,
        completed_before: OffsetDateTime,
    ) -> Result<usize, StorageError> {
        self.check()?;
        self.inner.purge_completed_operations(completed_before).await
    }
}

#[async_trait]
impl LifecycleStore for FlakyStorage {
    async fn get_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<InstanceRecord>, StorageError> {
        self.check()?;
        self.inner.get_instance(instance_id).await
    }

    async fn put_instance(&self, record: InstanceRecord) -> Result<(), StorageError> {
        self.check()?;
        let transient = self
            .failing_instance_writes
            .fetch_update(SeqCst, SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if transient || self.instance_writes_down.load(SeqCst) {
            return Err(StorageError::Backend("disk full".into()));
        }
        self.inner.put_instance(record).await
    }

    async fn remove_instance(&self, instance_id: &str) -> Result<(), StorageError> {
        self.check()?;
        self.inner.remove_instance(instance_id).await
    }

    async fn list_gone_instances(
        &self,
        updated_before: OffsetDateTime,
    ) -> Result<Vec<InstanceRecord>, StorageError> {
        self.check()?;
        self.inner.list_gone_instances(updated_before).await
    }

    async fn get_binding(
        &self,
        instance_id: &str,
        binding_id: &str,
    ) -> Result<Option<BindingRecord>, StorageError> {
        self.check()?;
        self.inner.get_binding(instance_id, binding_id).await
    }

    async fn put_binding(&self, record: BindingRecord) -> Result<(), StorageError> {
        self.check()?;
        self.inner.put_binding(record).await
    }

    async fn remove_binding(
        &self,
        instance_id: &str,
        binding_id: &str,
    ) -> Result<(), StorageError> {
        self.check()?;
        self.inner.remove_binding(instance_id, binding_id).await
    }

    async fn list_bindings(&self, instance_id: &str) -> Result<Vec<BindingRecord>, StorageError> {
        self.check()?;
        self.inner.list_bindings(instance_id).await
    }

    async fn list_gone_bindings(
        &self,
        updated_before: OffsetDateTime,
    ) -> Result<Vec<BindingRecord>, StorageError> {
        self.check()?;
        self.inner.list_gone_bindings(updated_before).await
    }
}

#[tokio::test]
async fn storage_outage_is_surfaced_and_nothing_is_provisioned() {
    let fake = Arc::new(FakeProvisioner::default());
    let storage = Arc::new(FlakyStorage::default());
    let engine = LifecycleEngine::new(
        storage.clone(),
        catalog(),
        fake.clone(),
        EngineConfig::default(),
    );

    storage.down.store(true, SeqCst);
    let err = engine.provision(provision_req("i-1")).await.unwrap_err();
    assert!(matches!(err, BrokerError::StorageUnavailable(_)));
    assert_eq!(fake.provisions.load(SeqCst), 0);

    storage.down.store(false, SeqCst);
    engine.provision(provision_req("i-1")).await.unwrap();
    assert_eq!(fake.provisions.load(SeqCst), 1);
}

#[tokio::test]
async fn claim_is_released_when_state_write_fails() {
    let fake = Arc::new(FakeProvisioner::default());
    let storage = Arc::new(FlakyStorage::default());
    let engine = LifecycleEngine::new(
        storage.clone(),
        catalog(),
        fake.clone(),
        EngineConfig::default(),
    );

    storage.instance_writes_down.store(true, SeqCst);
    let err = engine.provision(provision_req("i-1")).await.unwrap_err();
    assert!(matches!(err, BrokerError::StorageUnavailable(_)));
    assert_eq!(fake.provisions.load(SeqCst), 0);

    // The abandoned claim does not block the retry.
    storage.instance_writes_down.store(false, SeqCst);
    let decision = engine.provision(provision_req("i-1")).await.unwrap();
    assert!(!decision.replayed);
    assert_eq!(fake.provisions.load(SeqCst), 1);
}

fn flaky_engine(
    storage: &Arc<FlakyStorage>,
    fake: &Arc<FakeProvisioner>,
) -> LifecycleEngine<FlakyStorage> {
    LifecycleEngine::new(
        storage.clone(),
        catalog(),
        fake.clone(),
        EngineConfig::default(),
    )
}

async fn last_operation_id_in(storage: &FlakyStorage, instance_id: &str) -> String {
    storage
        .get_instance(instance_id)
        .await
        .unwrap()
        .and_then(|i| i.last_operation_id)
        .unwrap()
}

#[tokio::test]
async fn transient_result_write_failure_is_retried() {
    let fake = Arc::new(FakeProvisioner::default());
    let storage = Arc::new(FlakyStorage::default());
    let engine = flaky_engine(&storage, &fake);
    let failing = storage.clone();
    fake.during_next_call(move || failing.failing_instance_writes.store(2, SeqCst));

    let decision = engine.provision(provision_req("i-1")).await.unwrap();

    assert!(matches!(
        decision.response,
        LifecycleResponse::Succeeded { .. }
    ));
    assert_eq!(
        engine.fetch_instance("i-1").await.unwrap().state,
        InstanceState::Succeeded
    );
    let op = engine
        .poll_operation(&last_operation_id_in(&storage, "i-1").await)
        .await
        .unwrap();
    assert_eq!(op.status, OperationStatus::Succeeded);
}

#[tokio::test]
async fn lost_result_write_fails_operation_and_allows_retry() {
    let fake = Arc::new(FakeProvisioner::default());
    let storage = Arc::new(FlakyStorage::default());
    let engine = flaky_engine(&storage, &fake);
    let failing = storage.clone();
    fake.during_next_call(move || failing.instance_writes_down.store(true, SeqCst));

    let err = engine.provision(provision_req("i-1")).await.unwrap_err();
    assert!(matches!(err, BrokerError::StorageUnavailable(_)));
    assert_eq!(fake.provisions.load(SeqCst), 1);

    assert_eq!(
        storage.get_instance("i-1").await.unwrap().unwrap().state,
        InstanceState::Provisioning
    );
    let op = engine
        .poll_operation(&last_operation_id_in(&storage, "i-1").await)
        .await
        .unwrap();
    assert_eq!(op.status, OperationStatus::Failed);

    storage.instance_writes_down.store(false, SeqCst);
    let retried = engine.provision(provision_req("i-1")).await.unwrap();
    assert!(!retried.replayed);
    assert_eq!(fake.provisions.load(SeqCst), 2);
    assert_eq!(
        engine.fetch_instance("i-1").await.unwrap().state,
        InstanceState::Succeeded
    );
}

#[tokio::test]
async fn lost_async_completion_fails_operation_and_allows_retry() {
    let fake = Arc::new(FakeProvisioner::default());
    fake.go_async.store(true, SeqCst);
    let storage = Arc::new(FlakyStorage::default());
    let engine = flaky_engine(&storage, &fake);
    let mut req = provision_req("i-1");
    req.accepts_incomplete = true;
    let operation_id = accepted_id(&engine.provision(req.clone()).await.unwrap().response);

    storage.instance_writes_down.store(true, SeqCst);
    let err = engine
        .handle_event(ProvisionerEvent::Completed {
            operation_id: operation_id.clone(),
            result: Ok(CompletionDetail::default()),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::StorageUnavailable(_)));
    assert_eq!(
        engine.poll_operation(&operation_id).await.unwrap().status,
        OperationStatus::Failed
    );

    storage.instance_writes_down.store(false, SeqCst);
    fake.go_async.store(false, SeqCst);
    let retried = engine.provision(req).await.unwrap();
    assert!(!retried.replayed);
    assert!(matches!(
        retried.response,
        LifecycleResponse::Succeeded { .. }
    ));
    assert_eq!(fake.provisions.load(SeqCst), 2);
}

#[tokio::test]
async fn deprovision_is_retryable_after_a_lost_result_write() {
    let fake = Arc::new(FakeProvisioner::default());
    let storage = Arc::new(FlakyStorage::default());
    let engine = flaky_engine(&storage, &fake);
    engine.provision(provision_req("i-1")).await.unwrap();

    let failing = storage.clone();
    fake.during_next_call(move || failing.instance_writes_down.store(true, SeqCst));
    let err = engine.deprovision(deprovision_req("i-1")).await.unwrap_err();
    assert!(matches!(err, BrokerError::StorageUnavailable(_)));
    assert_eq!(
        storage.get_instance("i-1").await.unwrap().unwrap().state,
        InstanceState::Deprovisioning
    );

    // The stranded transitional state does not read as work in progress.
    storage.instance_writes_down.store(false, SeqCst);
    let retried = engine.deprovision(deprovision_req("i-1")).await.unwrap();
    assert!(!retried.replayed);
    assert_eq!(fake.deprovisions.load(SeqCst), 2);
    assert_eq!(
        storage.get_instance("i-1").await.unwrap().unwrap().state,
        InstanceState::Gone
    );
}

// ──────────────────────────────────────────────
// Observer
// ──────────────────────────────────────────────

#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<String>>,
}

impl RecordingObserver {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl LifecycleObserver for RecordingObserver {
    fn transition(&self, kind: OperationKind, _target: &OperationTarget, from: &str, to: &str) {
        self.push(format!("{kind} {from}->{to}"));
    }

    fn replayed(&self, kind: OperationKind, _target: &OperationTarget) {
        self.push(format!("{kind} replayed"));
    }

    fn rejected(&self, kind: OperationKind, _target: &OperationTarget, error: &BrokerError) {
        self.push(format!("{kind} rejected {}", error.code()));
    }

    fn provisioner_failed(&self, kind: OperationKind, _target: &OperationTarget, detail: &str) {
        self.push(format!("{kind} failed {detail}"));
    }
}

#[tokio::test]
async fn decision_points_reach_the_observer() {
    let fake = Arc::new(FakeProvisioner::default());
    let observer = Arc::new(RecordingObserver::default());
    let engine = engine(fake.clone()).with_observer(observer.clone());

    engine.provision(provision_req("i-1")).await.unwrap();
    engine.provision(provision_req("i-1")).await.unwrap();
    let mut other = provision_req("i-1");
    other.plan_id = "slow".into();
    engine.provision(other).await.unwrap_err();
    fake.fail_next.store(true, SeqCst);
    engine.bind(bind_req("i-1", "b-1")).await.unwrap_err();

    let events = observer.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "provision absent->provisioning",
            "provision provisioning->succeeded",
            "provision replayed",
            "provision rejected InstanceConflict",
            "bind absent->binding",
            "bind binding->failed",
            "bind failed backend exploded",
        ]
    );
}
