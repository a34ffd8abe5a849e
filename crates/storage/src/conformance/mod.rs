//! Backend-agnostic checks for [`BrokerStorage`] implementations.
//!
//! Four groups run in order: `idempotency` (claims, fingerprints, versioned
//! result updates), `operations` (creation, completion, retention purge),
//! `resources` (instance and binding records) and `concurrent` (racing
//! claims and completions).
//!
//! A backend passes a factory producing an empty store; every case gets its
//! own store.
//!
//! ```ignore
//! #[tokio::test]
//! async fn sqlite_storage_conforms() {
//!     let report = run_conformance_suite(|| async { SqliteStorage::open_in_memory() }).await;
//!     assert!(report.all_passed(), "{report}");
//! }
//! ```

mod concurrent;
mod idempotency;
mod operations;
mod resources;

use std::fmt;
use std::future::Future;

use time::OffsetDateTime;

use crate::record::{
    BindingRecord, BindingState, IdempotencyKey, InstanceRecord, InstanceState, OperationKind,
};
use crate::BrokerStorage;

#[derive(Debug, Clone)]
pub struct CaseResult {
    pub group: &'static str,
    pub case: &'static str,
    /// `None` when the case passed.
    pub failure: Option<String>,
}

impl CaseResult {
    fn new(group: &'static str, case: &'static str, outcome: Result<(), String>) -> Self {
        Self {
            group,
            case,
            failure: outcome.err(),
        }
    }

    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConformanceReport {
    pub cases: Vec<CaseResult>,
}

impl ConformanceReport {
    pub fn failures(&self) -> impl Iterator<Item = &CaseResult> {
        self.cases.iter().filter(|c| !c.passed())
    }

    pub fn all_passed(&self) -> bool {
        self.failures().next().is_none()
    }
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failed = self.failures().count();
        writeln!(
            f,
            "storage conformance: {} cases, {} failed",
            self.cases.len(),
            failed
        )?;
        for case in self.failures() {
            if let Some(failure) = &case.failure {
                writeln!(f, "  {}::{}: {}", case.group, case.case, failure)?;
            }
        }
        Ok(())
    }
}

/// Run every group against stores built by `factory`.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut cases = idempotency::run_idempotency_tests(&factory).await;
    cases.extend(operations::run_operation_tests(&factory).await);
    cases.extend(resources::run_resource_tests(&factory).await);
    cases.extend(concurrent::run_concurrent_tests(&factory).await);
    ConformanceReport { cases }
}

fn provision_key(instance_id: &str) -> IdempotencyKey {
    IdempotencyKey::instance(OperationKind::Provision, instance_id)
}

fn make_instance(instance_id: &str, state: InstanceState) -> InstanceRecord {
    InstanceRecord {
        instance_id: instance_id.to_string(),
        service_id: "test-service".to_string(),
        plan_id: "test-plan".to_string(),
        parameters: serde_json::json!({"size": "small"}),
        state,
        dashboard_url: None,
        last_operation_id: None,
        updated_at: OffsetDateTime::now_utc(),
    }
}

fn make_binding(instance_id: &str, binding_id: &str, state: BindingState) -> BindingRecord {
    BindingRecord {
        instance_id: instance_id.to_string(),
        binding_id: binding_id.to_string(),
        service_id: "test-service".to_string(),
        plan_id: "test-plan".to_string(),
        parameters: serde_json::json!({}),
        credentials: Some(serde_json::json!({"username": "u", "password": "p"})),
        state,
        last_operation_id: None,
        updated_at: OffsetDateTime::now_utc(),
    }
}
