use std::future::Future;

use time::{Duration, OffsetDateTime};

use super::CaseResult;
use crate::record::{OperationKind, OperationStatus, OperationTarget};
use crate::{BrokerStorage, StorageError};

pub(super) async fn run_operation_tests<S, F, Fut>(factory: &F) -> Vec<CaseResult>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(CaseResult::new(
        "operations",
        "create_starts_in_progress_with_unique_ids",
        create_starts_in_progress_with_unique_ids(factory).await,
    ));
    results.push(CaseResult::new(
        "operations",
        "complete_transitions_once",
        complete_transitions_once(factory).await,
    ));
    results.push(CaseResult::new(
        "operations",
        "complete_with_in_progress_rejected",
        complete_with_in_progress_rejected(factory).await,
    ));
    results.push(CaseResult::new(
        "operations",
        "complete_unknown_operation_not_found",
        complete_unknown_operation_not_found(factory).await,
    ));
    results.push(CaseResult::new(
        "operations",
        "description_frozen_after_completion",
        description_frozen_after_completion(factory).await,
    ));
    results.push(CaseResult::new(
        "operations",
        "purge_removes_only_expired_terminal",
        purge_removes_only_expired_terminal(factory).await,
    ));
    results.push(CaseResult::new(
        "operations",
        "purge_single_keeps_in_progress",
        purge_single_keeps_in_progress(factory).await,
    ));

    results
}

async fn create_starts_in_progress_with_unique_ids<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let a = s
        .create_operation(OperationKind::Provision, OperationTarget::instance("i-1"))
        .await
        .map_err(|e| format!("create a: {e}"))?;
    let b = s
        .create_operation(OperationKind::Bind, OperationTarget::binding("i-1", "b-1"))
        .await
        .map_err(|e| format!("create b: {e}"))?;
    if a.operation_id == b.operation_id {
        return Err("operation ids collided".to_string());
    }
    let stored = s
        .get_operation(&b.operation_id)
        .await
        .map_err(|e| format!("get: {e}"))?
        .ok_or("created operation not readable")?;
    if stored.status != OperationStatus::InProgress
        || stored.completed_at.is_some()
        || stored.target.binding_id.as_deref() != Some("b-1")
    {
        return Err(format!("unexpected new operation: {:?}", stored));
    }
    Ok(())
}

async fn complete_transitions_once<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let op = s
        .create_operation(OperationKind::Provision, OperationTarget::instance("i-1"))
        .await
        .map_err(|e| format!("create: {e}"))?;
    let first = s
        .complete_operation(&op.operation_id, OperationStatus::Succeeded, None)
        .await
        .map_err(|e| format!("first complete: {e}"))?;
    let second = s
        .complete_operation(
            &op.operation_id,
            OperationStatus::Failed,
            Some("late failure".to_string()),
        )
        .await
        .map_err(|e| format!("second complete: {e}"))?;
    if !first || second {
        return Err(format!("expected (true, false), got ({first}, {second})"));
    }
    let stored = s
        .get_operation(&op.operation_id)
        .await
        .map_err(|e| format!("get: {e}"))?
        .ok_or("operation missing")?;
    if stored.status != OperationStatus::Succeeded || stored.completed_at.is_none() {
        return Err(format!("terminal status was not preserved: {:?}", stored));
    }
    Ok(())
}

async fn complete_with_in_progress_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let op = s
        .create_operation(OperationKind::Unbind, OperationTarget::binding("i-1", "b-1"))
        .await
        .map_err(|e| format!("create: {e}"))?;
    match s
        .complete_operation(&op.operation_id, OperationStatus::InProgress, None)
        .await
    {
        Err(StorageError::NonTerminalCompletion { .. }) => Ok(()),
        other => Err(format!("expected NonTerminalCompletion, got {:?}", other)),
    }
}

async fn complete_unknown_operation_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s
        .complete_operation("missing", OperationStatus::Succeeded, None)
        .await
    {
        Err(StorageError::OperationNotFound { operation_id }) if operation_id == "missing" => {
            Ok(())
        }
        other => Err(format!("expected OperationNotFound, got {:?}", other)),
    }
}

async fn description_frozen_after_completion<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let op = s
        .create_operation(OperationKind::Provision, OperationTarget::instance("i-1"))
        .await
        .map_err(|e| format!("create: {e}"))?;
    s.update_description(&op.operation_id, "50% done".to_string())
        .await
        .map_err(|e| format!("progress: {e}"))?;
    s.complete_operation(
        &op.operation_id,
        OperationStatus::Failed,
        Some("quota exceeded".to_string()),
    )
    .await
    .map_err(|e| format!("complete: {e}"))?;
    s.update_description(&op.operation_id, "stale progress".to_string())
        .await
        .map_err(|e| format!("late progress: {e}"))?;
    let stored = s
        .get_operation(&op.operation_id)
        .await
        .map_err(|e| format!("get: {e}"))?
        .ok_or("operation missing")?;
    if stored.description.as_deref() != Some("quota exceeded") {
        return Err(format!(
            "expected terminal description, got {:?}",
            stored.description
        ));
    }
    Ok(())
}

async fn purge_removes_only_expired_terminal<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let done = s
        .create_operation(OperationKind::Provision, OperationTarget::instance("i-1"))
        .await
        .map_err(|e| format!("create done: {e}"))?;
    let running = s
        .create_operation(OperationKind::Provision, OperationTarget::instance("i-2"))
        .await
        .map_err(|e| format!("create running: {e}"))?;
    s.complete_operation(&done.operation_id, OperationStatus::Succeeded, None)
        .await
        .map_err(|e| format!("complete: {e}"))?;

    let past = OffsetDateTime::now_utc() - Duration::hours(1);
    let purged_early = s
        .purge_completed_operations(past)
        .await
        .map_err(|e| format!("purge past: {e}"))?;
    if purged_early != 0 {
        return Err(format!("purged {purged_early} operations inside retention"));
    }

    let purged = s
        .purge_completed_operations(OffsetDateTime::now_utc())
        .await
        .map_err(|e| format!("purge now: {e}"))?;
    if purged != 1 {
        return Err(format!("expected 1 purged, got {purged}"));
    }
    let done_left = s
        .get_operation(&done.operation_id)
        .await
        .map_err(|e| format!("get done: {e}"))?;
    let running_left = s
        .get_operation(&running.operation_id)
        .await
        .map_err(|e| format!("get running: {e}"))?;
    if done_left.is_some() || running_left.is_none() {
        return Err("purge removed the wrong operations".to_string());
    }
    Ok(())
}

async fn purge_single_keeps_in_progress<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let op = s
        .create_operation(OperationKind::Deprovision, OperationTarget::instance("i-1"))
        .await
        .map_err(|e| format!("create: {e}"))?;
    let removed = s
        .purge_operation_if_expired(&op.operation_id, OffsetDateTime::now_utc())
        .await
        .map_err(|e| format!("purge: {e}"))?;
    if removed {
        return Err("in-progress operation was purged".to_string());
    }
    s.complete_operation(&op.operation_id, OperationStatus::Succeeded, None)
        .await
        .map_err(|e| format!("complete: {e}"))?;
    let removed = s
        .purge_operation_if_expired(&op.operation_id, OffsetDateTime::now_utc())
        .await
        .map_err(|e| format!("purge after complete: {e}"))?;
    if !removed {
        return Err("expired terminal operation was kept".to_string());
    }
    Ok(())
}
