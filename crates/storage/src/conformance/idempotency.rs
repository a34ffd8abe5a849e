use std::future::Future;

use super::{provision_key, CaseResult};
use crate::record::{IdempotencyClaim, IdempotencyKey, OperationKind};
use crate::{BrokerStorage, StorageError};

pub(super) async fn run_idempotency_tests<S, F, Fut>(factory: &F) -> Vec<CaseResult>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(CaseResult::new(
        "idempotency",
        "get_absent_key_returns_none",
        get_absent_key_returns_none(factory).await,
    ));
    results.push(CaseResult::new(
        "idempotency",
        "put_if_absent_claims_new_key_at_version_0",
        put_if_absent_claims_new_key_at_version_0(factory).await,
    ));
    results.push(CaseResult::new(
        "idempotency",
        "matching_fingerprint_returns_existing_unchanged",
        matching_fingerprint_returns_existing_unchanged(factory).await,
    ));
    results.push(CaseResult::new(
        "idempotency",
        "differing_fingerprint_conflicts_without_overwrite",
        differing_fingerprint_conflicts_without_overwrite(factory).await,
    ));
    results.push(CaseResult::new(
        "idempotency",
        "keys_with_different_kind_are_independent",
        keys_with_different_kind_are_independent(factory).await,
    ));
    results.push(CaseResult::new(
        "idempotency",
        "update_result_bumps_version",
        update_result_bumps_version(factory).await,
    ));
    results.push(CaseResult::new(
        "idempotency",
        "update_result_stale_version_conflicts",
        update_result_stale_version_conflicts(factory).await,
    ));
    results.push(CaseResult::new(
        "idempotency",
        "update_result_absent_key_not_found",
        update_result_absent_key_not_found(factory).await,
    ));
    results.push(CaseResult::new(
        "idempotency",
        "remove_frees_key",
        remove_frees_key(factory).await,
    ));
    results.push(CaseResult::new(
        "idempotency",
        "list_for_instance_includes_binding_keys",
        list_for_instance_includes_binding_keys(factory).await,
    ));

    results
}

async fn get_absent_key_returns_none<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s.get_idempotency(&provision_key("i-404")).await {
        Ok(None) => Ok(()),
        other => Err(format!("expected Ok(None), got {:?}", other)),
    }
}

async fn put_if_absent_claims_new_key_at_version_0<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let key = provision_key("i-1");
    let claim = s
        .put_if_absent_or_matching(&key, "fp-a", serde_json::json!({"state": "pending"}))
        .await
        .map_err(|e| format!("put: {e}"))?;
    let record = match claim {
        IdempotencyClaim::Claimed(r) => r,
        other => return Err(format!("expected Claimed, got {:?}", other)),
    };
    if record.version != 0 {
        return Err(format!("expected version 0, got {}", record.version));
    }
    let stored = s
        .get_idempotency(&key)
        .await
        .map_err(|e| format!("get: {e}"))?
        .ok_or("record not readable after claim")?;
    if stored.fingerprint != "fp-a" || stored.result != serde_json::json!({"state": "pending"}) {
        return Err(format!("stored record mismatch: {:?}", stored));
    }
    Ok(())
}

async fn matching_fingerprint_returns_existing_unchanged<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let key = provision_key("i-1");
    s.put_if_absent_or_matching(&key, "fp-a", serde_json::json!(1))
        .await
        .map_err(|e| format!("first put: {e}"))?;
    let claim = s
        .put_if_absent_or_matching(&key, "fp-a", serde_json::json!(2))
        .await
        .map_err(|e| format!("second put: {e}"))?;
    match claim {
        IdempotencyClaim::Existing(r) if r.result == serde_json::json!(1) => Ok(()),
        other => Err(format!("expected Existing with original result, got {:?}", other)),
    }
}

async fn differing_fingerprint_conflicts_without_overwrite<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let key = provision_key("i-1");
    s.put_if_absent_or_matching(&key, "fp-a", serde_json::json!("a"))
        .await
        .map_err(|e| format!("first put: {e}"))?;
    match s
        .put_if_absent_or_matching(&key, "fp-b", serde_json::json!("b"))
        .await
    {
        Err(StorageError::FingerprintConflict {
            stored_fingerprint, ..
        }) if stored_fingerprint == "fp-a" => {}
        other => return Err(format!("expected FingerprintConflict, got {:?}", other)),
    }
    let stored = s
        .get_idempotency(&key)
        .await
        .map_err(|e| format!("get: {e}"))?
        .ok_or("record vanished after conflict")?;
    if stored.fingerprint != "fp-a" || stored.result != serde_json::json!("a") {
        return Err(format!("record was overwritten: {:?}", stored));
    }
    Ok(())
}

async fn keys_with_different_kind_are_independent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.put_if_absent_or_matching(&provision_key("i-1"), "fp-a", serde_json::json!(null))
        .await
        .map_err(|e| format!("provision put: {e}"))?;
    let deprovision = IdempotencyKey::instance(OperationKind::Deprovision, "i-1");
    match s
        .put_if_absent_or_matching(&deprovision, "fp-b", serde_json::json!(null))
        .await
    {
        Ok(IdempotencyClaim::Claimed(_)) => Ok(()),
        other => Err(format!("expected Claimed for other kind, got {:?}", other)),
    }
}

async fn update_result_bumps_version<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let key = provision_key("i-1");
    s.put_if_absent_or_matching(&key, "fp-a", serde_json::json!("pending"))
        .await
        .map_err(|e| format!("put: {e}"))?;
    let v1 = s
        .update_result(&key, 0, serde_json::json!("done"))
        .await
        .map_err(|e| format!("update: {e}"))?;
    if v1 != 1 {
        return Err(format!("expected version 1, got {v1}"));
    }
    let stored = s
        .get_idempotency(&key)
        .await
        .map_err(|e| format!("get: {e}"))?
        .ok_or("record missing")?;
    if stored.result != serde_json::json!("done") || stored.fingerprint != "fp-a" {
        return Err(format!("unexpected record after update: {:?}", stored));
    }
    Ok(())
}

async fn update_result_stale_version_conflicts<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let key = provision_key("i-1");
    s.put_if_absent_or_matching(&key, "fp-a", serde_json::json!("pending"))
        .await
        .map_err(|e| format!("put: {e}"))?;
    s.update_result(&key, 0, serde_json::json!("first"))
        .await
        .map_err(|e| format!("first update: {e}"))?;
    match s.update_result(&key, 0, serde_json::json!("second")).await {
        Err(StorageError::ConcurrentConflict {
            expected_version: 0,
            ..
        }) => Ok(()),
        other => Err(format!("expected ConcurrentConflict, got {:?}", other)),
    }
}

async fn update_result_absent_key_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s
        .update_result(&provision_key("i-404"), 0, serde_json::json!(null))
        .await
    {
        Err(StorageError::RecordNotFound { .. }) => Ok(()),
        other => Err(format!("expected RecordNotFound, got {:?}", other)),
    }
}

async fn remove_frees_key<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let key = provision_key("i-1");
    s.put_if_absent_or_matching(&key, "fp-a", serde_json::json!(null))
        .await
        .map_err(|e| format!("put: {e}"))?;
    s.remove_idempotency(&key)
        .await
        .map_err(|e| format!("remove: {e}"))?;
    s.remove_idempotency(&key)
        .await
        .map_err(|e| format!("second remove: {e}"))?;
    match s
        .put_if_absent_or_matching(&key, "fp-b", serde_json::json!(null))
        .await
    {
        Ok(IdempotencyClaim::Claimed(_)) => Ok(()),
        other => Err(format!("expected Claimed after remove, got {:?}", other)),
    }
}

async fn list_for_instance_includes_binding_keys<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let keys = [
        provision_key("i-1"),
        IdempotencyKey::binding(OperationKind::Bind, "i-1", "b-1"),
        provision_key("i-2"),
    ];
    for key in &keys {
        s.put_if_absent_or_matching(key, "fp", serde_json::json!(null))
            .await
            .map_err(|e| format!("put {key}: {e}"))?;
    }
    let listed = s
        .list_idempotency_for_instance("i-1")
        .await
        .map_err(|e| format!("list: {e}"))?;
    if listed.len() != 2 || listed.iter().any(|r| r.key.instance_id != "i-1") {
        return Err(format!("expected the two i-1 records, got {:?}", listed));
    }
    Ok(())
}
