use std::future::Future;
use std::sync::Arc;

use super::{provision_key, CaseResult};
use crate::record::{IdempotencyClaim, OperationKind, OperationStatus, OperationTarget};
use crate::{BrokerStorage, StorageError};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<CaseResult>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(CaseResult::new(
        "concurrent",
        "concurrent_claims_exactly_one_wins",
        concurrent_claims_exactly_one_wins(factory).await,
    ));
    results.push(CaseResult::new(
        "concurrent",
        "concurrent_conflicting_claims_exactly_one_fingerprint",
        concurrent_conflicting_claims_exactly_one_fingerprint(factory).await,
    ));
    results.push(CaseResult::new(
        "concurrent",
        "concurrent_result_updates_exactly_one_wins",
        concurrent_result_updates_exactly_one_wins(factory).await,
    ));
    results.push(CaseResult::new(
        "concurrent",
        "concurrent_completions_exactly_one_applies",
        concurrent_completions_exactly_one_applies(factory).await,
    ));
    results.push(CaseResult::new(
        "concurrent",
        "concurrent_claims_different_keys_all_succeed",
        concurrent_claims_different_keys_all_succeed(factory).await,
    ));

    results
}

// ── Concurrent claim: exactly one wins ──────────────────────────────────────

/// N tasks race `put_if_absent_or_matching` with the same key and
/// fingerprint. Exactly one observes `Claimed`; the rest see `Existing`.
async fn concurrent_claims_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let claim = s
                .put_if_absent_or_matching(
                    &provision_key("i-1"),
                    "fp-same",
                    serde_json::json!({ "writer": i }),
                )
                .await?;
            Ok::<bool, StorageError>(matches!(claim, IdempotencyClaim::Claimed(_)))
        }));
    }

    let mut winners = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        }
    }

    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }
    Ok(())
}

// ── Concurrent conflicting claims: one fingerprint survives ─────────────────

/// N tasks race with N distinct fingerprints. Exactly one claims the key;
/// every other task must get FingerprintConflict naming the winner.
async fn concurrent_conflicting_claims_exactly_one_fingerprint<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            s.put_if_absent_or_matching(
                &provision_key("i-1"),
                &format!("fp-{i}"),
                serde_json::json!(i),
            )
            .await
        }));
    }

    let mut winners = Vec::new();
    let mut conflicts = Vec::new();
    for handle in handles {
        match handle.await.map_err(|e| format!("task panic: {e}"))? {
            Ok(IdempotencyClaim::Claimed(r)) => winners.push(r.fingerprint),
            Ok(IdempotencyClaim::Existing(r)) => {
                return Err(format!("distinct fingerprint matched: {:?}", r))
            }
            Err(StorageError::FingerprintConflict {
                stored_fingerprint, ..
            }) => conflicts.push(stored_fingerprint),
            Err(e) => return Err(format!("storage error: {e}")),
        }
    }

    if winners.len() != 1 {
        return Err(format!("expected exactly 1 winner, got {}", winners.len()));
    }
    if conflicts.iter().any(|fp| fp != &winners[0]) {
        return Err(format!(
            "conflicts reported a fingerprint other than the winner {}",
            winners[0]
        ));
    }
    Ok(())
}

// ── Concurrent OCC update: exactly one wins ─────────────────────────────────

/// N tasks update the same record from version 0. Exactly one succeeds; the
/// rest must get ConcurrentConflict.
async fn concurrent_result_updates_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    storage
        .put_if_absent_or_matching(&provision_key("i-1"), "fp", serde_json::json!("failed"))
        .await
        .map_err(|e| format!("seed: {e}"))?;

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            match s
                .update_result(&provision_key("i-1"), 0, serde_json::json!({ "retry": i }))
                .await
            {
                Ok(_) => Ok(true),
                Err(StorageError::ConcurrentConflict { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    let mut winners = 0usize;
    let mut losers = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        } else {
            losers += 1;
        }
    }

    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }
    if losers != N - 1 {
        return Err(format!("expected {} losers, got {losers}", N - 1));
    }
    Ok(())
}

// ── Concurrent completion: monotonic ────────────────────────────────────────

/// N tasks complete the same operation with alternating statuses. Exactly one
/// transition applies and the stored status is the one it wrote.
async fn concurrent_completions_exactly_one_applies<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let op = storage
        .create_operation(OperationKind::Provision, OperationTarget::instance("i-1"))
        .await
        .map_err(|e| format!("create: {e}"))?;

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        let id = op.operation_id.clone();
        handles.push(tokio::spawn(async move {
            let status = if i % 2 == 0 {
                OperationStatus::Succeeded
            } else {
                OperationStatus::Failed
            };
            let applied = s.complete_operation(&id, status, None).await?;
            Ok::<_, StorageError>((applied, status))
        }));
    }

    let mut applied = Vec::new();
    for handle in handles {
        let (did_apply, status) = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("storage error: {e}"))?;
        if did_apply {
            applied.push(status);
        }
    }

    if applied.len() != 1 {
        return Err(format!("expected exactly 1 applied completion, got {}", applied.len()));
    }
    let stored = storage
        .get_operation(&op.operation_id)
        .await
        .map_err(|e| format!("get: {e}"))?
        .ok_or("operation missing")?;
    if stored.status != applied[0] {
        return Err(format!(
            "stored status {:?} differs from applied {:?}",
            stored.status, applied[0]
        ));
    }
    Ok(())
}

// ── Different keys: no false conflicts ──────────────────────────────────────

async fn concurrent_claims_different_keys_all_succeed<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            s.put_if_absent_or_matching(
                &provision_key(&format!("i-{i}")),
                "fp",
                serde_json::json!(null),
            )
            .await
        }));
    }

    for handle in handles {
        match handle.await.map_err(|e| format!("task panic: {e}"))? {
            Ok(IdempotencyClaim::Claimed(_)) => {}
            other => return Err(format!("expected Claimed for distinct key, got {:?}", other)),
        }
    }
    Ok(())
}
