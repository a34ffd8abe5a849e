use std::future::Future;

use time::{Duration, OffsetDateTime};

use super::{make_binding, make_instance, CaseResult};
use crate::record::{BindingState, InstanceState};
use crate::BrokerStorage;

pub(super) async fn run_resource_tests<S, F, Fut>(factory: &F) -> Vec<CaseResult>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(CaseResult::new(
        "resources",
        "instance_put_then_get",
        instance_put_then_get(factory).await,
    ));
    results.push(CaseResult::new(
        "resources",
        "instance_put_replaces",
        instance_put_replaces(factory).await,
    ));
    results.push(CaseResult::new(
        "resources",
        "gone_instances_filtered_by_age_and_state",
        gone_instances_filtered_by_age_and_state(factory).await,
    ));
    results.push(CaseResult::new(
        "resources",
        "bindings_scoped_to_instance",
        bindings_scoped_to_instance(factory).await,
    ));
    results.push(CaseResult::new(
        "resources",
        "gone_bindings_filtered_by_age_and_state",
        gone_bindings_filtered_by_age_and_state(factory).await,
    ));
    results.push(CaseResult::new(
        "resources",
        "remove_instance_cascades_bindings",
        remove_instance_cascades_bindings(factory).await,
    ));

    results
}

async fn instance_put_then_get<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    if s.get_instance("i-1")
        .await
        .map_err(|e| format!("get empty: {e}"))?
        .is_some()
    {
        return Err("empty store returned an instance".to_string());
    }
    let record = make_instance("i-1", InstanceState::Provisioning);
    s.put_instance(record.clone())
        .await
        .map_err(|e| format!("put: {e}"))?;
    let stored = s
        .get_instance("i-1")
        .await
        .map_err(|e| format!("get: {e}"))?
        .ok_or("instance missing after put")?;
    if stored != record {
        return Err(format!("expected {:?}, got {:?}", record, stored));
    }
    Ok(())
}

async fn instance_put_replaces<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.put_instance(make_instance("i-1", InstanceState::Provisioning))
        .await
        .map_err(|e| format!("put: {e}"))?;
    let mut updated = make_instance("i-1", InstanceState::Succeeded);
    updated.dashboard_url = Some("https://dashboard.example.com/i-1".to_string());
    s.put_instance(updated)
        .await
        .map_err(|e| format!("replace: {e}"))?;
    let stored = s
        .get_instance("i-1")
        .await
        .map_err(|e| format!("get: {e}"))?
        .ok_or("instance missing")?;
    if stored.state != InstanceState::Succeeded || stored.dashboard_url.is_none() {
        return Err(format!("replace not applied: {:?}", stored));
    }
    Ok(())
}

async fn gone_instances_filtered_by_age_and_state<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut old_gone = make_instance("old-gone", InstanceState::Gone);
    old_gone.updated_at = OffsetDateTime::now_utc() - Duration::days(2);
    s.put_instance(old_gone)
        .await
        .map_err(|e| format!("put old: {e}"))?;
    s.put_instance(make_instance("new-gone", InstanceState::Gone))
        .await
        .map_err(|e| format!("put new: {e}"))?;
    let mut old_live = make_instance("old-live", InstanceState::Succeeded);
    old_live.updated_at = OffsetDateTime::now_utc() - Duration::days(2);
    s.put_instance(old_live)
        .await
        .map_err(|e| format!("put live: {e}"))?;

    let listed = s
        .list_gone_instances(OffsetDateTime::now_utc() - Duration::days(1))
        .await
        .map_err(|e| format!("list: {e}"))?;
    let ids: Vec<&str> = listed.iter().map(|r| r.instance_id.as_str()).collect();
    if ids != ["old-gone"] {
        return Err(format!("expected [old-gone], got {:?}", ids));
    }
    Ok(())
}

async fn bindings_scoped_to_instance<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.put_binding(make_binding("i-1", "b-1", BindingState::Bound))
        .await
        .map_err(|e| format!("put b-1: {e}"))?;
    s.put_binding(make_binding("i-1", "b-2", BindingState::Binding))
        .await
        .map_err(|e| format!("put b-2: {e}"))?;
    s.put_binding(make_binding("i-2", "b-1", BindingState::Bound))
        .await
        .map_err(|e| format!("put other: {e}"))?;

    let listed = s
        .list_bindings("i-1")
        .await
        .map_err(|e| format!("list: {e}"))?;
    if listed.len() != 2 {
        return Err(format!("expected 2 bindings for i-1, got {}", listed.len()));
    }
    s.remove_binding("i-1", "b-1")
        .await
        .map_err(|e| format!("remove: {e}"))?;
    if s.get_binding("i-1", "b-1")
        .await
        .map_err(|e| format!("get removed: {e}"))?
        .is_some()
    {
        return Err("binding still present after remove".to_string());
    }
    if s.get_binding("i-2", "b-1")
        .await
        .map_err(|e| format!("get other: {e}"))?
        .is_none()
    {
        return Err("remove touched another instance's binding".to_string());
    }
    Ok(())
}

async fn gone_bindings_filtered_by_age_and_state<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut old_gone = make_binding("i-1", "old-gone", BindingState::Gone);
    old_gone.updated_at = OffsetDateTime::now_utc() - Duration::days(2);
    s.put_binding(old_gone)
        .await
        .map_err(|e| format!("put old: {e}"))?;
    s.put_binding(make_binding("i-1", "new-gone", BindingState::Gone))
        .await
        .map_err(|e| format!("put new: {e}"))?;
    let mut old_bound = make_binding("i-1", "old-bound", BindingState::Bound);
    old_bound.updated_at = OffsetDateTime::now_utc() - Duration::days(2);
    s.put_binding(old_bound)
        .await
        .map_err(|e| format!("put bound: {e}"))?;

    let listed = s
        .list_gone_bindings(OffsetDateTime::now_utc() - Duration::days(1))
        .await
        .map_err(|e| format!("list: {e}"))?;
    let ids: Vec<&str> = listed.iter().map(|b| b.binding_id.as_str()).collect();
    if ids != ["old-gone"] {
        return Err(format!("expected [old-gone], got {:?}", ids));
    }
    Ok(())
}

async fn remove_instance_cascades_bindings<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: BrokerStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.put_instance(make_instance("i-1", InstanceState::Gone))
        .await
        .map_err(|e| format!("put instance: {e}"))?;
    s.put_binding(make_binding("i-1", "b-1", BindingState::Gone))
        .await
        .map_err(|e| format!("put binding: {e}"))?;
    s.remove_instance("i-1")
        .await
        .map_err(|e| format!("remove: {e}"))?;
    let bindings = s
        .list_bindings("i-1")
        .await
        .map_err(|e| format!("list: {e}"))?;
    if !bindings.is_empty() {
        return Err(format!("{} bindings survived instance removal", bindings.len()));
    }
    Ok(())
}
