//! Route handlers for the broker API.

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use broker_core::{
    BindRequest, BrokerError, Decision, DeprovisionRequest, LifecycleResponse, OperationState,
    ProvisionRequest, UnbindRequest,
};
use serde::Deserialize;

use super::state::AppState;
use super::{broker_error, json_error};

#[derive(Debug, Deserialize)]
pub(crate) struct ProvisionBody {
    service_id: String,
    plan_id: String,
    #[serde(default)]
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BindBody {
    service_id: String,
    plan_id: String,
    #[serde(default)]
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AsyncQuery {
    #[serde(default)]
    accepts_incomplete: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DeleteQuery {
    service_id: String,
    plan_id: String,
    #[serde(default)]
    accepts_incomplete: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LastOperationQuery {
    operation: Option<String>,
}

fn bad_request(message: &str) -> Response {
    json_error(StatusCode::BAD_REQUEST, "BadRequest", message).into_response()
}

/// `created` is the status for a fresh synchronous success; replays get 200
/// and accepted async work gets 202.
fn decision_response(decision: Decision, created: StatusCode) -> Response {
    match decision.response {
        LifecycleResponse::Accepted { operation_id } => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "operation": operation_id })),
        )
            .into_response(),
        LifecycleResponse::Succeeded {
            dashboard_url,
            credentials,
        } => {
            let mut body = serde_json::Map::new();
            if let Some(url) = dashboard_url {
                body.insert("dashboard_url".to_string(), url.into());
            }
            if let Some(credentials) = credentials {
                body.insert("credentials".to_string(), credentials);
            }
            let status = if decision.replayed {
                StatusCode::OK
            } else {
                created
            };
            (status, Json(serde_json::Value::Object(body))).into_response()
        }
    }
}

/// A delete of something that does not exist answers 410 Gone.
fn delete_error(err: &BrokerError) -> Response {
    match err {
        BrokerError::InstanceNotFound { .. } | BrokerError::BindingNotFound { .. } => {
            json_error(StatusCode::GONE, err.code(), &err.to_string()).into_response()
        }
        other => broker_error(other),
    }
}

fn last_operation_body(op: OperationState) -> Response {
    let mut body = serde_json::json!({ "state": op.status.as_str() });
    if let Some(description) = op.description {
        body["description"] = description.into();
    }
    (StatusCode::OK, Json(body)).into_response()
}

/// Fallback handler for unmatched routes.
pub(crate) async fn handle_not_found() -> impl IntoResponse {
    json_error(StatusCode::NOT_FOUND, "NotFound", "not found")
}

/// GET /health
pub(crate) async fn handle_health() -> impl IntoResponse {
    let response = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });
    (StatusCode::OK, Json(response))
}

/// GET /v2/catalog
pub(crate) async fn handle_catalog(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.catalog.clone()))
}

/// PUT /v2/service_instances/{instance_id}
pub(crate) async fn handle_provision(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    query: Result<Query<AsyncQuery>, QueryRejection>,
    body: Result<Json<ProvisionBody>, JsonRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(e) => return bad_request(&e.body_text()),
    };
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return bad_request(&e.body_text()),
    };
    let request = ProvisionRequest {
        instance_id,
        service_id: body.service_id,
        plan_id: body.plan_id,
        parameters: body.parameters,
        accepts_incomplete: query.accepts_incomplete,
    };
    match state.engine.provision(request).await {
        Ok(decision) => decision_response(decision, StatusCode::CREATED),
        Err(e) => broker_error(&e),
    }
}

/// DELETE /v2/service_instances/{instance_id}
pub(crate) async fn handle_deprovision(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    query: Result<Query<DeleteQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(e) => return bad_request(&e.body_text()),
    };
    let request = DeprovisionRequest {
        instance_id,
        service_id: query.service_id,
        plan_id: query.plan_id,
        accepts_incomplete: query.accepts_incomplete,
    };
    match state.engine.deprovision(request).await {
        Ok(decision) => decision_response(decision, StatusCode::OK),
        Err(e) => delete_error(&e),
    }
}

/// GET /v2/service_instances/{instance_id}
pub(crate) async fn handle_fetch_instance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Response {
    match state.engine.fetch_instance(&instance_id).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(e) => broker_error(&e),
    }
}

/// GET /v2/service_instances/{instance_id}/last_operation
pub(crate) async fn handle_last_operation(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    query: Result<Query<LastOperationQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(e) => return bad_request(&e.body_text()),
    };
    match state
        .engine
        .last_operation(&instance_id, query.operation.as_deref())
        .await
    {
        Ok(op) => last_operation_body(op),
        Err(e) => broker_error(&e),
    }
}

/// PUT /v2/service_instances/{instance_id}/service_bindings/{binding_id}
pub(crate) async fn handle_bind(
    State(state): State<Arc<AppState>>,
    Path((instance_id, binding_id)): Path<(String, String)>,
    query: Result<Query<AsyncQuery>, QueryRejection>,
    body: Result<Json<BindBody>, JsonRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(e) => return bad_request(&e.body_text()),
    };
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return bad_request(&e.body_text()),
    };
    let request = BindRequest {
        instance_id,
        binding_id,
        service_id: body.service_id,
        plan_id: body.plan_id,
        parameters: body.parameters,
        accepts_incomplete: query.accepts_incomplete,
    };
    match state.engine.bind(request).await {
        Ok(decision) => decision_response(decision, StatusCode::CREATED),
        Err(e) => broker_error(&e),
    }
}

/// DELETE /v2/service_instances/{instance_id}/service_bindings/{binding_id}
pub(crate) async fn handle_unbind(
    State(state): State<Arc<AppState>>,
    Path((instance_id, binding_id)): Path<(String, String)>,
    query: Result<Query<DeleteQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(e) => return bad_request(&e.body_text()),
    };
    let request = UnbindRequest {
        instance_id,
        binding_id,
        service_id: query.service_id,
        plan_id: query.plan_id,
        accepts_incomplete: query.accepts_incomplete,
    };
    match state.engine.unbind(request).await {
        Ok(decision) => decision_response(decision, StatusCode::OK),
        Err(e) => delete_error(&e),
    }
}

/// GET /v2/service_instances/{instance_id}/service_bindings/{binding_id}
pub(crate) async fn handle_fetch_binding(
    State(state): State<Arc<AppState>>,
    Path((instance_id, binding_id)): Path<(String, String)>,
) -> Response {
    match state.engine.fetch_binding(&instance_id, &binding_id).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(e) => broker_error(&e),
    }
}

/// GET /v2/service_instances/{instance_id}/service_bindings/{binding_id}/last_operation
pub(crate) async fn handle_binding_last_operation(
    State(state): State<Arc<AppState>>,
    Path((instance_id, binding_id)): Path<(String, String)>,
    query: Result<Query<LastOperationQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(q) => q,
        Err(e) => return bad_request(&e.body_text()),
    };
    match state
        .engine
        .last_binding_operation(&instance_id, &binding_id, query.operation.as_deref())
        .await
    {
        Ok(op) => last_operation_body(op),
        Err(e) => broker_error(&e),
    }
}

/// GET /v2/operations/{operation_id}
pub(crate) async fn handle_poll_operation(
    State(state): State<Arc<AppState>>,
    Path(operation_id): Path<String>,
) -> Response {
    match state.engine.poll_operation(&operation_id).await {
        Ok(op) => (StatusCode::OK, Json(op)).into_response(),
        Err(e) => broker_error(&e),
    }
}
