//! HTTP middleware: broker API version check and API key authentication.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use super::state::AppState;
use super::{json_error, HEALTH_PATH};

pub(crate) const API_VERSION_HEADER: &str = "x-broker-api-version";

/// Oldest broker API major version the server accepts.
const MIN_API_MAJOR: u32 = 2;

/// Every request except `/health` must declare the broker API version it
/// speaks, as `<major>.<minor>`.
pub(crate) async fn api_version_middleware(
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if request.uri().path() == HEALTH_PATH {
        return next.run(request).await;
    }

    let version = request
        .headers()
        .get(API_VERSION_HEADER)
        .and_then(|v| v.to_str().ok());

    let major = version
        .and_then(|v| v.split('.').next())
        .and_then(|m| m.trim().parse::<u32>().ok());

    match major {
        Some(major) if major >= MIN_API_MAJOR => next.run(request).await,
        Some(_) => json_error(
            StatusCode::PRECONDITION_FAILED,
            "UnsupportedApiVersion",
            &format!(
                "broker API version {} is not supported",
                version.unwrap_or_default()
            ),
        )
        .into_response(),
        None => json_error(
            StatusCode::PRECONDITION_FAILED,
            "MissingApiVersion",
            "the X-Broker-API-Version header is required",
        )
        .into_response(),
    }
}

/// API key authentication middleware.
///
/// If an API key is configured, all requests (except /health) must include
/// either `Authorization: Bearer <key>` or `X-API-Key: <key>`.
pub(crate) async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let expected_key = match &state.api_key {
        Some(k) => k,
        None => return next.run(request).await,
    };

    if request.uri().path() == HEALTH_PATH {
        return next.run(request).await;
    }

    let bearer = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "));
    let api_key = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());

    match bearer.or(api_key) {
        Some(presented) if presented == expected_key => next.run(request).await,
        Some(_) => {
            json_error(StatusCode::FORBIDDEN, "Forbidden", "invalid API key").into_response()
        }
        None => json_error(
            StatusCode::UNAUTHORIZED,
            "Unauthorized",
            "authentication required",
        )
        .into_response(),
    }
}
