//! `broker serve` -- HTTP API for the service broker lifecycle engine.
//!
//! Endpoints:
//! - GET    /health                                           - Server status (exempt from auth and version check)
//! - GET    /v2/catalog                                       - Published service catalog
//! - PUT    /v2/service_instances/{instance_id}               - Provision
//! - DELETE /v2/service_instances/{instance_id}               - Deprovision
//! - GET    /v2/service_instances/{instance_id}               - Fetch instance
//! - GET    /v2/service_instances/{instance_id}/last_operation
//! - PUT    /v2/service_instances/{instance_id}/service_bindings/{binding_id}   - Bind
//! - DELETE /v2/service_instances/{instance_id}/service_bindings/{binding_id}   - Unbind
//! - GET    /v2/service_instances/{instance_id}/service_bindings/{binding_id}   - Fetch binding
//! - GET    /v2/service_instances/{instance_id}/service_bindings/{binding_id}/last_operation
//! - GET    /v2/operations/{operation_id}                     - Poll an operation by id
//!
//! Errors are returned as `{"error": "<Code>", "description": "..."}`.

mod handlers;
mod middleware;
mod state;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{middleware as axum_middleware, Json, Router};
use broker_core::{
    completion_channel, BrokerError, CompletionReceiver, LifecycleEngine, SandboxProvisioner,
    StaticCatalog,
};
use broker_storage::MemoryStorage;
use tower_http::trace::TraceLayer;

use self::handlers::{
    handle_bind, handle_binding_last_operation, handle_catalog, handle_deprovision,
    handle_fetch_binding, handle_fetch_instance, handle_health, handle_last_operation,
    handle_not_found, handle_poll_operation, handle_provision, handle_unbind,
};
use self::middleware::{api_version_middleware, auth_middleware};
use self::state::{AppState, Engine};
use crate::config::{builtin_catalog, read_catalog, BrokerConfig};

pub(crate) const HEALTH_PATH: &str = "/health";

/// Maximum request body size: 1 MB.
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// How long open TLS connections may drain after a shutdown signal.
#[cfg(feature = "tls")]
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Construct a JSON error response.
fn json_error(status: StatusCode, code: &str, description: &str) -> impl IntoResponse {
    (
        status,
        Json(serde_json::json!({"error": code, "description": description})),
    )
}

fn error_status(err: &BrokerError) -> StatusCode {
    match err {
        BrokerError::InvalidPlan { .. } | BrokerError::NotBindable { .. } => {
            StatusCode::BAD_REQUEST
        }
        BrokerError::InstanceConflict { .. } | BrokerError::BindingConflict { .. } => {
            StatusCode::CONFLICT
        }
        BrokerError::InstanceNotFound { .. }
        | BrokerError::BindingNotFound { .. }
        | BrokerError::OperationNotFound { .. } => StatusCode::NOT_FOUND,
        BrokerError::InstanceNotReady { .. }
        | BrokerError::InstanceHasBindings { .. }
        | BrokerError::AsyncRequired
        | BrokerError::ConcurrencyError { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        BrokerError::ProvisionerFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        BrokerError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn broker_error(err: &BrokerError) -> Response {
    json_error(error_status(err), err.code(), &err.to_string()).into_response()
}

/// Build the router over `state`.
fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(handle_health))
        .route("/v2/catalog", get(handle_catalog))
        .route(
            "/v2/service_instances/{instance_id}",
            get(handle_fetch_instance)
                .put(handle_provision)
                .delete(handle_deprovision),
        )
        .route(
            "/v2/service_instances/{instance_id}/last_operation",
            get(handle_last_operation),
        )
        .route(
            "/v2/service_instances/{instance_id}/service_bindings/{binding_id}",
            get(handle_fetch_binding)
                .put(handle_bind)
                .delete(handle_unbind),
        )
        .route(
            "/v2/service_instances/{instance_id}/service_bindings/{binding_id}/last_operation",
            get(handle_binding_last_operation),
        )
        .route("/v2/operations/{operation_id}", get(handle_poll_operation))
        .fallback(handle_not_found)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(axum_middleware::from_fn(api_version_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
}

/// Assemble the catalog, sandbox provisioner, storage and engine described
/// by `config`. The returned receiver carries the provisioner's async
/// completions and must be handed to the engine's event listener.
fn build_state(config: &BrokerConfig) -> Result<(Arc<AppState>, CompletionReceiver), String> {
    let catalog = match &config.catalog {
        Some(path) => read_catalog(path)?,
        None => builtin_catalog()?,
    };
    let catalog = StaticCatalog::new(catalog).map_err(|e| format!("invalid catalog: {}", e))?;
    let published = catalog.catalog().clone();

    let (notifier, events) = completion_channel();
    let mut provisioner = SandboxProvisioner::new(notifier);
    if let Some(ms) = config.sandbox.async_delay_ms {
        provisioner = provisioner.with_async_delay(Duration::from_millis(ms));
    }
    if let Some(base) = &config.sandbox.dashboard_base {
        provisioner = provisioner.with_dashboard_base(base.clone());
    }

    let engine: Engine = LifecycleEngine::new(
        Arc::new(MemoryStorage::new()),
        Arc::new(catalog),
        Arc::new(provisioner),
        config.engine(),
    );

    let state = Arc::new(AppState {
        engine: Arc::new(engine),
        catalog: published,
        api_key: config.api_key.clone(),
    });
    Ok((state, events))
}

/// Periodically drop expired operations and evict gone resources.
fn spawn_gc(engine: Arc<Engine>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match engine.collect_garbage().await {
                Ok(report) => tracing::debug!(
                    operations = report.operations,
                    instances = report.instances,
                    bindings = report.bindings,
                    "garbage collection finished"
                ),
                Err(e) => tracing::warn!(error = %e, "garbage collection failed"),
            }
        }
    })
}

/// Start the HTTP server described by `config`, with the completion
/// listener and the periodic garbage collector running beside it.
pub async fn start_server(
    config: BrokerConfig,
    tls_cert: Option<PathBuf>,
    tls_key: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (state, events) = build_state(&config)?;

    if state.api_key.is_some() {
        tracing::info!("API key authentication enabled");
    }
    tracing::info!(
        services = state.catalog.services.len(),
        retention_secs = config.retention_secs,
        allow_id_reuse = config.allow_id_reuse,
        "catalog loaded"
    );

    let listener_task = state.engine.spawn_event_listener(events);
    let gc_task = (config.gc_interval_secs > 0).then(|| {
        spawn_gc(
            state.engine.clone(),
            Duration::from_secs(config.gc_interval_secs),
        )
    });

    let app = build_router(state);
    let served = serve(app, config.port, tls_cert, tls_key, shutdown_signal()).await;

    listener_task.abort();
    if let Some(task) = gc_task {
        task.abort();
    }
    tracing::info!("server shut down");
    served
}

/// Serve `app` until `shutdown` resolves, then drain open connections.
///
/// When TLS cert/key paths are provided, the server listens over HTTPS
/// using `axum-server` with rustls. Otherwise it uses plain HTTP.
async fn serve(
    app: Router,
    port: u16,
    _tls_cert: Option<PathBuf>,
    _tls_key: Option<PathBuf>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("0.0.0.0:{}", port);

    // TLS support via axum-server + rustls (requires `tls` feature)
    #[cfg(feature = "tls")]
    if let (Some(cert_path), Some(key_path)) = (&_tls_cert, &_tls_key) {
        let tls =
            axum_server::tls_rustls::RustlsConfig::from_pem_file(cert_path, key_path).await?;
        let socket_addr: std::net::SocketAddr = addr.parse()?;
        tracing::info!("broker listening on https://{}", socket_addr);
        axum_server::bind_rustls(socket_addr, tls)
            .handle(graceful_handle(shutdown))
            .serve(app.into_make_service())
            .await?;
        return Ok(());
    }

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("broker listening on http://{}", addr);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// A server handle that starts a graceful shutdown once `shutdown` resolves.
#[cfg(feature = "tls")]
fn graceful_handle(shutdown: impl Future<Output = ()> + Send + 'static) -> axum_server::Handle {
    let handle = axum_server::Handle::new();
    let trigger = handle.clone();
    tokio::spawn(async move {
        shutdown.await;
        trigger.graceful_shutdown(Some(SHUTDOWN_GRACE));
    });
    handle
}

/// Wait for a shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("received shutdown signal");
}
