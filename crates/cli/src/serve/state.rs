//! Application state shared across request handlers.

use std::sync::Arc;

use broker_core::{Catalog, LifecycleEngine};
use broker_storage::MemoryStorage;

pub(crate) type Engine = LifecycleEngine<MemoryStorage>;

pub(crate) struct AppState {
    pub(crate) engine: Arc<Engine>,
    /// Published as-is by `GET /v2/catalog`.
    pub(crate) catalog: Catalog,
    /// Optional API key for authentication. None = no auth required.
    pub(crate) api_key: Option<String>,
}
