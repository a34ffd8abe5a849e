//! Configuration for `broker serve`.
//!
//! # Example
//!
//! ```toml
//! port = 8080
//! catalog = "config/catalog.toml"
//! retention_secs = 86400
//! allow_id_reuse = false
//! gc_interval_secs = 300
//!
//! [sandbox]
//! async_delay_ms = 2000
//! dashboard_base = "https://dashboard.example.com"
//! ```
//!
//! `BROKER_API_KEY` and `BROKER_RETENTION_SECS` override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use broker_core::{Catalog, EngineConfig};
use serde::{Deserialize, Serialize};

pub(crate) const DEFAULT_PORT: u16 = 8080;
pub(crate) const DEFAULT_GC_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct BrokerConfig {
    pub(crate) port: u16,
    /// TOML or JSON catalog file. Relative paths resolve against the
    /// config file's directory. `None` serves the built-in catalog.
    pub(crate) catalog: Option<PathBuf>,
    /// When set, every request except `/health` must present this key.
    pub(crate) api_key: Option<String>,
    pub(crate) retention_secs: u64,
    pub(crate) allow_id_reuse: bool,
    pub(crate) gc_interval_secs: u64,
    pub(crate) sandbox: SandboxConfig,
}

/// `[sandbox]` section: behaviour of the built-in provisioner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct SandboxConfig {
    /// Complete operations asynchronously after this many milliseconds when
    /// the caller accepts incomplete responses.
    pub(crate) async_delay_ms: Option<u64>,
    pub(crate) dashboard_base: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            port: DEFAULT_PORT,
            catalog: None,
            api_key: None,
            retention_secs: engine.retention.as_secs(),
            allow_id_reuse: engine.allow_id_reuse,
            gc_interval_secs: DEFAULT_GC_INTERVAL_SECS,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub(crate) fn engine(&self) -> EngineConfig {
        EngineConfig {
            retention: Duration::from_secs(self.retention_secs),
            allow_id_reuse: self.allow_id_reuse,
        }
    }

    /// Apply environment overrides, reading variables through `lookup`.
    pub(crate) fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), String> {
        if let Some(key) = lookup("BROKER_API_KEY").filter(|k| !k.is_empty()) {
            self.api_key = Some(key);
        }
        if let Some(raw) = lookup("BROKER_RETENTION_SECS") {
            self.retention_secs = raw
                .trim()
                .parse()
                .map_err(|e| format!("invalid BROKER_RETENTION_SECS '{}': {}", raw, e))?;
        }
        Ok(())
    }
}

/// Read the config file at `path`, or start from defaults, then apply the
/// process environment.
pub(crate) fn load_config(path: Option<&Path>) -> Result<BrokerConfig, String> {
    let mut config = match path {
        Some(path) => read_config(path)?,
        None => BrokerConfig::default(),
    };
    config.apply_env(|name| std::env::var(name).ok())?;
    Ok(config)
}

fn read_config(path: &Path) -> Result<BrokerConfig, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("could not read '{}': {}", path.display(), e))?;
    let mut config: BrokerConfig = toml::from_str(&content)
        .map_err(|e| format!("could not parse '{}': {}", path.display(), e))?;
    if let (Some(catalog), Some(dir)) = (&config.catalog, path.parent()) {
        if catalog.is_relative() {
            config.catalog = Some(dir.join(catalog));
        }
    }
    Ok(config)
}

/// Read a catalog file. `.json` files are parsed as JSON, anything else as TOML.
pub(crate) fn read_catalog(path: &Path) -> Result<Catalog, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("could not read '{}': {}", path.display(), e))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        serde_json::from_str(&content)
            .map_err(|e| format!("could not parse '{}': {}", path.display(), e))
    } else {
        toml::from_str(&content)
            .map_err(|e| format!("could not parse '{}': {}", path.display(), e))
    }
}

const BUILTIN_CATALOG: &str = r#"
[[services]]
id = "6d6a4a0e-4b8c-4a51-9d0e-1f2d8c3b7a10"
name = "sandbox-service"
description = "Sandbox service that provisions nothing and hands out generated credentials"
bindable = true
tags = ["sandbox"]

[[services.plans]]
id = "2f0c9f56-5b0e-4a8b-a3a5-9e5d7c1e4b21"
name = "standard"
description = "Completes synchronously unless the caller accepts incomplete responses"
"#;

pub(crate) fn builtin_catalog() -> Result<Catalog, String> {
    toml::from_str(BUILTIN_CATALOG).map_err(|e| format!("built-in catalog is invalid: {}", e))
}
