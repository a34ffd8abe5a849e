use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default retention of completed operations and `Gone` resources: 24 hours.
pub const DEFAULT_RETENTION_SECS: u64 = 24 * 60 * 60;

/// Tunables of the lifecycle engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long completed operations stay pollable, and how long a `Gone`
    /// instance or binding keeps its idempotency records.
    #[serde(with = "secs")]
    pub retention: Duration,
    /// Let a provision for a `Gone` instance id start a new instance
    /// instead of failing with a conflict. Same for bindings.
    pub allow_id_reuse: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(DEFAULT_RETENTION_SECS),
            allow_id_reuse: false,
        }
    }
}

impl EngineConfig {
    pub(crate) fn retention_window(&self) -> time::Duration {
        time::Duration::try_from(self.retention).unwrap_or(time::Duration::MAX)
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
