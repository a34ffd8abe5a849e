use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::request::LifecycleResponse;

/// The result stored in an idempotency record.
///
/// A claim starts `Pending`, may move to `Accepted` while the provisioner
/// works asynchronously, and ends `Succeeded` or `Failed`. Every variant
/// names the operation that wrote it so a late writer for an older attempt
/// can recognise that it has been superseded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub(crate) enum RecordedOutcome {
    Pending {
        operation_id: String,
    },
    Accepted {
        operation_id: String,
    },
    Succeeded {
        operation_id: String,
        response: LifecycleResponse,
    },
    Failed {
        operation_id: String,
        description: String,
    },
}

impl RecordedOutcome {
    pub(crate) fn operation_id(&self) -> &str {
        match self {
            RecordedOutcome::Pending { operation_id }
            | RecordedOutcome::Accepted { operation_id }
            | RecordedOutcome::Succeeded { operation_id, .. }
            | RecordedOutcome::Failed { operation_id, .. } => operation_id,
        }
    }

    pub(crate) fn to_value(&self) -> Result<serde_json::Value, BrokerError> {
        serde_json::to_value(self).map_err(|e| {
            BrokerError::StorageUnavailable(format!("cannot encode idempotency result: {e}"))
        })
    }

    pub(crate) fn from_value(value: &serde_json::Value) -> Result<Self, BrokerError> {
        Self::deserialize(value).map_err(|e| {
            BrokerError::StorageUnavailable(format!("corrupt idempotency result: {e}"))
        })
    }
}
