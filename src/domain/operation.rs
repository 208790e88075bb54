//! Transient operations (restart, upgrade). Identity is carried in audit
//! events and the synchronous API response; operations are not persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Restart,
    Upgrade,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Restart => "restart",
            OperationKind::Upgrade => "upgrade",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationStatus {
    InProgress,
    Success,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::InProgress)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Always UUIDv4; never derived from a timestamp
    pub operation_id: Uuid,
    pub environment_id: Uuid,
    pub kind: OperationKind,
    pub started_at: DateTime<Utc>,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Operation {
    pub fn start(environment_id: Uuid, kind: OperationKind) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            environment_id,
            kind,
            started_at: Utc::now(),
            status: OperationStatus::InProgress,
            finished_at: None,
            error: None,
        }
    }
}

/// Progress payload fanned out to subscribers of the owning environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationUpdate {
    pub environment_id: Uuid,
    pub kind: OperationKind,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
