//! WebSocket frame shapes. Inbound frames are decoded by sessions and
//! handed to the hub; outbound frames are produced by the hub and drained
//! by each session's writer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{EnvStatus, OperationUpdate};

/// Client → server
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { environments: Vec<Uuid> },
    Unsubscribe { environments: Vec<Uuid> },
    Ping,
}

/// Server → client
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    StatusUpdate {
        environment_id: Uuid,
        status: EnvStatus,
    },
    #[serde(rename_all = "camelCase")]
    OperationUpdate {
        operation_id: Uuid,
        update: OperationUpdate,
    },
    Subscribed {
        environments: Vec<Uuid>,
    },
    Unsubscribed {
        environments: Vec<Uuid>,
    },
    Pong,
}
