//! Wire envelopes for the command protocol.
//!
//! All fields serialize in camelCase; this is the fixed naming
//! convention of the wire format. Requests flow client→server,
//! responses server→client, correlated by the caller-supplied `id`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::ConnectionId;

/// Inbound unit: one command invocation from a client.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    /// Request-scoped correlation id, supplied by the caller and
    /// echoed back verbatim in the response.
    pub id: String,
    /// Selects the command handler.
    pub action: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Outbound unit. `connection_id` and `id` are stamped by the engine
/// just before transmission, never by a handler.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub connection_id: ConnectionId,
    pub id: String,
    pub payload: serde_json::Value,
}

impl ResponseEnvelope {
    /// Response correlated to a request id.
    pub fn reply(connection_id: ConnectionId, request_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            connection_id,
            id: request_id.into(),
            payload,
        }
    }

    /// Server-initiated message with a fresh id (handshake, broadcast).
    pub fn notification(connection_id: ConnectionId, payload: serde_json::Value) -> Self {
        Self {
            connection_id,
            id: Uuid::now_v7().to_string(),
            payload,
        }
    }
}

/// Error payload shape shared by the router and the protocol loop:
/// a human-readable message plus the offending action when known.
pub fn error_payload(message: impl Into<String>, action: Option<&str>) -> serde_json::Value {
    match action {
        Some(action) => serde_json::json!({ "error": message.into(), "action": action }),
        None => serde_json::json!({ "error": message.into() }),
    }
}
