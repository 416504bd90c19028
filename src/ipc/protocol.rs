use crate::supervisor::state::StatusSnapshot;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Everything a bus client may send: operator commands plus the inter-child
/// relay verbs.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Request {
    Start { id: String },
    Stop { id: String },
    Restart { id: String },
    Block { id: String },
    Unblock { id: String },
    Status,
    Terminate,
    /// A child registers its connection as the delivery channel for its id.
    Subscribe { id: String },
    /// Relay `payload` to the subscriber registered under `to`.
    Send { to: String, payload: Value },
}

/// Command acknowledgements and relayed messages share the response channel
/// of a connection.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Reply {
    Ok,
    Error {
        payload: String,
    },
    /// A relayed inter-child message; `id` names the sender when it has a
    /// subscription of its own.
    Message {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        payload: Value,
    },
}

impl Reply {
    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error {
            payload: message.into(),
        }
    }
}

/// Status answers enumerate every supervisor.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub processes: Vec<StatusSnapshot>,
}
