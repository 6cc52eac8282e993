use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("timed out after {0:?} waiting for the gateway to become ready")]
    Timeout(Duration),
    #[error("connection attempt was cancelled")]
    Cancelled,
    #[error("malformed {event_type} payload: {message}")]
    Protocol { event_type: String, message: String },
    #[error("failed to handle {event_type}: {message}")]
    Handler { event_type: String, message: String },
    #[error("the client is not connected")]
    NotConnected,
    #[error("the client is connecting")]
    Connecting,
    #[error("the client is disconnecting")]
    Disconnecting,
    #[error("request failed: {0}")]
    Request(String),
    #[error("background task failed: {0}")]
    Task(String),
}

impl ClientError {
    pub(crate) fn request(err: anyhow::Error) -> Self {
        Self::Request(format!("{err:#}"))
    }

    pub(crate) fn transport(err: anyhow::Error) -> Self {
        Self::Transport(format!("{err:#}"))
    }

    pub(crate) fn protocol(event_type: &str, err: serde_json::Error) -> Self {
        Self::Protocol {
            event_type: event_type.to_string(),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
