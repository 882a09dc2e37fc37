use std::fmt;

use serde::{Deserialize, Serialize};

use crate::transient::is_transient_failure;

/// Why a streaming exchange ended without `done`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamFailure {
    /// Connectivity loss or timeout.
    Network { message: String },
    /// Malformed or unexpected frame, or a stream that ended early.
    Protocol { message: String },
    /// Failure reported by the server, either as a non-2xx response or an
    /// `error` frame.
    Api {
        http_status: Option<u16>,
        api_code: Option<i64>,
        error_detail_code: Option<String>,
        message: Option<String>,
    },
}

impl StreamFailure {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Whether a caller-initiated retry may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::Protocol { .. } => false,
            Self::Api {
                http_status,
                message,
                ..
            } => is_transient_failure(*http_status, message.as_deref().unwrap_or("")),
        }
    }
}

impl fmt::Display for StreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network { message } => write!(f, "network failure: {message}"),
            Self::Protocol { message } => write!(f, "protocol failure: {message}"),
            Self::Api {
                http_status,
                api_code,
                error_detail_code,
                message,
            } => {
                write!(f, "api failure")?;
                if let Some(status) = http_status {
                    write!(f, " (HTTP {status})")?;
                }
                if let Some(code) = api_code {
                    write!(f, " code {code}")?;
                }
                if let Some(detail) = error_detail_code {
                    write!(f, " [{detail}]")?;
                }
                if let Some(message) = message {
                    write!(f, ": {message}")?;
                }
                Ok(())
            }
        }
    }
}

/// Normalized event of one streaming exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatStreamEvent {
    ContentDelta {
        text: String,
    },
    SessionAssigned {
        server_id: Option<String>,
        session_id: String,
    },
    MessageAck {
        client_message_id: String,
        server_message_id: String,
    },
    Done,
    Error {
        failure: StreamFailure,
    },
}

impl ChatStreamEvent {
    /// Returns true when this event ends the exchange.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }
}
