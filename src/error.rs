use chat_api::StreamFailure;
use chat_store::StoreError;
use thiserror::Error;

use crate::access::BlockReason;

#[derive(Debug, Error)]
pub enum ChatError {
    /// Connectivity loss or timeout; a retry may succeed.
    #[error("network failure: {0}")]
    Network(String),
    #[error("protocol failure: {0}")]
    Protocol(String),
    #[error("api failure (status {http_status:?}, code {api_code:?}, detail {error_detail_code:?}): {}", .message.as_deref().unwrap_or("no message"))]
    Api {
        http_status: Option<u16>,
        api_code: Option<i64>,
        error_detail_code: Option<String>,
        message: Option<String>,
    },
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("a send is already in flight")]
    Busy,
    #[error("send blocked by content access policy: {0}")]
    AccessBlocked(BlockReason),
    #[error("message text is empty")]
    EmptyMessage,
    #[error("invalid message id '{0}'")]
    InvalidMessageId(String),
    #[error("unknown message '{0}'")]
    UnknownMessage(String),
    #[error("message id '{0}' is already in use")]
    DuplicateMessageId(String),
    /// One half of a local session clear failed; the other half may have
    /// been applied.
    #[error("local session only partially cleared ({stage})")]
    PartialClear {
        stage: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ChatError {
    /// Whether retrying the same send may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Api {
                http_status,
                message,
                ..
            } => chat_api::is_transient_failure(*http_status, message.as_deref().unwrap_or("")),
            _ => false,
        }
    }
}

impl From<StreamFailure> for ChatError {
    fn from(failure: StreamFailure) -> Self {
        match failure {
            StreamFailure::Network { message } => Self::Network(message),
            StreamFailure::Protocol { message } => Self::Protocol(message),
            StreamFailure::Api {
                http_status,
                api_code,
                error_detail_code,
                message,
            } => Self::Api {
                http_status,
                api_code,
                error_detail_code,
                message,
            },
        }
    }
}
