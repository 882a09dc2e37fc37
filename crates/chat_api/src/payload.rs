use serde::{Deserialize, Serialize};

use crate::error::ChatApiError;

/// Request body for the streaming chat completion endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    /// Default: true.
    #[serde(default = "default_true")]
    pub stream: bool,
    pub client_message_id: String,
    pub client_assistant_message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_session_id: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ChatRequest {
    pub fn new(
        message: impl Into<String>,
        client_message_id: impl Into<String>,
        client_assistant_message_id: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            stream: true,
            client_message_id: client_message_id.into(),
            client_assistant_message_id: client_assistant_message_id.into(),
            session_id: None,
            client_session_id: None,
        }
    }

    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_client_session_id(mut self, client_session_id: Option<String>) -> Self {
        self.client_session_id = client_session_id;
        self
    }

    /// Rejects payloads the endpoint cannot reconcile.
    pub fn validate(&self) -> Result<(), ChatApiError> {
        if self.message.trim().is_empty() {
            return Err(ChatApiError::InvalidRequest(
                "'message' must not be blank".to_owned(),
            ));
        }
        if self.client_message_id.trim().is_empty()
            || self.client_assistant_message_id.trim().is_empty()
        {
            return Err(ChatApiError::InvalidRequest(
                "client message ids must not be blank".to_owned(),
            ));
        }
        if self.client_message_id == self.client_assistant_message_id {
            return Err(ChatApiError::InvalidRequest(
                "'clientMessageId' and 'clientAssistantMessageId' must differ".to_owned(),
            ));
        }
        Ok(())
    }
}
