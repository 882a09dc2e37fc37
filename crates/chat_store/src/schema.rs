use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One cached chat row.
///
/// `id` is minted by the client and is the only unique key. `server_id` stays
/// `None` until the server acknowledges the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub server_id: Option<String>,
    pub role: Role,
    pub content: String,
    pub created_at_ms: i64,
    pub is_streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChatMessage {
    #[must_use]
    pub fn user(
        id: impl Into<String>,
        session_id: impl Into<String>,
        content: impl Into<String>,
        created_at_ms: i64,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            server_id: None,
            role: Role::User,
            content: content.into(),
            created_at_ms,
            is_streaming: false,
            error: None,
        }
    }

    /// Empty assistant row that receives streamed deltas.
    #[must_use]
    pub fn placeholder(
        id: impl Into<String>,
        session_id: impl Into<String>,
        created_at_ms: i64,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            server_id: None,
            role: Role::Assistant,
            content: String::new(),
            created_at_ms,
            is_streaming: true,
            error: None,
        }
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Persisted session identity fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at_ms: Option<i64>,
}

impl SessionState {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.session_id.is_none() && self.client_session_id.is_none() && self.updated_at_ms.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieSnapshot {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub expires_at_ms: Option<i64>,
    pub persistent: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
}

impl CookieSnapshot {
    /// Cookie with an expiry, which makes it persistent.
    #[must_use]
    pub fn persistent(
        name: impl Into<String>,
        value: impl Into<String>,
        domain: impl Into<String>,
        expires_at_ms: i64,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: "/".to_owned(),
            expires_at_ms: Some(expires_at_ms),
            persistent: true,
            secure: false,
            http_only: false,
        }
    }

    /// Cookie scoped to the issuing exchange.
    #[must_use]
    pub fn session(
        name: impl Into<String>,
        value: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: "/".to_owned(),
            expires_at_ms: None,
            persistent: false,
            secure: false,
            http_only: false,
        }
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    #[must_use]
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    #[must_use]
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|expires| expires <= now_ms)
    }

    /// Persistent and still valid at `now_ms`.
    #[must_use]
    pub fn survives_at(&self, now_ms: i64) -> bool {
        self.persistent && self.expires_at_ms.is_some() && !self.is_expired_at(now_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum MessageRecord {
    Upsert { message: ChatMessage },
    DeleteSession { session_id: String },
}
