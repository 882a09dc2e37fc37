//! Environment configuration.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use chat_api::ChatApiConfig;

use crate::error::ChatError;

pub const ENV_BASE_URL: &str = "CHAT_SYNC_BASE_URL";
pub const ENV_DATA_DIR: &str = "CHAT_SYNC_DATA_DIR";
pub const ENV_TIMEOUT_SEC: &str = "CHAT_SYNC_TIMEOUT_SEC";
pub const ENV_USER_AGENT: &str = "CHAT_SYNC_USER_AGENT";
pub const ENV_LOG: &str = "CHAT_SYNC_LOG";

/// Directory name under the platform data dir.
pub const DATA_DIR_NAME: &str = "chat_sync";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSyncConfig {
    pub base_url: String,
    pub data_dir: PathBuf,
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    pub log_filter: Option<String>,
}

impl ChatSyncConfig {
    pub fn new(base_url: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_url: base_url.into(),
            data_dir: data_dir.into(),
            timeout: None,
            user_agent: None,
            log_filter: None,
        }
    }

    pub fn from_env() -> Result<Self, ChatError> {
        let base_url = env_string_opt(ENV_BASE_URL)
            .ok_or_else(|| ChatError::Config(format!("{ENV_BASE_URL} is not set")))?;
        let data_dir = match env_string_opt(ENV_DATA_DIR) {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir()?,
        };
        let timeout = env_string_opt(ENV_TIMEOUT_SEC)
            .map(|value| parse_timeout(&value))
            .transpose()?;

        Ok(Self {
            base_url,
            data_dir,
            timeout,
            user_agent: env_string_opt(ENV_USER_AGENT),
            log_filter: env_string_opt(ENV_LOG),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn api_config(&self) -> ChatApiConfig {
        let mut config = ChatApiConfig::new(self.base_url.clone());
        if let Some(timeout) = self.timeout {
            config = config.with_timeout(timeout);
        }
        if let Some(user_agent) = &self.user_agent {
            config = config.with_user_agent(user_agent.clone());
        }
        config
    }
}

fn default_data_dir() -> Result<PathBuf, ChatError> {
    dirs::data_dir()
        .map(|dir| dir.join(DATA_DIR_NAME))
        .ok_or_else(|| {
            ChatError::Config(format!(
                "no platform data directory; set {ENV_DATA_DIR}"
            ))
        })
}

fn parse_timeout(value: &str) -> Result<Duration, ChatError> {
    match value.trim().parse::<u64>() {
        Ok(0) | Err(_) => Err(ChatError::Config(format!(
            "{ENV_TIMEOUT_SEC} must be a positive number of seconds, got '{value}'"
        ))),
        Ok(seconds) => Ok(Duration::from_secs(seconds)),
    }
}

fn env_string_opt(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        if value.trim().is_empty() {
            None
        } else {
            Some(value.trim().to_owned())
        }
    })
}
