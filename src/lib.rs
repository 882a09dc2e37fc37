//! Client-side chat synchronization engine.
//!
//! Keeps one conversation consistent across a durable local cache and a
//! streaming completion endpoint:
//! - [`ChatOrchestrator`] owns the single in-flight send, writes optimistic
//!   rows and reconciles streamed frames into them by client message id.
//! - [`chat_store`] persists session identity, messages and cookies under one
//!   data directory.
//! - [`chat_api`] runs one streaming exchange at a time.
//! - [`ContentAccessGate`] decides whether a send may go out at all.
//!
//! [`open`] wires the default stack from a [`ChatSyncConfig`].

pub mod access;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod error_message;
pub mod logging;
pub mod orchestrator;

use std::sync::Arc;

use chat_api::ChatApiClient;
use chat_store::{store_paths, CookiePersistence, MessageCache, SessionStateStore};
use tracing::info;

pub use access::{AccessDecision, AccessFlags, BlockReason, ContentAccessGate};
pub use collaborators::PreferencesStore;
pub use config::ChatSyncConfig;
pub use error::ChatError;
pub use error_message::{DefaultErrorMessages, ErrorMessageMapper, GENERIC_ERROR_MESSAGE};
pub use logging::{init_logging, LoggingError};
pub use orchestrator::{ChatOrchestrator, Epoch, SendHandle, SendOutcome, SendState};

pub use chat_api;
pub use chat_store;

/// Opens the stores under `config.data_dir`, builds the HTTP client with the
/// persistent cookie layer and returns the orchestrator.
pub fn open(
    config: &ChatSyncConfig,
    gate: ContentAccessGate,
    errors: Arc<dyn ErrorMessageMapper>,
) -> Result<Arc<ChatOrchestrator>, ChatError> {
    let paths = store_paths(&config.data_dir);
    let session = Arc::new(SessionStateStore::open(&paths.session)?);
    let messages = MessageCache::open(&paths.messages)?;
    let cookies = Arc::new(CookiePersistence::open(&paths.cookies)?);

    let client = ChatApiClient::new(config.api_config())
        .map_err(|error| ChatError::Config(error.to_string()))?
        .with_cookie_store(cookies);
    info!(
        data_dir = %config.data_dir.display(),
        endpoint = %client.endpoint(),
        "chat sync opened"
    );

    Ok(ChatOrchestrator::new(
        Arc::new(client),
        session,
        messages,
        errors,
        gate,
    ))
}
