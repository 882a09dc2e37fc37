//! Local persistence for the chat sync engine.
//!
//! Three independent stores live under one data directory: the active
//! session's identity ([`SessionStateStore`]), the observable message cache
//! ([`MessageCache`]) and the persistent cookie jar ([`CookiePersistence`]).

mod cookies;
mod error;
mod messages;
mod paths;
mod persist;
mod schema;
mod session;

pub use cookies::CookiePersistence;
pub use error::StoreError;
pub use messages::{MessageCache, MessageSubscription};
pub use paths::{store_paths, StorePaths, COOKIES_FILE, MESSAGES_FILE, SESSION_FILE};
pub use persist::now_ms;
pub use schema::{ChatMessage, CookieSnapshot, Role, SessionState};
pub use session::SessionStateStore;
