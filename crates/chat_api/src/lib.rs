//! Transport-only client for the streaming chat completion endpoint.
//!
//! This crate owns request building, SSE frame parsing and error decoding for
//! one exchange at a time. It never retries and holds no conversation state;
//! reconciliation with the local cache belongs to the caller.
//!
//! Cookies are exchanged with a [`chat_store::CookiePersistence`] when one is
//! attached through [`ChatApiClient::with_cookie_store`].

pub mod client;
pub mod config;
pub mod cookies;
pub mod error;
pub mod events;
pub mod headers;
pub mod payload;
pub mod sse;
pub mod stream;
pub mod transient;
pub mod url;

pub use client::ChatApiClient;
pub use config::{ChatApiConfig, DEFAULT_EVENT_BUFFER};
pub use error::ChatApiError;
pub use events::{ChatStreamEvent, StreamFailure};
pub use payload::ChatRequest;
pub use sse::SseStreamParser;
pub use stream::{CancelSignal, ChatEventSender, ChatEventStream, ChatStreamClient};
pub use transient::is_transient_failure;
pub use url::{endpoint_url, normalize_chat_url};
