use std::collections::BTreeMap;

use crate::config::ChatApiConfig;

pub const HEADER_ACCEPT: &str = "accept";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_USER_AGENT: &str = "user-agent";
pub const HEADER_CLIENT_SESSION_ID: &str = "x-client-session-id";
pub const HEADER_COOKIE: &str = "cookie";

/// Build a deterministic header map for chat completion requests.
///
/// Extra headers from the config may override the defaults but never the
/// session and cookie headers, which are owned by the caller.
pub fn build_headers(
    config: &ChatApiConfig,
    client_session_id: Option<&str>,
    cookie_header: Option<&str>,
) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();

    headers.insert(HEADER_ACCEPT.to_owned(), "text/event-stream".to_owned());
    headers.insert(
        HEADER_CONTENT_TYPE.to_owned(),
        "application/json".to_owned(),
    );

    let ua = config
        .user_agent
        .as_deref()
        .and_then(sanitize_nonempty)
        .unwrap_or_else(default_user_agent);
    headers.insert(HEADER_USER_AGENT.to_owned(), ua);

    for (key, value) in &config.extra_headers {
        headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_owned());
    }

    if let Some(client_session_id) = client_session_id.and_then(sanitize_nonempty) {
        headers.insert(HEADER_CLIENT_SESSION_ID.to_owned(), client_session_id);
    }
    match cookie_header.and_then(sanitize_nonempty) {
        Some(cookie) => {
            headers.insert(HEADER_COOKIE.to_owned(), cookie);
        }
        None => {
            headers.remove(HEADER_COOKIE);
        }
    }

    headers
}

fn sanitize_nonempty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

fn default_user_agent() -> String {
    format!(
        "chat_sync/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        normalize_arch(std::env::consts::ARCH)
    )
}

fn normalize_arch(arch: &str) -> String {
    match arch.to_ascii_lowercase().as_str() {
        "x86_64" | "amd64" => "x64".to_owned(),
        "x86" | "i386" | "i686" => "ia32".to_owned(),
        "aarch64" => "arm64".to_owned(),
        normalized => normalized.to_owned(),
    }
}
