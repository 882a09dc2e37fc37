use url::Url;

use crate::error::ChatApiError;

pub const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

/// Normalize a base URL to the streaming chat completion endpoint.
///
/// Normalization rules:
/// 1) keep `/chat/completions` unchanged
/// 2) append `/chat/completions` when path ends in `/v1`
/// 3) append `/v1/chat/completions` otherwise
pub fn normalize_chat_url(input: &str) -> String {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.ends_with(CHAT_COMPLETIONS_PATH) {
        return trimmed.to_string();
    }
    if trimmed.ends_with("/v1") {
        return format!("{trimmed}{CHAT_COMPLETIONS_PATH}");
    }
    format!("{trimmed}/v1{CHAT_COMPLETIONS_PATH}")
}

/// Parsed endpoint URL; only `http` and `https` bases are accepted.
pub fn endpoint_url(base_url: &str) -> Result<Url, ChatApiError> {
    if base_url.trim().is_empty() {
        return Err(ChatApiError::InvalidBaseUrl("base URL is empty".to_owned()));
    }

    let url = Url::parse(&normalize_chat_url(base_url))
        .map_err(|error| ChatApiError::InvalidBaseUrl(format!("{base_url}: {error}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(ChatApiError::InvalidBaseUrl(format!(
            "unsupported scheme '{scheme}' in {base_url}"
        ))),
    }
}
