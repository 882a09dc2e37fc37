//! User-facing text for failed sends.

pub const GENERIC_ERROR_MESSAGE: &str = "something went wrong";

/// Maps failure details to text shown on a failed placeholder. Must be
/// total: every input yields a message.
pub trait ErrorMessageMapper: Send + Sync {
    fn to_user_message(
        &self,
        http_status: Option<u16>,
        api_code: Option<i64>,
        error_detail_code: Option<&str>,
        fallback: Option<&str>,
    ) -> String;
}

/// Detail-code table, then status table, then the fallback text, then
/// [`GENERIC_ERROR_MESSAGE`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorMessages;

impl ErrorMessageMapper for DefaultErrorMessages {
    fn to_user_message(
        &self,
        http_status: Option<u16>,
        _api_code: Option<i64>,
        error_detail_code: Option<&str>,
        fallback: Option<&str>,
    ) -> String {
        error_detail_code
            .and_then(detail_message)
            .or_else(|| http_status.and_then(status_message))
            .map(str::to_owned)
            .or_else(|| {
                fallback
                    .map(str::trim)
                    .filter(|text| !text.is_empty())
                    .map(str::to_owned)
            })
            .unwrap_or_else(|| GENERIC_ERROR_MESSAGE.to_owned())
    }
}

fn detail_message(code: &str) -> Option<&'static str> {
    match code.trim().to_ascii_uppercase().as_str() {
        "INSUFFICIENT_BALANCE" => Some("insufficient balance"),
        "RATE_LIMITED" => Some("too many requests, try again shortly"),
        "SESSION_EXPIRED" => Some("session expired"),
        "CONTENT_BLOCKED" => Some("this content is not available"),
        "MESSAGE_TOO_LONG" => Some("message is too long"),
        _ => None,
    }
}

fn status_message(status: u16) -> Option<&'static str> {
    match status {
        400 => Some("bad request"),
        401 => Some("unauthorized"),
        403 => Some("forbidden"),
        404 => Some("not found"),
        408 => Some("request timed out"),
        413 => Some("message is too long"),
        429 => Some("too many requests, try again shortly"),
        500..=599 => Some("server error, try again later"),
        _ => None,
    }
}
