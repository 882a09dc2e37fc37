use chat_sync::{DefaultErrorMessages, ErrorMessageMapper, GENERIC_ERROR_MESSAGE};
use pretty_assertions::assert_eq;

fn map(
    status: Option<u16>,
    api_code: Option<i64>,
    detail: Option<&str>,
    fallback: Option<&str>,
) -> String {
    DefaultErrorMessages.to_user_message(status, api_code, detail, fallback)
}

#[test]
fn detail_code_wins_over_status_and_fallback() {
    assert_eq!(
        map(Some(400), Some(123), Some("INSUFFICIENT_BALANCE"), Some("oops")),
        "insufficient balance"
    );
    assert_eq!(
        map(Some(500), None, Some("rate_limited"), None),
        "too many requests, try again shortly"
    );
}

#[test]
fn status_is_used_when_detail_is_unknown() {
    assert_eq!(map(Some(401), None, None, None), "unauthorized");
    assert_eq!(
        map(Some(403), None, Some("SOMETHING_NEW"), Some("raw")),
        "forbidden"
    );
    assert_eq!(
        map(Some(503), None, None, None),
        "server error, try again later"
    );
}

#[test]
fn fallback_text_is_used_verbatim_when_tables_miss() {
    assert_eq!(map(None, None, None, Some("custom")), "custom");
    assert_eq!(map(Some(418), None, None, Some("  teapot  ")), "teapot");
}

#[test]
fn mapping_is_total() {
    assert_eq!(map(None, None, None, None), GENERIC_ERROR_MESSAGE);
    assert_eq!(map(Some(299), Some(7), Some(""), Some("   ")), GENERIC_ERROR_MESSAGE);
}
