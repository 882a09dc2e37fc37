use std::sync::OnceLock;

use regex::Regex;

fn transient_text_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| {
        Regex::new(r"(?i)rate.?limit|overloaded|service.?unavailable|upstream.?connect|connection.?(refused|reset|closed)|timed?.?out")
            .expect("transient regex must compile")
    })
}

/// Whether a failure is worth a caller-initiated retry.
///
/// The client never retries on its own; this only labels failures.
pub fn is_transient_failure(status: Option<u16>, error_text: &str) -> bool {
    matches!(status, Some(408 | 429 | 500 | 502 | 503 | 504))
        || transient_text_regex().is_match(error_text)
}

#[cfg(test)]
mod tests {
    use super::is_transient_failure;

    #[test]
    fn retryable_statuses_are_transient() {
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(is_transient_failure(Some(status), ""), "{status}");
        }
        assert!(!is_transient_failure(Some(400), ""));
        assert!(!is_transient_failure(Some(401), ""));
        assert!(!is_transient_failure(None, ""));
    }

    #[test]
    fn connectivity_wording_is_transient() {
        assert!(is_transient_failure(None, "connection refused"));
        assert!(is_transient_failure(None, "operation timed out"));
        assert!(is_transient_failure(Some(400), "Rate limit exceeded"));
        assert!(!is_transient_failure(None, "invalid model"));
    }
}
