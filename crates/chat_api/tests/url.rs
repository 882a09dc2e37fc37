use chat_api::{endpoint_url, normalize_chat_url, ChatApiError};

#[test]
fn url_normalization_keeps_existing_completions_endpoint() {
    assert_eq!(
        normalize_chat_url("https://chat.example.com/api/v1/chat/completions/"),
        "https://chat.example.com/api/v1/chat/completions"
    );
}

#[test]
fn url_normalization_appends_completions_to_versioned_base() {
    assert_eq!(
        normalize_chat_url("https://chat.example.com/api/v1"),
        "https://chat.example.com/api/v1/chat/completions"
    );
}

#[test]
fn url_normalization_appends_version_to_generic_base() {
    assert_eq!(
        normalize_chat_url(" https://chat.example.com/ "),
        "https://chat.example.com/v1/chat/completions"
    );
}

#[test]
fn endpoint_url_rejects_blank_and_unsupported_bases() {
    assert!(matches!(
        endpoint_url("   "),
        Err(ChatApiError::InvalidBaseUrl(_))
    ));
    assert!(matches!(
        endpoint_url("ws://chat.example.com"),
        Err(ChatApiError::InvalidBaseUrl(_))
    ));
    assert!(matches!(
        endpoint_url("not a url"),
        Err(ChatApiError::InvalidBaseUrl(_))
    ));
}
