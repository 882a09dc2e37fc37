use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chat_store::CookiePersistence;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ChatApiConfig;
use crate::cookies::{cookie_header, persist_response_cookies};
use crate::error::{parse_error_response, ChatApiError};
use crate::events::ChatStreamEvent;
use crate::headers::build_headers;
use crate::payload::ChatRequest;
use crate::sse::SseStreamParser;
use crate::stream::{ChatEventSender, ChatEventStream, ChatStreamClient};
use crate::url::endpoint_url;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// reqwest-backed [`ChatStreamClient`]. Cheap to clone; clones share the
/// connection pool and cookie store.
#[derive(Debug, Clone)]
pub struct ChatApiClient {
    http: Client,
    config: Arc<ChatApiConfig>,
    endpoint: Url,
    cookies: Option<Arc<CookiePersistence>>,
}

impl ChatApiClient {
    pub fn new(config: ChatApiConfig) -> Result<Self, ChatApiError> {
        let endpoint = endpoint_url(&config.base_url)?;
        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(timeout) = config.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        let http = builder.build().map_err(ChatApiError::from)?;
        Ok(Self {
            http,
            config: Arc::new(config),
            endpoint,
            cookies: None,
        })
    }

    /// Attaches the persistent cookie layer consulted on every exchange.
    #[must_use]
    pub fn with_cookie_store(mut self, cookies: Arc<CookiePersistence>) -> Self {
        self.cookies = Some(cookies);
        self
    }

    pub fn config(&self) -> &ChatApiConfig {
        &self.config
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn build_headers(&self, client_session_id: Option<&str>) -> Result<HeaderMap, ChatApiError> {
        let cookie = self
            .cookies
            .as_ref()
            .and_then(|store| cookie_header(&store.load_for_request(&self.endpoint)));
        let headers = build_headers(&self.config, client_session_id, cookie.as_deref());
        let mut out = HeaderMap::new();
        for (key, value) in headers {
            out.insert(
                HeaderName::from_bytes(key.as_bytes())
                    .map_err(|_| ChatApiError::InvalidHeader(format!("invalid header key: {key}")))?,
                HeaderValue::from_str(&value).map_err(|_| {
                    ChatApiError::InvalidHeader(format!("invalid header value for {key}"))
                })?,
            );
        }
        Ok(out)
    }

    pub fn build_request(
        &self,
        request: &ChatRequest,
    ) -> Result<reqwest::RequestBuilder, ChatApiError> {
        request.validate()?;

        let headers = self.build_headers(request.client_session_id.as_deref())?;
        let mut payload = request.clone();
        payload.stream = true;
        Ok(self
            .http
            .post(self.endpoint.clone())
            .headers(headers)
            .json(&payload))
    }

    /// Runs one exchange to its terminal frame, forwarding events to `sender`.
    ///
    /// Returns once a terminal event was forwarded. Failures before that are
    /// returned rather than forwarded; the caller decides how to report them.
    pub async fn exchange(
        &self,
        request: &ChatRequest,
        sender: &ChatEventSender,
    ) -> Result<(), ChatApiError> {
        let builder = self.build_request(request)?;
        info!(
            endpoint = %self.endpoint,
            client_message_id = %request.client_message_id,
            "opening chat stream"
        );

        let response = await_or_cancel(builder.send(), sender)
            .await?
            .map_err(ChatApiError::from)?;

        if let Some(store) = &self.cookies {
            persist_response_cookies(store, &self.endpoint, &response);
        }

        let status = response.status();
        debug!(%status, "chat stream response");
        if !status.is_success() {
            let body = await_or_cancel(response.text(), sender)
                .await?
                .unwrap_or_default();
            return Err(parse_error_response(status, &body));
        }

        let mut bytes = response.bytes_stream();
        let mut parser = SseStreamParser::default();

        loop {
            let Some(chunk) = await_or_cancel(bytes.next(), sender).await? else {
                break;
            };
            if sender.is_cancelled() {
                return Err(ChatApiError::Cancelled);
            }
            let chunk = chunk.map_err(ChatApiError::from)?;
            if forward(parser.feed(&chunk), sender).await? {
                return Ok(());
            }
        }

        // A final frame without its trailing blank line still counts.
        if forward(parser.feed(b"\n\n"), sender).await? {
            return Ok(());
        }

        if sender.is_cancelled() {
            return Err(ChatApiError::Cancelled);
        }
        Err(ChatApiError::StreamEnded)
    }

    async fn run_exchange(self, request: ChatRequest, sender: ChatEventSender) {
        match self.exchange(&request, &sender).await {
            Ok(()) => debug!(
                client_message_id = %request.client_message_id,
                "chat stream finished"
            ),
            Err(ChatApiError::Cancelled) => debug!(
                client_message_id = %request.client_message_id,
                "chat stream cancelled"
            ),
            Err(error) => {
                warn!(
                    %error,
                    client_message_id = %request.client_message_id,
                    "chat stream failed"
                );
                let _ = sender
                    .send(ChatStreamEvent::Error {
                        failure: error.into_failure(),
                    })
                    .await;
            }
        }
    }
}

impl ChatStreamClient for ChatApiClient {
    fn send_message(&self, request: ChatRequest) -> ChatEventStream {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return ChatEventStream::failed(ChatStreamEvent::Error {
                failure: ChatApiError::InvalidRequest("no tokio runtime".to_owned())
                    .into_failure(),
            });
        };

        let (sender, mut stream) = ChatEventStream::channel(self.config.event_buffer);
        let task = runtime.spawn(self.clone().run_exchange(request, sender));
        stream.attach_task(task);
        stream
    }
}

/// Forwards parsed frames in order. Returns true once a terminal event went out.
async fn forward(
    items: Vec<Result<ChatStreamEvent, ChatApiError>>,
    sender: &ChatEventSender,
) -> Result<bool, ChatApiError> {
    for item in items {
        let event = item?;
        let terminal = event.is_terminal();
        if !sender.send(event).await {
            return Err(ChatApiError::Cancelled);
        }
        if terminal {
            return Ok(true);
        }
    }
    Ok(false)
}

async fn await_or_cancel<F>(future: F, sender: &ChatEventSender) -> Result<F::Output, ChatApiError>
where
    F: Future,
{
    let mut future = Box::pin(future);

    loop {
        if sender.is_cancelled() {
            return Err(ChatApiError::Cancelled);
        }

        if let Ok(output) = tokio::time::timeout(CANCEL_POLL_INTERVAL, &mut future).await {
            if sender.is_cancelled() {
                return Err(ChatApiError::Cancelled);
            }
            return Ok(output);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chat_store::{CookiePersistence, CookieSnapshot};
    use url::Url;

    use super::ChatApiClient;
    use crate::config::ChatApiConfig;
    use crate::error::ChatApiError;
    use crate::payload::ChatRequest;

    #[test]
    fn build_request_carries_session_and_stored_cookies() {
        let cookies = Arc::new(CookiePersistence::in_memory());
        let endpoint = Url::parse("https://chat.example.com/v1/chat/completions").expect("url");
        cookies
            .save_from_response_at(
                &endpoint,
                vec![CookieSnapshot::persistent("sid", "abc", "chat.example.com", i64::MAX)],
                0,
            )
            .expect("save cookie");

        let client = ChatApiClient::new(ChatApiConfig::new("https://chat.example.com"))
            .expect("client")
            .with_cookie_store(cookies);
        let mut payload = ChatRequest::new("hi", "local-user-1", "local-assistant-1")
            .with_client_session_id(Some("client-1".to_owned()));
        payload.stream = false;

        let request = client
            .build_request(&payload)
            .expect("request builder")
            .build()
            .expect("request");

        assert_eq!(request.url().as_str(), endpoint.as_str());
        assert_eq!(request.headers()["cookie"], "sid=abc");
        assert_eq!(request.headers()["x-client-session-id"], "client-1");
        assert_eq!(request.headers()["accept"], "text/event-stream");

        let body = request
            .body()
            .and_then(|body| body.as_bytes())
            .expect("buffered body");
        let value: serde_json::Value = serde_json::from_slice(body).expect("json body");
        assert_eq!(value["stream"], true);
        assert_eq!(value["clientAssistantMessageId"], "local-assistant-1");
    }

    #[test]
    fn build_request_rejects_invalid_payload() {
        let client = ChatApiClient::new(ChatApiConfig::new("https://chat.example.com"))
            .expect("client");
        let result = client.build_request(&ChatRequest::new("hi", "same", "same"));

        assert!(matches!(result, Err(ChatApiError::InvalidRequest(_))));
    }

    #[test]
    fn new_rejects_non_http_base() {
        let result = ChatApiClient::new(ChatApiConfig::new("ftp://chat.example.com"));
        assert!(matches!(result, Err(ChatApiError::InvalidBaseUrl(_))));
    }
}
