use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use chat_api::{
    ChatApiClient, ChatApiConfig, ChatEventStream, ChatRequest, ChatStreamClient, ChatStreamEvent,
    StreamFailure,
};
use chat_store::{store_paths, CookiePersistence};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use url::Url;

#[derive(Clone)]
struct ResponseChunk {
    delay_ms: u64,
    bytes: Vec<u8>,
}

#[derive(Clone)]
struct ScriptedResponse {
    status: u16,
    content_type: &'static str,
    set_cookies: Vec<&'static str>,
    chunks: Vec<ResponseChunk>,
}

struct ScriptedServer {
    base_url: String,
    request_count: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl ScriptedServer {
    async fn new(scripts: Vec<ScriptedResponse>) -> Self {
        let scripts = Arc::new(scripts);
        let request_count = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("local TCP listener should bind");
        let addr = listener
            .local_addr()
            .expect("resolved local listener address");
        let base_url = format!("http://{addr}");

        let handle = tokio::spawn({
            let scripts = Arc::clone(&scripts);
            let request_count = Arc::clone(&request_count);
            let requests = Arc::clone(&requests);

            async move {
                loop {
                    let (socket, _) = match listener.accept().await {
                        Ok(pair) => pair,
                        Err(_) => break,
                    };
                    let scripts = Arc::clone(&scripts);
                    let request_count = Arc::clone(&request_count);
                    let requests = Arc::clone(&requests);
                    tokio::spawn(async move {
                        serve_one(socket, scripts, request_count, requests).await;
                    });
                }
            }
        });

        Self {
            base_url,
            request_count,
            requests,
            handle,
        }
    }

    fn url(&self) -> Url {
        Url::parse(&self.base_url).expect("server url")
    }

    fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Acquire)
    }

    /// Lowercased request heads in arrival order.
    fn request_heads(&self) -> Vec<String> {
        self.requests.lock().expect("request log").clone()
    }

    fn shutdown(&self) {
        self.handle.abort();
    }
}

fn response_sse(status: u16, frames: &[&str]) -> ScriptedResponse {
    ScriptedResponse {
        status,
        content_type: "text/event-stream",
        set_cookies: Vec::new(),
        chunks: vec![ResponseChunk {
            delay_ms: 0,
            bytes: sse_frames(frames),
        }],
    }
}

fn response_json(status: u16, body: &str) -> ScriptedResponse {
    ScriptedResponse {
        status,
        content_type: "application/json",
        set_cookies: Vec::new(),
        chunks: vec![ResponseChunk {
            delay_ms: 0,
            bytes: body.as_bytes().to_vec(),
        }],
    }
}

fn sse_frames(frames: &[&str]) -> Vec<u8> {
    let mut body = String::new();

    for frame in frames {
        body.push_str("data: ");
        body.push_str(frame);
        body.push_str("\n\n");
    }

    body.into_bytes()
}

fn request() -> ChatRequest {
    ChatRequest::new("hello there", "local-user-1", "local-assistant-1")
        .with_client_session_id(Some("client-session-1".to_owned()))
}

async fn collect(mut stream: ChatEventStream) -> Vec<ChatStreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("stream should not stall")
    {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn stream_integration_successful_exchange() {
    let server = ScriptedServer::new(vec![response_sse(
        200,
        &[
            r#"{"type":"session","sessionId":"srv-session-1"}"#,
            r#"{"type":"ack","clientMessageId":"local-user-1","serverMessageId":"srv-user-1"}"#,
            r#"{"type":"delta","content":"Hi"}"#,
            r#"{"type":"delta","content":" you"}"#,
            r#"{"type":"ack","clientMessageId":"local-assistant-1","serverMessageId":"srv-assistant-1"}"#,
            r#"{"type":"done"}"#,
        ],
    )])
    .await;

    let client = ChatApiClient::new(ChatApiConfig::new(&server.base_url)).expect("client");
    let events = collect(client.send_message(request())).await;

    assert_eq!(
        events,
        vec![
            ChatStreamEvent::SessionAssigned {
                server_id: None,
                session_id: "srv-session-1".to_owned(),
            },
            ChatStreamEvent::MessageAck {
                client_message_id: "local-user-1".to_owned(),
                server_message_id: "srv-user-1".to_owned(),
            },
            ChatStreamEvent::ContentDelta {
                text: "Hi".to_owned(),
            },
            ChatStreamEvent::ContentDelta {
                text: " you".to_owned(),
            },
            ChatStreamEvent::MessageAck {
                client_message_id: "local-assistant-1".to_owned(),
                server_message_id: "srv-assistant-1".to_owned(),
            },
            ChatStreamEvent::Done,
        ]
    );

    let heads = server.request_heads();
    assert_eq!(heads.len(), 1);
    assert!(heads[0].starts_with("post /v1/chat/completions "));
    assert!(heads[0].contains("accept: text/event-stream"));
    assert!(heads[0].contains("x-client-session-id: client-session-1"));
    assert!(!heads[0].contains("\r\ncookie:"));

    server.shutdown();
}

#[tokio::test]
async fn stream_integration_decodes_api_error_body() {
    let server = ScriptedServer::new(vec![response_json(
        400,
        r#"{"code":123,"errorCode":"INSUFFICIENT_BALANCE","message":"top up"}"#,
    )])
    .await;

    let client = ChatApiClient::new(ChatApiConfig::new(&server.base_url)).expect("client");
    let events = collect(client.send_message(request())).await;

    assert_eq!(
        events,
        vec![ChatStreamEvent::Error {
            failure: StreamFailure::Api {
                http_status: Some(400),
                api_code: Some(123),
                error_detail_code: Some("INSUFFICIENT_BALANCE".to_owned()),
                message: Some("top up".to_owned()),
            },
        }]
    );
    assert_eq!(server.request_count(), 1, "client never auto-retries");

    server.shutdown();
}

#[tokio::test]
async fn stream_integration_transient_status_is_not_retried() {
    let server = ScriptedServer::new(vec![
        response_json(503, "upstream overloaded"),
        response_sse(200, &[r#"{"type":"done"}"#]),
    ])
    .await;

    let client = ChatApiClient::new(ChatApiConfig::new(&server.base_url)).expect("client");
    let events = collect(client.send_message(request())).await;

    let [ChatStreamEvent::Error { failure }] = events.as_slice() else {
        panic!("expected a single error event, got {events:?}");
    };
    assert!(failure.is_transient());
    assert_eq!(server.request_count(), 1);

    server.shutdown();
}

#[tokio::test]
async fn stream_integration_reports_early_end_as_protocol_failure() {
    let server = ScriptedServer::new(vec![response_sse(
        200,
        &[r#"{"type":"delta","content":"partial"}"#],
    )])
    .await;

    let client = ChatApiClient::new(ChatApiConfig::new(&server.base_url)).expect("client");
    let events = collect(client.send_message(request())).await;

    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], ChatStreamEvent::ContentDelta { .. }));
    assert!(matches!(
        events[1],
        ChatStreamEvent::Error {
            failure: StreamFailure::Protocol { .. }
        }
    ));

    server.shutdown();
}

#[tokio::test]
async fn stream_integration_malformed_frame_fails_exchange() {
    let server = ScriptedServer::new(vec![response_sse(
        200,
        &[
            r#"{"type":"delta","content":"a"}"#,
            r#"{"type":"delta"}"#,
            r#"{"type":"done"}"#,
        ],
    )])
    .await;

    let client = ChatApiClient::new(ChatApiConfig::new(&server.base_url)).expect("client");
    let events = collect(client.send_message(request())).await;

    assert_eq!(events.len(), 2);
    assert!(matches!(
        events[1],
        ChatStreamEvent::Error {
            failure: StreamFailure::Protocol { .. }
        }
    ));

    server.shutdown();
}

#[tokio::test]
async fn stream_integration_cancel_closes_exchange_promptly() {
    let server = ScriptedServer::new(vec![ScriptedResponse {
        status: 200,
        content_type: "text/event-stream",
        set_cookies: Vec::new(),
        chunks: vec![
            ResponseChunk {
                delay_ms: 0,
                bytes: sse_frames(&[r#"{"type":"delta","content":"first"}"#]),
            },
            ResponseChunk {
                delay_ms: 3_000,
                bytes: sse_frames(&[r#"{"type":"done"}"#]),
            },
        ],
    }])
    .await;

    let client = ChatApiClient::new(ChatApiConfig::new(&server.base_url)).expect("client");
    let mut stream = client.send_message(request());

    let first = timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("first delta should arrive");
    assert!(matches!(first, Some(ChatStreamEvent::ContentDelta { .. })));

    stream.cancel();
    let after = timeout(Duration::from_millis(500), stream.next())
        .await
        .expect("cancelled stream should end immediately");
    assert_eq!(after, None);
    assert!(stream.is_cancelled());

    server.shutdown();
}

#[tokio::test]
async fn stream_integration_persists_cookies_and_sends_them_back() {
    let temp = tempfile::tempdir().expect("temp dir");
    let paths = store_paths(temp.path());
    let store = Arc::new(CookiePersistence::open(&paths.cookies).expect("cookie store"));

    let mut first = response_sse(200, &[r#"{"type":"done"}"#]);
    first.set_cookies = vec!["sid=abc; Max-Age=3600; Path=/", "scratch=1; Path=/"];
    let server = ScriptedServer::new(vec![
        first,
        response_sse(200, &[r#"{"type":"done"}"#]),
        response_sse(200, &[r#"{"type":"done"}"#]),
    ])
    .await;

    let client = ChatApiClient::new(ChatApiConfig::new(&server.base_url))
        .expect("client")
        .with_cookie_store(Arc::clone(&store));
    assert_eq!(
        collect(client.send_message(request())).await,
        vec![ChatStreamEvent::Done]
    );
    assert_eq!(
        collect(client.send_message(request())).await,
        vec![ChatStreamEvent::Done]
    );

    let heads = server.request_heads();
    assert_eq!(heads.len(), 2);
    assert!(!heads[0].contains("\r\ncookie:"));
    assert!(heads[1].contains("\r\ncookie: sid=abc\r\n"));

    // A response without cookies leaves the stored set alone.
    let reopened = CookiePersistence::open(&paths.cookies).expect("reopen cookie store");
    let names = reopened
        .load_for_request(&server.url())
        .into_iter()
        .map(|cookie| cookie.name)
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["sid".to_owned()]);

    let fresh = ChatApiClient::new(ChatApiConfig::new(&server.base_url))
        .expect("client")
        .with_cookie_store(Arc::new(reopened));
    collect(fresh.send_message(request())).await;
    let heads = server.request_heads();
    assert!(heads[2].contains("\r\ncookie: sid=abc\r\n"));

    server.shutdown();
}

#[tokio::test]
async fn cookies_scoped_to_another_domain_are_not_stored() {
    let temp = tempfile::tempdir().expect("temp dir");
    let store = Arc::new(
        CookiePersistence::open(&store_paths(temp.path()).cookies).expect("cookie store"),
    );

    let mut response = response_sse(200, &[r#"{"type":"done"}"#]);
    response.set_cookies = vec![
        "sid=abc; Max-Age=3600; Path=/",
        "track=1; Max-Age=3600; Domain=tracker.test; Path=/",
    ];
    let server = ScriptedServer::new(vec![response]).await;

    let client = ChatApiClient::new(ChatApiConfig::new(&server.base_url))
        .expect("client")
        .with_cookie_store(Arc::clone(&store));
    assert_eq!(
        collect(client.send_message(request())).await,
        vec![ChatStreamEvent::Done]
    );

    let names = store
        .load_for_request(&server.url())
        .into_iter()
        .map(|cookie| cookie.name)
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["sid".to_owned()]);
    let foreign = Url::parse("http://tracker.test/").expect("url");
    assert!(store.load_for_request(&foreign).is_empty());

    server.shutdown();
}

async fn serve_one(
    mut socket: TcpStream,
    scripts: Arc<Vec<ScriptedResponse>>,
    request_count: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
) {
    let Ok(head) = read_request_headers(&mut socket).await else {
        return;
    };

    let index = request_count.fetch_add(1, Ordering::AcqRel);
    requests
        .lock()
        .expect("request log")
        .push(head.to_ascii_lowercase());
    let response = scripts
        .get(index)
        .cloned()
        .unwrap_or_else(|| response_json(500, r#"{"error":"unexpected request"}"#));

    let mut headers = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n",
        response.status,
        status_reason(response.status),
        response.content_type,
    );
    for cookie in &response.set_cookies {
        headers.push_str(&format!("Set-Cookie: {cookie}\r\n"));
    }
    headers.push_str("\r\n");

    if socket.write_all(headers.as_bytes()).await.is_err() {
        return;
    }

    for chunk in response.chunks {
        if chunk.delay_ms > 0 {
            sleep(Duration::from_millis(chunk.delay_ms)).await;
        }
        let prefix = format!("{:X}\r\n", chunk.bytes.len());
        if socket.write_all(prefix.as_bytes()).await.is_err() {
            return;
        }
        if socket.write_all(&chunk.bytes).await.is_err() {
            return;
        }
        if socket.write_all(b"\r\n").await.is_err() {
            return;
        }
    }

    let _ = socket.write_all(b"0\r\n\r\n").await;
    let _ = socket.shutdown().await;
}

async fn read_request_headers(socket: &mut TcpStream) -> std::io::Result<String> {
    let mut request = Vec::new();
    let mut buffer = [0_u8; 2048];

    loop {
        let n = socket.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        request.extend_from_slice(&buffer[..n]);
        if request.windows(4).any(|window| window == b"\r\n\r\n") {
            break;
        }
    }

    let text = String::from_utf8_lossy(&request);
    let head = text.split("\r\n\r\n").next().unwrap_or_default();
    Ok(format!("{head}\r\n"))
}

fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
