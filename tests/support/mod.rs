#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chat_sync::chat_api::{
    ChatEventSender, ChatEventStream, ChatRequest, ChatStreamClient, ChatStreamEvent,
};
use chat_sync::chat_store::{MessageCache, SessionStateStore};
use chat_sync::logging::init_test_logging;
use chat_sync::{
    AccessFlags, ChatOrchestrator, ContentAccessGate, DefaultErrorMessages, SendState,
};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

/// Hands every opened exchange to the test, which plays the server side.
pub struct ScriptedClient {
    exchanges: mpsc::UnboundedSender<Exchange>,
}

pub struct Exchange {
    pub request: ChatRequest,
    pub sender: ChatEventSender,
}

impl Exchange {
    pub async fn emit(&self, event: ChatStreamEvent) -> bool {
        self.sender.send(event).await
    }

    pub async fn delta(&self, text: &str) -> bool {
        self.emit(ChatStreamEvent::ContentDelta {
            text: text.to_owned(),
        })
        .await
    }

    pub async fn ack(&self, client_message_id: &str, server_message_id: &str) -> bool {
        self.emit(ChatStreamEvent::MessageAck {
            client_message_id: client_message_id.to_owned(),
            server_message_id: server_message_id.to_owned(),
        })
        .await
    }

    pub async fn session(&self, session_id: &str) -> bool {
        self.emit(ChatStreamEvent::SessionAssigned {
            server_id: None,
            session_id: session_id.to_owned(),
        })
        .await
    }

    pub async fn done(&self) -> bool {
        self.emit(ChatStreamEvent::Done).await
    }
}

impl ChatStreamClient for ScriptedClient {
    fn send_message(&self, request: ChatRequest) -> ChatEventStream {
        let (sender, stream) = ChatEventStream::channel(16);
        let _ = self.exchanges.send(Exchange { request, sender });
        stream
    }
}

pub struct Harness {
    pub orchestrator: Arc<ChatOrchestrator>,
    pub session: Arc<SessionStateStore>,
    pub messages: Arc<MessageCache>,
    exchanges: mpsc::UnboundedReceiver<Exchange>,
}

impl Harness {
    pub fn in_memory() -> Self {
        Self::with_stores(
            Arc::new(SessionStateStore::in_memory()),
            MessageCache::in_memory(),
        )
    }

    pub fn with_stores(session: Arc<SessionStateStore>, messages: Arc<MessageCache>) -> Self {
        init_test_logging();
        let (tx, exchanges) = mpsc::unbounded_channel();
        let orchestrator = ChatOrchestrator::new(
            Arc::new(ScriptedClient { exchanges: tx }),
            Arc::clone(&session),
            Arc::clone(&messages),
            Arc::new(DefaultErrorMessages),
            ContentAccessGate::new(AccessFlags::unrestricted()),
        );
        Self {
            orchestrator,
            session,
            messages,
            exchanges,
        }
    }

    /// The next exchange opened by the orchestrator.
    pub async fn next_exchange(&mut self) -> Exchange {
        timeout(WAIT, self.exchanges.recv())
            .await
            .expect("an exchange should be opened")
            .expect("scripted client is alive")
    }

    pub fn session_key(&self) -> String {
        self.session
            .client_session_id()
            .expect("client session id is assigned")
    }
}

/// Waits until the state channel reports a value matching `accept`.
pub async fn wait_for_state(
    receiver: &mut watch::Receiver<SendState>,
    accept: impl Fn(&SendState) -> bool,
) -> SendState {
    timeout(WAIT, receiver.wait_for(|state| accept(state)))
        .await
        .expect("state should be reached")
        .expect("state channel is open")
        .clone()
}
