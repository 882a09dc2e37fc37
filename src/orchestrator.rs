//! Single-flight send lifecycle over the message cache and the streaming client.
//!
//! Each send is an attempt tagged with a monotonically increasing epoch. The
//! active attempt lives in one slot guarded by a mutex; every cache mutation
//! made on behalf of an attempt re-checks the slot under that mutex, so late
//! events from a cancelled or superseded attempt never reach the cache.
//! Whoever takes the attempt out of the slot (the driver on a terminal event,
//! a cancel, or a session clear) finalizes it and reports its outcome.
//!
//! Store writes run synchronously while the slot mutex is held. A row left
//! streaming by an earlier process is settled on construction and again
//! before each new attempt.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chat_api::{ChatEventStream, ChatRequest, ChatStreamClient, ChatStreamEvent, StreamFailure};
use chat_store::{now_ms, ChatMessage, MessageCache, MessageSubscription, Role, SessionStateStore};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::access::{AccessDecision, ContentAccessGate};
use crate::error::ChatError;
use crate::error_message::ErrorMessageMapper;

pub type Epoch = u64;

const NETWORK_FALLBACK: &str = "network error, check your connection";
const PROTOCOL_FALLBACK: &str = "unexpected response from server";
const INTERRUPTED_FALLBACK: &str = "reply was interrupted";

/// Observable state of the current or most recent attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendState {
    /// No attempt in flight; `epoch` is the last finished one (0 before any).
    Idle { epoch: Epoch },
    /// Optimistic rows written, waiting for the first frame.
    Pending { epoch: Epoch },
    Streaming { epoch: Epoch },
    Finalizing { epoch: Epoch },
    /// The attempt failed; `message` is the text shown on the placeholder.
    Failed { epoch: Epoch, message: String },
}

impl SendState {
    pub fn epoch(&self) -> Epoch {
        match self {
            Self::Idle { epoch }
            | Self::Pending { epoch }
            | Self::Streaming { epoch }
            | Self::Finalizing { epoch }
            | Self::Failed { epoch, .. } => *epoch,
        }
    }

    /// True while an attempt holds the single send slot.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Pending { .. } | Self::Streaming { .. } | Self::Finalizing { .. }
        )
    }
}

#[derive(Debug)]
pub enum SendOutcome {
    Completed {
        epoch: Epoch,
        assistant_message_id: String,
        server_message_id: Option<String>,
    },
    Failed {
        epoch: Epoch,
        error: ChatError,
    },
    /// Stopped through [`ChatOrchestrator::cancel_active_send`].
    Cancelled { epoch: Epoch },
    /// Displaced by a local session clear.
    Superseded { epoch: Epoch },
}

impl SendOutcome {
    pub fn epoch(&self) -> Epoch {
        match self {
            Self::Completed { epoch, .. }
            | Self::Failed { epoch, .. }
            | Self::Cancelled { epoch }
            | Self::Superseded { epoch } => *epoch,
        }
    }
}

/// Returned by a started send; resolves once the attempt is finalized.
#[derive(Debug)]
pub struct SendHandle {
    epoch: Epoch,
    user_message_id: String,
    assistant_message_id: String,
    outcome: oneshot::Receiver<SendOutcome>,
}

impl SendHandle {
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn user_message_id(&self) -> &str {
        &self.user_message_id
    }

    pub fn assistant_message_id(&self) -> &str {
        &self.assistant_message_id
    }

    pub async fn wait(self) -> SendOutcome {
        let epoch = self.epoch;
        self.outcome
            .await
            .unwrap_or(SendOutcome::Cancelled { epoch })
    }
}

#[derive(Debug, Clone)]
struct Attempt {
    epoch: Epoch,
    session_key: String,
    user_message_id: String,
    assistant_message_id: String,
}

struct ActiveSend {
    attempt: Attempt,
    outcome: Option<oneshot::Sender<SendOutcome>>,
    driver: Option<JoinHandle<()>>,
}

impl ActiveSend {
    fn report(&mut self, outcome: SendOutcome) {
        if let Some(sender) = self.outcome.take() {
            let _ = sender.send(outcome);
        }
    }

    fn abort_driver(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

/// Frames that only take effect when the attempt completes.
#[derive(Debug, Default)]
struct Progress {
    streaming: bool,
    session_id: Option<String>,
    assistant_server_id: Option<String>,
}

pub struct ChatOrchestrator {
    client: Arc<dyn ChatStreamClient>,
    session: Arc<SessionStateStore>,
    messages: Arc<MessageCache>,
    errors: Arc<dyn ErrorMessageMapper>,
    gate: Mutex<ContentAccessGate>,
    conversation_nsfw: AtomicBool,
    next_epoch: AtomicU64,
    active: Mutex<Option<ActiveSend>>,
    state: watch::Sender<SendState>,
}

impl ChatOrchestrator {
    pub fn new(
        client: Arc<dyn ChatStreamClient>,
        session: Arc<SessionStateStore>,
        messages: Arc<MessageCache>,
        errors: Arc<dyn ErrorMessageMapper>,
        gate: ContentAccessGate,
    ) -> Arc<Self> {
        let orchestrator = Arc::new(Self {
            client,
            session,
            messages,
            errors,
            gate: Mutex::new(gate),
            conversation_nsfw: AtomicBool::new(false),
            next_epoch: AtomicU64::new(1),
            active: Mutex::new(None),
            state: watch::channel(SendState::Idle { epoch: 0 }).0,
        });
        if let Err(error) = orchestrator.recover_interrupted() {
            warn!(%error, "failed to settle interrupted placeholders");
        }
        orchestrator
    }

    pub fn session(&self) -> &Arc<SessionStateStore> {
        &self.session
    }

    pub fn messages(&self) -> &Arc<MessageCache> {
        &self.messages
    }

    pub fn state(&self) -> SendState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SendState> {
        self.state.subscribe()
    }

    pub fn set_access_gate(&self, gate: ContentAccessGate) {
        *lock_unpoisoned(&self.gate) = gate;
    }

    /// Marks the current conversation as nsfw for access decisions.
    pub fn set_conversation_nsfw(&self, is_nsfw: bool) {
        self.conversation_nsfw.store(is_nsfw, Ordering::Release);
    }

    /// Fresh client-side message id.
    pub fn mint_message_id(&self) -> String {
        format!("local-{}", Uuid::new_v4())
    }

    /// Live view of the current session's messages. Assigns the client
    /// session id if none exists yet.
    pub fn observe_messages(&self) -> Result<MessageSubscription, ChatError> {
        let session_key = self.ensure_client_session_id()?;
        Ok(self.messages.observe(session_key))
    }

    /// Starts a send: writes the user row and an empty streaming placeholder,
    /// then streams the reply into the placeholder.
    pub async fn send_message(
        self: &Arc<Self>,
        text: &str,
        client_message_id: &str,
        client_assistant_message_id: &str,
    ) -> Result<SendHandle, ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        validate_ids(client_message_id, client_assistant_message_id)?;
        self.check_access()?;

        let mut active = self.lock_active();
        if active.is_some() {
            return Err(ChatError::Busy);
        }
        self.settle_orphans(&active)?;
        for id in [client_message_id, client_assistant_message_id] {
            if self.messages.get(id).is_some() {
                return Err(ChatError::DuplicateMessageId(id.to_owned()));
            }
        }

        let session_key = self.ensure_client_session_id()?;
        let created_at_ms = now_ms();
        self.messages.upsert(ChatMessage::user(
            client_message_id,
            session_key.as_str(),
            text,
            created_at_ms,
        ))?;

        self.start_attempt(
            &mut active,
            session_key,
            text.to_owned(),
            client_message_id,
            client_assistant_message_id,
            created_at_ms,
        )
    }

    /// Re-sends an existing user message under a new assistant placeholder.
    /// The user row is left as it is.
    pub async fn retry_send(
        self: &Arc<Self>,
        client_message_id: &str,
        new_client_assistant_message_id: &str,
    ) -> Result<SendHandle, ChatError> {
        validate_ids(client_message_id, new_client_assistant_message_id)?;
        self.check_access()?;

        let mut active = self.lock_active();
        if active.is_some() {
            return Err(ChatError::Busy);
        }
        self.settle_orphans(&active)?;

        let user_message = self
            .messages
            .get(client_message_id)
            .filter(|message| message.role == Role::User)
            .ok_or_else(|| ChatError::UnknownMessage(client_message_id.to_owned()))?;
        if self.messages.get(new_client_assistant_message_id).is_some() {
            return Err(ChatError::DuplicateMessageId(
                new_client_assistant_message_id.to_owned(),
            ));
        }

        let session_key = self.ensure_client_session_id()?;
        if user_message.session_id != session_key {
            return Err(ChatError::UnknownMessage(client_message_id.to_owned()));
        }

        info!(client_message_id, "retrying send");
        self.start_attempt(
            &mut active,
            session_key,
            user_message.content,
            client_message_id,
            new_client_assistant_message_id,
            now_ms(),
        )
    }

    /// Settles placeholders left streaming by an attempt that can no longer
    /// finish, such as one cut off by a restart. Returns how many were settled.
    pub fn recover_interrupted(&self) -> Result<usize, ChatError> {
        let active = self.lock_active();
        self.settle_orphans(&active)
    }

    /// Stops the active attempt. The placeholder keeps whatever content has
    /// arrived and stops streaming. Returns false when nothing was in flight.
    pub fn cancel_active_send(&self) -> bool {
        let mut active = self.lock_active();
        let Some(mut send) = active.take() else {
            return false;
        };
        send.abort_driver();

        let epoch = send.attempt.epoch;
        if let Err(error) = self.settle_placeholder(&send.attempt, None, None) {
            warn!(%error, epoch, "failed to settle cancelled placeholder");
        }
        self.set_state(SendState::Idle { epoch });
        info!(epoch, "send cancelled");
        send.report(SendOutcome::Cancelled { epoch });
        true
    }

    /// Deletes the current session's messages and its identity. A send in
    /// flight is stopped first. Calling it again is a no-op.
    pub fn clear_local_session(&self) -> Result<(), ChatError> {
        let mut active = self.lock_active();
        let mut displaced = active.take();
        let last_epoch = match displaced.as_mut() {
            Some(send) => {
                send.abort_driver();
                if let Err(error) = self.settle_placeholder(&send.attempt, None, None) {
                    warn!(%error, epoch = send.attempt.epoch, "failed to settle displaced placeholder");
                }
                send.attempt.epoch
            }
            None => self.state().epoch(),
        };

        let result = self.clear_stores();
        self.set_state(SendState::Idle { epoch: last_epoch });
        if let Some(mut send) = displaced {
            let epoch = send.attempt.epoch;
            send.report(SendOutcome::Superseded { epoch });
        }
        drop(active);

        match &result {
            Ok(()) => info!("local session cleared"),
            Err(error) => warn!(%error, "local session clear failed"),
        }
        result
    }

    fn clear_stores(&self) -> Result<(), ChatError> {
        if let Some(session_key) = self.session.client_session_id() {
            let removed = self.messages.delete_all(&session_key)?;
            debug!(session_key, removed, "removed session messages");
            self.session
                .clear()
                .map_err(|source| ChatError::PartialClear {
                    stage: "session",
                    source,
                })
        } else {
            self.session.clear().map_err(ChatError::from)
        }
    }

    /// Every streaming row other than the active placeholder is orphaned.
    fn settle_orphans(&self, active: &Option<ActiveSend>) -> Result<usize, ChatError> {
        let in_flight = active
            .as_ref()
            .map(|send| send.attempt.assistant_message_id.as_str());
        let orphans = self
            .messages
            .streaming_rows()
            .into_iter()
            .filter(|row| Some(row.id.as_str()) != in_flight)
            .collect::<Vec<_>>();
        if orphans.is_empty() {
            return Ok(0);
        }

        let message = self
            .errors
            .to_user_message(None, None, None, Some(INTERRUPTED_FALLBACK));
        let settled = orphans.len();
        for mut row in orphans {
            debug!(id = %row.id, "settling interrupted placeholder");
            row.is_streaming = false;
            row.error.get_or_insert_with(|| message.clone());
            self.messages.upsert(row)?;
        }
        warn!(settled, "settled interrupted placeholders");
        Ok(settled)
    }

    fn start_attempt(
        self: &Arc<Self>,
        active: &mut Option<ActiveSend>,
        session_key: String,
        text: String,
        client_message_id: &str,
        client_assistant_message_id: &str,
        created_at_ms: i64,
    ) -> Result<SendHandle, ChatError> {
        self.messages.upsert(ChatMessage::placeholder(
            client_assistant_message_id,
            session_key.as_str(),
            created_at_ms,
        ))?;

        let epoch = self.next_epoch.fetch_add(1, Ordering::SeqCst);
        let attempt = Attempt {
            epoch,
            session_key,
            user_message_id: client_message_id.to_owned(),
            assistant_message_id: client_assistant_message_id.to_owned(),
        };
        self.set_state(SendState::Pending { epoch });

        let request = ChatRequest::new(text, client_message_id, client_assistant_message_id)
            .with_session_id(self.session.session_id())
            .with_client_session_id(Some(attempt.session_key.clone()));
        let stream = self.client.send_message(request);

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let driver = tokio::spawn(Arc::clone(self).drive(attempt.clone(), stream));
        *active = Some(ActiveSend {
            attempt: attempt.clone(),
            outcome: Some(outcome_tx),
            driver: Some(driver),
        });
        info!(
            epoch,
            client_message_id, client_assistant_message_id, "send started"
        );

        Ok(SendHandle {
            epoch,
            user_message_id: attempt.user_message_id,
            assistant_message_id: attempt.assistant_message_id,
            outcome: outcome_rx,
        })
    }

    async fn drive(self: Arc<Self>, attempt: Attempt, mut stream: ChatEventStream) {
        let mut progress = Progress::default();
        loop {
            let keep_going = match stream.next().await {
                Some(event) => self.apply_event(&attempt, &mut progress, event),
                None => {
                    let failure = StreamFailure::protocol("stream ended before a terminal frame");
                    self.apply_event(&attempt, &mut progress, ChatStreamEvent::Error { failure })
                }
            };
            if !keep_going {
                return;
            }
        }
    }

    /// Applies one event of `attempt`. Returns false once the attempt is over
    /// or no longer the active one.
    fn apply_event(
        &self,
        attempt: &Attempt,
        progress: &mut Progress,
        event: ChatStreamEvent,
    ) -> bool {
        let mut active = self.lock_active();
        let is_current = active
            .as_ref()
            .is_some_and(|send| send.attempt.epoch == attempt.epoch);
        if !is_current {
            debug!(epoch = attempt.epoch, ?event, "discarding event from stale attempt");
            return false;
        }

        if !progress.streaming && !event.is_terminal() {
            progress.streaming = true;
            self.set_state(SendState::Streaming {
                epoch: attempt.epoch,
            });
        }

        let applied = match event {
            ChatStreamEvent::ContentDelta { text } => self.append_delta(attempt, &text),
            ChatStreamEvent::SessionAssigned {
                server_id,
                session_id,
            } => {
                debug!(epoch = attempt.epoch, session_id, ?server_id, "session assigned");
                progress.session_id = Some(session_id);
                Ok(())
            }
            ChatStreamEvent::MessageAck {
                client_message_id,
                server_message_id,
            } => self.apply_ack(attempt, progress, &client_message_id, server_message_id),
            ChatStreamEvent::Done => {
                self.complete(&mut active, attempt, progress);
                return false;
            }
            ChatStreamEvent::Error { failure } => {
                self.fail(&mut active, attempt, ChatError::from(failure));
                return false;
            }
        };

        match applied {
            Ok(()) => true,
            Err(error) => {
                self.fail(&mut active, attempt, error);
                false
            }
        }
    }

    fn append_delta(&self, attempt: &Attempt, text: &str) -> Result<(), ChatError> {
        let mut placeholder = self.placeholder(attempt)?;
        placeholder.content.push_str(text);
        self.messages.upsert(placeholder)?;
        Ok(())
    }

    fn apply_ack(
        &self,
        attempt: &Attempt,
        progress: &mut Progress,
        client_message_id: &str,
        server_message_id: String,
    ) -> Result<(), ChatError> {
        if client_message_id == attempt.assistant_message_id {
            progress.assistant_server_id = Some(server_message_id);
            return Ok(());
        }
        if client_message_id != attempt.user_message_id {
            debug!(
                epoch = attempt.epoch,
                client_message_id, "ignoring ack for a message outside this attempt"
            );
            return Ok(());
        }

        let Some(mut user_message) = self.messages.get(client_message_id) else {
            return Ok(());
        };
        user_message.server_id = Some(server_message_id);
        self.messages.upsert(user_message)?;
        Ok(())
    }

    fn complete(&self, active: &mut Option<ActiveSend>, attempt: &Attempt, progress: &mut Progress) {
        let epoch = attempt.epoch;
        self.set_state(SendState::Finalizing { epoch });

        let server_message_id = progress.assistant_server_id.take();
        let committed = self
            .settle_placeholder(attempt, server_message_id.clone(), None)
            .and_then(|()| {
                self.session
                    .advance(progress.session_id.as_deref(), now_ms())
                    .map_err(ChatError::from)
            });
        if let Err(error) = committed {
            self.fail(active, attempt, error);
            return;
        }

        self.set_state(SendState::Idle { epoch });
        info!(epoch, "send completed");
        if let Some(mut send) = active.take() {
            send.report(SendOutcome::Completed {
                epoch,
                assistant_message_id: attempt.assistant_message_id.clone(),
                server_message_id,
            });
        }
    }

    fn fail(&self, active: &mut Option<ActiveSend>, attempt: &Attempt, error: ChatError) {
        let epoch = attempt.epoch;
        let message = self.user_message_for(&error);
        if let Err(store_error) = self.settle_placeholder(attempt, None, Some(message.clone())) {
            warn!(%store_error, epoch, "failed to mark placeholder as failed");
        }

        warn!(%error, epoch, "send failed");
        self.set_state(SendState::Failed { epoch, message });
        if let Some(mut send) = active.take() {
            send.report(SendOutcome::Failed { epoch, error });
        }
    }

    /// Stops the placeholder streaming, optionally attaching a server id or
    /// an error text.
    fn settle_placeholder(
        &self,
        attempt: &Attempt,
        server_id: Option<String>,
        error: Option<String>,
    ) -> Result<(), ChatError> {
        let mut placeholder = self.placeholder(attempt)?;
        placeholder.is_streaming = false;
        if server_id.is_some() {
            placeholder.server_id = server_id;
        }
        placeholder.error = error;
        self.messages.upsert(placeholder)?;
        Ok(())
    }

    fn placeholder(&self, attempt: &Attempt) -> Result<ChatMessage, ChatError> {
        self.messages
            .get(&attempt.assistant_message_id)
            .ok_or_else(|| ChatError::UnknownMessage(attempt.assistant_message_id.clone()))
    }

    fn user_message_for(&self, error: &ChatError) -> String {
        match error {
            ChatError::Api {
                http_status,
                api_code,
                error_detail_code,
                message,
            } => self.errors.to_user_message(
                *http_status,
                *api_code,
                error_detail_code.as_deref(),
                message.as_deref(),
            ),
            ChatError::Network(_) => {
                self.errors
                    .to_user_message(None, None, None, Some(NETWORK_FALLBACK))
            }
            ChatError::Protocol(_) => {
                self.errors
                    .to_user_message(None, None, None, Some(PROTOCOL_FALLBACK))
            }
            _ => self.errors.to_user_message(None, None, None, None),
        }
    }

    fn check_access(&self) -> Result<(), ChatError> {
        let is_nsfw = self.conversation_nsfw.load(Ordering::Acquire);
        match lock_unpoisoned(&self.gate).decide(is_nsfw) {
            AccessDecision::Allowed => Ok(()),
            AccessDecision::Blocked(reason) => {
                info!(%reason, "send blocked by access policy");
                Err(ChatError::AccessBlocked(reason))
            }
        }
    }

    /// The cache partition key; generated once and kept until the session
    /// is cleared.
    fn ensure_client_session_id(&self) -> Result<String, ChatError> {
        if let Some(existing) = self.session.client_session_id() {
            return Ok(existing);
        }
        let generated = Uuid::new_v4().to_string();
        self.session.set_client_session_id(Some(&generated))?;
        info!(client_session_id = %generated, "assigned client session id");
        Ok(generated)
    }

    fn set_state(&self, next: SendState) {
        debug!(?next, "send state");
        self.state.send_replace(next);
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveSend>> {
        lock_unpoisoned(&self.active)
    }
}

fn validate_ids(client_message_id: &str, client_assistant_message_id: &str) -> Result<(), ChatError> {
    for id in [client_message_id, client_assistant_message_id] {
        if id.trim().is_empty() || id.trim() != id {
            return Err(ChatError::InvalidMessageId(id.to_owned()));
        }
    }
    if client_message_id == client_assistant_message_id {
        return Err(ChatError::DuplicateMessageId(
            client_assistant_message_id.to_owned(),
        ));
    }
    Ok(())
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
