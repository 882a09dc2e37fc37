use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::ChatStreamEvent;
use crate::payload::ChatRequest;

/// Cancellation flag shared between a stream handle and its producer.
pub type CancelSignal = Arc<AtomicBool>;

/// Opens streaming exchanges. Implemented by [`crate::ChatApiClient`] and by
/// scripted clients in tests.
pub trait ChatStreamClient: Send + Sync + 'static {
    fn send_message(&self, request: ChatRequest) -> ChatEventStream;
}

/// Finite, non-restartable sequence of events for one exchange.
///
/// Yields nothing after a terminal event, after [`ChatEventStream::cancel`],
/// or once the producer is gone. Dropping the handle cancels the exchange.
#[derive(Debug)]
pub struct ChatEventStream {
    receiver: mpsc::Receiver<ChatStreamEvent>,
    cancel: CancelSignal,
    task: Option<JoinHandle<()>>,
    finished: bool,
}

/// Producer half handed to whatever drives the exchange.
#[derive(Debug, Clone)]
pub struct ChatEventSender {
    sender: mpsc::Sender<ChatStreamEvent>,
    cancel: CancelSignal,
}

impl ChatEventStream {
    pub fn channel(capacity: usize) -> (ChatEventSender, Self) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let cancel: CancelSignal = Arc::new(AtomicBool::new(false));
        (
            ChatEventSender {
                sender,
                cancel: Arc::clone(&cancel),
            },
            Self {
                receiver,
                cancel,
                task: None,
                finished: false,
            },
        )
    }

    /// A stream that yields one event and ends; used when a request fails
    /// before any exchange starts.
    pub fn failed(event: ChatStreamEvent) -> Self {
        let (sender, stream) = Self::channel(1);
        // Capacity is one and the receiver is alive, so this cannot fail.
        let _ = sender.sender.try_send(event);
        stream
    }

    /// Ties the producer task's lifetime to this handle.
    pub fn attach_task(&mut self, task: JoinHandle<()>) {
        if self.is_cancelled() {
            task.abort();
        }
        self.task = Some(task);
    }

    pub async fn next(&mut self) -> Option<ChatStreamEvent> {
        if self.finished || self.is_cancelled() {
            return None;
        }
        match self.receiver.recv().await {
            Some(event) => {
                if event.is_terminal() {
                    self.finished = true;
                    self.receiver.close();
                }
                if self.is_cancelled() {
                    return None;
                }
                Some(event)
            }
            None => {
                self.finished = true;
                None
            }
        }
    }

    /// Stops the exchange. Events buffered but not yet taken are discarded.
    pub fn cancel(&mut self) {
        self.cancel.store(true, Ordering::Release);
        self.receiver.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        Arc::clone(&self.cancel)
    }
}

impl Drop for ChatEventStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl ChatEventSender {
    /// Returns false once the consumer cancelled or went away.
    pub async fn send(&self, event: ChatStreamEvent) -> bool {
        if self.is_cancelled() {
            return false;
        }
        self.sender.send(event).await.is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire) || self.sender.is_closed()
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        Arc::clone(&self.cancel)
    }
}
