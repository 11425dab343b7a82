//! Pull-based consumption of a streaming request.
//!
//! The correlator pushes responses into an unbounded FIFO; the consumer pulls from it and
//! suspends only while the queue is empty and the request is still open. Because the
//! terminal event is queued behind every message delivered before it, a failure is raised
//! only after all earlier messages have been yielded.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{
    sync::mpsc,
    time::{timeout_at, Instant},
};
use tracing::{debug, warn};

use crate::{
    correlator::{Correlator, Handler, ListenerGuard},
    domain::RequestId,
    errors::Error,
    model::types::ConversationMessage,
    protocol::{Response, ResponseKind},
    Result,
};

/// A lazy, finite, non-restartable sequence of conversation messages.
#[async_trait]
pub trait MessageSource: Send {
    /// `None` once the sequence has ended; an `Err` is always the last item.
    async fn next_message(&mut self) -> Option<Result<ConversationMessage>>;
}

#[derive(Debug)]
enum StreamEvent {
    Message(ConversationMessage),
    Result(Value),
    Failed(Error),
    Completed,
}

fn event_from_response(response: Response) -> StreamEvent {
    match response.kind {
        ResponseKind::Message => {
            let Some(payload) = response.payload else {
                return StreamEvent::Failed(Error::Protocol(
                    "message response without payload".to_string(),
                ));
            };
            match serde_json::from_value::<ConversationMessage>(payload) {
                Ok(m) => StreamEvent::Message(m),
                Err(e) => StreamEvent::Failed(Error::Protocol(format!(
                    "undecodable message payload: {e}"
                ))),
            }
        }
        ResponseKind::Result => StreamEvent::Result(response.payload.unwrap_or(Value::Null)),
        ResponseKind::Error => StreamEvent::Failed(match response.error {
            Some(e) => Error::from_wire(e),
            None => Error::Protocol("error response without error body".to_string()),
        }),
        ResponseKind::Complete => StreamEvent::Completed,
    }
}

/// Consumer side of one request id.
///
/// Dropping the stream (or calling [`MessageStream::cancel`]) releases the listener, so
/// abandoning a request early never leaks a registry entry.
pub struct MessageStream {
    id: RequestId,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    guard: Option<ListenerGuard>,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    result: Option<Value>,
    finished: bool,
}

impl MessageStream {
    /// Register a listener for `id` that feeds this stream.
    ///
    /// Must be called before the request is sent so no early response is missed.
    pub fn open(correlator: &Arc<Correlator>, id: RequestId, timeout: Option<Duration>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: Handler = Arc::new(move |response: Response| {
            // Receiver gone means the consumer stopped listening; nothing to do.
            let _ = tx.send(event_from_response(response));
        });
        let guard = correlator.register_scoped(id.clone(), handler);

        Self {
            id,
            rx,
            guard: Some(guard),
            deadline: timeout.map(|t| Instant::now() + t),
            timeout,
            result: None,
            finished: false,
        }
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Stop consuming and release the listener. Later responses for this id are dropped.
    pub fn cancel(&mut self) {
        if !self.finished {
            debug!(request_id = %self.id, "stream cancelled by consumer");
        }
        self.finish();
    }

    /// The `result` payload, once one has been received.
    pub fn take_result(&mut self) -> Option<Value> {
        self.result.take()
    }

    pub async fn next(&mut self) -> Option<Result<ConversationMessage>> {
        loop {
            if self.finished {
                return None;
            }

            let event = match self.deadline {
                Some(deadline) => match timeout_at(deadline, self.rx.recv()).await {
                    Ok(ev) => ev,
                    Err(_) => {
                        let waited = self.timeout.unwrap_or_default();
                        warn!(request_id = %self.id, ?waited, "request timed out");
                        self.finish();
                        return Some(Err(Error::Timeout(waited)));
                    }
                },
                None => self.rx.recv().await,
            };

            match event {
                Some(StreamEvent::Message(m)) => return Some(Ok(m)),
                Some(StreamEvent::Result(v)) => {
                    self.result = Some(v);
                }
                Some(StreamEvent::Failed(e)) => {
                    self.finish();
                    return Some(Err(e));
                }
                Some(StreamEvent::Completed) => {
                    self.finish();
                    return None;
                }
                None => {
                    // Listener released without a terminal event (explicit deregistration).
                    self.finish();
                    return None;
                }
            }
        }
    }

    /// Drain to the end and return every message, or the first failure.
    pub async fn collect(mut self) -> Result<(Vec<ConversationMessage>, Option<Value>)> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.push(item?);
        }
        Ok((out, self.result.take()))
    }

    fn finish(&mut self) {
        self.finished = true;
        self.guard = None;
        self.rx.close();
    }
}

#[async_trait]
impl MessageSource for MessageStream {
    async fn next_message(&mut self) -> Option<Result<ConversationMessage>> {
        self.next().await
    }
}
