use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use notes_sdk::{NotesClient, NotesError};
use reqwest::RequestBuilder;
use reqwest_eventsource::{retry, Error as EventSourceError, Event, EventSource};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    /// The server closed the stream.
    Ended,
    Error(String),
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportFailure::Ended => f.write_str("answer stream closed by server"),
            TransportFailure::Error(message) => f.write_str(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Frame(String),
    Failed(TransportFailure),
}

#[derive(Debug, Error)]
pub enum StreamSetupError {
    #[error(transparent)]
    Request(#[from] NotesError),
    #[error("answer stream request cannot be cloned")]
    CannotClone,
}

/// A source of server-sent frames for one answer.
#[async_trait]
pub trait AnswerTransport: Send {
    /// `None` once the transport has nothing more to deliver.
    async fn next_event(&mut self) -> Option<TransportEvent>;
    fn close(&mut self);
}

/// Server-sent events over HTTP. Reconnects are disabled: a dropped stream
/// is reported once and the session decides what to keep.
pub struct EventSourceTransport {
    source: EventSource,
    closed: bool,
}

impl EventSourceTransport {
    pub fn new(request: RequestBuilder) -> Result<Self, StreamSetupError> {
        let mut source = EventSource::new(request).map_err(|_| StreamSetupError::CannotClone)?;
        source.set_retry_policy(Box::new(retry::Never));
        Ok(Self {
            source,
            closed: false,
        })
    }

    pub fn connect(
        client: &NotesClient,
        question_id: &str,
        question: &str,
    ) -> Result<Self, StreamSetupError> {
        Self::new(client.answer_stream_request(question_id, question)?)
    }
}

#[async_trait]
impl AnswerTransport for EventSourceTransport {
    async fn next_event(&mut self) -> Option<TransportEvent> {
        if self.closed {
            return None;
        }
        let event = match self.source.next().await? {
            Ok(Event::Open) => TransportEvent::Opened,
            Ok(Event::Message(message)) => {
                trace!(target = "answer_stream", event = %message.event, "sse message");
                TransportEvent::Frame(message.data)
            }
            Err(err) => TransportEvent::Failed(map_eventsource_error(err)),
        };
        Some(event)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.source.close();
        }
    }
}

fn map_eventsource_error(err: EventSourceError) -> TransportFailure {
    match err {
        EventSourceError::StreamEnded => TransportFailure::Ended,
        EventSourceError::InvalidStatusCode(status, ..) => {
            TransportFailure::Error(format!("answer stream rejected with status {status}"))
        }
        EventSourceError::InvalidContentType(content_type, ..) => TransportFailure::Error(
            format!("unexpected content type {:?}", content_type),
        ),
        other => TransportFailure::Error(other.to_string()),
    }
}

/// In-process transport driven through a [`TransportFeed`].
pub struct ChannelTransport {
    events: mpsc::UnboundedReceiver<TransportEvent>,
    closes: Arc<AtomicUsize>,
}

/// Sending half of a [`ChannelTransport`]. Dropping it ends the stream.
#[derive(Clone)]
pub struct TransportFeed {
    events: mpsc::UnboundedSender<TransportEvent>,
    closes: Arc<AtomicUsize>,
}

impl ChannelTransport {
    pub fn new() -> (Self, TransportFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));
        (
            Self {
                events: rx,
                closes: closes.clone(),
            },
            TransportFeed { events: tx, closes },
        )
    }

    /// Shared count of `close` calls, readable after the feed is gone.
    pub fn close_counter(&self) -> Arc<AtomicUsize> {
        self.closes.clone()
    }
}

impl TransportFeed {
    pub fn open(&self) {
        let _ = self.events.send(TransportEvent::Opened);
    }

    pub fn frame(&self, raw: impl Into<String>) {
        let _ = self.events.send(TransportEvent::Frame(raw.into()));
    }

    pub fn fail(&self, failure: TransportFailure) {
        let _ = self.events.send(TransportEvent::Failed(failure));
    }

    /// How many times the transport's `close` was called.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnswerTransport for ChannelTransport {
    async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.events.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notes_sdk::StaticToken;

    #[tokio::test]
    async fn channel_transport_delivers_in_order_and_ends_when_feed_drops() {
        let (mut transport, feed) = ChannelTransport::new();
        feed.open();
        feed.frame("{}");
        drop(feed);

        assert_eq!(transport.next_event().await, Some(TransportEvent::Opened));
        assert_eq!(
            transport.next_event().await,
            Some(TransportEvent::Frame("{}".into()))
        );
        assert_eq!(transport.next_event().await, None);
    }

    #[tokio::test]
    async fn closing_counts_and_stops_delivery() {
        let (mut transport, feed) = ChannelTransport::new();
        transport.close();
        feed.frame("{}");
        assert_eq!(feed.close_count(), 1);
        assert_eq!(transport.next_event().await, None);
    }

    #[tokio::test]
    async fn unreachable_server_fails_before_open() {
        let client = NotesClient::new("http://127.0.0.1:9", Arc::new(StaticToken::new("t")))
            .expect("client");
        let mut transport = EventSourceTransport::connect(&client, "q-1", "why?").expect("setup");
        match transport.next_event().await {
            Some(TransportEvent::Failed(TransportFailure::Error(_))) => {}
            other => panic!("unexpected event {other:?}"),
        }
        transport.close();
        assert_eq!(transport.next_event().await, None);
    }

    #[test]
    fn failures_render_readably() {
        assert_eq!(
            TransportFailure::Ended.to_string(),
            "answer stream closed by server"
        );
        assert_eq!(TransportFailure::Error("reset".into()).to_string(), "reset");
    }
}
