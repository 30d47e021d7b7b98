use std::collections::HashMap;
use std::sync::Arc;

use notes_sdk::NotesClient;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::session::{AnswerSession, StreamEvent};
use crate::transport::{
    AnswerTransport, EventSourceTransport, StreamSetupError, TransportEvent, TransportFailure,
};

struct ActiveStream {
    stream_id: Uuid,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

type Registry = Arc<Mutex<HashMap<String, ActiveStream>>>;

/// Owns every live answer stream, at most one per block.
#[derive(Clone, Default)]
pub struct AnswerStreams {
    active: Registry,
}

impl AnswerStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens an SSE answer stream for `block_id` against the notes service.
    pub async fn ask(
        &self,
        client: &NotesClient,
        block_id: &str,
        question_id: &str,
        question: &str,
    ) -> Result<StreamSubscription, StreamSetupError> {
        let transport = EventSourceTransport::connect(client, question_id, question)?;
        Ok(self.start(block_id, Box::new(transport)).await)
    }

    /// Starts driving `transport` for `block_id`. Any stream already running
    /// for that block is stopped first.
    pub async fn start(
        &self,
        block_id: &str,
        transport: Box<dyn AnswerTransport>,
    ) -> StreamSubscription {
        self.stop(block_id).await;

        let stream_id = Uuid::new_v4();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();

        // Hold the lock across spawn so the task cannot deregister itself
        // before it is registered.
        let replaced = {
            let mut active = self.active.lock();
            let task = tokio::spawn(drive(
                block_id.to_string(),
                stream_id,
                transport,
                events_tx,
                stop_rx,
                self.active.clone(),
            ));
            active.insert(
                block_id.to_string(),
                ActiveStream {
                    stream_id,
                    stop: stop_tx,
                    task,
                },
            )
        };
        if let Some(previous) = replaced {
            // A concurrent start won the race for this block.
            shut_down(previous).await;
        }

        info!(target = "answer_stream", block_id, %stream_id, "answer stream started");
        StreamSubscription {
            block_id: block_id.to_string(),
            stream_id,
            events: events_rx,
            streams: self.clone(),
        }
    }

    /// Stops the block's stream without emitting a terminal event.
    /// Returns whether a stream was running.
    pub async fn stop(&self, block_id: &str) -> bool {
        let entry = self.active.lock().remove(block_id);
        match entry {
            Some(entry) => {
                shut_down(entry).await;
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let entries: Vec<ActiveStream> = self.active.lock().drain().map(|(_, e)| e).collect();
        for entry in entries {
            shut_down(entry).await;
        }
    }

    pub fn is_active(&self, block_id: &str) -> bool {
        self.active.lock().contains_key(block_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Removes the block's entry only if it still belongs to `stream_id`.
    fn take_entry(&self, block_id: &str, stream_id: Uuid) -> Option<ActiveStream> {
        let mut active = self.active.lock();
        match active.get(block_id) {
            Some(entry) if entry.stream_id == stream_id => active.remove(block_id),
            _ => None,
        }
    }

    async fn stop_stream(&self, block_id: &str, stream_id: Uuid) -> bool {
        match self.take_entry(block_id, stream_id) {
            Some(entry) => {
                shut_down(entry).await;
                true
            }
            None => false,
        }
    }
}

async fn shut_down(entry: ActiveStream) {
    let _ = entry.stop.send(());
    let _ = entry.task.await;
}

/// Receiving end of one answer stream.
pub struct StreamSubscription {
    block_id: String,
    stream_id: Uuid,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    streams: AnswerStreams,
}

impl StreamSubscription {
    pub fn block_id(&self) -> &str {
        &self.block_id
    }

    pub fn stream_id(&self) -> Uuid {
        self.stream_id
    }

    /// `None` after the terminal event, or once the stream was stopped.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Collects events until the stream finishes.
    pub async fn collect(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            events.push(event);
        }
        events
    }

    /// Cancels this stream. A newer stream for the same block is left alone.
    pub async fn stop(self) -> bool {
        self.streams.stop_stream(&self.block_id, self.stream_id).await
    }
}

impl Drop for StreamSubscription {
    /// Nobody is listening any more, so the stream is stopped. The task
    /// closes its transport on its own; it is not awaited here.
    fn drop(&mut self) {
        if let Some(entry) = self.streams.take_entry(&self.block_id, self.stream_id) {
            debug!(
                target = "answer_stream",
                block_id = %self.block_id,
                stream_id = %self.stream_id,
                "subscription dropped, stopping answer stream"
            );
            let _ = entry.stop.send(());
        }
    }
}

async fn drive(
    block_id: String,
    stream_id: Uuid,
    mut transport: Box<dyn AnswerTransport>,
    events: mpsc::UnboundedSender<StreamEvent>,
    mut stop: oneshot::Receiver<()>,
    registry: Registry,
) {
    let mut session = AnswerSession::new(block_id.clone());
    loop {
        let next = tokio::select! {
            biased;
            _ = &mut stop => {
                transport.close();
                debug!(target = "answer_stream", block_id = %block_id, %stream_id, "answer stream stopped");
                return;
            }
            next = transport.next_event() => next,
        };

        let emitted = match next {
            Some(TransportEvent::Opened) => {
                session.on_opened();
                Vec::new()
            }
            Some(TransportEvent::Frame(raw)) => session.on_frame(&raw),
            Some(TransportEvent::Failed(failure)) => session.on_failure(failure).into_iter().collect(),
            None => session.on_failure(TransportFailure::Ended).into_iter().collect(),
        };
        for event in emitted {
            let _ = events.send(event);
        }

        if session.is_completed() {
            transport.close();
            break;
        }
    }

    let mut active = registry.lock();
    if active
        .get(&block_id)
        .map(|entry| entry.stream_id == stream_id)
        .unwrap_or(false)
    {
        active.remove(&block_id);
    }
    debug!(target = "answer_stream", block_id = %block_id, %stream_id, "answer stream finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Ending, StreamErrorKind};
    use crate::transport::{ChannelTransport, TransportFeed};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn started(streams: &AnswerStreams, block: &str) -> (StreamSubscription, TransportFeed) {
        let (transport, feed) = ChannelTransport::new();
        let sub = streams.start(block, Box::new(transport)).await;
        (sub, feed)
    }

    async fn next(sub: &mut StreamSubscription) -> Option<StreamEvent> {
        timeout(Duration::from_secs(5), sub.next_event())
            .await
            .expect("event in time")
    }

    #[tokio::test]
    async fn streams_chunks_and_closes_once_on_completion() {
        let streams = AnswerStreams::new();
        let (mut sub, feed) = started(&streams, "block-1").await;
        feed.open();
        feed.frame(r#"{"type":"chunk","data":{"chunk":"Par"}}"#);
        feed.frame(r#"{"type":"chunk","data":{"chunk":"is"}}"#);
        feed.frame(r#"{"type":"metadata","data":{}}"#);
        feed.frame(r#"{"type":"complete","data":{}}"#);

        assert_eq!(
            next(&mut sub).await,
            Some(StreamEvent::Chunk {
                text: "Par".into(),
                accumulated: "Par".into()
            })
        );
        assert_eq!(
            next(&mut sub).await,
            Some(StreamEvent::Chunk {
                text: "is".into(),
                accumulated: "Paris".into()
            })
        );
        assert_eq!(
            next(&mut sub).await,
            Some(StreamEvent::Complete {
                final_text: "Paris".into(),
                ending: Ending::Clean
            })
        );
        assert_eq!(next(&mut sub).await, None);
        assert_eq!(feed.close_count(), 1);
        assert!(!streams.is_active("block-1"));
    }

    #[tokio::test]
    async fn dropped_transport_keeps_partial_answer() {
        let streams = AnswerStreams::new();
        let (sub, feed) = started(&streams, "block-1").await;
        feed.open();
        feed.frame(r#"{"chunk":"Half","isComplete":false}"#);
        feed.fail(TransportFailure::Error("connection reset".into()));
        feed.fail(TransportFailure::Ended);

        let events = timeout(Duration::from_secs(5), sub.collect()).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            StreamEvent::Complete {
                final_text: "Half".into(),
                ending: Ending::Recovered
            }
        );
        assert_eq!(feed.close_count(), 1);
    }

    #[tokio::test]
    async fn feed_ending_before_any_text_is_an_error() {
        let streams = AnswerStreams::new();
        let (sub, feed) = started(&streams, "block-1").await;
        feed.open();
        feed.frame(r#"{"type":"status","data":{}}"#);
        feed.fail(TransportFailure::Ended);

        let events = timeout(Duration::from_secs(5), sub.collect()).await.unwrap();
        assert!(matches!(
            events.as_slice(),
            [StreamEvent::Error {
                kind: StreamErrorKind::ClosedUnexpectedly,
                ..
            }]
        ));
        assert_eq!(feed.close_count(), 1);
    }

    #[tokio::test]
    async fn dropping_the_feed_counts_as_a_closed_stream() {
        let streams = AnswerStreams::new();
        let (transport, feed) = ChannelTransport::new();
        let closes = transport.close_counter();
        feed.open();
        feed.frame(r#"{"chunk":"only","isComplete":false}"#);
        drop(feed);

        let sub = streams.start("block-1", Box::new(transport)).await;
        let events = timeout(Duration::from_secs(5), sub.collect()).await.unwrap();
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Complete {
                final_text: "only".into(),
                ending: Ending::Recovered
            })
        );
        assert_eq!(closes.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn restarting_a_block_cancels_the_previous_stream() {
        let streams = AnswerStreams::new();
        let (mut first, first_feed) = started(&streams, "block-1").await;
        first_feed.open();
        first_feed.frame(r#"{"chunk":"old","isComplete":false}"#);
        assert!(matches!(next(&mut first).await, Some(StreamEvent::Chunk { .. })));

        let (mut second, second_feed) = started(&streams, "block-1").await;
        assert_eq!(first_feed.close_count(), 1);
        // Stopped streams end silently.
        assert_eq!(next(&mut first).await, None);

        first_feed.frame(r#"{"chunk":"stale","isComplete":true}"#);
        second_feed.frame(r#"{"chunk":"new","isComplete":true}"#);
        assert_eq!(
            next(&mut second).await,
            Some(StreamEvent::Chunk {
                text: "new".into(),
                accumulated: "new".into()
            })
        );
        assert!(matches!(
            next(&mut second).await,
            Some(StreamEvent::Complete { .. })
        ));
        assert_eq!(first_feed.close_count(), 1);
        assert_eq!(second_feed.close_count(), 1);
    }

    #[tokio::test]
    async fn stop_discards_without_terminal_event() {
        let streams = AnswerStreams::new();
        let (mut sub, feed) = started(&streams, "block-1").await;
        feed.open();
        feed.frame(r#"{"chunk":"draft","isComplete":false}"#);
        assert!(matches!(next(&mut sub).await, Some(StreamEvent::Chunk { .. })));

        assert!(streams.stop("block-1").await);
        assert!(!streams.stop("block-1").await);
        assert_eq!(next(&mut sub).await, None);
        assert_eq!(feed.close_count(), 1);
    }

    #[tokio::test]
    async fn subscription_stop_leaves_newer_stream_running() {
        let streams = AnswerStreams::new();
        let (old, _old_feed) = started(&streams, "block-1").await;
        let (_new, new_feed) = started(&streams, "block-1").await;

        assert!(!old.stop().await);
        assert!(streams.is_active("block-1"));
        assert_eq!(new_feed.close_count(), 0);
    }

    #[tokio::test]
    async fn dropping_the_subscription_stops_its_stream() {
        let streams = AnswerStreams::new();
        let (sub, feed) = started(&streams, "block-1").await;
        feed.open();
        feed.frame(r#"{"chunk":"unread","isComplete":false}"#);

        drop(sub);
        assert!(!streams.is_active("block-1"));
        timeout(Duration::from_secs(5), async {
            while feed.close_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("transport closed");
        assert_eq!(feed.close_count(), 1);
    }

    #[tokio::test]
    async fn dropping_a_replaced_subscription_leaves_the_newer_stream() {
        let streams = AnswerStreams::new();
        let (old, _old_feed) = started(&streams, "block-1").await;
        let (mut new, new_feed) = started(&streams, "block-1").await;

        drop(old);
        assert!(streams.is_active("block-1"));
        new_feed.frame(r#"{"chunk":"still here","isComplete":false}"#);
        assert!(matches!(next(&mut new).await, Some(StreamEvent::Chunk { .. })));
        assert_eq!(new_feed.close_count(), 0);
    }

    #[tokio::test]
    async fn stop_all_closes_every_stream() {
        let streams = AnswerStreams::new();
        let (_a, feed_a) = started(&streams, "a").await;
        let (_b, feed_b) = started(&streams, "b").await;
        assert_eq!(streams.active_count(), 2);

        streams.stop_all().await;
        assert_eq!(streams.active_count(), 0);
        assert_eq!(feed_a.close_count(), 1);
        assert_eq!(feed_b.close_count(), 1);
    }
}
