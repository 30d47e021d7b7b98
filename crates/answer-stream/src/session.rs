use tracing::{debug, warn};

use crate::frame::{parse_frame, Frame};
use crate::transport::TransportFailure;

/// How a finished answer came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ending {
    /// The server sent a terminal frame.
    Clean,
    /// The transport dropped mid-answer; the text received so far is kept.
    Recovered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    /// The server reported an error frame.
    Server,
    /// The stream never opened.
    ConnectFailed,
    /// The stream opened and then ended before any answer text arrived.
    ClosedUnexpectedly,
    Generic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Chunk {
        text: String,
        accumulated: String,
    },
    Complete {
        final_text: String,
        ending: Ending,
    },
    Error {
        kind: StreamErrorKind,
        message: String,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Chunk { .. })
    }
}

/// Per-block answer state. Emits at most one terminal event; every input
/// after that is dropped.
#[derive(Debug)]
pub struct AnswerSession {
    block_id: String,
    accumulated: String,
    chunks: usize,
    opened: bool,
    completed: bool,
}

impl AnswerSession {
    pub fn new(block_id: impl Into<String>) -> Self {
        Self {
            block_id: block_id.into(),
            accumulated: String::new(),
            chunks: 0,
            opened: false,
            completed: false,
        }
    }

    pub fn block_id(&self) -> &str {
        &self.block_id
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn on_opened(&mut self) {
        self.opened = true;
    }

    /// Feeds one raw frame. Malformed frames are logged and skipped.
    pub fn on_frame(&mut self, raw: &str) -> Vec<StreamEvent> {
        if self.completed {
            debug!(target = "answer_stream", block_id = %self.block_id, "frame after completion dropped");
            return Vec::new();
        }
        match parse_frame(raw) {
            Ok(frame) => self.apply(frame),
            Err(err) => {
                warn!(
                    target = "answer_stream",
                    block_id = %self.block_id,
                    error = %err,
                    "skipping unparseable frame"
                );
                Vec::new()
            }
        }
    }

    pub fn apply(&mut self, frame: Frame) -> Vec<StreamEvent> {
        if self.completed {
            return Vec::new();
        }
        match frame {
            Frame::Ignored => Vec::new(),
            Frame::Chunk(text) => vec![self.push_chunk(text)],
            Frame::ChunkThenTerminal(text) => {
                let chunk = self.push_chunk(text);
                vec![chunk, self.finish_clean(None)]
            }
            Frame::Terminal { answer } => vec![self.finish_clean(answer)],
            Frame::Failure(message) => {
                self.completed = true;
                warn!(
                    target = "answer_stream",
                    block_id = %self.block_id,
                    error = %message,
                    "server reported stream error"
                );
                vec![StreamEvent::Error {
                    kind: StreamErrorKind::Server,
                    message,
                }]
            }
        }
    }

    /// The transport failed or closed. Keeps any partial answer; reports an
    /// error only when nothing arrived.
    pub fn on_failure(&mut self, failure: TransportFailure) -> Option<StreamEvent> {
        if self.completed {
            return None;
        }
        self.completed = true;

        if !self.accumulated.is_empty() {
            debug!(
                target = "answer_stream",
                block_id = %self.block_id,
                chunks = self.chunks,
                failure = %failure,
                "transport dropped mid-answer, keeping partial text"
            );
            return Some(StreamEvent::Complete {
                final_text: self.accumulated.clone(),
                ending: Ending::Recovered,
            });
        }

        let kind = match (&failure, self.opened) {
            (_, false) => StreamErrorKind::ConnectFailed,
            (TransportFailure::Ended, true) => StreamErrorKind::ClosedUnexpectedly,
            (TransportFailure::Error(_), true) => StreamErrorKind::Generic,
        };
        warn!(
            target = "answer_stream",
            block_id = %self.block_id,
            kind = ?kind,
            failure = %failure,
            "stream failed before any answer text"
        );
        Some(StreamEvent::Error {
            kind,
            message: failure.to_string(),
        })
    }

    fn push_chunk(&mut self, text: String) -> StreamEvent {
        self.accumulated.push_str(&text);
        self.chunks += 1;
        StreamEvent::Chunk {
            text,
            accumulated: self.accumulated.clone(),
        }
    }

    fn finish_clean(&mut self, answer: Option<String>) -> StreamEvent {
        self.completed = true;
        let final_text = match answer {
            Some(answer) if self.accumulated.is_empty() => answer,
            _ => self.accumulated.clone(),
        };
        debug!(
            target = "answer_stream",
            block_id = %self.block_id,
            chunks = self.chunks,
            "answer complete"
        );
        StreamEvent::Complete {
            final_text,
            ending: Ending::Clean,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(session: &mut AnswerSession, frames: &[&str]) -> Vec<StreamEvent> {
        frames.iter().flat_map(|raw| session.on_frame(raw)).collect()
    }

    #[test]
    fn chunks_then_metadata_completes_once() {
        let mut session = AnswerSession::new("block-1");
        session.on_opened();
        let events = feed(
            &mut session,
            &[
                r#"{"type":"status","data":{"phase":"searching"}}"#,
                r#"{"type":"chunk","data":{"chunk":"Par"}}"#,
                r#"{"type":"chunk","data":{"chunk":"is"}}"#,
                r#"{"type":"metadata","data":{"sources":["atlas"]}}"#,
                r#"{"type":"complete","data":{"answer":"Paris"}}"#,
            ],
        );
        assert_eq!(
            events,
            vec![
                StreamEvent::Chunk {
                    text: "Par".into(),
                    accumulated: "Par".into()
                },
                StreamEvent::Chunk {
                    text: "is".into(),
                    accumulated: "Paris".into()
                },
                StreamEvent::Complete {
                    final_text: "Paris".into(),
                    ending: Ending::Clean
                },
            ]
        );
        assert!(session.is_completed());
        assert_eq!(session.on_failure(TransportFailure::Ended), None);
    }

    #[test]
    fn mixed_shapes_concatenate_in_order() {
        let mut session = AnswerSession::new("block-1");
        let events = feed(
            &mut session,
            &[
                r#"{"type":"chunk","data":{"chunk":"A"}}"#,
                r#"{"chunk":"B","isComplete":false}"#,
                r#"{"type":"chunk","data":{"answer":"C"}}"#,
                r#"{"chunk":"D","isComplete":true}"#,
            ],
        );
        let texts: Vec<&str> = events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::Chunk { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, ["A", "B", "C", "D"]);
        assert_eq!(
            events.last(),
            Some(&StreamEvent::Complete {
                final_text: "ABCD".into(),
                ending: Ending::Clean
            })
        );
    }

    #[test]
    fn legacy_completion_chunk_is_appended_before_completing() {
        let mut session = AnswerSession::new("block-1");
        let events = feed(
            &mut session,
            &[
                r#"{"type":"chunk","data":{"chunk":"A"}}"#,
                r#"{"type":"complete","data":{"chunk":"B"}}"#,
            ],
        );
        assert_eq!(
            events,
            vec![
                StreamEvent::Chunk {
                    text: "A".into(),
                    accumulated: "A".into()
                },
                StreamEvent::Chunk {
                    text: "B".into(),
                    accumulated: "AB".into()
                },
                StreamEvent::Complete {
                    final_text: "AB".into(),
                    ending: Ending::Clean
                },
            ]
        );
    }

    #[test]
    fn terminal_answer_used_when_no_chunks_arrived() {
        let mut session = AnswerSession::new("block-1");
        let events = feed(&mut session, &[r#"{"type":"complete","data":{"answer":"42"}}"#]);
        assert_eq!(
            events,
            vec![StreamEvent::Complete {
                final_text: "42".into(),
                ending: Ending::Clean
            }]
        );
    }

    #[test]
    fn error_frame_terminates_exactly_once() {
        let mut session = AnswerSession::new("block-1");
        let events = feed(
            &mut session,
            &[
                r#"{"type":"chunk","data":{"chunk":"partial"}}"#,
                r#"{"error":"rate limited"}"#,
                r#"{"error":"again"}"#,
                r#"{"type":"complete"}"#,
            ],
        );
        let terminals: Vec<&StreamEvent> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(
            terminals,
            vec![&StreamEvent::Error {
                kind: StreamErrorKind::Server,
                message: "rate limited".into()
            }]
        );
        assert_eq!(session.on_failure(TransportFailure::Ended), None);
    }

    #[test]
    fn malformed_frames_are_skipped() {
        let mut session = AnswerSession::new("block-1");
        let events = feed(
            &mut session,
            &["{oops", r#"{"chunk":"ok","isComplete":true}"#],
        );
        assert_eq!(events.len(), 2);
        assert!(session.is_completed());
    }

    #[test]
    fn transport_drop_after_chunks_recovers_partial_text() {
        let mut session = AnswerSession::new("block-1");
        session.on_opened();
        feed(&mut session, &[r#"{"chunk":"Half an ","isComplete":false}"#]);
        feed(&mut session, &[r#"{"chunk":"answer","isComplete":false}"#]);
        assert_eq!(
            session.on_failure(TransportFailure::Error("connection reset".into())),
            Some(StreamEvent::Complete {
                final_text: "Half an answer".into(),
                ending: Ending::Recovered
            })
        );
        assert_eq!(session.on_failure(TransportFailure::Ended), None);
        assert!(feed(&mut session, &[r#"{"chunk":"late","isComplete":false}"#]).is_empty());
    }

    #[test]
    fn zero_chunk_failures_are_classified_by_connection_state() {
        let mut never_opened = AnswerSession::new("a");
        assert!(matches!(
            never_opened.on_failure(TransportFailure::Error("refused".into())),
            Some(StreamEvent::Error {
                kind: StreamErrorKind::ConnectFailed,
                ..
            })
        ));

        let mut ended = AnswerSession::new("b");
        ended.on_opened();
        assert!(matches!(
            ended.on_failure(TransportFailure::Ended),
            Some(StreamEvent::Error {
                kind: StreamErrorKind::ClosedUnexpectedly,
                ..
            })
        ));

        let mut broken = AnswerSession::new("c");
        broken.on_opened();
        assert!(matches!(
            broken.on_failure(TransportFailure::Error("bad chunk encoding".into())),
            Some(StreamEvent::Error {
                kind: StreamErrorKind::Generic,
                ..
            })
        ));
    }
}
