use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

/// One server frame reduced to what the session cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Chunk(String),
    /// End of answer. `answer` is the server's full text when it sent one.
    Terminal {
        answer: Option<String>,
    },
    /// Flat frames may carry the last chunk and the completion flag together.
    ChunkThenTerminal(String),
    Failure(String),
    Ignored,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a json object")]
    NotAnObject,
}

/// Parses a frame in any of the wire shapes the answer service has used:
/// tagged envelopes (`{type, data}`), flat objects (`{chunk, isComplete}` or
/// `{error}`), and the legacy envelope whose text may sit under `chunk`,
/// `answer`, or `accumulatedAnswer`.
///
/// Fields are read loosely: a field of an unexpected type is treated as
/// absent instead of failing the whole frame.
pub fn parse_frame(raw: &str) -> Result<Frame, FrameError> {
    let value: Value = serde_json::from_str(raw)?;
    let frame = value.as_object().ok_or(FrameError::NotAnObject)?;
    Ok(classify(frame))
}

fn classify(frame: &Map<String, Value>) -> Frame {
    if let Some(error) = frame.get("error").filter(|error| !error.is_null()) {
        return Frame::Failure(error_message(error));
    }

    if let Some(kind) = frame.get("type").and_then(Value::as_str) {
        let data = frame.get("data").filter(|data| !data.is_null());
        let fields = data.and_then(Value::as_object);
        return match kind {
            "status" | "ping" => Frame::Ignored,
            "chunk" => match fields.and_then(chunk_text) {
                Some(text) => Frame::Chunk(text),
                None => Frame::Ignored,
            },
            // Legacy completions may carry the last piece of text.
            "complete" => match fields.and_then(|data| non_empty(data, &["chunk"])) {
                Some(text) => Frame::ChunkThenTerminal(text),
                None => Frame::Terminal {
                    answer: fields.and_then(answer_text),
                },
            },
            "metadata" => Frame::Terminal {
                answer: fields.and_then(answer_text),
            },
            "error" => Frame::Failure(
                data.map(error_message)
                    .unwrap_or_else(|| "answer stream error".to_string()),
            ),
            other => {
                debug!(target = "answer_stream", frame_type = other, "ignoring unknown frame type");
                Frame::Ignored
            }
        };
    }

    let chunk = frame
        .get("chunk")
        .and_then(Value::as_str)
        .filter(|chunk| !chunk.is_empty())
        .map(str::to_string);
    let is_complete = frame
        .get("isComplete")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    match (chunk, is_complete) {
        (Some(chunk), true) => Frame::ChunkThenTerminal(chunk),
        (None, true) => Frame::Terminal { answer: None },
        (Some(chunk), false) => Frame::Chunk(chunk),
        (None, false) => Frame::Ignored,
    }
}

fn string_field(data: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| data.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

fn non_empty(data: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    string_field(data, keys).filter(|text| !text.is_empty())
}

/// First present of `chunk`, `answer`, `accumulatedAnswer`. A legacy
/// `accumulatedAnswer` is appended as a delta like the others; it is never
/// diffed against the text already received.
fn chunk_text(data: &Map<String, Value>) -> Option<String> {
    string_field(data, &["chunk", "answer", "accumulatedAnswer"]).filter(|text| !text.is_empty())
}

fn answer_text(data: &Map<String, Value>) -> Option<String> {
    non_empty(data, &["answer", "accumulatedAnswer"])
}

fn error_message(value: &Value) -> String {
    match value {
        Value::String(message) => message.clone(),
        Value::Object(map) => string_field(map, &["message", "error"])
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}
