//! Answer streaming for question blocks.
//!
//! Responsibilities:
//! - normalizing every server frame shape into chunk, completion, or error
//! - per-block answer state with exactly one terminal event
//! - keeping partial answers when the transport drops mid-stream
//! - one live stream per block, cancelled when the block asks again

pub mod frame;
pub mod manager;
pub mod session;
pub mod transport;

pub use frame::{parse_frame, Frame, FrameError};
pub use manager::{AnswerStreams, StreamSubscription};
pub use session::{AnswerSession, Ending, StreamErrorKind, StreamEvent};
pub use transport::{
    AnswerTransport, ChannelTransport, EventSourceTransport, StreamSetupError, TransportEvent,
    TransportFailure, TransportFeed,
};
