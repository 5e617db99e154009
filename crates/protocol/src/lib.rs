#![deny(unsafe_code)]

//! Wire decoding for the streamed completion body.
//!
//! The body is a sequence of blank-line separated frames, each an `event:` line followed
//! by a `data:` line. [`FrameDecoder`] reassembles them from arbitrary chunk boundaries
//! and [`EventDispatcher`] turns each one into a typed [`StreamEvent`].

mod dispatch;
mod frame;
mod stream;
mod utf8;

pub use dispatch::{
    Citation, EventDispatcher, EventKind, MESSAGE_EVENT, PayloadError, SOURCES_EVENT,
    StreamEvent, USAGE_EVENT, Usage, decode_content, decode_sources, decode_usage,
};
pub use frame::{FRAME_DELIMITER, Frame, FrameDecoder, parse_frame};
pub use stream::FrameStream;
pub use utf8::Utf8ChunkDecoder;
