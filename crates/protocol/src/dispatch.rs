use serde::{Deserialize, Deserializer, Serialize};
use snafu::{ResultExt, Snafu};

use super::frame::Frame;

pub const MESSAGE_EVENT: &str = "message";
pub const SOURCES_EVENT: &str = "sources";
pub const USAGE_EVENT: &str = "usage";

/// A retrieved-source excerpt attached to an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    #[serde(default, deserialize_with = "null_as_default")]
    pub filename: String,
    #[serde(default)]
    pub page: Option<u32>,
    /// Excerpt text of the cited chunk.
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: String,
    /// Relevance in `0.0..=1.0` when the backend reranked the chunk.
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub knowledge_id: Option<i64>,
}

/// Token accounting reported at the end of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct UsagePayload {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    total_tokens: Option<u64>,
}

impl From<UsagePayload> for Usage {
    fn from(payload: UsagePayload) -> Self {
        let total_tokens = payload
            .total_tokens
            .unwrap_or_else(|| payload.input_tokens.saturating_add(payload.output_tokens));

        Self {
            input_tokens: payload.input_tokens,
            output_tokens: payload.output_tokens,
            total_tokens,
        }
    }
}

/// Semantic kind of a frame, decided by its event name alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    Sources,
    Usage,
}

impl EventKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            MESSAGE_EVENT => Some(Self::Message),
            SOURCES_EVENT => Some(Self::Sources),
            USAGE_EVENT => Some(Self::Usage),
            _ => None,
        }
    }
}

/// Typed payload of one dispatched frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Text fragment to append to the running answer.
    Content(String),
    /// Latest citation list; replaces any previous one.
    Sources(Vec<Citation>),
    /// Latest usage figures; replace any previous ones.
    Usage(Usage),
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PayloadError {
    #[snafu(display("failed to decode `{event}` payload on `{stage}`: {source}"))]
    DecodePayload {
        stage: &'static str,
        event: &'static str,
        source: serde_json::Error,
    },
}

/// Routes frames to typed events. Holds no state.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventDispatcher;

impl EventDispatcher {
    pub fn new() -> Self {
        Self
    }

    /// Decodes one frame.
    ///
    /// Unknown event names and undecodable `sources`/`usage` payloads yield `None`;
    /// neither aborts the stream.
    pub fn dispatch(&self, frame: &Frame) -> Option<StreamEvent> {
        let Some(kind) = EventKind::from_name(&frame.event) else {
            tracing::debug!(event = %frame.event, "ignoring unknown stream event");
            return None;
        };

        match kind {
            EventKind::Message => Some(StreamEvent::Content(decode_content(&frame.data))),
            EventKind::Sources => match decode_sources(&frame.data) {
                Ok(citations) => Some(StreamEvent::Sources(citations)),
                Err(error) => {
                    tracing::warn!(error = %error, "dropping undecodable sources frame");
                    None
                }
            },
            EventKind::Usage => match decode_usage(&frame.data) {
                Ok(usage) => Some(StreamEvent::Usage(usage)),
                Err(error) => {
                    tracing::warn!(error = %error, "dropping undecodable usage frame");
                    None
                }
            },
        }
    }
}

/// A JSON string payload is unescaped; anything else is taken verbatim.
pub fn decode_content(data: &str) -> String {
    serde_json::from_str::<String>(data).unwrap_or_else(|_| data.to_string())
}

pub fn decode_sources(data: &str) -> Result<Vec<Citation>, PayloadError> {
    serde_json::from_str(data).context(DecodePayloadSnafu {
        stage: "decode-sources",
        event: SOURCES_EVENT,
    })
}

pub fn decode_usage(data: &str) -> Result<Usage, PayloadError> {
    let payload: UsagePayload = serde_json::from_str(data).context(DecodePayloadSnafu {
        stage: "decode-usage",
        event: USAGE_EVENT,
    })?;
    Ok(payload.into())
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
