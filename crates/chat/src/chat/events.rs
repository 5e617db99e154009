use ragline_api::ApiError;
use ragline_protocol::{Citation, StreamEvent, Usage};

use crate::chat::message::StreamTarget;

const QUOTA_PATTERNS: &[&str] = &[
    "limit exceeded",
    "quota exceeded",
    "rate limit",
    "too many requests",
];
const TOO_MANY_REQUESTS: u16 = 429;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Daily request or token budget exhausted, or the server is rate limiting.
    QuotaExceeded,
    Generic,
}

impl FailureKind {
    pub fn classify(status: Option<u16>, message: &str) -> Self {
        if status == Some(TOO_MANY_REQUESTS) {
            return Self::QuotaExceeded;
        }

        let message = message.to_lowercase();
        if QUOTA_PATTERNS
            .iter()
            .any(|pattern| message.contains(pattern))
        {
            Self::QuotaExceeded
        } else {
            Self::Generic
        }
    }
}

/// Terminal failure of one turn, as surfaced to the view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ExchangeFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn from_message(status: Option<u16>, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(FailureKind::classify(status, &message), message)
    }

    pub fn from_api_error(error: &ApiError) -> Self {
        Self::from_message(error.status(), error.to_string())
    }

    pub fn is_quota_exceeded(&self) -> bool {
        self.kind == FailureKind::QuotaExceeded
    }
}

/// Stream payload mapped into conversation language.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEventPayload {
    Content(String),
    Sources(Vec<Citation>),
    Usage(Usage),
    Done,
    Error(ExchangeFailure),
}

impl From<StreamEvent> for StreamEventPayload {
    fn from(event: StreamEvent) -> Self {
        match event {
            StreamEvent::Content(fragment) => Self::Content(fragment),
            StreamEvent::Sources(citations) => Self::Sources(citations),
            StreamEvent::Usage(usage) => Self::Usage(usage),
        }
    }
}

/// Emitted by the exchange worker for every decoded event and once at the end.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEventMapped {
    pub target: StreamTarget,
    pub payload: StreamEventPayload,
}

impl StreamEventMapped {
    pub fn new(target: StreamTarget, payload: impl Into<StreamEventPayload>) -> Self {
        Self {
            target,
            payload: payload.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_details_are_classified() {
        for detail in [
            "Daily request limit exceeded",
            "Daily token quota exceeded",
            "Rate limit reached, slow down",
            "Too Many Requests",
        ] {
            assert_eq!(
                FailureKind::classify(Some(400), detail),
                FailureKind::QuotaExceeded,
                "{detail}"
            );
        }
    }

    #[test]
    fn status_429_is_quota_regardless_of_text() {
        let failure = ExchangeFailure::from_message(Some(429), "slow down");
        assert!(failure.is_quota_exceeded());
    }

    #[test]
    fn other_failures_are_generic() {
        assert_eq!(
            FailureKind::classify(Some(500), "request failed with status 500"),
            FailureKind::Generic
        );
        assert_eq!(FailureKind::classify(None, "connection reset"), FailureKind::Generic);
    }

    #[test]
    fn api_status_error_keeps_server_detail() {
        let error = ApiError::Status {
            stage: "open-completion",
            status: 429,
            detail: "Daily token quota exceeded".to_string(),
        };

        let failure = ExchangeFailure::from_api_error(&error);

        assert_eq!(failure.kind, FailureKind::QuotaExceeded);
        assert_eq!(failure.message, "Daily token quota exceeded");
    }
}
