use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ApiError {
    #[snafu(display("no bearer credential is available for `{stage}`"))]
    MissingCredential { stage: &'static str },
    #[snafu(display("credential rejected by server on `{stage}`"))]
    Unauthorized { stage: &'static str },
    #[snafu(display("failed to build http client on `{stage}`: {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("request to {url} failed on `{stage}`: {source}"))]
    Transport {
        stage: &'static str,
        url: String,
        source: reqwest::Error,
    },
    #[snafu(display("{detail}"))]
    Status {
        stage: &'static str,
        status: u16,
        detail: String,
    },
    #[snafu(display("no response from {url} within {timeout:?} on `{stage}`"))]
    Timeout {
        stage: &'static str,
        url: String,
        timeout: std::time::Duration,
        source: tokio::time::error::Elapsed,
    },
    #[snafu(display("failed to decode response body on `{stage}`: {source}"))]
    DecodeBody {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("failed to read response body on `{stage}`: {source}"))]
    ReadBody {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("id '{raw}' is not a valid session id"))]
    InvalidId {
        stage: &'static str,
        raw: String,
        source: uuid::Error,
    },
    #[snafu(display("invalid input on `{stage}`: {details}"))]
    InvalidInput {
        stage: &'static str,
        details: String,
    },
}

impl ApiError {
    /// HTTP status behind the failure, when the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Unauthorized { .. } => Some(401),
            _ => None,
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Message for a non-success response: the `detail` field when the body carries one,
/// otherwise a status-derived fallback.
pub fn error_detail(status: u16, body: &str) -> String {
    let detail = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value.get("detail").cloned());

    match detail {
        Some(serde_json::Value::String(message)) if !message.trim().is_empty() => message,
        Some(serde_json::Value::Null) | Some(serde_json::Value::String(_)) | None => {
            format!("request failed with status {status}")
        }
        Some(structured) => structured.to_string(),
    }
}
