#![deny(unsafe_code)]

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures::stream::BoxStream;

pub mod auth;
pub mod error;
pub mod http;
pub mod ids;
pub mod types;

pub use auth::AuthState;
pub use error::{ApiError, ApiResult, error_detail};
pub use http::{DEFAULT_BASE_URL, HttpBackend, HttpBackendConfig};
pub use ids::{KnowledgeId, MessageId, SessionId, UserId};
pub use types::{
    CompletionRequest, DEFAULT_SESSION_ICON, DEFAULT_SESSION_TITLE, DEFAULT_TOP_K, MAX_TOP_K,
    MessageRecord, MessageRole, NewSession, PLACEHOLDER_SESSION_TITLES, SessionPatch,
    SessionRecord, TokenResponse, is_placeholder_title, parse_timestamp, validate_top_k,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
/// Raw completion body, chunked however the transport delivers it.
pub type ByteStream = BoxStream<'static, ApiResult<Bytes>>;

/// Session CRUD owned by the server.
pub trait SessionApi: Send + Sync {
    fn list_sessions(&self) -> BoxFuture<'_, ApiResult<Vec<SessionRecord>>>;
    fn get_session(&self, session_id: SessionId) -> BoxFuture<'_, ApiResult<SessionRecord>>;
    fn create_session(&self, input: NewSession) -> BoxFuture<'_, ApiResult<SessionRecord>>;
    fn update_session(
        &self,
        session_id: SessionId,
        patch: SessionPatch,
    ) -> BoxFuture<'_, ApiResult<SessionRecord>>;
    fn delete_session(&self, session_id: SessionId) -> BoxFuture<'_, ApiResult<()>>;
    fn list_messages(&self, session_id: SessionId) -> BoxFuture<'_, ApiResult<Vec<MessageRecord>>>;
}

/// The streaming question/answer endpoint.
pub trait CompletionApi: Send + Sync {
    /// Resolves once the server accepted the request; the body streams afterwards.
    fn open_completion(
        &self,
        session_id: SessionId,
        request: CompletionRequest,
    ) -> BoxFuture<'_, ApiResult<ByteStream>>;
}
