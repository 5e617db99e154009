use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use snafu::ResultExt;

use super::auth::AuthState;
use super::error::{
    ApiError, ApiResult, BuildClientSnafu, DecodeBodySnafu, MissingCredentialSnafu,
    TimeoutSnafu, TransportSnafu, error_detail,
};
use super::ids::SessionId;
use super::types::{
    CompletionRequest, MessageRecord, NewSession, SessionPatch, SessionRecord, TokenResponse,
};
use super::{BoxFuture, ByteStream, CompletionApi, SessionApi};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpBackendConfig {
    pub base_url: String,
    /// Bounds connection setup for every call, streaming included.
    pub connect_timeout: Duration,
    /// Overall deadline for non-streaming calls, and the wait for response headers on the
    /// completion call.
    pub request_timeout: Duration,
    pub page_size: u32,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            page_size: 50,
        }
    }
}

/// REST + streaming backend client.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    auth: AuthState,
    request_timeout: Duration,
    page_size: u32,
}

impl HttpBackend {
    /// Builds the client; the shared `auth` is read on every call.
    pub fn new(config: HttpBackendConfig, auth: AuthState) -> ApiResult<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .context(BuildClientSnafu {
                stage: "build-http-client",
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim().trim_end_matches('/').to_string(),
            auth,
            request_timeout: config.request_timeout,
            page_size: config.page_size.max(1),
        })
    }

    /// Credential shared with everyone holding a clone of this backend.
    pub fn auth(&self) -> &AuthState {
        &self.auth
    }

    /// Base URL with any trailing slash removed.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Exchanges account credentials for a bearer token and stores it.
    pub async fn login(&self, username: &str, password: &str) -> ApiResult<()> {
        let url = self.url("/login/access-token");
        let request = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .form(&[("username", username), ("password", password)]);

        let response = self.send(request, "login", url).await?;
        let token: TokenResponse = Self::decode(response, "decode-login").await?;
        self.auth.sign_in(token.access_token);
        tracing::info!(username, "signed in");
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn session_url(&self, session_id: SessionId) -> String {
        self.url(&format!("/chat/sessions/{session_id}"))
    }

    fn authorized(
        &self,
        request: RequestBuilder,
        stage: &'static str,
    ) -> ApiResult<RequestBuilder> {
        let Some(token) = self.auth.bearer_token() else {
            return MissingCredentialSnafu { stage }.fail();
        };
        Ok(request.bearer_auth(token.as_str()))
    }

    async fn send(
        &self,
        request: RequestBuilder,
        stage: &'static str,
        url: String,
    ) -> ApiResult<Response> {
        let response = request.send().await.context(TransportSnafu { stage, url })?;
        self.check_status(response, stage).await
    }

    async fn check_status(&self, response: Response, stage: &'static str) -> ApiResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::UNAUTHORIZED {
            self.auth.logout();
            tracing::warn!(stage, "server rejected bearer credential");
            return Err(ApiError::Unauthorized { stage });
        }

        let body = response.text().await.unwrap_or_default();
        let detail = error_detail(status.as_u16(), &body);
        tracing::warn!(stage, status = status.as_u16(), detail = %detail, "request failed");

        Err(ApiError::Status {
            stage,
            status: status.as_u16(),
            detail,
        })
    }

    async fn decode<T>(response: Response, stage: &'static str) -> ApiResult<T>
    where
        T: DeserializeOwned,
    {
        response.json::<T>().await.context(DecodeBodySnafu { stage })
    }

    /// First page of the caller's sessions, most recently updated first.
    async fn fetch_sessions(&self) -> ApiResult<Vec<SessionRecord>> {
        let url = self.url("/chat/sessions");
        let request = self
            .client
            .get(&url)
            .query(&[("skip", 0u32), ("limit", self.page_size)])
            .timeout(self.request_timeout);
        let request = self.authorized(request, "list-sessions")?;

        let response = self.send(request, "list-sessions", url).await?;
        Self::decode(response, "decode-sessions").await
    }

    /// Canonical record of one session.
    async fn fetch_session(&self, session_id: SessionId) -> ApiResult<SessionRecord> {
        let url = self.session_url(session_id);
        let request = self.client.get(&url).timeout(self.request_timeout);
        let request = self.authorized(request, "get-session")?;

        let response = self.send(request, "get-session", url).await?;
        Self::decode(response, "decode-session").await
    }

    /// Creates a session; the server fills in title, icon and `top_k` when omitted.
    async fn post_session(&self, input: NewSession) -> ApiResult<SessionRecord> {
        let url = self.url("/chat/sessions");
        let request = self
            .client
            .post(&url)
            .json(&input)
            .timeout(self.request_timeout);
        let request = self.authorized(request, "create-session")?;

        let response = self.send(request, "create-session", url).await?;
        Self::decode(response, "decode-created-session").await
    }

    /// Validates locally before sending, so an invalid patch never reaches the server.
    async fn patch_session(
        &self,
        session_id: SessionId,
        patch: SessionPatch,
    ) -> ApiResult<SessionRecord> {
        patch.validate()?;

        let url = self.session_url(session_id);
        let request = self
            .client
            .patch(&url)
            .json(&patch)
            .timeout(self.request_timeout);
        let request = self.authorized(request, "update-session")?;

        let response = self.send(request, "update-session", url).await?;
        Self::decode(response, "decode-updated-session").await
    }

    async fn remove_session(&self, session_id: SessionId) -> ApiResult<()> {
        let url = self.session_url(session_id);
        let request = self.client.delete(&url).timeout(self.request_timeout);
        let request = self.authorized(request, "delete-session")?;

        self.send(request, "delete-session", url).await?;
        Ok(())
    }

    /// Persisted history of one session, oldest first.
    async fn fetch_messages(&self, session_id: SessionId) -> ApiResult<Vec<MessageRecord>> {
        let url = self.url(&format!("/chat/sessions/{session_id}/messages"));
        let request = self.client.get(&url).timeout(self.request_timeout);
        let request = self.authorized(request, "list-messages")?;

        let response = self.send(request, "list-messages", url).await?;
        Self::decode(response, "decode-messages").await
    }

    async fn post_completion(
        &self,
        session_id: SessionId,
        request: CompletionRequest,
    ) -> ApiResult<ByteStream> {
        let stage = "open-completion";
        let url = self.url(&format!("/chat/sessions/{session_id}/completion"));
        // Only the wait for headers is bounded: the body stays open while the answer streams.
        let builder = self.client.post(&url).json(&request);
        let builder = self.authorized(builder, stage)?;

        tracing::debug!(session_id = %session_id, "opening completion stream");
        let response = tokio::time::timeout(self.request_timeout, builder.send())
            .await
            .context(TimeoutSnafu {
                stage,
                url: url.clone(),
                timeout: self.request_timeout,
            })?
            .context(TransportSnafu { stage, url })?;
        let response = self.check_status(response, stage).await?;

        Ok(response
            .bytes_stream()
            .map_err(|source| ApiError::ReadBody {
                stage: "read-completion-body",
                source,
            })
            .boxed())
    }
}

impl SessionApi for HttpBackend {
    fn list_sessions(&self) -> BoxFuture<'_, ApiResult<Vec<SessionRecord>>> {
        Box::pin(self.fetch_sessions())
    }

    fn get_session(&self, session_id: SessionId) -> BoxFuture<'_, ApiResult<SessionRecord>> {
        Box::pin(self.fetch_session(session_id))
    }

    fn create_session(&self, input: NewSession) -> BoxFuture<'_, ApiResult<SessionRecord>> {
        Box::pin(self.post_session(input))
    }

    fn update_session(
        &self,
        session_id: SessionId,
        patch: SessionPatch,
    ) -> BoxFuture<'_, ApiResult<SessionRecord>> {
        Box::pin(self.patch_session(session_id, patch))
    }

    fn delete_session(&self, session_id: SessionId) -> BoxFuture<'_, ApiResult<()>> {
        Box::pin(self.remove_session(session_id))
    }

    fn list_messages(&self, session_id: SessionId) -> BoxFuture<'_, ApiResult<Vec<MessageRecord>>> {
        Box::pin(self.fetch_messages(session_id))
    }
}

impl CompletionApi for HttpBackend {
    fn open_completion(
        &self,
        session_id: SessionId,
        request: CompletionRequest,
    ) -> BoxFuture<'_, ApiResult<ByteStream>> {
        Box::pin(self.post_completion(session_id, request))
    }
}
