use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::{Duration, Utc};
use futures::{StreamExt, future, stream};
use ragline_api::{
    ApiError, ApiResult, BoxFuture, ByteStream, CompletionApi, CompletionRequest,
    DEFAULT_SESSION_ICON, DEFAULT_SESSION_TITLE, DEFAULT_TOP_K, KnowledgeId, MessageRecord,
    NewSession, SessionApi, SessionId, SessionPatch, SessionRecord, UserId,
};
use tokio::sync::oneshot;
use uuid::Uuid;

pub(crate) fn session(title: &str) -> SessionRecord {
    let now = Utc::now();
    SessionRecord {
        id: SessionId::new(Uuid::new_v4()),
        title: title.to_string(),
        icon: DEFAULT_SESSION_ICON.to_string(),
        top_k: DEFAULT_TOP_K,
        knowledge_id: KnowledgeId::new(1),
        knowledge_ids: vec![KnowledgeId::new(1)],
        user_id: UserId::new(9),
        created_at: now,
        updated_at: now,
    }
}

fn status_error(status: u16, detail: impl Into<String>) -> ApiError {
    ApiError::Status {
        stage: "fake-backend",
        status,
        detail: detail.into(),
    }
}

/// In-memory session CRUD with one-shot failure injection.
#[derive(Default)]
pub(crate) struct FakeSessionApi {
    sessions: Mutex<Vec<SessionRecord>>,
    history: Mutex<Vec<MessageRecord>>,
    failure: Mutex<Option<String>>,
    list_gates: Mutex<VecDeque<oneshot::Receiver<()>>>,
    update_calls: AtomicUsize,
}

impl FakeSessionApi {
    pub(crate) fn with_sessions(sessions: Vec<SessionRecord>) -> Self {
        Self {
            sessions: Mutex::new(sessions),
            ..Self::default()
        }
    }

    pub(crate) fn fail_next(&self, detail: &str) {
        *self.failure.lock().unwrap() = Some(detail.to_string());
    }

    /// Each upcoming list call reads the server state, then waits on its own gate.
    pub(crate) fn gate_lists(&self, gates: impl IntoIterator<Item = oneshot::Receiver<()>>) {
        self.list_gates.lock().unwrap().extend(gates);
    }

    pub(crate) fn rename_on_server(&self, session_id: SessionId, title: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.iter_mut().find(|session| session.id == session_id) {
            session.title = title.to_string();
        }
    }

    pub(crate) fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> ApiResult<()> {
        match self.failure.lock().unwrap().take() {
            Some(detail) => Err(status_error(500, detail)),
            None => Ok(()),
        }
    }

    fn find(&self, session_id: SessionId) -> ApiResult<SessionRecord> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .find(|session| session.id == session_id)
            .cloned()
            .ok_or_else(|| status_error(404, "Session not found"))
    }
}

impl SessionApi for FakeSessionApi {
    fn list_sessions(&self) -> BoxFuture<'_, ApiResult<Vec<SessionRecord>>> {
        Box::pin(async move {
            self.take_failure()?;
            let sessions = self.sessions.lock().unwrap().clone();
            let gate = self.list_gates.lock().unwrap().pop_front();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            Ok(sessions)
        })
    }

    fn get_session(&self, session_id: SessionId) -> BoxFuture<'_, ApiResult<SessionRecord>> {
        Box::pin(async move {
            self.take_failure()?;
            self.find(session_id)
        })
    }

    fn create_session(&self, input: NewSession) -> BoxFuture<'_, ApiResult<SessionRecord>> {
        Box::pin(async move {
            self.take_failure()?;
            let mut created = session(input.title.as_deref().unwrap_or(DEFAULT_SESSION_TITLE));
            created.knowledge_id = input.knowledge_id;
            created.knowledge_ids = vec![input.knowledge_id];
            self.sessions.lock().unwrap().insert(0, created.clone());
            Ok(created)
        })
    }

    fn update_session(
        &self,
        session_id: SessionId,
        patch: SessionPatch,
    ) -> BoxFuture<'_, ApiResult<SessionRecord>> {
        Box::pin(async move {
            self.update_calls.fetch_add(1, Ordering::SeqCst);
            self.take_failure()?;
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions
                .iter_mut()
                .find(|session| session.id == session_id)
                .ok_or_else(|| status_error(404, "Session not found"))?;
            session.merge_patch(&patch);
            session.updated_at += Duration::seconds(1);
            Ok(session.clone())
        })
    }

    fn delete_session(&self, session_id: SessionId) -> BoxFuture<'_, ApiResult<()>> {
        Box::pin(async move {
            self.take_failure()?;
            self.find(session_id)?;
            self.sessions
                .lock()
                .unwrap()
                .retain(|session| session.id != session_id);
            Ok(())
        })
    }

    fn list_messages(&self, session_id: SessionId) -> BoxFuture<'_, ApiResult<Vec<MessageRecord>>> {
        Box::pin(async move {
            self.take_failure()?;
            self.find(session_id)?;
            Ok(self.history.lock().unwrap().clone())
        })
    }
}

/// How one scripted completion call behaves.
pub(crate) enum CompletionScript {
    /// Body delivers the chunks, then ends.
    Chunks(Vec<&'static str>),
    /// Body delivers the chunks, then never yields again.
    ChunksThenHang(Vec<&'static str>),
    /// Body delivers the chunks, then fails mid-read.
    ChunksThenError(Vec<&'static str>, &'static str),
    /// The server refuses the request with this status and detail.
    Reject(u16, &'static str),
    /// The server never answers the request.
    NeverAnswer,
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Scripted completion endpoint that records requests and notices dropped bodies.
#[derive(Default)]
pub(crate) struct FakeCompletionApi {
    scripts: Mutex<VecDeque<CompletionScript>>,
    requests: Mutex<Vec<(SessionId, CompletionRequest)>>,
    body_dropped: Arc<AtomicBool>,
}

impl FakeCompletionApi {
    pub(crate) fn scripted(scripts: impl IntoIterator<Item = CompletionScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            ..Self::default()
        }
    }

    pub(crate) fn requests(&self) -> Vec<(SessionId, CompletionRequest)> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn body_dropped(&self) -> bool {
        self.body_dropped.load(Ordering::SeqCst)
    }

    fn body(chunks: Vec<&'static str>) -> stream::Iter<std::vec::IntoIter<ApiResult<Bytes>>> {
        stream::iter(
            chunks
                .into_iter()
                .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }
}

impl CompletionApi for FakeCompletionApi {
    fn open_completion(
        &self,
        session_id: SessionId,
        request: CompletionRequest,
    ) -> BoxFuture<'_, ApiResult<ByteStream>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push((session_id, request));
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(CompletionScript::Chunks(Vec::new()));

            let body = match script {
                CompletionScript::Chunks(chunks) => Self::body(chunks).boxed(),
                CompletionScript::ChunksThenHang(chunks) => {
                    Self::body(chunks).chain(stream::pending()).boxed()
                }
                CompletionScript::ChunksThenError(chunks, message) => Self::body(chunks)
                    .chain(stream::once(async move {
                        Err(ApiError::InvalidInput {
                            stage: "fake-body",
                            details: message.to_string(),
                        })
                    }))
                    .boxed(),
                CompletionScript::Reject(status, detail) => {
                    return Err(status_error(status, detail));
                }
                CompletionScript::NeverAnswer => return future::pending().await,
            };

            let guard = DropFlag(self.body_dropped.clone());
            Ok(body
                .map(move |chunk| {
                    let _guard = &guard;
                    chunk
                })
                .boxed())
        })
    }
}
