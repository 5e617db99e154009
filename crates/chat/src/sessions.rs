use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use ragline_api::{ApiError, NewSession, SessionApi, SessionId, SessionPatch, SessionRecord};
use snafu::{ResultExt, Snafu};
use tokio::sync::watch;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SyncError {
    #[snafu(display("session list request failed on `{stage}`: {source}"))]
    Request {
        stage: &'static str,
        source: ApiError,
    },
}

pub type SyncResult<T> = Result<T, SyncError>;

/// What readers of the session list observe.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionListSnapshot {
    pub sessions: Vec<SessionRecord>,
    /// True while at least one full list fetch is in flight.
    pub loading: bool,
}

impl SessionListSnapshot {
    /// Looks up one session by id.
    pub fn get(&self, session_id: SessionId) -> Option<&SessionRecord> {
        self.sessions
            .iter()
            .find(|session| session.id == session_id)
    }
}

/// Shared, ordered session list kept in step with the server.
///
/// Every mutation is applied only after the server confirmed it, and each one is a single
/// `send_modify`, so subscribers never see a half-applied change.
#[derive(Clone)]
pub struct SessionListSynchronizer {
    api: Arc<dyn SessionApi>,
    state: Arc<watch::Sender<SessionListSnapshot>>,
    fetches: Arc<ListFetches>,
}

// Book-keeping for overlapping `list` calls. Only touched inside `send_modify`.
#[derive(Debug, Default)]
struct ListFetches {
    issued: AtomicU64,
    applied: AtomicU64,
    in_flight: AtomicUsize,
}

impl ListFetches {
    fn begin(&self) -> u64 {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.issued.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns whether fetches are still pending after this one.
    fn finish(&self) -> bool {
        self.in_flight.fetch_sub(1, Ordering::SeqCst) > 1
    }

    /// Claims the list for `generation` unless a newer fetch already wrote it.
    fn claim(&self, generation: u64) -> bool {
        if generation <= self.applied.load(Ordering::SeqCst) {
            return false;
        }
        self.applied.store(generation, Ordering::SeqCst);
        true
    }
}

impl SessionListSynchronizer {
    /// Creates an empty list backed by the given session endpoints.
    pub fn new(api: Arc<dyn SessionApi>) -> Self {
        let (state, _) = watch::channel(SessionListSnapshot::default());
        Self {
            api,
            state: Arc::new(state),
            fetches: Arc::new(ListFetches::default()),
        }
    }

    /// Current list and loading flag.
    pub fn snapshot(&self) -> SessionListSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionListSnapshot> {
        self.state.subscribe()
    }

    /// Cached entry for one session, if it is in the list.
    pub fn get(&self, session_id: SessionId) -> Option<SessionRecord> {
        self.state.borrow().get(session_id).cloned()
    }

    /// Replaces the whole list with the server's. A failure leaves the old list in place.
    ///
    /// Overlapping calls may finish in any order; a response older than the one already
    /// applied is returned to its caller but not written to the list.
    pub async fn list(&self) -> SyncResult<Vec<SessionRecord>> {
        let mut generation = 0;
        self.state.send_modify(|snapshot| {
            generation = self.fetches.begin();
            snapshot.loading = true;
        });

        let fetched = self.api.list_sessions().await;
        self.state.send_modify(|snapshot| {
            snapshot.loading = self.fetches.finish();
            if let Ok(sessions) = &fetched
                && self.fetches.claim(generation)
            {
                snapshot.sessions = sessions.clone();
            }
        });

        match fetched {
            Ok(sessions) => {
                tracing::debug!(count = sessions.len(), generation, "session list fetched");
                Ok(sessions)
            }
            Err(source) => {
                tracing::warn!(error = %source, "failed to fetch session list");
                Err(SyncError::Request {
                    stage: "list-sessions",
                    source,
                })
            }
        }
    }

    /// Creates a session and puts it first once the server returned it.
    pub async fn create(&self, input: NewSession) -> SyncResult<SessionRecord> {
        let created = self
            .api
            .create_session(input)
            .await
            .inspect_err(|error| tracing::warn!(error = %error, "failed to create session"))
            .context(RequestSnafu {
                stage: "create-session",
            })?;

        tracing::info!(session_id = %created.id, "session created");
        self.state.send_modify(|snapshot| {
            snapshot.sessions.retain(|session| session.id != created.id);
            snapshot.sessions.insert(0, created.clone());
        });
        Ok(created)
    }

    pub async fn remove(&self, session_id: SessionId) -> SyncResult<()> {
        self.api
            .delete_session(session_id)
            .await
            .inspect_err(|error| {
                tracing::warn!(
                    session_id = %session_id,
                    error = %error,
                    "failed to delete session"
                );
            })
            .context(RequestSnafu {
                stage: "delete-session",
            })?;

        tracing::info!(session_id = %session_id, "session deleted");
        self.state.send_modify(|snapshot| {
            snapshot.sessions.retain(|session| session.id != session_id);
        });
        Ok(())
    }

    /// Sends a partial update, then merges just the provided fields into the local entry.
    pub async fn patch(
        &self,
        session_id: SessionId,
        patch: SessionPatch,
    ) -> SyncResult<SessionRecord> {
        patch.validate().context(RequestSnafu {
            stage: "validate-session-patch",
        })?;

        let updated = self
            .api
            .update_session(session_id, patch.clone())
            .await
            .inspect_err(|error| {
                tracing::warn!(
                    session_id = %session_id,
                    error = %error,
                    "failed to update session"
                );
            })
            .context(RequestSnafu {
                stage: "update-session",
            })?;

        self.state.send_modify(|snapshot| {
            if let Some(session) = snapshot
                .sessions
                .iter_mut()
                .find(|session| session.id == session_id)
            {
                session.merge_patch(&patch);
                session.updated_at = updated.updated_at;
            }
        });
        Ok(updated)
    }

    /// Replaces one entry with the server's canonical record, adding it to the front when
    /// the list does not hold it yet.
    pub async fn refresh(&self, session_id: SessionId) -> SyncResult<SessionRecord> {
        let fresh = self
            .api
            .get_session(session_id)
            .await
            .context(RequestSnafu {
                stage: "refresh-session",
            })?;

        self.state.send_modify(|snapshot| {
            match snapshot
                .sessions
                .iter_mut()
                .find(|session| session.id == session_id)
            {
                Some(session) => *session = fresh.clone(),
                None => snapshot.sessions.insert(0, fresh.clone()),
            }
        });
        tracing::debug!(session_id = %session_id, title = %fresh.title, "session refreshed");
        Ok(fresh)
    }
}
