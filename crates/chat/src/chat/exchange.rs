use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use futures::StreamExt;
use ragline_api::{BoxFuture, CompletionApi, CompletionRequest};
use ragline_protocol::{EventDispatcher, FrameStream};
use snafu::{ResultExt, Snafu, ensure};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::events::{ExchangeFailure, StreamEventMapped, StreamEventPayload};
use super::message::{Conversation, ExchangeRejection, ExchangeState, StreamTarget};
use crate::sessions::SessionListSynchronizer;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ExchangeError {
    #[snafu(display("question is empty on `{stage}`"))]
    EmptyQuestion { stage: &'static str },
    #[snafu(display("exchange transition rejected on `{stage}`: {source}"))]
    Rejected {
        stage: &'static str,
        source: ExchangeRejection,
    },
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Future that drives one completion request to its end.
pub type ExchangeWorker = BoxFuture<'static, ()>;

/// Receiving side of one turn's events.
///
/// Dropping it stops the worker.
pub struct ExchangeEventStream {
    target: StreamTarget,
    events: mpsc::UnboundedReceiver<StreamEventMapped>,
    cancel: CancellationToken,
}

pub struct ExchangeHandle {
    pub stream: ExchangeEventStream,
    pub worker: ExchangeWorker,
}

impl ExchangeEventStream {
    fn new(
        target: StreamTarget,
        events: mpsc::UnboundedReceiver<StreamEventMapped>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            target,
            events,
            cancel,
        }
    }

    pub fn target(&self) -> StreamTarget {
        self.target
    }

    pub async fn recv(&mut self) -> Option<StreamEventMapped> {
        self.events.recv().await
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            target: self.target,
            token: self.cancel.clone(),
        }
    }
}

impl Drop for ExchangeEventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Cloneable way to stop a running turn from anywhere, e.g. a Ctrl-C handler.
#[derive(Debug, Clone)]
pub struct StopHandle {
    target: StreamTarget,
    token: CancellationToken,
}

impl StopHandle {
    pub fn target(&self) -> StreamTarget {
        self.target
    }

    /// Returns false when the turn was already stopping.
    pub fn stop(&self) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        tracing::debug!(turn_id = self.target.turn_id.0, "stop requested");
        self.token.cancel();
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Builds the event stream and the worker that feeds it for one turn.
///
/// Nothing is sent until the worker is polled.
pub fn open_exchange<C>(
    api: Arc<C>,
    target: StreamTarget,
    request: CompletionRequest,
) -> ExchangeHandle
where
    C: CompletionApi + ?Sized + 'static,
{
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let stream = ExchangeEventStream::new(target, event_rx, cancel.clone());
    let worker: ExchangeWorker =
        Box::pin(run_exchange_worker(api, target, request, event_tx, cancel));

    ExchangeHandle { stream, worker }
}

fn emit_failure(
    event_tx: &mpsc::UnboundedSender<StreamEventMapped>,
    target: StreamTarget,
    failure: ExchangeFailure,
) {
    let _ = event_tx.send(StreamEventMapped::new(
        target,
        StreamEventPayload::Error(failure),
    ));
}

async fn run_exchange_worker<C>(
    api: Arc<C>,
    target: StreamTarget,
    request: CompletionRequest,
    event_tx: mpsc::UnboundedSender<StreamEventMapped>,
    cancel: CancellationToken,
) where
    C: CompletionApi + ?Sized + 'static,
{
    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::debug!(
                session_id = %target.session_id,
                turn_id = target.turn_id.0,
                "turn stopped before the server answered"
            );
            return;
        }
        opened = api.open_completion(target.session_id, request) => opened,
    };

    let body = match opened {
        Ok(body) => body,
        Err(error) => {
            tracing::error!(
                session_id = %target.session_id,
                turn_id = target.turn_id.0,
                error = %error,
                "failed to open completion stream"
            );
            emit_failure(&event_tx, target, ExchangeFailure::from_api_error(&error));
            return;
        }
    };

    let dispatcher = EventDispatcher::new();
    let mut frames = FrameStream::new(body);
    let mut fragments = 0usize;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // Dropping the frame stream releases the response body.
                tracing::debug!(
                    session_id = %target.session_id,
                    turn_id = target.turn_id.0,
                    fragments,
                    "completion stream cancelled"
                );
                return;
            }
            next_frame = frames.next() => {
                match next_frame {
                    Some(Ok(frame)) => {
                        let Some(event) = dispatcher.dispatch(&frame) else {
                            continue;
                        };
                        fragments += 1;
                        if event_tx.send(StreamEventMapped::new(target, event)).is_err() {
                            return;
                        }
                    }
                    Some(Err(error)) => {
                        tracing::warn!(
                            session_id = %target.session_id,
                            turn_id = target.turn_id.0,
                            error = %error,
                            "completion body failed mid-stream"
                        );
                        emit_failure(&event_tx, target, ExchangeFailure::from_api_error(&error));
                        return;
                    }
                    None => break,
                }
            }
        }
    }

    tracing::debug!(
        session_id = %target.session_id,
        turn_id = target.turn_id.0,
        fragments,
        "completion stream finished"
    );
    let _ = event_tx.send(StreamEventMapped::new(target, StreamEventPayload::Done));
}

/// Borrow of the conversation for one `drive` call.
///
/// If the drive is dropped before the turn settled, the turn is settled here: a finalized
/// answer completes, anything earlier is cancelled.
struct TurnGuard<'a> {
    conversation: &'a mut Conversation,
    target: StreamTarget,
}

impl Deref for TurnGuard<'_> {
    type Target = Conversation;

    fn deref(&self) -> &Conversation {
        &*self.conversation
    }
}

impl DerefMut for TurnGuard<'_> {
    fn deref_mut(&mut self) -> &mut Conversation {
        &mut *self.conversation
    }
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        let target = self.target;
        let settled = if self.conversation.exchange_state == ExchangeState::Finalizing(target) {
            self.conversation.complete(target).map(|_| ())
        } else if self.conversation.active_target() == Some(target) {
            self.conversation.cancel(target).map(|_| ())
        } else {
            return;
        };

        match settled {
            Ok(()) => tracing::info!(
                session_id = %target.session_id,
                turn_id = target.turn_id.0,
                "turn settled after its driver was dropped"
            ),
            Err(rejection) => tracing::warn!(
                turn_id = target.turn_id.0,
                rejection = %rejection,
                "failed to settle abandoned turn"
            ),
        }
    }
}

/// Per-request knobs forwarded with every question.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub top_k: Option<u32>,
    pub llm_model: Option<String>,
    pub rerank_model_name: Option<String>,
    pub prompt_name: Option<String>,
}

impl ExchangeOptions {
    pub fn request(&self, question: impl Into<String>) -> CompletionRequest {
        let mut request = CompletionRequest::new(question);
        if let Some(top_k) = self.top_k {
            request = request.with_top_k(top_k);
        }
        if let Some(llm_model) = &self.llm_model {
            request = request.with_llm_model(llm_model.as_str());
        }
        if let Some(rerank_model_name) = &self.rerank_model_name {
            request = request.with_rerank_model(rerank_model_name.as_str());
        }
        if let Some(prompt_name) = &self.prompt_name {
            request = request.with_prompt_name(prompt_name.as_str());
        }
        request
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeOutcome {
    Completed(StreamTarget),
    Failed {
        target: StreamTarget,
        failure: ExchangeFailure,
    },
    Cancelled(StreamTarget),
}

/// Runs question/answer turns against the completion endpoint and keeps the shared
/// session list current afterwards.
#[derive(Clone)]
pub struct StreamingExchange {
    completion: Arc<dyn CompletionApi>,
    sessions: SessionListSynchronizer,
    options: ExchangeOptions,
}

impl StreamingExchange {
    /// Creates an exchange that sends questions with server-side default options.
    pub fn new(completion: Arc<dyn CompletionApi>, sessions: SessionListSynchronizer) -> Self {
        Self {
            completion,
            sessions,
            options: ExchangeOptions::default(),
        }
    }

    /// Replaces the options sent with every question.
    pub fn with_options(mut self, options: ExchangeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn sessions(&self) -> &SessionListSynchronizer {
        &self.sessions
    }

    /// Begins a turn on the conversation and returns the not-yet-running exchange.
    pub fn start(
        &self,
        conversation: &mut Conversation,
        question: &str,
    ) -> ExchangeResult<ExchangeHandle> {
        let question = question.trim();
        ensure!(
            !question.is_empty(),
            EmptyQuestionSnafu {
                stage: "start-exchange"
            }
        );

        let target = conversation.begin_turn(question).context(RejectedSnafu {
            stage: "begin-turn",
        })?;
        tracing::info!(
            session_id = %target.session_id,
            turn_id = target.turn_id.0,
            "question submitted"
        );

        Ok(open_exchange(
            self.completion.clone(),
            target,
            self.options.request(question),
        ))
    }

    /// Asks one question and drives the answer to its end.
    pub async fn ask<F>(
        &self,
        conversation: &mut Conversation,
        question: &str,
        on_update: F,
    ) -> ExchangeResult<ExchangeOutcome>
    where
        F: FnMut(&Conversation),
    {
        let handle = self.start(conversation, question)?;
        self.drive(conversation, handle, on_update).await
    }

    /// Spawns the worker and applies its events in order until the turn settles.
    ///
    /// `on_update` runs after every applied event. Dropping the returned future stops the
    /// worker and settles the turn, so the conversation never stays mid-turn.
    pub async fn drive<F>(
        &self,
        conversation: &mut Conversation,
        handle: ExchangeHandle,
        mut on_update: F,
    ) -> ExchangeResult<ExchangeOutcome>
    where
        F: FnMut(&Conversation),
    {
        let ExchangeHandle { mut stream, worker } = handle;
        let target = stream.target();
        let stop = stream.stop_handle();
        let mut turn = TurnGuard {
            conversation,
            target,
        };
        let worker_task = tokio::spawn(worker);

        let outcome = loop {
            let next_event = tokio::select! {
                biased;
                _ = stop.token.cancelled() => None,
                event = stream.recv() => event,
            };

            let Some(event) = next_event else {
                break self.settle_unterminated(&mut turn, target, stop.is_stopped())?;
            };

            match turn.apply_stream_event(event) {
                Ok(ExchangeState::Finalizing(_)) => {
                    on_update(&turn);
                    self.refresh_placeholder_title(&mut turn).await;
                    turn.complete(target).context(RejectedSnafu {
                        stage: "complete-turn",
                    })?;
                    break ExchangeOutcome::Completed(target);
                }
                Ok(ExchangeState::Failed { failure, .. }) => {
                    let failure = failure.clone();
                    tracing::warn!(
                        session_id = %target.session_id,
                        turn_id = target.turn_id.0,
                        kind = ?failure.kind,
                        message = %failure.message,
                        "turn failed"
                    );
                    break ExchangeOutcome::Failed { target, failure };
                }
                Ok(_) => {}
                Err(rejection) => {
                    tracing::debug!(
                        turn_id = target.turn_id.0,
                        rejection = %rejection,
                        "ignoring stream event"
                    );
                    continue;
                }
            }

            on_update(&turn);
        };

        on_update(&turn);
        drop(turn);
        drop(stream);
        if let Err(error) = worker_task.await {
            tracing::warn!(
                turn_id = target.turn_id.0,
                error = %error,
                "exchange worker did not finish cleanly"
            );
        }

        Ok(outcome)
    }

    fn settle_unterminated(
        &self,
        conversation: &mut Conversation,
        target: StreamTarget,
        stopped: bool,
    ) -> ExchangeResult<ExchangeOutcome> {
        if stopped {
            conversation.cancel(target).context(RejectedSnafu {
                stage: "cancel-turn",
            })?;
            tracing::info!(
                session_id = %target.session_id,
                turn_id = target.turn_id.0,
                "turn stopped"
            );
            return Ok(ExchangeOutcome::Cancelled(target));
        }

        let failure = ExchangeFailure::from_message(
            None,
            "completion stream ended before a terminal event"
        );
        conversation
            .fail(target, failure.clone())
            .context(RejectedSnafu { stage: "fail-turn" })?;
        Ok(ExchangeOutcome::Failed { target, failure })
    }

    // The server names a fresh session after its first question; pick that title up.
    async fn refresh_placeholder_title(&self, conversation: &mut Conversation) {
        if !conversation.has_placeholder_title() {
            return;
        }

        match self.sessions.refresh(conversation.session_id).await {
            Ok(session) => conversation.title = session.title,
            Err(error) => {
                tracing::warn!(
                    session_id = %conversation.session_id,
                    error = %error,
                    "failed to refresh session metadata after first turn"
                );
            }
        }
    }
}
