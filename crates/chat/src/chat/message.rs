use chrono::{DateTime, Utc};
use ragline_api::{
    MessageId, MessageRecord, MessageRole, SessionId, SessionRecord, is_placeholder_title,
};
use ragline_protocol::Citation;
use snafu::Snafu;

use super::events::{ExchangeFailure, StreamEventMapped, StreamEventPayload};

/// Identifier for one question/answer turn inside a conversation.
///
/// This must change on every submit so stale events can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(pub u64);

impl TurnId {
    /// Creates a typed turn identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Stream routing key used for stale-event rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub session_id: SessionId,
    pub turn_id: TurnId,
}

impl StreamTarget {
    /// Creates the routing key for one turn of one session.
    pub const fn new(session_id: SessionId, turn_id: TurnId) -> Self {
        Self {
            session_id,
            turn_id,
        }
    }
}

/// One message as shown in a conversation view.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRecord {
    /// Absent until the server persisted the message.
    pub id: Option<MessageId>,
    pub role: MessageRole,
    pub content: String,
    /// `None` until a sources frame arrived for this answer.
    pub citations: Option<Vec<Citation>>,
    pub usage_tokens: Option<u64>,
    pub in_progress: bool,
    pub created_at: Option<DateTime<Utc>>,
}

impl ConversationRecord {
    /// Question record as typed by the user.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: None,
            role: MessageRole::User,
            content: content.into(),
            citations: None,
            usage_tokens: None,
            in_progress: false,
            created_at: Some(Utc::now()),
        }
    }

    /// Empty assistant placeholder filled while the answer streams.
    pub fn assistant_streaming() -> Self {
        Self {
            id: None,
            role: MessageRole::Assistant,
            content: String::new(),
            citations: None,
            usage_tokens: None,
            in_progress: true,
            created_at: Some(Utc::now()),
        }
    }
}

impl From<MessageRecord> for ConversationRecord {
    fn from(record: MessageRecord) -> Self {
        let citations = (!record.sources.is_empty()).then_some(record.sources);
        let usage_tokens = (record.token_usage > 0.0).then(|| record.token_usage.round() as u64);

        Self {
            id: Some(record.id),
            role: record.role,
            content: record.content,
            citations,
            usage_tokens,
            in_progress: false,
            created_at: Some(record.created_at),
        }
    }
}

/// Conversation aggregate root for one session's view.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub session_id: SessionId,
    pub title: String,
    pub records: Vec<ConversationRecord>,
    pub exchange_state: ExchangeState,
    next_turn: u64,
}

impl Conversation {
    /// Creates an empty, idle conversation for a session.
    pub fn new(session_id: SessionId, title: impl Into<String>) -> Self {
        Self {
            session_id,
            title: title.into(),
            records: Vec::new(),
            exchange_state: ExchangeState::Idle,
            next_turn: 1,
        }
    }

    pub fn from_session(session: &SessionRecord) -> Self {
        Self::new(session.id, session.title.clone())
    }

    pub fn has_placeholder_title(&self) -> bool {
        is_placeholder_title(&self.title)
    }

    /// Replaces the records with persisted history. Refused while a turn is running.
    pub fn hydrate(
        &mut self,
        history: impl IntoIterator<Item = MessageRecord>,
    ) -> Result<(), ExchangeRejection> {
        if let Some(active) = self.exchange_state.active_target() {
            return Err(ExchangeRejection::AlreadyRunning {
                active,
                attempted: active,
            });
        }

        self.records = history.into_iter().map(ConversationRecord::from).collect();
        Ok(())
    }

    pub fn active_target(&self) -> Option<StreamTarget> {
        self.exchange_state.active_target()
    }

    /// The assistant record currently being streamed into.
    pub fn in_progress_record(&self) -> Option<&ConversationRecord> {
        self.records.iter().rev().find(|record| record.in_progress)
    }

    pub fn last_answer(&self) -> Option<&ConversationRecord> {
        self.records
            .iter()
            .rev()
            .find(|record| record.role == MessageRole::Assistant)
    }

    /// Starts a turn: appends the user record and an empty assistant placeholder.
    pub fn begin_turn(
        &mut self,
        question: impl Into<String>,
    ) -> Result<StreamTarget, ExchangeRejection> {
        let target = StreamTarget::new(self.session_id, TurnId::new(self.next_turn));
        self.apply_exchange_transition(ExchangeTransition::Send(target))?;
        self.next_turn += 1;

        self.records.push(ConversationRecord::user(question));
        self.records.push(ConversationRecord::assistant_streaming());
        Ok(target)
    }

    /// Applies one mapped stream event to the in-progress record.
    ///
    /// Events for any target other than the running turn are rejected untouched.
    pub fn apply_stream_event(
        &mut self,
        event: StreamEventMapped,
    ) -> Result<&ExchangeState, ExchangeRejection> {
        let target = event.target;
        self.ensure_current(target)?;

        if matches!(self.exchange_state, ExchangeState::Sending(_)) {
            self.apply_exchange_transition(ExchangeTransition::Accept(target))?;
        }

        match event.payload {
            StreamEventPayload::Content(fragment) => {
                if let Some(record) = self.in_progress_record_mut() {
                    record.content.push_str(&fragment);
                }
            }
            StreamEventPayload::Sources(citations) => {
                if let Some(record) = self.in_progress_record_mut() {
                    record.citations = Some(citations);
                }
            }
            StreamEventPayload::Usage(usage) => {
                if let Some(record) = self.in_progress_record_mut() {
                    record.usage_tokens = Some(usage.total_tokens);
                }
            }
            StreamEventPayload::Done => {
                self.apply_exchange_transition(ExchangeTransition::Finalize(target))?;
                if let Some(record) = self.in_progress_record_mut() {
                    record.in_progress = false;
                }
            }
            StreamEventPayload::Error(failure) => {
                self.apply_exchange_transition(ExchangeTransition::Fail { target, failure })?;
                self.roll_back_placeholder();
            }
        }

        Ok(&self.exchange_state)
    }

    /// Completes a finalized turn.
    pub fn complete(&mut self, target: StreamTarget) -> Result<&ExchangeState, ExchangeRejection> {
        self.apply_exchange_transition(ExchangeTransition::Complete(target))?;
        Ok(&self.exchange_state)
    }

    /// Fails the running turn from outside the event stream.
    pub fn fail(
        &mut self,
        target: StreamTarget,
        failure: ExchangeFailure,
    ) -> Result<&ExchangeState, ExchangeRejection> {
        self.apply_exchange_transition(ExchangeTransition::Fail { target, failure })?;
        self.roll_back_placeholder();
        Ok(&self.exchange_state)
    }

    /// Stops the running turn, keeping whatever content already arrived.
    pub fn cancel(&mut self, target: StreamTarget) -> Result<&ExchangeState, ExchangeRejection> {
        self.apply_exchange_transition(ExchangeTransition::Cancel(target))?;
        self.roll_back_placeholder();
        Ok(&self.exchange_state)
    }

    pub fn apply_exchange_transition(
        &mut self,
        transition: ExchangeTransition,
    ) -> ExchangeTransitionResult {
        let next_state = self.exchange_state.apply(transition)?;
        self.exchange_state = next_state.clone();
        Ok(next_state)
    }

    fn ensure_current(&self, target: StreamTarget) -> Result<(), ExchangeRejection> {
        match self.exchange_state.active_target() {
            Some(active) if active == target => Ok(()),
            Some(active) => Err(ExchangeRejection::TargetMismatch {
                active,
                attempted: target,
            }),
            None => Err(ExchangeRejection::NoActiveExchange),
        }
    }

    fn in_progress_record_mut(&mut self) -> Option<&mut ConversationRecord> {
        self.records.iter_mut().rev().find(|record| record.in_progress)
    }

    // An empty placeholder disappears; a partial answer stays, no longer in progress.
    fn roll_back_placeholder(&mut self) {
        let Some(index) = self.records.iter().rposition(|record| record.in_progress) else {
            return;
        };

        if self.records[index].content.is_empty() {
            self.records.remove(index);
        } else {
            self.records[index].in_progress = false;
        }
    }
}

/// Lifecycle of the conversation's current question/answer turn.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ExchangeState {
    #[default]
    Idle,
    Sending(StreamTarget),
    Streaming(StreamTarget),
    Finalizing(StreamTarget),
    Completed(StreamTarget),
    Failed {
        target: StreamTarget,
        failure: ExchangeFailure,
    },
    Cancelled(StreamTarget),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeTransition {
    Send(StreamTarget),
    /// The server accepted the request and the body is being read.
    Accept(StreamTarget),
    /// The body ended normally.
    Finalize(StreamTarget),
    Complete(StreamTarget),
    Fail {
        target: StreamTarget,
        failure: ExchangeFailure,
    },
    Cancel(StreamTarget),
}

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum ExchangeRejection {
    #[snafu(display("turn {} is still running", active.turn_id.0))]
    AlreadyRunning {
        active: StreamTarget,
        attempted: StreamTarget,
    },
    #[snafu(display("no turn is running"))]
    NoActiveExchange,
    #[snafu(display(
        "event for turn {} does not match running turn {}",
        attempted.turn_id.0,
        active.turn_id.0
    ))]
    TargetMismatch {
        active: StreamTarget,
        attempted: StreamTarget,
    },
    #[snafu(display("`{transition}` is not allowed while turn {} is {phase}", active.turn_id.0))]
    OutOfOrder {
        active: StreamTarget,
        phase: &'static str,
        transition: &'static str,
    },
}

pub type ExchangeTransitionResult = Result<ExchangeState, ExchangeRejection>;

impl ExchangeState {
    /// Target of the running turn, if one is between `Sending` and `Finalizing`.
    pub fn active_target(&self) -> Option<StreamTarget> {
        match self {
            Self::Sending(target) | Self::Streaming(target) | Self::Finalizing(target) => {
                Some(*target)
            }
            Self::Idle | Self::Completed(_) | Self::Failed { .. } | Self::Cancelled(_) => None,
        }
    }

    fn phase(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Sending(_) => "sending",
            Self::Streaming(_) => "streaming",
            Self::Finalizing(_) => "finalizing",
            Self::Completed(_) => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled(_) => "cancelled",
        }
    }

    /// Applies one transition deterministically.
    ///
    /// Only a settled state may start a new turn. Every other transition must name the
    /// running turn exactly.
    pub fn apply(&self, transition: ExchangeTransition) -> ExchangeTransitionResult {
        match transition {
            ExchangeTransition::Send(target) => self.apply_send(target),
            ExchangeTransition::Accept(target) => {
                self.advance(target, "accept", |state| match state {
                    Self::Sending(_) => Some(Self::Streaming(target)),
                    _ => None,
                })
            }
            ExchangeTransition::Finalize(target) => {
                self.advance(target, "finalize", |state| match state {
                    Self::Streaming(_) => Some(Self::Finalizing(target)),
                    _ => None,
                })
            }
            ExchangeTransition::Complete(target) => {
                self.advance(target, "complete", |state| match state {
                    Self::Finalizing(_) => Some(Self::Completed(target)),
                    _ => None,
                })
            }
            ExchangeTransition::Fail { target, failure } => {
                self.advance(target, "fail", |state| match state {
                    Self::Sending(_) | Self::Streaming(_) => Some(Self::Failed { target, failure }),
                    _ => None,
                })
            }
            ExchangeTransition::Cancel(target) => {
                self.advance(target, "cancel", |state| match state {
                    Self::Sending(_) | Self::Streaming(_) => Some(Self::Cancelled(target)),
                    _ => None,
                })
            }
        }
    }

    fn apply_send(&self, target: StreamTarget) -> ExchangeTransitionResult {
        match self.active_target() {
            Some(active) => Err(ExchangeRejection::AlreadyRunning {
                active,
                attempted: target,
            }),
            None => Ok(Self::Sending(target)),
        }
    }

    fn advance(
        &self,
        target: StreamTarget,
        transition: &'static str,
        next: impl FnOnce(&Self) -> Option<Self>,
    ) -> ExchangeTransitionResult {
        let Some(active) = self.active_target() else {
            return Err(ExchangeRejection::NoActiveExchange);
        };

        if active != target {
            return Err(ExchangeRejection::TargetMismatch {
                active,
                attempted: target,
            });
        }

        next(self).ok_or(ExchangeRejection::OutOfOrder {
            active,
            phase: self.phase(),
            transition,
        })
    }
}

#[cfg(test)]
mod tests {
    use ragline_protocol::Usage;
    use uuid::Uuid;

    use super::*;
    use crate::chat::events::FailureKind;

    fn conversation() -> Conversation {
        Conversation::new(SessionId::new(Uuid::new_v4()), "New Chat")
    }

    fn event(target: StreamTarget, payload: StreamEventPayload) -> StreamEventMapped {
        StreamEventMapped { target, payload }
    }

    fn generic_failure(message: &str) -> ExchangeFailure {
        ExchangeFailure::new(FailureKind::Generic, message)
    }

    #[test]
    fn begin_turn_appends_user_record_and_empty_placeholder() {
        let mut conversation = conversation();
        let target = conversation.begin_turn("What is X?").unwrap();

        assert_eq!(conversation.exchange_state, ExchangeState::Sending(target));
        assert_eq!(conversation.records.len(), 2);
        assert_eq!(conversation.records[0].role, MessageRole::User);
        assert!(!conversation.records[0].in_progress);
        assert_eq!(conversation.records[1].role, MessageRole::Assistant);
        assert!(conversation.records[1].in_progress);
        assert!(conversation.records[1].content.is_empty());
    }

    #[test]
    fn second_turn_is_rejected_while_one_is_running() {
        let mut conversation = conversation();
        let active = conversation.begin_turn("first").unwrap();

        let rejection = conversation.begin_turn("second").unwrap_err();

        assert!(matches!(
            rejection,
            ExchangeRejection::AlreadyRunning { active: running, .. } if running == active
        ));
        assert_eq!(conversation.records.len(), 2);
    }

    #[test]
    fn content_appends_while_citations_and_usage_replace() {
        let mut conversation = conversation();
        let target = conversation.begin_turn("q").unwrap();
        let citation = |name: &str| Citation {
            filename: name.to_string(),
            page: None,
            content: String::new(),
            score: None,
            knowledge_id: None,
        };

        for payload in [
            StreamEventPayload::Content("X is ".to_string()),
            StreamEventPayload::Sources(vec![citation("a.pdf"), citation("b.pdf")]),
            StreamEventPayload::Content("Y".to_string()),
            StreamEventPayload::Sources(vec![citation("c.pdf")]),
            StreamEventPayload::Usage(Usage {
                input_tokens: 1,
                output_tokens: 1,
                total_tokens: 2,
            }),
            StreamEventPayload::Usage(Usage {
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
            }),
        ] {
            conversation.apply_stream_event(event(target, payload)).unwrap();
        }

        let record = conversation.in_progress_record().unwrap();
        assert_eq!(record.content, "X is Y");
        assert_eq!(record.citations.as_ref().map(Vec::len), Some(1));
        assert_eq!(record.usage_tokens, Some(15));
        assert_eq!(conversation.exchange_state, ExchangeState::Streaming(target));
    }

    #[test]
    fn done_finalizes_and_complete_settles_the_turn() {
        let mut conversation = conversation();
        let target = conversation.begin_turn("q").unwrap();

        conversation
            .apply_stream_event(event(target, StreamEventPayload::Content("a".into())))
            .unwrap();
        let state = conversation
            .apply_stream_event(event(target, StreamEventPayload::Done))
            .unwrap();
        assert_eq!(state, &ExchangeState::Finalizing(target));
        assert!(conversation.in_progress_record().is_none());

        conversation.complete(target).unwrap();
        assert_eq!(conversation.exchange_state, ExchangeState::Completed(target));
        assert_eq!(conversation.last_answer().unwrap().content, "a");
    }

    #[test]
    fn failure_before_content_removes_placeholder() {
        let mut conversation = conversation();
        let target = conversation.begin_turn("q").unwrap();

        conversation
            .apply_stream_event(event(
                target,
                StreamEventPayload::Error(generic_failure("boom")),
            ))
            .unwrap();

        assert_eq!(conversation.records.len(), 1);
        assert_eq!(conversation.records[0].role, MessageRole::User);
        assert!(matches!(
            conversation.exchange_state,
            ExchangeState::Failed { .. }
        ));
    }

    #[test]
    fn failure_after_content_keeps_partial_answer() {
        let mut conversation = conversation();
        let target = conversation.begin_turn("q").unwrap();

        conversation
            .apply_stream_event(event(target, StreamEventPayload::Content("part".into())))
            .unwrap();
        conversation
            .apply_stream_event(event(
                target,
                StreamEventPayload::Error(generic_failure("lost connection")),
            ))
            .unwrap();

        assert_eq!(conversation.records.len(), 2);
        assert_eq!(conversation.records[1].content, "part");
        assert!(!conversation.records[1].in_progress);
    }

    #[test]
    fn stale_turn_events_are_rejected_untouched() {
        let mut conversation = conversation();
        let first = conversation.begin_turn("first").unwrap();
        conversation.cancel(first).unwrap();
        let second = conversation.begin_turn("second").unwrap();

        let rejection = conversation
            .apply_stream_event(event(first, StreamEventPayload::Content("late".into())))
            .unwrap_err();

        assert_eq!(
            rejection,
            ExchangeRejection::TargetMismatch {
                active: second,
                attempted: first,
            }
        );
        assert!(conversation.in_progress_record().unwrap().content.is_empty());
    }

    #[test]
    fn events_without_running_turn_are_rejected() {
        let mut conversation = conversation();
        let target = StreamTarget::new(conversation.session_id, TurnId::new(7));

        assert_eq!(
            conversation
                .apply_stream_event(event(target, StreamEventPayload::Done))
                .unwrap_err(),
            ExchangeRejection::NoActiveExchange
        );
    }

    #[test]
    fn complete_before_finalize_is_out_of_order() {
        let mut conversation = conversation();
        let target = conversation.begin_turn("q").unwrap();

        let rejection = conversation.complete(target).unwrap_err();

        assert!(matches!(
            rejection,
            ExchangeRejection::OutOfOrder { phase: "sending", transition: "complete", .. }
        ));
    }

    #[test]
    fn cancel_keeps_partial_content_and_drops_empty_placeholder() {
        let mut partial = conversation();
        let target = partial.begin_turn("q").unwrap();
        partial
            .apply_stream_event(event(target, StreamEventPayload::Content("half".into())))
            .unwrap();
        partial.cancel(target).unwrap();

        assert_eq!(partial.exchange_state, ExchangeState::Cancelled(target));
        assert_eq!(partial.records[1].content, "half");
        assert!(!partial.records[1].in_progress);

        let mut empty = conversation();
        let target = empty.begin_turn("q").unwrap();
        empty.cancel(target).unwrap();
        assert_eq!(empty.records.len(), 1);
    }

    #[test]
    fn hydrate_loads_finalized_history() {
        let mut conversation = conversation();
        let history: Vec<MessageRecord> = serde_json::from_str(
            r#"[
                {"id":1,"role":"user","content":"What is X?","created_at":"2025-03-01T08:30:00"},
                {"id":2,"role":"assistant","content":"X is...","sources":[{"filename":"a.md","content":"x"}],"token_usage":42.0,"created_at":"2025-03-01T08:30:05"}
            ]"#,
        )
        .unwrap();

        conversation.hydrate(history).unwrap();

        assert_eq!(conversation.records.len(), 2);
        assert!(conversation.records.iter().all(|record| !record.in_progress));
        assert_eq!(conversation.records[0].citations, None);
        assert_eq!(conversation.records[1].id, Some(MessageId::new(2)));
        assert_eq!(conversation.records[1].usage_tokens, Some(42));
        assert_eq!(conversation.records[1].citations.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn hydrate_is_refused_during_a_turn() {
        let mut conversation = conversation();
        conversation.begin_turn("q").unwrap();

        assert!(conversation.hydrate(Vec::new()).is_err());
        assert_eq!(conversation.records.len(), 2);
    }
}
