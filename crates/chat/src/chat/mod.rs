pub mod events;
pub mod exchange;
pub mod message;

pub use events::{ExchangeFailure, FailureKind, StreamEventMapped, StreamEventPayload};
pub use exchange::{
    ExchangeError, ExchangeEventStream, ExchangeHandle, ExchangeOptions, ExchangeOutcome,
    ExchangeResult, ExchangeWorker, StopHandle, StreamingExchange, open_exchange,
};
pub use message::{
    Conversation, ConversationRecord, ExchangeRejection, ExchangeState, ExchangeTransition,
    ExchangeTransitionResult, StreamTarget, TurnId,
};
