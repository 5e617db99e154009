#![deny(unsafe_code)]

/// Conversation state and the streaming question/answer turn.
pub mod chat;
/// Server-confirmed session list shared between readers.
pub mod sessions;
/// Client settings persistence.
pub mod settings;

#[cfg(test)]
pub(crate) mod test_support;
