use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;

/// Process-wide bearer credential shared by every request path.
///
/// Cloning yields another handle onto the same credential. Created once at startup,
/// filled by [`AuthState::sign_in`] and cleared by [`AuthState::logout`], including
/// automatically when the server rejects the credential.
#[derive(Clone, Default)]
pub struct AuthState {
    token: Arc<ArcSwapOption<String>>,
}

impl AuthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        let state = Self::new();
        state.sign_in(token);
        state
    }

    /// Stores a credential. Blank input signs out instead.
    pub fn sign_in(&self, token: impl Into<String>) {
        let token = token.into().trim().to_string();
        if token.is_empty() {
            self.logout();
            return;
        }

        self.token.store(Some(Arc::new(token)));
        tracing::debug!("stored bearer credential");
    }

    /// Current credential, read synchronously before each request.
    pub fn bearer_token(&self) -> Option<Arc<String>> {
        self.token.load_full()
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.load().is_some()
    }

    /// Clears the credential. Returns whether one was present.
    pub fn logout(&self) -> bool {
        let cleared = self.token.swap(None).is_some();
        if cleared {
            tracing::info!("signed out; bearer credential cleared");
        }
        cleared
    }
}

impl fmt::Debug for AuthState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AuthState")
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}
