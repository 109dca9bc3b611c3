//! Auth Context
//!
//! Holds the session handle and the in-memory access token for one
//! device. Passed explicitly into each state machine rather than living
//! in process-wide state, so tests can run isolated instances.

use std::sync::{Arc, Mutex};

use crate::types::{AccessToken, DirectoryClient, Session};

/// Per-device authentication state: the current session and the
/// short-lived access token minted from it.
///
/// Both fields are last-writer-wins; ordering guarantees come from
/// routing every token mutation through the token guard.
pub struct AuthContext {
    directory: Arc<dyn DirectoryClient>,
    session: Mutex<Option<Session>>,
    token: Mutex<Option<AccessToken>>,
}

impl AuthContext {
    pub fn new(directory: Arc<dyn DirectoryClient>) -> Self {
        Self {
            directory,
            session: Mutex::new(None),
            token: Mutex::new(None),
        }
    }

    pub fn with_session(directory: Arc<dyn DirectoryClient>, session: Session) -> Self {
        let ctx = Self::new(directory);
        ctx.set_session(session);
        ctx
    }

    pub fn directory(&self) -> &Arc<dyn DirectoryClient> {
        &self.directory
    }

    pub fn session(&self) -> Option<Session> {
        self.session.lock().unwrap().clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session.lock().unwrap().as_ref().map(|s| s.id.clone())
    }

    pub fn set_session(&self, session: Session) {
        *self.session.lock().unwrap() = Some(session);
    }

    /// Whether a token is present and not yet expired.
    pub fn has_valid_token(&self) -> bool {
        self.token
            .lock()
            .unwrap()
            .as_ref()
            .map(|t| t.is_valid())
            .unwrap_or(false)
    }

    /// The current token string, if a valid one is held.
    pub fn bearer_token(&self) -> Option<String> {
        self.token
            .lock()
            .unwrap()
            .as_ref()
            .filter(|t| t.is_valid())
            .map(|t| t.token.clone())
    }

    pub fn set_token(&self, token: AccessToken) {
        *self.token.lock().unwrap() = Some(token);
    }

    /// Drop the current token so the next guarded call refreshes it.
    pub fn clear_token(&self) {
        *self.token.lock().unwrap() = None;
    }
}
