//! Directory Error Types
//!
//! Structured errors for the directory API plus the predicates the auth
//! layer and the state machines classify failures with.

use thiserror::Error;

/// Server error code for a registration that raced another device.
pub const CODE_ALREADY_EXISTS: &str = "identity_already_exists";

/// Server error code for a session that was minted offline and never
/// synced with the directory.
pub const CODE_SESSION_NOT_SYNCED: &str = "session_not_synced";

/// Error from a directory API call.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// The server answered with a non-success status.
    #[error("directory API error: {method} {path} -> {status}: {message}")]
    Api {
        method: String,
        path: String,
        status: u16,
        /// Structured error code from the response body, when present.
        code: Option<String>,
        message: String,
    },

    /// The request never produced a response (DNS, connect, timeout).
    #[error("directory request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl DirectoryError {
    pub fn status(&self) -> Option<u16> {
        match self {
            DirectoryError::Api { status, .. } => Some(*status),
            DirectoryError::Transport(e) => e.status().map(|s| s.as_u16()),
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            DirectoryError::Api { code, .. } => code.as_deref(),
            DirectoryError::Transport(_) => None,
        }
    }
}

/// Whether an error means "this identity is already registered".
///
/// Prefers the structured `code` field; falls back to message matching
/// as a compatibility shim for older directory deployments.
pub fn is_already_exists_error(err: &anyhow::Error) -> bool {
    if let Some(dir_err) = err.downcast_ref::<DirectoryError>() {
        if dir_err.code() == Some(CODE_ALREADY_EXISTS) {
            return true;
        }
        if dir_err.status() == Some(409) {
            return true;
        }
    }
    let msg = format!("{err:#}").to_lowercase();
    msg.contains("already exists") || msg.contains("already registered")
}

/// Whether an error means the session was minted offline and the
/// directory has never seen it. Recoverable by syncing first.
pub fn is_session_not_synced_error(err: &anyhow::Error) -> bool {
    if let Some(dir_err) = err.downcast_ref::<DirectoryError>() {
        if dir_err.code() == Some(CODE_SESSION_NOT_SYNCED) {
            return true;
        }
    }
    let msg = format!("{err:#}").to_lowercase();
    msg.contains("never been synced") || msg.contains("not synced") || msg.contains("unknown session")
}

/// Whether an error is a plain network or timeout failure, as opposed
/// to the server rejecting the request. These degrade to "proceed
/// offline, retry later" rather than blocking.
pub fn is_network_or_timeout_error(err: &anyhow::Error) -> bool {
    if let Some(dir_err) = err.downcast_ref::<DirectoryError>() {
        if let DirectoryError::Transport(e) = dir_err {
            return e.is_timeout() || e.is_connect() || e.is_request();
        }
        return false;
    }
    if let Some(e) = err.downcast_ref::<reqwest::Error>() {
        return e.is_timeout() || e.is_connect() || e.is_request();
    }
    let msg = format!("{err:#}").to_lowercase();
    msg.contains("timed out")
        || msg.contains("timeout")
        || msg.contains("connection refused")
        || msg.contains("network")
        || msg.contains("dns")
}
