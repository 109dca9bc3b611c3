//! Authentication
//!
//! Token guard, auth error classification, and the recovery wrapper the
//! state machines route every authenticated directory call through.

pub mod context;
pub mod guard;
pub mod recovery;

use thiserror::Error;

pub use context::AuthContext;
pub use guard::{ensure_valid_token, wait_for_valid_token, TOKEN_POLL_ATTEMPTS, TOKEN_POLL_INTERVAL};
pub use recovery::{authenticated_call, is_authentication_error, no_recovery, with_auth_recovery};

/// Errors from the auth layer.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The session was minted offline and the directory has never seen
    /// it. Recoverable: sync the identity, then retry.
    #[error("session has never been synced with the directory; sync first, then retry")]
    SessionSyncRequired,

    /// Authentication failed and the single recovery retry (if any) did
    /// not help. Terminal for the current call, not for the identity.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Any non-auth failure, propagated unchanged.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
