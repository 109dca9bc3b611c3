//! Token Guard
//!
//! Ensures a valid access token exists before any authenticated call.
//! No retries live here; retry policy belongs to callers.

use std::time::Duration;

use tracing::{debug, warn};

use crate::directory::is_session_not_synced_error;

use super::context::AuthContext;
use super::AuthError;

/// Default number of polls in [`wait_for_valid_token`].
pub const TOKEN_POLL_ATTEMPTS: u32 = 20;

/// Default poll interval in [`wait_for_valid_token`].
pub const TOKEN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Make sure the context holds a valid access token.
///
/// - Valid token already held: returns immediately, no I/O.
/// - No session: returns Ok. "No token, no session" is an
///   unauthenticated state, not an error; callers decide what that means.
/// - Otherwise exchanges the session id for a fresh token. A session the
///   directory has never seen (offline-born, never synced) surfaces as
///   [`AuthError::SessionSyncRequired`] so the caller can sync and retry;
///   any other failure propagates unchanged.
pub async fn ensure_valid_token(ctx: &AuthContext) -> Result<(), AuthError> {
    if ctx.has_valid_token() {
        return Ok(());
    }

    let Some(session_id) = ctx.session_id() else {
        debug!("no session; treating as unauthenticated");
        return Ok(());
    };

    match ctx.directory().get_token_by_session(&session_id).await {
        Ok(token) => {
            ctx.set_token(token);
            Ok(())
        }
        Err(err) if is_session_not_synced_error(&err) => {
            warn!("session {} has never been synced; sync required", session_id);
            Err(AuthError::SessionSyncRequired)
        }
        Err(err) => Err(AuthError::Other(err)),
    }
}

/// Poll for a valid token on a bounded interval.
///
/// Used after a recovery sign-in, where token issuance may lag the
/// session. Bounded by `max_attempts` so it always terminates; returns
/// whether a valid token was observed.
pub async fn wait_for_valid_token(
    ctx: &AuthContext,
    max_attempts: u32,
    interval: Duration,
) -> bool {
    for attempt in 0..max_attempts {
        if ctx.has_valid_token() {
            return true;
        }
        // Refresh attempts are best-effort; a failure here just means
        // we keep polling until the bound runs out.
        if let Err(err) = ensure_valid_token(ctx).await {
            debug!("token poll attempt {} failed: {}", attempt + 1, err);
        }
        if ctx.has_valid_token() {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    ctx.has_valid_token()
}
