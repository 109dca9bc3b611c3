//! Auth Error Classification & Recovery
//!
//! Distinguishes authentication failures (recoverable by a sync plus
//! token refresh) from terminal errors, and wraps calls with a
//! retry-once recovery policy.

use std::future::Future;

use tracing::{debug, warn};

use crate::directory::DirectoryError;

use super::context::AuthContext;
use super::guard::ensure_valid_token;
use super::AuthError;

/// Message fragments the directory uses for auth failures. Kept as a
/// compatibility shim; the structured 401 check is preferred.
const AUTH_FAILURE_FRAGMENTS: &[&str] = &[
    "unauthorized",
    "not authenticated",
    "invalid token",
    "token expired",
    "authentication failed",
];

/// Whether a failure is an authentication failure, as opposed to a
/// terminal error. Pure predicate, no side effects.
pub fn is_authentication_error(err: &anyhow::Error) -> bool {
    if let Some(dir_err) = err.downcast_ref::<DirectoryError>() {
        if dir_err.status() == Some(401) {
            return true;
        }
    }
    let msg = format!("{err:#}").to_lowercase();
    AUTH_FAILURE_FRAGMENTS.iter().any(|f| msg.contains(f))
}

/// Placeholder for callers with no recovery path. Spelled as a concrete
/// type so `with_auth_recovery(call, no_recovery())` type-checks.
pub fn no_recovery() -> Option<fn() -> std::future::Ready<anyhow::Result<()>>> {
    None
}

/// Run `call`; if it fails with an authentication error and a recovery
/// closure is available, run recovery and retry `call` exactly once.
///
/// The retry count is capped at one: a session that is still broken
/// after recovery fails terminally with
/// [`AuthError::AuthenticationFailed`] instead of looping. Non-auth
/// failures propagate as-is.
pub async fn with_auth_recovery<T, F, Fut, R, RFut>(
    call: F,
    recovery: Option<R>,
) -> Result<T, AuthError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
    R: FnOnce() -> RFut,
    RFut: Future<Output = anyhow::Result<()>>,
{
    let err = match call().await {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };

    if !is_authentication_error(&err) {
        return Err(AuthError::Other(err));
    }

    let Some(recover) = recovery else {
        return Err(AuthError::AuthenticationFailed(format!("{err:#}")));
    };

    debug!("authentication error, attempting recovery: {err:#}");
    if let Err(rec_err) = recover().await {
        // Recovery may have partially succeeded (e.g. the sync landed
        // but the refresh raced); the single retry below settles it.
        warn!("auth recovery reported an error: {rec_err:#}");
    }

    match call().await {
        Ok(value) => Ok(value),
        Err(retry_err) => Err(AuthError::AuthenticationFailed(format!("{retry_err:#}"))),
    }
}

/// The only sanctioned way the state machines make authenticated
/// directory calls: satisfy the token guard, then run the call under
/// the retry-once recovery policy.
///
/// `sync_session` is the caller's "reconcile with the directory"
/// closure. When the guard reports a never-synced session, it runs
/// before the guard is retried; when the call itself fails with an auth
/// error, it runs as part of recovery together with a token refresh.
pub async fn authenticated_call<T, F, Fut, S, SFut>(
    ctx: &AuthContext,
    call: F,
    sync_session: Option<S>,
) -> Result<T, AuthError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
    S: Fn() -> SFut,
    SFut: Future<Output = anyhow::Result<()>>,
{
    match ensure_valid_token(ctx).await {
        Ok(()) => {}
        Err(AuthError::SessionSyncRequired) => match sync_session.as_ref() {
            Some(sync) => {
                sync().await.map_err(AuthError::Other)?;
                ensure_valid_token(ctx).await?;
            }
            None => return Err(AuthError::SessionSyncRequired),
        },
        Err(err) => return Err(err),
    }

    match sync_session {
        Some(sync) => {
            let recovery = || run_recovery(ctx, &sync);
            with_auth_recovery(call, Some(recovery)).await
        }
        None => with_auth_recovery(call, no_recovery()).await,
    }
}

async fn run_recovery<S, SFut>(ctx: &AuthContext, sync: &S) -> anyhow::Result<()>
where
    S: Fn() -> SFut,
    SFut: Future<Output = anyhow::Result<()>>,
{
    sync().await?;
    ctx.clear_token();
    ensure_valid_token(ctx)
        .await
        .map_err(|e| anyhow::anyhow!("token refresh after sync failed: {e}"))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    fn auth_err() -> anyhow::Error {
        anyhow::anyhow!("401 unauthorized")
    }

    #[test]
    fn test_401_status_is_authentication_error() {
        let err = anyhow::Error::new(DirectoryError::Api {
            method: "POST".to_string(),
            path: "/v1/transfers/t/complete".to_string(),
            status: 401,
            code: None,
            message: "nope".to_string(),
        });
        assert!(is_authentication_error(&err));
    }

    #[test]
    fn test_message_fragments_are_authentication_errors() {
        assert!(is_authentication_error(&anyhow::anyhow!("Invalid token")));
        assert!(is_authentication_error(&anyhow::anyhow!("token expired")));
        assert!(!is_authentication_error(&anyhow::anyhow!("disk full")));
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let result: Result<u32, _> =
            with_auth_recovery(|| async { Ok(7) }, no_recovery()).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_non_auth_error_propagates_as_is() {
        let result: Result<(), _> =
            with_auth_recovery(|| async { Err(anyhow::anyhow!("disk full")) }, no_recovery())
                .await;
        assert!(matches!(result.unwrap_err(), AuthError::Other(_)));
    }

    #[tokio::test]
    async fn test_auth_error_without_recovery_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_auth_recovery(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(auth_err()) }
            },
            no_recovery(),
        )
        .await;
        assert!(matches!(result.unwrap_err(), AuthError::AuthenticationFailed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovery_then_retry_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let recovered = Arc::new(AtomicU32::new(0));

        let calls_in = calls.clone();
        let recovered_in = recovered.clone();
        let result = with_auth_recovery(
            move || {
                let n = calls_in.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(auth_err())
                    } else {
                        Ok("fresh")
                    }
                }
            },
            Some(move || {
                recovered_in.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Ok(()))
            }),
        )
        .await;

        assert_eq!(result.unwrap(), "fresh");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(recovered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_is_capped_at_one() {
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = calls.clone();
        let result: Result<(), _> = with_auth_recovery(
            move || {
                calls_in.fetch_add(1, Ordering::SeqCst);
                async { Err(auth_err()) }
            },
            Some(|| std::future::ready(Ok(()))),
        )
        .await;

        assert!(matches!(result.unwrap_err(), AuthError::AuthenticationFailed(_)));
        // One original call plus exactly one retry, never more.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
