//! Transfer Import State Machine
//!
//! Receives an identity from another device: scan the QR payload,
//! collect the out-of-band transfer code, decrypt and persist, then
//! sign in and notify the source device. Persistence strictly precedes
//! sign-in, which strictly precedes notification; a notification
//! failure never reverts a completed import.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::auth::{authenticated_call, AuthContext};
use crate::progress::{CancelToken, ProgressCoordinator};
use crate::state::StateHandle;
use crate::types::{Connectivity, IdentityVault, TransferCompletion, TransferPayload};

use super::payload::{normalize_transfer_code, parse_transfer_payload, TRANSFER_CODE_LEN};

/// Small pause between the vault write and the persistence re-check,
/// covering write-behind caches on slow storage.
const IMPORT_SETTLE: Duration = Duration::from_millis(250);

/// Step interval for the import progress ticker.
const PROGRESS_TICK: Duration = Duration::from_millis(150);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImportState {
    AwaitingScan,
    PayloadParsed,
    AwaitingCode,
    Decrypting,
    Importing,
    VerifyingPersistence,
    SigningIn,
    Notifying,
    NotifyFailed,
    Completed,
    Expired,
    InvalidPayload,
    ImportFailed(String),
}

#[derive(Debug, Error)]
pub enum ImportError {
    /// The scanned string is not a transfer payload. Terminal for this
    /// scan; a new scan may follow.
    #[error("invalid transfer payload: {0}")]
    InvalidPayload(String),

    /// The payload's expiry has passed. Checked before any decryption.
    #[error("this transfer has expired; generate a new one on the source device")]
    Expired,

    /// The entered code is not a well-formed six-character code. The
    /// machine state is unchanged; the user just retypes.
    #[error("transfer codes are exactly {TRANSFER_CODE_LEN} characters")]
    CodeRejected,

    /// No payload has been scanned yet.
    #[error("scan a transfer code first")]
    NoPayload,

    /// Decryption or persistence failed. Recoverable: the same payload
    /// stays loaded and another code may be submitted.
    #[error("import failed: {0}")]
    ImportFailed(String),

    /// Host teardown occurred mid-flight.
    #[error("import cancelled")]
    Cancelled,
}

/// What the import accomplished. `source_notified == false` means the
/// identity now lives on this device but the source device does not
/// know; the user must remove it there manually.
#[derive(Clone, Debug)]
pub struct ImportCompletion {
    pub transfer_id: String,
    pub source_notified: bool,
}

pub struct ImportMachine {
    vault: Arc<dyn IdentityVault>,
    connectivity: Arc<dyn Connectivity>,
    auth: Arc<AuthContext>,
    store: StateHandle,
    device_id: String,
    payload: Mutex<Option<TransferPayload>>,
    state_tx: watch::Sender<ImportState>,
    progress: ProgressCoordinator,
    cancel: CancelToken,
}

impl ImportMachine {
    pub fn new(
        vault: Arc<dyn IdentityVault>,
        connectivity: Arc<dyn Connectivity>,
        auth: Arc<AuthContext>,
        store: StateHandle,
    ) -> Self {
        let device_id = store.device_id();
        let (state_tx, _) = watch::channel(ImportState::AwaitingScan);
        Self {
            vault,
            connectivity,
            auth,
            store,
            device_id,
            payload: Mutex::new(None),
            state_tx,
            progress: ProgressCoordinator::new(),
            cancel: CancelToken::new(),
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ImportState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<u8> {
        self.progress.subscribe()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Ingest a scanned QR string. Validation happens here, before the
    /// user is asked for a code; expiry in particular is checked before
    /// any decryption work.
    pub fn handle_scan(&self, raw: &str) -> Result<(), ImportError> {
        match &*self.state_tx.borrow() {
            ImportState::AwaitingScan
            | ImportState::AwaitingCode
            | ImportState::Expired
            | ImportState::InvalidPayload => {}
            other => {
                return Err(ImportError::InvalidPayload(format!(
                    "scan not accepted in state {other:?}"
                )))
            }
        }

        match parse_transfer_payload(raw) {
            Ok(payload) => {
                info!(transfer_id = %payload.transfer_id, "transfer payload accepted");
                *self.payload.lock().unwrap() = Some(payload);
                self.transition(ImportState::PayloadParsed);
                self.transition(ImportState::AwaitingCode);
                self.progress.set_percent(10);
                Ok(())
            }
            Err(ImportError::Expired) => {
                self.transition(ImportState::Expired);
                Err(ImportError::Expired)
            }
            Err(err) => {
                self.transition(ImportState::InvalidPayload);
                Err(err)
            }
        }
    }

    /// Run the import with the user-entered transfer code. Callable
    /// again after [`ImportError::ImportFailed`]; the scanned payload
    /// stays loaded for the retry.
    pub async fn submit_code(&self, raw_code: &str) -> Result<ImportCompletion, ImportError> {
        match &*self.state_tx.borrow() {
            ImportState::AwaitingCode | ImportState::ImportFailed(_) => {}
            ImportState::AwaitingScan => return Err(ImportError::NoPayload),
            other => {
                return Err(ImportError::ImportFailed(format!(
                    "code not accepted in state {other:?}"
                )))
            }
        }

        let code = normalize_transfer_code(raw_code);
        if code.len() != TRANSFER_CODE_LEN {
            // Malformed input never advances the machine.
            return Err(ImportError::CodeRejected);
        }

        let payload = self
            .payload
            .lock()
            .unwrap()
            .clone()
            .ok_or(ImportError::NoPayload)?;

        // The payload may have expired while the user typed the code.
        if let Some(expires_at) = payload.expires_at {
            if expires_at < chrono::Utc::now() {
                self.transition(ImportState::Expired);
                return Err(ImportError::Expired);
            }
        }

        let result = self.drive(&payload, &code).await;

        match &result {
            Ok(completion) => {
                self.transition(ImportState::Completed);
                self.progress.finish();
                info!(
                    transfer_id = %completion.transfer_id,
                    source_notified = completion.source_notified,
                    "identity import completed"
                );
            }
            Err(ImportError::Cancelled) => self.progress.finish(),
            Err(err) => {
                // Recoverable failure: reset progress, keep the payload
                // loaded so the user can retry with another code.
                self.transition(ImportState::ImportFailed(err.to_string()));
                self.progress.stop_tickers();
                self.progress.set_percent(0);
            }
        }
        result
    }

    async fn drive(&self, payload: &TransferPayload, code: &str) -> Result<ImportCompletion, ImportError> {
        self.progress.start_ticker(5, PROGRESS_TICK);

        self.transition(ImportState::Decrypting);
        self.transition(ImportState::Importing);
        self.vault
            .import_identity(&payload.sealed(), code)
            .map_err(|e| ImportError::ImportFailed(format!("{e:#}")))?;

        // Let the write settle, then verify against durable state. An
        // import that did not actually persist must fail here, not
        // surface as a phantom success.
        tokio::time::sleep(IMPORT_SETTLE).await;
        self.check_cancel()?;
        self.transition(ImportState::VerifyingPersistence);
        if !self.vault.has_identity() {
            return Err(ImportError::ImportFailed(
                "import reported success but no identity was persisted".to_string(),
            ));
        }
        self.progress.set_percent(60);

        let offline = self.connectivity.check_if_offline().await;
        self.check_cancel()?;

        let source_notified = if offline {
            info!("offline; sign-in and source notification deferred");
            false
        } else {
            self.sign_in(payload).await?;
            self.notify_source(payload, code).await?
        };

        self.store.record_transfer(
            &payload.transfer_id,
            &payload.source_device_id,
            &payload.public_key,
            source_notified,
        );

        // The identity must still be present after the network phase;
        // nothing downstream is allowed to have reverted it.
        if !self.vault.has_identity() {
            return Err(ImportError::ImportFailed(
                "identity disappeared after import".to_string(),
            ));
        }

        Ok(ImportCompletion {
            transfer_id: payload.transfer_id.clone(),
            source_notified,
        })
    }

    /// Sign in as the imported identity. Failure is non-fatal: the
    /// identity is already durable and authentication can be retried
    /// on the next start.
    async fn sign_in(&self, payload: &TransferPayload) -> Result<(), ImportError> {
        let Some(identity) = self.vault.load_identity() else {
            warn!("imported identity unreadable; skipping sign-in");
            return Ok(());
        };
        if identity.public_key != payload.public_key {
            warn!("vault identity does not match transfer payload; skipping sign-in");
            return Ok(());
        }

        self.transition(ImportState::SigningIn);
        match self
            .auth
            .directory()
            .clone()
            .sign_in(&identity, &self.device_id)
            .await
        {
            Ok(session) => {
                self.check_cancel()?;
                self.store.set_session(&session, false);
                self.auth.set_session(session);
                self.progress.set_percent(80);
            }
            Err(err) => {
                self.check_cancel()?;
                warn!("sign-in after import failed; continuing unauthenticated: {err:#}");
            }
        }
        Ok(())
    }

    /// Tell the directory the transfer completed so the source device
    /// can offer to remove its copy. Runs under the retry-once auth
    /// recovery policy; failure is reported, never fatal.
    async fn notify_source(&self, payload: &TransferPayload, code: &str) -> Result<bool, ImportError> {
        self.transition(ImportState::Notifying);

        let completion = TransferCompletion {
            transfer_id: payload.transfer_id.clone(),
            source_device_id: payload.source_device_id.clone(),
            public_key: payload.public_key.clone(),
            transfer_code: code.to_string(),
        };

        let directory = self.auth.directory().clone();
        let call = || {
            let bearer = self.auth.bearer_token().unwrap_or_default();
            let directory = directory.clone();
            let completion = completion.clone();
            async move {
                directory
                    .notify_transfer_complete(&bearer, &completion)
                    .await
                    .map(|outcome| outcome.success)
            }
        };

        let identity = self.vault.load_identity();
        let sync = identity.map(|identity| {
            let directory = directory.clone();
            let device_id = self.device_id.clone();
            let store = self.store.clone();
            move || {
                let directory = directory.clone();
                let identity = identity.clone();
                let device_id = device_id.clone();
                let store = store.clone();
                async move {
                    directory.sync_identity(&identity, &device_id).await?;
                    store.mark_session_synced();
                    Ok(())
                }
            }
        });

        let notified = match authenticated_call(&self.auth, call, sync).await {
            Ok(success) => success,
            Err(err) => {
                warn!(
                    transfer_id = %completion.transfer_id,
                    "completion notification failed; the identity must be removed from \
                     the source device manually: {err}"
                );
                false
            }
        };
        self.check_cancel()?;

        if !notified {
            self.transition(ImportState::NotifyFailed);
        } else {
            self.store.mark_session_synced();
        }
        Ok(notified)
    }

    // `send_replace` stores the value even with no live receiver; the
    // scan/code gates read this channel, so a dropped transition would
    // wedge the machine for unsubscribed callers.
    fn transition(&self, state: ImportState) {
        if self.cancel.cancelled() {
            return;
        }
        self.state_tx.send_replace(state);
    }

    fn check_cancel(&self) -> Result<(), ImportError> {
        if self.cancel.cancelled() {
            Err(ImportError::Cancelled)
        } else {
            Ok(())
        }
    }
}
