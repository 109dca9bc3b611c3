//! Identity Provisioning State Machine
//!
//! Drives creation of a new identity: local generation, optional online
//! registration, optional sync, optional sign-in. Offline-first at
//! every step: only local key generation may fail fatally; every
//! network-dependent step degrades to "proceed without full
//! synchronization" instead of blocking the user.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::auth::{
    ensure_valid_token, wait_for_valid_token, AuthContext, TOKEN_POLL_ATTEMPTS,
    TOKEN_POLL_INTERVAL,
};
use crate::directory::{is_already_exists_error, is_network_or_timeout_error};
use crate::progress::{CancelToken, ProgressCoordinator};
use crate::state::StateHandle;
use crate::types::{Connectivity, DirectoryClient, Identity, IdentityVault, Session, SyncState};

/// Step interval for the provisioning progress ticker.
const PROGRESS_TICK: std::time::Duration = std::time::Duration::from_millis(200);

/// States of the provisioning machine. Emitted on a watch channel on
/// every transition; the UI is a pure subscriber.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionState {
    Checking,
    HasIdentity,
    NoIdentity,
    Creating,
    SyncingAndSigningIn,
    ReconcilingExisting,
    Done,
    Failed(String),
}

/// Errors that abort provisioning. Everything else degrades.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Local key generation failed. The only fatal, user-visible error.
    #[error("identity creation failed: {0}")]
    CreateFailed(String),

    /// Host teardown occurred mid-flight; all state mutation was
    /// skipped from that point on.
    #[error("provisioning cancelled")]
    Cancelled,
}

/// What provisioning accomplished. `synced == false` means the user is
/// fully functional locally and reconciliation is deferred.
#[derive(Clone, Copy, Debug)]
pub struct ProvisionOutcome {
    pub created: bool,
    pub synced: bool,
    pub authenticated: bool,
}

pub struct ProvisioningMachine {
    vault: Arc<dyn IdentityVault>,
    directory: Arc<dyn DirectoryClient>,
    connectivity: Arc<dyn Connectivity>,
    auth: Arc<AuthContext>,
    store: StateHandle,
    device_id: String,
    state_tx: watch::Sender<ProvisionState>,
    sync_tx: watch::Sender<SyncState>,
    progress: ProgressCoordinator,
    cancel: CancelToken,
}

impl ProvisioningMachine {
    pub fn new(
        vault: Arc<dyn IdentityVault>,
        directory: Arc<dyn DirectoryClient>,
        connectivity: Arc<dyn Connectivity>,
        auth: Arc<AuthContext>,
        store: StateHandle,
    ) -> Self {
        let device_id = store.device_id();
        let (state_tx, _) = watch::channel(ProvisionState::Checking);
        let (sync_tx, _) = watch::channel(SyncState::default());
        Self {
            vault,
            directory,
            connectivity,
            auth,
            store,
            device_id,
            state_tx,
            sync_tx,
            progress: ProgressCoordinator::new(),
            cancel: CancelToken::new(),
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ProvisionState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_sync(&self) -> watch::Receiver<SyncState> {
        self.sync_tx.subscribe()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<u8> {
        self.progress.subscribe()
    }

    /// Token consulted after every suspension point; cancel it on host
    /// teardown to stop the machine from mutating anything further.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run the machine to a terminal state.
    pub async fn run(&self) -> Result<ProvisionOutcome, ProvisionError> {
        let result = self.drive().await;

        // Progress resets on every exit path, including error.
        self.progress.finish();

        match &result {
            Ok(_) => self.transition(ProvisionState::Done),
            Err(ProvisionError::Cancelled) => {}
            Err(err) => self.transition(ProvisionState::Failed(err.to_string())),
        }
        result
    }

    async fn drive(&self) -> Result<ProvisionOutcome, ProvisionError> {
        self.transition(ProvisionState::Checking);
        self.progress.start_ticker(5, PROGRESS_TICK);

        // The only branch point. It must complete before any mutation.
        let has_identity = self.vault.has_identity();

        if has_identity {
            self.transition(ProvisionState::HasIdentity);
            self.transition(ProvisionState::ReconcilingExisting);
            self.reconcile_existing().await;
            self.check_cancel()?;
            return Ok(ProvisionOutcome {
                created: false,
                synced: self.store.session_synced(),
                authenticated: self.auth.has_valid_token(),
            });
        }

        self.transition(ProvisionState::NoIdentity);
        self.transition(ProvisionState::Creating);

        // Purely local; must never depend on network reachability.
        let identity = self
            .vault
            .create_identity()
            .map_err(|e| ProvisionError::CreateFailed(format!("{e:#}")))?;
        self.progress.set_percent(40);

        let offline = self.connectivity.check_if_offline().await;
        self.check_cancel()?;

        if offline {
            info!("offline; identity created locally, synchronization deferred");
            self.adopt_session(Session::offline(), false);
            self.emit_sync(SyncState {
                is_synced: false,
                is_syncing: false,
            });
            return Ok(ProvisionOutcome {
                created: true,
                synced: false,
                authenticated: false,
            });
        }

        // Online: registration creates and signs in, in one step.
        self.emit_sync(SyncState {
            is_synced: false,
            is_syncing: true,
        });

        match self
            .directory
            .register_identity(&identity, &self.device_id)
            .await
        {
            Ok(session) => {
                self.check_cancel()?;
                self.adopt_session(session, true);
                self.transition(ProvisionState::SyncingAndSigningIn);
                if let Err(err) = ensure_valid_token(&self.auth).await {
                    warn!("token fetch after registration failed: {err}");
                }
                self.check_cancel()?;
                self.emit_sync(SyncState {
                    is_synced: true,
                    is_syncing: false,
                });
                Ok(ProvisionOutcome {
                    created: true,
                    synced: true,
                    authenticated: self.auth.has_valid_token(),
                })
            }
            Err(err) => {
                self.check_cancel()?;
                if is_already_exists_error(&err) {
                    // Another device (or a retried request) won the
                    // registration race. Reconcile instead of failing.
                    warn!("identity already registered; reconciling: {err:#}");
                    self.transition(ProvisionState::SyncingAndSigningIn);
                    self.recover_already_exists(&identity).await;
                    self.check_cancel()?;
                    self.emit_sync(SyncState {
                        is_synced: self.store.session_synced(),
                        is_syncing: false,
                    });
                    Ok(ProvisionOutcome {
                        created: true,
                        synced: self.store.session_synced(),
                        authenticated: self.auth.has_valid_token(),
                    })
                } else {
                    // Network or server failure: the user stays fully
                    // functional locally; sync is eventually consistent.
                    if is_network_or_timeout_error(&err) {
                        warn!("directory unreachable; proceeding offline: {err:#}");
                    } else {
                        warn!("registration failed; proceeding offline: {err:#}");
                    }
                    self.adopt_session(Session::offline(), false);
                    self.emit_sync(SyncState {
                        is_synced: false,
                        is_syncing: false,
                    });
                    Ok(ProvisionOutcome {
                        created: true,
                        synced: false,
                        authenticated: false,
                    })
                }
            }
        }
    }

    /// Recovery path after an "identity already exists" registration
    /// failure: sync, then sign in, then wait briefly for a token.
    /// Never fails; a failed recovery sign-in degrades to "identity
    /// exists locally, not yet authenticated".
    async fn recover_already_exists(&self, identity: &Identity) {
        if self.connectivity.check_if_offline().await {
            return;
        }
        if self.cancel.cancelled() {
            return;
        }

        match self.directory.sync_identity(identity, &self.device_id).await {
            Ok(()) => self.store.mark_session_synced(),
            Err(err) => warn!("recovery sync failed: {err:#}"),
        }
        if self.cancel.cancelled() {
            return;
        }

        if !self.auth.has_valid_token() {
            match self.directory.sign_in(identity, &self.device_id).await {
                Ok(session) => {
                    if self.cancel.cancelled() {
                        return;
                    }
                    self.adopt_session(session, true);
                    wait_for_valid_token(&self.auth, TOKEN_POLL_ATTEMPTS, TOKEN_POLL_INTERVAL)
                        .await;
                }
                Err(err) => {
                    warn!("recovery sign-in failed; identity exists locally, not yet authenticated: {err:#}");
                }
            }
        }
    }

    /// The existing-identity path: reconcile with the directory when
    /// unauthenticated and online. Network failures are swallowed; the
    /// user already has a usable local identity.
    async fn reconcile_existing(&self) {
        let Some(identity) = self.vault.load_identity() else {
            warn!("identity file present but unreadable; skipping reconciliation");
            return;
        };

        // Restore the persisted session into the auth context.
        if self.auth.session().is_none() {
            if let Some(session) = self.store.get_session() {
                self.auth.set_session(session);
            }
        }

        if self.auth.has_valid_token() {
            self.emit_sync(SyncState {
                is_synced: self.store.session_synced(),
                is_syncing: false,
            });
            return;
        }

        if self.connectivity.check_if_offline().await {
            self.emit_sync(SyncState {
                is_synced: self.store.session_synced(),
                is_syncing: false,
            });
            return;
        }
        if self.cancel.cancelled() {
            return;
        }

        self.emit_sync(SyncState {
            is_synced: false,
            is_syncing: true,
        });

        match self.directory.sync_identity(&identity, &self.device_id).await {
            Ok(()) => self.store.mark_session_synced(),
            Err(err) => warn!("sync failed: {err:#}"),
        }
        if self.cancel.cancelled() {
            return;
        }

        if !self.auth.has_valid_token() {
            if let Err(err) = ensure_valid_token(&self.auth).await {
                warn!("token refresh failed: {err}");
            }
        }
        if self.cancel.cancelled() {
            return;
        }

        if !self.auth.has_valid_token() {
            match self.directory.sign_in(&identity, &self.device_id).await {
                Ok(session) => {
                    if self.cancel.cancelled() {
                        return;
                    }
                    self.adopt_session(session, self.store.session_synced());
                    wait_for_valid_token(&self.auth, TOKEN_POLL_ATTEMPTS, TOKEN_POLL_INTERVAL)
                        .await;
                }
                Err(err) => warn!("sign-in failed: {err:#}"),
            }
        }
        if self.cancel.cancelled() {
            return;
        }

        self.emit_sync(SyncState {
            is_synced: self.store.session_synced(),
            is_syncing: false,
        });
    }

    fn adopt_session(&self, session: Session, synced: bool) {
        if self.cancel.cancelled() {
            return;
        }
        self.store.set_session(&session, synced);
        self.auth.set_session(session);
    }

    // `send_replace` stores the value even with no live receiver; a
    // machine run before anything subscribes must not lose transitions.
    fn transition(&self, state: ProvisionState) {
        if self.cancel.cancelled() {
            return;
        }
        self.state_tx.send_replace(state);
    }

    fn emit_sync(&self, state: SyncState) {
        if self.cancel.cancelled() {
            return;
        }
        self.sync_tx.send_replace(state);
    }

    fn check_cancel(&self) -> Result<(), ProvisionError> {
        if self.cancel.cancelled() {
            Err(ProvisionError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use crate::testing::{make_identity, DirBehavior, MemoryVault, ScriptedDirectory, StaticConnectivity};
    use crate::state::{Database, StateHandle};
    use crate::types::SessionOrigin;

    use super::*;

    fn machine(
        vault: MemoryVault,
        directory: ScriptedDirectory,
        offline: bool,
    ) -> (ProvisioningMachine, Arc<ScriptedDirectory>) {
        let directory = Arc::new(directory);
        let auth = Arc::new(AuthContext::new(directory.clone() as Arc<dyn DirectoryClient>));
        let store = StateHandle::new(Database::open_in_memory().unwrap());
        let m = ProvisioningMachine::new(
            Arc::new(vault),
            directory.clone(),
            Arc::new(StaticConnectivity { offline }),
            auth,
            store,
        );
        (m, directory)
    }

    #[tokio::test]
    async fn test_offline_creation_succeeds_without_any_network_call() {
        let (m, directory) = machine(MemoryVault::default(), ScriptedDirectory::default(), true);

        let outcome = m.run().await.unwrap();
        assert!(outcome.created);
        assert!(!outcome.synced);
        assert!(!outcome.authenticated);
        assert_eq!(directory.total_calls(), 0);
        assert!(m.vault.has_identity());
        assert_eq!(*m.subscribe_state().borrow(), ProvisionState::Done);

        // The deferred session is offline-born and unsynced.
        let session = m.store.get_session().unwrap();
        assert_eq!(session.origin, SessionOrigin::Offline);
        assert!(!m.store.session_synced());
    }

    #[tokio::test]
    async fn test_online_creation_registers_and_syncs() {
        let (m, directory) = machine(MemoryVault::default(), ScriptedDirectory::default(), false);

        let outcome = m.run().await.unwrap();
        assert!(outcome.created);
        assert!(outcome.synced);
        assert!(outcome.authenticated);
        assert_eq!(directory.register_calls.load(Ordering::SeqCst), 1);
        assert_eq!(*m.subscribe_sync().borrow(), SyncState { is_synced: true, is_syncing: false });
    }

    #[tokio::test]
    async fn test_run_without_subscribers_still_records_terminal_state() {
        // Nothing subscribes until after the run; emissions must not be
        // lost to an empty channel.
        let (m, _) = machine(MemoryVault::default(), ScriptedDirectory::default(), false);

        let outcome = m.run().await.unwrap();
        assert!(outcome.created);
        assert_eq!(*m.subscribe_state().borrow(), ProvisionState::Done);
        assert_eq!(
            *m.subscribe_sync().borrow(),
            SyncState { is_synced: true, is_syncing: false }
        );
    }

    #[tokio::test]
    async fn test_already_exists_recovers_via_sync_and_sign_in() {
        let directory = ScriptedDirectory {
            register_behavior: DirBehavior::AlreadyExists,
            ..Default::default()
        };
        let (m, directory) = machine(MemoryVault::default(), directory, false);

        let outcome = m.run().await.unwrap();
        assert!(outcome.created);
        assert!(outcome.synced);
        assert_eq!(directory.sync_calls.load(Ordering::SeqCst), 1);
        assert_eq!(directory.sign_in_calls.load(Ordering::SeqCst), 1);
        assert_eq!(*m.subscribe_state().borrow(), ProvisionState::Done);
    }

    #[tokio::test]
    async fn test_already_exists_reaches_done_even_when_sign_in_throws() {
        let directory = ScriptedDirectory {
            register_behavior: DirBehavior::AlreadyExists,
            sign_in_behavior: DirBehavior::NetworkError,
            ..Default::default()
        };
        let (m, _directory) = machine(MemoryVault::default(), directory, false);

        let outcome = m.run().await.unwrap();
        assert!(outcome.created);
        assert!(!outcome.authenticated);
        assert_eq!(*m.subscribe_state().borrow(), ProvisionState::Done);
    }

    #[tokio::test]
    async fn test_registration_network_failure_degrades_to_offline() {
        let directory = ScriptedDirectory {
            register_behavior: DirBehavior::NetworkError,
            ..Default::default()
        };
        let (m, _) = machine(MemoryVault::default(), directory, false);

        let outcome = m.run().await.unwrap();
        assert!(outcome.created);
        assert!(!outcome.synced);
        assert!(m.vault.has_identity());
        assert_eq!(*m.subscribe_state().borrow(), ProvisionState::Done);
    }

    #[tokio::test]
    async fn test_local_generation_failure_is_fatal_and_resets_progress() {
        let vault = MemoryVault {
            fail_create: true,
            ..Default::default()
        };
        let (m, directory) = machine(vault, ScriptedDirectory::default(), false);
        let progress = m.subscribe_progress();

        let err = m.run().await.unwrap_err();
        assert!(matches!(err, ProvisionError::CreateFailed(_)));
        assert!(matches!(*m.subscribe_state().borrow(), ProvisionState::Failed(_)));
        assert_eq!(*progress.borrow(), 0);
        assert_eq!(directory.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_existing_identity_reconciles_when_online() {
        let vault = MemoryVault::with_identity(make_identity("existing"));
        let (m, directory) = machine(vault, ScriptedDirectory::default(), false);

        let outcome = m.run().await.unwrap();
        assert!(!outcome.created);
        assert!(outcome.synced);
        assert!(outcome.authenticated);
        assert_eq!(directory.sync_calls.load(Ordering::SeqCst), 1);
        assert_eq!(directory.sign_in_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_existing_identity_offline_proceeds_without_network() {
        let vault = MemoryVault::with_identity(make_identity("existing"));
        let (m, directory) = machine(vault, ScriptedDirectory::default(), true);

        let outcome = m.run().await.unwrap();
        assert!(!outcome.created);
        assert!(!outcome.synced);
        assert_eq!(directory.total_calls(), 0);
        assert_eq!(*m.subscribe_state().borrow(), ProvisionState::Done);
    }

    #[tokio::test]
    async fn test_teardown_during_sign_in_skips_all_further_mutation() {
        let vault = MemoryVault::with_identity(make_identity("existing"));
        let directory = ScriptedDirectory {
            sign_in_delay: Duration::from_millis(100),
            ..Default::default()
        };
        // Token endpoint errors so reconciliation reaches the sign-in.
        let directory = ScriptedDirectory {
            token_behavior: DirBehavior::ServerError,
            ..directory
        };
        let (m, _) = machine(vault, directory, false);
        let m = Arc::new(m);
        let cancel = m.cancel_token();
        let state_rx = m.subscribe_state();

        let runner = {
            let m = m.clone();
            tokio::spawn(async move { m.run().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        let result = runner.await.unwrap();

        assert!(matches!(result.unwrap_err(), ProvisionError::Cancelled));
        // No zombie updates: the machine never reached Done or Failed.
        assert_ne!(*state_rx.borrow(), ProvisionState::Done);
        assert!(m.auth.session().is_none());
        assert!(m.progress.is_finished());
    }
}
