//! Test Support
//!
//! In-memory collaborator implementations shared by the state machine
//! unit tests. Compiled only for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::directory::error::{DirectoryError, CODE_ALREADY_EXISTS, CODE_SESSION_NOT_SYNCED};
use crate::types::{
    AccessToken, Connectivity, DirectoryClient, Identity, IdentityVault, NotifyOutcome,
    SealedIdentity, Session, TransferCompletion,
};

pub fn make_identity(tag: &str) -> Identity {
    Identity {
        public_key: format!("pk-{tag}"),
        public_id: format!("cst{tag}"),
        secret_key: format!("sk-{tag}"),
        created_at: Utc::now().to_rfc3339(),
    }
}

// ─── Vault ───────────────────────────────────────────────────────

/// In-memory vault with failure knobs.
#[derive(Default)]
pub struct MemoryVault {
    pub identity: Mutex<Option<Identity>>,
    /// Local generation fails (the only fatal provisioning error).
    pub fail_create: bool,
    /// Import fails outright (wrong code / corrupt payload).
    pub fail_import: bool,
    /// Import reports success but nothing is persisted; used to test
    /// the persistence verification step.
    pub drop_writes: bool,
    pub import_calls: AtomicU32,
}

impl MemoryVault {
    pub fn with_identity(identity: Identity) -> Self {
        Self {
            identity: Mutex::new(Some(identity)),
            ..Default::default()
        }
    }
}

impl IdentityVault for MemoryVault {
    fn create_identity(&self) -> anyhow::Result<Identity> {
        if self.fail_create {
            anyhow::bail!("key generation failed");
        }
        let mut slot = self.identity.lock().unwrap();
        if slot.is_some() {
            anyhow::bail!("an identity already exists on this device");
        }
        let identity = make_identity("new");
        *slot = Some(identity.clone());
        Ok(identity)
    }

    fn has_identity(&self) -> bool {
        self.identity.lock().unwrap().is_some()
    }

    fn load_identity(&self) -> Option<Identity> {
        self.identity.lock().unwrap().clone()
    }

    fn import_identity(&self, sealed: &SealedIdentity, _code: &str) -> anyhow::Result<()> {
        self.import_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_import {
            anyhow::bail!("decryption failed: wrong transfer code or corrupt payload");
        }
        if self.drop_writes {
            return Ok(());
        }
        let mut slot = self.identity.lock().unwrap();
        if let Some(existing) = slot.as_ref() {
            if existing.public_key != sealed.public_key {
                anyhow::bail!("a different identity already exists on this device");
            }
            return Ok(());
        }
        *slot = Some(Identity {
            public_key: sealed.public_key.clone(),
            public_id: "cstimported".to_string(),
            secret_key: "sk-imported".to_string(),
            created_at: Utc::now().to_rfc3339(),
        });
        Ok(())
    }
}

// ─── Directory ───────────────────────────────────────────────────

/// Scripted behavior for one directory endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirBehavior {
    Ok,
    AlreadyExists,
    NetworkError,
    AuthError,
    SessionNotSynced,
    ServerError,
}

fn behavior_error(behavior: DirBehavior, path: &str) -> anyhow::Error {
    match behavior {
        DirBehavior::AlreadyExists => DirectoryError::Api {
            method: "POST".to_string(),
            path: path.to_string(),
            status: 409,
            code: Some(CODE_ALREADY_EXISTS.to_string()),
            message: "identity already exists".to_string(),
        }
        .into(),
        DirBehavior::AuthError => DirectoryError::Api {
            method: "POST".to_string(),
            path: path.to_string(),
            status: 401,
            code: None,
            message: "unauthorized".to_string(),
        }
        .into(),
        DirBehavior::SessionNotSynced => DirectoryError::Api {
            method: "POST".to_string(),
            path: path.to_string(),
            status: 400,
            code: Some(CODE_SESSION_NOT_SYNCED.to_string()),
            message: "session has never been synced".to_string(),
        }
        .into(),
        DirBehavior::NetworkError => anyhow::anyhow!("connection refused"),
        DirBehavior::ServerError => anyhow::anyhow!("internal server error"),
        DirBehavior::Ok => unreachable!("Ok has no error"),
    }
}

/// Directory stub with per-endpoint behavior and call counters.
pub struct ScriptedDirectory {
    pub register_behavior: DirBehavior,
    pub sync_behavior: DirBehavior,
    pub sign_in_behavior: DirBehavior,
    pub token_behavior: DirBehavior,
    /// Notify responses consumed in order; defaults to `Ok` when empty.
    pub notify_behaviors: Mutex<VecDeque<DirBehavior>>,
    /// Artificial latency applied to sign-in, for cancellation tests.
    pub sign_in_delay: Duration,

    pub register_calls: AtomicU32,
    pub sync_calls: AtomicU32,
    pub sign_in_calls: AtomicU32,
    pub token_calls: AtomicU32,
    pub notify_calls: AtomicU32,
}

impl Default for ScriptedDirectory {
    fn default() -> Self {
        Self {
            register_behavior: DirBehavior::Ok,
            sync_behavior: DirBehavior::Ok,
            sign_in_behavior: DirBehavior::Ok,
            token_behavior: DirBehavior::Ok,
            notify_behaviors: Mutex::new(VecDeque::new()),
            sign_in_delay: Duration::ZERO,
            register_calls: AtomicU32::new(0),
            sync_calls: AtomicU32::new(0),
            sign_in_calls: AtomicU32::new(0),
            token_calls: AtomicU32::new(0),
            notify_calls: AtomicU32::new(0),
        }
    }
}

impl ScriptedDirectory {
    pub fn push_notify(&self, behavior: DirBehavior) {
        self.notify_behaviors.lock().unwrap().push_back(behavior);
    }

    pub fn total_calls(&self) -> u32 {
        self.register_calls.load(Ordering::SeqCst)
            + self.sync_calls.load(Ordering::SeqCst)
            + self.sign_in_calls.load(Ordering::SeqCst)
            + self.token_calls.load(Ordering::SeqCst)
            + self.notify_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DirectoryClient for ScriptedDirectory {
    async fn register_identity(&self, _: &Identity, _: &str) -> anyhow::Result<Session> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        match self.register_behavior {
            DirBehavior::Ok => Ok(Session::online("reg-session".to_string())),
            other => Err(behavior_error(other, "/v1/identities")),
        }
    }

    async fn sync_identity(&self, _: &Identity, _: &str) -> anyhow::Result<()> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        match self.sync_behavior {
            DirBehavior::Ok => Ok(()),
            other => Err(behavior_error(other, "/v1/identities/x/sync")),
        }
    }

    async fn sign_in(&self, _: &Identity, _: &str) -> anyhow::Result<Session> {
        self.sign_in_calls.fetch_add(1, Ordering::SeqCst);
        if !self.sign_in_delay.is_zero() {
            tokio::time::sleep(self.sign_in_delay).await;
        }
        match self.sign_in_behavior {
            DirBehavior::Ok => Ok(Session::online("signin-session".to_string())),
            other => Err(behavior_error(other, "/v1/auth/sign-in")),
        }
    }

    async fn get_token_by_session(&self, _: &str) -> anyhow::Result<AccessToken> {
        self.token_calls.fetch_add(1, Ordering::SeqCst);
        match self.token_behavior {
            DirBehavior::Ok => Ok(AccessToken {
                token: "test-token".to_string(),
                expires_at: Utc::now() + chrono::Duration::minutes(15),
            }),
            other => Err(behavior_error(other, "/v1/auth/token")),
        }
    }

    async fn notify_transfer_complete(
        &self,
        _: &str,
        _: &TransferCompletion,
    ) -> anyhow::Result<NotifyOutcome> {
        self.notify_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .notify_behaviors
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(DirBehavior::Ok);
        match behavior {
            DirBehavior::Ok => Ok(NotifyOutcome { success: true }),
            other => Err(behavior_error(other, "/v1/transfers/x/complete")),
        }
    }
}

// ─── Connectivity ────────────────────────────────────────────────

pub struct StaticConnectivity {
    pub offline: bool,
}

#[async_trait]
impl Connectivity for StaticConnectivity {
    async fn check_if_offline(&self) -> bool {
        self.offline
    }
}
