//! Custodian - Type Definitions
//!
//! Shared types for the self-custody identity runtime: the identity itself,
//! sessions and access tokens, transfer payloads, and the collaborator
//! traits the state machines are written against.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Identity ────────────────────────────────────────────────────

/// A self-custody identity: a key pair plus a derived public identifier.
///
/// Created once per device and owned exclusively by it until exported.
/// The secret key never leaves the vault in plaintext.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Hex-encoded public key.
    pub public_key: String,
    /// Short identifier derived from the public key.
    pub public_id: String,
    /// Hex-encoded secret key. Only ever serialized into the vault file
    /// or into an encrypted transfer payload.
    pub secret_key: String,
    pub created_at: String,
}

// ─── Session & Token ─────────────────────────────────────────────

/// Where a session was minted. Offline sessions are placeholders created
/// while the directory was unreachable; they cannot be exchanged for a
/// token until the identity has been synced.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionOrigin {
    Online,
    Offline,
}

/// Opaque handle proving "this device is bound to this identity" remotely.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub origin: SessionOrigin,
    pub created_at: String,
}

impl Session {
    pub fn offline() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            origin: SessionOrigin::Offline,
            created_at: Utc::now().to_rfc3339(),
        }
    }

    pub fn online(id: String) -> Self {
        Self {
            id,
            origin: SessionOrigin::Online,
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Short-lived credential minted from a session. Held in memory only.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// A token is valid while its expiry is still in the future.
    pub fn is_valid(&self) -> bool {
        self.expires_at > Utc::now()
    }
}

// ─── Sync State ──────────────────────────────────────────────────

/// Reactive status of whether the local identity has been reconciled
/// with the directory. Emitted on a watch channel; the CLI is a pure
/// subscriber and never mutates it.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub is_synced: bool,
    pub is_syncing: bool,
}

// ─── Transfer ────────────────────────────────────────────────────

/// Payload `type` tag every transfer QR code must carry.
pub const TRANSFER_PAYLOAD_TYPE: &str = "identity_transfer";

/// The encrypted identity payload carried by a transfer QR code.
///
/// Immutable once created. The transfer code needed to decrypt
/// `encrypted` travels out-of-band and is never part of this struct.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferPayload {
    #[serde(rename = "type")]
    pub payload_type: String,
    /// Base64 ciphertext of the serialized identity.
    pub encrypted: String,
    /// Base64 KDF salt.
    pub salt: String,
    /// Base64 AEAD nonce.
    pub iv: String,
    /// Hex public key of the identity being transferred.
    pub public_key: String,
    pub transfer_id: String,
    pub source_device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// The encrypted portion of a transfer payload, handed to the vault
/// together with the transfer code for decryption and import.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedIdentity {
    pub encrypted: String,
    pub salt: String,
    pub iv: String,
    pub public_key: String,
}

impl TransferPayload {
    pub fn sealed(&self) -> SealedIdentity {
        SealedIdentity {
            encrypted: self.encrypted.clone(),
            salt: self.salt.clone(),
            iv: self.iv.clone(),
            public_key: self.public_key.clone(),
        }
    }
}

/// Sent to the directory when an import finishes, so the source device
/// learns it may remove its copy of the identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferCompletion {
    pub transfer_id: String,
    pub source_device_id: String,
    pub public_key: String,
    pub transfer_code: String,
}

/// Result of the completion notification.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyOutcome {
    pub success: bool,
}

// ─── Collaborator Traits ─────────────────────────────────────────

/// Local identity storage. Implementations must make `has_identity`
/// reflect durable state, not a cache: both state machines re-read it
/// immediately before mutating.
pub trait IdentityVault: Send + Sync {
    /// Generate and persist a new identity. Purely local; must never
    /// depend on network reachability. Fails if an identity exists.
    fn create_identity(&self) -> anyhow::Result<Identity>;

    /// Whether an identity is durably present on this device.
    fn has_identity(&self) -> bool;

    /// Load the identity, if one exists.
    fn load_identity(&self) -> Option<Identity>;

    /// Decrypt a sealed identity with the transfer code and persist it.
    /// Fails on a wrong code, a corrupt payload, or a conflicting
    /// identity already present.
    fn import_identity(&self, sealed: &SealedIdentity, code: &str) -> anyhow::Result<()>;
}

/// The remote identity directory service.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Register a new identity and sign this device in, in one step.
    async fn register_identity(
        &self,
        identity: &Identity,
        device_id: &str,
    ) -> anyhow::Result<Session>;

    /// Reconcile the local identity with the directory.
    async fn sync_identity(&self, identity: &Identity, device_id: &str) -> anyhow::Result<()>;

    /// Sign in an already-registered identity from this device.
    async fn sign_in(&self, identity: &Identity, device_id: &str) -> anyhow::Result<Session>;

    /// Exchange a session id for a fresh access token.
    async fn get_token_by_session(&self, session_id: &str) -> anyhow::Result<AccessToken>;

    /// Tell the directory (and through it, the source device) that a
    /// transfer finished. Requires a valid bearer token.
    async fn notify_transfer_complete(
        &self,
        bearer_token: &str,
        completion: &TransferCompletion,
    ) -> anyhow::Result<NotifyOutcome>;
}

/// Network reachability probe.
#[async_trait]
pub trait Connectivity: Send + Sync {
    /// Best-effort check. `true` means the directory is unreachable and
    /// the machines should take their offline paths.
    async fn check_if_offline(&self) -> bool;
}
