//! Transfer export: seal the local identity into a QR-ready payload.

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::state::{PendingExport, StateHandle};
use crate::types::{IdentityVault, TransferPayload, TRANSFER_PAYLOAD_TYPE};
use crate::vault::cipher;

use super::payload::{generate_transfer_code, normalize_transfer_code};

/// Default payload lifetime. A stale QR code on a screenshot should
/// not stay importable indefinitely.
pub const DEFAULT_TRANSFER_TTL_MINUTES: i64 = 10;

/// A sealed payload plus the code that unlocks it. The payload becomes
/// the QR code; the code travels out-of-band and must never be
/// embedded in, or rendered next to, the payload.
pub struct ExportBundle {
    pub payload: TransferPayload,
    pub code: String,
}

/// Seal the identity in `vault` for transfer to another device.
pub fn export_identity(
    vault: &dyn IdentityVault,
    source_device_id: &str,
    ttl_minutes: i64,
) -> Result<ExportBundle> {
    let identity = vault
        .load_identity()
        .context("no identity on this device to export")?;

    let code = generate_transfer_code();
    let plaintext = serde_json::to_vec(&identity).context("failed to serialize identity")?;
    let sealed = cipher::seal(&plaintext, &code)?;

    let payload = TransferPayload {
        payload_type: TRANSFER_PAYLOAD_TYPE.to_string(),
        encrypted: sealed.encrypted,
        salt: sealed.salt,
        iv: sealed.iv,
        public_key: identity.public_key,
        transfer_id: Uuid::new_v4().to_string(),
        source_device_id: source_device_id.to_string(),
        expires_at: Some(Utc::now() + Duration::minutes(ttl_minutes)),
    };

    Ok(ExportBundle { payload, code })
}

/// Record an issued export so a later completion can be verified.
pub fn register_export(store: &StateHandle, bundle: &ExportBundle) {
    store.set_pending_export(&PendingExport {
        transfer_id: bundle.payload.transfer_id.clone(),
        code: bundle.code.clone(),
        public_key: bundle.payload.public_key.clone(),
        expires_at: bundle.payload.expires_at,
    });
}

/// Source-device side of a finished transfer: verify the transfer id
/// and code against the export this device issued, then record it as
/// completed. Key material is never destroyed here; removal of the
/// local identity stays a manual, user-confirmed act.
pub fn complete_transfer(
    store: &StateHandle,
    device_id: &str,
    transfer_id: &str,
    raw_code: &str,
) -> Result<()> {
    let Some(pending) = store.get_pending_export(transfer_id) else {
        bail!("no pending transfer with id {transfer_id}");
    };

    if let Some(expires_at) = pending.expires_at {
        if expires_at < Utc::now() {
            store.clear_pending_export(transfer_id);
            bail!("transfer {transfer_id} has expired");
        }
    }

    if normalize_transfer_code(raw_code) != pending.code {
        bail!("transfer code does not match");
    }

    store.record_transfer(transfer_id, device_id, &pending.public_key, true);
    store.clear_pending_export(transfer_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::testing::{make_identity, MemoryVault};
    use crate::transfer::payload::parse_transfer_payload;

    use super::*;

    #[test]
    fn test_export_produces_parseable_payload_with_expiry() {
        let vault = MemoryVault::with_identity(make_identity("src"));
        let bundle = export_identity(&vault, "device-a", DEFAULT_TRANSFER_TTL_MINUTES).unwrap();

        assert_eq!(bundle.code.len(), 6);
        let raw = serde_json::to_string(&bundle.payload).unwrap();
        let parsed = parse_transfer_payload(&raw).unwrap();
        assert_eq!(parsed.public_key, "pk-src");
        assert_eq!(parsed.source_device_id, "device-a");
        assert!(parsed.expires_at.is_some());
    }

    #[test]
    fn test_complete_transfer_verifies_id_and_code() {
        use crate::state::{Database, StateHandle};

        let store = StateHandle::new(Database::open_in_memory().unwrap());
        let vault = MemoryVault::with_identity(make_identity("src"));
        let bundle = export_identity(&vault, "device-a", 10).unwrap();
        register_export(&store, &bundle);
        let transfer_id = bundle.payload.transfer_id.clone();

        // Wrong code is rejected and the pending export survives.
        assert!(complete_transfer(&store, "device-a", &transfer_id, "WRONG6").is_err());
        assert!(store.get_pending_export(&transfer_id).is_some());

        // Unknown transfer id is rejected.
        assert!(complete_transfer(&store, "device-a", "not-a-transfer", &bundle.code).is_err());

        // Matching id and code completes and clears the pending record.
        complete_transfer(&store, "device-a", &transfer_id, &bundle.code).unwrap();
        assert!(store.get_pending_export(&transfer_id).is_none());
        let recorded = store.get_transfer(&transfer_id).unwrap();
        assert!(recorded.notified);
        assert_eq!(recorded.public_key, "pk-src");
    }

    #[test]
    fn test_complete_transfer_rejects_expired_export() {
        use crate::state::{Database, PendingExport, StateHandle};

        let store = StateHandle::new(Database::open_in_memory().unwrap());
        store.set_pending_export(&PendingExport {
            transfer_id: "t-1".to_string(),
            code: "K7M2P9".to_string(),
            public_key: "pk".to_string(),
            expires_at: Some(Utc::now() - Duration::minutes(1)),
        });

        assert!(complete_transfer(&store, "device-a", "t-1", "K7M2P9").is_err());
        assert!(store.get_pending_export("t-1").is_none());
    }

    #[test]
    fn test_export_fails_without_identity() {
        let vault = MemoryVault::default();
        assert!(export_identity(&vault, "device-a", 10).is_err());
    }

    #[test]
    fn test_exported_payload_decrypts_with_its_code() {
        let identity = make_identity("src");
        let vault = MemoryVault::with_identity(identity.clone());
        let bundle = export_identity(&vault, "device-a", 10).unwrap();

        let plain = cipher::open(
            &bundle.payload.encrypted,
            &bundle.payload.salt,
            &bundle.payload.iv,
            &bundle.code,
        )
        .unwrap();
        let restored: crate::types::Identity = serde_json::from_slice(&plain).unwrap();
        assert_eq!(restored.public_key, identity.public_key);
        assert_eq!(restored.secret_key, identity.secret_key);
    }
}
