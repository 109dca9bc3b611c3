//! Persistent State
//!
//! SQLite database plus the thread-safe handle the state machines use.

pub mod database;

use std::sync::{Arc, Mutex};

use tracing::warn;

use serde::{Deserialize, Serialize};

use crate::types::Session;

pub use database::{CompletedTransfer, Database};

/// Shared, thread-safe handle over the database.
///
/// Write failures are logged and swallowed: persistent state here is
/// bookkeeping, and a failed write must never abort an identity
/// operation that already succeeded.
#[derive(Clone)]
pub struct StateHandle {
    db: Arc<Mutex<Database>>,
}

impl StateHandle {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub fn device_id(&self) -> String {
        self.db
            .lock()
            .unwrap()
            .device_id()
            .unwrap_or_else(|e| {
                warn!("failed to read device id: {e:#}");
                uuid::Uuid::new_v4().to_string()
            })
    }

    pub fn get_session(&self) -> Option<Session> {
        self.db.lock().unwrap().get_session().ok().flatten()
    }

    pub fn set_session(&self, session: &Session, synced: bool) {
        if let Err(e) = self.db.lock().unwrap().set_session(session, synced) {
            warn!("failed to persist session: {e:#}");
        }
    }

    pub fn session_synced(&self) -> bool {
        self.db.lock().unwrap().session_synced().unwrap_or(false)
    }

    pub fn mark_session_synced(&self) {
        if let Err(e) = self.db.lock().unwrap().mark_session_synced() {
            warn!("failed to mark session synced: {e:#}");
        }
    }

    pub fn record_transfer(
        &self,
        transfer_id: &str,
        source_device_id: &str,
        public_key: &str,
        notified: bool,
    ) {
        if let Err(e) = self.db.lock().unwrap().record_transfer(
            transfer_id,
            source_device_id,
            public_key,
            notified,
        ) {
            warn!("failed to record transfer {transfer_id}: {e:#}");
        }
    }

    pub fn get_transfer(&self, transfer_id: &str) -> Option<CompletedTransfer> {
        self.db.lock().unwrap().get_transfer(transfer_id).ok().flatten()
    }

    /// Remember an export issued by this device so a later
    /// complete-transfer request can be verified against it.
    pub fn set_pending_export(&self, pending: &PendingExport) {
        let key = pending_export_key(&pending.transfer_id);
        match serde_json::to_string(pending) {
            Ok(json) => {
                if let Err(e) = self.db.lock().unwrap().set_kv(&key, &json) {
                    warn!("failed to record pending export: {e:#}");
                }
            }
            Err(e) => warn!("failed to serialize pending export: {e:#}"),
        }
    }

    pub fn get_pending_export(&self, transfer_id: &str) -> Option<PendingExport> {
        let json = self
            .db
            .lock()
            .unwrap()
            .get_kv(&pending_export_key(transfer_id))
            .ok()
            .flatten()?;
        serde_json::from_str(&json).ok()
    }

    pub fn clear_pending_export(&self, transfer_id: &str) {
        if let Err(e) = self
            .db
            .lock()
            .unwrap()
            .delete_kv(&pending_export_key(transfer_id))
        {
            warn!("failed to clear pending export: {e:#}");
        }
    }
}

fn pending_export_key(transfer_id: &str) -> String {
    format!("pending_export:{transfer_id}")
}

/// An export this device issued and has not yet seen completed.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingExport {
    pub transfer_id: String,
    /// Normalized transfer code, kept locally to verify completion.
    pub code: String,
    pub public_key: String,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}
