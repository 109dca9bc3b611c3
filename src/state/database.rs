//! Custodian Database
//!
//! SQLite-backed persistent state: the device id, the current session
//! and its synced flag, free-form key-value pairs, and the log of
//! completed identity transfers. Uses rusqlite for synchronous,
//! single-process access.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::types::Session;

const SCHEMA_VERSION: i64 = 1;

const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS transfers (
    transfer_id TEXT PRIMARY KEY,
    source_device_id TEXT NOT NULL,
    public_key TEXT NOT NULL,
    notified INTEGER NOT NULL DEFAULT 0,
    completed_at TEXT NOT NULL
);
"#;

const KV_DEVICE_ID: &str = "device_id";
const KV_SESSION: &str = "session";
const KV_SESSION_SYNCED: &str = "session_synced";

/// A finished identity transfer, as recorded on the importing device.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedTransfer {
    pub transfer_id: String,
    pub source_device_id: String,
    pub public_key: String,
    /// Whether the source device was told to remove its copy.
    pub notified: bool,
    pub completed_at: String,
}

/// The custodian's SQLite database handle.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the database at `db_path` and apply the schema.
    pub fn open(db_path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create db directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database: {db_path}"))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    /// Open an in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(CREATE_TABLES)
            .context("failed to create tables")?;
        conn.execute(
            "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?1, datetime('now'))",
            params![SCHEMA_VERSION],
        )?;
        Ok(Self { conn })
    }

    // ─── Key-Value ───────────────────────────────────────────────

    pub fn get_kv(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(result)
    }

    pub fn set_kv(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_kv(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    // ─── Device ──────────────────────────────────────────────────

    /// Stable identifier for this device, minted on first use.
    pub fn device_id(&self) -> Result<String> {
        if let Some(id) = self.get_kv(KV_DEVICE_ID)? {
            return Ok(id);
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.set_kv(KV_DEVICE_ID, &id)?;
        Ok(id)
    }

    // ─── Session ─────────────────────────────────────────────────

    pub fn get_session(&self) -> Result<Option<Session>> {
        let Some(raw) = self.get_kv(KV_SESSION)? else {
            return Ok(None);
        };
        Ok(serde_json::from_str(&raw).ok())
    }

    /// Persist the session. `synced` records whether the directory has
    /// seen it; offline-born sessions start unsynced.
    pub fn set_session(&self, session: &Session, synced: bool) -> Result<()> {
        self.set_kv(KV_SESSION, &serde_json::to_string(session)?)?;
        self.set_kv(KV_SESSION_SYNCED, if synced { "1" } else { "0" })?;
        Ok(())
    }

    pub fn session_synced(&self) -> Result<bool> {
        Ok(self.get_kv(KV_SESSION_SYNCED)?.as_deref() == Some("1"))
    }

    pub fn mark_session_synced(&self) -> Result<()> {
        self.set_kv(KV_SESSION_SYNCED, "1")
    }

    pub fn clear_session(&self) -> Result<()> {
        self.delete_kv(KV_SESSION)?;
        self.delete_kv(KV_SESSION_SYNCED)
    }

    // ─── Transfers ───────────────────────────────────────────────

    pub fn record_transfer(
        &self,
        transfer_id: &str,
        source_device_id: &str,
        public_key: &str,
        notified: bool,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO transfers
             (transfer_id, source_device_id, public_key, notified, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                transfer_id,
                source_device_id,
                public_key,
                notified as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_transfer(&self, transfer_id: &str) -> Result<Option<CompletedTransfer>> {
        let result = self
            .conn
            .query_row(
                "SELECT transfer_id, source_device_id, public_key, notified, completed_at
                 FROM transfers WHERE transfer_id = ?1",
                params![transfer_id],
                |row| {
                    Ok(CompletedTransfer {
                        transfer_id: row.get(0)?,
                        source_device_id: row.get(1)?,
                        public_key: row.get(2)?,
                        notified: row.get::<_, i64>(3)? != 0,
                        completed_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }
}
