//! Custodian Configuration
//!
//! Loads and saves the custodian's configuration from
//! `~/.custodian/custodian.json`.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::vault::get_custodian_dir;

/// Config file name within the custodian directory.
const CONFIG_FILENAME: &str = "custodian.json";

/// Default directory service base URL.
const DEFAULT_DIRECTORY_URL: &str = "https://directory.custodian.dev";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CustodianConfig {
    /// Base URL of the identity directory service.
    pub directory_url: String,
    /// Path to the local state database. May start with `~`.
    pub db_path: String,
    /// Minutes an exported transfer payload stays importable.
    pub transfer_ttl_minutes: i64,
    /// tracing filter directive, e.g. `info` or `custodian=debug`.
    pub log_level: String,
}

impl Default for CustodianConfig {
    fn default() -> Self {
        default_config()
    }
}

pub fn default_config() -> CustodianConfig {
    CustodianConfig {
        directory_url: DEFAULT_DIRECTORY_URL.to_string(),
        db_path: "~/.custodian/state.db".to_string(),
        transfer_ttl_minutes: crate::transfer::DEFAULT_TRANSFER_TTL_MINUTES,
        log_level: "info".to_string(),
    }
}

/// Returns the full path to the config file: `~/.custodian/custodian.json`.
pub fn get_config_path() -> PathBuf {
    get_custodian_dir().join(CONFIG_FILENAME)
}

/// Load the config from disk.
///
/// Reads `~/.custodian/custodian.json` and merges missing fields with
/// defaults. Returns `None` if the file does not exist or cannot be
/// parsed.
pub fn load_config() -> Option<CustodianConfig> {
    let config_path = get_config_path();
    if !config_path.exists() {
        return None;
    }

    let contents = fs::read_to_string(&config_path).ok()?;
    let mut config: CustodianConfig = serde_json::from_str(&contents).ok()?;

    // Merge defaults for unset fields
    let defaults = default_config();

    if config.directory_url.is_empty() {
        config.directory_url = defaults.directory_url;
    }
    if config.db_path.is_empty() {
        config.db_path = defaults.db_path;
    }
    if config.transfer_ttl_minutes <= 0 {
        config.transfer_ttl_minutes = defaults.transfer_ttl_minutes;
    }
    if config.log_level.is_empty() {
        config.log_level = defaults.log_level;
    }

    Some(config)
}

/// Save the config to disk at `~/.custodian/custodian.json`.
///
/// Creates the custodian directory with mode 0o700 if it does not
/// exist. The config file is written with mode 0o600.
pub fn save_config(config: &CustodianConfig) -> Result<()> {
    let dir = get_custodian_dir();
    if !dir.exists() {
        fs::create_dir_all(&dir).context("Failed to create custodian directory")?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
    }

    let config_path = get_config_path();
    let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;

    fs::write(&config_path, &json).context("Failed to write config file")?;
    fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

    Ok(())
}

/// Resolve a path that may start with `~` to an absolute path.
pub fn resolve_path(p: &str) -> String {
    if let Some(rest) = p.strip_prefix('~') {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
        let rest = rest.strip_prefix('/').unwrap_or(rest);
        home.join(rest).to_string_lossy().to_string()
    } else {
        p.to_string()
    }
}
