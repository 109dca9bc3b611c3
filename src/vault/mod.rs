//! Identity Vault
//!
//! File-backed storage for the identity's key material. The identity
//! lives at `~/.custodian/identity.json` with owner-only permissions;
//! it is created once and never overwritten.

pub mod cipher;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use rand::RngCore;
use sha3::{Digest, Sha3_256};
use tracing::info;

use crate::types::{Identity, IdentityVault, SealedIdentity};

/// Directory name under the user's home for all custodian data.
const CUSTODIAN_DIR_NAME: &str = ".custodian";

/// Identity file name within the custodian directory.
const IDENTITY_FILENAME: &str = "identity.json";

/// Returns the custodian base directory: `~/.custodian`.
pub fn get_custodian_dir() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
    home.join(CUSTODIAN_DIR_NAME)
}

/// File-backed identity vault.
pub struct FileVault {
    dir: PathBuf,
}

impl FileVault {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Vault rooted at the default `~/.custodian` directory.
    pub fn default_location() -> Self {
        Self::new(get_custodian_dir())
    }

    fn identity_path(&self) -> PathBuf {
        self.dir.join(IDENTITY_FILENAME)
    }

    fn ensure_dir(&self) -> Result<()> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).context("failed to create custodian directory")?;
            fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))
                .context("failed to set directory permissions")?;
        }
        Ok(())
    }

    fn write_identity(&self, identity: &Identity) -> Result<()> {
        self.ensure_dir()?;
        let path = self.identity_path();
        let json =
            serde_json::to_string_pretty(identity).context("failed to serialize identity")?;
        fs::write(&path, &json).context("failed to write identity file")?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
            .context("failed to set identity file permissions")?;
        Ok(())
    }
}

/// Generate fresh key material. The public key and identifier are
/// derived from the secret; derivation details belong to the crypto
/// layer and are opaque to the rest of the crate.
fn generate_identity() -> Identity {
    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);

    let public_key = hex::encode(Sha3_256::digest(secret));
    let id_digest = Sha3_256::digest(public_key.as_bytes());
    let public_id = format!("cst{}", hex::encode(&id_digest[..10]));

    Identity {
        public_key,
        public_id,
        secret_key: hex::encode(secret),
        created_at: Utc::now().to_rfc3339(),
    }
}

impl IdentityVault for FileVault {
    fn create_identity(&self) -> Result<Identity> {
        if self.has_identity() {
            anyhow::bail!("an identity already exists on this device");
        }

        let identity = generate_identity();
        self.write_identity(&identity)?;
        info!("created identity {}", identity.public_id);
        Ok(identity)
    }

    fn has_identity(&self) -> bool {
        self.identity_path().exists()
    }

    fn load_identity(&self) -> Option<Identity> {
        let contents = fs::read_to_string(self.identity_path()).ok()?;
        serde_json::from_str(&contents).ok()
    }

    fn import_identity(&self, sealed: &SealedIdentity, code: &str) -> Result<()> {
        // Re-read durable state right before mutating; a concurrent
        // writer may have landed an identity since the caller checked.
        if let Some(existing) = self.load_identity() {
            if existing.public_key == sealed.public_key {
                info!("identity {} already present; import is a no-op", existing.public_id);
                return Ok(());
            }
            anyhow::bail!("a different identity already exists on this device");
        }

        let plaintext = cipher::open(&sealed.encrypted, &sealed.salt, &sealed.iv, code)?;
        let identity: Identity =
            serde_json::from_str(&String::from_utf8_lossy(&plaintext))
                .context("decrypted payload is not a valid identity")?;

        if identity.public_key != sealed.public_key {
            anyhow::bail!("decrypted identity does not match the payload's public key");
        }

        self.write_identity(&identity)?;
        info!("imported identity {}", identity.public_id);
        Ok(())
    }
}
