//! Transfer Cipher
//!
//! Seals and opens identity material for device-to-device transfer.
//! The key is derived from the 6-character transfer code via Argon2id;
//! the payload is ChaCha20-Poly1305 AEAD ciphertext. Fields travel
//! base64-encoded inside the QR payload.

use anyhow::{anyhow, Context, Result};
use argon2::Argon2;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// The encrypted fields of a transfer payload, before the public
/// metadata is attached.
#[derive(Clone, Debug)]
pub struct SealedBox {
    pub encrypted: String,
    pub salt: String,
    pub iv: String,
}

fn derive_key(code: &str, salt: &[u8]) -> Result<[u8; 32]> {
    let mut key = [0u8; 32];
    Argon2::default()
        .hash_password_into(code.as_bytes(), salt, &mut key)
        .map_err(|e| anyhow!("key derivation failed: {e}"))?;
    Ok(key)
}

/// Encrypt `plaintext` under a key derived from `code`.
pub fn seal(plaintext: &[u8], code: &str) -> Result<SealedBox> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let key = derive_key(code, &salt)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| anyhow!("transfer payload encrypt failed: {e}"))?;

    Ok(SealedBox {
        encrypted: B64.encode(ciphertext),
        salt: B64.encode(salt),
        iv: B64.encode(nonce_bytes),
    })
}

/// Decrypt a sealed transfer payload with the transfer code.
///
/// A wrong code fails the AEAD tag check, indistinguishable from a
/// corrupt payload.
pub fn open(encrypted: &str, salt: &str, iv: &str, code: &str) -> Result<Vec<u8>> {
    let ciphertext = B64.decode(encrypted).context("encrypted field is not valid base64")?;
    let salt = B64.decode(salt).context("salt field is not valid base64")?;
    let nonce = B64.decode(iv).context("iv field is not valid base64")?;
    if nonce.len() != NONCE_LEN {
        anyhow::bail!("iv has unexpected length {}", nonce.len());
    }

    let key = derive_key(code, &salt)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
        .map_err(|_| anyhow!("decryption failed: wrong transfer code or corrupt payload"))
}
