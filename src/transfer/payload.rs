//! Transfer payload parsing and transfer-code handling.

use chrono::Utc;
use rand::Rng;
use regex::Regex;

use crate::types::{TransferPayload, TRANSFER_PAYLOAD_TYPE};

use super::ImportError;

/// Transfer codes are exactly this many characters, always.
pub const TRANSFER_CODE_LEN: usize = 6;

/// Code alphabet without the lookalikes 0/O and 1/I. The code is read
/// aloud or retyped by a person, so ambiguity is the enemy.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Parse and validate a scanned QR string into a transfer payload.
///
/// Validation order matters: shape first, then the type tag, then
/// required fields, then expiry. Expiry is checked before any
/// decryption work so an expired payload never reaches the vault.
pub fn parse_transfer_payload(raw: &str) -> Result<TransferPayload, ImportError> {
    let payload: TransferPayload = serde_json::from_str(raw)
        .map_err(|e| ImportError::InvalidPayload(format!("not a transfer payload: {e}")))?;

    if payload.payload_type != TRANSFER_PAYLOAD_TYPE {
        return Err(ImportError::InvalidPayload(format!(
            "unexpected payload type '{}'",
            payload.payload_type
        )));
    }

    for (field, value) in [
        ("encrypted", &payload.encrypted),
        ("salt", &payload.salt),
        ("iv", &payload.iv),
        ("publicKey", &payload.public_key),
        ("transferId", &payload.transfer_id),
        ("sourceDeviceId", &payload.source_device_id),
    ] {
        if value.trim().is_empty() {
            return Err(ImportError::InvalidPayload(format!("missing field '{field}'")));
        }
    }

    let id_re = Regex::new(r"^[0-9a-fA-F-]{8,64}$").unwrap();
    if !id_re.is_match(&payload.transfer_id) {
        return Err(ImportError::InvalidPayload(
            "malformed transfer id".to_string(),
        ));
    }

    if let Some(expires_at) = payload.expires_at {
        if expires_at < Utc::now() {
            return Err(ImportError::Expired);
        }
    }

    Ok(payload)
}

/// Normalize user input into canonical transfer-code form: uppercase,
/// alphanumeric only, at most six characters. Whitespace and dashes
/// from "read it aloud in pairs" formatting are dropped.
pub fn normalize_transfer_code(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .take(TRANSFER_CODE_LEN)
        .collect()
}

/// Generate a fresh six-character transfer code.
pub fn generate_transfer_code() -> String {
    let mut rng = rand::thread_rng();
    (0..TRANSFER_CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}
