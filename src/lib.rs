//! Custodian -- Self-Custody Identity Runtime
//!
//! Creates a cryptographic identity locally, provisions it with a remote
//! directory service, keeps local and remote state reconciled under
//! intermittent connectivity, and migrates it between devices through a
//! human-verified, encrypted QR-code exchange.

pub mod types;
pub mod config;
pub mod auth;
pub mod directory;
pub mod vault;
pub mod state;
pub mod provision;
pub mod transfer;
pub mod progress;

#[cfg(test)]
pub mod testing;
