//! Directory Service
//!
//! HTTP client and error types for the remote identity directory.

pub mod client;
pub mod error;

pub use client::{DirectoryHttpClient, DirectoryProbe};
pub use error::{
    is_already_exists_error, is_network_or_timeout_error, is_session_not_synced_error,
    DirectoryError,
};
