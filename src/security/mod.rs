//! Credentials
//!
//! Instance identity on disk and OS keyring storage for the API key.

pub mod identity;
pub mod keyring;

pub use identity::{identity_path, Identity, KeySource};
