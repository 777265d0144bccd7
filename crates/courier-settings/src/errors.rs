//! Settings error types.

use thiserror::Error;

/// Errors that can occur when loading settings or the files they reference.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Failed to read a file from disk.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in the settings file.
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A settings value was invalid (e.g., out of range).
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
    /// Certificate or key material could not be loaded.
    #[error("invalid TLS material: {0}")]
    Tls(String),
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
