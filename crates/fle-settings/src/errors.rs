//! Settings error types.

use std::path::PathBuf;

use thiserror::Error;

/// Settings could not be loaded or did not validate.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read settings file {}: {source}", path.display())]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The settings file is not valid JSON, or a value has the wrong type.
    #[error("malformed settings: {0}")]
    Json(#[from] serde_json::Error),
    /// A value is out of range or inconsistent with another value.
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

/// Result alias for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;
