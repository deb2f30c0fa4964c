//! CLI errors.

use atelier_core::CoreError;
use thiserror::Error;

/// Errors reported by a command.
#[derive(Error, Debug)]
pub enum CliError {
    /// The command needs `--path`.
    #[error("store path required for {0} (use --path)")]
    MissingPath(&'static str),

    /// The store could not be opened or read.
    #[error(transparent)]
    Store(#[from] CoreError),

    /// Output could not be encoded.
    #[error("json output failed: {0}")]
    Json(#[from] serde_json::Error),

    /// The log is damaged.
    #[error("verification failed: {0}")]
    VerifyFailed(String),
}
