//! Error types for svs-infer-rs.

use std::path::PathBuf;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
///
/// Stage preprocessing errors short-circuit out of the owning stage, move the
/// stage to `Failed`, and are surfaced verbatim by the pipeline driver.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Null, mis-named, or mis-shaped payload (wrong input variant, wrong
    /// class marker, empty required field).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Malformed JSON, dictionary, manifest, or embedding data.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// An asset referenced by a configuration or manifest does not exist.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// Requested execution provider or driver option that cannot be honoured.
    #[error("feature not supported: {0}")]
    FeatureNotSupported(String),

    /// Session-level failure: resample-length mismatch, missing required
    /// parameter, predicted count mismatch, compatibility mismatch, driver
    /// not initialised, and the like.
    #[error("session error: {0}")]
    Session(String),

    /// Declared-but-unsupported operation (asynchronous stage start).
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<hound::Error> for Error {
    fn from(error: hound::Error) -> Self {
        Error::InvalidFormat(format!("wav: {error}"))
    }
}
