// src/error.rs

use thiserror::Error;

/// Core error types for Pungi
#[derive(Error, Debug)]
pub enum Error {
    /// Schema violation, missing required key or mutually exclusive options
    #[error("Configuration error: {0}")]
    Config(String),

    /// A referenced Koji tag/build, git ref, SCM file or comps group is missing
    #[error("Input not found: {0}")]
    InputNotFound(String),

    /// Requires without a provider in the package set
    #[error("Unsatisfiable dependencies: {0}")]
    Unsatisfiable(String),

    /// Two packages with identical NEVRA differ in signature
    #[error("Duplicate signature: {0}")]
    DuplicateSignature(String),

    /// A package lacks every signature the compose requires
    #[error("Missing signature: {0}")]
    MissingSignature(String),

    /// An image or other deliverable task failed
    #[error("Deliverable failed: {0}")]
    DeliverableFailure(String),

    /// Recorded reuse inputs differ from the current inputs
    #[error("Reuse invalidated: {0}")]
    ReuseInvalidated(String),

    /// Wrapped subprocess or RPC failure
    #[error("External tool error: {0}")]
    ExternalTool(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O error with context
    #[error("I/O error: {0}")]
    IoError(String),

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed input documents (XML, YAML, TOML, NEVRA strings)
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Remote repository access failed
    #[error("Download error: {0}")]
    DownloadError(String),

    /// The compose was cancelled by a failure elsewhere
    #[error("Compose aborted: {0}")]
    Aborted(String),
}

impl Error {
    /// Whether this error should stop the compose
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::ReuseInvalidated(_))
    }
}

/// Result type alias using Pungi's Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse_invalidated_is_recoverable() {
        assert!(!Error::ReuseInvalidated("config changed".to_string()).is_fatal());
        assert!(Error::InputNotFound("f40-build".to_string()).is_fatal());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("gone"));
    }
}
