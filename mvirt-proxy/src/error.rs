//! Error types for the proxy.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for supervisor operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// A task for the container exists and has not stopped.
    #[error("unable to start container {0}: task is already running")]
    TaskRunning(String),

    /// Importing a local bundle must yield exactly one image.
    #[error("expected one image from {}, imported {count}", path.display())]
    ImportCount { path: PathBuf, count: usize },

    #[error("reconnect failed after {attempts} attempts: {source}")]
    ReconnectExhausted { attempts: u32, source: RuntimeError },

    #[error("failed to start task: {0}")]
    Start(RuntimeError),

    #[error("task {id} failed: {source}")]
    TaskFailed { id: String, source: RuntimeError },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("System error: {0}")]
    Nix(#[from] nix::errno::Errno),
}

/// Errors reported by a runtime client.
///
/// The variant is the error kind the supervisor classifies on, so the type is
/// cloneable and carries messages rather than sources.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The control plane cannot be reached right now.
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("youki command failed: {0}")]
    Command(String),

    #[error("image error: {0}")]
    Image(#[from] ImageError),

    #[error("storage error: {0}")]
    Storage(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, RuntimeError::Unavailable(_))
    }
}

/// Image pulling, import and storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    #[error("Invalid image bundle: {0}")]
    InvalidBundle(String),

    #[error("Layer extraction failed: {0}")]
    LayerExtraction(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<io::Error> for ImageError {
    fn from(e: io::Error) -> Self {
        ImageError::Storage(e.to_string())
    }
}

/// Per-container configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_error_kinds() {
        assert!(RuntimeError::NotFound("c1".into()).is_not_found());
        assert!(RuntimeError::Unavailable("gone".into()).is_unavailable());
        assert!(!RuntimeError::Command("boom".into()).is_unavailable());
        assert!(!RuntimeError::Image(ImageError::Registry("x".into())).is_not_found());
    }

    #[test]
    fn reconnect_exhausted_names_attempts() {
        let err = Error::ReconnectExhausted {
            attempts: 20,
            source: RuntimeError::Unavailable("youki missing".into()),
        };
        assert_eq!(
            err.to_string(),
            "reconnect failed after 20 attempts: runtime unavailable: youki missing"
        );
    }
}
