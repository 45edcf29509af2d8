//! Application-wide error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error while {op} {}: {source}", path.display())]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Recording source error: {0}")]
    Source(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Render timed out after {secs}s without a finished signal")]
    RenderTimeout { secs: u64 },

    #[error("Upload error: {0}")]
    Upload(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn render(msg: impl Into<String>) -> Self {
        Self::Render(msg.into())
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether this error wraps an `AlreadyExists` IO error.
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::Io(e) | Self::IoPath { source: e, .. } => {
                e.kind() == std::io::ErrorKind::AlreadyExists
            }
            _ => false,
        }
    }

    /// Whether this error wraps a `NotFound` IO error.
    pub fn is_io_not_found(&self) -> bool {
        match self {
            Self::Io(e) | Self::IoPath { source: e, .. } => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
