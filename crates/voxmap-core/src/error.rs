//! Error types for the engine.

use glam::IVec3;
use thiserror::Error;

/// Engine-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid data error
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Node position is not inside any loaded block
    #[error("Invalid position: no loaded block contains node {0}")]
    InvalidPosition(IVec3),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Map database read or write failed
    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// Configuration could not be parsed or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
