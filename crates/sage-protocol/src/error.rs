//! Error types for the sage core.

use thiserror::Error;

/// Errors raised while assembling or driving the core.
///
/// `DuplicateRegistration`, `Uninitialized` and `AlreadyInitialized` are
/// wiring mistakes and are expected to abort startup.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("duplicate {kind} registration: {name}")]
    DuplicateRegistration { kind: &'static str, name: String },
    #[error("module not initialized: {0}")]
    Uninitialized(String),
    #[error("module already initialized: {0}")]
    AlreadyInitialized(String),
    #[error("event bus is no longer available")]
    BusUnavailable,
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl From<serde_json::Error> for KernelError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for KernelError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

/// Typed failures reported by a model backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("chat failed: {0}")]
    Chat(String),
    #[error("streaming failed: {0}")]
    Stream(String),
    #[error("embedding failed: {0}")]
    Embedding(String),
}

/// Convenience result type for core operations.
pub type KernelResult<T> = Result<T, KernelError>;
