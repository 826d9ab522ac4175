//! # Scope Errors
//!
//! This module defines the error type shared by the storage backends, the
//! runtime and the lifecycle layer. Errors never reach host code paths that run
//! inside `activate`; they surface only from set-up operations such as enabling
//! a backend or parsing configuration.

/// Errors that can occur while constructing or wiring the context engine.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ScopeError {
    #[error("Runtime does not support {capability}")]
    Unsupported { capability: &'static str },
    #[error("Unknown scope backend: {0}")]
    UnknownBackend(String),
    #[error("Invalid scope configuration: {0}")]
    InvalidConfig(String),
    #[error("Method slot lock poisoned: {0}")]
    SlotPoisoned(&'static str),
    #[error("Method already wrapped")]
    AlreadyInstalled,
}
