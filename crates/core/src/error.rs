//! Error taxonomy shared by every Keel crate.

use serde::{Deserialize, Serialize};

/// Synchronous declaration errors. These terminate program evaluation; nothing
/// in Keel catches them locally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum KeelError {
    /// A mapping was required (inputs, options) but something else was passed.
    #[error("config validation: {what} must be a mapping, got {found}")]
    ConfigValidation { what: String, found: String },
    /// A required configuration key is absent. `key` is fully qualified (`ns:key`).
    #[error("missing required configuration value '{key}'")]
    MissingConfig { key: String },
    /// A configuration value exists but cannot be read as the requested type.
    #[error("configuration value '{key}' is not a valid {expected}")]
    ConfigType { key: String, expected: String },
    #[error("invalid resource: {0}")]
    InvalidResource(String),
    #[error("duplicate resource '{name}' of type {type_token}")]
    DuplicateResource { type_token: String, name: String },
}

pub type KeelResult<T> = Result<T, KeelError>;

/// Asynchronous failure of an upstream provisioning step. Carried inside a
/// failed `DeferredValue` and handed to every dependent; never thrown.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("resolution failed: {message}")]
pub struct ResolutionFailure {
    pub message: String,
}

impl ResolutionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}
