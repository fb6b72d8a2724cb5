// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CourierError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The backend legitimately has no value for the reference.
    #[error("Secret does not exist: {0}")]
    NoSecret(String),

    #[error("Backend error: {0}")]
    BackendError(String),

    #[error("Target caches not in sync for {0}")]
    CacheDesync(String),

    #[error("Write conflict on {0}")]
    Conflict(String),

    #[error("Target {0} does not exist and creation policy is Merge")]
    TargetMissing(String),

    #[error("Target {target} is already owned by {owner}")]
    AlreadyOwned { target: String, owner: String },

    #[error("Target {0} is immutable and its data would change")]
    Immutable(String),

    #[error("No default store set but data reference {0} does not name one")]
    MissingDefaultStore(String),

    #[error("Store not found: {0}")]
    StoreNotFound(String),

    #[error("Store not ready: {0}")]
    StoreNotReady(String),

    #[error("Generator not found: {0}")]
    GeneratorNotFound(String),

    #[error("Invalid store configuration: {0}")]
    InvalidStore(String),

    #[error("Invalid binding: {0}")]
    InvalidBinding(String),

    #[error("Invalid keys in {0}")]
    InvalidKeys(String),

    #[error("Key collision: {0}")]
    KeyCollision(String),

    #[error("Decoding failed: {0}")]
    DecodingError(String),

    #[error("Template error: {0}")]
    TemplateError(String),

    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    #[error("Informer error: {0}")]
    InformerError(String),
}

/// How the reconciler reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry soon.
    Transient,
    /// Report and wait for the next refresh or a spec edit.
    Permanent,
    /// Expected absence of backend data.
    Absent,
}

impl CourierError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CourierError::NoSecret(_) => ErrorClass::Absent,
            CourierError::MissingDefaultStore(_)
            | CourierError::AlreadyOwned { .. }
            | CourierError::Immutable(_)
            | CourierError::TargetMissing(_)
            | CourierError::InvalidBinding(_)
            | CourierError::InvalidStore(_)
            | CourierError::InvalidKeys(_)
            | CourierError::KeyCollision(_)
            | CourierError::TemplateError(_)
            | CourierError::InvalidDuration(_) => ErrorClass::Permanent,
            _ => ErrorClass::Transient,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CourierError::KubeError(kube::Error::Api(err)) if err.code == 404)
    }
}

impl From<regex::Error> for CourierError {
    fn from(e: regex::Error) -> Self {
        CourierError::InvalidBinding(format!("invalid regular expression: {}", e))
    }
}

impl From<minijinja::Error> for CourierError {
    fn from(e: minijinja::Error) -> Self {
        CourierError::TemplateError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CourierError>;
