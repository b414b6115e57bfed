//! Error types for the state engine and its persistence adapter.
//!
//! - [`StateError`]: structural failures of engine operations (unregistered
//!   types, unserializable models, persistence failures surfaced by `commit`).
//! - [`CacheError`]: persistence misconfiguration and I/O failures.
//! - [`ModelError`]: failures raised by a model's dump/hydrate pair.
//!
//! Subscriber callback failures are not part of this taxonomy; they are
//! contained by the dispatcher and only logged and counted.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by a model's dump/hydrate contract.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ModelError {
    /// A field required for serialization has not been initialized.
    #[error("field '{field}' is not initialized")]
    Uninitialized { field: String },

    /// A document field holds a value the model cannot accept.
    #[error("invalid value for field '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    /// Generic serde conversion failure.
    #[error("model conversion failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl ModelError {
    pub fn as_label(&self) -> &'static str {
        match self {
            ModelError::Uninitialized { .. } => "model_uninitialized",
            ModelError::InvalidField { .. } => "model_invalid_field",
            ModelError::Json(_) => "model_json",
        }
    }
}

/// Errors raised while persisting a model document.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum CacheError {
    /// No cache base directory is configured.
    #[error("cache base path is unset; set MYOSIN_CACHE_BASE_PATH before using model caching")]
    NullCachePath,

    /// The configured cache base directory does not exist.
    #[error("cache base path {} does not exist", path.display())]
    CachePath { path: PathBuf },

    /// The model could not be serialized for caching.
    #[error("failed to serialize model for caching: {0}")]
    Serialize(#[source] ModelError),

    /// The document could not be encoded as JSON.
    #[error("failed to encode cached document: {0}")]
    Encode(#[from] serde_json::Error),

    /// Filesystem operation failed.
    #[error("cache I/O failed on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    pub fn as_label(&self) -> &'static str {
        match self {
            CacheError::NullCachePath => "cache_null_path",
            CacheError::CachePath { .. } => "cache_path",
            CacheError::Serialize(_) => "cache_serialize",
            CacheError::Encode(_) => "cache_encode",
            CacheError::Io { .. } => "cache_io",
        }
    }
}

/// Errors raised by state engine operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum StateError {
    /// The operation referenced a type that was never loaded.
    #[error("model of type '{type_tag}' is not registered")]
    ModelNotFound { type_tag: String },

    /// The model failed to serialize at load time.
    #[error("failed to register model of type '{type_tag}': cannot be serialized")]
    UninitializedState {
        type_tag: String,
        #[source]
        source: ModelError,
    },

    /// The tag is registered, but to a different concrete type.
    #[error("type tag '{type_tag}' is bound to a different model type")]
    TypeMismatch { type_tag: String },

    /// No subscription with this id exists on the type.
    #[error("subscription {id} not found on model '{type_tag}'")]
    SubscriptionNotFound { type_tag: String, id: String },

    /// The dispatch runtime could not be started.
    #[error("dispatch runtime error: {0}")]
    Runtime(String),

    /// Persistence failed.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl StateError {
    pub fn model_not_found(type_tag: impl Into<String>) -> Self {
        StateError::ModelNotFound {
            type_tag: type_tag.into(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            StateError::ModelNotFound { .. } => "state_model_not_found",
            StateError::UninitializedState { .. } => "state_uninitialized",
            StateError::TypeMismatch { .. } => "state_type_mismatch",
            StateError::SubscriptionNotFound { .. } => "state_subscription_not_found",
            StateError::Runtime(_) => "state_runtime",
            StateError::Cache(err) => err.as_label(),
        }
    }
}
