//! Error Types
//!
//! Errors raised while validating arguments, running state handlers,
//! talking to the agent transport and touching durable storage.

use thiserror::Error;

/// Problems with a flow's arguments, detected before an instance exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("'{0}' must not be empty")]
    EmptyList(String),

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("malformed arguments: {0}")]
    Malformed(String),
}

/// Errors raised by state handlers.
///
/// Returning any of these from a handler aborts the whole instance; the
/// rendered message becomes the instance's failure status.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("{0}")]
    Fatal(String),

    #[error("action '{action}' requires component '{component}' which is not loaded")]
    ComponentNotLoaded { component: String, action: String },

    #[error("no handler registered for state '{0}'")]
    UnknownState(String),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowError {
    /// Shorthand for a workflow-level abort.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }
}

/// Errors returned from the engine's public entry points.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid arguments: {0}")]
    Validation(#[from] ValidationError),

    #[error("unknown flow '{0}'")]
    UnknownFlow(String),

    #[error("invalid flow graph: {0}")]
    InvalidGraph(String),

    #[error("unknown flow instance '{0}'")]
    UnknownInstance(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable storage failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid store path: '{0}'")]
    InvalidPath(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Workflow state write failures.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("key '{key}' belongs to state '{owner}' and cannot be written from '{writer}'")]
    NotOwner {
        key: String,
        owner: String,
        writer: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Agent transport failures.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("failed to send request: {0}")]
    Send(String),
}
