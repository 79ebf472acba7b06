//! Error types for Zonecast core operations.

use thiserror::Error;

/// Errors produced by core type parsing, validation, and principal storage.
#[derive(Debug, Error)]
pub enum CoreError {
    // Parsing errors
    /// An event type string did not match any known type
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// An event category string did not match any known category
    #[error("unknown event category: {0}")]
    UnknownEventCategory(String),

    /// An event priority string did not match any known priority
    #[error("unknown event priority: {0}")]
    UnknownEventPriority(String),

    // Payload errors
    /// Event payloads must be JSON objects
    #[error("event payload must be a JSON object")]
    PayloadNotObject,

    // Store errors
    /// Principal not found in the durable store
    #[error("principal not found: {0}")]
    PrincipalNotFound(String),

    /// The durable store failed
    #[error("principal store failure: {0}")]
    Store(String),
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
