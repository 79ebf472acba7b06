//! Error types for the gateway.

use thiserror::Error;
use zonecast_core::CoreError;

/// Authentication and session errors.
///
/// These surface to the client verbatim in the `auth_error` frame, so the
/// messages stay deliberately terse. Lockout state is reported without
/// distinguishing which earlier attempt tripped it.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The token does not have the expected structure
    #[error("invalid token format")]
    MalformedToken,

    /// The token signature does not verify against the configured key
    #[error("invalid token signature")]
    InvalidSignature,

    /// The token's expiry has passed
    #[error("token expired")]
    TokenExpired,

    /// No matching account exists
    #[error("unknown principal: {0}")]
    UnknownPrincipal(String),

    /// The account exists but is deactivated
    #[error("account is deactivated")]
    PrincipalDeactivated,

    /// Too many failed attempts from this address
    #[error("too many failed attempts, try again later")]
    LockedOut,

    /// The referenced session does not exist
    #[error("unknown session")]
    UnknownSession,

    /// The referenced session has expired
    #[error("session expired")]
    SessionExpired,

    /// The principal store failed
    #[error("principal lookup failed: {0}")]
    Store(#[from] CoreError),
}

/// `WebSocket` transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// `WebSocket` protocol or I/O error
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The peer sent a close frame with a code
    #[error("connection closed with code {0}")]
    Closed(u16),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

/// Per-connection errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The bounded send queue is full and the direct-send fallback failed
    #[error("send queue full")]
    QueueFull,

    /// The underlying transport failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The connection is not in a state that accepts sends
    #[error("connection is not active")]
    NotActive,

    /// A transport write did not complete within the write timeout
    #[error("send timed out")]
    SendTimeout,

    /// Graceful close did not finish within the close timeout
    #[error("close timed out")]
    CloseTimeout,
}

/// Errors produced by the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Authentication failed
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// A connection operation failed
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Transport-level failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Shared identity/event model error
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Configuration problem
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file could not be parsed
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// The connection limit has been reached
    #[error("server at connection capacity ({0})")]
    AtCapacity(usize),

    /// The gateway is shutting down
    #[error("server is shutting down")]
    ShuttingDown,
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
