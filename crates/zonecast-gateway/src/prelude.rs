//! Prelude module - commonly used types for convenient import.
//!
//! Use `use zonecast_gateway::prelude::*;` to import all essential types.

// Auth & sessions
pub use crate::{AuthSettings, Session, SessionAuthenticator, TokenClaims};

// Connections
pub use crate::{
    ClientConnection, ConnectionId, ConnectionManager, ConnectionSettings, ConnectionStats,
    ConnectionStatus, ManagerStats,
};

// Server & control surface
pub use crate::{ControlHandler, ControlMessage, GatewayConfig, GatewayServer};

// Transport & errors
pub use crate::{
    AuthError, ConnectionError, GatewayError, GatewayResult, InboundFrame, MessageSink,
    TransportError,
};
