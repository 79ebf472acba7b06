//! Zonecast Gateway - the `WebSocket` edge of the Zonecast event layer.
//!
//! This crate provides:
//! - Token authentication with per-address lockout and a session registry
//! - Per-principal connections with a bounded send queue, health
//!   monitoring, and automatic recovery of degraded transports
//! - A connection manager enforcing one connection per principal and a
//!   global connection limit, doubling as the router's dispatcher
//! - A JSON control surface for subscriptions, introspection, and admin
//!   commands
//! - The listener itself, with an auth handshake deadline
//!
//! # Architecture
//!
//! [`GatewayServer::build`] wires the whole event layer: it constructs
//! the [`SessionAuthenticator`], the subscription manager, the standard
//! filter chain, the [`ConnectionManager`], and the event router, then
//! hands the manager to the router as its dispatcher. `run` binds the
//! listener; each accepted socket gets an auth handshake and then a read
//! loop feeding the [`ControlHandler`]. Outbound traffic never touches
//! the read loop: the router dispatches through the manager onto each
//! connection's send queue.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod auth;
mod backoff;
mod config;
mod connection;
mod control;
mod error;
mod manager;
mod server;
mod transport;

pub use auth::{
    encode_token, encode_unsigned_token, AuthSettings, Session, SessionAuthenticator, TokenClaims,
    TOKEN_PREFIX,
};
pub use config::{
    AuthConfig, ConnectionConfig, GatewayConfig, ListenerConfig, MaintenanceConfig, PrincipalSeed,
    RateLimitConfig, RouterConfig, SubscriptionConfig,
};
pub use connection::{
    ClientConnection, ConnectionId, ConnectionSettings, ConnectionStats, ConnectionStatus,
};
pub use control::{ControlHandler, ControlMessage, SUPPORTED_MESSAGES};
pub use error::{AuthError, ConnectionError, GatewayError, GatewayResult, TransportError};
pub use manager::{ConnectionManager, ManagerStats};
pub use server::GatewayServer;
pub use transport::{
    split, InboundFrame, MessageSink, WsReader, WsSink, WsStream, CLOSE_AUTH_FAILED, CLOSE_ERROR,
    CLOSE_NORMAL, CLOSE_REPLACED, CLOSE_SERVER_FULL,
};
