//! The `WebSocket` listener.
//!
//! Accepts sockets, runs the auth handshake, and drives each client's
//! read loop. Everything stateful lives in the [`ConnectionManager`];
//! the server owns only the accept loop and the per-socket tasks.

use crate::auth::{AuthSettings, SessionAuthenticator};
use crate::config::GatewayConfig;
use crate::connection::ClientConnection;
use crate::control::ControlHandler;
use crate::error::{GatewayError, GatewayResult};
use crate::manager::ConnectionManager;
use crate::transport::{
    split, InboundFrame, MessageSink, WsReader, WsSink, CLOSE_AUTH_FAILED, CLOSE_NORMAL,
    CLOSE_SERVER_FULL,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};
use zonecast_core::PrincipalStore;
use zonecast_events::{
    EventDispatcher, EventRouter, FilterChain, RateLimitFilter, SubscriptionManager,
};

/// The first frame a client must send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HandshakeMessage {
    Authenticate { token: String },
}

/// The `WebSocket` gateway: listener plus wired-up event layer.
pub struct GatewayServer {
    bind_addr: String,
    handshake_timeout: Duration,
    manager: Arc<ConnectionManager>,
    router: Arc<EventRouter>,
    control: Arc<ControlHandler>,
}

impl std::fmt::Debug for GatewayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayServer")
            .field("bind_addr", &self.bind_addr)
            .finish_non_exhaustive()
    }
}

impl GatewayServer {
    /// Wire the full event layer from configuration and a principal store.
    ///
    /// # Errors
    ///
    /// Returns an error when the auth configuration is invalid (for
    /// example a malformed verifying key).
    pub fn build(
        config: &GatewayConfig,
        store: Arc<dyn PrincipalStore>,
    ) -> GatewayResult<Self> {
        let auth_settings = AuthSettings::from_config(&config.auth)?;
        let authenticator = Arc::new(SessionAuthenticator::new(auth_settings, store));
        let subscriptions = Arc::new(SubscriptionManager::new(config.subscriptions.to_limits()));
        let rate_filter = Arc::new(RateLimitFilter::new(config.rate_limit.to_settings()));
        let chain = FilterChain::standard_with(Arc::clone(&rate_filter));

        let manager = Arc::new(ConnectionManager::new(
            config.connection.to_settings(),
            config.listener.max_connections,
            config.maintenance.sweep_interval(),
            Arc::clone(&subscriptions),
            authenticator,
            rate_filter,
        ));
        let router = Arc::new(EventRouter::new(
            subscriptions,
            chain,
            Arc::clone(&manager) as Arc<dyn EventDispatcher>,
            config.router.to_settings(),
        ));
        manager.set_router(Arc::clone(&router));

        Ok(Self {
            bind_addr: config.listener.bind_addr.clone(),
            handshake_timeout: config.listener.handshake_timeout(),
            control: Arc::new(ControlHandler::new(Arc::clone(&manager))),
            manager,
            router,
        })
    }

    /// The connection manager.
    #[must_use]
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// The event router, for emitting application events.
    #[must_use]
    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    /// Bind the listener and serve until the shutdown signal fires.
    ///
    /// # Errors
    ///
    /// Returns an error when the listener cannot bind.
    pub async fn run(
        self: Arc<Self>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> GatewayResult<()> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        self.run_with_listener(listener, shutdown_rx).await
    }

    /// Serve on an already-bound listener until the shutdown signal fires.
    ///
    /// # Errors
    ///
    /// Returns an error when the listener's local address cannot be read.
    pub async fn run_with_listener(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> GatewayResult<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "gateway listening");

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                server.serve_socket(stream, peer).await;
                            });
                        },
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        },
                    }
                }
            }
        }

        info!("gateway shutting down");
        self.manager.shutdown().await;
        Ok(())
    }

    /// Drive one socket: `WebSocket` upgrade, auth handshake, read loop.
    async fn serve_socket(&self, stream: TcpStream, peer: SocketAddr) {
        let ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!(peer = %peer, error = %e, "websocket upgrade failed");
                return;
            },
        };
        let (sink, mut reader) = split(ws);
        let sink = Arc::new(sink);

        let connection = match self.handshake(&sink, &mut reader, peer).await {
            Ok(connection) => connection,
            Err(e) => {
                debug!(peer = %peer, error = %e, "handshake failed");
                return;
            },
        };

        self.read_loop(&connection, &mut reader).await;
    }

    /// Run the auth handshake within the handshake timeout.
    async fn handshake(
        &self,
        sink: &Arc<WsSink>,
        reader: &mut WsReader,
        peer: SocketAddr,
    ) -> GatewayResult<Arc<ClientConnection>> {
        let first = tokio::time::timeout(self.handshake_timeout, reader.next_frame()).await;
        let frame = match first {
            Ok(Ok(InboundFrame::Text(text))) => text,
            Ok(Ok(InboundFrame::Closed(_))) => {
                return Err(GatewayError::Connection(
                    crate::error::ConnectionError::NotActive,
                ));
            },
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                let _ = sink.close(CLOSE_AUTH_FAILED, "Authentication timeout").await;
                return Err(GatewayError::Auth(crate::error::AuthError::MalformedToken));
            },
        };

        let token = match serde_json::from_str::<HandshakeMessage>(&frame) {
            Ok(HandshakeMessage::Authenticate { token }) => token,
            Err(_) => {
                let _ = sink
                    .send_text(
                        &json!({
                            "type": "auth_error",
                            "error": "expected an authenticate message",
                        })
                        .to_string(),
                    )
                    .await;
                let _ = sink.close(CLOSE_AUTH_FAILED, "Authentication required").await;
                return Err(GatewayError::Auth(crate::error::AuthError::MalformedToken));
            },
        };

        let principal = match self
            .manager
            .authenticator()
            .authenticate(&token, &peer.ip().to_string())
            .await
        {
            Ok(principal) => principal,
            Err(e) => {
                let _ = sink
                    .send_text(
                        &json!({
                            "type": "auth_error",
                            "error": e.to_string(),
                        })
                        .to_string(),
                    )
                    .await;
                let _ = sink.close(CLOSE_AUTH_FAILED, "Authentication failed").await;
                return Err(e.into());
            },
        };

        let connection = match self
            .manager
            .connect(principal.clone(), Arc::clone(sink) as Arc<dyn MessageSink>)
            .await
        {
            Ok(connection) => connection,
            Err(e) => {
                if matches!(e, GatewayError::AtCapacity(_)) {
                    let _ = sink.close(CLOSE_SERVER_FULL, "Server at capacity").await;
                }
                return Err(e);
            },
        };

        let welcome = json!({
            "type": "connected",
            "connection_id": connection.id(),
            "username": principal.username,
            "admin": principal.admin,
        });
        connection.send_json(&welcome).await?;
        Ok(connection)
    }

    /// Pump inbound frames through the control handler until the peer
    /// disconnects.
    async fn read_loop(&self, connection: &Arc<ClientConnection>, reader: &mut WsReader) {
        let principal = connection.principal().id;
        loop {
            match reader.next_frame().await {
                Ok(InboundFrame::Text(text)) => {
                    if let Some(response) = self.control.handle(connection, &text).await {
                        if let Err(e) = connection.send_json(&response).await {
                            debug!(id = %connection.id(), error = %e, "response not delivered");
                            break;
                        }
                    }
                },
                Ok(InboundFrame::Closed(code)) => {
                    debug!(id = %connection.id(), code, "client closed");
                    break;
                },
                Err(e) => {
                    debug!(id = %connection.id(), error = %e, "read failed");
                    break;
                },
            }
        }
        self.manager
            .disconnect(principal, CLOSE_NORMAL, "Client disconnected")
            .await;
    }
}
