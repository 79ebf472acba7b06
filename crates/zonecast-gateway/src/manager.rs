//! Connection manager.
//!
//! Owns the principal-to-connection map and the gateway's background
//! services. The manager enforces the one-connection-per-principal rule,
//! the global connection limit, and doubles as the router's
//! [`EventDispatcher`]: the router resolves who gets an event, the
//! manager knows how to reach them.

use crate::auth::SessionAuthenticator;
use crate::connection::{ClientConnection, ConnectionSettings, ConnectionStats};
use crate::error::{GatewayError, GatewayResult};
use crate::transport::{MessageSink, CLOSE_NORMAL, CLOSE_REPLACED};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zonecast_core::{EventPriority, EventType, OutboundEventMessage, Principal, PrincipalId};
use zonecast_events::{
    DispatchError, EventDispatcher, EventRouter, RateLimitFilter, SubscriptionManager,
};

/// Aggregate view of the connection layer.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    /// Live connections, including degraded ones
    pub connections: usize,
    /// Configured connection limit
    pub max_connections: usize,
    /// Connections currently passing the liveness predicate
    pub healthy: usize,
    /// Live authenticated sessions
    pub sessions: usize,
    /// Registered subscription profiles
    pub profiles: usize,
    /// Per-connection snapshots
    pub details: Vec<ConnectionStats>,
}

/// Owns all live connections and the gateway's background services.
pub struct ConnectionManager {
    settings: ConnectionSettings,
    max_connections: usize,
    maintenance_interval: Duration,
    connections: Mutex<HashMap<PrincipalId, Arc<ClientConnection>>>,
    subscriptions: Arc<SubscriptionManager>,
    authenticator: Arc<SessionAuthenticator>,
    rate_filter: Arc<RateLimitFilter>,
    router: OnceLock<Arc<EventRouter>>,
    services_started: AtomicBool,
    services: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("max_connections", &self.max_connections)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager.
    ///
    /// The router is wired in afterwards with [`set_router`](Self::set_router)
    /// because the router itself needs the manager as its dispatcher.
    #[must_use]
    pub fn new(
        settings: ConnectionSettings,
        max_connections: usize,
        maintenance_interval: Duration,
        subscriptions: Arc<SubscriptionManager>,
        authenticator: Arc<SessionAuthenticator>,
        rate_filter: Arc<RateLimitFilter>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            settings,
            max_connections,
            maintenance_interval,
            connections: Mutex::new(HashMap::new()),
            subscriptions,
            authenticator,
            rate_filter,
            router: OnceLock::new(),
            services_started: AtomicBool::new(false),
            services: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Wire in the event router. May be called once; later calls are ignored.
    pub fn set_router(&self, router: Arc<EventRouter>) {
        let _ = self.router.set(router);
    }

    /// The wired router, if [`set_router`](Self::set_router) has run.
    #[must_use]
    pub fn router(&self) -> Option<&Arc<EventRouter>> {
        self.router.get()
    }

    /// The subscription manager shared with the router.
    #[must_use]
    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    /// The session authenticator.
    #[must_use]
    pub fn authenticator(&self) -> &Arc<SessionAuthenticator> {
        &self.authenticator
    }

    /// Accept a connection for an authenticated principal.
    ///
    /// A principal holds at most one connection: an existing one is closed
    /// with the replacement close code before the new one is installed.
    /// The principal's subscription profile is created (or kept) and the
    /// background services are started on first use.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::AtCapacity`] when the connection limit is
    /// reached and the principal does not already hold a connection.
    pub async fn connect(
        self: &Arc<Self>,
        principal: Principal,
        sink: Arc<dyn MessageSink>,
    ) -> GatewayResult<Arc<ClientConnection>> {
        // Check, create, and insert under one lock so concurrent connects
        // for the same principal serialize and the capacity check cannot
        // be overshot. The replaced connection is closed after the swap.
        let (connection, replaced) = {
            let mut connections = self.connections.lock().await;
            let already_connected = connections.contains_key(&principal.id);
            if !already_connected && connections.len() >= self.max_connections {
                warn!(
                    principal = %principal,
                    limit = self.max_connections,
                    "connection rejected, at capacity"
                );
                return Err(GatewayError::AtCapacity(self.max_connections));
            }
            self.subscriptions.register(&principal);
            let connection =
                ClientConnection::start(principal.clone(), sink, self.settings.clone());
            let replaced = connections.insert(principal.id, Arc::clone(&connection));
            (connection, replaced)
        };

        if let Some(old) = replaced {
            info!(principal = %principal, "replacing existing connection");
            old.close(CLOSE_REPLACED, "Replaced by new connection").await;
        }

        self.ensure_services();
        self.emit_system_event(
            EventType::ClientConnected,
            serde_json::json!({
                "username": principal.username,
                "connection_id": connection.id(),
            }),
        );

        Ok(connection)
    }

    /// Close and remove a principal's connection.
    ///
    /// Returns `true` if a connection existed. The subscription profile
    /// and session survive the disconnect; profiles expire by TTL and the
    /// session by its own clock.
    pub async fn disconnect(&self, principal: PrincipalId, code: u16, reason: &str) -> bool {
        let Some(connection) = self.connections.lock().await.remove(&principal) else {
            return false;
        };
        let username = connection.principal().username.clone();
        connection.close(code, reason).await;

        self.emit_system_event(
            EventType::ClientDisconnected,
            serde_json::json!({
                "username": username,
                "reason": reason,
            }),
        );
        true
    }

    /// The live connection for a principal, if any.
    pub async fn get(&self, principal: PrincipalId) -> Option<Arc<ClientConnection>> {
        self.connections.lock().await.get(&principal).cloned()
    }

    /// Find a connection by the principal's login name.
    pub async fn get_by_username(&self, username: &str) -> Option<Arc<ClientConnection>> {
        self.connections
            .lock()
            .await
            .values()
            .find(|c| c.principal().username == username)
            .cloned()
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Snapshot the whole connection layer.
    pub async fn stats(&self) -> ManagerStats {
        let connections: Vec<Arc<ClientConnection>> =
            self.connections.lock().await.values().cloned().collect();

        let mut details = Vec::with_capacity(connections.len());
        let mut healthy = 0usize;
        for connection in &connections {
            let stats = connection.stats().await;
            if stats.healthy {
                healthy = healthy.saturating_add(1);
            }
            details.push(stats);
        }

        ManagerStats {
            connections: connections.len(),
            max_connections: self.max_connections,
            healthy,
            sessions: self.authenticator.session_count(),
            profiles: self.subscriptions.profile_count(),
            details,
        }
    }

    /// Queue an event on the router without a source principal.
    ///
    /// Dropped with a warning if the router is not wired yet; connection
    /// lifecycle events are advisory and never block the caller.
    fn emit_system_event(&self, event_type: EventType, data: serde_json::Value) {
        if let Some(router) = self.router.get() {
            if let Err(e) = router.emit(event_type, data, None, EventPriority::Normal) {
                warn!(event_type = %event_type, error = %e, "system event not emitted");
            }
        }
    }

    /// Start the background services if they are not running yet.
    fn ensure_services(self: &Arc<Self>) {
        if self.services_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut services = manager.services.lock().await;

            if let Some(router) = manager.router.get() {
                services.push(tokio::spawn(
                    Arc::clone(router).run_emit_drain(manager.shutdown_tx.subscribe()),
                ));
                services.push(tokio::spawn(
                    Arc::clone(router).run_deferred_drain(manager.shutdown_tx.subscribe()),
                ));
            }
            services.push(tokio::spawn(
                Arc::clone(&manager).run_health_sweep(manager.shutdown_tx.subscribe()),
            ));
            services.push(tokio::spawn(
                Arc::clone(&manager).run_maintenance_sweep(manager.shutdown_tx.subscribe()),
            ));
            info!("background services started");
        });
    }

    /// Health sweep: evict errored connections and refresh expiring
    /// sessions for the principals still connected.
    async fn run_health_sweep(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.settings.health_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => self.sweep_connections().await,
            }
        }
        debug!("health sweep stopped");
    }

    async fn sweep_connections(&self) {
        let connections: Vec<Arc<ClientConnection>> =
            self.connections.lock().await.values().cloned().collect();

        for connection in connections {
            let principal = connection.principal().id;
            if connection.status().await == crate::connection::ConnectionStatus::Error {
                warn!(id = %connection.id(), "removing errored connection");
                self.disconnect(principal, CLOSE_NORMAL, "Connection unhealthy")
                    .await;
                continue;
            }
            if self.authenticator.needs_refresh(principal) {
                match self.authenticator.refresh_session(principal).await {
                    Ok(()) => {
                        if let Some(session) = self.authenticator.session(principal) {
                            let notice = serde_json::json!({
                                "type": "session_refresh",
                                "expires_at": session.expires_at,
                            });
                            if let Err(e) = connection.send_json(&notice).await {
                                debug!(id = %connection.id(), error = %e, "refresh notice not delivered");
                            }
                        }
                    },
                    Err(e) => {
                        info!(id = %connection.id(), error = %e, "session refresh refused, disconnecting");
                        self.disconnect(principal, CLOSE_NORMAL, "Session expired").await;
                    },
                }
            }
        }
    }

    /// Maintenance sweep: expire subscriptions, idle rate-limit windows,
    /// and stale sessions.
    async fn run_maintenance_sweep(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.maintenance_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    let subscriptions = self.subscriptions.sweep_expired();
                    let windows = self.rate_filter.sweep_idle();
                    let sessions = self.authenticator.sweep();
                    if subscriptions > 0 || windows > 0 || sessions > 0 {
                        debug!(subscriptions, windows, sessions, "maintenance sweep");
                    }
                }
            }
        }
        debug!("maintenance sweep stopped");
    }

    /// Close every connection and stop the background services.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        let connections: Vec<Arc<ClientConnection>> = {
            let mut map = self.connections.lock().await;
            map.drain().map(|(_, c)| c).collect()
        };
        info!(count = connections.len(), "closing all connections");
        for connection in connections {
            connection.close(CLOSE_NORMAL, "Server shutting down").await;
        }

        let services: Vec<JoinHandle<()>> = std::mem::take(&mut *self.services.lock().await);
        for service in services {
            service.abort();
        }
    }
}

#[async_trait]
impl EventDispatcher for ConnectionManager {
    async fn connected_principals(&self) -> Vec<Principal> {
        let connections = self.connections.lock().await;
        let mut principals = Vec::with_capacity(connections.len());
        for connection in connections.values() {
            if connection.status().await.accepts_sends() {
                principals.push(connection.principal().clone());
            }
        }
        principals
    }

    async fn dispatch(
        &self,
        principal: PrincipalId,
        message: OutboundEventMessage,
    ) -> Result<(), DispatchError> {
        let Some(connection) = self.get(principal).await else {
            return Err(DispatchError::new(principal.to_string(), "not connected"));
        };
        connection
            .send_event(&message)
            .await
            .map_err(|e| DispatchError::new(principal.to_string(), e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthSettings;
    use crate::error::TransportError;
    use std::sync::Mutex as StdMutex;
    use zonecast_core::identity::InMemoryPrincipalStore;
    use zonecast_events::{FilterChain, RateLimitSettings, RouterSettings, SubscriptionLimits};

    struct NullSink {
        sent: StdMutex<Vec<String>>,
        closed: StdMutex<Option<u16>>,
    }

    impl NullSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
                closed: StdMutex::new(None),
            })
        }

        fn close_code(&self) -> Option<u16> {
            *self.closed.lock().unwrap()
        }
    }

    #[async_trait]
    impl MessageSink for NullSink {
        async fn send_text(&self, text: &str) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn close(&self, code: u16, _reason: &str) -> Result<(), TransportError> {
            *self.closed.lock().unwrap() = Some(code);
            Ok(())
        }
    }

    fn build_manager(max_connections: usize) -> Arc<ConnectionManager> {
        let store = InMemoryPrincipalStore::new().shared();
        let authenticator = Arc::new(SessionAuthenticator::new(AuthSettings::default(), store));
        let subscriptions = Arc::new(SubscriptionManager::new(SubscriptionLimits::default()));
        let rate_filter = Arc::new(RateLimitFilter::new(RateLimitSettings::default()));

        let manager = Arc::new(ConnectionManager::new(
            ConnectionSettings::default(),
            max_connections,
            Duration::from_secs(60),
            Arc::clone(&subscriptions),
            authenticator,
            Arc::clone(&rate_filter),
        ));
        let chain = FilterChain::new().with_filter(rate_filter);
        let router = Arc::new(EventRouter::new(
            subscriptions,
            chain,
            Arc::clone(&manager) as Arc<dyn EventDispatcher>,
            RouterSettings::default(),
        ));
        manager.set_router(router);
        manager
    }

    #[tokio::test]
    async fn second_connection_replaces_the_first() {
        let manager = build_manager(10);
        let principal = Principal::new("alice");

        let first = manager
            .connect(principal.clone(), NullSink::new())
            .await
            .unwrap();
        let second = manager
            .connect(principal.clone(), NullSink::new())
            .await
            .unwrap();

        assert_eq!(manager.connection_count().await, 1);
        assert_eq!(
            first.status().await,
            crate::connection::ConnectionStatus::Disconnected
        );
        assert!(second.status().await.accepts_sends());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_connects_leave_exactly_one_live_connection() {
        let manager = build_manager(10);

        for round in 0..10 {
            let principal = Principal::new(format!("racer-{round}"));
            let sink_a = NullSink::new();
            let sink_b = NullSink::new();

            let task_a = {
                let manager = Arc::clone(&manager);
                let principal = principal.clone();
                let sink = Arc::clone(&sink_a);
                tokio::spawn(async move {
                    manager.connect(principal, sink as Arc<dyn MessageSink>).await
                })
            };
            let task_b = {
                let manager = Arc::clone(&manager);
                let principal = principal.clone();
                let sink = Arc::clone(&sink_b);
                tokio::spawn(async move {
                    manager.connect(principal, sink as Arc<dyn MessageSink>).await
                })
            };
            task_a.await.unwrap().unwrap();
            task_b.await.unwrap().unwrap();

            // One connection survives; the loser's sink got the
            // replacement close.
            let live = manager.get(principal.id).await.unwrap();
            assert!(live.status().await.accepts_sends());
            let replaced = [sink_a.close_code(), sink_b.close_code()]
                .iter()
                .filter(|code| **code == Some(CLOSE_REPLACED))
                .count();
            assert_eq!(replaced, 1, "round {round}");
            manager.disconnect(principal.id, CLOSE_NORMAL, "done").await;
        }

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn connection_limit_is_enforced() {
        let manager = build_manager(2);
        let alice = Principal::new("a");
        manager.connect(alice.clone(), NullSink::new()).await.unwrap();
        manager
            .connect(Principal::new("b"), NullSink::new())
            .await
            .unwrap();

        let err = manager
            .connect(Principal::new("c"), NullSink::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::AtCapacity(2)));

        // A reconnect by an existing principal is not a new slot.
        manager.connect(alice, NullSink::new()).await.unwrap();
        assert_eq!(manager.connection_count().await, 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn dispatch_reaches_the_connected_principal() {
        let manager = build_manager(10);
        let principal = Principal::new("alice");
        let sink = NullSink::new();
        manager
            .connect(principal.clone(), Arc::clone(&sink) as Arc<dyn MessageSink>)
            .await
            .unwrap();

        let event = zonecast_core::Event::new(
            EventType::RecordUpdated,
            serde_json::json!({"zone": "example.org"}),
        );
        let message = OutboundEventMessage::from_event(&event, event.data.clone());
        manager.dispatch(principal.id, message).await.unwrap();

        tokio::time::timeout(Duration::from_secs(3), async {
            while sink.sent.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let err = manager
            .dispatch(PrincipalId::new(), OutboundEventMessage::from_event(&event, event.data.clone()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not connected"));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn disconnect_removes_the_connection_but_keeps_the_profile() {
        let manager = build_manager(10);
        let principal = Principal::new("alice");
        manager
            .connect(principal.clone(), NullSink::new())
            .await
            .unwrap();
        assert_eq!(manager.subscriptions().profile_count(), 1);

        assert!(manager.disconnect(principal.id, 1000, "bye").await);
        assert!(!manager.disconnect(principal.id, 1000, "bye").await);
        assert_eq!(manager.connection_count().await, 0);
        assert_eq!(manager.subscriptions().profile_count(), 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn connected_principals_reflect_live_connections() {
        let manager = build_manager(10);
        let alice = Principal::new("alice");
        let bob = Principal::new("bob");
        manager.connect(alice.clone(), NullSink::new()).await.unwrap();
        manager.connect(bob.clone(), NullSink::new()).await.unwrap();

        let mut names: Vec<String> = manager
            .connected_principals()
            .await
            .into_iter()
            .map(|p| p.username)
            .collect();
        names.sort();
        assert_eq!(names, vec!["alice".to_string(), "bob".to_string()]);

        manager.shutdown().await;
    }
}
