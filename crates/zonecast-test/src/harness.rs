//! A pre-wired gateway for integration tests.

use crate::mocks::MockSink;
use std::sync::Arc;
use std::time::Duration;
use zonecast_core::{InMemoryPrincipalStore, Principal, PrincipalStore};
use zonecast_events::{
    EventDispatcher, EventRouter, FilterChain, RateLimitFilter, RateLimitSettings, RouterSettings,
    RoutingResult, SubscriptionLimits, SubscriptionManager,
};
use zonecast_gateway::{
    AuthSettings, ClientConnection, ConnectionManager, ConnectionSettings, ControlHandler,
    SessionAuthenticator,
};

/// Everything the gateway wires at startup, minus the listener.
///
/// Connections are backed by [`MockSink`]s, so tests drive the event
/// layer end to end without sockets: connect principals, emit or route
/// events, and assert on the frames each sink received.
pub struct GatewayHarness {
    /// The principal store backing the authenticator.
    pub store: Arc<InMemoryPrincipalStore>,
    /// The authenticator.
    pub authenticator: Arc<SessionAuthenticator>,
    /// The subscription manager.
    pub subscriptions: Arc<SubscriptionManager>,
    /// The shared rate-limit filter.
    pub rate_filter: Arc<RateLimitFilter>,
    /// The connection manager.
    pub manager: Arc<ConnectionManager>,
    /// The event router.
    pub router: Arc<EventRouter>,
    /// The control surface.
    pub control: ControlHandler,
}

/// Tunables for building a [`GatewayHarness`].
pub struct HarnessSettings {
    /// Per-connection settings.
    pub connection: ConnectionSettings,
    /// Connection limit.
    pub max_connections: usize,
    /// Router settings.
    pub router: RouterSettings,
    /// Rate limit settings.
    pub rate_limit: RateLimitSettings,
    /// Subscription quotas.
    pub limits: SubscriptionLimits,
    /// Auth settings.
    pub auth: AuthSettings,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            connection: crate::fixtures::fast_connection_settings(),
            max_connections: 64,
            router: RouterSettings::default(),
            rate_limit: RateLimitSettings::default(),
            limits: SubscriptionLimits::default(),
            auth: AuthSettings::default(),
        }
    }
}

impl GatewayHarness {
    /// Build a harness with fast timers and default quotas.
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(HarnessSettings::default())
    }

    /// Build a harness with explicit settings.
    #[must_use]
    pub fn with_settings(settings: HarnessSettings) -> Self {
        let store = InMemoryPrincipalStore::new().shared();
        let authenticator = Arc::new(SessionAuthenticator::new(
            settings.auth,
            Arc::clone(&store) as Arc<dyn PrincipalStore>,
        ));
        let subscriptions = Arc::new(SubscriptionManager::new(settings.limits));
        let rate_filter = Arc::new(RateLimitFilter::new(settings.rate_limit));

        let manager = Arc::new(ConnectionManager::new(
            settings.connection,
            settings.max_connections,
            Duration::from_secs(60),
            Arc::clone(&subscriptions),
            Arc::clone(&authenticator),
            Arc::clone(&rate_filter),
        ));
        let router = Arc::new(EventRouter::new(
            Arc::clone(&subscriptions),
            FilterChain::standard_with(Arc::clone(&rate_filter)),
            Arc::clone(&manager) as Arc<dyn EventDispatcher>,
            settings.router,
        ));
        manager.set_router(Arc::clone(&router));

        Self {
            store,
            authenticator,
            subscriptions,
            rate_filter,
            control: ControlHandler::new(Arc::clone(&manager)),
            manager,
            router,
        }
    }

    /// Connect a principal over a fresh mock sink.
    ///
    /// # Panics
    ///
    /// Panics when the manager refuses the connection.
    pub async fn connect(&self, principal: Principal) -> (Arc<ClientConnection>, Arc<MockSink>) {
        let sink = MockSink::new();
        let connection = self
            .manager
            .connect(principal, Arc::clone(&sink) as Arc<dyn zonecast_gateway::MessageSink>)
            .await
            .unwrap_or_else(|e| panic!("connect failed: {e}"));
        (connection, sink)
    }

    /// Register and connect a fresh operator.
    pub async fn connect_operator(
        &self,
        username: &str,
    ) -> (Principal, Arc<ClientConnection>, Arc<MockSink>) {
        let principal = crate::fixtures::operator(username);
        let (connection, sink) = self.connect(principal.clone()).await;
        (principal, connection, sink)
    }

    /// Register and connect a fresh administrator.
    pub async fn connect_admin(
        &self,
        username: &str,
    ) -> (Principal, Arc<ClientConnection>, Arc<MockSink>) {
        let principal = crate::fixtures::admin(username);
        let (connection, sink) = self.connect(principal.clone()).await;
        (principal, connection, sink)
    }

    /// Route one event synchronously against the live connections.
    ///
    /// Bypasses the emit queue so tests see the routing outcome directly.
    pub async fn route(&self, event: zonecast_core::Event) -> RoutingResult {
        self.router.route_event(event).await
    }

    /// Shut everything down.
    pub async fn shutdown(self) {
        self.manager.shutdown().await;
    }
}

impl Default for GatewayHarness {
    fn default() -> Self {
        Self::new()
    }
}
