//! Client control surface.
//!
//! After the auth handshake every inbound text frame is a JSON control
//! message tagged by `type`. The handler mutates subscriptions, answers
//! introspection queries, and exposes a small admin surface. Responses
//! go back on the same connection's send queue.

use crate::connection::ClientConnection;
use crate::manager::ConnectionManager;
use crate::transport::CLOSE_NORMAL;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};
use zonecast_core::{EventCategory, EventPriority, EventType};

/// Control message types a client may send, in tag order.
pub const SUPPORTED_MESSAGES: &[&str] = &[
    "ping",
    "pong",
    "subscribe_events",
    "unsubscribe_events",
    "subscribe_category",
    "get_subscription_info",
    "get_connection_status",
    "health_check",
    "get_connection_stats",
    "get_router_stats",
    "get_all_connections",
    "disconnect_user",
    "broadcast_admin_message",
    "get_queue_stats",
];

/// One inbound control frame.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Client-initiated liveness probe; answered with a pong frame.
    Ping,
    /// Reply to a server ping.
    Pong,
    /// Add event types to the principal's dynamic subscriptions.
    SubscribeEvents {
        /// Event type names, snake_case
        event_types: Vec<String>,
    },
    /// Remove event types from the principal's dynamic subscriptions.
    UnsubscribeEvents {
        /// Event type names, snake_case
        event_types: Vec<String>,
    },
    /// Subscribe to whole categories.
    SubscribeCategory {
        /// Category names, snake_case
        categories: Vec<String>,
    },
    /// Snapshot the principal's subscription state.
    GetSubscriptionInfo,
    /// The connection's lifecycle state.
    GetConnectionStatus,
    /// Run the liveness predicate for this connection.
    HealthCheck,
    /// Connection-layer counters and per-connection snapshots. Admin only.
    GetConnectionStats,
    /// Router counters and filter stats. Admin only.
    GetRouterStats,
    /// Identity and health of every live connection. Admin only.
    GetAllConnections,
    /// Force-close another principal's connection. Admin only.
    DisconnectUser {
        /// Login name of the principal to disconnect
        username: String,
    },
    /// Emit an admin broadcast event. Admin only.
    BroadcastAdminMessage {
        /// Message body
        message: String,
        /// Event priority name; defaults to `high`
        #[serde(default)]
        priority: Option<String>,
    },
    /// Deferred-queue depth and per-connection send-queue depths. Admin only.
    GetQueueStats,
}

/// Dispatches control messages for established connections.
#[derive(Debug)]
pub struct ControlHandler {
    manager: Arc<ConnectionManager>,
}

impl ControlHandler {
    /// Create a handler over the connection manager.
    #[must_use]
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    /// Handle one raw text frame from a client.
    ///
    /// Returns the response frame to queue, or `None` when the message
    /// needs no reply. Malformed or unknown frames produce an error frame
    /// naming the supported message types.
    pub async fn handle(
        &self,
        connection: &Arc<ClientConnection>,
        raw: &str,
    ) -> Option<serde_json::Value> {
        connection.touch().await;

        let message: ControlMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(e) => {
                debug!(id = %connection.id(), error = %e, "unparseable control frame");
                // A known tag with a bad shape is a validation error; an
                // unknown tag gets the supported-type list.
                if let Some(tag) = known_message_tag(raw) {
                    return Some(json!({
                        "type": "validation_error",
                        "message_type": tag,
                        "error": e.to_string(),
                    }));
                }
                return Some(json!({
                    "type": "error",
                    "error": format!("unrecognized message: {e}"),
                    "supported_types": SUPPORTED_MESSAGES,
                }));
            },
        };

        match message {
            ControlMessage::Ping => Some(json!({
                "type": "pong",
                "timestamp": Utc::now(),
            })),
            ControlMessage::Pong => {
                connection.record_pong().await;
                None
            },
            ControlMessage::SubscribeEvents { event_types } => {
                Some(self.subscribe_events(connection, &event_types))
            },
            ControlMessage::UnsubscribeEvents { event_types } => {
                Some(self.unsubscribe_events(connection, &event_types))
            },
            ControlMessage::SubscribeCategory { categories } => {
                Some(self.subscribe_categories(connection, &categories))
            },
            ControlMessage::GetSubscriptionInfo => {
                let info = self
                    .manager
                    .subscriptions()
                    .subscription_info(connection.principal());
                Some(json!({
                    "type": "subscription_info",
                    "info": info,
                }))
            },
            ControlMessage::GetConnectionStatus => Some(json!({
                "type": "connection_status",
                "status": connection.status().await,
            })),
            ControlMessage::HealthCheck => Some(json!({
                "type": "health_check_result",
                "healthy": connection.is_healthy().await,
                "status": connection.status().await,
            })),
            ControlMessage::GetConnectionStats => {
                if let Some(denied) = self.require_admin(connection) {
                    return Some(denied);
                }
                Some(json!({
                    "type": "connection_stats",
                    "stats": self.manager.stats().await,
                }))
            },
            ControlMessage::GetRouterStats => {
                if let Some(denied) = self.require_admin(connection) {
                    return Some(denied);
                }
                match self.manager.router() {
                    Some(router) => Some(json!({
                        "type": "router_stats",
                        "stats": router.stats().await,
                    })),
                    None => Some(json!({
                        "type": "error",
                        "error": "router not available",
                    })),
                }
            },
            ControlMessage::GetAllConnections => {
                if let Some(denied) = self.require_admin(connection) {
                    return Some(denied);
                }
                let connections: Vec<serde_json::Value> = self
                    .manager
                    .stats()
                    .await
                    .details
                    .into_iter()
                    .map(|stats| {
                        json!({
                            "username": stats.username,
                            "connection_id": stats.id,
                            "status": stats.status,
                            "healthy": stats.healthy,
                        })
                    })
                    .collect();
                Some(json!({
                    "type": "all_connections",
                    "connections": connections,
                }))
            },
            ControlMessage::DisconnectUser { username } => {
                if let Some(denied) = self.require_admin(connection) {
                    return Some(denied);
                }
                Some(self.disconnect_user(connection, &username).await)
            },
            ControlMessage::BroadcastAdminMessage { message, priority } => {
                if let Some(denied) = self.require_admin(connection) {
                    return Some(denied);
                }
                Some(self.broadcast_admin_message(connection, &message, priority.as_deref()))
            },
            ControlMessage::GetQueueStats => {
                if let Some(denied) = self.require_admin(connection) {
                    return Some(denied);
                }
                let deferred_depth = match self.manager.router() {
                    Some(router) => router.deferred_depth().await,
                    None => 0,
                };
                let queues: Vec<serde_json::Value> = self
                    .manager
                    .stats()
                    .await
                    .details
                    .into_iter()
                    .map(|stats| {
                        json!({
                            "username": stats.username,
                            "queue_depth": stats.queue_depth,
                            "queue_capacity": stats.queue_capacity,
                        })
                    })
                    .collect();
                Some(json!({
                    "type": "queue_stats",
                    "deferred_depth": deferred_depth,
                    "connections": queues,
                }))
            },
        }
    }

    fn require_admin(&self, connection: &Arc<ClientConnection>) -> Option<serde_json::Value> {
        if connection.principal().admin {
            None
        } else {
            warn!(
                id = %connection.id(),
                principal = %connection.principal(),
                "admin command refused"
            );
            Some(json!({
                "type": "error",
                "error": "administrator permissions required",
            }))
        }
    }

    fn subscribe_events(
        &self,
        connection: &Arc<ClientConnection>,
        names: &[String],
    ) -> serde_json::Value {
        let (types, mut errors) = parse_names::<EventType>(names);
        match self
            .manager
            .subscriptions()
            .subscribe(connection.principal(), &types)
        {
            Ok(outcome) => {
                errors.extend(outcome.errors);
                json!({
                    "type": "subscription_result",
                    "accepted": outcome.accepted,
                    "errors": errors,
                    "expires_at": outcome.expires_at,
                })
            },
            Err(e) => json!({
                "type": "error",
                "error": e.to_string(),
            }),
        }
    }

    fn unsubscribe_events(
        &self,
        connection: &Arc<ClientConnection>,
        names: &[String],
    ) -> serde_json::Value {
        let (types, mut errors) = parse_names::<EventType>(names);
        let outcome = self
            .manager
            .subscriptions()
            .unsubscribe(connection.principal().id, &types);
        errors.extend(outcome.errors);
        json!({
            "type": "unsubscribe_result",
            "removed": outcome.removed,
            "errors": errors,
        })
    }

    fn subscribe_categories(
        &self,
        connection: &Arc<ClientConnection>,
        names: &[String],
    ) -> serde_json::Value {
        let (categories, mut errors) = parse_names::<EventCategory>(names);
        match self
            .manager
            .subscriptions()
            .subscribe_to_categories(connection.principal(), &categories)
        {
            Ok(outcome) => {
                errors.extend(outcome.errors);
                json!({
                    "type": "category_subscription_result",
                    "accepted": outcome.accepted,
                    "errors": errors,
                    "expires_at": outcome.expires_at,
                })
            },
            Err(e) => json!({
                "type": "error",
                "error": e.to_string(),
            }),
        }
    }

    async fn disconnect_user(
        &self,
        connection: &Arc<ClientConnection>,
        username: &str,
    ) -> serde_json::Value {
        let Some(target) = self.manager.get_by_username(username).await else {
            return json!({
                "type": "error",
                "error": format!("no connection for '{username}'"),
            });
        };
        let target_principal = target.principal().id;
        warn!(
            admin = %connection.principal(),
            target = username,
            "administrator forced disconnect"
        );
        self.manager
            .disconnect(target_principal, CLOSE_NORMAL, "Disconnected by administrator")
            .await;
        json!({
            "type": "disconnect_result",
            "username": username,
            "disconnected": true,
        })
    }

    fn broadcast_admin_message(
        &self,
        connection: &Arc<ClientConnection>,
        message: &str,
        priority: Option<&str>,
    ) -> serde_json::Value {
        let priority = match priority {
            Some(name) => match EventPriority::from_str(name) {
                Ok(priority) => priority,
                Err(e) => {
                    return json!({
                        "type": "error",
                        "error": e.to_string(),
                    });
                },
            },
            None => EventPriority::High,
        };

        let Some(router) = self.manager.router() else {
            return json!({
                "type": "error",
                "error": "router not available",
            });
        };
        let emitted = router.emit(
            EventType::AdminBroadcast,
            json!({
                "message": message,
                "from": connection.principal().username,
            }),
            Some(connection.principal().id),
            priority,
        );
        match emitted {
            Ok(event_id) => json!({
                "type": "broadcast_result",
                "event_id": event_id,
            }),
            Err(e) => json!({
                "type": "error",
                "error": e.to_string(),
            }),
        }
    }
}

/// The frame's `type` tag, when it names a supported message.
fn known_message_tag(raw: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    let tag = value.get("type")?.as_str()?;
    SUPPORTED_MESSAGES
        .contains(&tag)
        .then(|| tag.to_string())
}

/// Parse a list of names, splitting into parsed values and error lines.
fn parse_names<T: FromStr>(names: &[String]) -> (Vec<T>, Vec<String>)
where
    T::Err: std::fmt::Display,
{
    let mut parsed = Vec::with_capacity(names.len());
    let mut errors = Vec::new();
    for name in names {
        match name.parse::<T>() {
            Ok(value) => parsed.push(value),
            Err(e) => errors.push(e.to_string()),
        }
    }
    (parsed, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthSettings, SessionAuthenticator};
    use crate::connection::ConnectionSettings;
    use crate::error::TransportError;
    use crate::transport::MessageSink;
    use async_trait::async_trait;
    use std::time::Duration;
    use zonecast_core::{InMemoryPrincipalStore, Principal};
    use zonecast_events::{
        EventDispatcher, EventRouter, FilterChain, RateLimitFilter, RateLimitSettings,
        RouterSettings, SubscriptionLimits, SubscriptionManager,
    };

    struct NullSink;

    #[async_trait]
    impl MessageSink for NullSink {
        async fn send_text(&self, _text: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&self, _code: u16, _reason: &str) -> Result<(), TransportError> {
            Ok(())
        }
    }

    async fn setup(principal: Principal) -> (ControlHandler, Arc<ClientConnection>, Arc<ConnectionManager>) {
        let store = InMemoryPrincipalStore::new().shared();
        let authenticator = Arc::new(SessionAuthenticator::new(AuthSettings::default(), store));
        let subscriptions = Arc::new(SubscriptionManager::new(SubscriptionLimits::default()));
        let rate_filter = Arc::new(RateLimitFilter::new(RateLimitSettings::default()));
        let manager = Arc::new(ConnectionManager::new(
            ConnectionSettings::default(),
            16,
            Duration::from_secs(60),
            Arc::clone(&subscriptions),
            authenticator,
            Arc::clone(&rate_filter),
        ));
        let router = Arc::new(EventRouter::new(
            subscriptions,
            FilterChain::new().with_filter(rate_filter),
            Arc::clone(&manager) as Arc<dyn EventDispatcher>,
            RouterSettings::default(),
        ));
        manager.set_router(router);

        let connection = manager
            .connect(principal, Arc::new(NullSink))
            .await
            .unwrap();
        (ControlHandler::new(Arc::clone(&manager)), connection, manager)
    }

    #[tokio::test]
    async fn ping_gets_a_pong() {
        let (handler, connection, manager) = setup(Principal::new("alice")).await;
        let response = handler
            .handle(&connection, r#"{"type":"ping"}"#)
            .await
            .unwrap();
        assert_eq!(response["type"], "pong");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn pong_is_recorded_silently() {
        let (handler, connection, manager) = setup(Principal::new("alice")).await;
        assert!(handler
            .handle(&connection, r#"{"type":"pong"}"#)
            .await
            .is_none());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_type_lists_supported_messages() {
        let (handler, connection, manager) = setup(Principal::new("alice")).await;
        let response = handler
            .handle(&connection, r#"{"type":"frobnicate"}"#)
            .await
            .unwrap();
        assert_eq!(response["type"], "error");
        assert!(response["supported_types"]
            .as_array()
            .unwrap()
            .iter()
            .any(|v| v == "subscribe_events"));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn subscribe_accepts_known_types_and_reports_bad_names() {
        let (handler, connection, manager) = setup(Principal::new("alice")).await;
        let response = handler
            .handle(
                &connection,
                r#"{"type":"subscribe_events","event_types":["maintenance_scheduled","no_such_event"]}"#,
            )
            .await
            .unwrap();
        assert_eq!(response["type"], "subscription_result");
        assert_eq!(response["accepted"][0], "maintenance_scheduled");
        assert_eq!(response["errors"].as_array().unwrap().len(), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn admin_commands_refused_for_operators() {
        let (handler, connection, manager) = setup(Principal::new("alice")).await;
        for frame in [
            r#"{"type":"get_connection_stats"}"#,
            r#"{"type":"get_router_stats"}"#,
            r#"{"type":"get_all_connections"}"#,
            r#"{"type":"disconnect_user","username":"bob"}"#,
            r#"{"type":"broadcast_admin_message","message":"hi"}"#,
            r#"{"type":"get_queue_stats"}"#,
        ] {
            let response = handler.handle(&connection, frame).await.unwrap();
            assert_eq!(response["type"], "error");
            assert!(response["error"]
                .as_str()
                .unwrap()
                .contains("administrator"));
        }
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn admin_can_disconnect_a_user() {
        let (handler, admin_conn, manager) =
            setup(Principal::new("root").with_admin()).await;
        manager
            .connect(Principal::new("bob"), Arc::new(NullSink))
            .await
            .unwrap();

        let response = handler
            .handle(&admin_conn, r#"{"type":"disconnect_user","username":"bob"}"#)
            .await
            .unwrap();
        assert_eq!(response["type"], "disconnect_result");
        assert!(manager.get_by_username("bob").await.is_none());

        let response = handler
            .handle(&admin_conn, r#"{"type":"disconnect_user","username":"bob"}"#)
            .await
            .unwrap();
        assert_eq!(response["type"], "error");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn broadcast_validates_priority() {
        let (handler, admin_conn, manager) =
            setup(Principal::new("root").with_admin()).await;

        let response = handler
            .handle(
                &admin_conn,
                r#"{"type":"broadcast_admin_message","message":"maintenance at noon","priority":"critical"}"#,
            )
            .await
            .unwrap();
        assert_eq!(response["type"], "broadcast_result");

        let response = handler
            .handle(
                &admin_conn,
                r#"{"type":"broadcast_admin_message","message":"x","priority":"mega"}"#,
            )
            .await
            .unwrap();
        assert_eq!(response["type"], "error");
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn introspection_queries_answer() {
        let (handler, connection, manager) = setup(Principal::new("alice")).await;

        let response = handler
            .handle(&connection, r#"{"type":"get_subscription_info"}"#)
            .await
            .unwrap();
        assert_eq!(response["type"], "subscription_info");

        let response = handler
            .handle(&connection, r#"{"type":"get_connection_status"}"#)
            .await
            .unwrap();
        assert_eq!(response["status"], "connected");

        let response = handler
            .handle(&connection, r#"{"type":"health_check"}"#)
            .await
            .unwrap();
        assert_eq!(response["healthy"], true);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn admin_introspection_covers_the_whole_layer() {
        let (handler, admin_conn, manager) =
            setup(Principal::new("root").with_admin()).await;
        manager
            .connect(Principal::new("bob"), Arc::new(NullSink))
            .await
            .unwrap();

        let response = handler
            .handle(&admin_conn, r#"{"type":"get_connection_stats"}"#)
            .await
            .unwrap();
        assert_eq!(response["type"], "connection_stats");
        assert_eq!(response["stats"]["connections"], 2);

        let response = handler
            .handle(&admin_conn, r#"{"type":"get_router_stats"}"#)
            .await
            .unwrap();
        assert_eq!(response["type"], "router_stats");

        let response = handler
            .handle(&admin_conn, r#"{"type":"get_all_connections"}"#)
            .await
            .unwrap();
        assert_eq!(response["type"], "all_connections");
        assert_eq!(response["connections"].as_array().unwrap().len(), 2);

        let response = handler
            .handle(&admin_conn, r#"{"type":"get_queue_stats"}"#)
            .await
            .unwrap();
        assert_eq!(response["type"], "queue_stats");
        assert_eq!(response["deferred_depth"], 0);
        assert_eq!(
            response["connections"][0]["queue_capacity"],
            ConnectionSettings::default().send_queue_capacity
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn bad_shape_on_a_known_type_is_a_validation_error() {
        let (handler, connection, manager) = setup(Principal::new("alice")).await;
        let response = handler
            .handle(&connection, r#"{"type":"subscribe_events"}"#)
            .await
            .unwrap();
        assert_eq!(response["type"], "validation_error");
        assert_eq!(response["message_type"], "subscribe_events");
        manager.shutdown().await;
    }
}
