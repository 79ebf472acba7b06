//! End-to-end connection lifecycle: delivery, replacement, capacity.

use std::sync::Arc;
use zonecast_events::RoutingDecision;
use zonecast_gateway::{GatewayError, MessageSink};
use zonecast_test::prelude::*;

#[tokio::test]
async fn routed_event_reaches_the_connected_client() {
    let harness = GatewayHarness::new();
    let (_alice, _conn, sink) = harness.connect_operator("alice").await;

    let result = harness.route(record_event("example.org")).await;
    assert_eq!(result.decision, RoutingDecision::Routed);
    assert_eq!(result.targets.len(), 1);

    sink.wait_until(|frames| !frames.is_empty()).await;
    let frames = sink.frames_of_type("record_updated");
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["data"]["zone"], "example.org");

    harness.shutdown().await;
}

#[tokio::test]
async fn a_new_connection_replaces_the_old_one() {
    let harness = GatewayHarness::new();
    let (alice, first_conn, first_sink) = harness.connect_operator("alice").await;
    let (second_conn, second_sink) = harness.connect(alice.clone()).await;

    // The old transport got the replacement close code and reason.
    assert_eq!(
        first_sink.close_frame(),
        Some((4000, "Replaced by new connection".to_string()))
    );
    assert!(!first_conn.status().await.accepts_sends());
    assert!(second_conn.status().await.accepts_sends());
    assert_eq!(harness.manager.connection_count().await, 1);

    // Traffic flows only to the new transport.
    let before = first_sink.frames().len();
    harness.route(record_event("example.org")).await;
    second_sink
        .wait_until(|frames| frames.iter().any(|f| f.contains("record_updated")))
        .await;
    assert_eq!(first_sink.frames().len(), before);

    harness.shutdown().await;
}

#[tokio::test]
async fn connections_beyond_the_limit_are_rejected() {
    let harness = GatewayHarness::with_settings(HarnessSettings {
        max_connections: 1,
        ..HarnessSettings::default()
    });
    harness.connect_operator("alice").await;

    let sink = MockSink::new();
    let err = harness
        .manager
        .connect(operator("bob"), Arc::clone(&sink) as Arc<dyn MessageSink>)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::AtCapacity(1)));

    harness.shutdown().await;
}

#[tokio::test]
async fn disconnect_frees_a_slot() {
    let harness = GatewayHarness::with_settings(HarnessSettings {
        max_connections: 1,
        ..HarnessSettings::default()
    });
    let (alice, _conn, _sink) = harness.connect_operator("alice").await;

    assert!(harness.manager.disconnect(alice.id, 1000, "done").await);
    harness.connect_operator("bob").await;
    assert_eq!(harness.manager.connection_count().await, 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn admin_only_events_skip_operators() {
    let harness = GatewayHarness::new();
    let (_alice, _op_conn, op_sink) = harness.connect_operator("alice").await;
    let (_root, _admin_conn, admin_sink) = harness.connect_admin("root").await;

    let result = harness
        .route(event_of(zonecast_core::EventType::UserCreated))
        .await;
    assert_eq!(result.decision, RoutingDecision::Routed);
    assert_eq!(result.targets.len(), 1);

    admin_sink
        .wait_until(|frames| frames.iter().any(|f| f.contains("user_created")))
        .await;
    assert!(op_sink.frames_of_type("user_created").is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn sensitive_payload_fields_are_redacted_for_operators() {
    let harness = GatewayHarness::new();
    let (_alice, _op_conn, op_sink) = harness.connect_operator("alice").await;
    let (_root, _admin_conn, admin_sink) = harness.connect_admin("root").await;

    let event = zonecast_core::Event::new(
        zonecast_core::EventType::SecurityAlert,
        serde_json::json!({ "alert": "bad login", "api_key": "hunter2" }),
    );
    harness.route(event).await;

    op_sink
        .wait_until(|frames| frames.iter().any(|f| f.contains("security_alert")))
        .await;
    admin_sink
        .wait_until(|frames| frames.iter().any(|f| f.contains("security_alert")))
        .await;

    let op_frame = &op_sink.frames_of_type("security_alert")[0];
    assert_eq!(op_frame["data"]["api_key"], "[REDACTED]");
    let admin_frame = &admin_sink.frames_of_type("security_alert")[0];
    assert_eq!(admin_frame["data"]["api_key"], "hunter2");

    harness.shutdown().await;
}

#[tokio::test]
async fn events_with_no_subscribers_are_skipped() {
    let harness = GatewayHarness::new();
    // Operators are not subscribed to maintenance notices by default.
    harness.connect_operator("alice").await;

    let result = harness
        .route(event_of(zonecast_core::EventType::MaintenanceScheduled))
        .await;
    assert_eq!(result.decision, RoutingDecision::Skipped);
    assert!(result.targets.is_empty());

    harness.shutdown().await;
}
