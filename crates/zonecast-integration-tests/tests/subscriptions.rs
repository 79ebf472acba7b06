//! Subscription management through the control surface.

use zonecast_core::EventType;
use zonecast_events::{RoutingDecision, SubscriptionLimits};
use zonecast_test::prelude::*;

#[tokio::test]
async fn subscribing_widens_the_delivered_set() {
    let harness = GatewayHarness::new();
    let (_alice, conn, sink) = harness.connect_operator("alice").await;

    // Not delivered by default.
    let result = harness.route(event_of(EventType::MaintenanceScheduled)).await;
    assert_eq!(result.decision, RoutingDecision::Skipped);

    let response = harness
        .control
        .handle(
            &conn,
            r#"{"type":"subscribe_events","event_types":["maintenance_scheduled"]}"#,
        )
        .await
        .unwrap();
    assert_eq!(response["type"], "subscription_result");
    assert_eq!(response["accepted"][0], "maintenance_scheduled");
    assert!(response["expires_at"].is_string());

    let result = harness.route(event_of(EventType::MaintenanceScheduled)).await;
    assert_eq!(result.decision, RoutingDecision::Routed);
    sink.wait_until(|frames| frames.iter().any(|f| f.contains("maintenance_scheduled")))
        .await;

    harness.shutdown().await;
}

#[tokio::test]
async fn unsubscribe_narrows_the_set_but_keeps_role_defaults() {
    let harness = GatewayHarness::new();
    let (alice, conn, _sink) = harness.connect_operator("alice").await;

    harness
        .control
        .handle(
            &conn,
            r#"{"type":"subscribe_events","event_types":["maintenance_scheduled"]}"#,
        )
        .await
        .unwrap();

    let response = harness
        .control
        .handle(
            &conn,
            r#"{"type":"unsubscribe_events","event_types":["maintenance_scheduled"]}"#,
        )
        .await
        .unwrap();
    assert_eq!(response["type"], "unsubscribe_result");
    assert_eq!(response["removed"][0], "maintenance_scheduled");

    assert!(!harness
        .subscriptions
        .is_subscribed(alice.id, &event_of(EventType::MaintenanceScheduled)));
    // Role defaults are not dynamic subscriptions and cannot be removed.
    assert!(harness
        .subscriptions
        .is_subscribed(alice.id, &record_event("example.org")));

    harness.shutdown().await;
}

#[tokio::test]
async fn operators_cannot_subscribe_to_admin_only_types() {
    let harness = GatewayHarness::new();
    let (_alice, conn, _sink) = harness.connect_operator("alice").await;

    let response = harness
        .control
        .handle(
            &conn,
            r#"{"type":"subscribe_events","event_types":["user_created"]}"#,
        )
        .await
        .unwrap();
    assert_eq!(response["type"], "subscription_result");
    assert!(response["accepted"].as_array().unwrap().is_empty());
    assert!(response["errors"][0]
        .as_str()
        .unwrap()
        .contains("not permitted"));

    harness.shutdown().await;
}

#[tokio::test]
async fn category_subscription_covers_member_types() {
    let harness = GatewayHarness::new();
    let (_root, conn, sink) = harness.connect_admin("root").await;
    let (alice, op_conn, _op_sink) = harness.connect_operator("alice").await;

    // The user category is restricted to administrators.
    let refused = harness
        .control
        .handle(
            &op_conn,
            r#"{"type":"subscribe_category","categories":["user"]}"#,
        )
        .await
        .unwrap();
    assert!(refused["errors"][0]
        .as_str()
        .unwrap()
        .contains("restricted to administrators"));

    let response = harness
        .control
        .handle(&conn, r#"{"type":"subscribe_category","categories":["system"]}"#)
        .await
        .unwrap();
    assert_eq!(response["type"], "category_subscription_result");
    assert_eq!(response["accepted"][0], "system");

    harness.route(event_of(EventType::ConfigReloaded)).await;
    sink.wait_until(|frames| frames.iter().any(|f| f.contains("config_reloaded")))
        .await;
    assert!(!harness
        .subscriptions
        .is_subscribed(alice.id, &event_of(EventType::ConfigReloaded)));

    harness.shutdown().await;
}

#[tokio::test]
async fn quota_exhaustion_is_reported() {
    let harness = GatewayHarness::with_settings(HarnessSettings {
        limits: SubscriptionLimits {
            max_types: 1,
            ..SubscriptionLimits::default()
        },
        ..HarnessSettings::default()
    });
    let (_alice, conn, _sink) = harness.connect_operator("alice").await;

    let response = harness
        .control
        .handle(
            &conn,
            r#"{"type":"subscribe_events","event_types":["maintenance_scheduled","config_reloaded"]}"#,
        )
        .await
        .unwrap();
    assert_eq!(response["accepted"].as_array().unwrap().len(), 1);
    assert!(response["errors"][0]
        .as_str()
        .unwrap()
        .contains("subscription limit reached"));

    // The quota is now exhausted outright.
    let response = harness
        .control
        .handle(
            &conn,
            r#"{"type":"subscribe_events","event_types":["client_connected"]}"#,
        )
        .await
        .unwrap();
    assert_eq!(response["type"], "error");

    harness.shutdown().await;
}

#[tokio::test]
async fn subscription_info_reflects_state() {
    let harness = GatewayHarness::new();
    let (_alice, conn, _sink) = harness.connect_operator("alice").await;

    harness
        .control
        .handle(
            &conn,
            r#"{"type":"subscribe_events","event_types":["maintenance_scheduled"]}"#,
        )
        .await
        .unwrap();

    let response = harness
        .control
        .handle(&conn, r#"{"type":"get_subscription_info"}"#)
        .await
        .unwrap();
    assert_eq!(response["type"], "subscription_info");
    let info = &response["info"];
    assert_eq!(info["subscriptions"].as_array().unwrap().len(), 1);
    assert!(info["default_types"]
        .as_array()
        .unwrap()
        .iter()
        .any(|v| v == "record_updated"));

    harness.shutdown().await;
}

#[tokio::test]
async fn expired_subscriptions_are_swept() {
    let harness = GatewayHarness::with_settings(HarnessSettings {
        limits: SubscriptionLimits {
            ttl: chrono::Duration::milliseconds(10),
            ..SubscriptionLimits::default()
        },
        ..HarnessSettings::default()
    });
    let (alice, conn, _sink) = harness.connect_operator("alice").await;

    harness
        .control
        .handle(
            &conn,
            r#"{"type":"subscribe_events","event_types":["maintenance_scheduled"]}"#,
        )
        .await
        .unwrap();
    assert!(harness
        .subscriptions
        .is_subscribed(alice.id, &event_of(EventType::MaintenanceScheduled)));

    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    // Expired subscriptions stop matching even before the sweep runs.
    assert!(!harness
        .subscriptions
        .is_subscribed(alice.id, &event_of(EventType::MaintenanceScheduled)));
    assert_eq!(harness.subscriptions.sweep_expired(), 1);

    harness.shutdown().await;
}
