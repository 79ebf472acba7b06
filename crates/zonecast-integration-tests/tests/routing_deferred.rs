//! Load shedding, the deferred queue, and routing rules.

use zonecast_core::EventType;
use zonecast_events::{RouterSettings, RoutingDecision, RoutingRule, RuleAction};
use zonecast_test::prelude::*;

fn shed_settings(capacity: usize) -> HarnessSettings {
    HarnessSettings {
        router: RouterSettings {
            load_shed_threshold: 1,
            deferred_capacity: capacity,
            // Keep the background drain out of the way; tests drain by hand.
            deferred_interval: std::time::Duration::from_secs(600),
        },
        ..HarnessSettings::default()
    }
}

#[tokio::test]
async fn low_priority_events_are_deferred_under_load() {
    let harness = GatewayHarness::with_settings(shed_settings(10));
    let (_a, _ac, a_sink) = harness.connect_operator("alice").await;
    harness.connect_operator("bob").await;

    let result = harness.route(health_event()).await;
    assert_eq!(result.decision, RoutingDecision::Deferred);
    assert!(result.targets.is_empty());
    assert_eq!(harness.router.deferred_depth().await, 1);
    assert!(a_sink.frames_of_type("health_update").is_empty());

    // Draining routes the event without re-deferring it.
    assert_eq!(harness.router.drain_deferred().await, 1);
    a_sink
        .wait_until(|frames| frames.iter().any(|f| f.contains("health_update")))
        .await;
    assert_eq!(harness.router.deferred_depth().await, 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn normal_priority_events_are_not_shed() {
    let harness = GatewayHarness::with_settings(shed_settings(10));
    let (_a, _ac, a_sink) = harness.connect_operator("alice").await;
    harness.connect_operator("bob").await;

    let result = harness.route(record_event("example.org")).await;
    assert_eq!(result.decision, RoutingDecision::Routed);
    a_sink
        .wait_until(|frames| frames.iter().any(|f| f.contains("record_updated")))
        .await;

    harness.shutdown().await;
}

#[tokio::test]
async fn a_full_deferred_queue_falls_through_to_immediate_routing() {
    let harness = GatewayHarness::with_settings(shed_settings(1));
    let (_a, _ac, a_sink) = harness.connect_operator("alice").await;
    harness.connect_operator("bob").await;

    assert_eq!(
        harness.route(health_event()).await.decision,
        RoutingDecision::Deferred
    );
    // The queue is full now; the next low-priority event routes at once.
    let result = harness.route(health_event()).await;
    assert_eq!(result.decision, RoutingDecision::Routed);
    a_sink
        .wait_until(|frames| frames.iter().any(|f| f.contains("health_update")))
        .await;
    assert_eq!(harness.router.deferred_depth().await, 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn below_the_load_threshold_nothing_is_deferred() {
    let harness = GatewayHarness::with_settings(shed_settings(10));
    let (_a, _ac, a_sink) = harness.connect_operator("alice").await;

    // One connection does not exceed the threshold of one.
    let result = harness.route(health_event()).await;
    assert_eq!(result.decision, RoutingDecision::Routed);
    a_sink
        .wait_until(|frames| frames.iter().any(|f| f.contains("health_update")))
        .await;

    harness.shutdown().await;
}

#[tokio::test]
async fn skip_rules_drop_matching_events() {
    let harness = GatewayHarness::new();
    let (_a, _ac, a_sink) = harness.connect_operator("alice").await;

    harness.router.rules().add_rule(
        RoutingRule::new("mute-health", RuleAction::Skip)
            .for_types(vec![EventType::HealthUpdate]),
    );

    let result = harness.route(health_event()).await;
    assert_eq!(result.decision, RoutingDecision::Skipped);

    // Other types are untouched.
    harness.route(record_event("example.org")).await;
    a_sink
        .wait_until(|frames| frames.iter().any(|f| f.contains("record_updated")))
        .await;
    assert!(a_sink.frames_of_type("health_update").is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn admin_only_rules_narrow_the_audience() {
    let harness = GatewayHarness::new();
    let (_a, _ac, op_sink) = harness.connect_operator("alice").await;
    let (_r, _rc, admin_sink) = harness.connect_admin("root").await;

    harness.router.rules().add_rule(
        RoutingRule::new("alerts-to-admins", RuleAction::AdminOnly)
            .for_types(vec![EventType::SecurityAlert]),
    );

    let result = harness.route(security_event()).await;
    assert_eq!(result.decision, RoutingDecision::Routed);
    assert_eq!(result.targets.len(), 1);

    admin_sink
        .wait_until(|frames| frames.iter().any(|f| f.contains("security_alert")))
        .await;
    assert!(op_sink.frames_of_type("security_alert").is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn emitted_events_flow_through_the_background_drain() {
    let harness = GatewayHarness::new();
    let (_a, _ac, a_sink) = harness.connect_operator("alice").await;

    // emit() queues and returns; the drain task does the routing.
    harness
        .router
        .emit(
            EventType::RecordUpdated,
            serde_json::json!({"zone": "example.net"}),
            None,
            zonecast_core::EventPriority::Normal,
        )
        .unwrap();

    a_sink
        .wait_until(|frames| frames.iter().any(|f| f.contains("example.net")))
        .await;
    let stats = harness.router.stats().await;
    assert!(stats.emitted >= 1);
    assert!(stats.routed >= 1);

    harness.shutdown().await;
}
