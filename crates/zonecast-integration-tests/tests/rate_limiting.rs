//! Rate limiting across the full routing path.

use zonecast_events::{EventFilter, FilterDecision, RoutingDecision};
use zonecast_test::prelude::*;

#[tokio::test]
async fn security_alerts_are_capped_per_window() {
    let harness = GatewayHarness::new();
    let (_alice, _conn, sink) = harness.connect_operator("alice").await;

    // The per-window limit for security alerts is 5; the rest of the
    // burst is dropped for this principal.
    let mut decisions = Vec::new();
    for _ in 0..11 {
        decisions.push(harness.route(security_event()).await.decision);
    }
    let delivered = decisions
        .iter()
        .filter(|d| **d == RoutingDecision::Routed)
        .count();
    assert_eq!(delivered, 5);

    sink.wait_until(|frames| {
        frames.iter().filter(|f| f.contains("security_alert")).count() >= 5
    })
    .await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(sink.frames_of_type("security_alert").len(), 5);

    harness.shutdown().await;
}

#[tokio::test]
async fn limits_are_per_principal() {
    let harness = GatewayHarness::new();
    let (_alice, _a_conn, a_sink) = harness.connect_operator("alice").await;
    let (_bob, _b_conn, b_sink) = harness.connect_operator("bob").await;

    for _ in 0..7 {
        harness.route(security_event()).await;
    }

    a_sink
        .wait_until(|frames| frames.iter().filter(|f| f.contains("security_alert")).count() >= 5)
        .await;
    b_sink
        .wait_until(|frames| frames.iter().filter(|f| f.contains("security_alert")).count() >= 5)
        .await;

    harness.shutdown().await;
}

#[tokio::test]
async fn administrators_carry_a_multiplied_allowance() {
    let harness = GatewayHarness::new();
    let (_root, _conn, sink) = harness.connect_admin("root").await;

    // Admin limit for security alerts is 5 * 5.
    let mut decisions = Vec::new();
    for _ in 0..30 {
        decisions.push(harness.route(security_event()).await.decision);
    }
    let delivered = decisions
        .iter()
        .filter(|d| **d == RoutingDecision::Routed)
        .count();
    assert_eq!(delivered, 25);
    sink.wait_until(|frames| {
        frames.iter().filter(|f| f.contains("security_alert")).count() >= 25
    })
    .await;

    harness.shutdown().await;
}

#[tokio::test]
async fn the_denial_reason_names_the_limit_and_window() {
    let harness = GatewayHarness::new();
    let alice = operator("alice");

    let mut last = FilterDecision::Allow;
    for _ in 0..6 {
        last = harness
            .rate_filter
            .apply(&security_event(), &alice)
            .await
            .unwrap();
    }
    assert_eq!(
        last,
        FilterDecision::deny("Rate limit exceeded: 5 events per 60 seconds")
    );
}

#[tokio::test]
async fn windows_do_not_bleed_across_event_types() {
    let harness = GatewayHarness::new();
    let (_alice, _conn, sink) = harness.connect_operator("alice").await;

    for _ in 0..6 {
        harness.route(security_event()).await;
    }
    // Security alerts are exhausted, record updates are not.
    let result = harness.route(record_event("example.org")).await;
    assert_eq!(result.decision, RoutingDecision::Routed);
    sink.wait_until(|frames| frames.iter().any(|f| f.contains("record_updated")))
        .await;

    harness.shutdown().await;
}
