//! Event routing.
//!
//! The router turns an emitted [`Event`] into per-principal deliveries:
//! it resolves subscribed principals, applies custom routing rules, runs
//! the filter chain per candidate, and hands the surviving payloads to an
//! [`EventDispatcher`]. Low-priority events are deferred to a bounded
//! queue when many principals are connected; a background task drains the
//! queue later without re-deferring.

use crate::error::{DispatchError, RouterError, RouterResult};
use crate::filter::{FilterChain, FilterStats};
use crate::rules::{CandidateRestriction, RuleContext, RuleDirective, RuleEngine};
use crate::subscription::SubscriptionManager;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, trace, warn};
use zonecast_core::{
    Event, EventId, EventPriority, EventType, OutboundEventMessage, Principal, PrincipalId,
};

/// Delivery seam between the router and the connection layer.
///
/// The connection manager implements this; tests substitute a mock.
#[async_trait]
pub trait EventDispatcher: Send + Sync {
    /// Principals with a live connection, with their account records.
    async fn connected_principals(&self) -> Vec<Principal>;

    /// Deliver one frame to one principal.
    async fn dispatch(
        &self,
        principal: PrincipalId,
        message: OutboundEventMessage,
    ) -> Result<(), DispatchError>;
}

/// Tunables for the router.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// Maximum events held in the deferred queue
    pub deferred_capacity: usize,
    /// Low-priority events are deferred once more than this many
    /// principals are connected
    pub load_shed_threshold: usize,
    /// How often the background task drains the deferred queue
    pub deferred_interval: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            deferred_capacity: 1000,
            load_shed_threshold: 100,
            deferred_interval: Duration::from_secs(5),
        }
    }
}

/// How the router resolved one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingDecision {
    /// Delivered to at least one principal
    Routed,
    /// Dropped without delivery
    Skipped,
    /// Queued for later processing
    Deferred,
    /// Every delivery attempt failed
    Failed,
}

/// The outcome of routing one event.
#[derive(Debug, Clone)]
pub struct RoutingResult {
    /// The routed event
    pub event_id: EventId,
    /// How the event was resolved
    pub decision: RoutingDecision,
    /// Why it was skipped, deferred, or failed
    pub reason: Option<String>,
    /// Principals the event was delivered to
    pub targets: Vec<PrincipalId>,
    /// Per-principal payloads after filtering
    pub payloads: HashMap<PrincipalId, serde_json::Value>,
    /// Connected principals considered before narrowing
    pub candidates: usize,
    /// Time spent routing
    pub elapsed: Duration,
}

impl RoutingResult {
    fn resolved(
        event_id: EventId,
        decision: RoutingDecision,
        reason: impl Into<String>,
        candidates: usize,
        started: Instant,
    ) -> Self {
        Self {
            event_id,
            decision,
            reason: Some(reason.into()),
            targets: Vec::new(),
            payloads: HashMap::new(),
            candidates,
            elapsed: started.elapsed(),
        }
    }

    /// Delivered targets as a fraction of considered candidates.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fanout_efficiency(&self) -> f64 {
        if self.candidates == 0 {
            return 0.0;
        }
        self.targets.len() as f64 / self.candidates as f64
    }
}

#[derive(Debug, Default)]
struct RouterCounters {
    emitted: AtomicU64,
    routed: AtomicU64,
    skipped: AtomicU64,
    deferred: AtomicU64,
    failed: AtomicU64,
    deliveries: AtomicU64,
    route_time_us: AtomicU64,
    route_count: AtomicU64,
}

/// A point-in-time snapshot of router activity.
#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    /// Events accepted by [`EventRouter::emit`]
    pub emitted: u64,
    /// Events delivered to at least one principal
    pub routed: u64,
    /// Events dropped without delivery
    pub skipped: u64,
    /// Events pushed to the deferred queue
    pub deferred: u64,
    /// Events whose every delivery failed
    pub failed: u64,
    /// Individual frames handed to the dispatcher
    pub deliveries: u64,
    /// Mean routing time in microseconds
    pub avg_route_time_us: u64,
    /// Events currently waiting in the deferred queue
    pub deferred_depth: usize,
    /// Per-filter counters from the chain
    pub filters: Vec<FilterStats>,
    /// Installed routing rules, in evaluation order
    pub rules: Vec<String>,
}

/// Routes emitted events to connected, subscribed, permitted principals.
pub struct EventRouter {
    subscriptions: Arc<SubscriptionManager>,
    chain: FilterChain,
    rules: RuleEngine,
    dispatcher: Arc<dyn EventDispatcher>,
    settings: RouterSettings,
    emit_tx: mpsc::UnboundedSender<Event>,
    emit_rx: Mutex<mpsc::UnboundedReceiver<Event>>,
    deferred: Mutex<VecDeque<Event>>,
    counters: RouterCounters,
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("settings", &self.settings)
            .field("chain", &self.chain)
            .finish_non_exhaustive()
    }
}

impl EventRouter {
    /// Create a router over a subscription manager, a filter chain, and a
    /// dispatcher.
    #[must_use]
    pub fn new(
        subscriptions: Arc<SubscriptionManager>,
        chain: FilterChain,
        dispatcher: Arc<dyn EventDispatcher>,
        settings: RouterSettings,
    ) -> Self {
        let (emit_tx, emit_rx) = mpsc::unbounded_channel();
        Self {
            subscriptions,
            chain,
            rules: RuleEngine::new(),
            dispatcher,
            settings,
            emit_tx,
            emit_rx: Mutex::new(emit_rx),
            deferred: Mutex::new(VecDeque::new()),
            counters: RouterCounters::default(),
        }
    }

    /// The rule engine, for runtime rule management.
    #[must_use]
    pub fn rules(&self) -> &RuleEngine {
        &self.rules
    }

    /// Queue an event for routing and return its id immediately.
    ///
    /// The event is processed asynchronously by the drain task; emitters
    /// never wait on fan-out.
    pub fn emit(
        &self,
        event_type: EventType,
        data: serde_json::Value,
        source: Option<PrincipalId>,
        priority: EventPriority,
    ) -> RouterResult<EventId> {
        let mut event = Event::new(event_type, data).with_priority(priority);
        if let Some(source) = source {
            event = event.with_source(source);
        }
        self.emit_event(event)
    }

    /// Queue a pre-built event for routing.
    pub fn emit_event(&self, event: Event) -> RouterResult<EventId> {
        let id = event.id;
        self.counters.emitted.fetch_add(1, Ordering::Relaxed);
        self.emit_tx.send(event).map_err(|_| RouterError::Closed)?;
        trace!(event_id = %id, "event emitted");
        Ok(id)
    }

    /// Route one event to the currently connected principals.
    pub async fn route_event(&self, event: Event) -> RoutingResult {
        let available = self.dispatcher.connected_principals().await;
        self.route(event, &available).await
    }

    /// Route one event against an explicit set of connected principals.
    pub async fn route(&self, event: Event, available: &[Principal]) -> RoutingResult {
        let started = Instant::now();

        // Load shedding: under high connection load, low-priority events
        // wait in the deferred queue. A full queue falls through to
        // immediate processing.
        if event.priority == EventPriority::Low && available.len() > self.settings.load_shed_threshold
        {
            match self.try_defer(event).await {
                Ok(id) => {
                    let result = RoutingResult::resolved(
                        id,
                        RoutingDecision::Deferred,
                        "low priority deferred under load",
                        available.len(),
                        started,
                    );
                    self.record(&result);
                    return result;
                },
                Err(event) => {
                    debug!(event_id = %event.id, "deferred queue full, routing immediately");
                    return self.process(event, available, started, false).await;
                },
            }
        }

        self.process(event, available, started, true).await
    }

    /// Rule evaluation, candidate resolution, filtering, and dispatch.
    ///
    /// `defer_allowed` is false on the deferred-drain path so a defer rule
    /// cannot cycle an event through the queue forever.
    async fn process(
        &self,
        event: Event,
        available: &[Principal],
        started: Instant,
        defer_allowed: bool,
    ) -> RoutingResult {
        let candidates = available.len();
        let ctx = RuleContext {
            connected: candidates,
            now: chrono::Utc::now(),
        };

        let evaluation = self.rules.evaluate(&event, &ctx);
        let event = evaluation.event;
        match evaluation.directive {
            RuleDirective::Proceed => {},
            RuleDirective::Skip { rule } => {
                let result = RoutingResult::resolved(
                    event.id,
                    RoutingDecision::Skipped,
                    format!("skipped by rule {rule}"),
                    candidates,
                    started,
                );
                self.record(&result);
                return result;
            },
            RuleDirective::Defer { rule } => {
                if defer_allowed {
                    match self.try_defer(event).await {
                        Ok(id) => {
                            let result = RoutingResult::resolved(
                                id,
                                RoutingDecision::Deferred,
                                format!("deferred by rule {rule}"),
                                candidates,
                                started,
                            );
                            self.record(&result);
                            return result;
                        },
                        Err(returned) => {
                            debug!(event_id = %returned.id, rule, "deferred queue full, routing immediately");
                            return self
                                .filter_and_dispatch(returned, available, evaluation.restrictions, started)
                                .await;
                        },
                    }
                }
            },
        }

        self.filter_and_dispatch(event, available, evaluation.restrictions, started)
            .await
    }

    async fn filter_and_dispatch(
        &self,
        event: Event,
        available: &[Principal],
        restrictions: Vec<CandidateRestriction>,
        started: Instant,
    ) -> RoutingResult {
        let candidates = available.len();

        let subscribed: Vec<&Principal> = available
            .iter()
            .filter(|p| restrictions.iter().all(|r| r.permits(p)))
            .filter(|p| self.subscriptions.is_subscribed(p.id, &event))
            .collect();

        if subscribed.is_empty() {
            let result = RoutingResult::resolved(
                event.id,
                RoutingDecision::Skipped,
                "no connected subscribers",
                candidates,
                started,
            );
            self.record(&result);
            return result;
        }

        let mut payloads: HashMap<PrincipalId, serde_json::Value> = HashMap::new();
        for principal in &subscribed {
            let verdict = self.chain.filter(&event, principal).await;
            if verdict.deliver {
                payloads.insert(principal.id, verdict.payload);
            } else {
                trace!(
                    event_id = %event.id,
                    principal = %principal.id,
                    reason = verdict.reason.as_deref().unwrap_or(""),
                    "event filtered out"
                );
            }
        }

        if payloads.is_empty() {
            let result = RoutingResult::resolved(
                event.id,
                RoutingDecision::Skipped,
                "all candidates filtered out",
                candidates,
                started,
            );
            self.record(&result);
            return result;
        }

        let mut targets = Vec::with_capacity(payloads.len());
        for (principal, payload) in &payloads {
            let message = OutboundEventMessage::from_event(&event, payload.clone());
            match self.dispatcher.dispatch(*principal, message).await {
                Ok(()) => targets.push(*principal),
                Err(e) => {
                    warn!(event_id = %event.id, error = %e, "event delivery failed");
                },
            }
        }

        let result = if targets.is_empty() {
            RoutingResult::resolved(
                event.id,
                RoutingDecision::Failed,
                "all deliveries failed",
                candidates,
                started,
            )
        } else {
            RoutingResult {
                event_id: event.id,
                decision: RoutingDecision::Routed,
                reason: None,
                targets,
                payloads,
                candidates,
                elapsed: started.elapsed(),
            }
        };
        self.record(&result);
        result
    }

    /// Push an event to the deferred queue, or hand it back when full.
    async fn try_defer(&self, event: Event) -> Result<EventId, Event> {
        let mut queue = self.deferred.lock().await;
        if queue.len() >= self.settings.deferred_capacity {
            return Err(event);
        }
        let id = event.id;
        queue.push_back(event);
        Ok(id)
    }

    /// Events currently waiting in the deferred queue.
    pub async fn deferred_depth(&self) -> usize {
        self.deferred.lock().await.len()
    }

    /// Route every event currently in the deferred queue.
    ///
    /// Each event is popped before processing, so an event is delivered at
    /// most once even when a drain overlaps new deferrals. Returns how
    /// many events were processed.
    pub async fn drain_deferred(&self) -> usize {
        let mut processed = 0usize;
        // Bounded by the queue depth at entry so concurrent deferrals
        // cannot keep this loop alive forever.
        let batch = self.deferred.lock().await.len();
        while processed < batch {
            let Some(event) = self.deferred.lock().await.pop_front() else {
                break;
            };
            let started = Instant::now();
            let available = self.dispatcher.connected_principals().await;
            let result = self.process(event, &available, started, false).await;
            trace!(
                event_id = %result.event_id,
                decision = ?result.decision,
                "deferred event processed"
            );
            processed = processed.saturating_add(1);
        }
        if processed > 0 {
            debug!(processed, "deferred queue drained");
        }
        processed
    }

    /// Drain the emit queue until shutdown.
    ///
    /// Spawned by the gateway alongside [`Self::run_deferred_drain`].
    pub async fn run_emit_drain(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut emit_rx = self.emit_rx.lock().await;
        debug!("event drain task started");
        loop {
            tokio::select! {
                biased;
                result = shutdown_rx.recv() => {
                    // Ok, Lagged, and Closed all mean the daemon is going
                    // down. Stop either way.
                    let _ = result;
                    info!("event drain received shutdown signal");
                    break;
                }
                maybe_event = emit_rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            let result = self.route_event(event).await;
                            trace!(
                                event_id = %result.event_id,
                                decision = ?result.decision,
                                targets = result.targets.len(),
                                "event routed"
                            );
                        },
                        None => {
                            info!("emit channel closed, event drain exiting");
                            break;
                        },
                    }
                }
            }
        }
    }

    /// Periodically drain the deferred queue until shutdown.
    pub async fn run_deferred_drain(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.settings.deferred_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        debug!("deferred drain task started");
        loop {
            tokio::select! {
                biased;
                result = shutdown_rx.recv() => {
                    let _ = result;
                    info!("deferred drain received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    self.drain_deferred().await;
                }
            }
        }
    }

    /// Snapshot router activity.
    pub async fn stats(&self) -> RouterStats {
        let route_count = self.counters.route_count.load(Ordering::Relaxed).max(1);
        RouterStats {
            emitted: self.counters.emitted.load(Ordering::Relaxed),
            routed: self.counters.routed.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            deferred: self.counters.deferred.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            deliveries: self.counters.deliveries.load(Ordering::Relaxed),
            avg_route_time_us: self
                .counters
                .route_time_us
                .load(Ordering::Relaxed)
                .checked_div(route_count)
                .unwrap_or(0),
            deferred_depth: self.deferred_depth().await,
            filters: self.chain.stats(),
            rules: self.rules.rule_names(),
        }
    }

    fn record(&self, result: &RoutingResult) {
        let counter = match result.decision {
            RoutingDecision::Routed => &self.counters.routed,
            RoutingDecision::Skipped => &self.counters.skipped,
            RoutingDecision::Deferred => &self.counters.deferred,
            RoutingDecision::Failed => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.counters
            .deliveries
            .fetch_add(result.targets.len() as u64, Ordering::Relaxed);
        let elapsed_us = u64::try_from(result.elapsed.as_micros()).unwrap_or(u64::MAX);
        self.counters
            .route_time_us
            .fetch_add(elapsed_us, Ordering::Relaxed);
        self.counters.route_count.fetch_add(1, Ordering::Relaxed);
    }
}
