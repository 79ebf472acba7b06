//! Custom routing rules.
//!
//! Rules run before normal fan-out and can short-circuit it (skip or
//! defer), narrow the candidate set, or rewrite payload fields. Rules are
//! evaluated in insertion order; every condition on a rule must hold for
//! its action to fire. The admin surface can add and remove rules at
//! runtime.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::info;
use zonecast_core::{Event, EventPriority, EventType, Principal, PrincipalId};

/// A single rule: an optional event-type scope, a set of conditions that
/// must all hold, and one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Unique name, used for removal and in routing reasons
    pub name: String,
    /// Event types this rule applies to; `None` means every type
    pub event_types: Option<Vec<EventType>>,
    /// Conditions that must all hold
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    /// What happens when the rule fires
    pub action: RuleAction,
}

impl RoutingRule {
    /// Create a rule that applies to every event type.
    #[must_use]
    pub fn new(name: impl Into<String>, action: RuleAction) -> Self {
        Self {
            name: name.into(),
            event_types: None,
            conditions: Vec::new(),
            action,
        }
    }

    /// Scope the rule to specific event types.
    #[must_use]
    pub fn for_types(mut self, types: Vec<EventType>) -> Self {
        self.event_types = Some(types);
        self
    }

    /// Add a condition.
    #[must_use]
    pub fn when(mut self, condition: RuleCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    fn applies_to(&self, event: &Event, ctx: &RuleContext) -> bool {
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        self.conditions.iter().all(|c| c.matches(event, ctx))
    }
}

/// A predicate on the event or the routing context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum RuleCondition {
    /// The event priority is at least this high
    MinimumPriority {
        /// The minimum priority
        minimum: EventPriority,
    },
    /// At least this many principals are connected
    MinimumConnected {
        /// The minimum connected count
        count: usize,
    },
    /// The current UTC hour falls inside `[start_hour, end_hour)`,
    /// wrapping past midnight when `start_hour > end_hour`
    TimeOfDay {
        /// Window start hour (0-23)
        start_hour: u32,
        /// Window end hour (0-23)
        end_hour: u32,
    },
    /// A top-level payload field equals a value
    PayloadFieldEquals {
        /// The field name
        field: String,
        /// The expected value
        value: serde_json::Value,
    },
}

impl RuleCondition {
    fn matches(&self, event: &Event, ctx: &RuleContext) -> bool {
        match self {
            Self::MinimumPriority { minimum } => event.priority >= *minimum,
            Self::MinimumConnected { count } => ctx.connected >= *count,
            Self::TimeOfDay {
                start_hour,
                end_hour,
            } => {
                let hour = ctx.now.hour();
                if start_hour <= end_hour {
                    hour >= *start_hour && hour < *end_hour
                } else {
                    hour >= *start_hour || hour < *end_hour
                }
            },
            Self::PayloadFieldEquals { field, value } => {
                event.data.get(field) == Some(value)
            },
        }
    }
}

/// What a fired rule does.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RuleAction {
    /// Drop the event without routing it
    Skip,
    /// Push the event to the deferred queue
    Defer,
    /// Narrow candidates to administrators
    AdminOnly,
    /// Narrow candidates to active principals
    ActiveOnly,
    /// Narrow candidates to this allow-list
    AllowOnly {
        /// The allowed principals
        principals: Vec<PrincipalId>,
    },
    /// Remove these principals from the candidates
    Exclude {
        /// The excluded principals
        principals: Vec<PrincipalId>,
    },
    /// Set a top-level payload field before routing
    RewriteField {
        /// The field name
        field: String,
        /// The replacement value
        value: serde_json::Value,
    },
}

/// Context available to rule conditions.
#[derive(Debug, Clone)]
pub struct RuleContext {
    /// Number of currently connected principals
    pub connected: usize,
    /// Evaluation time
    pub now: DateTime<Utc>,
}

/// A candidate-set restriction produced by a fired rule.
#[derive(Debug, Clone)]
pub enum CandidateRestriction {
    /// Keep administrators only
    AdminOnly,
    /// Keep active principals only
    ActiveOnly,
    /// Keep only these principals
    AllowOnly(HashSet<PrincipalId>),
    /// Drop these principals
    Exclude(HashSet<PrincipalId>),
}

impl CandidateRestriction {
    /// Whether a principal survives this restriction.
    #[must_use]
    pub fn permits(&self, principal: &Principal) -> bool {
        match self {
            Self::AdminOnly => principal.admin,
            Self::ActiveOnly => principal.active,
            Self::AllowOnly(allowed) => allowed.contains(&principal.id),
            Self::Exclude(excluded) => !excluded.contains(&principal.id),
        }
    }
}

/// How rule evaluation resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleDirective {
    /// Continue with normal routing
    Proceed,
    /// Drop the event
    Skip {
        /// The rule that skipped it
        rule: String,
    },
    /// Queue the event for deferred processing
    Defer {
        /// The rule that deferred it
        rule: String,
    },
}

/// The outcome of evaluating all rules against one event.
#[derive(Debug, Clone)]
pub struct RuleEvaluation {
    /// Skip, defer, or proceed
    pub directive: RuleDirective,
    /// The event, with any field rewrites applied
    pub event: Event,
    /// Candidate-set restrictions to apply during fan-out
    pub restrictions: Vec<CandidateRestriction>,
}

/// Ordered rule storage with runtime add and remove.
#[derive(Debug, Default)]
pub struct RuleEngine {
    rules: std::sync::RwLock<Vec<RoutingRule>>,
}

impl RuleEngine {
    /// Create an empty rule engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule. A rule with the same name replaces the old one in
    /// place, keeping its position.
    pub fn add_rule(&self, rule: RoutingRule) {
        let Ok(mut rules) = self.rules.write() else {
            return;
        };
        info!(rule = %rule.name, "routing rule added");
        if let Some(existing) = rules.iter_mut().find(|r| r.name == rule.name) {
            *existing = rule;
        } else {
            rules.push(rule);
        }
    }

    /// Remove a rule by name. Returns whether it existed.
    pub fn remove_rule(&self, name: &str) -> bool {
        let Ok(mut rules) = self.rules.write() else {
            return false;
        };
        let before = rules.len();
        rules.retain(|r| r.name != name);
        let removed = rules.len() < before;
        if removed {
            info!(rule = name, "routing rule removed");
        }
        removed
    }

    /// Names of the installed rules, in evaluation order.
    #[must_use]
    pub fn rule_names(&self) -> Vec<String> {
        self.rules
            .read()
            .map(|rules| rules.iter().map(|r| r.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Evaluate every rule against an event.
    ///
    /// Skip and defer short-circuit; narrowing and rewrite actions
    /// accumulate across fired rules.
    #[must_use]
    pub fn evaluate(&self, event: &Event, ctx: &RuleContext) -> RuleEvaluation {
        let mut event = event.clone();
        let mut restrictions: Vec<CandidateRestriction> = Vec::new();

        let Ok(rules) = self.rules.read() else {
            return RuleEvaluation {
                directive: RuleDirective::Proceed,
                event,
                restrictions,
            };
        };

        for rule in rules.iter() {
            if !rule.applies_to(&event, ctx) {
                continue;
            }
            match &rule.action {
                RuleAction::Skip => {
                    return RuleEvaluation {
                        directive: RuleDirective::Skip {
                            rule: rule.name.clone(),
                        },
                        event,
                        restrictions,
                    };
                },
                RuleAction::Defer => {
                    return RuleEvaluation {
                        directive: RuleDirective::Defer {
                            rule: rule.name.clone(),
                        },
                        event,
                        restrictions,
                    };
                },
                RuleAction::AdminOnly => restrictions.push(CandidateRestriction::AdminOnly),
                RuleAction::ActiveOnly => restrictions.push(CandidateRestriction::ActiveOnly),
                RuleAction::AllowOnly { principals } => restrictions.push(
                    CandidateRestriction::AllowOnly(principals.iter().copied().collect()),
                ),
                RuleAction::Exclude { principals } => restrictions.push(
                    CandidateRestriction::Exclude(principals.iter().copied().collect()),
                ),
                RuleAction::RewriteField { field, value } => {
                    if let Some(object) = event.data.as_object_mut() {
                        object.insert(field.clone(), value.clone());
                    }
                },
            }
        }

        RuleEvaluation {
            directive: RuleDirective::Proceed,
            event,
            restrictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(connected: usize) -> RuleContext {
        RuleContext {
            connected,
            now: Utc::now(),
        }
    }

    fn notice() -> Event {
        Event::new(EventType::SystemNotice, json!({"env": "prod"}))
    }

    #[test]
    fn empty_engine_proceeds() {
        let engine = RuleEngine::new();
        let eval = engine.evaluate(&notice(), &ctx(1));
        assert_eq!(eval.directive, RuleDirective::Proceed);
        assert!(eval.restrictions.is_empty());
    }

    #[test]
    fn skip_rule_short_circuits() {
        let engine = RuleEngine::new();
        engine.add_rule(RoutingRule::new("mute-notices", RuleAction::Skip)
            .for_types(vec![EventType::SystemNotice]));

        let eval = engine.evaluate(&notice(), &ctx(1));
        assert_eq!(
            eval.directive,
            RuleDirective::Skip {
                rule: "mute-notices".into()
            }
        );
        // Other types are untouched.
        let other = Event::new(EventType::RecordUpdated, json!({}));
        assert_eq!(engine.evaluate(&other, &ctx(1)).directive, RuleDirective::Proceed);
    }

    #[test]
    fn conditions_all_must_hold() {
        let engine = RuleEngine::new();
        engine.add_rule(
            RoutingRule::new("defer-under-load", RuleAction::Defer)
                .when(RuleCondition::MinimumConnected { count: 10 })
                .when(RuleCondition::MinimumPriority {
                    minimum: EventPriority::Normal,
                }),
        );

        // Not enough connections: rule does not fire.
        assert_eq!(engine.evaluate(&notice(), &ctx(5)).directive, RuleDirective::Proceed);
        // Both conditions hold.
        assert_eq!(
            engine.evaluate(&notice(), &ctx(15)).directive,
            RuleDirective::Defer {
                rule: "defer-under-load".into()
            }
        );
    }

    #[test]
    fn payload_condition_matches_exact_value() {
        let engine = RuleEngine::new();
        engine.add_rule(RoutingRule::new("prod-only", RuleAction::Skip).when(
            RuleCondition::PayloadFieldEquals {
                field: "env".into(),
                value: json!("staging"),
            },
        ));

        assert_eq!(engine.evaluate(&notice(), &ctx(1)).directive, RuleDirective::Proceed);

        let staging = Event::new(EventType::SystemNotice, json!({"env": "staging"}));
        assert!(matches!(
            engine.evaluate(&staging, &ctx(1)).directive,
            RuleDirective::Skip { .. }
        ));
    }

    #[test]
    fn narrowing_rules_accumulate() {
        let engine = RuleEngine::new();
        let blocked = PrincipalId::new();
        engine.add_rule(RoutingRule::new("admins", RuleAction::AdminOnly));
        engine.add_rule(RoutingRule::new(
            "blocklist",
            RuleAction::Exclude {
                principals: vec![blocked],
            },
        ));

        let eval = engine.evaluate(&notice(), &ctx(1));
        assert_eq!(eval.restrictions.len(), 2);

        let admin = Principal::new("root").with_admin();
        let operator = Principal::new("op");
        assert!(eval.restrictions.iter().all(|r| r.permits(&admin)));
        assert!(!eval.restrictions.iter().all(|r| r.permits(&operator)));

        let blocked_admin = Principal::new("x").with_admin().with_id(blocked);
        assert!(!eval.restrictions.iter().all(|r| r.permits(&blocked_admin)));
    }

    #[test]
    fn rewrite_rule_updates_payload() {
        let engine = RuleEngine::new();
        engine.add_rule(RoutingRule::new(
            "tag-region",
            RuleAction::RewriteField {
                field: "region".into(),
                value: json!("eu-west"),
            },
        ));

        let eval = engine.evaluate(&notice(), &ctx(1));
        assert_eq!(eval.directive, RuleDirective::Proceed);
        assert_eq!(eval.event.data["region"], "eu-west");
    }

    #[test]
    fn add_rule_replaces_by_name() {
        let engine = RuleEngine::new();
        engine.add_rule(RoutingRule::new("r", RuleAction::Skip));
        engine.add_rule(RoutingRule::new("r", RuleAction::AdminOnly));

        assert_eq!(engine.rule_names(), vec!["r"]);
        let eval = engine.evaluate(&notice(), &ctx(1));
        assert_eq!(eval.directive, RuleDirective::Proceed);
        assert_eq!(eval.restrictions.len(), 1);
    }

    #[test]
    fn remove_rule_by_name() {
        let engine = RuleEngine::new();
        engine.add_rule(RoutingRule::new("r", RuleAction::Skip));
        assert!(engine.remove_rule("r"));
        assert!(!engine.remove_rule("r"));
        assert!(engine.rule_names().is_empty());
    }

    #[test]
    fn time_of_day_wraps_midnight() {
        let event = notice();
        let night = RuleCondition::TimeOfDay {
            start_hour: 22,
            end_hour: 6,
        };
        let hour = Utc::now().hour();
        let expected = hour >= 22 || hour < 6;
        assert_eq!(night.matches(&event, &ctx(1)), expected);
    }
}
