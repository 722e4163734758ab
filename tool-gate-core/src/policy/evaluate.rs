// tool-gate-core/src/policy/evaluate.rs
// ============================================================================
// Module: Policy Evaluator
// Description: First-match evaluation of tool calls against a bundle.
// Purpose: Produce explainable decisions without side effects or panics.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! Evaluation is a pure function of a [`ToolCall`] and a [`CompiledBundle`]:
//! the first rule whose tool matcher and full predicate set hold wins, with
//! exact-match rules attempted before glob rules; when nothing matches, the
//! bundle's fail-closed default applies. Every attempted rule contributes a
//! trace entry with per-predicate `{ok, msg}` explanations, and the simulator
//! returns that trace verbatim. Malformed arguments fail the offending
//! predicate with a reason; they never abort evaluation.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::core::RuleName;
use crate::core::ToolCall;
use crate::policy::bundle::CompiledBundle;
use crate::policy::bundle::CompiledRule;
use crate::policy::bundle::DEFAULT_REQUIRED_APPROVALS;
use crate::policy::bundle::Predicate;
use crate::policy::bundle::RuleAction;

// ============================================================================
// SECTION: Decision Types
// ============================================================================

/// Outcome of evaluating a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    /// Admit the call.
    Allow,
    /// Reject the call.
    Deny,
    /// Pause for human approval.
    Approval,
}

impl DecisionOutcome {
    /// Stable lowercase label used in audit records and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Approval => "approval",
        }
    }
}

impl From<RuleAction> for DecisionOutcome {
    fn from(action: RuleAction) -> Self {
        match action {
            RuleAction::Allow => Self::Allow,
            RuleAction::Deny => Self::Deny,
            RuleAction::Approval => Self::Approval,
        }
    }
}

/// One `{ok, msg}` predicate explanation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredicateCheck {
    /// Whether the predicate held.
    pub ok: bool,
    /// Human-readable explanation.
    pub msg: String,
}

/// Trace entry for one attempted rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Rule name.
    pub rule: String,
    /// Whether the full predicate set held.
    pub matched: bool,
    /// Per-predicate explanations, in evaluation order.
    pub explain: Vec<PredicateCheck>,
}

/// Result of evaluating a tool call against a bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    /// Evaluation outcome.
    pub decision: DecisionOutcome,
    /// Winning rule name; absent when the default applied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_name: Option<RuleName>,
    /// Reason attached by the winning rule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Approval quorum for `approval` outcomes.
    pub required_approvals: u32,
    /// Approver group constraint for `approval` outcomes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approver_group: Option<String>,
    /// Trace of every attempted rule up to and including the match.
    pub trace: Vec<TraceEntry>,
}

// ============================================================================
// SECTION: Evaluation
// ============================================================================

/// Evaluates a tool call against a compiled bundle.
#[must_use]
pub fn evaluate(call: &ToolCall, bundle: &CompiledBundle) -> Decision {
    let mut trace = Vec::new();
    for index in bundle.candidates(&call.tool) {
        let rule = &bundle.rules[index];
        let (matched, explain) = check_predicates(rule, &call.arguments);
        trace.push(TraceEntry {
            rule: rule.name.as_str().to_string(),
            matched,
            explain,
        });
        if matched {
            return Decision {
                decision: rule.action.into(),
                rule_name: Some(rule.name.clone()),
                reason: rule.reason.clone(),
                required_approvals: rule.required_approvals,
                approver_group: rule.approver_group.clone(),
                trace,
            };
        }
    }
    trace.push(TraceEntry {
        rule: "__default__".to_string(),
        matched: true,
        explain: vec![PredicateCheck {
            ok: true,
            msg: "no rules matched".to_string(),
        }],
    });
    Decision {
        decision: bundle.default_action.into(),
        rule_name: None,
        reason: Some("no matching rule".to_string()),
        required_approvals: DEFAULT_REQUIRED_APPROVALS,
        approver_group: None,
        trace,
    }
}

/// Checks a rule's predicate set against arguments.
///
/// Short-circuits on the first failing predicate but always records the
/// failing check, so trace consumers see why the rule was skipped.
fn check_predicates(rule: &CompiledRule, arguments: &Value) -> (bool, Vec<PredicateCheck>) {
    let mut explain = Vec::with_capacity(rule.predicates.len());
    if rule.predicates.is_empty() {
        explain.push(PredicateCheck {
            ok: true,
            msg: "no conditions".to_string(),
        });
        return (true, explain);
    }
    for predicate in &rule.predicates {
        let check = check_predicate(predicate, arguments);
        let ok = check.ok;
        explain.push(check);
        if !ok {
            return (false, explain);
        }
    }
    (true, explain)
}

/// Checks one predicate against arguments, producing its explanation.
fn check_predicate(predicate: &Predicate, arguments: &Value) -> PredicateCheck {
    match predicate {
        Predicate::HostIn(hosts) => match argument_host(arguments) {
            Some(host) if hosts.iter().any(|allowed| allowed == &host) => {
                ok(format!("host '{host}' allowed"))
            }
            Some(host) => fail(format!("host '{host}' not in allowlist")),
            None => fail("missing or invalid url argument".to_string()),
        },
        Predicate::HostNotIn(hosts) => match argument_host(arguments) {
            Some(host) if hosts.iter().any(|blocked| blocked == &host) => {
                fail(format!("host '{host}' is blocked"))
            }
            Some(host) => ok(format!("host '{host}' not blocked")),
            None => fail("missing or invalid url argument".to_string()),
        },
        Predicate::Method(expected) => match arguments.get("method").and_then(Value::as_str) {
            Some(method) if method == expected => ok(format!("method '{method}' matched")),
            Some(method) => fail(format!("method '{method}' != '{expected}'")),
            None => fail("missing method argument".to_string()),
        },
        Predicate::BodyBytesOver(limit) => {
            let size = body_bytes(arguments);
            if size > *limit {
                ok(format!("body {size} exceeds threshold {limit}"))
            } else {
                fail(format!("body size {size} <= threshold {limit}"))
            }
        }
        Predicate::PathUnder(prefixes) => match arguments.get("path").and_then(Value::as_str) {
            Some(path) => match prefixes.iter().find(|prefix| path.starts_with(prefix.as_str())) {
                Some(prefix) => ok(format!("path under '{prefix}'")),
                None => fail("path is outside permitted prefixes".to_string()),
            },
            None => fail("missing path argument".to_string()),
        },
        Predicate::PathNotUnder(prefixes) => match arguments.get("path").and_then(Value::as_str) {
            Some(path) => match prefixes.iter().find(|prefix| path.starts_with(prefix.as_str())) {
                Some(prefix) => fail(format!("path under restricted prefix '{prefix}'")),
                None => ok("path outside restricted prefixes".to_string()),
            },
            None => fail("missing path argument".to_string()),
        },
        Predicate::EstimatedCostUsdOver(threshold) => {
            match arguments.get("estimated_cost_usd").and_then(Value::as_f64) {
                Some(cost) if cost > *threshold => {
                    ok(format!("estimated cost {cost} exceeds threshold {threshold}"))
                }
                Some(cost) => fail(format!("estimated_cost_usd {cost} <= {threshold}")),
                None => fail("missing estimated_cost_usd argument".to_string()),
            }
        }
        Predicate::Provider(expected) => equality_check(arguments, "provider", expected),
        Predicate::Resource(expected) => equality_check(arguments, "resource", expected),
        Predicate::Action(expected) => equality_check(arguments, "action", expected),
    }
}

/// Equality predicate over a string argument field.
fn equality_check(arguments: &Value, field: &str, expected: &str) -> PredicateCheck {
    match arguments.get(field).and_then(Value::as_str) {
        Some(actual) if actual == expected => ok(format!("{field} '{actual}' matched")),
        Some(actual) => fail(format!("{field} '{actual}' != '{expected}'")),
        None => fail(format!("missing {field} argument")),
    }
}

/// Extracts the host component of `arguments.url`.
///
/// Accepts both scheme-qualified and bare authority forms; the host includes
/// any port suffix, matching the wire form agents send.
fn argument_host(arguments: &Value) -> Option<String> {
    let url = arguments.get("url").and_then(Value::as_str)?;
    let after_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let host = after_scheme.split('/').next().unwrap_or_default();
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// Returns the size of `arguments.body` in bytes.
///
/// Strings count their UTF-8 bytes; any other JSON value counts its compact
/// serialized length. A missing body counts zero.
fn body_bytes(arguments: &Value) -> u64 {
    match arguments.get("body") {
        None | Some(Value::Null) => 0,
        Some(Value::String(body)) => body.len() as u64,
        Some(other) => serde_json::to_vec(other).map_or(0, |bytes| bytes.len() as u64),
    }
}

fn ok(msg: String) -> PredicateCheck {
    PredicateCheck { ok: true, msg }
}

fn fail(msg: String) -> PredicateCheck {
    PredicateCheck { ok: false, msg }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
