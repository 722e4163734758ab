// tool-gate-core/src/policy/diff.rs
// ============================================================================
// Module: Policy Bundle Diff
// Description: Structural comparison of two bundle documents.
// Purpose: Categorize rule changes and surface a risk headline for review.
// Dependencies: serde_json, serde_yaml
// ============================================================================

//! ## Overview
//! The diff operates on raw bundle documents rather than compiled rules so it
//! can describe bundles that would fail compilation. Rules are keyed by
//! `<match>/<name>`; the result lists added, removed, and modified rules, the
//! defaults transition, and a headline of the riskiest changes (new allow
//! rules, action flips, widened host allowlists, quorum changes).

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Diff failures.
#[derive(Debug, Error)]
pub enum DiffError {
    /// A document failed to parse as YAML.
    #[error("bundle parse failed: {0}")]
    Parse(String),
}

// ============================================================================
// SECTION: Diff Result
// ============================================================================

/// Fields compared per rule.
const COMPARED_FIELDS: [&str; 5] = ["match", "where", "action", "required_approvals", "reason"];

/// A rule present on only one side of the diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleRef {
    /// Rule key `<match>/<name>`.
    pub id: String,
    /// The raw rule document.
    pub rule: Value,
}

/// A single field change inside a modified rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldChange {
    /// Field name.
    pub field: String,
    /// Value before the change.
    pub from: Value,
    /// Value after the change.
    pub to: Value,
}

/// A rule present on both sides with differing content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifiedRule {
    /// Rule key `<match>/<name>`.
    pub id: String,
    /// Raw rule before.
    pub before: Value,
    /// Raw rule after.
    pub after: Value,
    /// Changed fields.
    pub changes: Vec<FieldChange>,
}

/// Defaults transition between the two documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsChange {
    /// Defaults section before.
    pub from: Value,
    /// Defaults section after.
    pub to: Value,
}

/// Full structural diff of two bundles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleDiff {
    /// Rules only in the proposed bundle.
    pub added: Vec<RuleRef>,
    /// Rules only in the current bundle.
    pub removed: Vec<RuleRef>,
    /// Rules changed between bundles.
    pub modified: Vec<ModifiedRule>,
    /// Defaults transition.
    pub defaults: DefaultsChange,
    /// Risk headline notes, most significant first.
    pub headline: Vec<String>,
}

// ============================================================================
// SECTION: Comparison
// ============================================================================

/// Compares two YAML bundle documents.
///
/// # Errors
///
/// Returns [`DiffError::Parse`] when either document is not valid YAML.
pub fn compare(current_yaml: &str, proposed_yaml: &str) -> Result<BundleDiff, DiffError> {
    let current: Value =
        serde_yaml::from_str(current_yaml).map_err(|err| DiffError::Parse(err.to_string()))?;
    let proposed: Value =
        serde_yaml::from_str(proposed_yaml).map_err(|err| DiffError::Parse(err.to_string()))?;

    let current_rules = index_rules(&current);
    let proposed_rules = index_rules(&proposed);

    let mut added = Vec::new();
    for (id, rule) in &proposed_rules {
        if !current_rules.contains_key(id) {
            added.push(RuleRef {
                id: id.clone(),
                rule: (*rule).clone(),
            });
        }
    }
    let mut removed = Vec::new();
    for (id, rule) in &current_rules {
        if !proposed_rules.contains_key(id) {
            removed.push(RuleRef {
                id: id.clone(),
                rule: (*rule).clone(),
            });
        }
    }
    let mut modified = Vec::new();
    for (id, before) in &current_rules {
        let Some(after) = proposed_rules.get(id) else {
            continue;
        };
        let changes = rule_changes(before, after);
        if !changes.is_empty() {
            modified.push(ModifiedRule {
                id: id.clone(),
                before: (*before).clone(),
                after: (*after).clone(),
                changes,
            });
        }
    }

    let defaults = DefaultsChange {
        from: current.get("defaults").cloned().unwrap_or(Value::Null),
        to: proposed.get("defaults").cloned().unwrap_or(Value::Null),
    };
    let headline = risk_headline(&added, &modified, &defaults);
    Ok(BundleDiff {
        added,
        removed,
        modified,
        defaults,
        headline,
    })
}

/// Indexes a document's rules by `<match>/<name>`.
fn index_rules(doc: &Value) -> BTreeMap<String, &Value> {
    let mut out = BTreeMap::new();
    let Some(rules) = doc.get("rules").and_then(Value::as_array) else {
        return out;
    };
    for rule in rules {
        let matcher = rule.get("match").and_then(Value::as_str).unwrap_or("*");
        let name = rule.get("name").and_then(Value::as_str).unwrap_or("_unnamed_");
        out.insert(format!("{matcher}/{name}"), rule);
    }
    out
}

/// Lists changed fields between two raw rules.
fn rule_changes(before: &Value, after: &Value) -> Vec<FieldChange> {
    let mut out = Vec::new();
    for field in COMPARED_FIELDS {
        let from = before.get(field).cloned().unwrap_or(Value::Null);
        let to = after.get(field).cloned().unwrap_or(Value::Null);
        if from != to {
            out.push(FieldChange {
                field: field.to_string(),
                from,
                to,
            });
        }
    }
    out
}

/// Builds the risk headline from categorized changes.
fn risk_headline(
    added: &[RuleRef],
    modified: &[ModifiedRule],
    defaults: &DefaultsChange,
) -> Vec<String> {
    let mut notes = Vec::new();
    for entry in added {
        match entry.rule.get("action").and_then(Value::as_str) {
            Some("allow") => notes.push(format!("New allow: {}", entry.id)),
            Some("approval") => notes.push(format!("New approval flow: {}", entry.id)),
            _ => {}
        }
    }
    for change in modified {
        let before_action = change.before.get("action").and_then(Value::as_str);
        let after_action = change.after.get("action").and_then(Value::as_str);
        if before_action != after_action {
            notes.push(format!(
                "Action change {}: {} -> {}",
                change.id,
                before_action.unwrap_or("none"),
                after_action.unwrap_or("none")
            ));
        }
        let before_hosts = change.before.pointer("/where/host_in");
        let after_hosts = change.after.pointer("/where/host_in");
        if before_hosts != after_hosts {
            notes.push(format!("Changed host_in: {}", change.id));
        }
        let before_quorum = change.before.get("required_approvals");
        let after_quorum = change.after.get("required_approvals");
        if before_quorum != after_quorum {
            notes.push(format!(
                "Approval quorum change {}: {} -> {}",
                change.id,
                before_quorum.cloned().unwrap_or(Value::Null),
                after_quorum.cloned().unwrap_or(Value::Null)
            ));
        }
    }
    if defaults.from != defaults.to {
        notes.push("Default decision changed".to_string());
    }
    if notes.is_empty() {
        notes.push("No high-risk changes detected.".to_string());
    }
    notes
}

// ============================================================================
// SECTION: Tests
// ============================================================================
