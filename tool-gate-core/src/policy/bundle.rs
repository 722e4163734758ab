// tool-gate-core/src/policy/bundle.rs
// ============================================================================
// Module: Policy Bundle Model
// Description: YAML bundle parsing and compilation into matchable rules.
// Purpose: Turn signed bundle documents into immutable evaluation structures.
// Dependencies: serde, serde_yaml, globset
// ============================================================================

//! ## Overview
//! A policy bundle is an ordered list of rules plus a fail-closed default
//! decision. Parsing is strict: unknown predicate keys and malformed glob
//! patterns are rejected at load time, never at evaluation time. Compiled
//! bundles are immutable; a new version replaces the old one by pointer swap
//! in the bundle store.
//!
//! Rule matching precedence: exact-match rules first (file order), then glob
//! rules (file order). For bundles without glob patterns this degenerates to
//! plain file order.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;

use globset::Glob;
use globset::GlobMatcher;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::core::BundleVersion;
use crate::core::RuleName;
use crate::core::ToolName;
use crate::hashing::sha256_hex;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum bundle document size in bytes.
pub const MAX_BUNDLE_BYTES: usize = 1024 * 1024;
/// Maximum number of rules in a bundle.
pub const MAX_BUNDLE_RULES: usize = 1024;
/// Default approval quorum when a rule does not specify one.
pub const DEFAULT_REQUIRED_APPROVALS: u32 = 1;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Bundle parse or compile failures (`PolicyInvalid` to callers).
#[derive(Debug, Error)]
pub enum BundleError {
    /// Document exceeded the size limit.
    #[error("bundle exceeds size limit ({actual} > {limit} bytes)")]
    TooLarge {
        /// Maximum allowed bytes.
        limit: usize,
        /// Observed size in bytes.
        actual: usize,
    },
    /// YAML parse or schema failure, including unknown predicate keys.
    #[error("bundle parse failed: {0}")]
    Parse(String),
    /// Rule count exceeded the limit.
    #[error("bundle has too many rules ({actual} > {limit})")]
    TooManyRules {
        /// Maximum allowed rules.
        limit: usize,
        /// Observed rule count.
        actual: usize,
    },
    /// Glob pattern failed to compile.
    #[error("rule '{rule}' has invalid match pattern '{pattern}': {message}")]
    InvalidGlob {
        /// Rule carrying the pattern.
        rule: String,
        /// Offending pattern text.
        pattern: String,
        /// Compiler error message.
        message: String,
    },
    /// A rule is internally inconsistent.
    #[error("rule '{rule}' is invalid: {message}")]
    InvalidRule {
        /// Offending rule name.
        rule: String,
        /// Validation failure description.
        message: String,
    },
}

// ============================================================================
// SECTION: Wire Document
// ============================================================================

/// Decision outcome named by rules and defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Admit the call.
    Allow,
    /// Reject the call.
    Deny,
    /// Pause the call for human approval.
    Approval,
}

/// Top-level bundle document as authored in YAML.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct BundleDoc {
    /// Optional stable version identifier.
    version: Option<String>,
    /// Default decision when no rule matches.
    defaults: Option<DefaultsDoc>,
    /// Ordered rule list.
    #[serde(default)]
    rules: Vec<RuleDoc>,
}

/// Bundle defaults section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct DefaultsDoc {
    /// Default decision; fail-closed deployments set `deny`.
    decision: RuleAction,
}

/// A single rule as authored in YAML.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleDoc {
    /// Rule name, referenced by decisions and audit records.
    name: String,
    /// Exact tool name or glob pattern.
    #[serde(rename = "match")]
    match_pattern: String,
    /// Predicate set; implicit AND across keys.
    #[serde(rename = "where")]
    where_clause: Option<WhereDoc>,
    /// Action taken when the rule matches.
    action: RuleAction,
    /// Human-readable reason attached to the decision.
    reason: Option<String>,
    /// Approval quorum for `action: approval` rules.
    required_approvals: Option<u32>,
    /// Approver group allowed to decide matching approvals.
    approver_group: Option<String>,
}

/// The closed predicate DSL. Unknown keys fail the parse.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct WhereDoc {
    /// Host of `arguments.url` must be in this list.
    host_in: Option<Vec<String>>,
    /// Host of `arguments.url` must not be in this list.
    host_not_in: Option<Vec<String>>,
    /// HTTP method equality.
    method: Option<String>,
    /// `arguments.body` must exceed this many bytes.
    body_bytes_over: Option<u64>,
    /// `arguments.path` must have one of these prefixes.
    path_under: Option<Vec<String>>,
    /// `arguments.path` must not have any of these prefixes.
    path_not_under: Option<Vec<String>>,
    /// `arguments.estimated_cost_usd` must exceed this threshold.
    estimated_cost_usd_over: Option<f64>,
    /// Cloud provider equality for `cloud.ops`.
    provider: Option<String>,
    /// Cloud resource equality for `cloud.ops`.
    resource: Option<String>,
    /// Cloud action equality for `cloud.ops`.
    action: Option<String>,
}

// ============================================================================
// SECTION: Compiled Predicates
// ============================================================================

/// A compiled predicate from a rule's `where` clause.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Host of `arguments.url` is in the allowlist.
    HostIn(Vec<String>),
    /// Host of `arguments.url` is not in the blocklist.
    HostNotIn(Vec<String>),
    /// HTTP method equals the given value.
    Method(String),
    /// `arguments.body` exceeds the given byte count.
    BodyBytesOver(u64),
    /// `arguments.path` starts with one of the given prefixes.
    PathUnder(Vec<String>),
    /// `arguments.path` starts with none of the given prefixes.
    PathNotUnder(Vec<String>),
    /// `arguments.estimated_cost_usd` exceeds the given threshold.
    EstimatedCostUsdOver(f64),
    /// `arguments.provider` equals the given value.
    Provider(String),
    /// `arguments.resource` equals the given value.
    Resource(String),
    /// `arguments.action` equals the given value.
    Action(String),
}

impl WhereDoc {
    /// Compiles the clause into its predicate list, preserving DSL key order.
    fn compile(self) -> Vec<Predicate> {
        let mut predicates = Vec::new();
        if let Some(hosts) = self.host_in {
            predicates.push(Predicate::HostIn(hosts));
        }
        if let Some(hosts) = self.host_not_in {
            predicates.push(Predicate::HostNotIn(hosts));
        }
        if let Some(method) = self.method {
            predicates.push(Predicate::Method(method));
        }
        if let Some(limit) = self.body_bytes_over {
            predicates.push(Predicate::BodyBytesOver(limit));
        }
        if let Some(prefixes) = self.path_under {
            predicates.push(Predicate::PathUnder(prefixes));
        }
        if let Some(prefixes) = self.path_not_under {
            predicates.push(Predicate::PathNotUnder(prefixes));
        }
        if let Some(threshold) = self.estimated_cost_usd_over {
            predicates.push(Predicate::EstimatedCostUsdOver(threshold));
        }
        if let Some(provider) = self.provider {
            predicates.push(Predicate::Provider(provider));
        }
        if let Some(resource) = self.resource {
            predicates.push(Predicate::Resource(resource));
        }
        if let Some(action) = self.action {
            predicates.push(Predicate::Action(action));
        }
        predicates
    }
}

// ============================================================================
// SECTION: Compiled Rules
// ============================================================================

/// How a rule matches tool names.
#[derive(Debug, Clone)]
pub enum RuleMatcher {
    /// Exact tool-name equality.
    Exact(ToolName),
    /// Glob pattern over tool names.
    Glob {
        /// Source pattern text, for traces and diffs.
        pattern: String,
        /// Compiled matcher.
        matcher: GlobMatcher,
    },
}

impl RuleMatcher {
    /// Returns true when the matcher covers the given tool.
    #[must_use]
    pub fn matches(&self, tool: &ToolName) -> bool {
        match self {
            Self::Exact(name) => name == tool,
            Self::Glob { matcher, .. } => matcher.is_match(tool.as_str()),
        }
    }

    /// Returns the source pattern text.
    #[must_use]
    pub fn pattern(&self) -> &str {
        match self {
            Self::Exact(name) => name.as_str(),
            Self::Glob { pattern, .. } => pattern,
        }
    }
}

/// A compiled rule ready for evaluation.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    /// Position in the authored rule list.
    pub index: usize,
    /// Rule name.
    pub name: RuleName,
    /// Tool-name matcher.
    pub matcher: RuleMatcher,
    /// Compiled predicate set (implicit AND).
    pub predicates: Vec<Predicate>,
    /// Action taken on match.
    pub action: RuleAction,
    /// Optional reason propagated into decisions.
    pub reason: Option<String>,
    /// Approval quorum (meaningful for `approval` rules).
    pub required_approvals: u32,
    /// Approver group constraint, if any.
    pub approver_group: Option<String>,
}

/// An immutable, compiled policy bundle.
#[derive(Debug, Clone)]
pub struct CompiledBundle {
    /// Stable version identifier.
    pub version: BundleVersion,
    /// SHA-256 hex digest of the source document bytes.
    pub sha256: String,
    /// Source document text, retained for diffing against proposals.
    pub source_yaml: String,
    /// Default decision when no rule matches.
    pub default_action: RuleAction,
    /// All rules in file order.
    pub rules: Vec<CompiledRule>,
    /// Exact-match rule indices keyed by tool name, preserving file order.
    exact: HashMap<String, Vec<usize>>,
    /// Glob rule indices in file order.
    globs: Vec<usize>,
}

impl CompiledBundle {
    /// Parses and compiles a YAML bundle document.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError`] when the document is oversized, malformed,
    /// names unknown predicates, or carries an invalid glob pattern.
    pub fn compile(bytes: &[u8], fallback_version: Option<&str>) -> Result<Self, BundleError> {
        if bytes.len() > MAX_BUNDLE_BYTES {
            return Err(BundleError::TooLarge {
                limit: MAX_BUNDLE_BYTES,
                actual: bytes.len(),
            });
        }
        let doc: BundleDoc =
            serde_yaml::from_slice(bytes).map_err(|err| BundleError::Parse(err.to_string()))?;
        if doc.rules.len() > MAX_BUNDLE_RULES {
            return Err(BundleError::TooManyRules {
                limit: MAX_BUNDLE_RULES,
                actual: doc.rules.len(),
            });
        }
        let sha256 = sha256_hex(bytes);
        let version = doc
            .version
            .as_deref()
            .or(fallback_version)
            .map_or_else(|| BundleVersion::new(format!("sha256-{}", &sha256[..12])), BundleVersion::new);
        let default_action =
            doc.defaults.map_or(RuleAction::Deny, |defaults| defaults.decision);

        let mut rules = Vec::with_capacity(doc.rules.len());
        let mut exact: HashMap<String, Vec<usize>> = HashMap::new();
        let mut globs = Vec::new();
        for (index, rule) in doc.rules.into_iter().enumerate() {
            let compiled = compile_rule(index, rule)?;
            match &compiled.matcher {
                RuleMatcher::Exact(name) => {
                    exact.entry(name.as_str().to_string()).or_default().push(index);
                }
                RuleMatcher::Glob { .. } => globs.push(index),
            }
            rules.push(compiled);
        }

        Ok(Self {
            version,
            sha256,
            source_yaml: String::from_utf8_lossy(bytes).into_owned(),
            default_action,
            rules,
            exact,
            globs,
        })
    }

    /// Returns the rule indices to attempt for a tool, in match precedence
    /// order: exact rules (file order) before glob rules (file order).
    #[must_use]
    pub fn candidates(&self, tool: &ToolName) -> Vec<usize> {
        let mut out = self.exact.get(tool.as_str()).cloned().unwrap_or_default();
        for &index in &self.globs {
            if self.rules[index].matcher.matches(tool) {
                out.push(index);
            }
        }
        out
    }
}

/// Compiles a single authored rule.
fn compile_rule(index: usize, rule: RuleDoc) -> Result<CompiledRule, BundleError> {
    if rule.name.trim().is_empty() {
        return Err(BundleError::InvalidRule {
            rule: format!("#{index}"),
            message: "rule name must not be empty".to_string(),
        });
    }
    let required_approvals = rule.required_approvals.unwrap_or(DEFAULT_REQUIRED_APPROVALS);
    if required_approvals == 0 {
        return Err(BundleError::InvalidRule {
            rule: rule.name,
            message: "required_approvals must be at least 1".to_string(),
        });
    }
    let matcher = if is_glob_pattern(&rule.match_pattern) {
        let glob = Glob::new(&rule.match_pattern).map_err(|err| BundleError::InvalidGlob {
            rule: rule.name.clone(),
            pattern: rule.match_pattern.clone(),
            message: err.to_string(),
        })?;
        RuleMatcher::Glob {
            pattern: rule.match_pattern,
            matcher: glob.compile_matcher(),
        }
    } else {
        RuleMatcher::Exact(ToolName::new(rule.match_pattern))
    };
    Ok(CompiledRule {
        index,
        name: RuleName::new(rule.name),
        matcher,
        predicates: rule.where_clause.unwrap_or_default().compile(),
        action: rule.action,
        reason: rule.reason,
        required_approvals,
        approver_group: rule.approver_group,
    })
}

/// Returns true when the pattern contains glob metacharacters.
fn is_glob_pattern(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, reason = "Test-only assertions.")]

    use super::BundleError;
    use super::CompiledBundle;
    use super::Predicate;
    use super::RuleAction;
    use crate::core::ToolName;

    const SAMPLE: &str = r#"
version: v1
defaults:
  decision: deny
rules:
  - name: Allow intranet HTTP
    match: net.http
    where:
      host_in: ["intranet.api"]
    action: allow
  - name: Audit all fs
    match: "fs.*"
    action: approval
    required_approvals: 2
    approver_group: sec-ops
"#;

    #[test]
    fn compiles_exact_and_glob_rules() {
        let bundle = CompiledBundle::compile(SAMPLE.as_bytes(), None).unwrap();
        assert_eq!(bundle.version.as_str(), "v1");
        assert_eq!(bundle.rules.len(), 2);
        assert_eq!(bundle.default_action, RuleAction::Deny);
        assert_eq!(
            bundle.rules[0].predicates,
            vec![Predicate::HostIn(vec!["intranet.api".to_string()])]
        );
        assert_eq!(bundle.rules[1].required_approvals, 2);
    }

    #[test]
    fn candidates_prefer_exact_before_glob() {
        let yaml = r#"
rules:
  - name: glob first in file
    match: "fs.*"
    action: deny
  - name: exact later in file
    match: fs.write
    action: allow
"#;
        let bundle = CompiledBundle::compile(yaml.as_bytes(), None).unwrap();
        let candidates = bundle.candidates(&ToolName::new("fs.write"));
        assert_eq!(candidates, vec![1, 0]);
    }

    #[test]
    fn unknown_predicate_fails_at_load() {
        let yaml = r#"
rules:
  - name: bad
    match: net.http
    where:
      hostname_in: ["x"]
    action: allow
"#;
        let err = CompiledBundle::compile(yaml.as_bytes(), None).unwrap_err();
        assert!(matches!(err, BundleError::Parse(_)), "unexpected error {err}");
    }

    #[test]
    fn zero_quorum_is_rejected() {
        let yaml = r#"
rules:
  - name: bad quorum
    match: fs.write
    action: approval
    required_approvals: 0
"#;
        let err = CompiledBundle::compile(yaml.as_bytes(), None).unwrap_err();
        assert!(matches!(err, BundleError::InvalidRule { .. }), "unexpected error {err}");
    }

    #[test]
    fn missing_defaults_fail_closed() {
        let yaml = "rules: []\n";
        let bundle = CompiledBundle::compile(yaml.as_bytes(), None).unwrap();
        assert_eq!(bundle.default_action, RuleAction::Deny);
    }

    #[test]
    fn version_falls_back_to_digest() {
        let yaml = "rules: []\n";
        let bundle = CompiledBundle::compile(yaml.as_bytes(), None).unwrap();
        assert!(bundle.version.as_str().starts_with("sha256-"));
    }
}
