// tool-gate-mcp/src/rbac.rs
// ============================================================================
// Module: RBAC Store
// Description: Role assignments and approver-group membership.
// Purpose: Answer authorization questions beyond what the token asserts.
// Dependencies: tool-gate-core (coordinator), serde_json
// ============================================================================

//! ## Overview
//! Role assignments live in the coordinating store keyed by
//! `rbac:{tenant}:{subject}` so every gateway instance sees the same grants.
//! The effective role set for a caller is the union of token-asserted roles
//! and stored assignments. Approver groups are configured statically and
//! gate who may decide a pending approval that names a group: all approvers
//! must be members.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;

use crate::identity::Role;
use tool_gate_config::ApprovalGroup;
use tool_gate_core::Coordinator;
use tool_gate_core::CoordinatorError;
use tool_gate_core::SubjectId;
use tool_gate_core::TenantId;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// RBAC store failures.
#[derive(Debug, Error)]
pub enum RbacError {
    /// Coordinating store failure.
    #[error(transparent)]
    Store(#[from] CoordinatorError),
}

// ============================================================================
// SECTION: Role Store
// ============================================================================

/// Durable role assignments behind the coordinating store.
#[derive(Clone)]
pub struct RbacStore {
    /// Coordinating store handle.
    coordinator: Arc<dyn Coordinator>,
}

impl RbacStore {
    /// Creates a store over the given coordinator.
    #[must_use]
    pub fn new(coordinator: Arc<dyn Coordinator>) -> Self {
        Self { coordinator }
    }

    /// Replaces the stored roles for a subject.
    ///
    /// # Errors
    ///
    /// Returns [`RbacError`] on store failure.
    pub async fn set_roles(
        &self,
        tenant: &TenantId,
        subject: &SubjectId,
        roles: &BTreeSet<Role>,
    ) -> Result<(), RbacError> {
        let labels: Vec<&str> = roles.iter().map(|role| role.as_str()).collect();
        let bytes = serde_json::to_vec(&labels)
            .map_err(|err| CoordinatorError::Corrupt(format!("rbac encode: {err}")))?;
        self.coordinator.put_ttl(&rbac_key(tenant, subject), bytes, None).await?;
        Ok(())
    }

    /// Reads the stored roles for a subject; missing records read as empty.
    ///
    /// # Errors
    ///
    /// Returns [`RbacError`] on store failure.
    pub async fn get_roles(
        &self,
        tenant: &TenantId,
        subject: &SubjectId,
    ) -> Result<BTreeSet<Role>, RbacError> {
        let Some(bytes) = self.coordinator.get(&rbac_key(tenant, subject)).await? else {
            return Ok(BTreeSet::new());
        };
        let labels: Vec<String> = serde_json::from_slice(&bytes)
            .map_err(|err| CoordinatorError::Corrupt(format!("rbac decode: {err}")))?;
        Ok(labels.iter().filter_map(|label| Role::parse(label)).collect())
    }

    /// Returns token roles unioned with stored assignments.
    ///
    /// # Errors
    ///
    /// Returns [`RbacError`] on store failure.
    pub async fn effective_roles(
        &self,
        tenant: &TenantId,
        subject: &SubjectId,
        token_roles: &BTreeSet<Role>,
    ) -> Result<BTreeSet<Role>, RbacError> {
        let mut roles = self.get_roles(tenant, subject).await?;
        roles.extend(token_roles.iter().copied());
        Ok(roles)
    }
}

fn rbac_key(tenant: &TenantId, subject: &SubjectId) -> String {
    format!("rbac:{tenant}:{subject}")
}

// ============================================================================
// SECTION: Approver Groups
// ============================================================================

/// Static approver-group membership from configuration.
#[derive(Debug, Clone, Default)]
pub struct ApproverDirectory {
    /// Members keyed by group name.
    groups: BTreeMap<String, BTreeSet<SubjectId>>,
}

impl ApproverDirectory {
    /// Builds the directory from configured groups.
    #[must_use]
    pub fn from_config(groups: &[ApprovalGroup]) -> Self {
        let mut out = BTreeMap::new();
        for group in groups {
            let members: BTreeSet<SubjectId> =
                group.members.iter().map(|member| SubjectId::new(member.clone())).collect();
            out.insert(group.name.clone(), members);
        }
        Self { groups: out }
    }

    /// Returns true when the subject may decide approvals for the group.
    ///
    /// An unknown group has no members, so nobody qualifies; approvals that
    /// name no group are constrained only by the `approver` role.
    #[must_use]
    pub fn is_member(&self, group: Option<&str>, subject: &SubjectId) -> bool {
        match group {
            None => true,
            Some(name) => self
                .groups
                .get(name)
                .is_some_and(|members| members.contains(subject)),
        }
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
