// tool-gate-core/src/policy/rollout.rs
// ============================================================================
// Module: Staged Rollout
// Description: Deterministic tenant-to-bundle-version resolution.
// Purpose: Resolve explicit pins, canary buckets, and the active default.
// Dependencies: serde, sha2
// ============================================================================

//! ## Overview
//! Rollout maps each tenant to a bundle version: an explicit pin wins, then
//! the canary version when the tenant's stable bucket falls below
//! `canary_percent`, then the active version. Bucketing hashes
//! `"{seed}:{tenant}"` with SHA-256 and maps the first two bytes onto
//! `0..100`, so the mapping is a pure function of the tenant and identical
//! across processes.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::core::BundleVersion;
use crate::core::TenantId;
use crate::hashing::sha256_bytes;

// ============================================================================
// SECTION: Rollout State
// ============================================================================

/// Single-row rollout state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rollout {
    /// Version served by default.
    pub active_version: BundleVersion,
    /// Version served to the canary bucket, if staged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canary_version: Option<BundleVersion>,
    /// Share of tenants in the canary bucket, `0..=100`.
    pub canary_percent: u8,
    /// Seed for stable tenant bucketing.
    pub seed: u64,
    /// Explicit per-tenant pins; these win over canary and active.
    #[serde(default)]
    pub pins: BTreeMap<TenantId, BundleVersion>,
}

impl Rollout {
    /// Creates a rollout serving one version to every tenant.
    #[must_use]
    pub fn all_active(active_version: BundleVersion, seed: u64) -> Self {
        Self {
            active_version,
            canary_version: None,
            canary_percent: 0,
            seed,
            pins: BTreeMap::new(),
        }
    }

    /// Resolves the bundle version for a tenant.
    #[must_use]
    pub fn resolve(&self, tenant: &TenantId) -> &BundleVersion {
        if let Some(pinned) = self.pins.get(tenant) {
            return pinned;
        }
        if let Some(canary) = &self.canary_version
            && self.canary_percent > 0
            && stable_bucket(self.seed, tenant) < u64::from(self.canary_percent)
        {
            return canary;
        }
        &self.active_version
    }
}

/// Maps a tenant onto a stable bucket in `0..100`.
///
/// The first two digest bytes, big-endian, mod 100; deployments that ported
/// their rollout state rely on this exact reduction.
#[must_use]
pub fn stable_bucket(seed: u64, tenant: &TenantId) -> u64 {
    let digest = sha256_bytes(format!("{seed}:{tenant}").as_bytes());
    let prefix = [digest[0], digest[1]];
    u64::from(u16::from_be_bytes(prefix)) % 100
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "Test-only assertions.")]

    use super::Rollout;
    use super::stable_bucket;
    use crate::core::BundleVersion;
    use crate::core::TenantId;

    fn rollout_with_canary(percent: u8) -> Rollout {
        let mut rollout = Rollout::all_active(BundleVersion::new("v1"), 42);
        rollout.canary_version = Some(BundleVersion::new("v2"));
        rollout.canary_percent = percent;
        rollout
    }

    #[test]
    fn bucketing_is_deterministic() {
        let tenant = TenantId::new("acme");
        assert_eq!(stable_bucket(42, &tenant), stable_bucket(42, &tenant));
        assert!(stable_bucket(42, &tenant) < 100);
    }

    #[test]
    fn seed_changes_mapping() {
        // Over many tenants, at least one must land in a different bucket.
        let moved = (0..64).any(|n| {
            let tenant = TenantId::new(format!("tenant-{n}"));
            stable_bucket(1, &tenant) != stable_bucket(2, &tenant)
        });
        assert!(moved);
    }

    #[test]
    fn pin_wins_over_canary_and_active() {
        let mut rollout = rollout_with_canary(100);
        rollout.pins.insert(TenantId::new("pinned"), BundleVersion::new("v9"));
        assert_eq!(rollout.resolve(&TenantId::new("pinned")).as_str(), "v9");
    }

    #[test]
    fn canary_split_respects_percent() {
        let rollout = rollout_with_canary(10);
        for n in 0..256 {
            let tenant = TenantId::new(format!("tenant-{n}"));
            let expected = if stable_bucket(42, &tenant) < 10 { "v2" } else { "v1" };
            assert_eq!(rollout.resolve(&tenant).as_str(), expected, "tenant {tenant}");
        }
    }

    #[test]
    fn zero_percent_never_serves_canary() {
        let rollout = rollout_with_canary(0);
        for n in 0..64 {
            let tenant = TenantId::new(format!("tenant-{n}"));
            assert_eq!(rollout.resolve(&tenant).as_str(), "v1");
        }
    }

    #[test]
    fn hundred_percent_always_serves_canary() {
        let rollout = rollout_with_canary(100);
        for n in 0..64 {
            let tenant = TenantId::new(format!("tenant-{n}"));
            assert_eq!(rollout.resolve(&tenant).as_str(), "v2");
        }
    }
}
