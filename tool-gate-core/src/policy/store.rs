// tool-gate-core/src/policy/store.rs
// ============================================================================
// Module: Policy Bundle Store
// Description: Versioned bundle registry with signature gating and rollout.
// Purpose: Hold immutable compiled bundles and swap pointers atomically.
// Dependencies: serde, ed25519-dalek (via signature module)
// ============================================================================

//! ## Overview
//! The bundle store owns every loaded bundle version plus the single rollout
//! row. Bundles are verified and compiled once at load; readers take an
//! `Arc` snapshot for the duration of one request and writers install new
//! versions under a write lock, so an apply is observed atomically. Applied
//! versions are also copied into an on-disk versions directory
//! (`<version>.yaml` + `<version>.yaml.sig`) when one is configured.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::RwLock;

use serde::Serialize;
use thiserror::Error;

use crate::core::BundleVersion;
use crate::core::Clock;
use crate::core::TenantId;
use crate::policy::bundle::BundleError;
use crate::policy::bundle::CompiledBundle;
use crate::policy::rollout::Rollout;
use crate::policy::signature::SignatureError;
use crate::policy::signature::SignatureFile;
use crate::policy::signature::verify_bundle;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Bundle store failures.
#[derive(Debug, Error)]
pub enum BundleStoreError {
    /// Signature missing while signatures are required.
    #[error("bundle signature required but missing")]
    MissingSignature,
    /// Signature present but invalid.
    #[error(transparent)]
    Signature(#[from] SignatureError),
    /// Bundle malformed or over limits.
    #[error(transparent)]
    Bundle(#[from] BundleError),
    /// Version id already registered with different content.
    #[error("version '{0}' already exists with different content")]
    VersionConflict(BundleVersion),
    /// Version id not registered.
    #[error("version '{0}' is not registered")]
    UnknownVersion(BundleVersion),
    /// Version id contains characters unsafe for persistence.
    #[error("version id '{0}' contains invalid characters")]
    InvalidVersionId(String),
    /// Canary percentage outside `0..=100`.
    #[error("canary percent {0} outside 0..=100")]
    InvalidCanaryPercent(u8),
    /// Versions directory I/O failure.
    #[error("bundle store io error: {0}")]
    Io(String),
    /// Interior lock poisoned by a panicked writer.
    #[error("bundle store lock poisoned")]
    LockPoisoned,
}

// ============================================================================
// SECTION: Apply Strategy
// ============================================================================

/// Rollout strategy for a bundle apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyStrategy {
    /// Install as the active version for all tenants; clears any canary.
    Active,
    /// Stage as canary for the given percentage of tenants.
    CanaryPercent(u8),
    /// Pin the listed tenants to the new version; rollout row unchanged.
    Explicit(Vec<TenantId>),
}

/// Result of a successful apply.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
    /// Registered version id.
    pub version: BundleVersion,
    /// SHA-256 hex digest of the bundle bytes.
    pub sha256: String,
    /// Strategy label for audit records.
    pub strategy: String,
}

/// Read-only view of the rollout row.
#[derive(Debug, Clone, Serialize)]
pub struct RolloutStatus {
    /// Version served by default.
    pub active_version: BundleVersion,
    /// Staged canary version, if any.
    pub canary_version: Option<BundleVersion>,
    /// Canary percentage.
    pub canary_percent: u8,
    /// Bucketing seed.
    pub seed: u64,
    /// Number of explicit tenant pins.
    pub tenant_pins: usize,
    /// All registered version ids.
    pub versions: Vec<BundleVersion>,
}

// ============================================================================
// SECTION: Store Configuration
// ============================================================================

/// Bundle store configuration.
#[derive(Debug, Clone, Default)]
pub struct BundleStoreConfig {
    /// Base64 Ed25519 public key used to verify bundle signatures.
    pub public_key_b64: Option<String>,
    /// Reject unsigned or invalidly signed bundles when set.
    pub require_signature: bool,
    /// Directory receiving `<version>.yaml` + `.yaml.sig` copies.
    pub versions_dir: Option<PathBuf>,
    /// Bucketing seed for canary resolution.
    pub seed: u64,
}

// ============================================================================
// SECTION: Bundle Store
// ============================================================================

/// Interior state guarded by one lock so swaps are observed atomically.
struct StoreState {
    /// Compiled bundles keyed by version id.
    versions: HashMap<BundleVersion, Arc<CompiledBundle>>,
    /// Single rollout row.
    rollout: Rollout,
}

/// Versioned bundle registry with staged rollout.
pub struct BundleStore {
    /// Store configuration.
    config: BundleStoreConfig,
    /// Clock for generated version stamps.
    clock: Arc<dyn Clock>,
    /// Guarded registry and rollout row.
    state: RwLock<StoreState>,
}

impl BundleStore {
    /// Bootstraps the store with an initial bundle that becomes active.
    ///
    /// # Errors
    ///
    /// Returns [`BundleStoreError`] when verification or compilation fails.
    pub fn bootstrap(
        config: BundleStoreConfig,
        clock: Arc<dyn Clock>,
        bundle_bytes: &[u8],
        signature: Option<&SignatureFile>,
    ) -> Result<Self, BundleStoreError> {
        let compiled = Self::verify_and_compile(&config, bundle_bytes, signature, None)?;
        let version = compiled.version.clone();
        let mut versions = HashMap::new();
        versions.insert(version.clone(), Arc::new(compiled));
        Ok(Self {
            clock,
            state: RwLock::new(StoreState {
                versions,
                rollout: Rollout::all_active(version, config.seed),
            }),
            config,
        })
    }

    /// Returns the bundle snapshot serving the given tenant.
    ///
    /// # Errors
    ///
    /// Returns [`BundleStoreError::LockPoisoned`] when the interior lock is
    /// poisoned; the resolved version always exists by construction.
    pub fn snapshot_for(&self, tenant: &TenantId) -> Result<Arc<CompiledBundle>, BundleStoreError> {
        let state = self.state.read().map_err(|_| BundleStoreError::LockPoisoned)?;
        let version = state.rollout.resolve(tenant).clone();
        state
            .versions
            .get(&version)
            .cloned()
            .ok_or(BundleStoreError::UnknownVersion(version))
    }

    /// Returns a registered bundle by version.
    ///
    /// # Errors
    ///
    /// Returns [`BundleStoreError::UnknownVersion`] when absent.
    pub fn bundle(&self, version: &BundleVersion) -> Result<Arc<CompiledBundle>, BundleStoreError> {
        let state = self.state.read().map_err(|_| BundleStoreError::LockPoisoned)?;
        state
            .versions
            .get(version)
            .cloned()
            .ok_or_else(|| BundleStoreError::UnknownVersion(version.clone()))
    }

    /// Verifies, registers, and rolls out a proposed bundle.
    ///
    /// Registration is idempotent for identical content; re-registering a
    /// version id with different bytes is a [`BundleStoreError::VersionConflict`].
    ///
    /// # Errors
    ///
    /// Returns [`BundleStoreError`] when verification, compilation,
    /// persistence, or rollout validation fails; the previous rollout stays
    /// in effect.
    pub fn apply(
        &self,
        bundle_bytes: &[u8],
        signature: Option<&SignatureFile>,
        strategy: ApplyStrategy,
    ) -> Result<ApplyOutcome, BundleStoreError> {
        if let ApplyStrategy::CanaryPercent(percent) = &strategy
            && *percent > 100
        {
            return Err(BundleStoreError::InvalidCanaryPercent(*percent));
        }
        let fallback = self.generated_version_stamp(bundle_bytes);
        let compiled =
            Self::verify_and_compile(&self.config, bundle_bytes, signature, Some(&fallback))?;
        let version = compiled.version.clone();
        validate_version_id(&version)?;

        let mut state = self.state.write().map_err(|_| BundleStoreError::LockPoisoned)?;
        if let Some(existing) = state.versions.get(&version) {
            if existing.sha256 != compiled.sha256 {
                return Err(BundleStoreError::VersionConflict(version));
            }
        } else {
            self.persist_version(&version, bundle_bytes, signature)?;
            state.versions.insert(version.clone(), Arc::new(compiled));
        }

        let strategy_label = match &strategy {
            ApplyStrategy::Active => {
                state.rollout.active_version = version.clone();
                state.rollout.canary_version = None;
                state.rollout.canary_percent = 0;
                "active".to_string()
            }
            ApplyStrategy::CanaryPercent(percent) => {
                state.rollout.canary_version = Some(version.clone());
                state.rollout.canary_percent = *percent;
                format!("canary_percent:{percent}")
            }
            ApplyStrategy::Explicit(tenants) => {
                for tenant in tenants {
                    state.rollout.pins.insert(tenant.clone(), version.clone());
                }
                format!("explicit:{}", tenants.len())
            }
        };
        let sha256 = state
            .versions
            .get(&version)
            .map(|bundle| bundle.sha256.clone())
            .unwrap_or_default();
        Ok(ApplyOutcome {
            version,
            sha256,
            strategy: strategy_label,
        })
    }

    /// Rolls the active pointer back to a previously registered version.
    ///
    /// # Errors
    ///
    /// Returns [`BundleStoreError::UnknownVersion`] when the target was never
    /// registered.
    pub fn rollback(&self, to_version: &BundleVersion) -> Result<(), BundleStoreError> {
        let mut state = self.state.write().map_err(|_| BundleStoreError::LockPoisoned)?;
        if !state.versions.contains_key(to_version) {
            return Err(BundleStoreError::UnknownVersion(to_version.clone()));
        }
        state.rollout.active_version = to_version.clone();
        state.rollout.canary_version = None;
        state.rollout.canary_percent = 0;
        Ok(())
    }

    /// Returns the rollout status view.
    ///
    /// # Errors
    ///
    /// Returns [`BundleStoreError::LockPoisoned`] when the lock is poisoned.
    pub fn status(&self) -> Result<RolloutStatus, BundleStoreError> {
        let state = self.state.read().map_err(|_| BundleStoreError::LockPoisoned)?;
        let mut versions: Vec<BundleVersion> = state.versions.keys().cloned().collect();
        versions.sort();
        Ok(RolloutStatus {
            active_version: state.rollout.active_version.clone(),
            canary_version: state.rollout.canary_version.clone(),
            canary_percent: state.rollout.canary_percent,
            seed: state.rollout.seed,
            tenant_pins: state.rollout.pins.len(),
            versions,
        })
    }

    /// Verifies signature gating and compiles bundle bytes.
    fn verify_and_compile(
        config: &BundleStoreConfig,
        bundle_bytes: &[u8],
        signature: Option<&SignatureFile>,
        fallback_version: Option<&str>,
    ) -> Result<CompiledBundle, BundleStoreError> {
        match (signature, config.public_key_b64.as_deref()) {
            (Some(sig), Some(public_key)) => {
                if let Err(err) = verify_bundle(bundle_bytes, sig, public_key) {
                    if config.require_signature {
                        return Err(err.into());
                    }
                    tracing::warn!(error = %err, "bundle signature invalid; continuing unsigned");
                }
            }
            _ if config.require_signature => return Err(BundleStoreError::MissingSignature),
            _ => {}
        }
        Ok(CompiledBundle::compile(bundle_bytes, fallback_version)?)
    }

    /// Generates a version stamp `<utc>_<sha-prefix>` for unnamed bundles.
    fn generated_version_stamp(&self, bundle_bytes: &[u8]) -> String {
        let digest = crate::hashing::sha256_hex(bundle_bytes);
        let stamp = self.clock.now().to_utc().format("%Y-%m-%d_%H%M%S");
        format!("{stamp}_{}", &digest[..4])
    }

    /// Copies a registered version into the versions directory.
    fn persist_version(
        &self,
        version: &BundleVersion,
        bundle_bytes: &[u8],
        signature: Option<&SignatureFile>,
    ) -> Result<(), BundleStoreError> {
        let Some(dir) = &self.config.versions_dir else {
            return Ok(());
        };
        fs::create_dir_all(dir).map_err(|err| BundleStoreError::Io(err.to_string()))?;
        let yaml_path = dir.join(format!("{version}.yaml"));
        fs::write(&yaml_path, bundle_bytes).map_err(|err| BundleStoreError::Io(err.to_string()))?;
        if let Some(sig) = signature {
            let sig_path = dir.join(format!("{version}.yaml.sig"));
            let json = sig.to_json()?;
            fs::write(&sig_path, json).map_err(|err| BundleStoreError::Io(err.to_string()))?;
        }
        Ok(())
    }
}

/// Restricts version ids to filesystem-safe characters.
fn validate_version_id(version: &BundleVersion) -> Result<(), BundleStoreError> {
    let valid = !version.as_str().is_empty()
        && version
            .as_str()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(BundleStoreError::InvalidVersionId(version.as_str().to_string()))
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
