// tool-gate-core/src/coordinator.rs
// ============================================================================
// Module: Coordinating Store
// Description: Capability set for shared counters, records, and pub/sub.
// Purpose: Back rate buckets, budgets, approvals, and wakeups with one seam.
// Dependencies: async-trait, tokio, serde
// ============================================================================

//! ## Overview
//! Rate buckets, budget counters, approval records, and approval wakeups all
//! sit behind a small capability set: keyed byte records with TTL and
//! compare-and-swap, a bounded atomic integer increment, and named pub/sub
//! channels. The in-process implementation here keeps the core testable on a
//! single machine; a shared store implementation with the same atomicity
//! contract scales it horizontally.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::core::Clock;
use crate::core::Timestamp;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Buffered messages per pub/sub channel before slow subscribers lag.
const CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Coordinating store failures (`StoreUnavailable` to callers).
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The store is unreachable or an operation failed midway.
    #[error("coordinating store unavailable: {0}")]
    Unavailable(String),
    /// A stored record could not be decoded.
    #[error("coordinating store record corrupt: {0}")]
    Corrupt(String),
}

// ============================================================================
// SECTION: Capability Traits
// ============================================================================

/// Result of a bounded increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrOutcome {
    /// Whether the increment was applied.
    pub applied: bool,
    /// Counter value after the operation (unchanged when not applied).
    pub value: i64,
}

/// Receiver half of a pub/sub subscription.
#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next message; `None` when the channel is gone.
    async fn recv(&mut self) -> Option<String>;
}

/// Shared coordination capabilities.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Reads a record, honoring TTL expiry.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoordinatorError>;

    /// Writes a record with an optional TTL.
    async fn put_ttl(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CoordinatorError>;

    /// Atomically replaces a record iff its current value equals `expected`
    /// (`None` = key absent). Returns whether the swap was applied.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, CoordinatorError>;

    /// Atomically adds `delta` to an integer counter, refusing increments
    /// that would push the value above `max`. Negative deltas clamp at zero.
    async fn incr_bounded(
        &self,
        key: &str,
        delta: i64,
        max: i64,
    ) -> Result<IncrOutcome, CoordinatorError>;

    /// Publishes a message on a named channel.
    async fn publish(&self, channel: &str, message: &str) -> Result<(), CoordinatorError>;

    /// Subscribes to a named channel. Subscribing before re-reading state is
    /// the caller's lost-wakeup discipline; the store only delivers messages
    /// published after this call.
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, CoordinatorError>;
}

// ============================================================================
// SECTION: In-Memory Implementation
// ============================================================================

/// One stored record with optional expiry.
#[derive(Debug, Clone)]
struct Record {
    /// Stored bytes.
    value: Vec<u8>,
    /// Absolute expiry instant, if any.
    expires_at: Option<Timestamp>,
}

/// Process-local coordinator for tests and single-node deployments.
#[derive(Clone)]
pub struct InMemoryCoordinator {
    /// Record map guarded by a mutex; every operation is one critical section,
    /// which is what gives CAS and bounded increments their atomicity.
    records: Arc<Mutex<HashMap<String, Record>>>,
    /// Live pub/sub channels.
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
    /// Clock for TTL arithmetic.
    clock: Arc<dyn Clock>,
}

impl InMemoryCoordinator {
    /// Creates an empty coordinator.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            channels: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    /// Reads a live record under the lock, dropping expired entries.
    fn get_live(records: &mut HashMap<String, Record>, key: &str, now: Timestamp) -> Option<Vec<u8>> {
        let expired = records
            .get(key)
            .is_some_and(|record| record.expires_at.is_some_and(|at| now >= at));
        if expired {
            records.remove(key);
            return None;
        }
        records.get(key).map(|record| record.value.clone())
    }

    /// Computes the absolute expiry for a TTL.
    fn expiry(&self, ttl: Option<Duration>) -> Option<Timestamp> {
        ttl.map(|ttl| {
            self.clock
                .now()
                .plus_millis(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
        })
    }

    /// Returns the sender for a channel, creating it on first use.
    fn channel(&self, name: &str) -> Result<broadcast::Sender<String>, CoordinatorError> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| CoordinatorError::Unavailable("channel map poisoned".to_string()))?;
        Ok(channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone())
    }
}

/// Broadcast-backed subscription.
struct BroadcastSubscription {
    /// Underlying receiver.
    receiver: broadcast::Receiver<String>,
}

#[async_trait]
impl Subscription for BroadcastSubscription {
    async fn recv(&mut self) -> Option<String> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                // A lagged subscriber missed messages; the caller re-reads
                // state after every wakeup, so skipping ahead is safe.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
impl Coordinator for InMemoryCoordinator {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoordinatorError> {
        let now = self.clock.now();
        let mut records = self
            .records
            .lock()
            .map_err(|_| CoordinatorError::Unavailable("record map poisoned".to_string()))?;
        Ok(Self::get_live(&mut records, key, now))
    }

    async fn put_ttl(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CoordinatorError> {
        let expires_at = self.expiry(ttl);
        let mut records = self
            .records
            .lock()
            .map_err(|_| CoordinatorError::Unavailable("record map poisoned".to_string()))?;
        records.insert(key.to_string(), Record { value, expires_at });
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<bool, CoordinatorError> {
        let now = self.clock.now();
        let expires_at = self.expiry(ttl);
        let mut records = self
            .records
            .lock()
            .map_err(|_| CoordinatorError::Unavailable("record map poisoned".to_string()))?;
        let current = Self::get_live(&mut records, key, now);
        let matches = match (current.as_deref(), expected) {
            (None, None) => true,
            (Some(current), Some(expected)) => current == expected,
            _ => false,
        };
        if matches {
            records.insert(key.to_string(), Record { value, expires_at });
        }
        Ok(matches)
    }

    async fn incr_bounded(
        &self,
        key: &str,
        delta: i64,
        max: i64,
    ) -> Result<IncrOutcome, CoordinatorError> {
        let now = self.clock.now();
        let mut records = self
            .records
            .lock()
            .map_err(|_| CoordinatorError::Unavailable("record map poisoned".to_string()))?;
        let current = match Self::get_live(&mut records, key, now) {
            Some(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|text| text.parse::<i64>().ok())
                .ok_or_else(|| CoordinatorError::Corrupt(format!("counter at '{key}'")))?,
            None => 0,
        };
        let next = current.saturating_add(delta).max(0);
        if delta > 0 && next > max {
            return Ok(IncrOutcome {
                applied: false,
                value: current,
            });
        }
        records.insert(
            key.to_string(),
            Record {
                value: next.to_string().into_bytes(),
                expires_at: None,
            },
        );
        Ok(IncrOutcome {
            applied: true,
            value: next,
        })
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), CoordinatorError> {
        // Send errors only mean nobody is subscribed; publishing is fire-and-forget.
        let _ = self.channel(channel)?.send(message.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, CoordinatorError> {
        Ok(Box::new(BroadcastSubscription {
            receiver: self.channel(channel)?.subscribe(),
        }))
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
