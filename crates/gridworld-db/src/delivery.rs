//! Lock-guarded consumption of due deliveries.
//!
//! Each due family is claimed from the fertile queue, then processed under
//! `lock:family:{id}`:
//!
//! ```text
//! Idle -> LockRequested -> Locked -> Processing -> Released
//!              |
//!              +-> LockDenied -> Backoff -> LockRequested
//!                                   |
//!                                   +-> GivenUp (missed)
//! ```
//!
//! Backoff after attempt `n` (0-based) is `retry_delay * multiplier^n`. A
//! given-up family, or one whose handler failed, lands in
//! `deliveries:missed` and is not requeued.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use gridworld_types::EntityId;
use uuid::Uuid;

use crate::adapter::StorageAdapter;
use crate::entity_store::EntityError;
use crate::fertile_queue::FertileQueue;
use crate::keys;

/// Errors a delivery handler may report.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// An entity store precondition failed while applying the outcome.
    #[error("entity store error: {0}")]
    Entity(#[from] EntityError),

    /// The handler refused the delivery.
    #[error("delivery rejected: {0}")]
    Rejected(String),
}

/// Applies the domain outcome of a delivery while its lock is held.
pub trait DeliveryHandler: Send + Sync {
    /// Process the delivery for `family`.
    fn deliver(&self, family: EntityId) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

/// Lock and retry parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeliveryPolicy {
    /// How long a lock survives if its holder dies.
    pub lock_ttl: Duration,
    /// Delay after the first denied attempt.
    pub retry_delay: Duration,
    /// Growth factor applied to the delay per attempt.
    pub multiplier: f64,
    /// Lock attempts before the delivery is given up.
    pub max_attempts: u32,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(5),
            retry_delay: Duration::from_millis(50),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

impl DeliveryPolicy {
    /// Delay before retrying after the 0-based `attempt` was denied.
    /// Saturates instead of overflowing for absurd multipliers.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(self.retry_delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
    }
}

/// Result of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The handler ran to completion under the lock.
    Delivered,
    /// The lock was never obtained. The family was recorded as missed.
    Missed {
        /// Lock attempts made.
        attempts: u32,
    },
    /// The handler ran but failed. The family was recorded as missed.
    Failed(String),
}

/// Totals of one [`DeliveryCoordinator::drain_due`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Per-family outcomes in claim order.
    pub outcomes: Vec<(EntityId, DeliveryOutcome)>,
}

impl DrainReport {
    fn count(&self, pred: impl Fn(&DeliveryOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, outcome)| pred(outcome)).count()
    }

    /// Deliveries that completed.
    pub fn delivered(&self) -> usize {
        self.count(|o| matches!(o, DeliveryOutcome::Delivered))
    }

    /// Deliveries given up after lock contention.
    pub fn missed(&self) -> usize {
        self.count(|o| matches!(o, DeliveryOutcome::Missed { .. }))
    }

    /// Deliveries whose handler failed.
    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, DeliveryOutcome::Failed(_)))
    }
}

/// Claims due families and runs deliveries under per-family locks.
pub struct DeliveryCoordinator {
    adapter: Arc<StorageAdapter>,
    queue: FertileQueue,
    policy: DeliveryPolicy,
}

impl DeliveryCoordinator {
    /// Coordinator draining `queue` through `adapter` locks.
    pub const fn new(adapter: Arc<StorageAdapter>, queue: FertileQueue, policy: DeliveryPolicy) -> Self {
        Self { adapter, queue, policy }
    }

    /// The policy in force.
    pub const fn policy(&self) -> &DeliveryPolicy {
        &self.policy
    }

    /// Claim every family due on or before `today` and deliver each.
    pub async fn drain_due<H: DeliveryHandler>(&self, today: NaiveDate, handler: &H) -> DrainReport {
        let mut report = DrainReport::default();
        loop {
            let family = match self.queue.pop_due(today).await {
                Ok(Some(family)) => family,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Fertile queue unavailable, stopping drain");
                    break;
                }
            };
            let outcome = self.deliver(family, handler).await;
            report.outcomes.push((family, outcome));
        }
        if !report.outcomes.is_empty() {
            tracing::info!(
                %today,
                delivered = report.delivered(),
                missed = report.missed(),
                failed = report.failed(),
                "Drained due deliveries"
            );
        }
        report
    }

    /// Run `handler` for `family` under its lock, retrying with backoff
    /// while the lock is held elsewhere.
    pub async fn deliver<H: DeliveryHandler>(&self, family: EntityId, handler: &H) -> DeliveryOutcome {
        let key = keys::family_lock(family);
        let token = Uuid::new_v4().to_string();

        let mut attempt = 0_u32;
        loop {
            if self.acquire(&key, &token).await {
                break;
            }
            attempt = attempt.saturating_add(1);
            if attempt >= self.policy.max_attempts {
                tracing::warn!(family = %family, attempts = attempt, "Delivery lock never obtained");
                self.record_missed(family).await;
                return DeliveryOutcome::Missed { attempts: attempt };
            }
            let delay = self.policy.backoff(attempt.saturating_sub(1));
            tracing::debug!(family = %family, attempt, delay_ms = delay.as_millis(), "Delivery lock denied, backing off");
            tokio::time::sleep(delay).await;
        }

        let outcome = match handler.deliver(family).await {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(e) => {
                tracing::error!(family = %family, error = %e, "Delivery handler failed");
                self.record_missed(family).await;
                DeliveryOutcome::Failed(e.to_string())
            }
        };

        match self.adapter.release_lock(&key, &token).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(family = %family, "Delivery lock expired before release"),
            Err(e) => tracing::warn!(family = %family, error = %e, "Failed to release delivery lock"),
        }
        outcome
    }

    async fn acquire(&self, key: &str, token: &str) -> bool {
        match self.adapter.try_lock(key, token, self.policy.lock_ttl).await {
            Ok(acquired) => acquired,
            Err(e) => {
                tracing::warn!(key, error = %e, "Lock request failed, treating as denied");
                false
            }
        }
    }

    async fn record_missed(&self, family: EntityId) {
        if let Err(e) = self.adapter.sadd(keys::MISSED_DELIVERIES, &family.to_string()).await {
            tracing::error!(family = %family, error = %e, "Failed to record missed delivery");
        }
    }

    /// Families whose delivery was given up and awaits operator action.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AdapterError`] if the adapter cannot serve the call.
    pub async fn missed(&self) -> Result<Vec<EntityId>, crate::AdapterError> {
        let raw = self.adapter.smembers(keys::MISSED_DELIVERIES).await?;
        let mut ids: Vec<EntityId> = raw.iter().filter_map(|m| m.parse().ok()).collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Drop `family` from the missed set once an operator has handled it.
    ///
    /// # Errors
    ///
    /// Returns [`crate::AdapterError`] if the adapter cannot serve the call.
    pub async fn acknowledge_missed(&self, family: EntityId) -> Result<bool, crate::AdapterError> {
        self.adapter.srem(keys::MISSED_DELIVERIES, &family.to_string()).await
    }
}
