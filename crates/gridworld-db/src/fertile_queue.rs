//! Due-time priority queue of expecting families.
//!
//! The queue is a sorted set (`queue:fertile`) scored by the delivery day,
//! paired with a membership set (`queue:fertile:members`). Enqueue and pop
//! each run as one indivisible adapter operation, so two workers can never
//! schedule the same family twice or both claim the same delivery.

use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use gridworld_types::EntityId;

use crate::adapter::{StorageAdapter, members_key};
use crate::error::AdapterError;
use crate::keys;

/// Queue score for a calendar day.
pub fn day_score(day: NaiveDate) -> f64 {
    f64::from(day.num_days_from_ce())
}

/// Atomic due-time queue of family ids.
#[derive(Clone)]
pub struct FertileQueue {
    adapter: Arc<StorageAdapter>,
    key: String,
}

impl FertileQueue {
    /// Queue stored under the standard key.
    pub fn new(adapter: Arc<StorageAdapter>) -> Self {
        Self::with_key(adapter, keys::FERTILE_QUEUE)
    }

    /// Queue stored under a custom key (its membership set is
    /// `{key}:members`).
    pub fn with_key(adapter: Arc<StorageAdapter>, key: &str) -> Self {
        Self {
            adapter,
            key: key.to_owned(),
        }
    }

    /// Sorted-set key of the queue.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Schedule `family` for `due`. Returns `false` (and keeps the existing
    /// score) if the family is already queued.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] if the adapter cannot serve the call.
    pub async fn enqueue(&self, family: EntityId, due: NaiveDate) -> Result<bool, AdapterError> {
        self.enqueue_score(family, day_score(due)).await
    }

    /// Schedule `family` with a raw score.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] if the adapter cannot serve the call.
    pub async fn enqueue_score(&self, family: EntityId, score: f64) -> Result<bool, AdapterError> {
        let added = self
            .adapter
            .atomic_enqueue(&self.key, &family.to_string(), score)
            .await?;
        tracing::debug!(family = %family, score, added, "Fertile queue enqueue");
        Ok(added)
    }

    /// Claim the earliest family due on or before `today`.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] if the adapter cannot serve the call.
    pub async fn pop_due(&self, today: NaiveDate) -> Result<Option<EntityId>, AdapterError> {
        self.pop_due_score(day_score(today)).await
    }

    /// Claim the earliest family with score `<= now`. Members that are not
    /// valid ids are discarded with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] if the adapter cannot serve the call.
    pub async fn pop_due_score(&self, now: f64) -> Result<Option<EntityId>, AdapterError> {
        while let Some(member) = self.adapter.atomic_pop_due(&self.key, now).await? {
            match member.parse::<EntityId>() {
                Ok(family) => return Ok(Some(family)),
                Err(e) => tracing::warn!(member, error = %e, "Dropping malformed fertile queue member"),
            }
        }
        Ok(None)
    }

    /// Remove `family` from the queue, returning whether it was queued.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] if the adapter cannot serve the call.
    pub async fn remove(&self, family: EntityId) -> Result<bool, AdapterError> {
        let member = family.to_string();
        let was_queued = self.adapter.zrem(&self.key, &member).await?;
        self.adapter.srem(&members_key(&self.key), &member).await?;
        Ok(was_queued)
    }

    /// Number of queued families.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] if the adapter cannot serve the call.
    pub async fn len(&self) -> Result<u64, AdapterError> {
        self.adapter.scard(&members_key(&self.key)).await
    }

    /// Whether nothing is queued.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] if the adapter cannot serve the call.
    pub async fn is_empty(&self) -> Result<bool, AdapterError> {
        Ok(self.len().await? == 0)
    }

    /// Whether `family` is queued.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] if the adapter cannot serve the call.
    pub async fn contains(&self, family: EntityId) -> Result<bool, AdapterError> {
        self.adapter
            .sismember(&members_key(&self.key), &family.to_string())
            .await
    }

    /// Every queued member with its score, earliest first. Raw strings are
    /// returned so malformed members remain visible to the auditor.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] if the adapter cannot serve the call.
    pub async fn entries(&self) -> Result<Vec<(String, f64)>, AdapterError> {
        self.adapter
            .zrange_by_score(&self.key, f64::NEG_INFINITY, f64::INFINITY)
            .await
    }

    /// Raw members of the membership set.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] if the adapter cannot serve the call.
    pub async fn members(&self) -> Result<Vec<String>, AdapterError> {
        self.adapter.smembers(&members_key(&self.key)).await
    }

    /// Move a queued family from `from` to `to`, keeping its score.
    /// Returns whether `from` was queued.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError`] if the adapter cannot serve the call.
    pub async fn remap(&self, from: EntityId, to: EntityId) -> Result<bool, AdapterError> {
        let from_member = from.to_string();
        let score = self
            .entries()
            .await?
            .into_iter()
            .find(|(member, _)| *member == from_member)
            .map(|(_, score)| score);
        let Some(score) = score else {
            return Ok(false);
        };
        self.remove(from).await?;
        self.enqueue_score(to, score).await?;
        Ok(true)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    fn make_queue() -> FertileQueue {
        FertileQueue::new(Arc::new(StorageAdapter::in_memory()))
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(4010, 3, d).unwrap()
    }

    #[tokio::test]
    async fn second_enqueue_keeps_first_score() {
        let queue = make_queue();
        let family = EntityId::Durable(11);
        assert!(queue.enqueue(family, day(5)).await.unwrap());
        assert!(!queue.enqueue(family, day(20)).await.unwrap());

        let entries = queue.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries.first().map(|(_, s)| *s), Some(day_score(day(5))));
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn pop_due_never_returns_future_members() {
        let queue = make_queue();
        queue.enqueue(EntityId::Durable(1), day(10)).await.unwrap();
        queue.enqueue(EntityId::Durable(2), day(3)).await.unwrap();

        assert_eq!(queue.pop_due(day(2)).await.unwrap(), None);
        assert_eq!(queue.pop_due(day(9)).await.unwrap(), Some(EntityId::Durable(2)));
        assert_eq!(queue.pop_due(day(9)).await.unwrap(), None);
        assert_eq!(queue.pop_due(day(10)).await.unwrap(), Some(EntityId::Durable(1)));
        assert_eq!(queue.pop_due(day(30)).await.unwrap(), None);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn popped_member_can_be_enqueued_again() {
        let queue = make_queue();
        let family = EntityId::Durable(4);
        queue.enqueue(family, day(1)).await.unwrap();
        assert_eq!(queue.pop_due(day(1)).await.unwrap(), Some(family));
        assert!(queue.enqueue(family, day(2)).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_pops_claim_once() {
        let queue = make_queue();
        queue.enqueue(EntityId::Durable(9), day(1)).await.unwrap();

        let (a, b) = tokio::join!(queue.pop_due(day(1)), queue.pop_due(day(1)));
        let claimed: Vec<_> = [a.unwrap(), b.unwrap()].into_iter().flatten().collect();
        assert_eq!(claimed, vec![EntityId::Durable(9)]);
    }

    #[tokio::test]
    async fn concurrent_pops_across_tasks_claim_once() {
        let queue = make_queue();
        queue.enqueue(EntityId::Durable(9), day(1)).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.pop_due(day(1)).await.unwrap() })
            })
            .collect();
        let mut claimed = Vec::new();
        for handle in handles {
            claimed.extend(handle.await.unwrap());
        }
        assert_eq!(claimed, vec![EntityId::Durable(9)]);
    }

    #[tokio::test]
    async fn remap_keeps_score() {
        let queue = make_queue();
        let from = EntityId::Provisional(5);
        let to = EntityId::Durable(500);
        queue.enqueue(from, day(7)).await.unwrap();

        assert!(queue.remap(from, to).await.unwrap());
        assert!(!queue.contains(from).await.unwrap());
        assert!(queue.contains(to).await.unwrap());
        assert_eq!(queue.pop_due(day(7)).await.unwrap(), Some(to));
    }

    #[tokio::test]
    async fn remove_clears_both_structures() {
        let queue = make_queue();
        let family = EntityId::Durable(3);
        queue.enqueue(family, day(7)).await.unwrap();
        assert!(queue.remove(family).await.unwrap());
        assert!(queue.entries().await.unwrap().is_empty());
        assert!(queue.members().await.unwrap().is_empty());
    }
}
