//! Consistency checks between derived sets and the entities behind them.
//!
//! The auditor recomputes each eligibility set and the fertile set from
//! entity fields with [`EligibilityRules`](crate::eligibility::EligibilityRules)
//! and diffs them against what the cache holds. It also checks that the
//! fertile queue's sorted set and membership set agree, that every queued
//! family still exists and is expecting, and that every expecting family is
//! either queued or recorded in `deliveries:missed`.
//!
//! Eligibility sets are enumerated from known settlements (stored
//! settlements plus every person's settlement), so a stray set keyed by a
//! settlement nobody references is not visited.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use gridworld_types::{EntityId, Family, Person};
use tokio::task::JoinHandle;

use crate::adapter::members_key;
use crate::error::AdapterError;
use crate::keys;
use crate::reconcile::PausableScheduler;
use crate::world_state::WorldState;

/// Raised by [`IntegrityAuditor::audit_on_init`].
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// The startup audit found problems and initialization must stop.
    #[error("integrity audit found {issues} issue(s) at startup")]
    IssuesAtStartup {
        /// Number of issues found.
        issues: usize,
    },

    /// The cache could not be read.
    #[error("audit could not read cache: {0}")]
    Adapter(#[from] AdapterError),
}

/// Which structures to check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuditScope {
    /// Everything below.
    #[default]
    All,
    /// `eligible:{sex}:{settlement}` sets.
    EligiblePersons,
    /// The `fertile:families` set.
    FertileFamilies,
    /// `queue:fertile` and its membership set.
    FertileQueue,
}

impl AuditScope {
    fn covers(self, other: Self) -> bool {
        self == Self::All || self == other
    }
}

/// One inconsistency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityIssue {
    /// `member` is in `key` but its entity says it should not be.
    UnexpectedMember {
        /// Derived set key.
        key: String,
        /// Offending member.
        member: String,
    },
    /// `member` should be in `key` but is not.
    MissingMember {
        /// Derived set key.
        key: String,
        /// Absent member.
        member: String,
    },
    /// A queued family is gone, not expecting, or not a valid id.
    OrphanQueueEntry {
        /// Queue member.
        member: String,
    },
    /// An expecting family is neither queued nor recorded as missed.
    UnqueuedExpectingFamily {
        /// Family id.
        member: String,
    },
    /// The queue's sorted set and membership set disagree about `member`.
    QueueMembershipMismatch {
        /// Queue member.
        member: String,
        /// Whether the member is in the sorted set (otherwise only in the
        /// membership set).
        in_queue: bool,
    },
}

/// Outcome of one audit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    /// Number of issues found.
    pub issues_found: usize,
    /// Every issue found.
    pub details: Vec<IntegrityIssue>,
    /// Whether the issues were repaired.
    pub repaired: bool,
}

impl AuditReport {
    /// Whether nothing was found.
    pub const fn is_clean(&self) -> bool {
        self.issues_found == 0
    }
}

/// Scans and optionally repairs derived state.
pub struct IntegrityAuditor {
    world: Arc<WorldState>,
}

impl IntegrityAuditor {
    /// Auditor over `world`.
    pub const fn new(world: Arc<WorldState>) -> Self {
        Self { world }
    }

    /// Check `scope` as of `today`; with `repair`, fix every issue found.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Adapter`] if a derived set cannot be read.
    pub async fn audit(&self, scope: AuditScope, repair: bool, today: NaiveDate) -> Result<AuditReport, AuditError> {
        let persons: HashMap<EntityId, Person> = self
            .world
            .persons
            .get_all()
            .await
            .into_iter()
            .map(|p| (p.id, p))
            .collect();
        let families = self.world.families.get_all().await;

        let mut details = Vec::new();
        if scope.covers(AuditScope::EligiblePersons) {
            details.extend(self.check_eligibility(&persons, today).await?);
        }
        if scope.covers(AuditScope::FertileFamilies) {
            details.extend(self.check_fertility(&persons, &families, today).await?);
        }
        if scope.covers(AuditScope::FertileQueue) {
            details.extend(self.check_queue(&families).await?);
        }

        let issues_found = details.len();
        let repaired = repair && issues_found > 0 && self.repair(&details, &families).await;
        if issues_found == 0 {
            tracing::debug!(?scope, "Integrity audit clean");
        } else {
            tracing::warn!(?scope, issues = issues_found, repaired, "Integrity audit found issues");
        }
        Ok(AuditReport {
            issues_found,
            details,
            repaired,
        })
    }

    /// Audit everything at startup. Fails when `fail_on_init` is set and
    /// any issue was found, even if it was repaired.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::IssuesAtStartup`] as described, or
    /// [`AuditError::Adapter`] if the cache cannot be read.
    pub async fn audit_on_init(&self, repair: bool, fail_on_init: bool, today: NaiveDate) -> Result<AuditReport, AuditError> {
        let report = self.audit(AuditScope::All, repair, today).await?;
        if fail_on_init && !report.is_clean() {
            return Err(AuditError::IssuesAtStartup {
                issues: report.issues_found,
            });
        }
        Ok(report)
    }

    /// Audit everything every `interval`, dated by `scheduler`.
    pub fn spawn_periodic(
        self: &Arc<Self>,
        interval: Duration,
        repair: bool,
        scheduler: Arc<dyn PausableScheduler>,
    ) -> JoinHandle<()> {
        let auditor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; the startup audit already ran.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = auditor.audit(AuditScope::All, repair, scheduler.today()).await {
                    tracing::error!(error = %e, "Periodic integrity audit failed");
                }
            }
        })
    }

    // =========================================================================
    // Checks
    // =========================================================================

    async fn check_eligibility(
        &self,
        persons: &HashMap<EntityId, Person>,
        today: NaiveDate,
    ) -> Result<Vec<IntegrityIssue>, AdapterError> {
        let rules = self.world.rules();
        let mut expected: BTreeMap<String, BTreeSet<String>> = self
            .world
            .eligibility_keys()
            .await
            .into_iter()
            .map(|key| (key, BTreeSet::new()))
            .collect();
        for person in persons.values() {
            if let Some(settlement) = person.settlement_id
                && rules.person_eligible(person, today)
            {
                expected
                    .entry(keys::eligible(person.sex, settlement))
                    .or_default()
                    .insert(person.id.to_string());
            }
        }

        let mut issues = Vec::new();
        for (key, want) in &expected {
            let have: BTreeSet<String> = self.world.adapter().smembers(key).await?.into_iter().collect();
            diff_set(key, want, &have, &mut issues);
        }
        Ok(issues)
    }

    async fn check_fertility(
        &self,
        persons: &HashMap<EntityId, Person>,
        families: &[Family],
        today: NaiveDate,
    ) -> Result<Vec<IntegrityIssue>, AdapterError> {
        let rules = self.world.rules();
        let want: BTreeSet<String> = families
            .iter()
            .filter(|family| {
                let wife = family.partner_b_id.and_then(|id| persons.get(&id));
                rules.family_fertile(family, wife, today)
            })
            .map(|family| family.id.to_string())
            .collect();
        let have: BTreeSet<String> = self
            .world
            .adapter()
            .smembers(keys::FERTILE_FAMILIES)
            .await?
            .into_iter()
            .collect();

        let mut issues = Vec::new();
        diff_set(keys::FERTILE_FAMILIES, &want, &have, &mut issues);
        Ok(issues)
    }

    async fn check_queue(&self, families: &[Family]) -> Result<Vec<IntegrityIssue>, AdapterError> {
        let queue = self.world.queue();
        let queued: BTreeSet<String> = queue.entries().await?.into_iter().map(|(member, _)| member).collect();
        let members: BTreeSet<String> = queue.members().await?.into_iter().collect();
        let expecting: BTreeSet<String> = families
            .iter()
            .filter(|f| f.is_expecting)
            .map(|f| f.id.to_string())
            .collect();

        let mut issues = Vec::new();
        for member in queued.symmetric_difference(&members) {
            issues.push(IntegrityIssue::QueueMembershipMismatch {
                member: member.clone(),
                in_queue: queued.contains(member),
            });
        }
        for member in queued.union(&members) {
            if !expecting.contains(member) {
                issues.push(IntegrityIssue::OrphanQueueEntry { member: member.clone() });
            }
        }
        let missed: BTreeSet<String> = self
            .world
            .adapter()
            .smembers(keys::MISSED_DELIVERIES)
            .await?
            .into_iter()
            .collect();
        for member in &expecting {
            if !queued.contains(member) && !members.contains(member) && !missed.contains(member) {
                issues.push(IntegrityIssue::UnqueuedExpectingFamily { member: member.clone() });
            }
        }
        Ok(issues)
    }

    // =========================================================================
    // Repair
    // =========================================================================

    async fn repair(&self, issues: &[IntegrityIssue], families: &[Family]) -> bool {
        let queue_key = self.world.queue().key().to_owned();
        let queue_members = members_key(&queue_key);
        let mut pipeline = self.world.adapter().pipeline();
        let mut requeue = Vec::new();

        for issue in issues {
            pipeline = match issue {
                IntegrityIssue::UnexpectedMember { key, member } => pipeline.srem(key, member),
                IntegrityIssue::MissingMember { key, member } => pipeline.sadd(key, member),
                IntegrityIssue::OrphanQueueEntry { member } => pipeline.zrem(&queue_key, member).srem(&queue_members, member),
                IntegrityIssue::QueueMembershipMismatch { member, in_queue: true } => pipeline.sadd(&queue_members, member),
                IntegrityIssue::UnqueuedExpectingFamily { member } => {
                    if let Some(family) = families.iter().find(|f| f.id.to_string() == *member) {
                        requeue.push(family.clone());
                    }
                    pipeline
                }
                IntegrityIssue::QueueMembershipMismatch { member, in_queue: false } => {
                    // A guard without a score blocks enqueue forever; drop it
                    // and requeue the family if it is still due.
                    if let Some(family) = families.iter().find(|f| f.id.to_string() == *member) {
                        requeue.push(family.clone());
                    }
                    pipeline.srem(&queue_members, member)
                }
            };
        }

        if let Err(e) = pipeline.exec().await {
            tracing::error!(error = %e, "Integrity repair failed");
            return false;
        }
        for family in requeue {
            let Some(due) = family.due_date.filter(|_| family.is_expecting) else {
                continue;
            };
            if let Err(e) = self.world.queue().enqueue(family.id, due).await {
                tracing::warn!(family = %family.id, error = %e, "Failed to requeue family during repair");
            }
        }
        tracing::info!(issues = issues.len(), "Integrity issues repaired");
        true
    }
}

fn diff_set(key: &str, want: &BTreeSet<String>, have: &BTreeSet<String>, issues: &mut Vec<IntegrityIssue>) {
    for member in have.difference(want) {
        issues.push(IntegrityIssue::UnexpectedMember {
            key: key.to_owned(),
            member: member.clone(),
        });
    }
    for member in want.difference(have) {
        issues.push(IntegrityIssue::MissingMember {
            key: key.to_owned(),
            member: member.clone(),
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use gridworld_types::{Settlement, Sex};

    use super::*;
    use crate::adapter::StorageAdapter;
    use crate::durable::{DurableStore, MemoryDurableStore};
    use crate::eligibility::EligibilityRules;
    use crate::reconcile::{ReconcileContext, ReconciliationEngine};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn today() -> NaiveDate {
        date(4020, 1, 1)
    }

    async fn make_loaded_world() -> Arc<WorldState> {
        let village = Settlement {
            id: EntityId::Durable(1),
            tile_id: 9,
            chunk_index: 0,
            housing_capacity: 10,
            food_stores: 50,
        };
        let mut him = Person::new(EntityId::Durable(2), Some(village.id), Sex::Male, date(3996, 1, 1));
        let mut her = Person::new(EntityId::Durable(3), Some(village.id), Sex::Female, date(3999, 1, 1));
        let lone = Person::new(EntityId::Durable(4), Some(village.id), Sex::Male, date(4001, 5, 5));
        let child = Person::new(EntityId::Durable(5), Some(village.id), Sex::Female, date(4015, 5, 5));
        him.family_id = Some(EntityId::Durable(6));
        her.family_id = Some(EntityId::Durable(6));
        let family = Family::new(EntityId::Durable(6), him.id, her.id, Some(village.id));
        let mut expecting = Family::new(EntityId::Durable(7), EntityId::Durable(8), EntityId::Durable(9), None);
        expecting.is_expecting = true;
        expecting.due_date = Some(date(4020, 4, 1));

        let durable = MemoryDurableStore::with_rows(vec![village], vec![him, her, lone, child], vec![family, expecting]);
        let world = Arc::new(WorldState::new(Arc::new(StorageAdapter::in_memory()), EligibilityRules::default()));
        let engine = ReconciliationEngine::new(Arc::clone(&world), Arc::new(DurableStore::Memory(durable)));
        engine
            .load_from_durable_store(&ReconcileContext::detached(today()))
            .await
            .unwrap();
        world
    }

    #[tokio::test]
    async fn freshly_loaded_state_is_clean() {
        let world = make_loaded_world().await;
        let auditor = IntegrityAuditor::new(world);
        let report = auditor.audit(AuditScope::All, false, today()).await.unwrap();
        assert_eq!(report, AuditReport::default());
        assert!(auditor.audit_on_init(false, true, today()).await.is_ok());
    }

    #[tokio::test]
    async fn detects_and_repairs_eligibility_drift() {
        let world = make_loaded_world().await;
        let key = keys::eligible(Sex::Male, EntityId::Durable(1));
        world.adapter().srem(&key, "4").await.unwrap();
        world.adapter().sadd(&key, "2").await.unwrap();
        let auditor = IntegrityAuditor::new(Arc::clone(&world));

        let report = auditor.audit(AuditScope::EligiblePersons, false, today()).await.unwrap();
        assert_eq!(report.issues_found, 2);
        assert!(!report.repaired);
        assert!(report.details.contains(&IntegrityIssue::UnexpectedMember {
            key: key.clone(),
            member: "2".to_owned(),
        }));
        assert!(report.details.contains(&IntegrityIssue::MissingMember {
            key: key.clone(),
            member: "4".to_owned(),
        }));

        let repaired = auditor.audit(AuditScope::EligiblePersons, true, today()).await.unwrap();
        assert!(repaired.repaired);
        assert_eq!(world.eligible_persons(Sex::Male, EntityId::Durable(1)).await, vec![EntityId::Durable(4)]);
        assert!(auditor.audit(AuditScope::All, false, today()).await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn fertile_set_drift_is_scoped() {
        let world = make_loaded_world().await;
        world.remove_fertile_family(EntityId::Durable(6)).await;
        let auditor = IntegrityAuditor::new(world);

        assert!(auditor.audit(AuditScope::FertileQueue, false, today()).await.unwrap().is_clean());
        let report = auditor.audit(AuditScope::FertileFamilies, false, today()).await.unwrap();
        assert_eq!(
            report.details,
            vec![IntegrityIssue::MissingMember {
                key: keys::FERTILE_FAMILIES.to_owned(),
                member: "6".to_owned(),
            }]
        );
    }

    #[tokio::test]
    async fn orphan_and_mismatched_queue_entries_are_repaired() {
        let world = make_loaded_world().await;
        let adapter = world.adapter();
        // Not expecting.
        world.queue().enqueue(EntityId::Durable(6), date(4020, 2, 1)).await.unwrap();
        // Guard without a score for an expecting family.
        adapter.zrem(keys::FERTILE_QUEUE, "7").await.unwrap();

        let auditor = IntegrityAuditor::new(Arc::clone(&world));
        let report = auditor.audit(AuditScope::FertileQueue, true, today()).await.unwrap();
        assert!(report.details.contains(&IntegrityIssue::OrphanQueueEntry { member: "6".to_owned() }));
        assert!(report.details.contains(&IntegrityIssue::QueueMembershipMismatch {
            member: "7".to_owned(),
            in_queue: false,
        }));
        assert!(report.repaired);

        assert!(!world.queue().contains(EntityId::Durable(6)).await.unwrap());
        assert!(world.queue().contains(EntityId::Durable(7)).await.unwrap());
        assert_eq!(world.queue().entries().await.unwrap().len(), 1);
        assert!(auditor.audit(AuditScope::All, false, today()).await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn startup_audit_fails_when_configured() {
        let world = make_loaded_world().await;
        world.adapter().sadd(keys::FERTILE_FAMILIES, "99").await.unwrap();
        let auditor = IntegrityAuditor::new(world);

        let err = auditor.audit_on_init(true, true, today()).await.unwrap_err();
        assert!(matches!(err, AuditError::IssuesAtStartup { issues: 1 }));
        // Repair still happened.
        assert!(auditor.audit_on_init(false, true, today()).await.is_ok());
    }

    #[tokio::test]
    async fn expecting_family_missing_from_queue_is_requeued() {
        let world = make_loaded_world().await;
        world.queue().remove(EntityId::Durable(7)).await.unwrap();
        let auditor = IntegrityAuditor::new(Arc::clone(&world));

        let report = auditor.audit(AuditScope::All, true, today()).await.unwrap();
        assert_eq!(
            report.details,
            vec![IntegrityIssue::UnqueuedExpectingFamily { member: "7".to_owned() }]
        );
        assert!(report.repaired);
        assert!(world.queue().contains(EntityId::Durable(7)).await.unwrap());
        assert!(auditor.audit(AuditScope::All, false, today()).await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn missed_delivery_is_not_an_unqueued_family() {
        let world = make_loaded_world().await;
        world.queue().remove(EntityId::Durable(7)).await.unwrap();
        world.adapter().sadd(keys::MISSED_DELIVERIES, "7").await.unwrap();
        let auditor = IntegrityAuditor::new(world);
        assert!(auditor.audit(AuditScope::FertileQueue, false, today()).await.unwrap().is_clean());
    }
}
