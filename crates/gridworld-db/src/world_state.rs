//! The three entity stores plus the derived sets that span them.
//!
//! [`WorldState`] is constructed once at startup and shared as
//! `Arc<WorldState>`. Cross-store work lives here: provisional-to-durable
//! reassignment, eligibility maintenance, and the cascades that keep
//! references valid when an entity is removed.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::NaiveDate;
use gridworld_types::{
    EntityId, EntityKind, Family, FamilyPatch, IdAllocator, IdMapping, Person, PersonPatch,
    Settlement, Sex,
};

use crate::adapter::StorageAdapter;
use crate::eligibility::EligibilityRules;
use crate::entity_store::{EntityError, EntityStore};
use crate::fertile_queue::FertileQueue;
use crate::keys;

/// Counts produced by [`WorldState::rebuild_derived`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DerivedCounts {
    /// Persons placed in a marriage-eligibility set.
    pub eligible_persons: usize,
    /// Families placed in the fertile set.
    pub fertile_families: usize,
    /// Expecting families placed in the fertile queue.
    pub queued_families: usize,
}

/// Entity stores, allocator, rules and queue for one world.
pub struct WorldState {
    /// Person store.
    pub persons: EntityStore<Person>,
    /// Family store.
    pub families: EntityStore<Family>,
    /// Settlement store.
    pub settlements: EntityStore<Settlement>,
    adapter: Arc<StorageAdapter>,
    ids: Arc<IdAllocator>,
    rules: EligibilityRules,
    queue: FertileQueue,
}

impl WorldState {
    /// Build the stores on top of `adapter`.
    pub fn new(adapter: Arc<StorageAdapter>, rules: EligibilityRules) -> Self {
        let ids = Arc::new(IdAllocator::new());
        Self {
            persons: EntityStore::new(Arc::clone(&adapter), Arc::clone(&ids)),
            families: EntityStore::new(Arc::clone(&adapter), Arc::clone(&ids)),
            settlements: EntityStore::new(Arc::clone(&adapter), Arc::clone(&ids)),
            queue: FertileQueue::new(Arc::clone(&adapter)),
            adapter,
            ids,
            rules,
        }
    }

    /// The shared storage adapter.
    pub fn adapter(&self) -> &Arc<StorageAdapter> {
        &self.adapter
    }

    /// The shared provisional-id allocator.
    pub fn ids(&self) -> &IdAllocator {
        &self.ids
    }

    /// Eligibility thresholds in force.
    pub const fn rules(&self) -> &EligibilityRules {
        &self.rules
    }

    /// The fertile queue.
    pub const fn queue(&self) -> &FertileQueue {
        &self.queue
    }

    // =========================================================================
    // Eligibility helpers
    // =========================================================================

    /// Put `person` in the eligibility set of their settlement.
    pub async fn add_eligible_person(&self, person: &Person) -> bool {
        let Some(settlement) = person.settlement_id else {
            return false;
        };
        self.sadd(&keys::eligible(person.sex, settlement), person.id).await
    }

    /// Take `person` out of the eligibility set of their settlement.
    pub async fn remove_eligible_person(&self, person: &Person) -> bool {
        let Some(settlement) = person.settlement_id else {
            return false;
        };
        self.srem(&keys::eligible(person.sex, settlement), person.id).await
    }

    /// Put `family` in the fertile set.
    pub async fn add_fertile_family(&self, family: EntityId) -> bool {
        self.sadd(keys::FERTILE_FAMILIES, family).await
    }

    /// Take `family` out of the fertile set.
    pub async fn remove_fertile_family(&self, family: EntityId) -> bool {
        self.srem(keys::FERTILE_FAMILIES, family).await
    }

    /// Members of the eligibility set for `sex` in `settlement`.
    pub async fn eligible_persons(&self, sex: Sex, settlement: EntityId) -> Vec<EntityId> {
        self.members(&keys::eligible(sex, settlement)).await
    }

    /// Members of the fertile set.
    pub async fn fertile_families(&self) -> Vec<EntityId> {
        self.members(keys::FERTILE_FAMILIES).await
    }

    async fn sadd(&self, key: &str, id: EntityId) -> bool {
        match self.adapter.sadd(key, &id.to_string()).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(key, id = %id, error = %e, "Failed to add derived-set member");
                false
            }
        }
    }

    async fn srem(&self, key: &str, id: EntityId) -> bool {
        match self.adapter.srem(key, &id.to_string()).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(key, id = %id, error = %e, "Failed to remove derived-set member");
                false
            }
        }
    }

    async fn members(&self, key: &str) -> Vec<EntityId> {
        let raw = self.adapter.smembers(key).await.unwrap_or_else(|e| {
            tracing::warn!(key, error = %e, "Failed to read derived set");
            Vec::new()
        });
        let mut ids: Vec<EntityId> = raw.iter().filter_map(|m| m.parse().ok()).collect();
        ids.sort_unstable();
        ids
    }

    /// Re-evaluate marriage eligibility of `person` on `today` and fix its
    /// set membership. Returns whether the person is eligible.
    pub async fn refresh_person_eligibility(&self, person: &Person, today: NaiveDate) -> bool {
        if self.rules.person_eligible(person, today) {
            self.add_eligible_person(person).await;
            true
        } else {
            self.remove_eligible_person(person).await;
            false
        }
    }

    /// Re-evaluate fertility of `family` on `today` and fix its set
    /// membership. Returns whether the family is fertile.
    pub async fn refresh_family_fertility(&self, family: &Family, today: NaiveDate) -> bool {
        let wife = match family.partner_b_id {
            Some(id) => self.persons.get(id).await,
            None => None,
        };
        if self.rules.family_fertile(family, wife.as_ref(), today) {
            self.add_fertile_family(family.id).await;
            true
        } else {
            self.remove_fertile_family(family.id).await;
            false
        }
    }

    // =========================================================================
    // Mutations with eligibility upkeep
    // =========================================================================

    /// Create a person with a provisional id and index them.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError`] if the allocated id collides.
    pub async fn create_person(&self, person: Person, today: NaiveDate) -> Result<Option<Person>, EntityError> {
        let created = self.persons.create(person).await?;
        if let Some(ref person) = created {
            self.refresh_person_eligibility(person, today).await;
        }
        Ok(created)
    }

    /// Patch a person, moving their eligibility membership if their
    /// settlement, sex or partnership changed.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotFound`] if the person does not exist.
    pub async fn update_person(
        &self,
        id: EntityId,
        patch: &PersonPatch,
        today: NaiveDate,
    ) -> Result<Option<Person>, EntityError> {
        let Some(before) = self.persons.get(id).await else {
            return Err(EntityError::NotFound {
                kind: EntityKind::Person,
                id,
            });
        };
        let updated = self.persons.update(id, patch).await?;
        if let Some(ref after) = updated {
            if before.settlement_id != after.settlement_id || before.sex != after.sex {
                self.remove_eligible_person(&before).await;
            }
            self.refresh_person_eligibility(after, today).await;
        }
        Ok(updated)
    }

    /// Pair two persons into a new provisional family, taking both out of
    /// the eligibility sets.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotFound`] if either partner does not exist.
    pub async fn create_family(
        &self,
        husband: EntityId,
        wife: EntityId,
        today: NaiveDate,
    ) -> Result<Option<Family>, EntityError> {
        let wife_record = self.persons.get(wife).await.ok_or(EntityError::NotFound {
            kind: EntityKind::Person,
            id: wife,
        })?;
        if self.persons.get(husband).await.is_none() {
            return Err(EntityError::NotFound {
                kind: EntityKind::Person,
                id: husband,
            });
        }

        let draft = Family::new(EntityId::Provisional(0), husband, wife, wife_record.settlement_id);
        let Some(family) = self.families.create(draft).await? else {
            return Ok(None);
        };
        let joined = PersonPatch {
            family_id: Some(Some(family.id)),
            ..PersonPatch::default()
        };
        self.update_person(husband, &joined, today).await?;
        self.update_person(wife, &joined, today).await?;
        self.refresh_family_fertility(&family, today).await;
        Ok(Some(family))
    }

    /// Patch a family and re-evaluate its fertility.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotFound`] if the family does not exist.
    pub async fn update_family(
        &self,
        id: EntityId,
        patch: &FamilyPatch,
        today: NaiveDate,
    ) -> Result<Option<Family>, EntityError> {
        let updated = self.families.update(id, patch).await?;
        if let Some(ref family) = updated {
            self.refresh_family_fertility(family, today).await;
        }
        Ok(updated)
    }

    /// Remove a person, clearing the partner slot of their family.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotFound`] if the person does not exist.
    pub async fn remove_person(&self, id: EntityId, today: NaiveDate) -> Result<Option<Person>, EntityError> {
        let removed = self.persons.remove(id).await?;
        if let Some(family_id) = removed.as_ref().and_then(|p| p.family_id)
            && let Some(family) = self.families.get(family_id).await
        {
            let patch = FamilyPatch {
                partner_a_id: (family.partner_a_id == Some(id)).then_some(None),
                partner_b_id: (family.partner_b_id == Some(id)).then_some(None),
                ..FamilyPatch::default()
            };
            self.update_family(family_id, &patch, today).await?;
        }
        Ok(removed)
    }

    /// Remove a family, releasing both partners back to the eligibility
    /// sets.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotFound`] if the family does not exist.
    pub async fn remove_family(&self, id: EntityId, today: NaiveDate) -> Result<Option<Family>, EntityError> {
        let removed = self.families.remove(id).await?;
        if let Some(ref family) = removed {
            let released = PersonPatch {
                family_id: Some(None),
                ..PersonPatch::default()
            };
            for partner in family.partner_a_id.into_iter().chain(family.partner_b_id) {
                match self.update_person(partner, &released, today).await {
                    Ok(_) | Err(EntityError::NotFound { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(removed)
    }

    // =========================================================================
    // Reassignment
    // =========================================================================

    /// Apply provisional-to-durable `mappings` for entities of `kind`.
    ///
    /// Each entity moves to its durable key and leaves pending-inserts.
    /// Derived-set memberships and fertile-queue slots follow it. Every
    /// foreign key in all three stores that named a provisional id is
    /// rewritten, and durable referrers are marked for update. Returns how
    /// many referrers changed.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError`] if a rewritten entity cannot be encoded.
    pub async fn reassign_ids(&self, kind: EntityKind, mappings: &[IdMapping]) -> Result<usize, EntityError> {
        if mappings.is_empty() {
            return Ok(0);
        }
        for mapping in mappings {
            let (from, to) = (mapping.provisional, mapping.durable);
            match kind {
                EntityKind::Person => {
                    if let Some(person) = self.persons.rekey(from, to).await?
                        && let Some(settlement) = person.settlement_id
                    {
                        self.move_member(&keys::eligible(person.sex, settlement), from, to).await;
                    }
                }
                EntityKind::Family => {
                    if self.families.rekey(from, to).await?.is_some() {
                        self.move_member(keys::FERTILE_FAMILIES, from, to).await;
                        if let Err(e) = self.queue.remap(from, to).await {
                            tracing::warn!(from = %from, to = %to, error = %e, "Failed to remap queued family");
                        }
                    }
                }
                EntityKind::Settlement => {
                    if self.settlements.rekey(from, to).await?.is_some() {
                        for sex in [Sex::Male, Sex::Female] {
                            self.move_set(&keys::eligible(sex, from), &keys::eligible(sex, to)).await;
                        }
                    }
                }
            }
        }

        let pairs: Vec<(EntityId, EntityId)> = mappings.iter().map(|m| (m.provisional, m.durable)).collect();
        let mut changed = self.persons.remap_references(&pairs).await?;
        changed = changed.saturating_add(self.families.remap_references(&pairs).await?);
        changed = changed.saturating_add(self.settlements.remap_references(&pairs).await?);
        tracing::debug!(kind = %kind, mappings = mappings.len(), referrers = changed, "Reassigned ids");
        Ok(changed)
    }

    async fn move_member(&self, key: &str, from: EntityId, to: EntityId) {
        let was_member = self.adapter.sismember(key, &from.to_string()).await.unwrap_or(false);
        if was_member {
            self.srem(key, from).await;
            self.sadd(key, to).await;
        }
    }

    async fn move_set(&self, from_key: &str, to_key: &str) {
        let members = self.adapter.smembers(from_key).await.unwrap_or_default();
        if members.is_empty() {
            return;
        }
        let pipeline = members
            .iter()
            .fold(self.adapter.pipeline(), |p, m| p.sadd(to_key, m))
            .del(from_key);
        if let Err(e) = pipeline.exec().await {
            tracing::warn!(from_key, to_key, error = %e, "Failed to move eligibility set");
        }
    }

    // =========================================================================
    // Bulk
    // =========================================================================

    /// Every settlement id that may key an eligibility set.
    async fn known_settlements(&self) -> BTreeSet<EntityId> {
        let mut ids: BTreeSet<EntityId> = self
            .settlements
            .get_all()
            .await
            .into_iter()
            .map(|s| s.id)
            .collect();
        ids.extend(self.persons.get_all().await.into_iter().filter_map(|p| p.settlement_id));
        ids
    }

    /// Every eligibility set key that may exist.
    pub async fn eligibility_keys(&self) -> Vec<String> {
        self.known_settlements()
            .await
            .into_iter()
            .flat_map(|settlement| [keys::eligible(Sex::Male, settlement), keys::eligible(Sex::Female, settlement)])
            .collect()
    }

    /// Drop every entity, pending marker, derived set and queue entry.
    pub async fn clear(&self) -> bool {
        let mut derived = self.eligibility_keys().await;
        derived.push(keys::FERTILE_FAMILIES.to_owned());
        derived.push(self.queue.key().to_owned());
        derived.push(crate::adapter::members_key(self.queue.key()));
        let derived_cleared = match self.adapter.del(&derived).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to clear derived sets");
                false
            }
        };
        let persons = self.persons.clear().await;
        let families = self.families.clear().await;
        let settlements = self.settlements.clear().await;
        derived_cleared && persons && families && settlements
    }

    /// Recompute every derived set from the stored entities on `today`,
    /// and requeue expecting families by their due date.
    pub async fn rebuild_derived(&self, today: NaiveDate) -> DerivedCounts {
        let mut counts = DerivedCounts::default();
        for person in self.persons.get_all().await {
            if self.refresh_person_eligibility(&person, today).await {
                counts.eligible_persons = counts.eligible_persons.saturating_add(1);
            }
        }
        for family in self.families.get_all().await {
            if self.refresh_family_fertility(&family, today).await {
                counts.fertile_families = counts.fertile_families.saturating_add(1);
            }
            if family.is_expecting
                && let Some(due) = family.due_date
                && self.queue.enqueue(family.id, due).await.unwrap_or(false)
            {
                counts.queued_families = counts.queued_families.saturating_add(1);
            }
        }
        counts
    }
}
