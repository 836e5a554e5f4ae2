//! Person, family, and settlement records.
//!
//! These are the three entity kinds mirrored between the operational cache
//! and the durable store. Each implements [`Entity`], which is the seam the
//! generic entity store in `gridworld-db` is written against.
//!
//! Partial updates are typed patches. A patch field of `None` leaves the
//! stored value alone; `Some(None)` on an optional reference clears it.

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::ids::EntityId;

/// The three entity kinds kept in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// An individual.
    Person,
    /// A pairing of two partners plus their offspring.
    Family,
    /// A village on a tile.
    Settlement,
}

impl EntityKind {
    /// All kinds in durable load order (referenced kinds first).
    pub const LOAD_ORDER: [Self; 3] = [Self::Settlement, Self::Person, Self::Family];

    /// Cache namespace for this kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Family => "family",
            Self::Settlement => "village",
        }
    }
}

impl core::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Biological sex of a person.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sex {
    /// Male.
    Male,
    /// Female.
    Female,
}

impl Sex {
    /// Lowercase name used in cache keys.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Male => "male",
            Self::Female => "female",
        }
    }

    /// Durable encoding (`people.sex`, true = male).
    pub const fn is_male(self) -> bool {
        matches!(self, Self::Male)
    }

    /// Decode the durable boolean encoding.
    pub const fn from_is_male(is_male: bool) -> Self {
        if is_male { Self::Male } else { Self::Female }
    }
}

/// Behaviour shared by every cached entity kind.
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Partial-update type for this kind.
    type Patch: Send + Sync;

    /// Which kind this is.
    const KIND: EntityKind;

    /// The entity's own identifier.
    fn id(&self) -> EntityId;

    /// Replace the entity's own identifier.
    fn set_id(&mut self, id: EntityId);

    /// Merge a patch into the entity.
    fn apply(&mut self, patch: &Self::Patch);

    /// Rewrite every foreign-key field equal to `from` so it reads `to`.
    ///
    /// Returns `true` if any field changed.
    fn remap_references(&mut self, from: EntityId, to: EntityId) -> bool;

    /// Every foreign key the entity currently holds.
    fn references(&self) -> Vec<EntityId>;

    /// Whether any foreign key still points at a provisional identifier.
    fn has_provisional_reference(&self) -> bool {
        self.references().iter().any(|r| r.is_provisional())
    }
}

/// Replace `from` with `to` inside an optional reference.
fn remap_option(slot: &mut Option<EntityId>, from: EntityId, to: EntityId) -> bool {
    if *slot == Some(from) {
        *slot = Some(to);
        true
    } else {
        false
    }
}

// ---------------------------------------------------------------------------
// Person
// ---------------------------------------------------------------------------

/// An individual living in (at most) one settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    /// Identifier.
    pub id: EntityId,
    /// Settlement the person lives in.
    pub settlement_id: Option<EntityId>,
    /// Biological sex.
    pub sex: Sex,
    /// Calendar date of birth.
    pub birth_date: NaiveDate,
    /// Family the person heads, if partnered.
    pub family_id: Option<EntityId>,
}

impl Person {
    /// Build an unpartnered person.
    pub const fn new(
        id: EntityId,
        settlement_id: Option<EntityId>,
        sex: Sex,
        birth_date: NaiveDate,
    ) -> Self {
        Self {
            id,
            settlement_id,
            sex,
            birth_date,
            family_id: None,
        }
    }

    /// Age in whole years on `today`, or `None` if born after `today`.
    pub fn age_years(&self, today: NaiveDate) -> Option<u32> {
        today.years_since(self.birth_date)
    }
}

/// Partial update for a [`Person`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersonPatch {
    /// New settlement (`Some(None)` clears it).
    pub settlement_id: Option<Option<EntityId>>,
    /// New sex.
    pub sex: Option<Sex>,
    /// New birth date.
    pub birth_date: Option<NaiveDate>,
    /// New family (`Some(None)` clears it).
    pub family_id: Option<Option<EntityId>>,
}

impl Entity for Person {
    type Patch = PersonPatch;
    const KIND: EntityKind = EntityKind::Person;

    fn id(&self) -> EntityId {
        self.id
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = id;
    }

    fn apply(&mut self, patch: &PersonPatch) {
        if let Some(settlement_id) = patch.settlement_id {
            self.settlement_id = settlement_id;
        }
        if let Some(sex) = patch.sex {
            self.sex = sex;
        }
        if let Some(birth_date) = patch.birth_date {
            self.birth_date = birth_date;
        }
        if let Some(family_id) = patch.family_id {
            self.family_id = family_id;
        }
    }

    fn remap_references(&mut self, from: EntityId, to: EntityId) -> bool {
        let settlement = remap_option(&mut self.settlement_id, from, to);
        let family = remap_option(&mut self.family_id, from, to);
        settlement || family
    }

    fn references(&self) -> Vec<EntityId> {
        self.settlement_id.into_iter().chain(self.family_id).collect()
    }
}

// ---------------------------------------------------------------------------
// Family
// ---------------------------------------------------------------------------

/// A pairing of two partners. `partner_a` is the husband, `partner_b` the
/// wife; either slot is cleared when that partner is removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Family {
    /// Identifier.
    pub id: EntityId,
    /// Husband.
    pub partner_a_id: Option<EntityId>,
    /// Wife.
    pub partner_b_id: Option<EntityId>,
    /// Whether a delivery is scheduled.
    pub is_expecting: bool,
    /// Scheduled delivery date while expecting.
    pub due_date: Option<NaiveDate>,
    /// Children born into this family, oldest first.
    pub offspring_ids: Vec<EntityId>,
    /// Settlement the family lives in.
    pub settlement_id: Option<EntityId>,
}

impl Family {
    /// Build a new, childless, non-expecting family.
    pub const fn new(
        id: EntityId,
        partner_a_id: EntityId,
        partner_b_id: EntityId,
        settlement_id: Option<EntityId>,
    ) -> Self {
        Self {
            id,
            partner_a_id: Some(partner_a_id),
            partner_b_id: Some(partner_b_id),
            is_expecting: false,
            due_date: None,
            offspring_ids: Vec::new(),
            settlement_id,
        }
    }
}

/// Partial update for a [`Family`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FamilyPatch {
    /// New husband (`Some(None)` clears the slot).
    pub partner_a_id: Option<Option<EntityId>>,
    /// New wife (`Some(None)` clears the slot).
    pub partner_b_id: Option<Option<EntityId>>,
    /// New expecting flag.
    pub is_expecting: Option<bool>,
    /// New due date (`Some(None)` clears it).
    pub due_date: Option<Option<NaiveDate>>,
    /// Replacement offspring list.
    pub offspring_ids: Option<Vec<EntityId>>,
    /// New settlement (`Some(None)` clears it).
    pub settlement_id: Option<Option<EntityId>>,
}

impl Entity for Family {
    type Patch = FamilyPatch;
    const KIND: EntityKind = EntityKind::Family;

    fn id(&self) -> EntityId {
        self.id
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = id;
    }

    fn apply(&mut self, patch: &FamilyPatch) {
        if let Some(a) = patch.partner_a_id {
            self.partner_a_id = a;
        }
        if let Some(b) = patch.partner_b_id {
            self.partner_b_id = b;
        }
        if let Some(expecting) = patch.is_expecting {
            self.is_expecting = expecting;
        }
        if let Some(due) = patch.due_date {
            self.due_date = due;
        }
        if let Some(ref offspring) = patch.offspring_ids {
            self.offspring_ids.clone_from(offspring);
        }
        if let Some(settlement_id) = patch.settlement_id {
            self.settlement_id = settlement_id;
        }
    }

    fn remap_references(&mut self, from: EntityId, to: EntityId) -> bool {
        let mut changed = remap_option(&mut self.partner_a_id, from, to);
        changed |= remap_option(&mut self.partner_b_id, from, to);
        changed |= remap_option(&mut self.settlement_id, from, to);
        for child in &mut self.offspring_ids {
            if *child == from {
                *child = to;
                changed = true;
            }
        }
        changed
    }

    fn references(&self) -> Vec<EntityId> {
        self.partner_a_id
            .into_iter()
            .chain(self.partner_b_id)
            .chain(self.settlement_id)
            .chain(self.offspring_ids.iter().copied())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Settlement
// ---------------------------------------------------------------------------

/// A village occupying one land chunk of a tile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    /// Identifier.
    pub id: EntityId,
    /// Tile the village sits on.
    pub tile_id: u32,
    /// Land chunk within the tile.
    pub chunk_index: u32,
    /// Number of residents the village can house.
    pub housing_capacity: u32,
    /// Food units in storage.
    pub food_stores: i64,
}

/// Partial update for a [`Settlement`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettlementPatch {
    /// New housing capacity.
    pub housing_capacity: Option<u32>,
    /// New food stores.
    pub food_stores: Option<i64>,
}

impl Entity for Settlement {
    type Patch = SettlementPatch;
    const KIND: EntityKind = EntityKind::Settlement;

    fn id(&self) -> EntityId {
        self.id
    }

    fn set_id(&mut self, id: EntityId) {
        self.id = id;
    }

    fn apply(&mut self, patch: &SettlementPatch) {
        if let Some(capacity) = patch.housing_capacity {
            self.housing_capacity = capacity;
        }
        if let Some(food) = patch.food_stores {
            self.food_stores = food;
        }
    }

    fn remap_references(&mut self, _from: EntityId, _to: EntityId) -> bool {
        false
    }

    fn references(&self) -> Vec<EntityId> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default()
    }

    #[test]
    fn person_patch_clears_family() {
        let mut p = Person::new(EntityId::Durable(1), None, Sex::Male, date(4000, 1, 1));
        p.family_id = Some(EntityId::Durable(9));
        p.apply(&PersonPatch {
            family_id: Some(None),
            ..PersonPatch::default()
        });
        assert_eq!(p.family_id, None);
        assert_eq!(p.sex, Sex::Male);
    }

    #[test]
    fn family_remap_touches_every_reference() {
        let from = EntityId::Provisional(5);
        let to = EntityId::Durable(500);
        let mut f = Family::new(EntityId::Durable(2), from, EntityId::Durable(3), Some(from));
        f.offspring_ids = vec![EntityId::Durable(8), from];

        assert!(f.remap_references(from, to));
        assert_eq!(f.partner_a_id, Some(to));
        assert_eq!(f.settlement_id, Some(to));
        assert_eq!(f.offspring_ids, vec![EntityId::Durable(8), to]);
        assert!(!f.has_provisional_reference());
        assert!(!f.remap_references(from, to));
    }

    #[test]
    fn age_in_whole_years() {
        let p = Person::new(EntityId::Durable(1), None, Sex::Female, date(4000, 6, 15));
        assert_eq!(p.age_years(date(4016, 6, 14)), Some(15));
        assert_eq!(p.age_years(date(4016, 6, 15)), Some(16));
        assert_eq!(p.age_years(date(3999, 1, 1)), None);
    }

    #[test]
    fn entity_json_roundtrip() {
        let s = Settlement {
            id: EntityId::Provisional(4),
            tile_id: 17,
            chunk_index: 2,
            housing_capacity: 30,
            food_stores: 1200,
        };
        let json = serde_json::to_string(&s).unwrap_or_default();
        let back: Option<Settlement> = serde_json::from_str(&json).ok();
        assert_eq!(back, Some(s));
    }
}
