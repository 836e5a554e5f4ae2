//! Marriage and fertility predicates.
//!
//! Derived sets in the cache (`eligible:{sex}:{settlement}` and
//! `fertile:families`) must always equal what these predicates compute from
//! the entities' own fields. Both the entity stores (when maintaining the
//! sets) and the integrity auditor (when recomputing them) go through here.

use chrono::NaiveDate;
use gridworld_types::{Family, Person};

/// Default minimum age to marry.
pub const DEFAULT_MARRIAGE_AGE: u32 = 16;

/// Default youngest fertile age of the wife.
pub const DEFAULT_FERTILE_MIN_AGE: u32 = 16;

/// Default oldest fertile age of the wife.
pub const DEFAULT_FERTILE_MAX_AGE: u32 = 33;

/// Age thresholds and offspring cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EligibilityRules {
    /// Minimum age in whole years to be marriage-eligible.
    pub marriage_age: u32,
    /// Youngest fertile age (inclusive) of the wife.
    pub fertile_min_age: u32,
    /// Oldest fertile age (inclusive) of the wife.
    pub fertile_max_age: u32,
    /// Maximum number of children per family; 0 means unlimited.
    pub max_offspring: u32,
}

impl Default for EligibilityRules {
    fn default() -> Self {
        Self {
            marriage_age: DEFAULT_MARRIAGE_AGE,
            fertile_min_age: DEFAULT_FERTILE_MIN_AGE,
            fertile_max_age: DEFAULT_FERTILE_MAX_AGE,
            max_offspring: 0,
        }
    }
}

impl EligibilityRules {
    /// Whether `person` belongs in the marriage-eligibility set of their
    /// settlement on `today`: unpartnered, housed, and of age.
    pub fn person_eligible(&self, person: &Person, today: NaiveDate) -> bool {
        person.family_id.is_none()
            && person.settlement_id.is_some()
            && person
                .age_years(today)
                .is_some_and(|age| age >= self.marriage_age)
    }

    /// Whether `family` belongs in the fertile set on `today`.
    ///
    /// Requires both partners, no pregnancy in progress, a wife within the
    /// fertile window, and room under the offspring cap. `wife` is the
    /// record behind `partner_b_id`; a missing record fails the check.
    pub fn family_fertile(&self, family: &Family, wife: Option<&Person>, today: NaiveDate) -> bool {
        if family.partner_a_id.is_none() || family.is_expecting {
            return false;
        }
        let Some(wife) = wife.filter(|w| Some(w.id) == family.partner_b_id) else {
            return false;
        };
        let in_window = wife
            .age_years(today)
            .is_some_and(|age| (self.fertile_min_age..=self.fertile_max_age).contains(&age));
        let under_cap = self.max_offspring == 0
            || u32::try_from(family.offspring_ids.len()).is_ok_and(|n| n < self.max_offspring);
        in_window && under_cap
    }
}

#[cfg(test)]
mod tests {
    use gridworld_types::{EntityId, Sex};

    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default()
    }

    fn couple(wife_born: NaiveDate) -> (Family, Person) {
        let wife = Person::new(EntityId::Durable(2), Some(EntityId::Durable(9)), Sex::Female, wife_born);
        let family = Family::new(EntityId::Durable(5), EntityId::Durable(1), wife.id, Some(EntityId::Durable(9)));
        (family, wife)
    }

    #[test]
    fn unpartnered_adult_is_eligible() {
        let rules = EligibilityRules::default();
        let mut p = Person::new(EntityId::Durable(1), Some(EntityId::Durable(3)), Sex::Male, date(4000, 1, 1));
        assert!(rules.person_eligible(&p, date(4016, 1, 1)));
        assert!(!rules.person_eligible(&p, date(4015, 12, 31)));

        p.family_id = Some(EntityId::Durable(8));
        assert!(!rules.person_eligible(&p, date(4020, 1, 1)));

        p.family_id = None;
        p.settlement_id = None;
        assert!(!rules.person_eligible(&p, date(4020, 1, 1)));
    }

    #[test]
    fn fertility_window_is_inclusive() {
        let rules = EligibilityRules::default();
        let (family, wife) = couple(date(4000, 1, 1));
        assert!(!rules.family_fertile(&family, Some(&wife), date(4015, 6, 1)));
        assert!(rules.family_fertile(&family, Some(&wife), date(4016, 1, 1)));
        assert!(rules.family_fertile(&family, Some(&wife), date(4033, 12, 31)));
        assert!(!rules.family_fertile(&family, Some(&wife), date(4034, 1, 1)));
    }

    #[test]
    fn expecting_or_incomplete_family_is_not_fertile() {
        let rules = EligibilityRules::default();
        let today = date(4020, 1, 1);
        let (mut family, wife) = couple(date(4000, 1, 1));

        family.is_expecting = true;
        assert!(!rules.family_fertile(&family, Some(&wife), today));

        family.is_expecting = false;
        family.partner_a_id = None;
        assert!(!rules.family_fertile(&family, Some(&wife), today));

        let (family, _) = couple(date(4000, 1, 1));
        assert!(!rules.family_fertile(&family, None, today));
    }

    #[test]
    fn offspring_cap_applies() {
        let rules = EligibilityRules {
            max_offspring: 2,
            ..EligibilityRules::default()
        };
        let today = date(4020, 1, 1);
        let (mut family, wife) = couple(date(4000, 1, 1));
        family.offspring_ids = vec![EntityId::Durable(20)];
        assert!(rules.family_fertile(&family, Some(&wife), today));
        family.offspring_ids.push(EntityId::Durable(21));
        assert!(!rules.family_fertile(&family, Some(&wife), today));
    }
}
