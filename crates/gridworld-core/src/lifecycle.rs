//! Daily life-cycle outcomes: mortality, matchmaking, conception, and birth.
//!
//! Each pass reads the derived sets maintained by
//! [`WorldState`](gridworld_db::WorldState) and writes back through its
//! mutation methods, so eligibility and fertility stay in step with every
//! change. Births run under the delivery lock through [`BirthHandler`].

use std::sync::{Mutex, PoisonError};

use chrono::{Months, NaiveDate};
use gridworld_db::{DeliveryError, DeliveryHandler, EntityError, WorldState};
use gridworld_types::{EntityId, Family, FamilyPatch, IdAllocator, Person, Settlement, Sex};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::debug;

/// Age above which conception odds decline.
pub const FERTILITY_PEAK_AGE: u32 = 28;

/// Oldest age drawn for a seeded person, exclusive.
pub const SEED_MAX_AGE: u32 = 60;

/// Annual death odds by age bracket: `(from_age, odds)`, youngest first.
pub const MORTALITY_BRACKETS: [(u32, f64); 10] = [
    (0, 0.05),
    (5, 0.005),
    (15, 0.002),
    (30, 0.003),
    (50, 0.01),
    (60, 0.025),
    (70, 0.05),
    (80, 0.12),
    (90, 0.25),
    (100, 0.5),
];

/// Simulated days per year, for spreading annual odds over days.
const DAYS_PER_YEAR: f64 = 365.0;

/// Parameters for matchmaking, conception and gestation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LifecycleRules {
    /// Base daily conception probability.
    pub conception_rate: f64,
    /// Multiplier on [`MORTALITY_BRACKETS`]; 0 disables deaths.
    pub mortality_scale: f64,
    /// Months from conception to due date.
    pub gestation_months: u32,
    /// Largest partner age gap in years.
    pub max_age_diff: u32,
}

impl Default for LifecycleRules {
    fn default() -> Self {
        Self {
            conception_rate: 0.004,
            mortality_scale: 1.0,
            gestation_months: 9,
            max_age_diff: 15,
        }
    }
}

impl LifecycleRules {
    /// Daily conception probability for a wife of `wife_age` with
    /// `children` existing children.
    pub fn conception_chance(&self, wife_age: u32, children: usize) -> f64 {
        let years_past_peak = f64::from(wife_age.saturating_sub(FERTILITY_PEAK_AGE));
        let age_factor = 0.15_f64.mul_add(-years_past_peak, 1.0).max(0.1);
        let children = u32::try_from(children).map_or(f64::MAX, f64::from);
        let children_factor = 0.1_f64.mul_add(-children, 1.0).max(0.2);
        self.conception_rate * age_factor * children_factor
    }

    /// Daily death probability at `age` years.
    pub fn death_chance(&self, age: u32) -> f64 {
        let annual = MORTALITY_BRACKETS
            .iter()
            .rev()
            .find(|(from, _)| age >= *from)
            .map_or(0.002, |(_, odds)| *odds);
        let annual = (annual * self.mortality_scale).clamp(0.0, 1.0);
        1.0 - (1.0 - annual).powf(DAYS_PER_YEAR.recip())
    }

    /// Due date for a conception on `today`.
    pub fn due_date(&self, today: NaiveDate) -> NaiveDate {
        today
            .checked_add_months(Months::new(self.gestation_months))
            .unwrap_or(NaiveDate::MAX)
    }
}

// =============================================================================
// Mortality
// =============================================================================

/// Roll death for every person by age bracket. Returns the persons who died.
///
/// A death dissolves the deceased's family: the family is removed, which
/// drops any pending delivery, and the surviving partner becomes single
/// again. Durable removals reach the durable store as deletes on the next
/// flush.
///
/// # Errors
///
/// Returns [`EntityError`] if a removal fails.
pub async fn run_mortality<R: Rng + Send>(
    world: &WorldState,
    rules: &LifecycleRules,
    today: NaiveDate,
    rng: &mut R,
) -> Result<Vec<EntityId>, EntityError> {
    if rules.mortality_scale <= 0.0 {
        return Ok(Vec::new());
    }
    let mut deceased = Vec::new();
    for person in world.persons.get_all().await {
        let Some(age) = person.age_years(today) else {
            continue;
        };
        if rng.random::<f64>() >= rules.death_chance(age) {
            continue;
        }
        bury(world, &person, today).await?;
        debug!(person = %person.id, age, "Died");
        deceased.push(person.id);
    }
    Ok(deceased)
}

async fn bury(world: &WorldState, person: &Person, today: NaiveDate) -> Result<(), EntityError> {
    if let Some(family) = person.family_id {
        match world.remove_family(family, today).await {
            Ok(Some(_)) => debug!(family = %family, person = %person.id, "Family dissolved by death"),
            Ok(None) | Err(EntityError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    match world.remove_person(person.id, today).await {
        Ok(_) | Err(EntityError::NotFound { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

// =============================================================================
// Matchmaking
// =============================================================================

/// Pair eligible singles within each settlement.
///
/// Both sexes are shuffled, then every man takes the first remaining woman
/// whose age is within `max_age_diff` years of his. Returns the families
/// created.
///
/// # Errors
///
/// Returns [`EntityError`] if a family cannot be created.
pub async fn run_matchmaking<R: Rng + Send>(
    world: &WorldState,
    rules: &LifecycleRules,
    today: NaiveDate,
    rng: &mut R,
) -> Result<Vec<Family>, EntityError> {
    let mut created = Vec::new();
    for settlement in world.settlements.get_all().await {
        let mut men = singles(world, Sex::Male, settlement.id, today).await;
        let mut women = singles(world, Sex::Female, settlement.id, today).await;
        if men.is_empty() || women.is_empty() {
            continue;
        }
        men.shuffle(rng);
        women.shuffle(rng);

        for (husband, husband_age) in men {
            let Some(pos) = women
                .iter()
                .position(|(_, wife_age)| wife_age.abs_diff(husband_age) <= rules.max_age_diff)
            else {
                continue;
            };
            let (wife, _) = women.swap_remove(pos);
            if let Some(family) = world.create_family(husband, wife, today).await? {
                debug!(family = %family.id, husband = %husband, wife = %wife, "Family formed");
                created.push(family);
            }
        }
    }
    Ok(created)
}

/// Eligible singles of one sex in one settlement, with their ages. Stale
/// set members are skipped.
async fn singles(world: &WorldState, sex: Sex, settlement: EntityId, today: NaiveDate) -> Vec<(EntityId, u32)> {
    let mut out = Vec::new();
    for id in world.eligible_persons(sex, settlement).await {
        let Some(person) = world.persons.get(id).await else {
            continue;
        };
        if person.sex != sex || !world.rules().person_eligible(&person, today) {
            continue;
        }
        if let Some(age) = person.age_years(today) {
            out.push((id, age));
        }
    }
    out
}

// =============================================================================
// Conception
// =============================================================================

/// Roll conception for every fertile family. A conceiving family is marked
/// expecting and enqueued by its due date. Returns the families that
/// conceived.
///
/// # Errors
///
/// Returns [`EntityError`] if a family update fails.
pub async fn run_conception<R: Rng + Send>(
    world: &WorldState,
    rules: &LifecycleRules,
    today: NaiveDate,
    rng: &mut R,
) -> Result<Vec<EntityId>, EntityError> {
    let mut conceived = Vec::new();
    for id in world.fertile_families().await {
        let Some(family) = world.families.get(id).await else {
            continue;
        };
        let wife = match family.partner_b_id {
            Some(wife_id) => world.persons.get(wife_id).await,
            None => None,
        };
        if !world.rules().family_fertile(&family, wife.as_ref(), today) {
            continue;
        }
        let Some(wife_age) = wife.and_then(|w| w.age_years(today)) else {
            continue;
        };

        let chance = rules.conception_chance(wife_age, family.offspring_ids.len());
        if rng.random::<f64>() >= chance {
            continue;
        }

        let due = rules.due_date(today);
        let patch = FamilyPatch {
            is_expecting: Some(true),
            due_date: Some(Some(due)),
            ..FamilyPatch::default()
        };
        world.update_family(id, &patch, today).await?;
        if let Err(e) = world.queue().enqueue(id, due).await {
            tracing::warn!(family = %id, error = %e, "Expecting family not enqueued");
        }
        debug!(family = %id, due = %due, "Conceived");
        conceived.push(id);
    }
    Ok(conceived)
}

// =============================================================================
// Birth
// =============================================================================

/// Delivers children for families whose due date has come.
pub struct BirthHandler<'a> {
    world: &'a WorldState,
    today: NaiveDate,
    rng: Mutex<StdRng>,
}

impl<'a> BirthHandler<'a> {
    /// A handler for deliveries on `today`.
    pub fn new(world: &'a WorldState, today: NaiveDate, seed: u64) -> Self {
        Self {
            world,
            today,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn child_sex(&self) -> Sex {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        Sex::from_is_male(rng.random_bool(0.5))
    }
}

impl DeliveryHandler for BirthHandler<'_> {
    async fn deliver(&self, family_id: EntityId) -> Result<(), DeliveryError> {
        let Some(family) = self.world.families.get(family_id).await else {
            return Err(DeliveryError::Rejected(format!("family {family_id} no longer exists")));
        };
        if !family.is_expecting {
            return Err(DeliveryError::Rejected(format!("family {family_id} is not expecting")));
        }

        let draft = Person::new(EntityId::Provisional(0), family.settlement_id, self.child_sex(), self.today);
        let Some(child) = self.world.create_person(draft, self.today).await? else {
            return Err(DeliveryError::Rejected(format!("child of {family_id} not stored")));
        };

        let mut offspring = family.offspring_ids;
        offspring.push(child.id);
        let patch = FamilyPatch {
            is_expecting: Some(false),
            due_date: Some(None),
            offspring_ids: Some(offspring),
            ..FamilyPatch::default()
        };
        self.world.update_family(family_id, &patch, self.today).await?;
        debug!(family = %family_id, child = %child.id, sex = child.sex.as_str(), "Child born");
        Ok(())
    }
}

// =============================================================================
// Seeding
// =============================================================================

/// A generated world with provisional ids, ready for
/// [`ReconciliationEngine::regenerate`](gridworld_db::ReconciliationEngine::regenerate).
#[derive(Debug, Default)]
pub struct SeedWorld {
    /// Generated settlements.
    pub settlements: Vec<Settlement>,
    /// Generated persons, spread evenly across the settlements.
    pub persons: Vec<Person>,
}

/// Generate `settlements` settlements of `persons_per_settlement` unpartnered
/// persons each, aged 0 to 59 years on `today`, of random sex.
pub fn seed_world<R: Rng>(settlements: u32, persons_per_settlement: u32, today: NaiveDate, rng: &mut R) -> SeedWorld {
    let ids = IdAllocator::new();
    let mut world = SeedWorld::default();
    for tile_id in 0..settlements {
        let settlement = Settlement {
            id: ids.next_provisional(),
            tile_id,
            chunk_index: 0,
            housing_capacity: persons_per_settlement.saturating_mul(2),
            food_stores: i64::from(persons_per_settlement).saturating_mul(10),
        };
        for _ in 0..persons_per_settlement {
            let age = rng.random_range(0..SEED_MAX_AGE);
            let day_of_year = rng.random_range(0..365_u64);
            let birth_date = today
                .checked_sub_months(Months::new(age.saturating_mul(12)))
                .and_then(|d| d.checked_sub_days(chrono::Days::new(day_of_year)))
                .unwrap_or(today);
            let sex = Sex::from_is_male(rng.random_bool(0.5));
            world
                .persons
                .push(Person::new(ids.next_provisional(), Some(settlement.id), sex, birth_date));
        }
        world.settlements.push(settlement);
    }
    world
}
