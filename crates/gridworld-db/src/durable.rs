//! Durable store seam used by the reconciliation engine.
//!
//! [`DurableStore`] dispatches to either the `PostgreSQL` implementation or
//! an in-process table set. Enum dispatch is used instead of a trait object
//! because async methods are not dyn-compatible.
//!
//! # Column mapping
//!
//! | Table | Columns |
//! |-------|---------|
//! | `villages` | `id`, `tile_id`, `land_chunk_index`, `housing_capacity`, `food_stores` |
//! | `people` | `id`, `village_id`, `sex` (true = male), `date_of_birth`, `family_id` |
//! | `family` | `id`, `husband_id`, `wife_id`, `pregnancy`, `delivery_date`, `children_ids`, `village_id` |
//!
//! Foreign keys that are still provisional when a row is written are stored
//! as `NULL`; the reconciliation engine schedules an update once the
//! referenced entity has its durable id.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use gridworld_types::{EntityId, Family, Person, Settlement, Sex};
use sqlx::PgPool;
use tokio::sync::Mutex;

use crate::error::DbError;

// =============================================================================
// Rows
// =============================================================================

/// A row from the `villages` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VillageRow {
    /// Primary key.
    pub id: i64,
    /// Tile the village sits on.
    pub tile_id: i32,
    /// Land chunk within the tile.
    pub land_chunk_index: i32,
    /// Housing capacity.
    pub housing_capacity: i32,
    /// Food units in storage.
    pub food_stores: i64,
}

/// A row from the `people` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PersonRow {
    /// Primary key.
    pub id: i64,
    /// Village the person lives in.
    pub village_id: Option<i64>,
    /// `true` for male.
    pub sex: bool,
    /// Date of birth.
    pub date_of_birth: NaiveDate,
    /// Family the person belongs to.
    pub family_id: Option<i64>,
}

/// A row from the `family` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FamilyRow {
    /// Primary key.
    pub id: i64,
    /// Husband.
    pub husband_id: Option<i64>,
    /// Wife.
    pub wife_id: Option<i64>,
    /// Whether a delivery is scheduled.
    pub pregnancy: bool,
    /// Scheduled delivery date.
    pub delivery_date: Option<NaiveDate>,
    /// Children, oldest first.
    pub children_ids: Option<Vec<i64>>,
    /// Village the family lives in.
    pub village_id: Option<i64>,
}

fn own_id(table: &'static str, id: i64) -> Result<EntityId, DbError> {
    EntityId::from_row_id(id).ok_or(DbError::InvalidRowId { table, id })
}

fn reference(table: &'static str, id: Option<i64>) -> Result<Option<EntityId>, DbError> {
    id.map(|raw| own_id(table, raw)).transpose()
}

fn unsigned(table: &'static str, column: &'static str, id: i64, value: i32) -> Result<u32, DbError> {
    u32::try_from(value)
        .ok()
        .ok_or(DbError::InvalidColumn { table, column, id })
}

/// Durable row id for a foreign key, or `None` if it is absent or still
/// provisional.
fn durable_ref(id: Option<EntityId>) -> Option<i64> {
    id.and_then(EntityId::row_id)
}

fn signed(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn row_id_of(id: EntityId) -> Result<i64, DbError> {
    id.row_id().ok_or(DbError::UnexpectedProvisional(id))
}

impl TryFrom<VillageRow> for Settlement {
    type Error = DbError;

    fn try_from(row: VillageRow) -> Result<Self, DbError> {
        Ok(Self {
            id: own_id("villages", row.id)?,
            tile_id: unsigned("villages", "tile_id", row.id, row.tile_id)?,
            chunk_index: unsigned("villages", "land_chunk_index", row.id, row.land_chunk_index)?,
            housing_capacity: unsigned("villages", "housing_capacity", row.id, row.housing_capacity)?,
            food_stores: row.food_stores,
        })
    }
}

impl TryFrom<PersonRow> for Person {
    type Error = DbError;

    fn try_from(row: PersonRow) -> Result<Self, DbError> {
        Ok(Self {
            id: own_id("people", row.id)?,
            settlement_id: reference("people", row.village_id)?,
            sex: Sex::from_is_male(row.sex),
            birth_date: row.date_of_birth,
            family_id: reference("people", row.family_id)?,
        })
    }
}

impl TryFrom<FamilyRow> for Family {
    type Error = DbError;

    fn try_from(row: FamilyRow) -> Result<Self, DbError> {
        let offspring_ids = row
            .children_ids
            .unwrap_or_default()
            .into_iter()
            .map(|child| own_id("family", child))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            id: own_id("family", row.id)?,
            partner_a_id: reference("family", row.husband_id)?,
            partner_b_id: reference("family", row.wife_id)?,
            is_expecting: row.pregnancy,
            due_date: row.delivery_date,
            offspring_ids,
            settlement_id: reference("family", row.village_id)?,
        })
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// The durable relational store.
pub enum DurableStore {
    /// `PostgreSQL` tables.
    Postgres(PgDurableStore),
    /// In-process tables.
    Memory(MemoryDurableStore),
}

/// Forward a call to the active variant.
macro_rules! forward {
    ($self:ident, $method:ident ( $($arg:expr),* )) => {
        match $self {
            Self::Postgres(store) => store.$method($($arg),*).await,
            Self::Memory(store) => store.$method($($arg),*).await,
        }
    };
}

impl DurableStore {
    /// Every row of `villages`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails or a row is malformed.
    pub async fn load_settlements(&self) -> Result<Vec<Settlement>, DbError> {
        forward!(self, load_settlements())
    }

    /// Every row of `people`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails or a row is malformed.
    pub async fn load_persons(&self) -> Result<Vec<Person>, DbError> {
        forward!(self, load_persons())
    }

    /// Every row of `family`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails or a row is malformed.
    pub async fn load_families(&self) -> Result<Vec<Family>, DbError> {
        forward!(self, load_families())
    }

    /// Insert a settlement, returning its durable id.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the insert fails.
    pub async fn insert_settlement(&self, settlement: &Settlement) -> Result<EntityId, DbError> {
        forward!(self, insert_settlement(settlement))
    }

    /// Insert a person, returning its durable id. Provisional foreign keys
    /// are written as `NULL`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the insert fails.
    pub async fn insert_person(&self, person: &Person) -> Result<EntityId, DbError> {
        forward!(self, insert_person(person))
    }

    /// Insert a family, returning its durable id. Provisional foreign keys
    /// are written as `NULL` (and dropped from `children_ids`).
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the insert fails.
    pub async fn insert_family(&self, family: &Family) -> Result<EntityId, DbError> {
        forward!(self, insert_family(family))
    }

    /// Overwrite a settlement row.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::UnexpectedProvisional`] for a provisional id, or
    /// [`DbError::Postgres`] if the update fails.
    pub async fn update_settlement(&self, settlement: &Settlement) -> Result<(), DbError> {
        forward!(self, update_settlement(settlement))
    }

    /// Overwrite a person row.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::UnexpectedProvisional`] for a provisional id, or
    /// [`DbError::Postgres`] if the update fails.
    pub async fn update_person(&self, person: &Person) -> Result<(), DbError> {
        forward!(self, update_person(person))
    }

    /// Overwrite a family row.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::UnexpectedProvisional`] for a provisional id, or
    /// [`DbError::Postgres`] if the update fails.
    pub async fn update_family(&self, family: &Family) -> Result<(), DbError> {
        forward!(self, update_family(family))
    }

    /// Delete families, first clearing `people.family_id` references.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if either statement fails.
    pub async fn delete_families(&self, ids: &[i64]) -> Result<u64, DbError> {
        if ids.is_empty() {
            return Ok(0);
        }
        forward!(self, delete_families(ids))
    }

    /// Delete persons, first clearing `family.husband_id`/`wife_id`
    /// references.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if either statement fails.
    pub async fn delete_persons(&self, ids: &[i64]) -> Result<u64, DbError> {
        if ids.is_empty() {
            return Ok(0);
        }
        forward!(self, delete_persons(ids))
    }

    /// Delete villages, first clearing `village_id` on people and families.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if any statement fails.
    pub async fn delete_settlements(&self, ids: &[i64]) -> Result<u64, DbError> {
        if ids.is_empty() {
            return Ok(0);
        }
        forward!(self, delete_settlements(ids))
    }

    /// Remove every row from all three tables. Used by world regeneration.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the truncate fails.
    pub async fn truncate_all(&self) -> Result<(), DbError> {
        forward!(self, truncate_all())
    }
}

// =============================================================================
// PostgreSQL
// =============================================================================

/// Durable store backed by `PostgreSQL`.
///
/// Uses runtime query construction (not compile-time checked) so builds do
/// not need a live database.
#[derive(Clone)]
pub struct PgDurableStore {
    pool: PgPool,
}

impl PgDurableStore {
    /// Bind to a connection pool.
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_settlements(&self) -> Result<Vec<Settlement>, DbError> {
        let rows = sqlx::query_as::<_, VillageRow>(
            r"SELECT id, tile_id, land_chunk_index, housing_capacity, food_stores
              FROM villages
              ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Settlement::try_from).collect()
    }

    async fn load_persons(&self) -> Result<Vec<Person>, DbError> {
        let rows = sqlx::query_as::<_, PersonRow>(
            r"SELECT id, village_id, sex, date_of_birth, family_id
              FROM people
              ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Person::try_from).collect()
    }

    async fn load_families(&self) -> Result<Vec<Family>, DbError> {
        let rows = sqlx::query_as::<_, FamilyRow>(
            r"SELECT id, husband_id, wife_id, pregnancy, delivery_date, children_ids, village_id
              FROM family
              ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Family::try_from).collect()
    }

    async fn insert_settlement(&self, settlement: &Settlement) -> Result<EntityId, DbError> {
        let id: i64 = sqlx::query_scalar(
            r"INSERT INTO villages (tile_id, land_chunk_index, housing_capacity, food_stores)
              VALUES ($1, $2, $3, $4)
              RETURNING id",
        )
        .bind(signed(settlement.tile_id))
        .bind(signed(settlement.chunk_index))
        .bind(signed(settlement.housing_capacity))
        .bind(settlement.food_stores)
        .fetch_one(&self.pool)
        .await?;
        own_id("villages", id)
    }

    async fn insert_person(&self, person: &Person) -> Result<EntityId, DbError> {
        let id: i64 = sqlx::query_scalar(
            r"INSERT INTO people (village_id, sex, date_of_birth, family_id)
              VALUES ($1, $2, $3, $4)
              RETURNING id",
        )
        .bind(durable_ref(person.settlement_id))
        .bind(person.sex.is_male())
        .bind(person.birth_date)
        .bind(durable_ref(person.family_id))
        .fetch_one(&self.pool)
        .await?;
        own_id("people", id)
    }

    async fn insert_family(&self, family: &Family) -> Result<EntityId, DbError> {
        let children: Vec<i64> = family
            .offspring_ids
            .iter()
            .filter_map(|child| child.row_id())
            .collect();
        let id: i64 = sqlx::query_scalar(
            r"INSERT INTO family (husband_id, wife_id, pregnancy, delivery_date, children_ids, village_id)
              VALUES ($1, $2, $3, $4, $5, $6)
              RETURNING id",
        )
        .bind(durable_ref(family.partner_a_id))
        .bind(durable_ref(family.partner_b_id))
        .bind(family.is_expecting)
        .bind(family.due_date)
        .bind(&children)
        .bind(durable_ref(family.settlement_id))
        .fetch_one(&self.pool)
        .await?;
        own_id("family", id)
    }

    async fn update_settlement(&self, settlement: &Settlement) -> Result<(), DbError> {
        sqlx::query(
            r"UPDATE villages
              SET tile_id = $2, land_chunk_index = $3, housing_capacity = $4, food_stores = $5
              WHERE id = $1",
        )
        .bind(row_id_of(settlement.id)?)
        .bind(signed(settlement.tile_id))
        .bind(signed(settlement.chunk_index))
        .bind(signed(settlement.housing_capacity))
        .bind(settlement.food_stores)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_person(&self, person: &Person) -> Result<(), DbError> {
        sqlx::query(
            r"UPDATE people
              SET village_id = $2, sex = $3, date_of_birth = $4, family_id = $5
              WHERE id = $1",
        )
        .bind(row_id_of(person.id)?)
        .bind(durable_ref(person.settlement_id))
        .bind(person.sex.is_male())
        .bind(person.birth_date)
        .bind(durable_ref(person.family_id))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_family(&self, family: &Family) -> Result<(), DbError> {
        let children: Vec<i64> = family
            .offspring_ids
            .iter()
            .filter_map(|child| child.row_id())
            .collect();
        sqlx::query(
            r"UPDATE family
              SET husband_id = $2, wife_id = $3, pregnancy = $4, delivery_date = $5,
                  children_ids = $6, village_id = $7
              WHERE id = $1",
        )
        .bind(row_id_of(family.id)?)
        .bind(durable_ref(family.partner_a_id))
        .bind(durable_ref(family.partner_b_id))
        .bind(family.is_expecting)
        .bind(family.due_date)
        .bind(&children)
        .bind(durable_ref(family.settlement_id))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_families(&self, ids: &[i64]) -> Result<u64, DbError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(r"UPDATE people SET family_id = NULL WHERE family_id = ANY($1)")
            .bind(ids)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query(r"DELETE FROM family WHERE id = ANY($1)")
            .bind(ids)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted)
    }

    async fn delete_persons(&self, ids: &[i64]) -> Result<u64, DbError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(r"UPDATE family SET husband_id = NULL WHERE husband_id = ANY($1)")
            .bind(ids)
            .execute(&mut *tx)
            .await?;
        sqlx::query(r"UPDATE family SET wife_id = NULL WHERE wife_id = ANY($1)")
            .bind(ids)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query(r"DELETE FROM people WHERE id = ANY($1)")
            .bind(ids)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted)
    }

    async fn delete_settlements(&self, ids: &[i64]) -> Result<u64, DbError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(r"UPDATE people SET village_id = NULL WHERE village_id = ANY($1)")
            .bind(ids)
            .execute(&mut *tx)
            .await?;
        sqlx::query(r"UPDATE family SET village_id = NULL WHERE village_id = ANY($1)")
            .bind(ids)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query(r"DELETE FROM villages WHERE id = ANY($1)")
            .bind(ids)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(deleted)
    }

    async fn truncate_all(&self) -> Result<(), DbError> {
        sqlx::query(r"TRUNCATE family, people, villages RESTART IDENTITY CASCADE")
            .execute(&self.pool)
            .await?;
        tracing::warn!("Truncated family, people and villages");
        Ok(())
    }
}

// =============================================================================
// In-process
// =============================================================================

#[derive(Debug, Default)]
struct Tables {
    villages: BTreeMap<u64, Settlement>,
    people: BTreeMap<u64, Person>,
    families: BTreeMap<u64, Family>,
    next_id: u64,
    writes: u64,
    failing: bool,
    write_budget: Option<u64>,
}

impl Tables {
    fn check(&self) -> Result<(), DbError> {
        if self.failing {
            Err(DbError::Postgres(sqlx::Error::PoolTimedOut))
        } else {
            Ok(())
        }
    }

    fn check_write(&mut self) -> Result<(), DbError> {
        self.check()?;
        match self.write_budget {
            Some(0) => Err(DbError::Postgres(sqlx::Error::PoolTimedOut)),
            Some(left) => {
                self.write_budget = Some(left.saturating_sub(1));
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn allocate(&mut self) -> u64 {
        self.next_id = self.next_id.saturating_add(1);
        self.next_id
    }

    fn observe(&mut self, id: EntityId) {
        if let Some(raw) = id.durable() {
            self.next_id = self.next_id.max(raw);
        }
    }
}

/// Keep a foreign key only if it is durable, the way a `NULL` column would.
fn strip_provisional(id: Option<EntityId>) -> Option<EntityId> {
    id.filter(|r| r.is_durable())
}

/// Durable store held in process memory.
///
/// Mirrors the `PostgreSQL` store's semantics (sequence ids, `NULL` for
/// provisional references, reference clearing before deletes) and counts
/// every write so callers can check that a flush did nothing.
#[derive(Debug, Default)]
pub struct MemoryDurableStore {
    tables: Mutex<Tables>,
}

impl MemoryDurableStore {
    /// Empty tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tables pre-populated with durable rows. Sequence ids continue after
    /// the largest seeded id.
    pub fn with_rows(settlements: Vec<Settlement>, persons: Vec<Person>, families: Vec<Family>) -> Self {
        let mut tables = Tables::default();
        for s in settlements {
            tables.observe(s.id);
            if let Some(raw) = s.id.durable() {
                tables.villages.insert(raw, s);
            }
        }
        for p in persons {
            tables.observe(p.id);
            if let Some(raw) = p.id.durable() {
                tables.people.insert(raw, p);
            }
        }
        for f in families {
            tables.observe(f.id);
            if let Some(raw) = f.id.durable() {
                tables.families.insert(raw, f);
            }
        }
        Self {
            tables: Mutex::new(tables),
        }
    }

    /// Number of write statements executed so far.
    pub async fn writes(&self) -> u64 {
        self.tables.lock().await.writes
    }

    /// Make every subsequent call fail as if the pool timed out.
    pub async fn set_failing(&self, failing: bool) {
        self.tables.lock().await.failing = failing;
    }

    /// Let `budget` more row inserts or updates succeed, then fail each of
    /// them until the budget is lifted with `None`.
    pub async fn limit_writes(&self, budget: Option<u64>) {
        self.tables.lock().await.write_budget = budget;
    }

    /// Number of rows in `people`.
    pub async fn person_count(&self) -> usize {
        self.tables.lock().await.people.len()
    }

    /// Current `people` row for `id`.
    pub async fn person(&self, id: u64) -> Option<Person> {
        self.tables.lock().await.people.get(&id).cloned()
    }

    /// Current `family` row for `id`.
    pub async fn family(&self, id: u64) -> Option<Family> {
        self.tables.lock().await.families.get(&id).cloned()
    }

    /// Current `villages` row for `id`.
    pub async fn settlement(&self, id: u64) -> Option<Settlement> {
        self.tables.lock().await.villages.get(&id).cloned()
    }

    async fn load_settlements(&self) -> Result<Vec<Settlement>, DbError> {
        let tables = self.tables.lock().await;
        tables.check()?;
        Ok(tables.villages.values().cloned().collect())
    }

    async fn load_persons(&self) -> Result<Vec<Person>, DbError> {
        let tables = self.tables.lock().await;
        tables.check()?;
        Ok(tables.people.values().cloned().collect())
    }

    async fn load_families(&self) -> Result<Vec<Family>, DbError> {
        let tables = self.tables.lock().await;
        tables.check()?;
        Ok(tables.families.values().cloned().collect())
    }

    async fn insert_settlement(&self, settlement: &Settlement) -> Result<EntityId, DbError> {
        let mut tables = self.tables.lock().await;
        tables.check_write()?;
        let raw = tables.allocate();
        let mut row = settlement.clone();
        row.id = EntityId::Durable(raw);
        tables.villages.insert(raw, row);
        tables.writes = tables.writes.saturating_add(1);
        Ok(EntityId::Durable(raw))
    }

    async fn insert_person(&self, person: &Person) -> Result<EntityId, DbError> {
        let mut tables = self.tables.lock().await;
        tables.check_write()?;
        let raw = tables.allocate();
        let mut row = person.clone();
        row.id = EntityId::Durable(raw);
        row.settlement_id = strip_provisional(row.settlement_id);
        row.family_id = strip_provisional(row.family_id);
        tables.people.insert(raw, row);
        tables.writes = tables.writes.saturating_add(1);
        Ok(EntityId::Durable(raw))
    }

    async fn insert_family(&self, family: &Family) -> Result<EntityId, DbError> {
        let mut tables = self.tables.lock().await;
        tables.check_write()?;
        let raw = tables.allocate();
        tables.families.insert(raw, durable_family_row(family, EntityId::Durable(raw)));
        tables.writes = tables.writes.saturating_add(1);
        Ok(EntityId::Durable(raw))
    }

    async fn update_settlement(&self, settlement: &Settlement) -> Result<(), DbError> {
        let raw = settlement
            .id
            .durable()
            .ok_or(DbError::UnexpectedProvisional(settlement.id))?;
        let mut tables = self.tables.lock().await;
        tables.check_write()?;
        if let Some(row) = tables.villages.get_mut(&raw) {
            row.clone_from(settlement);
        }
        tables.writes = tables.writes.saturating_add(1);
        Ok(())
    }

    async fn update_person(&self, person: &Person) -> Result<(), DbError> {
        let raw = person
            .id
            .durable()
            .ok_or(DbError::UnexpectedProvisional(person.id))?;
        let mut tables = self.tables.lock().await;
        tables.check_write()?;
        if let Some(row) = tables.people.get_mut(&raw) {
            row.clone_from(person);
            row.settlement_id = strip_provisional(row.settlement_id);
            row.family_id = strip_provisional(row.family_id);
        }
        tables.writes = tables.writes.saturating_add(1);
        Ok(())
    }

    async fn update_family(&self, family: &Family) -> Result<(), DbError> {
        let raw = family
            .id
            .durable()
            .ok_or(DbError::UnexpectedProvisional(family.id))?;
        let mut tables = self.tables.lock().await;
        tables.check_write()?;
        if tables.families.contains_key(&raw) {
            tables.families.insert(raw, durable_family_row(family, family.id));
        }
        tables.writes = tables.writes.saturating_add(1);
        Ok(())
    }

    async fn delete_families(&self, ids: &[i64]) -> Result<u64, DbError> {
        let mut tables = self.tables.lock().await;
        tables.check()?;
        let targets: Vec<EntityId> = ids.iter().filter_map(|id| EntityId::from_row_id(*id)).collect();
        for person in tables.people.values_mut() {
            if person.family_id.is_some_and(|f| targets.contains(&f)) {
                person.family_id = None;
            }
        }
        let mut deleted = 0_u64;
        for target in &targets {
            if let Some(raw) = target.durable()
                && tables.families.remove(&raw).is_some()
            {
                deleted = deleted.saturating_add(1);
            }
        }
        tables.writes = tables.writes.saturating_add(2);
        Ok(deleted)
    }

    async fn delete_persons(&self, ids: &[i64]) -> Result<u64, DbError> {
        let mut tables = self.tables.lock().await;
        tables.check()?;
        let targets: Vec<EntityId> = ids.iter().filter_map(|id| EntityId::from_row_id(*id)).collect();
        for family in tables.families.values_mut() {
            if family.partner_a_id.is_some_and(|p| targets.contains(&p)) {
                family.partner_a_id = None;
            }
            if family.partner_b_id.is_some_and(|p| targets.contains(&p)) {
                family.partner_b_id = None;
            }
        }
        let mut deleted = 0_u64;
        for target in &targets {
            if let Some(raw) = target.durable()
                && tables.people.remove(&raw).is_some()
            {
                deleted = deleted.saturating_add(1);
            }
        }
        tables.writes = tables.writes.saturating_add(3);
        Ok(deleted)
    }

    async fn delete_settlements(&self, ids: &[i64]) -> Result<u64, DbError> {
        let mut tables = self.tables.lock().await;
        tables.check()?;
        let targets: Vec<EntityId> = ids.iter().filter_map(|id| EntityId::from_row_id(*id)).collect();
        for person in tables.people.values_mut() {
            if person.settlement_id.is_some_and(|s| targets.contains(&s)) {
                person.settlement_id = None;
            }
        }
        for family in tables.families.values_mut() {
            if family.settlement_id.is_some_and(|s| targets.contains(&s)) {
                family.settlement_id = None;
            }
        }
        let mut deleted = 0_u64;
        for target in &targets {
            if let Some(raw) = target.durable()
                && tables.villages.remove(&raw).is_some()
            {
                deleted = deleted.saturating_add(1);
            }
        }
        tables.writes = tables.writes.saturating_add(3);
        Ok(deleted)
    }

    async fn truncate_all(&self) -> Result<(), DbError> {
        let mut tables = self.tables.lock().await;
        tables.check()?;
        tables.villages.clear();
        tables.people.clear();
        tables.families.clear();
        tables.next_id = 0;
        tables.writes = tables.writes.saturating_add(1);
        Ok(())
    }
}

fn durable_family_row(family: &Family, id: EntityId) -> Family {
    let mut row = family.clone();
    row.id = id;
    row.partner_a_id = strip_provisional(row.partner_a_id);
    row.partner_b_id = strip_provisional(row.partner_b_id);
    row.settlement_id = strip_provisional(row.settlement_id);
    row.offspring_ids.retain(|child| child.is_durable());
    row
}
