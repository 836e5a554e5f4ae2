//! Bidirectional sync between the entity stores and the durable store.
//!
//! # Load
//!
//! Clears the cache, reads `villages`, `people` and `family` in that order,
//! adds every row with its durable id, then rebuilds the derived sets and
//! requeues expecting families. Skipped when the adapter is not `Ready`.
//!
//! # Flush
//!
//! ```text
//! 1. delete   pending families, persons, settlements (references cleared first)
//! 2. insert   pending settlements   -> reassign ids
//! 3. insert   pending persons       -> reassign ids
//!    insert   pending families      -> reassign ids
//! 4. update   pending updates of every kind (markers cleared first)
//! 5. clear    processed delete markers
//! ```
//!
//! Persons go in before families so partner and offspring ids are durable
//! when a family row is written. A person whose family is still provisional
//! is written with `NULL` and marked for update when the family gets its id,
//! which step 4 then picks up.
//!
//! Load and flush never overlap. A flush requested while another sync is
//! running is dropped with [`FlushOutcome::AlreadyRunning`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::NaiveDate;
use gridworld_types::{EntityId, EntityKind, Family, IdMapping, Person, Settlement};
use tokio::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::durable::DurableStore;
use crate::entity_store::{EntityError, EntityStore, Indexed};
use crate::error::DbError;
use crate::keys::PendingOp;
use crate::world_state::{DerivedCounts, WorldState};

/// Errors raised while loading or flushing. Never swallowed.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The durable store rejected a query or write.
    #[error("durable store error: {0}")]
    Durable(#[from] DbError),

    /// An entity store precondition failed.
    #[error("entity store error: {0}")]
    Entity(#[from] EntityError),
}

/// A day-advancement scheduler that must hold still during load and flush.
pub trait PausableScheduler: Send + Sync {
    /// Stop advancing days after the current tick.
    fn pause(&self);
    /// Continue advancing days.
    fn resume(&self);
    /// Whether the scheduler is paused.
    fn is_paused(&self) -> bool;
    /// The simulated date the scheduler is on.
    fn today(&self) -> NaiveDate;
}

/// Per-call context for load and flush.
#[derive(Clone, Copy)]
pub struct ReconcileContext<'a> {
    /// Scheduler to pause for the duration of the call.
    pub scheduler: Option<&'a dyn PausableScheduler>,
    /// Simulated date used to evaluate eligibility.
    pub today: NaiveDate,
}

impl<'a> ReconcileContext<'a> {
    /// Context with no scheduler to pause.
    pub const fn detached(today: NaiveDate) -> Self {
        Self {
            scheduler: None,
            today,
        }
    }

    /// Context bound to `scheduler`, evaluated on its current date.
    pub fn with_scheduler(scheduler: &'a dyn PausableScheduler) -> Self {
        Self {
            scheduler: Some(scheduler),
            today: scheduler.today(),
        }
    }
}

/// Pauses a scheduler and resumes it on drop, unless it was already paused
/// by someone else.
struct PauseGuard<'a> {
    paused: Option<&'a dyn PausableScheduler>,
}

impl<'a> PauseGuard<'a> {
    fn engage(scheduler: Option<&'a dyn PausableScheduler>) -> Self {
        let paused = scheduler.filter(|s| !s.is_paused());
        if let Some(scheduler) = paused {
            scheduler.pause();
        }
        Self { paused }
    }
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        if let Some(scheduler) = self.paused {
            scheduler.resume();
        }
    }
}

/// Holds the regeneration flag for its lifetime.
#[must_use = "regeneration is only flagged while the guard is alive"]
pub struct RegenerationGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for RegenerationGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Result of [`ReconciliationEngine::load_from_durable_store`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// The adapter was not ready; nothing was loaded.
    pub skipped: bool,
    /// Settlements added to the cache.
    pub settlements: usize,
    /// Persons added to the cache.
    pub persons: usize,
    /// Families added to the cache.
    pub families: usize,
    /// Derived sets rebuilt after the load.
    pub derived: DerivedCounts,
}

/// Per-phase counts of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Families deleted.
    pub deleted_families: u64,
    /// Persons deleted.
    pub deleted_persons: u64,
    /// Settlements deleted.
    pub deleted_settlements: u64,
    /// Settlements inserted.
    pub inserted_settlements: usize,
    /// Persons inserted.
    pub inserted_persons: usize,
    /// Families inserted.
    pub inserted_families: usize,
    /// Rows updated across all kinds.
    pub updated: usize,
    /// Write calls issued to the durable store.
    pub durable_writes: usize,
}

impl FlushReport {
    /// Whether the flush touched the durable store at all.
    pub const fn is_noop(&self) -> bool {
        self.durable_writes == 0
    }
}

/// What happened to a flush request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The flush ran.
    Completed(FlushReport),
    /// Another load or flush was in progress; this request was dropped.
    AlreadyRunning,
}

/// Owner of startup load and flush.
pub struct ReconciliationEngine {
    world: Arc<WorldState>,
    durable: Arc<DurableStore>,
    sync: Mutex<()>,
    regenerating: Arc<AtomicBool>,
}

impl ReconciliationEngine {
    /// Bind the engine to a world and a durable store.
    pub fn new(world: Arc<WorldState>, durable: Arc<DurableStore>) -> Self {
        Self {
            world,
            durable,
            sync: Mutex::new(()),
            regenerating: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The world this engine reconciles.
    pub const fn world(&self) -> &Arc<WorldState> {
        &self.world
    }

    /// The durable store this engine writes to.
    pub const fn durable(&self) -> &Arc<DurableStore> {
        &self.durable
    }

    // =========================================================================
    // Load
    // =========================================================================

    /// Replace the cache contents with the durable store's rows.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Durable`] if a query fails and
    /// [`ReconcileError::Entity`] if a row cannot be added.
    pub async fn load_from_durable_store(&self, ctx: &ReconcileContext<'_>) -> Result<LoadReport, ReconcileError> {
        if !self.world.adapter().is_available() {
            tracing::warn!(state = ?self.world.adapter().state(), "Adapter not ready, skipping load");
            return Ok(LoadReport {
                skipped: true,
                ..LoadReport::default()
            });
        }

        let _sync = self.sync.lock().await;
        let _pause = PauseGuard::engage(ctx.scheduler);
        self.load_locked(ctx.today).await
    }

    async fn load_locked(&self, today: NaiveDate) -> Result<LoadReport, ReconcileError> {
        self.world.clear().await;

        let mut report = LoadReport::default();
        for kind in EntityKind::LOAD_ORDER {
            match kind {
                EntityKind::Settlement => {
                    let rows = self.durable.load_settlements().await?;
                    report.settlements = add_all(&self.world.settlements, &rows).await?;
                }
                EntityKind::Person => {
                    let rows = self.durable.load_persons().await?;
                    report.persons = add_all(&self.world.persons, &rows).await?;
                }
                EntityKind::Family => {
                    let rows = self.durable.load_families().await?;
                    report.families = add_all(&self.world.families, &rows).await?;
                }
            }
        }
        report.derived = self.world.rebuild_derived(today).await;

        tracing::info!(
            settlements = report.settlements,
            persons = report.persons,
            families = report.families,
            eligible = report.derived.eligible_persons,
            fertile = report.derived.fertile_families,
            queued = report.derived.queued_families,
            "Loaded world from durable store"
        );
        Ok(report)
    }

    // =========================================================================
    // Flush
    // =========================================================================

    /// Persist every pending operation. Dropped if another sync is running.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError`] if a durable write fails. Steps completed
    /// before the failure stay applied; unprocessed markers stay pending.
    pub async fn flush(&self, ctx: &ReconcileContext<'_>) -> Result<FlushOutcome, ReconcileError> {
        let Ok(_sync) = self.sync.try_lock() else {
            tracing::debug!("Sync in progress, dropping flush request");
            return Ok(FlushOutcome::AlreadyRunning);
        };
        let _pause = PauseGuard::engage(ctx.scheduler);
        self.flush_locked().await.map(FlushOutcome::Completed)
    }

    async fn flush_locked(&self) -> Result<FlushReport, ReconcileError> {
        let world = &self.world;
        let mut report = FlushReport::default();

        // 1. Deletes, referrers first.
        let family_deletes = world.families.pending_deletes().await;
        let person_deletes = world.persons.pending_deletes().await;
        let settlement_deletes = world.settlements.pending_deletes().await;
        if !family_deletes.is_empty() {
            report.deleted_families = self.durable.delete_families(&row_ids(&family_deletes)).await?;
            report.durable_writes = report.durable_writes.saturating_add(1);
        }
        if !person_deletes.is_empty() {
            report.deleted_persons = self.durable.delete_persons(&row_ids(&person_deletes)).await?;
            report.durable_writes = report.durable_writes.saturating_add(1);
        }
        if !settlement_deletes.is_empty() {
            report.deleted_settlements = self.durable.delete_settlements(&row_ids(&settlement_deletes)).await?;
            report.durable_writes = report.durable_writes.saturating_add(1);
        }

        // 2-3. Inserts with immediate reassignment.
        report.inserted_settlements = self.insert_pending(&world.settlements).await?;
        report.inserted_persons = self.insert_pending(&world.persons).await?;
        report.inserted_families = self.insert_pending(&world.families).await?;
        report.durable_writes = report
            .durable_writes
            .saturating_add(report.inserted_settlements)
            .saturating_add(report.inserted_persons)
            .saturating_add(report.inserted_families);

        // 4. Updates.
        report.updated = self
            .update_pending(&world.settlements)
            .await?
            .saturating_add(self.update_pending(&world.persons).await?)
            .saturating_add(self.update_pending(&world.families).await?);
        report.durable_writes = report.durable_writes.saturating_add(report.updated);

        // 5. Clear processed deletes.
        let mut pipeline = world.adapter().pipeline();
        pipeline = EntityStore::<Family>::clear_pending(pipeline, PendingOp::Delete, &family_deletes);
        pipeline = EntityStore::<Person>::clear_pending(pipeline, PendingOp::Delete, &person_deletes);
        pipeline = EntityStore::<Settlement>::clear_pending(pipeline, PendingOp::Delete, &settlement_deletes);
        if let Err(e) = pipeline.exec().await {
            tracing::warn!(error = %e, "Failed to clear processed delete markers; they will be replayed");
        }

        if report.is_noop() {
            tracing::debug!("Flush found nothing pending");
        } else {
            tracing::info!(
                deleted_families = report.deleted_families,
                deleted_persons = report.deleted_persons,
                deleted_settlements = report.deleted_settlements,
                inserted_settlements = report.inserted_settlements,
                inserted_persons = report.inserted_persons,
                inserted_families = report.inserted_families,
                updated = report.updated,
                "Flushed pending operations to durable store"
            );
        }
        Ok(report)
    }

    /// Insert every pending-insert entity of one kind and move each to its
    /// durable id. Markers whose entity has vanished are dropped.
    ///
    /// Rows written before a failed insert are still reassigned, so a retry
    /// never writes them twice.
    async fn insert_pending<E: Persisted>(&self, store: &EntityStore<E>) -> Result<usize, ReconcileError> {
        let mut mappings = Vec::new();
        let mut failure = None;
        for id in store.pending_inserts().await {
            let Some(entity) = store.get(id).await else {
                tracing::warn!(kind = %E::KIND, id = %id, "Pending insert has no entity, dropping marker");
                let pipeline = EntityStore::<E>::clear_pending(store.adapter().pipeline(), PendingOp::Insert, &[id]);
                if let Err(e) = pipeline.exec().await {
                    tracing::warn!(kind = %E::KIND, id = %id, error = %e, "Failed to drop orphaned insert marker");
                }
                continue;
            };
            match E::insert_into(&self.durable, &entity).await {
                Ok(durable) => {
                    if entity.has_provisional_reference() {
                        tracing::debug!(kind = %E::KIND, id = %durable, "Inserted with NULL for provisional references");
                    }
                    mappings.push(IdMapping::new(id, durable));
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        self.world.reassign_ids(E::KIND, &mappings).await?;
        match failure {
            Some(e) => {
                tracing::warn!(kind = %E::KIND, inserted = mappings.len(), error = %e, "Insert failed partway through flush");
                Err(e.into())
            }
            None => Ok(mappings.len()),
        }
    }

    /// Write every pending-update entity of one kind.
    ///
    /// Markers are cleared before the entities are read, so a write racing
    /// the flush marks its entity again. Entities not yet written when a
    /// durable write fails are marked again before the error returns.
    async fn update_pending<E: Persisted>(&self, store: &EntityStore<E>) -> Result<usize, ReconcileError> {
        let ids = store.pending_updates().await;
        if ids.is_empty() {
            return Ok(0);
        }
        let cleared = EntityStore::<E>::clear_pending(store.adapter().pipeline(), PendingOp::Update, &ids);
        if let Err(e) = cleared.exec().await {
            tracing::warn!(kind = %E::KIND, error = %e, "Failed to clear update markers; they will be replayed");
        }

        let mut updated = 0_usize;
        for (index, id) in ids.iter().enumerate() {
            let Some(entity) = fetch_durable(store, *id).await else {
                continue;
            };
            if let Err(e) = E::update_in(&self.durable, &entity).await {
                for unwritten in ids.get(index..).unwrap_or_default() {
                    store.mark_pending(PendingOp::Update, *unwritten).await;
                }
                return Err(e.into());
            }
            updated = updated.saturating_add(1);
        }
        Ok(updated)
    }

    // =========================================================================
    // Regeneration
    // =========================================================================

    /// Flag a full-world regeneration for the guard's lifetime. Recovery
    /// reloads are skipped while the flag is set.
    pub fn begin_regeneration(&self) -> RegenerationGuard {
        self.regenerating.store(true, Ordering::SeqCst);
        RegenerationGuard {
            flag: Arc::clone(&self.regenerating),
        }
    }

    /// Whether a regeneration is in progress.
    pub fn is_regenerating(&self) -> bool {
        self.regenerating.load(Ordering::SeqCst)
    }

    /// Replace the whole world, in cache and durable store, with freshly
    /// generated provisional entities, then flush them.
    ///
    /// Settlement references inside `persons` and `families` must use the
    /// provisional ids given to `settlements`.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError`] if the truncate, an add, or the flush
    /// fails.
    pub async fn regenerate(
        &self,
        ctx: &ReconcileContext<'_>,
        settlements: &[Settlement],
        persons: &[Person],
        families: &[Family],
    ) -> Result<FlushReport, ReconcileError> {
        let _regeneration = self.begin_regeneration();
        let _sync = self.sync.lock().await;
        let _pause = PauseGuard::engage(ctx.scheduler);

        tracing::info!(
            settlements = settlements.len(),
            persons = persons.len(),
            families = families.len(),
            "Regenerating world"
        );
        self.world.clear().await;
        self.durable.truncate_all().await?;

        add_all_provisional(&self.world.settlements, settlements).await?;
        add_all_provisional(&self.world.persons, persons).await?;
        add_all_provisional(&self.world.families, families).await?;
        self.world.rebuild_derived(ctx.today).await;

        self.flush_locked().await
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Reload the world every time the adapter recovers from degradation,
    /// unless a regeneration is in progress.
    pub fn spawn_recovery_listener(self: &Arc<Self>, scheduler: Arc<dyn PausableScheduler>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut recovered = engine.world.adapter().subscribe_recovered();
        tokio::spawn(async move {
            loop {
                match recovered.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => {
                        tracing::debug!("Adapter gone, recovery listener stopping");
                        return;
                    }
                }
                if engine.is_regenerating() {
                    tracing::info!("Regeneration in progress, skipping recovery reload");
                    continue;
                }
                let ctx = ReconcileContext::with_scheduler(scheduler.as_ref());
                match engine.load_from_durable_store(&ctx).await {
                    Ok(report) if report.skipped => {
                        tracing::warn!("Recovery reload skipped, adapter not ready");
                    }
                    Ok(_) => tracing::info!("Cache reloaded after recovery"),
                    Err(e) => tracing::error!(error = %e, "Recovery reload failed"),
                }
            }
        })
    }
}

fn row_ids(ids: &[EntityId]) -> Vec<i64> {
    ids.iter().filter_map(|id| id.row_id()).collect()
}

async fn add_all<E: Indexed>(store: &EntityStore<E>, rows: &[E]) -> Result<usize, EntityError> {
    let mut added = 0_usize;
    for row in rows {
        if store.add(row, false).await? {
            added = added.saturating_add(1);
        }
    }
    Ok(added)
}

async fn add_all_provisional<E: Indexed>(store: &EntityStore<E>, rows: &[E]) -> Result<usize, EntityError> {
    let mut added = 0_usize;
    for row in rows {
        if store.add(row, true).await? {
            added = added.saturating_add(1);
        }
    }
    Ok(added)
}

async fn fetch_durable<E: Indexed>(store: &EntityStore<E>, id: EntityId) -> Option<E> {
    match store.get(id).await {
        Some(entity) if entity.id().is_durable() => Some(entity),
        Some(_) => {
            tracing::warn!(kind = %E::KIND, id = %id, "Skipping update of provisional entity");
            None
        }
        None => {
            tracing::debug!(kind = %E::KIND, id = %id, "Updated entity no longer cached");
            None
        }
    }
}

/// Entity kinds with a durable table.
trait Persisted: Indexed {
    /// Insert `entity` as a new row and return its durable id.
    fn insert_into(durable: &DurableStore, entity: &Self) -> impl Future<Output = Result<EntityId, DbError>> + Send;

    /// Overwrite the row of a durable `entity`.
    fn update_in(durable: &DurableStore, entity: &Self) -> impl Future<Output = Result<(), DbError>> + Send;
}

impl Persisted for Settlement {
    async fn insert_into(durable: &DurableStore, entity: &Self) -> Result<EntityId, DbError> {
        durable.insert_settlement(entity).await
    }

    async fn update_in(durable: &DurableStore, entity: &Self) -> Result<(), DbError> {
        durable.update_settlement(entity).await
    }
}

impl Persisted for Person {
    async fn insert_into(durable: &DurableStore, entity: &Self) -> Result<EntityId, DbError> {
        durable.insert_person(entity).await
    }

    async fn update_in(durable: &DurableStore, entity: &Self) -> Result<(), DbError> {
        durable.update_person(entity).await
    }
}

impl Persisted for Family {
    async fn insert_into(durable: &DurableStore, entity: &Self) -> Result<EntityId, DbError> {
        durable.insert_family(entity).await
    }

    async fn update_in(durable: &DurableStore, entity: &Self) -> Result<(), DbError> {
        durable.update_family(entity).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use gridworld_types::{FamilyPatch, PersonPatch, Sex};

    use super::*;
    use crate::adapter::{AdapterState, StorageAdapter};
    use crate::durable::MemoryDurableStore;
    use crate::eligibility::EligibilityRules;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn today() -> NaiveDate {
        date(4020, 1, 1)
    }

    fn make_engine(durable: MemoryDurableStore) -> ReconciliationEngine {
        let world = WorldState::new(Arc::new(StorageAdapter::in_memory()), EligibilityRules::default());
        ReconciliationEngine::new(Arc::new(world), Arc::new(DurableStore::Memory(durable)))
    }

    fn memory(engine: &ReconciliationEngine) -> &MemoryDurableStore {
        match engine.durable().as_ref() {
            DurableStore::Memory(memory) => memory,
            DurableStore::Postgres(_) => unreachable!(),
        }
    }

    fn village(id: EntityId) -> Settlement {
        Settlement {
            id,
            tile_id: 4,
            chunk_index: 1,
            housing_capacity: 20,
            food_stores: 100,
        }
    }

    fn seeded() -> MemoryDurableStore {
        let v = village(EntityId::Durable(1));
        let him = {
            let mut p = Person::new(EntityId::Durable(2), Some(v.id), Sex::Male, date(3995, 4, 1));
            p.family_id = Some(EntityId::Durable(5));
            p
        };
        let her = {
            let mut p = Person::new(EntityId::Durable(3), Some(v.id), Sex::Female, date(3998, 8, 1));
            p.family_id = Some(EntityId::Durable(5));
            p
        };
        let single = Person::new(EntityId::Durable(4), Some(v.id), Sex::Female, date(3999, 1, 1));
        let mut family = Family::new(EntityId::Durable(5), him.id, her.id, Some(v.id));
        family.is_expecting = true;
        family.due_date = Some(date(4020, 3, 1));
        MemoryDurableStore::with_rows(vec![v], vec![him, her, single], vec![family])
    }

    #[derive(Default)]
    struct CountingScheduler {
        paused: AtomicBool,
        resumes: AtomicUsize,
    }

    impl PausableScheduler for CountingScheduler {
        fn pause(&self) {
            self.paused.store(true, Ordering::SeqCst);
        }
        fn resume(&self) {
            self.paused.store(false, Ordering::SeqCst);
            self.resumes.fetch_add(1, Ordering::SeqCst);
        }
        fn is_paused(&self) -> bool {
            self.paused.load(Ordering::SeqCst)
        }
        fn today(&self) -> NaiveDate {
            today()
        }
    }

    #[tokio::test]
    async fn provisional_person_gets_durable_id_on_flush() {
        let engine = make_engine(MemoryDurableStore::with_rows(vec![village(EntityId::Durable(3))], Vec::new(), Vec::new()));
        let world = engine.world();
        let person = Person::new(EntityId::Provisional(1), Some(EntityId::Durable(3)), Sex::Female, date(4001, 1, 1));
        world.persons.add(&person, true).await.unwrap();

        let outcome = engine.flush(&ReconcileContext::detached(today())).await.unwrap();
        let FlushOutcome::Completed(report) = outcome else {
            panic!("flush dropped");
        };
        assert_eq!(report.inserted_persons, 1);

        let durable = EntityId::Durable(4);
        assert_eq!(world.persons.get(person.id).await, None);
        let mut expected = person.clone();
        expected.id = durable;
        assert_eq!(world.persons.get(durable).await, Some(expected));
        assert!(world.persons.pending_inserts().await.is_empty());
    }

    #[tokio::test]
    async fn load_then_flush_writes_nothing() {
        let engine = make_engine(seeded());
        let scheduler = CountingScheduler::default();
        let ctx = ReconcileContext::with_scheduler(&scheduler);

        let report = engine.load_from_durable_store(&ctx).await.unwrap();
        assert_eq!((report.settlements, report.persons, report.families), (1, 3, 1));
        assert_eq!(report.derived.eligible_persons, 1);
        assert_eq!(report.derived.queued_families, 1);
        assert_eq!(scheduler.resumes.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_paused());

        let writes_before = memory(&engine).writes().await;
        let FlushOutcome::Completed(flush) = engine.flush(&ctx).await.unwrap() else {
            panic!("flush dropped");
        };
        assert!(flush.is_noop());
        assert_eq!(memory(&engine).writes().await, writes_before);
        let world = engine.world();
        assert!(world.persons.pending_updates().await.is_empty());
        assert!(world.families.pending_inserts().await.is_empty());
    }

    #[tokio::test]
    async fn new_family_reaches_durable_store_with_real_ids() {
        let engine = make_engine(seeded());
        let ctx = ReconcileContext::detached(today());
        engine.load_from_durable_store(&ctx).await.unwrap();
        let world = engine.world();

        let groom = world
            .create_person(Person::new(EntityId::Provisional(0), Some(EntityId::Durable(1)), Sex::Male, date(3997, 1, 1)), today())
            .await
            .unwrap()
            .unwrap();
        let family = world.create_family(groom.id, EntityId::Durable(4), today()).await.unwrap().unwrap();

        let FlushOutcome::Completed(report) = engine.flush(&ctx).await.unwrap() else {
            panic!("flush dropped");
        };
        assert_eq!(report.inserted_persons, 1);
        assert_eq!(report.inserted_families, 1);

        // Groom is row 6, family row 7 (after seeded rows 1-5).
        let groom_row = memory(&engine).person(6).await.unwrap();
        assert_eq!(groom_row.family_id, Some(EntityId::Durable(7)));
        let family_row = memory(&engine).family(7).await.unwrap();
        assert_eq!(family_row.partner_a_id, Some(EntityId::Durable(6)));
        assert_eq!(family_row.partner_b_id, Some(EntityId::Durable(4)));
        let bride_row = memory(&engine).person(4).await.unwrap();
        assert_eq!(bride_row.family_id, Some(EntityId::Durable(7)));

        assert!(world.families.get(family.id).await.is_none());
        assert!(world.persons.pending_updates().await.is_empty());
        assert!(world.families.pending_inserts().await.is_empty());
        assert_eq!(world.fertile_families().await, vec![EntityId::Durable(7)]);
    }

    #[tokio::test]
    async fn deletes_run_before_inserts_and_clear_markers() {
        let engine = make_engine(seeded());
        let ctx = ReconcileContext::detached(today());
        engine.load_from_durable_store(&ctx).await.unwrap();
        let world = engine.world();

        world.remove_family(EntityId::Durable(5), today()).await.unwrap();
        let FlushOutcome::Completed(report) = engine.flush(&ctx).await.unwrap() else {
            panic!("flush dropped");
        };
        assert_eq!(report.deleted_families, 1);
        assert_eq!(report.updated, 2);
        assert!(memory(&engine).family(5).await.is_none());
        assert_eq!(memory(&engine).person(2).await.and_then(|p| p.family_id), None);
        assert!(world.families.pending_deletes().await.is_empty());
        assert!(!world.queue().contains(EntityId::Durable(5)).await.unwrap());
    }

    #[tokio::test]
    async fn durable_update_is_written() {
        let engine = make_engine(seeded());
        let ctx = ReconcileContext::detached(today());
        engine.load_from_durable_store(&ctx).await.unwrap();
        let patch = FamilyPatch {
            is_expecting: Some(false),
            due_date: Some(None),
            ..FamilyPatch::default()
        };
        engine.world().update_family(EntityId::Durable(5), &patch, today()).await.unwrap();
        engine.flush(&ctx).await.unwrap();
        let row = memory(&engine).family(5).await.unwrap();
        assert!(!row.is_expecting);
        assert_eq!(row.due_date, None);
    }

    #[tokio::test]
    async fn failed_durable_write_propagates_and_keeps_markers() {
        let engine = make_engine(seeded());
        let ctx = ReconcileContext::detached(today());
        engine.load_from_durable_store(&ctx).await.unwrap();
        let patch = PersonPatch {
            birth_date: Some(date(3999, 2, 2)),
            ..PersonPatch::default()
        };
        engine.world().update_person(EntityId::Durable(4), &patch, today()).await.unwrap();

        memory(&engine).set_failing(true).await;
        assert!(matches!(engine.flush(&ctx).await, Err(ReconcileError::Durable(_))));
        assert_eq!(engine.world().persons.pending_updates().await, vec![EntityId::Durable(4)]);
    }

    #[tokio::test]
    async fn inserts_written_before_a_failure_are_not_repeated() {
        let engine = make_engine(MemoryDurableStore::with_rows(vec![village(EntityId::Durable(3))], Vec::new(), Vec::new()));
        let world = engine.world();
        for raw in 1..=2 {
            let person = Person::new(EntityId::Provisional(raw), Some(EntityId::Durable(3)), Sex::Female, date(4001, 1, 1));
            world.persons.add(&person, true).await.unwrap();
        }
        let ctx = ReconcileContext::detached(today());

        memory(&engine).limit_writes(Some(1)).await;
        assert!(matches!(engine.flush(&ctx).await, Err(ReconcileError::Durable(_))));
        assert_eq!(memory(&engine).person_count().await, 1);
        assert_eq!(world.persons.pending_inserts().await, vec![EntityId::Provisional(2)]);
        assert!(world.persons.get(EntityId::Durable(4)).await.is_some());
        assert!(world.persons.get(EntityId::Provisional(1)).await.is_none());

        memory(&engine).limit_writes(None).await;
        engine.flush(&ctx).await.unwrap();
        assert_eq!(memory(&engine).person_count().await, 2);
        assert_eq!(world.persons.count().await, 2);
        assert!(world.persons.pending_inserts().await.is_empty());
    }

    #[tokio::test]
    async fn unwritten_updates_are_marked_again_after_failure() {
        let engine = make_engine(seeded());
        let ctx = ReconcileContext::detached(today());
        engine.load_from_durable_store(&ctx).await.unwrap();
        let patch = PersonPatch {
            birth_date: Some(date(3999, 2, 2)),
            ..PersonPatch::default()
        };
        for raw in [3, 4] {
            engine.world().update_person(EntityId::Durable(raw), &patch, today()).await.unwrap();
        }

        memory(&engine).limit_writes(Some(1)).await;
        assert!(matches!(engine.flush(&ctx).await, Err(ReconcileError::Durable(_))));
        assert_eq!(engine.world().persons.pending_updates().await, vec![EntityId::Durable(4)]);
        assert_eq!(memory(&engine).person(3).await.map(|p| p.birth_date), Some(date(3999, 2, 2)));

        memory(&engine).limit_writes(None).await;
        engine.flush(&ctx).await.unwrap();
        assert_eq!(memory(&engine).person(4).await.map(|p| p.birth_date), Some(date(3999, 2, 2)));
        assert!(engine.world().persons.pending_updates().await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_flush_is_dropped() {
        let engine = make_engine(MemoryDurableStore::new());
        let held = engine.sync.lock().await;
        let outcome = engine.flush(&ReconcileContext::detached(today())).await.unwrap();
        assert_eq!(outcome, FlushOutcome::AlreadyRunning);
        drop(held);
        assert!(matches!(
            engine.flush(&ReconcileContext::detached(today())).await.unwrap(),
            FlushOutcome::Completed(_)
        ));
    }

    #[tokio::test]
    async fn load_skipped_when_adapter_not_ready() {
        let world = WorldState::new(
            Arc::new(StorageAdapter::detached(AdapterState::Degraded)),
            EligibilityRules::default(),
        );
        let engine = ReconciliationEngine::new(Arc::new(world), Arc::new(DurableStore::Memory(seeded())));
        let report = engine.load_from_durable_store(&ReconcileContext::detached(today())).await.unwrap();
        assert!(report.skipped);
        assert_eq!(report.persons, 0);
    }

    #[tokio::test]
    async fn scheduler_paused_elsewhere_stays_paused() {
        let engine = make_engine(seeded());
        let scheduler = CountingScheduler::default();
        scheduler.pause();
        engine
            .load_from_durable_store(&ReconcileContext::with_scheduler(&scheduler))
            .await
            .unwrap();
        assert!(scheduler.is_paused());
        assert_eq!(scheduler.resumes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn regeneration_flag_follows_guard() {
        let engine = make_engine(MemoryDurableStore::new());
        {
            let _guard = engine.begin_regeneration();
            assert!(engine.is_regenerating());
        }
        assert!(!engine.is_regenerating());
    }

    #[tokio::test]
    async fn regenerate_replaces_world() {
        let engine = make_engine(seeded());
        let ctx = ReconcileContext::detached(today());
        let v = village(EntityId::Provisional(1));
        let p = Person::new(EntityId::Provisional(2), Some(v.id), Sex::Male, date(4000, 1, 1));

        let report = engine.regenerate(&ctx, &[v], &[p], &[]).await.unwrap();
        assert_eq!(report.inserted_settlements, 1);
        assert_eq!(report.inserted_persons, 1);
        assert!(!engine.is_regenerating());

        let persons = engine.durable().load_persons().await.unwrap();
        assert_eq!(persons.len(), 1);
        assert_eq!(persons.first().and_then(|p| p.settlement_id), Some(EntityId::Durable(1)));
        assert_eq!(engine.world().persons.count().await, 1);
    }
}
