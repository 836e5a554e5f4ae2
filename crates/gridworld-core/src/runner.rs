//! Calendar loop runner.
//!
//! [`run_calendar`] advances the simulated date one day per tick and runs
//! the daily passes against the shared world:
//!
//! - **Ageing**: eligibility and fertility re-evaluated for every entity
//! - **Mortality**: deaths by age bracket, dissolving the families they break
//! - **Matchmaking** and **conception** through [`lifecycle`](crate::lifecycle)
//! - **Births**: due families drained through the delivery coordinator
//! - **Flush**: every `flush_every_ticks` days, and once more on exit
//!
//! The loop honors [`CalendarControl`] pause and stop requests and is the
//! only caller that flushes on a schedule.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use gridworld_db::{
    DeliveryCoordinator, EntityError, FlushOutcome, FlushReport, PausableScheduler, ReconcileContext,
    ReconcileError, ReconciliationEngine, WorldState,
};
use rand::Rng;
use rand::rngs::StdRng;
use tracing::{info, warn};

use crate::calendar::{CalendarControl, CalendarEndReason};
use crate::lifecycle::{self, BirthHandler, LifecycleRules};

/// Errors that end the calendar loop.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// A flush failed.
    #[error("reconcile error: {source}")]
    Reconcile {
        /// The underlying reconciliation error.
        #[from]
        source: ReconcileError,
    },

    /// A life-cycle pass failed.
    #[error("entity error: {source}")]
    Entity {
        /// The underlying entity store error.
        #[from]
        source: EntityError,
    },
}

/// Loop parameters that do not change at runtime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSettings {
    /// Mortality, matchmaking, conception and gestation rules.
    pub lifecycle: LifecycleRules,
    /// Flush every N days (0 flushes only on exit).
    pub flush_every_ticks: u64,
}

/// What happened on one simulated day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickSummary {
    /// Days run so far, including this one.
    pub day: u64,
    /// The simulated date of this tick.
    pub date: NaiveDate,
    /// Persons who died.
    pub deaths: usize,
    /// Families formed by matchmaking.
    pub families_formed: usize,
    /// Families that conceived.
    pub conceptions: usize,
    /// Children delivered.
    pub births: usize,
    /// Deliveries abandoned after exhausting lock attempts.
    pub missed_deliveries: usize,
    /// Deliveries whose handler failed.
    pub failed_deliveries: usize,
    /// Flush performed at the end of this tick, if any.
    pub flush: Option<FlushReport>,
}

/// Result of the calendar run.
#[derive(Debug)]
pub struct CalendarResult {
    /// Why the loop ended.
    pub end_reason: CalendarEndReason,
    /// The last tick summary, if any day ran.
    pub final_summary: Option<TickSummary>,
    /// Total days run.
    pub total_days: u64,
    /// Outcome of the exit flush.
    pub final_flush: FlushOutcome,
}

/// Callback invoked after each tick.
pub trait TickCallback: Send {
    /// Called after a day completes.
    fn on_tick(&mut self, summary: &TickSummary, world: &WorldState);
}

/// A tick callback that does nothing.
pub struct NoOpCallback;

impl TickCallback for NoOpCallback {
    fn on_tick(&mut self, _summary: &TickSummary, _world: &WorldState) {}
}

/// Run the calendar until the day limit or a stop request.
///
/// # Errors
///
/// Returns [`RunnerError`] if a flush or a life-cycle write fails. A
/// failed flush is never retried here.
pub async fn run_calendar(
    engine: &ReconciliationEngine,
    coordinator: &DeliveryCoordinator,
    control: &Arc<CalendarControl>,
    settings: &RunSettings,
    rng: &mut StdRng,
    callback: &mut dyn TickCallback,
) -> Result<CalendarResult, RunnerError> {
    let world = engine.world();
    let mut last_summary: Option<TickSummary> = None;
    let mut total_days: u64 = 0;

    info!(
        start = %control.current_date(),
        max_days = control.max_days(),
        tick_interval_ms = control.tick_interval_ms(),
        flush_every_ticks = settings.flush_every_ticks,
        "Calendar starting"
    );

    let end_reason = loop {
        if control.is_paused() {
            info!("Calendar paused, waiting for resume...");
            control.wait_if_paused().await;
            info!("Calendar resumed");
        }
        if control.is_stop_requested() {
            info!("Calendar stop requested");
            break CalendarEndReason::StopRequested;
        }
        if control.day_limit_reached(total_days) {
            info!(days = total_days, "Day limit reached");
            break CalendarEndReason::MaxDaysReached;
        }

        let today = control.advance();
        total_days = total_days.saturating_add(1);
        let mut summary = run_day(world, coordinator, &settings.lifecycle, today, total_days, rng).await?;

        if settings.flush_every_ticks > 0 && total_days.is_multiple_of(settings.flush_every_ticks) {
            summary.flush = flush(engine, control).await?;
        }

        callback.on_tick(&summary, world);
        last_summary = Some(summary);

        let interval = control.tick_interval_ms();
        if interval > 0 {
            tokio::time::sleep(Duration::from_millis(interval)).await;
        }
    };

    let final_flush = engine
        .flush(&ReconcileContext::with_scheduler(control.as_ref()))
        .await?;

    Ok(CalendarResult {
        end_reason,
        final_summary: last_summary,
        total_days,
        final_flush,
    })
}

/// Run every daily pass for `today`.
async fn run_day(
    world: &WorldState,
    coordinator: &DeliveryCoordinator,
    rules: &LifecycleRules,
    today: NaiveDate,
    day: u64,
    rng: &mut StdRng,
) -> Result<TickSummary, RunnerError> {
    age_world(world, today).await;

    let deceased = lifecycle::run_mortality(world, rules, today, rng).await?;
    let formed = lifecycle::run_matchmaking(world, rules, today, rng).await?;
    let conceived = lifecycle::run_conception(world, rules, today, rng).await?;

    let handler = BirthHandler::new(world, today, rng.random());
    let drained = coordinator.drain_due(today, &handler).await;

    Ok(TickSummary {
        day,
        date: today,
        deaths: deceased.len(),
        families_formed: formed.len(),
        conceptions: conceived.len(),
        births: drained.delivered(),
        missed_deliveries: drained.missed(),
        failed_deliveries: drained.failed(),
        flush: None,
    })
}

/// Re-evaluate eligibility and fertility for everyone on `today`.
///
/// Unlike a full rebuild this never requeues expecting families, so a
/// missed delivery stays missed.
async fn age_world(world: &WorldState, today: NaiveDate) {
    for person in world.persons.get_all().await {
        world.refresh_person_eligibility(&person, today).await;
    }
    for family in world.families.get_all().await {
        world.refresh_family_fertility(&family, today).await;
    }
}

async fn flush(engine: &ReconciliationEngine, control: &Arc<CalendarControl>) -> Result<Option<FlushReport>, RunnerError> {
    match engine
        .flush(&ReconcileContext::with_scheduler(control.as_ref()))
        .await?
    {
        FlushOutcome::Completed(report) => Ok(Some(report)),
        FlushOutcome::AlreadyRunning => {
            warn!("Scheduled flush skipped, another sync is running");
            Ok(None)
        }
    }
}

/// Log the final result of the calendar run.
pub fn log_calendar_end(result: &CalendarResult) {
    let (births, date) = result
        .final_summary
        .as_ref()
        .map_or((0, None), |s| (s.births, Some(s.date)));
    let final_flush = match &result.final_flush {
        FlushOutcome::Completed(report) => report.durable_writes,
        FlushOutcome::AlreadyRunning => 0,
    };
    info!(
        reason = ?result.end_reason,
        total_days = result.total_days,
        last_date = ?date,
        last_day_births = births,
        final_flush_writes = final_flush,
        "Calendar ended"
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use gridworld_db::{DeliveryPolicy, DurableStore, EligibilityRules, MemoryDurableStore, StorageAdapter};
    use gridworld_types::{EntityId, Person, Settlement, Sex};
    use rand::SeedableRng;

    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn make_engine(durable: MemoryDurableStore) -> ReconciliationEngine {
        let world = Arc::new(WorldState::new(
            Arc::new(StorageAdapter::in_memory()),
            EligibilityRules::default(),
        ));
        ReconciliationEngine::new(world, Arc::new(DurableStore::Memory(durable)))
    }

    fn make_coordinator(engine: &ReconciliationEngine) -> DeliveryCoordinator {
        let world = engine.world();
        DeliveryCoordinator::new(
            Arc::clone(world.adapter()),
            world.queue().clone(),
            DeliveryPolicy::default(),
        )
    }

    fn settings(conception_rate: f64, flush_every_ticks: u64) -> RunSettings {
        RunSettings {
            lifecycle: LifecycleRules {
                conception_rate,
                mortality_scale: 0.0,
                ..LifecycleRules::default()
            },
            flush_every_ticks,
        }
    }

    fn couple_world() -> MemoryDurableStore {
        let village = Settlement {
            id: EntityId::Durable(1),
            tile_id: 4,
            chunk_index: 0,
            housing_capacity: 20,
            food_stores: 100,
        };
        let man = Person::new(EntityId::Durable(2), Some(village.id), Sex::Male, date(3975, 3, 1));
        let woman = Person::new(EntityId::Durable(3), Some(village.id), Sex::Female, date(3978, 7, 1));
        MemoryDurableStore::with_rows(vec![village], vec![man, woman], Vec::new())
    }

    struct Counter {
        ticks: u64,
        births: usize,
    }

    impl TickCallback for Counter {
        fn on_tick(&mut self, summary: &TickSummary, _world: &WorldState) {
            self.ticks = self.ticks.saturating_add(1);
            self.births = self.births.saturating_add(summary.births);
        }
    }

    #[tokio::test]
    async fn bounded_by_max_days() {
        let engine = make_engine(MemoryDurableStore::new());
        let coordinator = make_coordinator(&engine);
        let control = Arc::new(CalendarControl::new(date(4000, 1, 1), 0, 5));
        let mut rng = StdRng::seed_from_u64(1);

        let result = run_calendar(&engine, &coordinator, &control, &settings(0.0, 0), &mut rng, &mut NoOpCallback)
            .await
            .unwrap();

        assert_eq!(result.end_reason, CalendarEndReason::MaxDaysReached);
        assert_eq!(result.total_days, 5);
        assert_eq!(control.current_date(), date(4000, 1, 6));
        assert_eq!(result.final_summary.unwrap().date, date(4000, 1, 6));
        assert!(!control.is_paused());
    }

    #[tokio::test]
    async fn stop_request_ends_before_first_day() {
        let engine = make_engine(MemoryDurableStore::new());
        let coordinator = make_coordinator(&engine);
        let control = Arc::new(CalendarControl::new(date(4000, 1, 1), 0, 0));
        control.request_stop();
        let mut rng = StdRng::seed_from_u64(1);

        let result = run_calendar(&engine, &coordinator, &control, &settings(0.0, 0), &mut rng, &mut NoOpCallback)
            .await
            .unwrap();

        assert_eq!(result.end_reason, CalendarEndReason::StopRequested);
        assert_eq!(result.total_days, 0);
        assert!(result.final_summary.is_none());
    }

    #[tokio::test]
    async fn couple_marries_conceives_and_delivers() {
        let engine = make_engine(couple_world());
        engine
            .load_from_durable_store(&ReconcileContext::detached(date(4000, 1, 1)))
            .await
            .unwrap();
        let coordinator = make_coordinator(&engine);
        let control = Arc::new(CalendarControl::new(date(4000, 1, 1), 0, 300));
        let mut rng = StdRng::seed_from_u64(9);
        let mut counter = Counter { ticks: 0, births: 0 };

        let result = run_calendar(&engine, &coordinator, &control, &settings(1.0, 30), &mut rng, &mut counter)
            .await
            .unwrap();

        assert_eq!(counter.ticks, 300);
        assert_eq!(counter.births, 1);
        let FlushOutcome::Completed(_) = result.final_flush else {
            panic!("final flush dropped");
        };

        let durable = engine.durable();
        let persons = durable.load_persons().await.unwrap();
        let families = durable.load_families().await.unwrap();
        assert_eq!(persons.len(), 3);
        assert_eq!(families.len(), 1);
        let family = families.first().unwrap();
        assert_eq!(family.offspring_ids.len(), 1);
        assert!(family.offspring_ids.iter().all(|id| id.is_durable()));
        assert!(persons.iter().all(|p| p.id.is_durable()));
    }

    #[tokio::test]
    async fn death_reaches_durable_store_as_delete() {
        let engine = make_engine(couple_world());
        engine
            .load_from_durable_store(&ReconcileContext::detached(date(4000, 1, 1)))
            .await
            .unwrap();
        let coordinator = make_coordinator(&engine);
        let control = Arc::new(CalendarControl::new(date(4000, 1, 1), 0, 1));
        let mut rng = StdRng::seed_from_u64(3);
        let deadly = RunSettings {
            lifecycle: LifecycleRules {
                mortality_scale: 1_000.0,
                ..LifecycleRules::default()
            },
            flush_every_ticks: 0,
        };

        let result = run_calendar(&engine, &coordinator, &control, &deadly, &mut rng, &mut NoOpCallback)
            .await
            .unwrap();

        assert_eq!(result.final_summary.unwrap().deaths, 2);
        let FlushOutcome::Completed(report) = result.final_flush else {
            panic!("final flush dropped");
        };
        assert_eq!(report.deleted_persons, 2);
        assert!(engine.durable().load_persons().await.unwrap().is_empty());
        assert!(engine.world().persons.pending_deletes().await.is_empty());
    }

    #[tokio::test]
    async fn flush_error_ends_the_loop() {
        let durable = MemoryDurableStore::new();
        durable.set_failing(true).await;
        let engine = make_engine(durable);
        let village = Settlement {
            id: EntityId::Provisional(1),
            tile_id: 0,
            chunk_index: 0,
            housing_capacity: 1,
            food_stores: 0,
        };
        engine.world().settlements.add(&village, true).await.unwrap();
        let coordinator = make_coordinator(&engine);
        let control = Arc::new(CalendarControl::new(date(4000, 1, 1), 0, 10));
        let mut rng = StdRng::seed_from_u64(1);

        let result = run_calendar(&engine, &coordinator, &control, &settings(0.0, 2), &mut rng, &mut NoOpCallback).await;

        assert!(matches!(result, Err(RunnerError::Reconcile { .. })));
        assert_eq!(control.current_date(), date(4000, 1, 3));
        assert!(!control.is_paused());
    }
}
