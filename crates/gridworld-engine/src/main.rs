//! Engine binary for the Gridworld simulation.
//!
//! Wires the cache, the durable store, the reconciliation engine, the
//! delivery coordinator and the integrity auditor together, then runs the
//! calendar loop until its day limit or Ctrl-C.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `gridworld-config.yaml`
//! 2. Initialize structured logging (tracing)
//! 3. Connect to `PostgreSQL` (fail fast)
//! 4. Connect the storage adapter and spawn its supervisor
//! 5. Wait for the cache, continuing degraded if the fallback allows it
//! 6. Load the world from the durable store, seeding an empty store if
//!    configured
//! 7. Run the startup integrity audit
//! 8. Spawn the recovery listener and the periodic audit
//! 9. Run the calendar loop and log the result

mod error;
mod progress;

use std::sync::Arc;
use std::time::Duration;

use gridworld_core::calendar::CalendarControl;
use gridworld_core::config::{GridworldConfig, LoggingConfig};
use gridworld_core::lifecycle;
use gridworld_core::runner::{self, RunSettings};
use gridworld_db::{
    DeliveryCoordinator, DurableStore, IntegrityAuditor, PausableScheduler, PgDurableStore,
    PostgresPool, ReconcileContext, ReconciliationEngine, StorageAdapter, WorldState,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::EngineError;
use crate::progress::ProgressCallback;

/// Days between progress summaries.
const PROGRESS_EVERY_DAYS: u64 = 30;

/// Application entry point for the engine.
///
/// # Errors
///
/// Returns an error if any startup step or the calendar run fails.
#[tokio::main]
#[allow(clippy::too_many_lines)]
async fn main() -> Result<(), EngineError> {
    // 1. Load configuration.
    let config = GridworldConfig::load()?;

    // 2. Initialize structured logging.
    init_logging(&config.logging)?;
    info!(
        dragonfly = config.infrastructure.dragonfly_url.as_deref().unwrap_or("<none>"),
        fallback_enabled = config.infrastructure.fallback_enabled,
        start_date = %config.calendar.start_date,
        tick_interval_ms = config.calendar.tick_interval_ms,
        "gridworld-engine starting"
    );

    // 3. Durable store. No reachable durable store is fatal.
    let pool = PostgresPool::connect(&config.infrastructure.postgres_config()).await?;
    let durable = Arc::new(DurableStore::Postgres(PgDurableStore::new(pool.pool().clone())));

    // 4. Storage adapter and its supervisor.
    let adapter_config = config.infrastructure.adapter_config();
    let (adapter, supervisor) = StorageAdapter::connect(&adapter_config).await?;
    let adapter = Arc::new(adapter);
    let _supervisor = tokio::spawn(supervisor.run());

    // 5. Wait for the cache.
    if tokio::time::timeout(adapter_config.ready_timeout, adapter.wait_for_ready())
        .await
        .is_err()
    {
        warn!(
            timeout_ms = config.infrastructure.ready_timeout_ms,
            "Cache not ready, continuing on the in-process fallback"
        );
    }

    let world = Arc::new(WorldState::new(Arc::clone(&adapter), config.eligibility.rules()));
    let engine = Arc::new(ReconciliationEngine::new(Arc::clone(&world), Arc::clone(&durable)));
    let control = Arc::new(CalendarControl::new(
        config.calendar.start_date,
        config.calendar.tick_interval_ms,
        config.calendar.max_days,
    ));
    let scheduler: Arc<dyn PausableScheduler> = Arc::<CalendarControl>::clone(&control);
    let mut rng = config
        .seed
        .rng_seed
        .map_or_else(|| StdRng::from_rng(&mut rand::rng()), StdRng::seed_from_u64);

    // 6. Load, seeding an empty world if asked to.
    let today = control.current_date();
    let loaded = engine
        .load_from_durable_store(&ReconcileContext::with_scheduler(control.as_ref()))
        .await?;
    if loaded.skipped {
        warn!("Cache degraded at startup, load deferred until it recovers");
    } else if loaded.settlements == 0 && loaded.persons == 0 && loaded.families == 0 && config.seed.enabled {
        let seeded = lifecycle::seed_world(
            config.seed.settlements,
            config.seed.persons_per_settlement,
            today,
            &mut rng,
        );
        let report = engine
            .regenerate(
                &ReconcileContext::with_scheduler(control.as_ref()),
                &seeded.settlements,
                &seeded.persons,
                &[],
            )
            .await?;
        info!(
            settlements = report.inserted_settlements,
            persons = report.inserted_persons,
            "Seeded empty world"
        );
    } else {
        info!(
            settlements = loaded.settlements,
            persons = loaded.persons,
            families = loaded.families,
            eligible = loaded.derived.eligible_persons,
            fertile = loaded.derived.fertile_families,
            queued = loaded.derived.queued_families,
            "World loaded"
        );
    }

    // 7. Startup audit.
    let auditor = Arc::new(IntegrityAuditor::new(Arc::clone(&world)));
    let audit = auditor
        .audit_on_init(config.audit.repair, config.audit.fail_on_init, today)
        .await?;
    info!(
        issues = audit.issues_found,
        repaired = audit.repaired,
        "Startup integrity audit complete"
    );

    // 8. Background tasks.
    let _recovery = engine.spawn_recovery_listener(Arc::clone(&scheduler));
    let _audits = (config.audit.interval_secs > 0).then(|| {
        auditor.spawn_periodic(
            Duration::from_secs(config.audit.interval_secs),
            config.audit.repair,
            Arc::clone(&scheduler),
        )
    });
    {
        let control = Arc::clone(&control);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, stopping after the current day");
                control.request_stop();
            }
        });
    }

    // 9. Run the calendar.
    let coordinator = DeliveryCoordinator::new(
        Arc::clone(&adapter),
        world.queue().clone(),
        config.delivery.policy(),
    );
    let settings = RunSettings {
        lifecycle: config.lifecycle(),
        flush_every_ticks: config.calendar.flush_every_ticks,
    };
    let mut callback = ProgressCallback::new(PROGRESS_EVERY_DAYS);
    let result = runner::run_calendar(&engine, &coordinator, &control, &settings, &mut rng, &mut callback).await?;
    runner::log_calendar_end(&result);

    pool.close().await;
    info!(
        end_reason = ?result.end_reason,
        total_days = result.total_days,
        "gridworld-engine shutdown complete"
    );
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` wins over the configured
/// level.
fn init_logging(logging: &LoggingConfig) -> Result<(), EngineError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let installed = if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| EngineError::Logging {
        message: e.to_string(),
    })
}
