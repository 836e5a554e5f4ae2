//! Tick callback that logs calendar progress.
//!
//! Per-day activity goes to `debug`; a rolling summary of the last
//! `every` days goes to `info`.

use gridworld_core::runner::{TickCallback, TickSummary};
use gridworld_db::WorldState;
use tracing::{debug, info};

/// Counts accumulated since the last summary line.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Window {
    deaths: usize,
    families_formed: usize,
    conceptions: usize,
    births: usize,
    missed: usize,
    failed: usize,
}

/// Logs a summary every `every` days.
pub struct ProgressCallback {
    every: u64,
    window: Window,
}

impl ProgressCallback {
    /// Summarize every `every` days (0 is treated as 1).
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            window: Window::default(),
        }
    }

    fn record(&mut self, summary: &TickSummary) {
        let w = &mut self.window;
        w.deaths = w.deaths.saturating_add(summary.deaths);
        w.families_formed = w.families_formed.saturating_add(summary.families_formed);
        w.conceptions = w.conceptions.saturating_add(summary.conceptions);
        w.births = w.births.saturating_add(summary.births);
        w.missed = w.missed.saturating_add(summary.missed_deliveries);
        w.failed = w.failed.saturating_add(summary.failed_deliveries);
    }

    /// Take the accumulated window if `day` closes one.
    fn take_window(&mut self, day: u64) -> Option<Window> {
        day.is_multiple_of(self.every)
            .then(|| std::mem::take(&mut self.window))
    }
}

impl TickCallback for ProgressCallback {
    fn on_tick(&mut self, summary: &TickSummary, _world: &WorldState) {
        debug!(
            day = summary.day,
            date = %summary.date,
            deaths = summary.deaths,
            families_formed = summary.families_formed,
            conceptions = summary.conceptions,
            births = summary.births,
            "Day complete"
        );
        if let Some(flush) = summary.flush {
            debug!(
                date = %summary.date,
                deleted_persons = flush.deleted_persons,
                inserted_persons = flush.inserted_persons,
                inserted_families = flush.inserted_families,
                updated = flush.updated,
                durable_writes = flush.durable_writes,
                "Scheduled flush"
            );
        }

        self.record(summary);
        if let Some(window) = self.take_window(summary.day) {
            info!(
                date = %summary.date,
                days = self.every,
                deaths = window.deaths,
                families_formed = window.families_formed,
                conceptions = window.conceptions,
                births = window.births,
                missed_deliveries = window.missed,
                failed_deliveries = window.failed,
                "Calendar progress"
            );
        }
    }
}
