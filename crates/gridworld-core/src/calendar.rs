//! Shared control state for the calendar loop.
//!
//! [`CalendarControl`] is wrapped in [`Arc`](std::sync::Arc) and shared
//! between the calendar loop, the reconciliation engine (which pauses it
//! around load and flush) and background tasks. All fields are atomics so
//! the tick loop never takes a lock to read them.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

use chrono::{Datelike, Days, NaiveDate};
use gridworld_db::PausableScheduler;
use tokio::sync::Notify;

/// Smallest tick interval accepted at runtime, in milliseconds.
pub const MIN_TICK_INTERVAL_MS: u64 = 10;

/// Reason the calendar loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarEndReason {
    /// Ran the configured number of days.
    MaxDaysReached,
    /// A stop was requested.
    StopRequested,
}

/// Pause, stop and tick-speed control plus the current simulated date.
#[derive(Debug)]
pub struct CalendarControl {
    /// Whether day advancement is paused.
    paused: AtomicBool,

    /// Wakes the loop on resume.
    resume_notify: Notify,

    /// Whether a stop has been requested.
    stop_requested: AtomicBool,

    /// Real-time milliseconds per simulated day.
    tick_interval_ms: AtomicU64,

    /// Current date as days from 0001-01-01 (CE day 1).
    day: AtomicI32,

    /// Days to run before ending (0 = unlimited).
    max_days: u64,
}

impl CalendarControl {
    /// Start on `start_date`, unpaused.
    pub fn new(start_date: NaiveDate, tick_interval_ms: u64, max_days: u64) -> Self {
        Self {
            paused: AtomicBool::new(false),
            resume_notify: Notify::new(),
            stop_requested: AtomicBool::new(false),
            tick_interval_ms: AtomicU64::new(tick_interval_ms),
            day: AtomicI32::new(start_date.num_days_from_ce()),
            max_days,
        }
    }

    // -----------------------------------------------------------------------
    // Date
    // -----------------------------------------------------------------------

    /// The current simulated date.
    pub fn current_date(&self) -> NaiveDate {
        from_ce_days(self.day.load(Ordering::Acquire))
    }

    /// Move the calendar forward one day and return the new date.
    ///
    /// Saturates at the last representable date.
    pub fn advance(&self) -> NaiveDate {
        let next = self
            .current_date()
            .checked_add_days(Days::new(1))
            .unwrap_or(NaiveDate::MAX);
        self.day.store(next.num_days_from_ce(), Ordering::Release);
        next
    }

    // -----------------------------------------------------------------------
    // Pause / Resume
    // -----------------------------------------------------------------------

    /// Wait until the calendar is no longer paused.
    pub async fn wait_if_paused(&self) {
        while self.paused.load(Ordering::Acquire) {
            self.resume_notify.notified().await;
        }
    }

    // -----------------------------------------------------------------------
    // Stop
    // -----------------------------------------------------------------------

    /// Request a clean stop after the current tick.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.resume_notify.notify_one();
    }

    /// Whether a stop has been requested.
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Tick speed and bounds
    // -----------------------------------------------------------------------

    /// Current tick interval in milliseconds.
    pub fn tick_interval_ms(&self) -> u64 {
        self.tick_interval_ms.load(Ordering::Acquire)
    }

    /// Set the tick interval. Returns the previous interval, or `None` if
    /// `ms` is below [`MIN_TICK_INTERVAL_MS`].
    pub fn set_tick_interval_ms(&self, ms: u64) -> Option<u64> {
        if ms < MIN_TICK_INTERVAL_MS {
            return None;
        }
        Some(self.tick_interval_ms.swap(ms, Ordering::AcqRel))
    }

    /// Configured day limit (0 = unlimited).
    pub const fn max_days(&self) -> u64 {
        self.max_days
    }

    /// Whether `days_run` has reached the limit.
    pub const fn day_limit_reached(&self, days_run: u64) -> bool {
        self.max_days > 0 && days_run >= self.max_days
    }
}

impl PausableScheduler for CalendarControl {
    fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.resume_notify.notify_one();
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn today(&self) -> NaiveDate {
        self.current_date()
    }
}

fn from_ce_days(days: i32) -> NaiveDate {
    NaiveDate::from_num_days_from_ce_opt(days).unwrap_or(NaiveDate::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn advance_crosses_month_and_year() {
        let control = CalendarControl::new(date(4000, 12, 31), 1000, 0);
        assert_eq!(control.today(), date(4000, 12, 31));
        assert_eq!(control.advance(), date(4001, 1, 1));
        assert_eq!(control.current_date(), date(4001, 1, 1));
    }

    #[test]
    fn pause_and_resume() {
        let control = CalendarControl::new(date(4000, 1, 1), 1000, 0);
        assert!(!control.is_paused());
        control.pause();
        assert!(control.is_paused());
        control.resume();
        assert!(!control.is_paused());
    }

    #[test]
    fn tick_interval_has_a_floor() {
        let control = CalendarControl::new(date(4000, 1, 1), 1000, 0);
        assert_eq!(control.set_tick_interval_ms(5), None);
        assert_eq!(control.set_tick_interval_ms(250), Some(1000));
        assert_eq!(control.tick_interval_ms(), 250);
    }

    #[test]
    fn day_limit() {
        let unlimited = CalendarControl::new(date(4000, 1, 1), 1000, 0);
        assert!(!unlimited.day_limit_reached(u64::MAX));
        let bounded = CalendarControl::new(date(4000, 1, 1), 1000, 3);
        assert!(!bounded.day_limit_reached(2));
        assert!(bounded.day_limit_reached(3));
    }

    #[tokio::test]
    async fn wait_if_paused_returns_on_resume() {
        let control = Arc::new(CalendarControl::new(date(4000, 1, 1), 1000, 0));
        control.pause();
        let waiter = {
            let control = Arc::clone(&control);
            tokio::spawn(async move { control.wait_if_paused().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        control.resume();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
