//! Configuration, calendar loop, and life-cycle outcomes for the Gridworld
//! simulation.
//!
//! This crate drives the simulated calendar one day per tick on top of the
//! data layer in `gridworld-db`: ageing, matchmaking, conception, births
//! under the delivery lock, and periodic flushes to the durable store.
//!
//! # Modules
//!
//! - [`config`] -- Configuration loading from `gridworld-config.yaml` into
//!   strongly-typed structs.
//! - [`calendar`] -- [`CalendarControl`], the pausable day counter shared
//!   with the reconciliation engine.
//! - [`lifecycle`] -- Matchmaking, conception, [`BirthHandler`], and world
//!   seeding.
//! - [`runner`] -- The calendar tick loop.
//!
//! [`CalendarControl`]: calendar::CalendarControl
//! [`BirthHandler`]: lifecycle::BirthHandler

pub mod calendar;
pub mod config;
pub mod lifecycle;
pub mod runner;
