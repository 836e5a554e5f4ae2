//! Data layer for the Gridworld simulation (`Dragonfly` + `PostgreSQL`).
//!
//! `Dragonfly` holds the operational cache every worker reads and writes.
//! `PostgreSQL` is the durable store it is loaded from at startup and
//! flushed back to periodically. When `Dragonfly` is unreachable the cache
//! falls back to an in-process backend and switches back once it recovers.
//!
//! # Architecture
//!
//! ```text
//! Workers / calendar tick
//!     |
//!     +-- EntityStore<Person|Family|Settlement> --+
//!     +-- FertileQueue / DeliveryCoordinator -----+--> StorageAdapter
//!     +-- IntegrityAuditor -----------------------+      |-- DragonflyBackend (remote)
//!                                                        +-- MemoryBackend    (fallback)
//!     ReconciliationEngine
//!         |-- load  : DurableStore --> WorldState
//!         +-- flush : WorldState   --> DurableStore (ids reassigned)
//! ```
//!
//! # Modules
//!
//! - [`adapter`] -- Backend-switching cache facade and its supervisor
//! - [`dragonfly`] -- `Dragonfly` (Redis-compatible) backend
//! - [`memory`] -- In-process fallback backend
//! - [`keys`] -- Cache key layout
//! - [`entity_store`] -- Per-kind CRUD with pending-operation tracking
//! - [`eligibility`] -- Marriage and fertility predicates
//! - [`world_state`] -- The three stores, derived sets, and id reassignment
//! - [`fertile_queue`] -- Atomic due-time queue of expecting families
//! - [`delivery`] -- Lock-guarded delivery with retry and backoff
//! - [`audit`] -- Derived-set integrity checks and repair
//! - [`durable`] -- `PostgreSQL` (and in-process) durable store
//! - [`reconcile`] -- Load and flush between cache and durable store
//! - [`postgres`] -- `PostgreSQL` connection pool and configuration
//! - [`error`] -- Shared error types

pub mod adapter;
pub mod audit;
pub mod delivery;
pub mod dragonfly;
pub mod durable;
pub mod eligibility;
pub mod entity_store;
pub mod error;
pub mod fertile_queue;
pub mod keys;
pub mod memory;
pub mod postgres;
pub mod reconcile;
pub mod world_state;

// Re-export primary types for convenience.
pub use adapter::{AdapterConfig, AdapterState, AdapterSupervisor, Recovered, StorageAdapter};
pub use audit::{AuditError, AuditReport, AuditScope, IntegrityAuditor, IntegrityIssue};
pub use delivery::{
    DeliveryCoordinator, DeliveryError, DeliveryHandler, DeliveryOutcome, DeliveryPolicy,
    DrainReport,
};
pub use durable::{DurableStore, MemoryDurableStore, PgDurableStore};
pub use eligibility::EligibilityRules;
pub use entity_store::{EntityError, EntityStore};
pub use error::{AdapterError, DbError};
pub use fertile_queue::FertileQueue;
pub use postgres::{PostgresConfig, PostgresPool};
pub use reconcile::{
    FlushOutcome, FlushReport, LoadReport, PausableScheduler, ReconcileContext, ReconcileError,
    ReconciliationEngine,
};
pub use world_state::{DerivedCounts, WorldState};
