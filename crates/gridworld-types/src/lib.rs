//! Shared entity and identifier types for the Gridworld simulation.
//!
//! This crate is the single source of truth for the records synchronized
//! between the operational cache and the durable store.
//!
//! # Modules
//!
//! - [`ids`] -- Tagged provisional/durable identifiers and the allocator
//! - [`entities`] -- Person, family, and settlement records with patches

pub mod entities;
pub mod ids;

// Re-export all public types at crate root for convenience.
pub use entities::{
    Entity, EntityKind, Family, FamilyPatch, Person, PersonPatch, Settlement, SettlementPatch, Sex,
};
pub use ids::{EntityId, IdAllocator, IdMapping, ParseEntityIdError};
