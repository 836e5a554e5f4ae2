//! Tagged entity identifiers.
//!
//! Every entity carries exactly one [`EntityId`]: a `Durable` identifier
//! assigned by `PostgreSQL`, or a `Provisional` identifier handed out by an
//! [`IdAllocator`] before the entity has been persisted. Reassignment after
//! a flush is a lookup in an [`IdMapping`] table rather than a numeric
//! sign check.
//!
//! # Text form
//!
//! | Variant | Text | Used as |
//! |---------|------|---------|
//! | `Durable(42)` | `42` | hash field, set member |
//! | `Provisional(7)` | `p7` | hash field, set member |

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Prefix marking a provisional identifier in its text form.
const PROVISIONAL_PREFIX: char = 'p';

/// Identifier of a person, family, or settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityId {
    /// Locally assigned, unique per run, not yet persisted.
    Provisional(u64),
    /// Assigned by the durable store. Always positive.
    Durable(u64),
}

impl EntityId {
    /// Whether this identifier has not been persisted yet.
    pub const fn is_provisional(self) -> bool {
        matches!(self, Self::Provisional(_))
    }

    /// Whether this identifier was assigned by the durable store.
    pub const fn is_durable(self) -> bool {
        matches!(self, Self::Durable(_))
    }

    /// Return the durable row id, or `None` for a provisional identifier.
    pub const fn durable(self) -> Option<u64> {
        match self {
            Self::Durable(id) => Some(id),
            Self::Provisional(_) => None,
        }
    }

    /// Build a durable identifier from a database row id.
    ///
    /// Returns `None` for zero or negative ids, which the durable store
    /// never assigns.
    pub fn from_row_id(id: i64) -> Option<Self> {
        u64::try_from(id)
            .ok()
            .filter(|v| *v > 0)
            .map(Self::Durable)
    }

    /// Return the database row id for a durable identifier.
    pub fn row_id(self) -> Option<i64> {
        self.durable().and_then(|v| i64::try_from(v).ok())
    }
}

impl core::fmt::Display for EntityId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Durable(id) => write!(f, "{id}"),
            Self::Provisional(id) => write!(f, "{PROVISIONAL_PREFIX}{id}"),
        }
    }
}

/// Error returned when parsing an [`EntityId`] from its text form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid entity id: {0:?}")]
pub struct ParseEntityIdError(pub String);

impl FromStr for EntityId {
    type Err = ParseEntityIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseEntityIdError(s.to_owned());
        if let Some(rest) = s.strip_prefix(PROVISIONAL_PREFIX) {
            return rest
                .parse::<u64>()
                .ok()
                .map(Self::Provisional)
                .ok_or_else(invalid);
        }
        s.parse::<u64>()
            .ok()
            .filter(|id| *id > 0)
            .map(Self::Durable)
            .ok_or_else(invalid)
    }
}

/// One provisional-to-durable remapping produced by a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    /// The identifier the entity carried before its first insert.
    pub provisional: EntityId,
    /// The identifier assigned by the durable store.
    pub durable: EntityId,
}

impl IdMapping {
    /// Create a mapping entry.
    pub const fn new(provisional: EntityId, durable: EntityId) -> Self {
        Self {
            provisional,
            durable,
        }
    }
}

/// Monotonic source of provisional identifiers, shared by all entity kinds.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    /// Create an allocator whose first identifier is `Provisional(1)`.
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Hand out the next provisional identifier.
    pub fn next_provisional(&self) -> EntityId {
        EntityId::Provisional(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Make sure future identifiers are strictly greater than `seen`.
    ///
    /// Called when provisional identifiers survive in the cache from an
    /// earlier allocator, so the run never reuses one.
    pub fn observe(&self, seen: EntityId) {
        if let EntityId::Provisional(id) = seen {
            self.next
                .fetch_max(id.saturating_add(1), Ordering::Relaxed);
        }
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_form_roundtrip() {
        for id in [EntityId::Durable(42), EntityId::Provisional(7)] {
            let text = id.to_string();
            assert_eq!(text.parse::<EntityId>().ok(), Some(id));
        }
        assert_eq!(EntityId::Provisional(7).to_string(), "p7");
    }

    #[test]
    fn zero_and_garbage_rejected() {
        assert!("0".parse::<EntityId>().is_err());
        assert!("-5".parse::<EntityId>().is_err());
        assert!("px".parse::<EntityId>().is_err());
        assert!("".parse::<EntityId>().is_err());
    }

    #[test]
    fn row_ids_must_be_positive() {
        assert_eq!(EntityId::from_row_id(42), Some(EntityId::Durable(42)));
        assert_eq!(EntityId::from_row_id(0), None);
        assert_eq!(EntityId::from_row_id(-3), None);
        assert_eq!(EntityId::Provisional(3).row_id(), None);
    }

    #[test]
    fn allocator_is_monotonic_and_observes() {
        let alloc = IdAllocator::new();
        assert_eq!(alloc.next_provisional(), EntityId::Provisional(1));
        assert_eq!(alloc.next_provisional(), EntityId::Provisional(2));
        alloc.observe(EntityId::Provisional(10));
        assert_eq!(alloc.next_provisional(), EntityId::Provisional(11));
        alloc.observe(EntityId::Durable(500));
        assert_eq!(alloc.next_provisional(), EntityId::Provisional(12));
    }
}
