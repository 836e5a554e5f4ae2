//! Cache key layout.
//!
//! | Key | Type | Contents |
//! |-----|------|----------|
//! | `person` / `family` / `village` | hash | id text -> entity JSON |
//! | `pending:{kind}:inserts` | set | provisional ids awaiting insert |
//! | `pending:{kind}:updates` | set | durable ids awaiting update |
//! | `pending:{kind}:deletes` | set | durable ids awaiting delete |
//! | `eligible:{sex}:{settlement}` | set | person ids eligible to marry |
//! | `fertile:families` | set | family ids that may conceive |
//! | `queue:fertile` | sorted set | expecting family ids by due day |
//! | `queue:fertile:members` | set | membership guard for the queue |
//! | `lock:family:{id}` | string (TTL) | delivery lock token |
//! | `deliveries:missed` | set | family ids whose delivery was given up |

use gridworld_types::{EntityId, EntityKind, Sex};

/// Set of families that may conceive.
pub const FERTILE_FAMILIES: &str = "fertile:families";

/// Sorted set of expecting families, scored by due day.
pub const FERTILE_QUEUE: &str = "queue:fertile";

/// Families whose delivery was abandoned after lock contention.
pub const MISSED_DELIVERIES: &str = "deliveries:missed";

/// Prefix shared by every marriage-eligibility set.
pub const ELIGIBLE_PREFIX: &str = "eligible:";

/// Hash holding every entity of `kind`.
pub const fn entity_hash(kind: EntityKind) -> &'static str {
    kind.as_str()
}

/// Which pending record a marker belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOp {
    /// Awaiting durable insert.
    Insert,
    /// Awaiting durable update.
    Update,
    /// Awaiting durable delete.
    Delete,
}

impl PendingOp {
    const fn suffix(self) -> &'static str {
        match self {
            Self::Insert => "inserts",
            Self::Update => "updates",
            Self::Delete => "deletes",
        }
    }
}

/// Pending set for `kind` and `op`.
pub fn pending(kind: EntityKind, op: PendingOp) -> String {
    format!("pending:{kind}:{}", op.suffix())
}

/// Marriage-eligibility set for people of `sex` living in `settlement`.
pub fn eligible(sex: Sex, settlement: EntityId) -> String {
    format!("{ELIGIBLE_PREFIX}{}:{settlement}", sex.as_str())
}

/// Delivery lock for `family`.
pub fn family_lock(family: EntityId) -> String {
    format!("lock:family:{family}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_keys_follow_kind_names() {
        assert_eq!(
            pending(EntityKind::Settlement, PendingOp::Insert),
            "pending:village:inserts"
        );
        assert_eq!(
            pending(EntityKind::Person, PendingOp::Delete),
            "pending:person:deletes"
        );
    }

    #[test]
    fn eligible_key_names_sex_and_settlement() {
        assert_eq!(eligible(Sex::Female, EntityId::Provisional(3)), "eligible:female:p3");
        assert_eq!(eligible(Sex::Male, EntityId::Durable(12)), "eligible:male:12");
    }
}
