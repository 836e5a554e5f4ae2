//! Per-kind entity CRUD on top of the storage adapter.
//!
//! One [`EntityStore`] exists per [`EntityKind`]. Entities live as JSON in
//! the kind's hash, keyed by the id's text form. The store tracks which
//! entities the durable store has not seen yet:
//!
//! - a provisional id is in `pending:{kind}:inserts` until reassigned
//! - a mutated durable id is in `pending:{kind}:updates` (at most once)
//! - a removed durable id moves to `pending:{kind}:deletes` and leaves
//!   every other pending and derived set in the same pipeline
//!
//! Adapter failures never surface as errors here. Reads degrade to `None`
//! or an empty list and writes report `false`, each with a warning. Only
//! precondition violations are returned as [`EntityError`].

use std::marker::PhantomData;
use std::sync::Arc;

use gridworld_types::{Entity, EntityId, EntityKind, Family, IdAllocator, Person, Settlement};

use crate::adapter::{Command, Pipeline, StorageAdapter};
use crate::error::AdapterError;
use crate::keys::{self, PendingOp};

/// Precondition violations raised by an entity store.
#[derive(Debug, thiserror::Error)]
pub enum EntityError {
    /// An entity with this id is already stored.
    #[error("{kind} {id} already exists")]
    IdCollision {
        /// Entity kind.
        kind: EntityKind,
        /// Colliding id.
        id: EntityId,
    },

    /// A provisional id was supplied where only durable ids are accepted.
    #[error("{kind} {id} is provisional but only durable ids are accepted here")]
    ProvisionalNotAllowed {
        /// Entity kind.
        kind: EntityKind,
        /// Offending id.
        id: EntityId,
    },

    /// No entity with this id is stored.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Entity kind.
        kind: EntityKind,
        /// Missing id.
        id: EntityId,
    },

    /// The entity could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Derived-set memberships an entity may hold besides its hash entry.
pub trait Indexed: Entity {
    /// Commands that drop the entity from every derived set it may be in.
    fn unindex(&self) -> Vec<Command>;
}

impl Indexed for Person {
    fn unindex(&self) -> Vec<Command> {
        self.settlement_id
            .map(|settlement| Command::SRem {
                key: keys::eligible(self.sex, settlement),
                member: self.id.to_string(),
            })
            .into_iter()
            .collect()
    }
}

impl Indexed for Family {
    fn unindex(&self) -> Vec<Command> {
        let member = self.id.to_string();
        vec![
            Command::SRem {
                key: keys::FERTILE_FAMILIES.to_owned(),
                member: member.clone(),
            },
            Command::ZRem {
                key: keys::FERTILE_QUEUE.to_owned(),
                member: member.clone(),
            },
            Command::SRem {
                key: crate::adapter::members_key(keys::FERTILE_QUEUE),
                member,
            },
        ]
    }
}

impl Indexed for Settlement {
    fn unindex(&self) -> Vec<Command> {
        Vec::new()
    }
}

/// CRUD and pending tracking for one entity kind.
pub struct EntityStore<E: Indexed> {
    adapter: Arc<StorageAdapter>,
    ids: Arc<IdAllocator>,
    _kind: PhantomData<fn() -> E>,
}

impl<E: Indexed> EntityStore<E> {
    /// Bind a store to the shared adapter and provisional-id allocator.
    pub const fn new(adapter: Arc<StorageAdapter>, ids: Arc<IdAllocator>) -> Self {
        Self {
            adapter,
            ids,
            _kind: PhantomData,
        }
    }

    const fn hash() -> &'static str {
        keys::entity_hash(E::KIND)
    }

    fn pending(op: PendingOp) -> String {
        keys::pending(E::KIND, op)
    }

    fn warn(action: &str, error: &AdapterError) {
        tracing::warn!(kind = %E::KIND, action, error = %error, "Cache operation failed, returning neutral result");
    }

    /// The adapter this store writes through.
    pub fn adapter(&self) -> &StorageAdapter {
        &self.adapter
    }

    // =========================================================================
    // Create / add
    // =========================================================================

    /// Store `entity` under its own id.
    ///
    /// A provisional id is recorded in pending-inserts; durable ids are
    /// stored as-is (the durable store already has them).
    ///
    /// Returns `false` if the adapter could not take the write.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::ProvisionalNotAllowed`] if the id is
    /// provisional and `allow_provisional` is false, and
    /// [`EntityError::IdCollision`] if the id is already stored.
    pub async fn add(&self, entity: &E, allow_provisional: bool) -> Result<bool, EntityError> {
        let id = entity.id();
        if id.is_provisional() && !allow_provisional {
            return Err(EntityError::ProvisionalNotAllowed { kind: E::KIND, id });
        }

        let field = id.to_string();
        match self.adapter.hget(Self::hash(), &field).await {
            Ok(Some(_)) => return Err(EntityError::IdCollision { kind: E::KIND, id }),
            Ok(None) => {}
            Err(e) => {
                Self::warn("add", &e);
                return Ok(false);
            }
        }

        let json = serde_json::to_string(entity)?;
        let mut pipeline = self.adapter.pipeline().hset(Self::hash(), &field, &json);
        if id.is_provisional() {
            self.ids.observe(id);
            pipeline = pipeline.sadd(&Self::pending(PendingOp::Insert), &field);
        }

        match pipeline.exec().await {
            Ok(()) => Ok(true),
            Err(e) => {
                Self::warn("add", &e);
                Ok(false)
            }
        }
    }

    /// Assign a fresh provisional id to `entity` and add it.
    ///
    /// Returns the stored entity, or `None` if the adapter could not take
    /// the write.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError`] if the allocated id collides, which means a
    /// provisional id was reused before reassignment.
    pub async fn create(&self, mut entity: E) -> Result<Option<E>, EntityError> {
        entity.set_id(self.ids.next_provisional());
        let stored = self.add(&entity, true).await?;
        Ok(stored.then_some(entity))
    }

    // =========================================================================
    // Read
    // =========================================================================

    async fn fetch(&self, id: EntityId) -> Result<Option<E>, AdapterError> {
        let raw = self.adapter.hget(Self::hash(), &id.to_string()).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(AdapterError::from))
            .transpose()
    }

    /// The entity stored under `id`.
    pub async fn get(&self, id: EntityId) -> Option<E> {
        match self.fetch(id).await {
            Ok(entity) => entity,
            Err(e) => {
                Self::warn("get", &e);
                None
            }
        }
    }

    /// Every stored entity, ordered by id.
    pub async fn get_all(&self) -> Vec<E> {
        let raw = match self.adapter.hgetall(Self::hash()).await {
            Ok(raw) => raw,
            Err(e) => {
                Self::warn("get_all", &e);
                return Vec::new();
            }
        };
        let mut entities: Vec<E> = raw
            .into_values()
            .filter_map(|json| match serde_json::from_str::<E>(&json) {
                Ok(entity) => Some(entity),
                Err(e) => {
                    tracing::warn!(kind = %E::KIND, error = %e, "Skipping undecodable cache entry");
                    None
                }
            })
            .collect();
        entities.sort_by_key(|entity| entity.id());
        entities
    }

    /// Number of stored entities of this kind.
    pub async fn count(&self) -> usize {
        self.adapter
            .hgetall(Self::hash())
            .await
            .map_or(0, |raw| raw.len())
    }

    // =========================================================================
    // Update / remove
    // =========================================================================

    /// Merge `patch` into the entity stored under `id`.
    ///
    /// A durable id is recorded in pending-updates. Returns the merged
    /// entity, or `None` if the adapter failed.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotFound`] if nothing is stored under `id`.
    pub async fn update(&self, id: EntityId, patch: &E::Patch) -> Result<Option<E>, EntityError> {
        let mut entity = match self.fetch(id).await {
            Ok(Some(entity)) => entity,
            Ok(None) => return Err(EntityError::NotFound { kind: E::KIND, id }),
            Err(e) => {
                Self::warn("update", &e);
                return Ok(None);
            }
        };
        entity.apply(patch);
        Ok(self.save(&entity).await?.then_some(entity))
    }

    /// Write `entity` back and mark a durable id for update.
    pub(crate) async fn save(&self, entity: &E) -> Result<bool, EntityError> {
        let id = entity.id();
        let field = id.to_string();
        let json = serde_json::to_string(entity)?;
        let mut pipeline = self.adapter.pipeline().hset(Self::hash(), &field, &json);
        if id.is_durable() {
            pipeline = pipeline.sadd(&Self::pending(PendingOp::Update), &field);
        }
        match pipeline.exec().await {
            Ok(()) => Ok(true),
            Err(e) => {
                Self::warn("save", &e);
                Ok(false)
            }
        }
    }

    /// Delete the entity stored under `id` together with its pending and
    /// derived-set memberships. A durable id is recorded in pending-deletes;
    /// a provisional one simply disappears (it was never persisted).
    ///
    /// Returns the removed entity, or `None` if the adapter failed.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::NotFound`] if nothing is stored under `id`.
    pub async fn remove(&self, id: EntityId) -> Result<Option<E>, EntityError> {
        let entity = match self.fetch(id).await {
            Ok(Some(entity)) => entity,
            Ok(None) => return Err(EntityError::NotFound { kind: E::KIND, id }),
            Err(e) => {
                Self::warn("remove", &e);
                return Ok(None);
            }
        };

        let field = id.to_string();
        let mut pipeline = self
            .adapter
            .pipeline()
            .hdel(Self::hash(), &field)
            .srem(&Self::pending(PendingOp::Insert), &field)
            .srem(&Self::pending(PendingOp::Update), &field);
        if id.is_durable() {
            pipeline = pipeline.sadd(&Self::pending(PendingOp::Delete), &field);
        }
        for command in entity.unindex() {
            pipeline = pipeline.push(command);
        }

        match pipeline.exec().await {
            Ok(()) => Ok(Some(entity)),
            Err(e) => {
                Self::warn("remove", &e);
                Ok(None)
            }
        }
    }

    // =========================================================================
    // Pending tracking
    // =========================================================================

    async fn pending_ids(&self, op: PendingOp) -> Vec<EntityId> {
        let members = match self.adapter.smembers(&Self::pending(op)).await {
            Ok(members) => members,
            Err(e) => {
                Self::warn("pending", &e);
                return Vec::new();
            }
        };
        let mut ids: Vec<EntityId> = members
            .iter()
            .filter_map(|member| member.parse().ok())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Provisional ids awaiting durable insert.
    pub async fn pending_inserts(&self) -> Vec<EntityId> {
        self.pending_ids(PendingOp::Insert).await
    }

    /// Durable ids awaiting durable update.
    pub async fn pending_updates(&self) -> Vec<EntityId> {
        self.pending_ids(PendingOp::Update).await
    }

    /// Durable ids awaiting durable delete.
    pub async fn pending_deletes(&self) -> Vec<EntityId> {
        self.pending_ids(PendingOp::Delete).await
    }

    /// Record `id` in the `op` pending set.
    pub(crate) async fn mark_pending(&self, op: PendingOp, id: EntityId) -> bool {
        match self.adapter.sadd(&Self::pending(op), &id.to_string()).await {
            Ok(_) => true,
            Err(e) => {
                Self::warn("mark_pending", &e);
                false
            }
        }
    }

    /// Queue removal of processed markers onto `pipeline`.
    pub(crate) fn clear_pending<'a>(
        pipeline: Pipeline<'a>,
        op: PendingOp,
        ids: &[EntityId],
    ) -> Pipeline<'a> {
        let key = Self::pending(op);
        ids.iter()
            .fold(pipeline, |pipeline, id| pipeline.srem(&key, &id.to_string()))
    }

    // =========================================================================
    // Reassignment
    // =========================================================================

    /// Move the entity stored under `from` to `to`, dropping `from` from
    /// pending-inserts. Returns the entity under its new id.
    pub(crate) async fn rekey(&self, from: EntityId, to: EntityId) -> Result<Option<E>, EntityError> {
        let Some(mut entity) = self.get(from).await else {
            return Ok(None);
        };
        entity.set_id(to);
        let json = serde_json::to_string(&entity)?;
        let from_field = from.to_string();
        let result = self
            .adapter
            .pipeline()
            .hdel(Self::hash(), &from_field)
            .hset(Self::hash(), &to.to_string(), &json)
            .srem(&Self::pending(PendingOp::Insert), &from_field)
            .exec()
            .await;
        match result {
            Ok(()) => Ok(Some(entity)),
            Err(e) => {
                Self::warn("rekey", &e);
                Ok(None)
            }
        }
    }

    /// Rewrite every foreign key matching a `(from, to)` pair in
    /// `mappings`. Durable referrers are marked for update so the new
    /// reference reaches the durable store. Returns how many entities
    /// changed.
    pub(crate) async fn remap_references(&self, mappings: &[(EntityId, EntityId)]) -> Result<usize, EntityError> {
        let mut changed = 0_usize;
        for mut entity in self.get_all().await {
            let touched = mappings
                .iter()
                .fold(false, |acc, (from, to)| entity.remap_references(*from, *to) | acc);
            if touched && self.save(&entity).await? {
                changed = changed.saturating_add(1);
            }
        }
        Ok(changed)
    }

    /// Delete the kind's hash and pending sets. Derived sets are cleared by
    /// the world state, which knows every key they live under.
    pub async fn clear(&self) -> bool {
        let keys = vec![
            Self::hash().to_owned(),
            Self::pending(PendingOp::Insert),
            Self::pending(PendingOp::Update),
            Self::pending(PendingOp::Delete),
        ];
        match self.adapter.del(&keys).await {
            Ok(_) => true,
            Err(e) => {
                Self::warn("clear", &e);
                false
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::NaiveDate;
    use gridworld_types::{PersonPatch, Sex};

    use super::*;

    fn make_store() -> EntityStore<Person> {
        EntityStore::new(
            Arc::new(StorageAdapter::in_memory()),
            Arc::new(IdAllocator::default()),
        )
    }

    fn make_person(id: EntityId) -> Person {
        Person::new(
            id,
            Some(EntityId::Durable(3)),
            Sex::Female,
            NaiveDate::from_ymd_opt(4000, 1, 1).unwrap(),
        )
    }

    #[tokio::test]
    async fn provisional_add_is_pending_insert() {
        let store = make_store();
        let p = make_person(EntityId::Provisional(1));
        assert!(store.add(&p, true).await.unwrap());
        assert_eq!(store.get(p.id).await, Some(p.clone()));
        assert_eq!(store.pending_inserts().await, vec![p.id]);
        assert!(store.pending_updates().await.is_empty());
    }

    #[tokio::test]
    async fn provisional_rejected_when_not_allowed() {
        let store = make_store();
        let result = store.add(&make_person(EntityId::Provisional(1)), false).await;
        assert!(matches!(result, Err(EntityError::ProvisionalNotAllowed { .. })));
    }

    #[tokio::test]
    async fn collision_is_an_error() {
        let store = make_store();
        let p = make_person(EntityId::Durable(7));
        assert!(store.add(&p, false).await.unwrap());
        assert!(matches!(
            store.add(&p, false).await,
            Err(EntityError::IdCollision { .. })
        ));
    }

    #[tokio::test]
    async fn create_never_reuses_observed_ids() {
        let store = make_store();
        store.add(&make_person(EntityId::Provisional(4)), true).await.unwrap();
        let created = store.create(make_person(EntityId::Provisional(0))).await.unwrap().unwrap();
        assert_eq!(created.id, EntityId::Provisional(5));
    }

    #[tokio::test]
    async fn durable_update_is_tracked_once() {
        let store = make_store();
        let id = EntityId::Durable(7);
        store.add(&make_person(id), false).await.unwrap();
        let patch = PersonPatch {
            settlement_id: Some(None),
            ..PersonPatch::default()
        };
        let updated = store.update(id, &patch).await.unwrap().unwrap();
        assert_eq!(updated.settlement_id, None);
        store.update(id, &patch).await.unwrap();
        assert_eq!(store.pending_updates().await, vec![id]);
    }

    #[tokio::test]
    async fn update_missing_is_not_found() {
        let store = make_store();
        let result = store.update(EntityId::Durable(1), &PersonPatch::default()).await;
        assert!(matches!(result, Err(EntityError::NotFound { .. })));
    }

    #[tokio::test]
    async fn remove_moves_durable_to_pending_delete() {
        let store = make_store();
        let id = EntityId::Durable(7);
        let p = make_person(id);
        store.add(&p, false).await.unwrap();
        store.update(id, &PersonPatch::default()).await.unwrap();
        let eligible = keys::eligible(p.sex, EntityId::Durable(3));
        store.adapter().sadd(&eligible, &id.to_string()).await.unwrap();

        assert_eq!(store.remove(id).await.unwrap(), Some(p));
        assert_eq!(store.get(id).await, None);
        assert_eq!(store.pending_deletes().await, vec![id]);
        assert!(store.pending_updates().await.is_empty());
        assert!(!store.adapter().sismember(&eligible, "7").await.unwrap());
    }

    #[tokio::test]
    async fn remove_provisional_leaves_no_trace() {
        let store = make_store();
        let id = EntityId::Provisional(2);
        store.add(&make_person(id), true).await.unwrap();
        store.remove(id).await.unwrap();
        assert!(store.pending_inserts().await.is_empty());
        assert!(store.pending_deletes().await.is_empty());
    }

    #[tokio::test]
    async fn unavailable_adapter_gives_neutral_results() {
        let adapter = StorageAdapter::detached(crate::adapter::AdapterState::Connecting);
        let store: EntityStore<Person> = EntityStore::new(Arc::new(adapter), Arc::new(IdAllocator::default()));
        assert!(!store.add(&make_person(EntityId::Durable(1)), false).await.unwrap());
        assert_eq!(store.get(EntityId::Durable(1)).await, None);
        assert!(store.get_all().await.is_empty());
        assert!(store.pending_inserts().await.is_empty());
        assert_eq!(store.count().await, 0);
    }
}
