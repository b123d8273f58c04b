//! In-memory transactional entity store
//!
//! Stands in for the storage engine collaborator: entities live in an
//! id-ordered map, ascending-id block reads feed the scan, and `commit`
//! applies a batch of changes and then notifies registered commit listeners.
//! Listeners are invoked inside the commit critical section so that the
//! delivery order of deltas for one entity always matches commit order.

use crate::store::entity::{EntityChange, EntityDelta, EntityId, EntityRecord};
use anyhow::{Result, bail};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

/// Callback invoked with the deltas of one committed transaction
pub type CommitListener = Box<dyn Fn(&[EntityDelta]) + Send + Sync>;

/// Read-side interface of the entity store, as consumed by the store scan
pub trait EntityStore: Send + Sync {
    /// All entities with `start_id <= id < start_id + len`, ascending by id
    fn read_block(&self, start_id: EntityId, len: u64) -> Result<Vec<EntityRecord>>;

    /// Point read of a single entity
    fn snapshot(&self, id: EntityId) -> Result<Option<EntityRecord>>;

    /// Highest entity id currently allocated, or `None` for an empty store
    fn highest_entity_id(&self) -> Option<EntityId>;

    fn entity_count(&self) -> u64;

    /// Register a listener for committed changes. Listeners registered while
    /// a population is running receive every commit that lands after
    /// registration.
    fn register_commit_listener(&self, listener: CommitListener);
}

/// In-memory store with commit-listener dispatch
pub struct InMemoryEntityStore {
    entities: RwLock<BTreeMap<EntityId, EntityRecord>>,
    listeners: RwLock<Vec<CommitListener>>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self {
            entities: RwLock::new(BTreeMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Bulk-load initial content without notifying listeners
    pub fn load(records: impl IntoIterator<Item = EntityRecord>) -> Self {
        let store = Self::new();
        {
            let mut entities = store.entities.write().unwrap();
            for record in records {
                entities.insert(record.id, record);
            }
        }
        store
    }

    /// Apply a batch of changes as one transaction and notify listeners with
    /// the per-entity before/after deltas.
    pub fn commit(&self, changes: Vec<EntityChange>) -> Result<()> {
        let mut entities = self.entities.write().unwrap();

        // Before-images, captured once per touched entity
        let mut deltas: Vec<EntityDelta> = Vec::new();
        let mut touched = |map: &BTreeMap<EntityId, EntityRecord>,
                           deltas: &mut Vec<EntityDelta>,
                           id: EntityId| {
            if !deltas.iter().any(|d| d.id == id) {
                deltas.push(EntityDelta {
                    id,
                    before: map.get(&id).cloned(),
                    after: None,
                });
            }
        };

        for change in &changes {
            let id = change.entity_id();
            touched(&entities, &mut deltas, id);
            match change {
                EntityChange::Created(record) => {
                    if entities.contains_key(&id) {
                        bail!("entity {} already exists", id);
                    }
                    entities.insert(id, record.clone());
                }
                EntityChange::TokenAdded(id, token) => {
                    let Some(record) = entities.get_mut(id) else {
                        bail!("entity {} does not exist", id);
                    };
                    record.tokens.insert(*token);
                }
                EntityChange::TokenRemoved(id, token) => {
                    let Some(record) = entities.get_mut(id) else {
                        bail!("entity {} does not exist", id);
                    };
                    record.tokens.remove(token);
                }
                EntityChange::PropertySet(id, key, value) => {
                    let Some(record) = entities.get_mut(id) else {
                        bail!("entity {} does not exist", id);
                    };
                    record.properties.insert(*key, value.clone());
                }
                EntityChange::PropertyRemoved(id, key) => {
                    let Some(record) = entities.get_mut(id) else {
                        bail!("entity {} does not exist", id);
                    };
                    record.properties.remove(key);
                }
                EntityChange::Deleted(id) => {
                    entities.remove(id);
                }
            }
        }

        // After-images
        for delta in &mut deltas {
            delta.after = entities.get(&delta.id).cloned();
        }

        // Notify while still holding the write lock: delta delivery order for
        // any one entity must equal commit order.
        let listeners = self.listeners.read().unwrap();
        for listener in listeners.iter() {
            listener(&deltas);
        }
        Ok(())
    }
}

impl Default for InMemoryEntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore for InMemoryEntityStore {
    fn read_block(&self, start_id: EntityId, len: u64) -> Result<Vec<EntityRecord>> {
        let entities = self.entities.read().unwrap();
        let end = start_id.saturating_add(len);
        Ok(entities
            .range((Bound::Included(start_id), Bound::Excluded(end)))
            .map(|(_, record)| record.clone())
            .collect())
    }

    fn snapshot(&self, id: EntityId) -> Result<Option<EntityRecord>> {
        Ok(self.entities.read().unwrap().get(&id).cloned())
    }

    fn highest_entity_id(&self) -> Option<EntityId> {
        self.entities
            .read()
            .unwrap()
            .last_key_value()
            .map(|(id, _)| *id)
    }

    fn entity_count(&self) -> u64 {
        self.entities.read().unwrap().len() as u64
    }

    fn register_commit_listener(&self, listener: CommitListener) {
        self.listeners.write().unwrap().push(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::entity::PropertyValue;
    use std::sync::{Arc, Mutex};

    fn person(id: EntityId, name: &str) -> EntityRecord {
        EntityRecord::new(id)
            .with_token(0)
            .with_property(0, PropertyValue::Text(name.into()))
    }

    #[test]
    fn test_block_reads_are_ascending_and_bounded() {
        let store = InMemoryEntityStore::load((0..10).map(|i| person(i, "x")));
        let block = store.read_block(3, 4).unwrap();
        let ids: Vec<_> = block.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_commit_create_and_delete() {
        let store = InMemoryEntityStore::new();
        store
            .commit(vec![EntityChange::Created(person(1, "ann"))])
            .unwrap();
        assert_eq!(store.entity_count(), 1);
        store.commit(vec![EntityChange::Deleted(1)]).unwrap();
        assert_eq!(store.entity_count(), 0);
        assert!(store.snapshot(1).unwrap().is_none());
    }

    #[test]
    fn test_commit_rejects_unknown_entity() {
        let store = InMemoryEntityStore::new();
        let result = store.commit(vec![EntityChange::TokenAdded(9, 1)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_listener_sees_before_and_after() {
        let store = InMemoryEntityStore::load([person(5, "bob")]);
        let seen: Arc<Mutex<Vec<EntityDelta>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.register_commit_listener(Box::new(move |deltas| {
            sink.lock().unwrap().extend(deltas.iter().cloned());
        }));

        store
            .commit(vec![EntityChange::PropertySet(
                5,
                0,
                PropertyValue::Text("robert".into()),
            )])
            .unwrap();

        let deltas = seen.lock().unwrap();
        assert_eq!(deltas.len(), 1);
        let delta = &deltas[0];
        assert_eq!(
            delta.before.as_ref().unwrap().properties[&0],
            PropertyValue::Text("bob".into())
        );
        assert_eq!(
            delta.after.as_ref().unwrap().properties[&0],
            PropertyValue::Text("robert".into())
        );
    }

    #[test]
    fn test_listener_delta_for_created_entity() {
        let store = InMemoryEntityStore::new();
        let seen: Arc<Mutex<Vec<EntityDelta>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.register_commit_listener(Box::new(move |deltas| {
            sink.lock().unwrap().extend(deltas.iter().cloned());
        }));

        store
            .commit(vec![EntityChange::Created(person(2, "cy"))])
            .unwrap();
        let deltas = seen.lock().unwrap();
        assert!(deltas[0].before.is_none());
        assert!(deltas[0].after.is_some());
    }
}
