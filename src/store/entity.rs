use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

/// Unique identifier for an entity in the store
pub type EntityId = u64;

/// Identifier for an entity token (label or relationship type)
pub type TokenId = u32;

/// Identifier for a property key
pub type PropertyId = u32;

/// A property value, restricted to the closed set of indexable kinds.
///
/// Values are totally ordered (variant rank first, then payload) so that
/// segment files can be written in a deterministic order, and hashable so
/// they can key accumulator value tables. Floats compare and hash by their
/// IEEE total order, which makes `NaN` a legal (if unusual) index key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl PropertyValue {
    fn rank(&self) -> u8 {
        match self {
            PropertyValue::Bool(_) => 0,
            PropertyValue::Int(_) => 1,
            PropertyValue::Float(_) => 2,
            PropertyValue::Text(_) => 3,
        }
    }

    /// Rough in-memory size in bytes, used for queue byte accounting
    pub fn rough_size(&self) -> u64 {
        match self {
            PropertyValue::Bool(_) => 1,
            PropertyValue::Int(_) | PropertyValue::Float(_) => 8,
            PropertyValue::Text(s) => s.len() as u64,
        }
    }
}

impl PartialEq for PropertyValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PropertyValue::Bool(a), PropertyValue::Bool(b)) => a == b,
            (PropertyValue::Int(a), PropertyValue::Int(b)) => a == b,
            (PropertyValue::Float(a), PropertyValue::Float(b)) => a.to_bits() == b.to_bits(),
            (PropertyValue::Text(a), PropertyValue::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for PropertyValue {}

impl PartialOrd for PropertyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PropertyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (PropertyValue::Bool(a), PropertyValue::Bool(b)) => a.cmp(b),
            (PropertyValue::Int(a), PropertyValue::Int(b)) => a.cmp(b),
            (PropertyValue::Float(a), PropertyValue::Float(b)) => a.total_cmp(b),
            (PropertyValue::Text(a), PropertyValue::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for PropertyValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            PropertyValue::Bool(b) => b.hash(state),
            PropertyValue::Int(i) => i.hash(state),
            PropertyValue::Float(f) => f.to_bits().hash(state),
            PropertyValue::Text(s) => s.hash(state),
        }
    }
}

/// A full entity snapshot: its tokens and all of its property values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    #[serde(default)]
    pub tokens: BTreeSet<TokenId>,
    #[serde(default)]
    pub properties: BTreeMap<PropertyId, PropertyValue>,
}

impl EntityRecord {
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            tokens: BTreeSet::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_token(mut self, token: TokenId) -> Self {
        self.tokens.insert(token);
        self
    }

    pub fn with_property(mut self, key: PropertyId, value: PropertyValue) -> Self {
        self.properties.insert(key, value);
        self
    }
}

/// A single mutation inside a committed transaction
#[derive(Debug, Clone, PartialEq)]
pub enum EntityChange {
    /// Entity created with an initial snapshot
    Created(EntityRecord),
    TokenAdded(EntityId, TokenId),
    TokenRemoved(EntityId, TokenId),
    PropertySet(EntityId, PropertyId, PropertyValue),
    PropertyRemoved(EntityId, PropertyId),
    Deleted(EntityId),
}

impl EntityChange {
    pub fn entity_id(&self) -> EntityId {
        match self {
            EntityChange::Created(record) => record.id,
            EntityChange::TokenAdded(id, _)
            | EntityChange::TokenRemoved(id, _)
            | EntityChange::PropertySet(id, _, _)
            | EntityChange::PropertyRemoved(id, _)
            | EntityChange::Deleted(id) => *id,
        }
    }
}

/// Per-entity before/after snapshot pair produced by a commit, delivered to
/// commit listeners. `before == None` means the entity was created by this
/// commit; `after == None` means it was deleted.
#[derive(Debug, Clone)]
pub struct EntityDelta {
    pub id: EntityId,
    pub before: Option<EntityRecord>,
    pub after: Option<EntityRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(v: &PropertyValue) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_value_ordering_across_variants() {
        let mut values = vec![
            PropertyValue::Text("a".into()),
            PropertyValue::Int(3),
            PropertyValue::Bool(true),
            PropertyValue::Float(1.5),
        ];
        values.sort();
        assert_eq!(
            values,
            vec![
                PropertyValue::Bool(true),
                PropertyValue::Int(3),
                PropertyValue::Float(1.5),
                PropertyValue::Text("a".into()),
            ]
        );
    }

    #[test]
    fn test_float_eq_and_hash_by_bits() {
        let a = PropertyValue::Float(0.5);
        let b = PropertyValue::Float(0.5);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_ne!(PropertyValue::Float(0.0), PropertyValue::Float(-0.0));
    }

    #[test]
    fn test_rough_size() {
        assert_eq!(PropertyValue::Bool(true).rough_size(), 1);
        assert_eq!(PropertyValue::Int(1).rough_size(), 8);
        assert_eq!(PropertyValue::Text("abcd".into()).rough_size(), 4);
    }

    #[test]
    fn test_record_builders() {
        let record = EntityRecord::new(7)
            .with_token(1)
            .with_property(2, PropertyValue::Int(9));
        assert!(record.tokens.contains(&1));
        assert_eq!(record.properties.get(&2), Some(&PropertyValue::Int(9)));
    }

    #[test]
    fn test_change_entity_id() {
        assert_eq!(EntityChange::Deleted(4).entity_id(), 4);
        assert_eq!(
            EntityChange::Created(EntityRecord::new(11)).entity_id(),
            11
        );
    }
}
