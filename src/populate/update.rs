//! Pending index updates
//!
//! A [`PendingUpdate`] is one add/change/remove entry for one index, keyed by
//! entity id and tagged with its origin: produced by the store scan or by a
//! live transaction committing while the scan runs.

use crate::schema::SchemaDescriptor;
use crate::store::entity::{EntityId, EntityRecord, PropertyValue};

/// Where an update came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    Scan,
    Live,
}

/// The payload of an update
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateKind {
    Added(Vec<PropertyValue>),
    Changed {
        before: Vec<PropertyValue>,
        after: Vec<PropertyValue>,
    },
    Removed(Vec<PropertyValue>),
}

/// One add/change/remove entry for one index
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpdate {
    pub entity_id: EntityId,
    pub origin: UpdateOrigin,
    pub kind: UpdateKind,
}

impl PendingUpdate {
    pub fn added(entity_id: EntityId, origin: UpdateOrigin, values: Vec<PropertyValue>) -> Self {
        Self {
            entity_id,
            origin,
            kind: UpdateKind::Added(values),
        }
    }

    pub fn changed(
        entity_id: EntityId,
        origin: UpdateOrigin,
        before: Vec<PropertyValue>,
        after: Vec<PropertyValue>,
    ) -> Self {
        Self {
            entity_id,
            origin,
            kind: UpdateKind::Changed { before, after },
        }
    }

    pub fn removed(entity_id: EntityId, origin: UpdateOrigin, values: Vec<PropertyValue>) -> Self {
        Self {
            entity_id,
            origin,
            kind: UpdateKind::Removed(values),
        }
    }

    pub fn is_added(&self) -> bool {
        matches!(self.kind, UpdateKind::Added(_))
    }

    pub fn is_removed(&self) -> bool {
        matches!(self.kind, UpdateKind::Removed(_))
    }

    /// Rough in-memory size in bytes, for queue byte accounting
    pub fn rough_size(&self) -> u64 {
        let base = 32;
        let values = match &self.kind {
            UpdateKind::Added(values) | UpdateKind::Removed(values) => {
                values.iter().map(PropertyValue::rough_size).sum()
            }
            UpdateKind::Changed { before, after } => {
                before.iter().map(PropertyValue::rough_size).sum::<u64>()
                    + after.iter().map(PropertyValue::rough_size).sum::<u64>()
            }
        };
        base + values
    }
}

/// Derive the update one index sees from a commit delta, or `None` if the
/// index is unaffected. Coverage before and after the commit decides the
/// kind: gained coverage is an add, lost coverage is a remove, and a covered
/// entity whose declared values changed is a change.
pub fn live_update_for(
    schema: &SchemaDescriptor,
    before: Option<&EntityRecord>,
    after: Option<&EntityRecord>,
) -> Option<PendingUpdate> {
    let id = before.or(after)?.id;
    let before_values = before
        .filter(|r| schema.matches(r))
        .and_then(|r| schema.property_subset(r));
    let after_values = after
        .filter(|r| schema.matches(r))
        .and_then(|r| schema.property_subset(r));

    match (before_values, after_values) {
        (None, Some(values)) => Some(PendingUpdate::added(id, UpdateOrigin::Live, values)),
        (Some(values), None) => Some(PendingUpdate::removed(id, UpdateOrigin::Live, values)),
        (Some(before), Some(after)) if before != after => {
            Some(PendingUpdate::changed(id, UpdateOrigin::Live, before, after))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::entity::EntityRecord;

    fn schema() -> SchemaDescriptor {
        SchemaDescriptor::new(vec![1], vec![5])
    }

    fn covered(id: EntityId, value: i64) -> EntityRecord {
        EntityRecord::new(id)
            .with_token(1)
            .with_property(5, PropertyValue::Int(value))
    }

    #[test]
    fn test_creation_becomes_add() {
        let after = covered(3, 7);
        let update = live_update_for(&schema(), None, Some(&after)).unwrap();
        assert_eq!(
            update.kind,
            UpdateKind::Added(vec![PropertyValue::Int(7)])
        );
        assert_eq!(update.origin, UpdateOrigin::Live);
    }

    #[test]
    fn test_deletion_becomes_remove() {
        let before = covered(3, 7);
        let update = live_update_for(&schema(), Some(&before), None).unwrap();
        assert!(update.is_removed());
    }

    #[test]
    fn test_value_change_becomes_change() {
        let before = covered(3, 7);
        let after = covered(3, 8);
        let update = live_update_for(&schema(), Some(&before), Some(&after)).unwrap();
        assert_eq!(
            update.kind,
            UpdateKind::Changed {
                before: vec![PropertyValue::Int(7)],
                after: vec![PropertyValue::Int(8)],
            }
        );
    }

    #[test]
    fn test_losing_token_becomes_remove() {
        let before = covered(3, 7);
        let mut after = before.clone();
        after.tokens.clear();
        let update = live_update_for(&schema(), Some(&before), Some(&after)).unwrap();
        assert!(update.is_removed());
    }

    #[test]
    fn test_unrelated_change_is_ignored() {
        let before = covered(3, 7);
        let mut after = before.clone();
        after.properties.insert(9, PropertyValue::Bool(true));
        assert!(live_update_for(&schema(), Some(&before), Some(&after)).is_none());
    }

    #[test]
    fn test_uncovered_entity_is_ignored() {
        let record = EntityRecord::new(4).with_token(2);
        assert!(live_update_for(&schema(), None, Some(&record)).is_none());
    }

    #[test]
    fn test_rough_size_counts_both_sides_of_a_change() {
        let change = PendingUpdate::changed(
            1,
            UpdateOrigin::Live,
            vec![PropertyValue::Text("ab".into())],
            vec![PropertyValue::Text("abcd".into())],
        );
        assert_eq!(change.rough_size(), 32 + 2 + 4);
    }
}
