//! Schema descriptors and index-build descriptors

use crate::store::entity::{EntityRecord, PropertyId, PropertyValue, TokenId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The schema of a secondary index: the entity must carry every declared
/// token AND every declared property for the index to cover it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub tokens: Vec<TokenId>,
    pub properties: Vec<PropertyId>,
}

impl SchemaDescriptor {
    pub fn new(tokens: Vec<TokenId>, properties: Vec<PropertyId>) -> Self {
        Self { tokens, properties }
    }

    /// True if `record` is covered by this schema
    pub fn matches(&self, record: &EntityRecord) -> bool {
        self.tokens.iter().all(|t| record.tokens.contains(t))
            && self
                .properties
                .iter()
                .all(|p| record.properties.contains_key(p))
    }

    /// The declared property values of a covered record, in declaration
    /// order. Returns `None` unless every declared property is present.
    pub fn property_subset(&self, record: &EntityRecord) -> Option<Vec<PropertyValue>> {
        self.properties
            .iter()
            .map(|p| record.properties.get(p).cloned())
            .collect()
    }
}

impl fmt::Display for SchemaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(tokens {:?}, properties {:?})", self.tokens, self.properties)
    }
}

/// Which accumulator implementation backs an index, selected at
/// index-creation time. A closed set: providers are not an open hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccumulatorProvider {
    /// Purely in-memory accumulator
    Memory,
    /// Accumulator that persists a sorted segment file under the given
    /// directory on successful close
    Segment { dir: std::path::PathBuf },
}

/// Immutable identity of one index under build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexBuildDescriptor {
    pub index_id: u64,
    pub name: String,
    pub schema: SchemaDescriptor,
    pub provider: AccumulatorProvider,
}

impl IndexBuildDescriptor {
    pub fn new(
        index_id: u64,
        name: impl Into<String>,
        schema: SchemaDescriptor,
        provider: AccumulatorProvider,
    ) -> Self {
        Self {
            index_id,
            name: name.into(),
            schema,
            provider,
        }
    }

    pub fn memory(index_id: u64, name: impl Into<String>, schema: SchemaDescriptor) -> Self {
        Self::new(index_id, name, schema, AccumulatorProvider::Memory)
    }

    /// Human-readable description used in failure messages and logs
    pub fn user_description(&self) -> String {
        format!("{} {}", self.name, self.schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> EntityRecord {
        EntityRecord::new(1)
            .with_token(10)
            .with_token(11)
            .with_property(7, PropertyValue::Text("a".into()))
            .with_property(8, PropertyValue::Int(3))
    }

    #[test]
    fn test_matches_requires_all_tokens_and_properties() {
        let record = record();
        assert!(SchemaDescriptor::new(vec![10], vec![7]).matches(&record));
        assert!(SchemaDescriptor::new(vec![10, 11], vec![7, 8]).matches(&record));
        assert!(!SchemaDescriptor::new(vec![10, 12], vec![7]).matches(&record));
        assert!(!SchemaDescriptor::new(vec![10], vec![9]).matches(&record));
    }

    #[test]
    fn test_property_subset_in_declaration_order() {
        let record = record();
        let schema = SchemaDescriptor::new(vec![10], vec![8, 7]);
        assert_eq!(
            schema.property_subset(&record),
            Some(vec![
                PropertyValue::Int(3),
                PropertyValue::Text("a".into())
            ])
        );
    }

    #[test]
    fn test_property_subset_missing_property() {
        let record = record();
        let schema = SchemaDescriptor::new(vec![10], vec![7, 99]);
        assert_eq!(schema.property_subset(&record), None);
    }

    #[test]
    fn test_user_description_names_index() {
        let descriptor = IndexBuildDescriptor::memory(
            3,
            "person_name",
            SchemaDescriptor::new(vec![1], vec![2]),
        );
        assert!(descriptor.user_description().contains("person_name"));
    }
}
