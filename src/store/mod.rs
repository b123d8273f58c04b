//! Entity model, in-memory entity store, and the store scan source.
//!
//! - [`entity`] - Entity records, property values, commit change/delta types
//! - [`memory`] - In-memory transactional store with commit listeners
//! - [`scan`] - Single-use ascending store scan with block caching

pub mod entity;
pub mod memory;
pub mod scan;

pub use entity::{EntityChange, EntityDelta, EntityId, EntityRecord, PropertyId, PropertyValue, TokenId};
pub use memory::{EntityStore, InMemoryEntityStore};
pub use scan::{ScanProgress, StoreScan};
