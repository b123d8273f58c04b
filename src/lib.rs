//! # grix - Online Secondary-Index Population Engine
//!
//! grix builds secondary indexes over a live, continuously mutated entity
//! store. One background scan walks the store in ascending entity-id order
//! while foreground transactions keep committing; a reconciliation algorithm
//! guarantees that every concurrent update lands in the built index exactly
//! once. When the scan completes, each index atomically "flips" from
//! populating to online, serving reads that are consistent with the store
//! content at the moment of the flip.
//!
//! ## Architecture
//!
//! The crate is organized into these main modules:
//!
//! - [`store`] - Entity model, in-memory entity store, and the store scan
//! - [`schema`] - Schema descriptors and index-build descriptors
//! - [`populate`] - Reconciler, accumulators, index proxy, fan-out populator,
//!   and the population job
//! - [`stats`] - Durable index statistics and selectivity samples
//! - [`monitor`] - Population lifecycle events
//! - [`config`] - Population configuration
//!
//! ## Quick Start
//!
//! ```ignore
//! use grix::populate::job::PopulationJob;
//! use grix::schema::{IndexBuildDescriptor, SchemaDescriptor};
//! use grix::store::memory::InMemoryEntityStore;
//! use std::sync::Arc;
//!
//! let store = Arc::new(InMemoryEntityStore::new());
//! let descriptor = IndexBuildDescriptor::memory(
//!     1,
//!     "person_name",
//!     SchemaDescriptor::new(vec![0], vec![0]),
//! );
//!
//! let handle = PopulationJob::new(store, vec![descriptor]).start()?;
//! handle.await_completion(None);
//! ```
//!
//! ## Concurrency model
//!
//! One dedicated thread runs the scan and drives the fan-out populator; any
//! number of foreground threads submit live updates through the store's
//! commit listener. The only state shared between them is the atomic scan
//! cursor and a narrow mutexed update queue per index under build - the
//! storage engine's transactional locks are never taken.

pub mod config;
pub mod monitor;
pub mod populate;
pub mod progress;
pub mod schema;
pub mod stats;
pub mod store;
