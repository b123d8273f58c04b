//! Online index population
//!
//! Everything that turns a schema descriptor plus a live store into an
//! online index: the per-index accumulators, the concurrent-update
//! reconciler, the multi-index populator fanning one store scan out to all
//! registered builds, the lifecycle proxy, and the background job wrapper.

pub mod accumulator;
pub mod job;
pub mod populator;
pub mod proxy;
pub mod reconciler;
pub mod update;

pub use accumulator::{IndexAccessor, IndexAccumulator, IndexSample, open_accumulator};
pub use job::{PopulationHandle, PopulationJob, PopulationOutcome};
pub use populator::MultiIndexPopulator;
pub use proxy::{IndexProxy, IndexState};
pub use reconciler::{LiveDecision, UpdateReconciler};
pub use update::{PendingUpdate, UpdateKind, UpdateOrigin, live_update_for};
