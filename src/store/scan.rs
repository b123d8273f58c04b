//! Store Scan Source
//!
//! A single-use, cancellable walk over the entity store in ascending id
//! order. Blocks of records are read through a small LRU cache; a live write
//! landing inside an already-cached block that lies ahead of the scan cursor
//! would otherwise be consumed from a stale copy, so the populator reports
//! every live update through [`StoreScan::note_external_change`], which marks
//! the affected block dirty and forces a re-read before the next entity in it
//! is consumed.

use crate::monitor::{EventSink, MonitorEvent};
use crate::store::entity::{EntityId, EntityRecord};
use crate::store::memory::EntityStore;
use anyhow::{Result, bail};
use lru::LruCache;
use rustc_hash::FxHashSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Number of record blocks kept in the scan's read cache
const BLOCK_CACHE_CAPACITY: usize = 8;

/// Scan position shared between the scan thread and foreground threads.
///
/// The cursor is stored as "lowest id not yet fully consumed", so that
/// `has_passed(id)` is a single relaxed-free atomic load with no sentinel for
/// the not-yet-started case.
pub struct ScanProgress {
    next: AtomicU64,
    seen: AtomicU64,
    total: AtomicU64,
    complete: AtomicBool,
}

impl ScanProgress {
    pub fn new(total_estimate: u64) -> Self {
        Self {
            next: AtomicU64::new(0),
            seen: AtomicU64::new(0),
            total: AtomicU64::new(total_estimate),
            complete: AtomicBool::new(false),
        }
    }

    /// True if the scan has fully consumed `id`
    pub fn has_passed(&self, id: EntityId) -> bool {
        id < self.next.load(Ordering::Acquire)
    }

    /// Highest fully consumed entity id, or `None` before the first entity
    pub fn cursor(&self) -> Option<EntityId> {
        match self.next.load(Ordering::Acquire) {
            0 => None,
            n => Some(n - 1),
        }
    }

    pub fn entities_seen(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }

    pub fn total_estimate(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    /// Completion percentage in `[0.0, 100.0]`. Non-decreasing over the life
    /// of a scan and exactly `100.0` once the scan has finished; entities
    /// created mid-scan can push the raw ratio past the initial estimate, so
    /// the in-flight value is clamped just below full.
    pub fn percentage(&self) -> f64 {
        if self.is_complete() {
            return 100.0;
        }
        let total = self.total_estimate();
        if total == 0 {
            return 0.0;
        }
        let pct = self.entities_seen() as f64 * 100.0 / total as f64;
        pct.min(99.9)
    }

    pub(crate) fn advance(&self, consumed: EntityId) {
        self.next.fetch_max(consumed + 1, Ordering::Release);
    }

    fn entity_seen(&self) {
        self.seen.fetch_add(1, Ordering::Relaxed);
    }

    fn mark_complete(&self) {
        self.complete.store(true, Ordering::Release);
    }
}

/// Receives one scan-origin entity snapshot at a time
pub trait ScanConsumer: Sync {
    fn accept(&self, record: &EntityRecord) -> Result<()>;
}

/// The scan's view of the concurrent-update queues: checked at every entity
/// boundary, drained when any queue has crossed its threshold.
pub trait ExternalUpdatesCheck: Sync {
    fn needs_drain(&self) -> bool;
    fn drain(&self, up_to: EntityId) -> Result<()>;
}

/// Injectable synchronization point, called after each entity is fully
/// consumed. Production wiring leaves it unset; tests use it to schedule
/// commits at exact scan positions.
pub trait ScanHook: Send + Sync {
    fn entity_consumed(&self, _id: EntityId) {}
}

/// Single-use ascending scan over the entity store.
pub struct StoreScan<S: EntityStore> {
    store: Arc<S>,
    progress: Arc<ScanProgress>,
    stop: AtomicBool,
    started: AtomicBool,
    block_size: u64,
    /// Highest id the scan will visit, fixed at construction; entities
    /// created above it are the live path's responsibility
    high_id: Option<EntityId>,
    cache: Mutex<LruCache<u64, Vec<EntityRecord>>>,
    dirty: Mutex<FxHashSet<u64>>,
    hook: Option<Box<dyn ScanHook>>,
    events: EventSink,
}

impl<S: EntityStore> StoreScan<S> {
    pub fn new(store: Arc<S>, block_size: usize, events: EventSink) -> Self {
        let high_id = store.highest_entity_id();
        let total = store.entity_count();
        Self {
            store,
            progress: Arc::new(ScanProgress::new(total)),
            stop: AtomicBool::new(false),
            started: AtomicBool::new(false),
            block_size: block_size.max(1) as u64,
            high_id,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(BLOCK_CACHE_CAPACITY).unwrap(),
            )),
            dirty: Mutex::new(FxHashSet::default()),
            hook: None,
            events,
        }
    }

    pub fn with_hook(mut self, hook: Box<dyn ScanHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn progress(&self) -> Arc<ScanProgress> {
        self.progress.clone()
    }

    /// Request cooperative cancellation, observed at the next entity boundary
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// A live write touched `id`. If the scan has not yet consumed that id,
    /// any cached copy of its block is stale and must be re-read.
    pub fn note_external_change(&self, id: EntityId) {
        if self.progress.has_passed(id) {
            return;
        }
        let Some(high) = self.high_id else { return };
        if id > high {
            return;
        }
        let block_idx = id / self.block_size;
        self.dirty.lock().unwrap().insert(block_idx);
        self.cache.lock().unwrap().pop(&block_idx);
    }

    /// Run the scan to completion or cancellation. A scan is never restarted;
    /// a second call is an error.
    pub fn run(&self, consumer: &dyn ScanConsumer, check: &dyn ExternalUpdatesCheck) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            bail!("store scan cannot be restarted");
        }
        self.events.emit(MonitorEvent::ScanStarting);

        let Some(high) = self.high_id else {
            self.progress.mark_complete();
            self.events.emit(MonitorEvent::Progress { percent: 100.0 });
            return Ok(());
        };

        let mut last_reported_tenths: i64 = -1;
        let mut block_start: u64 = 0;
        'blocks: while block_start <= high {
            let block_idx = block_start / self.block_size;
            let mut records = self.fetch_block(block_idx)?;
            let mut next_id = block_start;
            loop {
                if self.is_stopped() {
                    break 'blocks;
                }
                if self.take_dirty(block_idx) {
                    records = self.read_block_from_store(block_idx)?;
                }
                let Some(record) = records.iter().find(|r| r.id >= next_id).cloned() else {
                    break;
                };
                consumer.accept(&record)?;
                self.progress.advance(record.id);
                self.progress.entity_seen();
                next_id = record.id + 1;

                if let Some(hook) = &self.hook {
                    hook.entity_consumed(record.id);
                }
                if check.needs_drain() {
                    if let Some(cursor) = self.progress.cursor() {
                        check.drain(cursor)?;
                    }
                }
                self.emit_progress(&mut last_reported_tenths);
            }
            // Block exhausted: move the cursor to the block boundary so ids in
            // the consumed gap take the direct live path from here on.
            let block_end = block_idx * self.block_size + self.block_size - 1;
            self.progress.advance(block_end.min(high));
            block_start = (block_idx + 1) * self.block_size;
        }

        if !self.is_stopped() {
            self.progress.mark_complete();
            self.events.emit(MonitorEvent::Progress { percent: 100.0 });
        }
        Ok(())
    }

    fn emit_progress(&self, last_reported_tenths: &mut i64) {
        let pct = self.progress.percentage();
        let tenths = (pct * 10.0) as i64;
        if tenths > *last_reported_tenths {
            *last_reported_tenths = tenths;
            self.events.emit(MonitorEvent::Progress { percent: pct });
        }
    }

    fn take_dirty(&self, block_idx: u64) -> bool {
        self.dirty.lock().unwrap().remove(&block_idx)
    }

    fn fetch_block(&self, block_idx: u64) -> Result<Vec<EntityRecord>> {
        if let Some(records) = self.cache.lock().unwrap().get(&block_idx) {
            return Ok(records.clone());
        }
        self.read_block_from_store(block_idx)
    }

    /// Read a block straight from the store and refresh the cache. The dirty
    /// mark is cleared before the read so an invalidation racing with it is
    /// picked up by the next per-entity check rather than lost.
    fn read_block_from_store(&self, block_idx: u64) -> Result<Vec<EntityRecord>> {
        self.dirty.lock().unwrap().remove(&block_idx);
        let records = self
            .store
            .read_block(block_idx * self.block_size, self.block_size)?;
        self.cache.lock().unwrap().put(block_idx, records.clone());
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::entity::{EntityChange, PropertyValue};
    use crate::store::memory::InMemoryEntityStore;
    use std::sync::Mutex as StdMutex;

    struct Collecting {
        ids: StdMutex<Vec<EntityId>>,
    }

    impl ScanConsumer for Collecting {
        fn accept(&self, record: &EntityRecord) -> Result<()> {
            self.ids.lock().unwrap().push(record.id);
            Ok(())
        }
    }

    struct NoDrain;

    impl ExternalUpdatesCheck for NoDrain {
        fn needs_drain(&self) -> bool {
            false
        }

        fn drain(&self, _up_to: EntityId) -> Result<()> {
            Ok(())
        }
    }

    fn entity(id: EntityId) -> EntityRecord {
        EntityRecord::new(id)
            .with_token(0)
            .with_property(0, PropertyValue::Int(id as i64))
    }

    fn store_with(n: u64) -> Arc<InMemoryEntityStore> {
        Arc::new(InMemoryEntityStore::load((0..n).map(entity)))
    }

    #[test]
    fn test_scan_visits_all_entities_in_order() {
        let store = store_with(25);
        let scan = StoreScan::new(store, 4, EventSink::none());
        let consumer = Collecting {
            ids: StdMutex::new(Vec::new()),
        };
        scan.run(&consumer, &NoDrain).unwrap();

        let ids = consumer.ids.lock().unwrap();
        assert_eq!(*ids, (0..25).collect::<Vec<_>>());
        assert!(scan.progress().is_complete());
        assert_eq!(scan.progress().percentage(), 100.0);
    }

    #[test]
    fn test_scan_cannot_be_restarted() {
        let store = store_with(3);
        let scan = StoreScan::new(store, 4, EventSink::none());
        let consumer = Collecting {
            ids: StdMutex::new(Vec::new()),
        };
        scan.run(&consumer, &NoDrain).unwrap();
        assert!(scan.run(&consumer, &NoDrain).is_err());
    }

    #[test]
    fn test_scan_observes_stop_at_entity_boundary() {
        let store = store_with(100);
        let scan = StoreScan::new(store, 10, EventSink::none());

        struct StopAfter<'a, S: EntityStore> {
            scan: &'a StoreScan<S>,
            ids: StdMutex<Vec<EntityId>>,
        }
        impl<S: EntityStore> ScanConsumer for StopAfter<'_, S> {
            fn accept(&self, record: &EntityRecord) -> Result<()> {
                if record.id == 14 {
                    self.scan.stop();
                }
                self.ids.lock().unwrap().push(record.id);
                Ok(())
            }
        }

        let consumer = StopAfter {
            scan: &scan,
            ids: StdMutex::new(Vec::new()),
        };
        scan.run(&consumer, &NoDrain).unwrap();
        assert_eq!(consumer.ids.lock().unwrap().len(), 15);
        assert!(!scan.progress().is_complete());
    }

    #[test]
    fn test_external_change_invalidates_cached_block() {
        // Entity 40 is created while the block containing it is already
        // cached and sits ahead of the cursor; after invalidation the scan
        // must still visit it.
        let store = store_with(30);
        let scan = Arc::new(StoreScan::new(store.clone(), 64, EventSink::none()));

        struct Injecting {
            store: Arc<InMemoryEntityStore>,
            scan: Arc<StoreScan<InMemoryEntityStore>>,
            ids: StdMutex<Vec<EntityId>>,
        }
        impl ScanConsumer for Injecting {
            fn accept(&self, record: &EntityRecord) -> Result<()> {
                if record.id == 5 {
                    self.store
                        .commit(vec![EntityChange::Created(entity(20))])
                        .unwrap_or_else(|_| {});
                    self.scan.note_external_change(20);
                }
                self.ids.lock().unwrap().push(record.id);
                Ok(())
            }
        }

        // id 20 does not exist initially
        store.commit(vec![EntityChange::Deleted(20)]).unwrap();

        let consumer = Injecting {
            store: store.clone(),
            scan: scan.clone(),
            ids: StdMutex::new(Vec::new()),
        };
        scan.run(&consumer, &NoDrain).unwrap();
        let ids = consumer.ids.lock().unwrap();
        assert!(ids.contains(&20), "recreated entity must be rescanned");
        assert_eq!(ids.iter().filter(|&&id| id == 20).count(), 1);
    }

    #[test]
    fn test_progress_monotone_while_scanning() {
        let store = store_with(50);
        let scan = StoreScan::new(store, 7, EventSink::none());
        let progress = scan.progress();

        struct Watch {
            progress: Arc<ScanProgress>,
            last: StdMutex<f64>,
        }
        impl ScanConsumer for Watch {
            fn accept(&self, _record: &EntityRecord) -> Result<()> {
                let pct = self.progress.percentage();
                let mut last = self.last.lock().unwrap();
                assert!(pct >= *last);
                *last = pct;
                Ok(())
            }
        }

        let consumer = Watch {
            progress: progress.clone(),
            last: StdMutex::new(0.0),
        };
        scan.run(&consumer, &NoDrain).unwrap();
        assert_eq!(progress.percentage(), 100.0);
    }

    #[test]
    fn test_empty_store_scan_completes_immediately() {
        let store = Arc::new(InMemoryEntityStore::new());
        let scan = StoreScan::new(store, 4, EventSink::none());
        let consumer = Collecting {
            ids: StdMutex::new(Vec::new()),
        };
        scan.run(&consumer, &NoDrain).unwrap();
        assert!(consumer.ids.lock().unwrap().is_empty());
        assert_eq!(scan.progress().percentage(), 100.0);
    }
}
