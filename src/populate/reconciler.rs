//! Concurrent Update Reconciler
//!
//! Decides, for every live update arriving while the store scan runs,
//! whether it is applied to the accumulator immediately or queued until the
//! scan catches up. The invariant: every update lands in the built index
//! exactly once, whether the scan has already visited the entity, is about
//! to, or never will.
//!
//! "Already seen" is keyed on the scan's actual emission set
//! (`scan_seen`), not the approximate cursor, which closes the race where a
//! creation lands inside an already-cached scan block ahead of the logical
//! cursor. Residual check-then-enqueue races err toward keeping the queued
//! update: at drain time a queued `Added` whose id the scan emitted is
//! discarded as redundant (the scan read a fresh snapshot), while queued
//! `Changed`/`Removed` markers are always applied - the accumulators no-op
//! duplicates, so re-application is idempotent and silent loss is
//! impossible.

use crate::populate::update::PendingUpdate;
use crate::store::entity::EntityId;
use crate::store::scan::ScanProgress;
use anyhow::Result;
use roaring::RoaringTreemap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Outcome of submitting a live update
#[derive(Debug, Clone, PartialEq)]
pub enum LiveDecision {
    /// The scan has already passed this entity: the caller applies the
    /// returned updates directly, now, in order. Entries for this entity
    /// that were queued before the scan caught up come first; applying them
    /// out of order would resurrect overwritten values at the next drain.
    Apply(Vec<PendingUpdate>),
    /// The scan has not reached this entity yet: the update was queued (or,
    /// for a delete, cancelled the queued entries and suppressed the scan's
    /// future emission)
    Queued,
}

/// Per-population reconciliation state
pub struct UpdateReconciler {
    progress: Arc<ScanProgress>,
    queue: Mutex<VecDeque<PendingUpdate>>,
    queued_len: AtomicUsize,
    queued_bytes: AtomicU64,
    /// Entity ids the scan actually emitted (true enumeration)
    scan_seen: Mutex<RoaringTreemap>,
    /// Entity ids deleted before the scan reached them; their scan emission
    /// is suppressed even if a stale cached block still surfaces them
    suppressed: Mutex<RoaringTreemap>,
    queue_threshold: usize,
    queue_max_bytes: u64,
}

impl UpdateReconciler {
    pub fn new(progress: Arc<ScanProgress>, queue_threshold: usize, queue_max_bytes: u64) -> Self {
        Self {
            progress,
            queue: Mutex::new(VecDeque::new()),
            queued_len: AtomicUsize::new(0),
            queued_bytes: AtomicU64::new(0),
            scan_seen: Mutex::new(RoaringTreemap::new()),
            suppressed: Mutex::new(RoaringTreemap::new()),
            queue_threshold: queue_threshold.max(1),
            queue_max_bytes,
        }
    }

    /// A live update arrived from a committing transaction
    pub fn submit_live(&self, update: PendingUpdate) -> LiveDecision {
        let id = update.entity_id;
        let emitted = self.scan_seen.lock().unwrap().contains(id);
        if emitted || self.progress.has_passed(id) {
            let mut to_apply = self.take_queued(id, emitted);
            to_apply.push(update);
            return LiveDecision::Apply(to_apply);
        }

        if update.is_removed() {
            // Cancel-on-delete: the pending scan-side add (queued or not yet
            // produced) must never surface. Drop any queued entries for this
            // entity and suppress the scan's emission for it.
            self.remove_queued(id);
            self.suppressed.lock().unwrap().insert(id);
            return LiveDecision::Queued;
        }

        let bytes = update.rough_size();
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(update);
        self.queued_len.store(queue.len(), Ordering::Release);
        self.queued_bytes.fetch_add(bytes, Ordering::Release);
        LiveDecision::Queued
    }

    /// The scan is about to emit an add for `id`. Returns false if the
    /// emission must be skipped (deleted before the scan arrived, or
    /// already emitted via a stale block re-read). On emission the id is
    /// recorded in the true-enumeration set.
    pub fn offer_from_scan(&self, id: EntityId) -> bool {
        if self.suppressed.lock().unwrap().contains(id) {
            return false;
        }
        self.scan_seen.lock().unwrap().insert(id)
    }

    /// Queue depth has crossed the configured threshold or byte cap
    pub fn needs_drain(&self) -> bool {
        let len = self.queued_len.load(Ordering::Acquire);
        (len > 0 && len >= self.queue_threshold)
            || self.queued_bytes.load(Ordering::Acquire) >= self.queue_max_bytes
    }

    pub fn queued_bytes(&self) -> u64 {
        self.queued_bytes.load(Ordering::Acquire)
    }

    pub fn queued_len(&self) -> usize {
        self.queued_len.load(Ordering::Acquire)
    }

    /// Apply all queued updates with `entity_id <= up_to` through `sink`, in
    /// FIFO order. Queued adds already covered by the scan's emission are
    /// discarded as redundant markers. Called from the scan thread at entity
    /// boundaries and, with `EntityId::MAX`, right before the flip.
    pub fn drain(
        &self,
        up_to: EntityId,
        sink: &mut dyn FnMut(&PendingUpdate) -> Result<()>,
    ) -> Result<()> {
        let drained: Vec<PendingUpdate> = {
            let mut queue = self.queue.lock().unwrap();
            if queue.is_empty() {
                return Ok(());
            }
            let mut kept = VecDeque::with_capacity(queue.len());
            let mut drained = Vec::new();
            for update in queue.drain(..) {
                if update.entity_id <= up_to {
                    drained.push(update);
                } else {
                    kept.push_back(update);
                }
            }
            *queue = kept;
            self.queued_len.store(queue.len(), Ordering::Release);
            drained
        };

        let mut drained_bytes = 0u64;
        for update in &drained {
            drained_bytes += update.rough_size();
        }
        // Subtract per drained batch rather than zeroing: enqueues race with
        // the drain and zeroing would drift over time.
        self.queued_bytes.fetch_sub(
            drained_bytes.min(self.queued_bytes.load(Ordering::Acquire)),
            Ordering::Release,
        );

        let seen = self.scan_seen.lock().unwrap().clone();
        for update in &drained {
            if update.is_added() && seen.contains(update.entity_id) {
                continue;
            }
            sink(update)?;
        }
        Ok(())
    }

    /// Pull this entity's queued entries out in FIFO order so the caller
    /// can apply them ahead of a direct live update. A queued add whose id
    /// the scan emitted is a redundant marker and is dropped here, same as
    /// at drain time.
    fn take_queued(&self, id: EntityId, emitted: bool) -> Vec<PendingUpdate> {
        let mut queue = self.queue.lock().unwrap();
        if !queue.iter().any(|update| update.entity_id == id) {
            return Vec::new();
        }
        let mut removed_bytes = 0u64;
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(queue.len());
        for queued in queue.drain(..) {
            if queued.entity_id == id {
                removed_bytes += queued.rough_size();
                if !(emitted && queued.is_added()) {
                    taken.push(queued);
                }
            } else {
                kept.push_back(queued);
            }
        }
        *queue = kept;
        self.queued_len.store(queue.len(), Ordering::Release);
        self.queued_bytes.fetch_sub(
            removed_bytes.min(self.queued_bytes.load(Ordering::Acquire)),
            Ordering::Release,
        );
        taken
    }

    fn remove_queued(&self, id: EntityId) {
        let mut queue = self.queue.lock().unwrap();
        let mut removed_bytes = 0u64;
        queue.retain(|update| {
            if update.entity_id == id {
                removed_bytes += update.rough_size();
                false
            } else {
                true
            }
        });
        self.queued_len.store(queue.len(), Ordering::Release);
        self.queued_bytes.fetch_sub(
            removed_bytes.min(self.queued_bytes.load(Ordering::Acquire)),
            Ordering::Release,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::populate::update::{UpdateKind, UpdateOrigin};
    use crate::store::entity::PropertyValue;

    fn progress_at(cursor: Option<EntityId>) -> Arc<ScanProgress> {
        let progress = Arc::new(ScanProgress::new(100));
        if let Some(id) = cursor {
            progress.advance(id);
        }
        progress
    }

    fn reconciler(progress: Arc<ScanProgress>) -> UpdateReconciler {
        UpdateReconciler::new(progress, 3, 1 << 20)
    }

    fn add(id: EntityId) -> PendingUpdate {
        PendingUpdate::added(id, UpdateOrigin::Live, vec![PropertyValue::Int(id as i64)])
    }

    fn remove(id: EntityId) -> PendingUpdate {
        PendingUpdate::removed(id, UpdateOrigin::Live, vec![PropertyValue::Int(id as i64)])
    }

    #[test]
    fn test_update_ahead_of_scan_is_queued() {
        let r = reconciler(progress_at(None));
        assert_eq!(r.submit_live(add(10)), LiveDecision::Queued);
        assert_eq!(r.queued_len(), 1);
    }

    #[test]
    fn test_update_behind_cursor_applies_directly() {
        let r = reconciler(progress_at(Some(15)));
        assert_eq!(r.submit_live(add(10)), LiveDecision::Apply(vec![add(10)]));
        assert!(matches!(r.submit_live(remove(3)), LiveDecision::Apply(_)));
        assert_eq!(r.queued_len(), 0);
    }

    #[test]
    fn test_update_for_emitted_entity_applies_directly() {
        let r = reconciler(progress_at(None));
        assert!(r.offer_from_scan(10));
        assert!(matches!(r.submit_live(add(10)), LiveDecision::Apply(_)));
        assert_eq!(r.queued_len(), 0);
    }

    #[test]
    fn test_scan_skips_suppressed_entity() {
        let r = reconciler(progress_at(None));
        r.submit_live(add(7));
        r.submit_live(remove(7));
        // queued add cancelled, emission suppressed
        assert_eq!(r.queued_len(), 0);
        assert!(!r.offer_from_scan(7));
    }

    #[test]
    fn test_scan_emits_each_entity_once() {
        let r = reconciler(progress_at(None));
        assert!(r.offer_from_scan(4));
        assert!(!r.offer_from_scan(4));
    }

    #[test]
    fn test_drain_respects_limit_and_order() {
        let r = reconciler(progress_at(None));
        r.submit_live(add(5));
        r.submit_live(add(20));
        r.submit_live(add(6));

        let mut applied = Vec::new();
        r.drain(10, &mut |u| {
            applied.push(u.entity_id);
            Ok(())
        })
        .unwrap();
        assert_eq!(applied, vec![5, 6]);
        assert_eq!(r.queued_len(), 1);

        applied.clear();
        r.drain(EntityId::MAX, &mut |u| {
            applied.push(u.entity_id);
            Ok(())
        })
        .unwrap();
        assert_eq!(applied, vec![20]);
        assert_eq!(r.queued_len(), 0);
        assert_eq!(r.queued_bytes(), 0);
    }

    #[test]
    fn test_drain_discards_redundant_queued_add() {
        let r = reconciler(progress_at(None));
        r.submit_live(add(9));
        // scan reaches the entity afterwards and reads a fresh snapshot
        assert!(r.offer_from_scan(9));

        let mut applied = Vec::new();
        r.drain(EntityId::MAX, &mut |u| {
            applied.push(u.entity_id);
            Ok(())
        })
        .unwrap();
        assert!(applied.is_empty());
    }

    #[test]
    fn test_drain_applies_queued_change_even_after_scan_emission() {
        let r = reconciler(progress_at(None));
        let change = PendingUpdate::changed(
            9,
            UpdateOrigin::Live,
            vec![PropertyValue::Int(1)],
            vec![PropertyValue::Int(2)],
        );
        r.submit_live(change.clone());
        assert!(r.offer_from_scan(9));

        let mut applied = Vec::new();
        r.drain(EntityId::MAX, &mut |u| {
            applied.push(u.kind.clone());
            Ok(())
        })
        .unwrap();
        assert_eq!(applied, vec![change.kind]);
    }

    #[test]
    fn test_direct_apply_flushes_stale_queued_entries_first() {
        let r = reconciler(progress_at(None));
        let first = PendingUpdate::changed(
            9,
            UpdateOrigin::Live,
            vec![PropertyValue::Int(1)],
            vec![PropertyValue::Int(2)],
        );
        r.submit_live(first.clone());
        assert!(r.offer_from_scan(9));

        let second = PendingUpdate::changed(
            9,
            UpdateOrigin::Live,
            vec![PropertyValue::Int(2)],
            vec![PropertyValue::Int(3)],
        );
        match r.submit_live(second.clone()) {
            LiveDecision::Apply(updates) => assert_eq!(updates, vec![first, second]),
            LiveDecision::Queued => panic!("expected direct apply"),
        }
        assert_eq!(r.queued_len(), 0);

        // nothing stale left for the final drain to re-apply out of order
        let mut drained = 0;
        r.drain(EntityId::MAX, &mut |_| {
            drained += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(drained, 0);
    }

    #[test]
    fn test_direct_apply_drops_redundant_queued_add() {
        let r = reconciler(progress_at(None));
        r.submit_live(add(4));
        assert!(r.offer_from_scan(4));

        let change = PendingUpdate::changed(
            4,
            UpdateOrigin::Live,
            vec![PropertyValue::Int(4)],
            vec![PropertyValue::Int(5)],
        );
        match r.submit_live(change.clone()) {
            LiveDecision::Apply(updates) => assert_eq!(updates, vec![change]),
            LiveDecision::Queued => panic!("expected direct apply"),
        }
        assert_eq!(r.queued_len(), 0);
    }

    #[test]
    fn test_needs_drain_on_threshold() {
        let r = reconciler(progress_at(None));
        assert!(!r.needs_drain());
        r.submit_live(add(10));
        r.submit_live(add(11));
        assert!(!r.needs_drain());
        r.submit_live(add(12));
        assert!(r.needs_drain());
    }

    #[test]
    fn test_needs_drain_on_byte_cap() {
        let r = UpdateReconciler::new(progress_at(None), 1000, 64);
        r.submit_live(PendingUpdate::added(
            1,
            UpdateOrigin::Live,
            vec![PropertyValue::Text("x".repeat(100))],
        ));
        assert!(r.needs_drain());
    }

    #[test]
    fn test_update_kind_helpers() {
        assert!(add(1).is_added());
        assert!(remove(1).is_removed());
        assert!(matches!(add(1).kind, UpdateKind::Added(_)));
    }
}
