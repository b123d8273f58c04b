#![no_main]

use arbitrary::Arbitrary;
use grix::populate::{LiveDecision, UpdateReconciler};
use grix::populate::update::{PendingUpdate, UpdateOrigin};
use grix::store::entity::PropertyValue;
use grix::store::scan::ScanProgress;
use libfuzzer_sys::fuzz_target;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Arbitrary, Debug)]
enum Op {
    LiveAdd { id: u8 },
    LiveRemove { id: u8 },
    ScanEmit { id: u8 },
    Drain { up_to: u8 },
}

fuzz_target!(|ops: Vec<Op>| {
    let progress = Arc::new(ScanProgress::new(256));
    let reconciler = UpdateReconciler::new(progress, 1 << 16, u64::MAX);
    let mut emitted = HashSet::new();

    for op in ops {
        match op {
            Op::LiveAdd { id } => {
                let update = PendingUpdate::added(
                    id as u64,
                    UpdateOrigin::Live,
                    vec![PropertyValue::Int(id as i64)],
                );
                if let LiveDecision::Apply(updates) = reconciler.submit_live(update) {
                    // direct applies only happen for entities the scan emitted
                    assert!(emitted.contains(&(id as u64)));
                    // the submitted update comes last, behind any entries
                    // that were queued before the scan caught up
                    assert_eq!(updates.last().map(|u| u.entity_id), Some(id as u64));
                    assert!(updates.iter().all(|u| u.entity_id == id as u64));
                }
            }
            Op::LiveRemove { id } => {
                let update = PendingUpdate::removed(
                    id as u64,
                    UpdateOrigin::Live,
                    vec![PropertyValue::Int(id as i64)],
                );
                reconciler.submit_live(update);
            }
            Op::ScanEmit { id } => {
                if reconciler.offer_from_scan(id as u64) {
                    assert!(emitted.insert(id as u64), "entity emitted twice");
                }
            }
            Op::Drain { up_to } => {
                reconciler
                    .drain(up_to as u64, &mut |update| {
                        // a drained add for an emitted entity would be a duplicate
                        if update.is_added() {
                            assert!(!emitted.contains(&update.entity_id));
                        }
                        Ok(())
                    })
                    .unwrap();
            }
        }
    }

    // final drain releases everything that is left
    reconciler.drain(u64::MAX, &mut |_| Ok(())).unwrap();
    assert_eq!(reconciler.queued_len(), 0);
});
