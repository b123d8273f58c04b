//! Background population job
//!
//! Wires one store scan, one populator and the store's commit stream
//! together, runs the scan on a dedicated thread, and exposes a handle with
//! blocking cancellation, completion waiting and a human-readable progress
//! line. The commit listener stays registered after the job finishes so that
//! post-flip updates keep flowing into the online accessors.

use crate::config::PopulationConfig;
use crate::monitor::{EventSink, MonitorEvent};
use crate::populate::accumulator::IndexAccumulator;
use crate::populate::populator::MultiIndexPopulator;
use crate::populate::proxy::IndexProxy;
use crate::schema::IndexBuildDescriptor;
use crate::stats::IndexStatisticsStore;
use crate::store::memory::EntityStore;
use crate::store::scan::{ScanHook, StoreScan};
use anyhow::Result;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

/// Terminal result of a population job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopulationOutcome {
    /// Every surviving index flipped to online
    Completed,
    /// The job was cancelled before the scan finished
    Cancelled,
    /// The scan itself failed, or an index could not be flipped; the message
    /// names the first offending index where one is known
    Failed(String),
}

struct Completion {
    outcome: Mutex<Option<PopulationOutcome>>,
    done: Condvar,
}

/// Builder for a population job
pub struct PopulationJob<S: EntityStore + 'static> {
    store: Arc<S>,
    descriptors: Vec<IndexBuildDescriptor>,
    config: PopulationConfig,
    stats: Option<Arc<IndexStatisticsStore>>,
    events: EventSink,
    hook: Option<Box<dyn ScanHook>>,
    injected: Vec<(u64, Box<dyn IndexAccumulator>)>,
}

impl<S: EntityStore + 'static> PopulationJob<S> {
    pub fn new(store: Arc<S>, descriptors: Vec<IndexBuildDescriptor>) -> Self {
        Self {
            store,
            descriptors,
            config: PopulationConfig::default(),
            stats: None,
            events: EventSink::none(),
            hook: None,
            injected: Vec::new(),
        }
    }

    pub fn config(mut self, config: PopulationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn stats(mut self, stats: Arc<IndexStatisticsStore>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn scan_hook(mut self, hook: Box<dyn ScanHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Use a caller-supplied accumulator for one index instead of the one its
    /// descriptor's provider would open
    pub fn with_accumulator(mut self, index_id: u64, accumulator: Box<dyn IndexAccumulator>) -> Self {
        self.injected.push((index_id, accumulator));
        self
    }

    /// Register all builds with the store and start the scan thread
    pub fn start(self) -> Result<PopulationHandle<S>> {
        let Self {
            store,
            descriptors,
            config,
            stats,
            events,
            hook,
            mut injected,
        } = self;

        let background_sampling = config.background_sampling;
        let job_stats = stats.clone();
        let mut scan = StoreScan::new(store.clone(), config.scan_batch_size, events.clone());
        if let Some(hook) = hook {
            scan = scan.with_hook(hook);
        }
        let scan = Arc::new(scan);
        let progress = scan.progress();

        let populator = Arc::new(MultiIndexPopulator::new(
            config,
            progress,
            stats,
            events.clone(),
        )?);

        let mut names = Vec::new();
        let mut proxies = Vec::new();
        for descriptor in descriptors {
            names.push(descriptor.name.clone());
            let index_id = descriptor.index_id;
            let proxy = match injected.iter().position(|(id, _)| *id == index_id) {
                Some(pos) => {
                    let (_, accumulator) = injected.remove(pos);
                    populator.add_population_with(descriptor, accumulator)
                }
                None => populator.add_population(descriptor)?,
            };
            proxies.push((index_id, proxy));
        }

        {
            let scan = scan.clone();
            populator.set_change_notifier(Box::new(move |id| scan.note_external_change(id)));
        }
        {
            let populator = populator.clone();
            store.register_commit_listener(Box::new(move |deltas| {
                populator.apply_live_deltas(deltas);
            }));
        }

        let completion = Arc::new(Completion {
            outcome: Mutex::new(None),
            done: Condvar::new(),
        });

        let thread = {
            let scan = scan.clone();
            let populator = populator.clone();
            let completion = completion.clone();
            thread::Builder::new()
                .name("index-population".into())
                .spawn(move || {
                    populator.create_all();
                    let outcome = match scan.run(&*populator, &*populator) {
                        Err(err) => {
                            let reason = err.to_string();
                            populator.cancel_all(&reason);
                            PopulationOutcome::Failed(reason)
                        }
                        Ok(()) if scan.is_stopped() => {
                            populator.stop_all();
                            events.emit(MonitorEvent::PopulationCancelled);
                            PopulationOutcome::Cancelled
                        }
                        Ok(()) => {
                            events.emit(MonitorEvent::ScanCompleted);
                            populator.flip_after_scan();
                            match populator.first_failure() {
                                Some(name) => PopulationOutcome::Failed(format!(
                                    "population of index '{name}' failed"
                                )),
                                None => {
                                    if background_sampling {
                                        if let Some(stats) = &job_stats {
                                            let _ = stats.reconcile(&populator.online_accessors());
                                        }
                                    }
                                    events.emit(MonitorEvent::PopulationCompleted {
                                        peak_queued_bytes: populator.peak_queued_bytes(),
                                    });
                                    PopulationOutcome::Completed
                                }
                            }
                        }
                    };
                    let mut slot = completion.outcome.lock().unwrap();
                    *slot = Some(outcome);
                    completion.done.notify_all();
                })?
        };

        Ok(PopulationHandle {
            scan,
            populator,
            completion,
            names,
            proxies,
            thread: Mutex::new(Some(thread)),
        })
    }
}

/// Live handle to a running (or finished) population job
pub struct PopulationHandle<S: EntityStore + 'static> {
    scan: Arc<StoreScan<S>>,
    populator: Arc<MultiIndexPopulator>,
    completion: Arc<Completion>,
    names: Vec<String>,
    proxies: Vec<(u64, Arc<IndexProxy>)>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl<S: EntityStore + 'static> PopulationHandle<S> {
    /// Request cancellation and block until the job thread has wound down.
    /// Idempotent; calling after completion returns immediately.
    pub fn cancel(&self) {
        self.scan.stop();
        self.await_completion(None);
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }

    /// Block until the job reaches a terminal outcome, or until `timeout`
    /// elapses. `None` means wait forever.
    pub fn await_completion(&self, timeout: Option<Duration>) -> Option<PopulationOutcome> {
        let guard = self.completion.outcome.lock().unwrap();
        match timeout {
            None => {
                let guard = self
                    .completion
                    .done
                    .wait_while(guard, |slot| slot.is_none())
                    .unwrap();
                guard.clone()
            }
            Some(timeout) => {
                let (guard, _) = self
                    .completion
                    .done
                    .wait_timeout_while(guard, timeout, |slot| slot.is_none())
                    .unwrap();
                guard.clone()
            }
        }
    }

    /// Outcome if the job has finished, without blocking
    pub fn outcome(&self) -> Option<PopulationOutcome> {
        self.completion.outcome.lock().unwrap().clone()
    }

    /// Human-readable progress line. Multi-index jobs list the index names.
    pub fn progress_string(&self) -> String {
        let pct = self.scan.progress().percentage();
        if self.names.len() <= 1 {
            format!("Total progress: {pct:.1}%")
        } else {
            let list = self
                .names
                .iter()
                .map(|name| format!("'{name}'"))
                .collect::<Vec<_>>()
                .join(",");
            format!("Population of indexes {list}; Total progress: {pct:.1}%")
        }
    }

    /// Lifecycle proxies for every index the job was started with, in
    /// declaration order
    pub fn proxies(&self) -> &[(u64, Arc<IndexProxy>)] {
        &self.proxies
    }

    pub fn proxy(&self, index_id: u64) -> Option<Arc<IndexProxy>> {
        self.proxies
            .iter()
            .find(|(id, _)| *id == index_id)
            .map(|(_, proxy)| proxy.clone())
    }

    pub fn populator(&self) -> Arc<MultiIndexPopulator> {
        self.populator.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::populate::proxy::IndexState;
    use crate::schema::SchemaDescriptor;
    use crate::store::entity::{EntityRecord, PropertyValue};
    use crate::store::memory::InMemoryEntityStore;

    fn store_with(n: u64) -> Arc<InMemoryEntityStore> {
        Arc::new(InMemoryEntityStore::load((0..n).map(|id| {
            EntityRecord::new(id)
                .with_token(1)
                .with_property(0, PropertyValue::Int(id as i64))
        })))
    }

    fn descriptor(id: u64, name: &str) -> IndexBuildDescriptor {
        IndexBuildDescriptor::memory(id, name, SchemaDescriptor::new(vec![1], vec![0]))
    }

    #[test]
    fn test_job_builds_and_flips_single_index() {
        let store = store_with(20);
        let handle = PopulationJob::new(store, vec![descriptor(1, "ints")])
            .start()
            .unwrap();
        let outcome = handle.await_completion(Some(Duration::from_secs(10)));
        assert_eq!(outcome, Some(PopulationOutcome::Completed));
        let proxy = handle.proxy(1).unwrap();
        assert_eq!(proxy.state(), IndexState::Online);
        assert_eq!(proxy.accessor().unwrap().entry_count(), 20);
    }

    #[test]
    fn test_progress_string_single_vs_multi() {
        let store = store_with(5);
        let handle = PopulationJob::new(
            store.clone(),
            vec![descriptor(1, "alpha"), descriptor(2, "beta")],
        )
        .start()
        .unwrap();
        handle.await_completion(None);
        assert_eq!(
            handle.progress_string(),
            "Population of indexes 'alpha','beta'; Total progress: 100.0%"
        );

        let single = PopulationJob::new(store, vec![descriptor(3, "gamma")])
            .start()
            .unwrap();
        single.await_completion(None);
        assert_eq!(single.progress_string(), "Total progress: 100.0%");
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let store = store_with(10);
        let handle = PopulationJob::new(store, vec![descriptor(1, "ints")])
            .start()
            .unwrap();
        handle.cancel();
        handle.cancel();
        // a finished scan beats a late stop request; both ends are valid
        let outcome = handle.outcome().unwrap();
        assert!(matches!(
            outcome,
            PopulationOutcome::Completed | PopulationOutcome::Cancelled
        ));
    }

    #[test]
    fn test_empty_store_job_completes() {
        let store = Arc::new(InMemoryEntityStore::new());
        let handle = PopulationJob::new(store, vec![descriptor(1, "ints")])
            .start()
            .unwrap();
        assert_eq!(
            handle.await_completion(None),
            Some(PopulationOutcome::Completed)
        );
        assert_eq!(handle.proxy(1).unwrap().state(), IndexState::Online);
    }
}
