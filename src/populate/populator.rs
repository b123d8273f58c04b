//! Multi-index population fan-out
//!
//! One store scan feeds every registered index build. Scan-origin updates are
//! batched per population and flushed across a rayon pool; live updates from
//! commit listeners are routed through each population's reconciler. A
//! failing population is cancelled and removed without disturbing its
//! siblings, and after the scan each surviving population flips to online
//! through its proxy.

use crate::config::PopulationConfig;
use crate::monitor::{EventSink, MonitorEvent};
use crate::populate::accumulator::{IndexAccessor, IndexAccumulator, open_accumulator};
use crate::populate::proxy::{IndexProxy, IndexState};
use crate::populate::reconciler::{LiveDecision, UpdateReconciler};
use crate::populate::update::{PendingUpdate, UpdateOrigin, live_update_for};
use crate::schema::IndexBuildDescriptor;
use crate::stats::IndexStatisticsStore;
use crate::store::entity::{EntityDelta, EntityId, EntityRecord};
use crate::store::scan::{ExternalUpdatesCheck, ScanConsumer, ScanProgress};
use anyhow::{Result, anyhow, bail};
use rayon::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Callback into the scan's cache invalidation, wired up by the job
pub type ChangeNotifier = Box<dyn Fn(EntityId) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PopulationPhase {
    /// Scan running, updates go through the reconciler
    Building,
    /// Flipped to online, live updates go straight to the accessor
    Flipped,
    Cancelled,
    Stopped,
}

struct PopulationCore {
    phase: PopulationPhase,
    batch: Vec<PendingUpdate>,
    accumulator: Box<dyn IndexAccumulator>,
    accessor: Option<Arc<dyn IndexAccessor>>,
}

/// One index build registered with the populator
pub struct IndexPopulation {
    pub descriptor: IndexBuildDescriptor,
    pub proxy: Arc<IndexProxy>,
    reconciler: UpdateReconciler,
    core: Mutex<PopulationCore>,
}

impl IndexPopulation {
    fn flush(&self) -> Result<()> {
        let mut guard = self.core.lock().unwrap();
        let core = &mut *guard;
        if core.phase != PopulationPhase::Building || core.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut core.batch);
        core.accumulator.add_batch(&batch)
    }

    pub fn queued_bytes(&self) -> u64 {
        self.reconciler.queued_bytes()
    }
}

pub struct MultiIndexPopulator {
    populations: RwLock<Vec<Arc<IndexPopulation>>>,
    config: PopulationConfig,
    progress: Arc<ScanProgress>,
    stats: Option<Arc<IndexStatisticsStore>>,
    pool: rayon::ThreadPool,
    events: EventSink,
    notifier: RwLock<Option<ChangeNotifier>>,
    peak_queued_bytes: AtomicU64,
    /// Names of cancelled populations, in failure order
    failures: Mutex<Vec<String>>,
}

impl MultiIndexPopulator {
    pub fn new(
        config: PopulationConfig,
        progress: Arc<ScanProgress>,
        stats: Option<Arc<IndexStatisticsStore>>,
        events: EventSink,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.parallel_workers)
            .build()?;
        Ok(Self {
            populations: RwLock::new(Vec::new()),
            config,
            progress,
            stats,
            pool,
            events,
            notifier: RwLock::new(None),
            peak_queued_bytes: AtomicU64::new(0),
            failures: Mutex::new(Vec::new()),
        })
    }

    /// Wire the populator to the scan's stale-block invalidation
    pub fn set_change_notifier(&self, notifier: ChangeNotifier) {
        *self.notifier.write().unwrap() = Some(notifier);
    }

    /// Register an index build, opening its accumulator from the provider
    pub fn add_population(&self, descriptor: IndexBuildDescriptor) -> Result<Arc<IndexProxy>> {
        let accumulator = open_accumulator(&descriptor.provider, descriptor.index_id)?;
        Ok(self.add_population_with(descriptor, accumulator))
    }

    /// Register an index build with a caller-supplied accumulator
    pub fn add_population_with(
        &self,
        descriptor: IndexBuildDescriptor,
        accumulator: Box<dyn IndexAccumulator>,
    ) -> Arc<IndexProxy> {
        let proxy = Arc::new(IndexProxy::new());
        let population = Arc::new(IndexPopulation {
            descriptor,
            proxy: proxy.clone(),
            reconciler: UpdateReconciler::new(
                self.progress.clone(),
                self.config.queue_threshold,
                self.config.queue_max_bytes,
            ),
            core: Mutex::new(PopulationCore {
                phase: PopulationPhase::Building,
                batch: Vec::new(),
                accumulator,
                accessor: None,
            }),
        });
        self.populations.write().unwrap().push(population);
        proxy
    }

    /// Announce every registered build; called once, before the scan starts
    pub fn create_all(&self) {
        for population in self.populations.read().unwrap().iter() {
            self.events.emit(MonitorEvent::PopulationStarted {
                index_id: population.descriptor.index_id,
                name: population.descriptor.name.clone(),
            });
        }
    }

    pub fn populations(&self) -> Vec<Arc<IndexPopulation>> {
        self.populations.read().unwrap().clone()
    }

    pub fn has_populations(&self) -> bool {
        !self.populations.read().unwrap().is_empty()
    }

    pub fn peak_queued_bytes(&self) -> u64 {
        self.peak_queued_bytes.load(Ordering::Acquire)
    }

    /// Name of the first population that failed, if any did
    pub fn first_failure(&self) -> Option<String> {
        self.failures.lock().unwrap().first().cloned()
    }

    /// Online indexes and their accessors, for query routing and re-sampling
    pub fn online_accessors(&self) -> Vec<(u64, Arc<dyn IndexAccessor>)> {
        self.populations
            .read()
            .unwrap()
            .iter()
            .filter(|p| p.proxy.state() == IndexState::Online)
            .filter_map(|p| {
                p.proxy
                    .accessor()
                    .map(|accessor| (p.descriptor.index_id, accessor))
            })
            .collect()
    }

    /// Route one transaction's deltas to every affected population
    pub fn apply_live_deltas(&self, deltas: &[EntityDelta]) {
        let populations = self.populations.read().unwrap().clone();
        let mut failed: Vec<(Arc<IndexPopulation>, String)> = Vec::new();
        for delta in deltas {
            let mut queued = false;
            for population in &populations {
                let Some(update) = live_update_for(
                    &population.descriptor.schema,
                    delta.before.as_ref(),
                    delta.after.as_ref(),
                ) else {
                    continue;
                };
                match self.apply_one(population, update) {
                    Ok(was_queued) => queued |= was_queued,
                    Err(err) => failed.push((population.clone(), err.to_string())),
                }
            }
            if queued {
                if let Some(notifier) = self.notifier.read().unwrap().as_ref() {
                    notifier(delta.id);
                }
                self.note_queue_pressure(&populations);
            }
        }
        for (population, reason) in failed {
            self.cancel_population(&population, reason);
        }
    }

    fn apply_one(&self, population: &Arc<IndexPopulation>, update: PendingUpdate) -> Result<bool> {
        let mut guard = population.core.lock().unwrap();
        let core = &mut *guard;
        match core.phase {
            PopulationPhase::Flipped => {
                if let Some(accessor) = &core.accessor {
                    accessor.apply(&update)?;
                    if let Some(stats) = &self.stats {
                        stats.record_updates(population.descriptor.index_id, 1);
                    }
                }
                Ok(false)
            }
            PopulationPhase::Cancelled | PopulationPhase::Stopped => Ok(false),
            PopulationPhase::Building => {
                let entity_id = update.entity_id;
                match population.reconciler.submit_live(update) {
                    LiveDecision::Apply(updates) => {
                        // A buffered scan add for this entity must reach the
                        // accumulator before the live updates do
                        if core.batch.iter().any(|u| u.entity_id == entity_id) {
                            let batch = std::mem::take(&mut core.batch);
                            core.accumulator.add_batch(&batch)?;
                        }
                        for update in &updates {
                            core.accumulator.process(update)?;
                        }
                        if let Some(stats) = &self.stats {
                            stats.record_updates(
                                population.descriptor.index_id,
                                updates.len() as u64,
                            );
                        }
                        Ok(false)
                    }
                    LiveDecision::Queued => Ok(true),
                }
            }
        }
    }

    fn note_queue_pressure(&self, populations: &[Arc<IndexPopulation>]) {
        let total: u64 = populations.iter().map(|p| p.queued_bytes()).sum();
        self.peak_queued_bytes.fetch_max(total, Ordering::AcqRel);
    }

    /// Remove a population after a failure; its siblings continue untouched
    pub fn cancel_population(&self, population: &Arc<IndexPopulation>, reason: String) {
        {
            let mut populations = self.populations.write().unwrap();
            populations.retain(|p| !Arc::ptr_eq(p, population));
        }
        {
            let mut core = population.core.lock().unwrap();
            core.phase = PopulationPhase::Cancelled;
            core.batch.clear();
            let _ = core.accumulator.mark_failed(&reason);
            let _ = core.accumulator.close(false);
        }
        population.proxy.fail(reason.clone());
        self.failures
            .lock()
            .unwrap()
            .push(population.descriptor.name.clone());
        self.events.emit(MonitorEvent::PopulationFailed {
            index_id: population.descriptor.index_id,
            name: population.descriptor.name.clone(),
            reason,
        });
    }

    /// After a completed scan, flip every surviving population to online.
    /// Returns the name of the first population whose flip failed, if any.
    pub fn flip_after_scan(&self) -> Option<String> {
        let populations = self.populations.read().unwrap().clone();
        let mut first_failed = None;
        for population in populations {
            let flip_result = population.proxy.flip(|| {
                let mut guard = population.core.lock().unwrap();
                let core = &mut *guard;
                if core.phase != PopulationPhase::Building {
                    bail!("population cancelled before flip");
                }
                let batch = std::mem::take(&mut core.batch);
                core.accumulator.add_batch(&batch)?;
                population
                    .reconciler
                    .drain(EntityId::MAX, &mut |u| core.accumulator.process(u))?;
                let sample = core.accumulator.sample();
                if let Some(stats) = &self.stats {
                    stats.replace_sample(population.descriptor.index_id, sample)?;
                }
                let accessor = core
                    .accumulator
                    .close(true)?
                    .ok_or_else(|| anyhow!("accumulator closed before flip"))?;
                core.accessor = Some(accessor.clone());
                core.phase = PopulationPhase::Flipped;
                Ok(accessor)
            });
            if let Err(err) = flip_result {
                if first_failed.is_none() {
                    first_failed = Some(population.descriptor.name.clone());
                }
                self.cancel_population(&population, err.to_string());
            }
        }
        first_failed
    }

    /// Abandon every build without flipping; proxies stay in `Populating`
    pub fn stop_all(&self) {
        for population in self.populations.read().unwrap().iter() {
            let mut core = population.core.lock().unwrap();
            if core.phase == PopulationPhase::Building {
                core.phase = PopulationPhase::Stopped;
                core.batch.clear();
                let _ = core.accumulator.close(false);
            }
        }
    }

    /// Cancel every remaining build with the given reason
    pub fn cancel_all(&self, reason: &str) {
        for population in self.populations.read().unwrap().clone() {
            self.cancel_population(&population, reason.to_string());
        }
    }

    /// Tombstone an index and remove all trace of it
    pub fn drop_population(&self, index_id: u64) -> Result<bool> {
        let Some(population) = ({
            let mut populations = self.populations.write().unwrap();
            let found = populations
                .iter()
                .position(|p| p.descriptor.index_id == index_id)
                .map(|i| populations.remove(i));
            found
        }) else {
            return Ok(false);
        };
        population.proxy.tombstone();
        {
            let mut core = population.core.lock().unwrap();
            core.phase = PopulationPhase::Cancelled;
            core.batch.clear();
            let _ = core.accumulator.close(false);
            core.accumulator.drop_storage()?;
            core.accessor = None;
        }
        if let Some(stats) = &self.stats {
            stats.remove(index_id)?;
        }
        Ok(true)
    }
}

impl ScanConsumer for MultiIndexPopulator {
    fn accept(&self, record: &EntityRecord) -> Result<()> {
        let populations = self.populations.read().unwrap().clone();
        let mut to_flush = Vec::new();
        for population in &populations {
            if !population.descriptor.schema.matches(record) {
                continue;
            }
            let Some(values) = population.descriptor.schema.property_subset(record) else {
                continue;
            };
            if !population.reconciler.offer_from_scan(record.id) {
                continue;
            }
            let mut core = population.core.lock().unwrap();
            if core.phase != PopulationPhase::Building {
                continue;
            }
            core.batch
                .push(PendingUpdate::added(record.id, UpdateOrigin::Scan, values));
            if core.batch.len() >= self.config.scan_batch_size {
                to_flush.push(population.clone());
            }
        }
        if !to_flush.is_empty() {
            let failures: Vec<(Arc<IndexPopulation>, String)> = self.pool.install(|| {
                to_flush
                    .par_iter()
                    .filter_map(|p| p.flush().err().map(|e| (p.clone(), e.to_string())))
                    .collect()
            });
            for (population, reason) in failures {
                self.cancel_population(&population, reason);
            }
        }
        Ok(())
    }
}

impl ExternalUpdatesCheck for MultiIndexPopulator {
    fn needs_drain(&self) -> bool {
        self.populations
            .read()
            .unwrap()
            .iter()
            .any(|p| p.reconciler.needs_drain())
    }

    fn drain(&self, up_to: EntityId) -> Result<()> {
        let populations = self.populations.read().unwrap().clone();
        let mut failed = Vec::new();
        for population in &populations {
            let mut guard = population.core.lock().unwrap();
            let core = &mut *guard;
            if core.phase != PopulationPhase::Building {
                continue;
            }
            let result = (|| -> Result<()> {
                let batch = std::mem::take(&mut core.batch);
                core.accumulator.add_batch(&batch)?;
                let mut drained = 0u64;
                let outcome = population.reconciler.drain(up_to, &mut |u| {
                    core.accumulator.process(u)?;
                    drained += 1;
                    Ok(())
                });
                // Drained updates count like directly applied ones
                if let Some(stats) = &self.stats {
                    stats.record_updates(population.descriptor.index_id, drained);
                }
                outcome
            })();
            if let Err(err) = result {
                failed.push((population.clone(), err.to_string()));
            }
        }
        for (population, reason) in failed {
            self.cancel_population(&population, reason);
        }
        Ok(())
    }
}
