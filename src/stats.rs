//! Index statistics store
//!
//! Durable per-index samples plus session-local activity counters. Samples
//! (size, unique values, sample size) are replaced wholesale at flip time and
//! persisted through a write-temp-then-rename of a single JSON file. The
//! activity counters (updates since the last sample, queries served) are
//! deliberately not persisted: they restart from zero on every open, and
//! consumers treat them as "since this process started".

use crate::populate::accumulator::{IndexAccessor, IndexSample};
use ahash::AHashMap;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Point-in-time view of one index's statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStatistics {
    pub sample: IndexSample,
    /// Updates applied since the sample was taken, this session
    pub updates_since_sample: u64,
    /// Queries served this session
    pub queries: u64,
}

struct Entry {
    sample: IndexSample,
    updates_since_sample: u64,
    queries: u64,
}

pub struct IndexStatisticsStore {
    path: Option<PathBuf>,
    inner: Mutex<AHashMap<u64, Entry>>,
}

impl IndexStatisticsStore {
    /// Store that never touches disk, for tests and throwaway jobs
    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: Mutex::new(AHashMap::default()),
        }
    }

    /// Open the store backed by `path`, loading persisted samples if the file
    /// exists. Activity counters always start at zero.
    pub fn open(path: PathBuf) -> Result<Self> {
        let mut entries = AHashMap::default();
        if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("reading stats file {}", path.display()))?;
            let samples: BTreeMap<u64, IndexSample> = serde_json::from_str(&raw)
                .with_context(|| format!("parsing stats file {}", path.display()))?;
            for (id, sample) in samples {
                entries.insert(
                    id,
                    Entry {
                        sample,
                        updates_since_sample: 0,
                        queries: 0,
                    },
                );
            }
        }
        Ok(Self {
            path: Some(path),
            inner: Mutex::new(entries),
        })
    }

    /// Replace the sample for `index_id` and reset its session counters
    pub fn replace_sample(&self, index_id: u64, sample: IndexSample) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(
            index_id,
            Entry {
                sample,
                updates_since_sample: 0,
                queries: 0,
            },
        );
        self.persist(&inner)
    }

    pub fn record_updates(&self, index_id: u64, n: u64) {
        if n == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner
            .entry(index_id)
            .or_insert_with(|| Entry {
                sample: IndexSample::default(),
                updates_since_sample: 0,
                queries: 0,
            })
            .updates_since_sample += n;
    }

    pub fn record_queries(&self, index_id: u64, n: u64) {
        if n == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.get_mut(&index_id) {
            entry.queries += n;
        }
    }

    pub fn get(&self, index_id: u64) -> Option<IndexStatistics> {
        self.inner
            .lock()
            .unwrap()
            .get(&index_id)
            .map(|entry| IndexStatistics {
                sample: entry.sample,
                updates_since_sample: entry.updates_since_sample,
                queries: entry.queries,
            })
    }

    pub fn remove(&self, index_id: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.remove(&index_id);
        self.persist(&inner)
    }

    /// All persisted samples, ordered by index id
    pub fn samples(&self) -> BTreeMap<u64, IndexSample> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .map(|(id, entry)| (*id, entry.sample))
            .collect()
    }

    /// Recovery pass: online indexes with no usable sample on record are
    /// re-sampled from their accessors.
    pub fn reconcile(&self, online: &[(u64, Arc<dyn IndexAccessor>)]) -> Result<()> {
        let mut refreshed = Vec::new();
        {
            let inner = self.inner.lock().unwrap();
            for (id, accessor) in online {
                let usable = inner
                    .get(id)
                    .is_some_and(|entry| entry.sample.sample_size > 0);
                if !usable {
                    refreshed.push((*id, accessor.sample()));
                }
            }
        }
        for (id, sample) in refreshed {
            self.replace_sample(id, sample)?;
        }
        Ok(())
    }

    fn persist(&self, inner: &AHashMap<u64, Entry>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let samples: BTreeMap<u64, IndexSample> = inner
            .iter()
            .map(|(id, entry)| (*id, entry.sample))
            .collect();
        let json = serde_json::to_string_pretty(&samples)?;
        let tmp = path.with_extension("json.tmp");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::populate::accumulator::{IndexAccumulator, MemoryAccumulator};
    use crate::populate::update::PendingUpdate;
    use crate::populate::UpdateOrigin;
    use crate::store::entity::PropertyValue;

    fn sample(size: u64) -> IndexSample {
        IndexSample {
            index_size: size,
            unique_values: size,
            sample_size: size,
        }
    }

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("grix-stats-{tag}-{}.json", std::process::id()))
    }

    #[test]
    fn test_replace_sample_resets_counters() {
        let store = IndexStatisticsStore::in_memory();
        store.replace_sample(1, sample(10)).unwrap();
        store.record_updates(1, 5);
        store.record_queries(1, 2);
        assert_eq!(store.get(1).unwrap().updates_since_sample, 5);

        store.replace_sample(1, sample(15)).unwrap();
        let stats = store.get(1).unwrap();
        assert_eq!(stats.sample.index_size, 15);
        assert_eq!(stats.updates_since_sample, 0);
        assert_eq!(stats.queries, 0);
    }

    #[test]
    fn test_samples_survive_reopen_but_counters_reset() {
        let path = temp_path("reopen");
        let _ = fs::remove_file(&path);
        {
            let store = IndexStatisticsStore::open(path.clone()).unwrap();
            store.replace_sample(7, sample(42)).unwrap();
            store.record_updates(7, 99);
            store.record_queries(7, 3);
        }
        let store = IndexStatisticsStore::open(path.clone()).unwrap();
        let stats = store.get(7).unwrap();
        assert_eq!(stats.sample.index_size, 42);
        assert_eq!(stats.updates_since_sample, 0);
        assert_eq!(stats.queries, 0);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_remove_is_persisted() {
        let path = temp_path("remove");
        let _ = fs::remove_file(&path);
        {
            let store = IndexStatisticsStore::open(path.clone()).unwrap();
            store.replace_sample(1, sample(1)).unwrap();
            store.replace_sample(2, sample(2)).unwrap();
            store.remove(1).unwrap();
        }
        let store = IndexStatisticsStore::open(path.clone()).unwrap();
        assert!(store.get(1).is_none());
        assert!(store.get(2).is_some());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_reconcile_resamples_missing_records() {
        let mut acc = MemoryAccumulator::new();
        acc.process(&PendingUpdate::added(
            1,
            UpdateOrigin::Scan,
            vec![PropertyValue::Int(1)],
        ))
        .unwrap();
        acc.process(&PendingUpdate::added(
            2,
            UpdateOrigin::Scan,
            vec![PropertyValue::Int(2)],
        ))
        .unwrap();
        let accessor = acc.close(true).unwrap().unwrap();

        let store = IndexStatisticsStore::in_memory();
        store.replace_sample(5, sample(9)).unwrap();
        store.reconcile(&[(4, accessor.clone()), (5, accessor)]).unwrap();

        // missing record got a fresh sample, existing one untouched
        assert_eq!(store.get(4).unwrap().sample.index_size, 2);
        assert_eq!(store.get(5).unwrap().sample.index_size, 9);
    }

    #[test]
    fn test_queries_ignored_for_unknown_index() {
        let store = IndexStatisticsStore::in_memory();
        store.record_queries(99, 5);
        assert!(store.get(99).is_none());
    }
}
