//! Per-index build sinks
//!
//! An [`IndexAccumulator`] receives every update for one index build, scan
//! and live origin alike, and turns the accumulated state into an
//! [`IndexAccessor`] at flip time. Accumulators are idempotent: re-adding a
//! present entry or re-removing an absent one is a no-op, which lets the
//! reconciler re-apply queued markers without risk of drift.
//!
//! Two providers exist: a pure in-memory map, and a segment variant that
//! additionally persists a sorted segment file plus a JSON meta sidecar on a
//! successful close, so a finished build survives restart.

use crate::populate::update::{PendingUpdate, UpdateKind};
use crate::schema::AccumulatorProvider;
use crate::store::entity::{EntityId, PropertyValue};
use ahash::AHashMap;
use anyhow::{Context, Result, bail};
use roaring::RoaringTreemap;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

const SEGMENT_MAGIC: &[u8; 8] = b"GRIXSEG1";
const SEGMENT_FILE: &str = "segment.dat";
const META_FILE: &str = "meta.json";
const FAILURE_FILE: &str = "FAILED";

/// Statistical summary of one built index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSample {
    /// Total number of (value, entity) entries
    pub index_size: u64,
    /// Number of distinct indexed value tuples
    pub unique_values: u64,
    /// Number of entries the sample was computed from
    pub sample_size: u64,
}

/// Read-side surface of a finished index, also the target for live updates
/// arriving after the flip.
pub trait IndexAccessor: Send + Sync + std::fmt::Debug {
    fn lookup(&self, values: &[PropertyValue]) -> Vec<EntityId>;
    fn entry_count(&self) -> u64;
    fn sample(&self) -> IndexSample;
    fn apply(&self, update: &PendingUpdate) -> Result<()>;
}

/// Build-time sink for one index
pub trait IndexAccumulator: Send {
    /// Apply a batch of scan-origin updates
    fn add_batch(&mut self, updates: &[PendingUpdate]) -> Result<()>;

    /// Apply one update immediately (live path and queue drain)
    fn process(&mut self, update: &PendingUpdate) -> Result<()>;

    fn sample(&self) -> IndexSample;

    /// Finish the build. On success the accumulated state is sealed and an
    /// accessor over it is returned; on failure partial artifacts are
    /// discarded. Closing twice is a no-op returning `None`.
    fn close(&mut self, success: bool) -> Result<Option<Arc<dyn IndexAccessor>>>;

    /// Record a population failure in durable storage where the provider has
    /// any, so a restart can tell "failed" from "never built".
    fn mark_failed(&mut self, reason: &str) -> Result<()>;

    /// Remove all storage for this build
    fn drop_storage(&mut self) -> Result<()>;
}

/// Construct the accumulator for a descriptor's provider choice
pub fn open_accumulator(
    provider: &AccumulatorProvider,
    index_id: u64,
) -> Result<Box<dyn IndexAccumulator>> {
    Ok(match provider {
        AccumulatorProvider::Memory => Box::new(MemoryAccumulator::new()),
        AccumulatorProvider::Segment { dir } => {
            Box::new(SegmentAccumulator::create(dir.join(format!("index-{index_id}")))?)
        }
    })
}

type EntryMap = AHashMap<Vec<PropertyValue>, RoaringTreemap>;

fn apply_to_map(map: &mut EntryMap, update: &PendingUpdate) {
    match &update.kind {
        UpdateKind::Added(values) => {
            map.entry(values.clone())
                .or_default()
                .insert(update.entity_id);
        }
        UpdateKind::Changed { before, after } => {
            remove_entry(map, before, update.entity_id);
            map.entry(after.clone()).or_default().insert(update.entity_id);
        }
        UpdateKind::Removed(values) => {
            remove_entry(map, values, update.entity_id);
        }
    }
}

fn remove_entry(map: &mut EntryMap, values: &[PropertyValue], id: EntityId) {
    if let Some(ids) = map.get_mut(values) {
        ids.remove(id);
        if ids.is_empty() {
            map.remove(values);
        }
    }
}

fn sample_map(map: &EntryMap) -> IndexSample {
    let index_size: u64 = map.values().map(|ids| ids.len()).sum();
    IndexSample {
        index_size,
        unique_values: map.len() as u64,
        sample_size: index_size,
    }
}

/// Accessor over a sealed entry map
#[derive(Debug)]
pub struct MapAccessor {
    entries: RwLock<EntryMap>,
}

impl MapAccessor {
    fn new(entries: EntryMap) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }
}

impl IndexAccessor for MapAccessor {
    fn lookup(&self, values: &[PropertyValue]) -> Vec<EntityId> {
        self.entries
            .read()
            .unwrap()
            .get(values)
            .map(|ids| ids.iter().collect())
            .unwrap_or_default()
    }

    fn entry_count(&self) -> u64 {
        self.entries
            .read()
            .unwrap()
            .values()
            .map(|ids| ids.len())
            .sum()
    }

    fn sample(&self) -> IndexSample {
        sample_map(&self.entries.read().unwrap())
    }

    fn apply(&self, update: &PendingUpdate) -> Result<()> {
        apply_to_map(&mut self.entries.write().unwrap(), update);
        Ok(())
    }
}

/// Purely in-memory accumulator
pub struct MemoryAccumulator {
    entries: EntryMap,
    closed: bool,
}

impl MemoryAccumulator {
    pub fn new() -> Self {
        Self {
            entries: EntryMap::default(),
            closed: false,
        }
    }
}

impl Default for MemoryAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexAccumulator for MemoryAccumulator {
    fn add_batch(&mut self, updates: &[PendingUpdate]) -> Result<()> {
        for update in updates {
            apply_to_map(&mut self.entries, update);
        }
        Ok(())
    }

    fn process(&mut self, update: &PendingUpdate) -> Result<()> {
        apply_to_map(&mut self.entries, update);
        Ok(())
    }

    fn sample(&self) -> IndexSample {
        sample_map(&self.entries)
    }

    fn close(&mut self, success: bool) -> Result<Option<Arc<dyn IndexAccessor>>> {
        if self.closed {
            return Ok(None);
        }
        self.closed = true;
        let entries = std::mem::take(&mut self.entries);
        if success {
            Ok(Some(Arc::new(MapAccessor::new(entries))))
        } else {
            Ok(None)
        }
    }

    fn mark_failed(&mut self, _reason: &str) -> Result<()> {
        Ok(())
    }

    fn drop_storage(&mut self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct SegmentMeta {
    index_size: u64,
    unique_values: u64,
}

/// Accumulator that seals into a sorted on-disk segment
pub struct SegmentAccumulator {
    dir: PathBuf,
    entries: EntryMap,
    closed: bool,
}

impl SegmentAccumulator {
    pub fn create(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating segment dir {}", dir.display()))?;
        // A previous build may have left a failure marker or stale files
        // behind; a fresh build starts from an empty directory
        let marker = dir.join(FAILURE_FILE);
        if marker.exists() {
            fs::remove_file(&marker)
                .with_context(|| format!("clearing failure marker in {}", dir.display()))?;
        }
        let _ = fs::remove_file(dir.join(format!("{SEGMENT_FILE}.tmp")));
        let _ = fs::remove_file(dir.join(SEGMENT_FILE));
        let _ = fs::remove_file(dir.join(META_FILE));
        Ok(Self {
            dir,
            entries: EntryMap::default(),
            closed: false,
        })
    }

    /// Open a previously sealed segment as an accessor
    pub fn open_sealed(dir: &Path) -> Result<Arc<dyn IndexAccessor>> {
        if dir.join(FAILURE_FILE).exists() {
            let reason = fs::read_to_string(dir.join(FAILURE_FILE)).unwrap_or_default();
            bail!("segment at {} is failed: {}", dir.display(), reason.trim());
        }
        let entries = read_segment(&dir.join(SEGMENT_FILE))?;
        Ok(Arc::new(MapAccessor::new(entries)))
    }

    fn seal(&mut self) -> Result<()> {
        let mut keys: Vec<&Vec<PropertyValue>> = self.entries.keys().collect();
        keys.sort();

        let path = self.dir.join(SEGMENT_FILE);
        let tmp = self.dir.join(format!("{SEGMENT_FILE}.tmp"));
        {
            let mut out = BufWriter::new(
                File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?,
            );
            out.write_all(SEGMENT_MAGIC)?;
            out.write_all(&(keys.len() as u64).to_le_bytes())?;
            for key in keys {
                let mut encoded = Vec::new();
                encode_values(key, &mut encoded);
                out.write_all(&encoded)?;
                let ids = &self.entries[key];
                let mut bitmap = Vec::new();
                ids.serialize_into(&mut bitmap)?;
                out.write_all(&(bitmap.len() as u32).to_le_bytes())?;
                out.write_all(&bitmap)?;
            }
            out.flush()?;
        }
        fs::rename(&tmp, &path)?;

        let sample = sample_map(&self.entries);
        let meta = SegmentMeta {
            index_size: sample.index_size,
            unique_values: sample.unique_values,
        };
        fs::write(self.dir.join(META_FILE), serde_json::to_string_pretty(&meta)?)?;
        Ok(())
    }

    fn discard_partial(&self) {
        let _ = fs::remove_file(self.dir.join(format!("{SEGMENT_FILE}.tmp")));
        let _ = fs::remove_file(self.dir.join(SEGMENT_FILE));
        let _ = fs::remove_file(self.dir.join(META_FILE));
    }
}

impl IndexAccumulator for SegmentAccumulator {
    fn add_batch(&mut self, updates: &[PendingUpdate]) -> Result<()> {
        for update in updates {
            apply_to_map(&mut self.entries, update);
        }
        Ok(())
    }

    fn process(&mut self, update: &PendingUpdate) -> Result<()> {
        apply_to_map(&mut self.entries, update);
        Ok(())
    }

    fn sample(&self) -> IndexSample {
        sample_map(&self.entries)
    }

    fn close(&mut self, success: bool) -> Result<Option<Arc<dyn IndexAccessor>>> {
        if self.closed {
            return Ok(None);
        }
        self.closed = true;
        if success {
            self.seal()?;
            let entries = std::mem::take(&mut self.entries);
            Ok(Some(Arc::new(MapAccessor::new(entries))))
        } else {
            self.discard_partial();
            self.entries.clear();
            Ok(None)
        }
    }

    fn mark_failed(&mut self, reason: &str) -> Result<()> {
        fs::write(self.dir.join(FAILURE_FILE), reason)
            .with_context(|| format!("writing failure marker in {}", self.dir.display()))
    }

    fn drop_storage(&mut self) -> Result<()> {
        self.entries.clear();
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)
                .with_context(|| format!("removing segment dir {}", self.dir.display()))?;
        }
        Ok(())
    }
}

fn read_segment(path: &Path) -> Result<EntryMap> {
    let mut input = BufReader::new(
        File::open(path).with_context(|| format!("opening segment {}", path.display()))?,
    );
    let mut magic = [0u8; 8];
    input.read_exact(&mut magic)?;
    if &magic != SEGMENT_MAGIC {
        bail!("bad segment magic in {}", path.display());
    }
    let mut count_buf = [0u8; 8];
    input.read_exact(&mut count_buf)?;
    let count = u64::from_le_bytes(count_buf);

    let mut rest = Vec::new();
    input.read_to_end(&mut rest)?;
    let mut cursor: &[u8] = &rest;

    let mut entries = EntryMap::default();
    for _ in 0..count {
        let values = decode_values(&mut cursor)?;
        let len = read_u32(&mut cursor)? as usize;
        if cursor.len() < len {
            bail!("truncated bitmap in {}", path.display());
        }
        let (bitmap_bytes, tail) = cursor.split_at(len);
        cursor = tail;
        let ids = RoaringTreemap::deserialize_from(bitmap_bytes)?;
        entries.insert(values, ids);
    }
    Ok(entries)
}

const TAG_BOOL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_FLOAT: u8 = 2;
const TAG_TEXT: u8 = 3;

/// Encode a value tuple into the segment key format
pub fn encode_values(values: &[PropertyValue], out: &mut Vec<u8>) {
    out.extend_from_slice(&(values.len() as u32).to_le_bytes());
    for value in values {
        match value {
            PropertyValue::Bool(b) => {
                out.push(TAG_BOOL);
                out.push(u8::from(*b));
            }
            PropertyValue::Int(i) => {
                out.push(TAG_INT);
                out.extend_from_slice(&i.to_le_bytes());
            }
            PropertyValue::Float(f) => {
                out.push(TAG_FLOAT);
                out.extend_from_slice(&f.to_le_bytes());
            }
            PropertyValue::Text(s) => {
                out.push(TAG_TEXT);
                out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
        }
    }
}

/// Decode one value tuple, advancing the cursor past it
pub fn decode_values(cursor: &mut &[u8]) -> Result<Vec<PropertyValue>> {
    let count = read_u32(cursor)?;
    let mut values = Vec::with_capacity(count.min(64) as usize);
    for _ in 0..count {
        let tag = read_u8(cursor)?;
        let value = match tag {
            TAG_BOOL => PropertyValue::Bool(read_u8(cursor)? != 0),
            TAG_INT => PropertyValue::Int(i64::from_le_bytes(read_array(cursor)?)),
            TAG_FLOAT => PropertyValue::Float(f64::from_le_bytes(read_array(cursor)?)),
            TAG_TEXT => {
                let len = read_u32(cursor)? as usize;
                if cursor.len() < len {
                    bail!("truncated text value");
                }
                let (bytes, tail) = cursor.split_at(len);
                *cursor = tail;
                PropertyValue::Text(std::str::from_utf8(bytes)?.to_string())
            }
            other => bail!("unknown value tag {}", other),
        };
        values.push(value);
    }
    Ok(values)
}

fn read_u8(cursor: &mut &[u8]) -> Result<u8> {
    let Some((&byte, tail)) = cursor.split_first() else {
        bail!("unexpected end of segment data");
    };
    *cursor = tail;
    Ok(byte)
}

fn read_u32(cursor: &mut &[u8]) -> Result<u32> {
    Ok(u32::from_le_bytes(read_array(cursor)?))
}

fn read_array<const N: usize>(cursor: &mut &[u8]) -> Result<[u8; N]> {
    if cursor.len() < N {
        bail!("unexpected end of segment data");
    }
    let (head, tail) = cursor.split_at(N);
    *cursor = tail;
    Ok(head.try_into().unwrap())
}
