//! Index lifecycle proxy
//!
//! One proxy per index, handed out at job creation and valid for the life of
//! the index. State reads are wait-free; transitions go through a mutex so
//! that a flip racing a tombstone resolves deterministically (the tombstone
//! wins and the flip is abandoned).

use crate::populate::accumulator::IndexAccessor;
use anyhow::Result;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

const TAG_POPULATING: u8 = 0;
const TAG_ONLINE: u8 = 1;
const TAG_FAILED: u8 = 2;
const TAG_TOMBSTONED: u8 = 3;

/// Externally visible lifecycle state of one index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Populating,
    Online,
    Failed,
    Tombstoned,
}

#[derive(Default)]
struct ProxyInner {
    accessor: Option<Arc<dyn IndexAccessor>>,
    failure: Option<String>,
}

pub struct IndexProxy {
    tag: AtomicU8,
    inner: Mutex<ProxyInner>,
}

impl IndexProxy {
    pub fn new() -> Self {
        Self {
            tag: AtomicU8::new(TAG_POPULATING),
            inner: Mutex::new(ProxyInner::default()),
        }
    }

    /// Current state, a single atomic load
    pub fn state(&self) -> IndexState {
        match self.tag.load(Ordering::Acquire) {
            TAG_POPULATING => IndexState::Populating,
            TAG_ONLINE => IndexState::Online,
            TAG_FAILED => IndexState::Failed,
            _ => IndexState::Tombstoned,
        }
    }

    /// The online accessor, present only in [`IndexState::Online`]
    pub fn accessor(&self) -> Option<Arc<dyn IndexAccessor>> {
        self.inner.lock().unwrap().accessor.clone()
    }

    /// The recorded failure, present only in [`IndexState::Failed`]
    pub fn failure(&self) -> Option<String> {
        self.inner.lock().unwrap().failure.clone()
    }

    /// Atomically finish population and go online. `make_accessor` runs under
    /// the transition lock, so no query can observe the index online before
    /// the final drain and sealing inside it have completed. Returns `false`
    /// without calling the factory if the index was tombstoned or failed in
    /// the meantime.
    pub fn flip(
        &self,
        make_accessor: impl FnOnce() -> Result<Arc<dyn IndexAccessor>>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if self.tag.load(Ordering::Acquire) != TAG_POPULATING {
            return Ok(false);
        }
        match make_accessor() {
            Ok(accessor) => {
                inner.accessor = Some(accessor);
                self.tag.store(TAG_ONLINE, Ordering::Release);
                Ok(true)
            }
            Err(err) => {
                inner.failure = Some(err.to_string());
                self.tag.store(TAG_FAILED, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Move to `Failed`. A no-op once online or tombstoned.
    pub fn fail(&self, reason: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        if self.tag.load(Ordering::Acquire) == TAG_POPULATING {
            inner.failure = Some(reason.into());
            self.tag.store(TAG_FAILED, Ordering::Release);
        }
    }

    /// Terminal removal; wins any concurrent flip
    pub fn tombstone(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.accessor = None;
        inner.failure = None;
        self.tag.store(TAG_TOMBSTONED, Ordering::Release);
    }
}

impl Default for IndexProxy {
    fn default() -> Self {
        Self::new()
    }
}
