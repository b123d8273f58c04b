//! Population lifecycle events
//!
//! Observers register an `mpsc` sender at job construction and receive every
//! lifecycle event in a well-defined order: `ScanStarting` precedes any
//! `Progress` event, `ScanCompleted` fires before any index flips, and
//! `PopulationCompleted` is always last for a successful job.

use std::sync::mpsc::Sender;

/// Events emitted by a population job
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// An index accumulator was created and started accepting updates
    PopulationStarted { index_id: u64, name: String },
    /// The store scan is about to consume its first entity
    ScanStarting,
    /// Scan progress; percentages are non-decreasing and end at 100.0
    Progress { percent: f64 },
    /// The store scan finished; indexes have not flipped yet
    ScanCompleted,
    /// Every surviving index flipped to online. `peak_queued_bytes` is the
    /// high-water mark of memory held by concurrent-update queues.
    PopulationCompleted { peak_queued_bytes: u64 },
    /// One index failed; sibling indexes sharing the scan continue
    PopulationFailed {
        index_id: u64,
        name: String,
        reason: String,
    },
    /// The job was cancelled; no index flipped
    PopulationCancelled,
}

/// Cloneable handle for emitting events; a disconnected or absent receiver is
/// not an error.
#[derive(Clone)]
pub struct EventSink {
    tx: Option<Sender<MonitorEvent>>,
}

impl EventSink {
    pub fn none() -> Self {
        Self { tx: None }
    }

    pub fn new(tx: Sender<MonitorEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn emit(&self, event: MonitorEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
