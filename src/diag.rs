//! Postmortem diagnostics: per-frame checkpoint stamps and register dumps.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

static NEXT_CONTEXT: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static CONTEXT_ID: u32 = NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed);
}

/// Small stable id of the executing thread, recorded with every stamp.
#[must_use]
pub fn context_id() -> u32 {
    CONTEXT_ID.with(|id| *id)
}

/// Pipeline checkpoints stamped on every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Checkpoint {
    /// Backend shot issued
    Shot,
    /// Vertical-blank configuration lock
    ConfigLock,
    /// Frame start interrupt
    FrameStart,
    /// Last output finished
    FrameEnd,
    /// Core processing finished
    CoreEnd,
}

impl Checkpoint {
    /// Number of checkpoints.
    pub const COUNT: usize = 5;

    /// All checkpoints in pipeline order.
    pub const ALL: [Checkpoint; Self::COUNT] = [
        Checkpoint::Shot,
        Checkpoint::ConfigLock,
        Checkpoint::FrameStart,
        Checkpoint::FrameEnd,
        Checkpoint::CoreEnd,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// When and where a checkpoint was reached.
#[derive(Debug, Clone, Copy)]
pub struct Stamp {
    /// Monotonic time of the event
    pub at: Instant,
    /// Executing context, see [`context_id`]
    pub context: u32,
}

impl Stamp {
    /// Stamp for the current instant and context.
    #[must_use]
    pub fn now() -> Self {
        Self {
            at: Instant::now(),
            context: context_id(),
        }
    }
}

/// Stamps collected for one frame on one slot.
#[derive(Debug, Clone, Default)]
pub struct DebugRecord {
    /// Frame number
    pub fcount: u32,
    /// Stream instance
    pub instance: u32,
    /// One optional stamp per [`Checkpoint`]
    pub stamps: [Option<Stamp>; Checkpoint::COUNT],
}

impl DebugRecord {
    /// Stamp recorded for `checkpoint`, if any.
    #[must_use]
    pub fn stamp(&self, checkpoint: Checkpoint) -> Option<Stamp> {
        self.stamps[checkpoint.index()]
    }

    /// Elapsed time between two checkpoints, when both were reached in order.
    #[must_use]
    pub fn interval(&self, from: Checkpoint, to: Checkpoint) -> Option<std::time::Duration> {
        let (a, b) = (self.stamp(from)?, self.stamp(to)?);
        b.at.checked_duration_since(a.at)
    }
}

/// Fixed-depth ring of [`DebugRecord`]s indexed by `fcount % depth`.
#[derive(Debug)]
pub struct DebugRing {
    depth: usize,
    records: Mutex<Vec<DebugRecord>>,
}

impl DebugRing {
    /// Create a ring holding `depth` records (at least one).
    #[must_use]
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            depth,
            records: Mutex::new(vec![DebugRecord::default(); depth]),
        }
    }

    fn slot(&self, fcount: u32) -> usize {
        fcount as usize % self.depth
    }

    /// Stamp `checkpoint` for `fcount`. A newer fcount landing on the same
    /// ring entry replaces the older record.
    pub fn record(&self, instance: u32, fcount: u32, checkpoint: Checkpoint, stamp: Stamp) {
        let idx = self.slot(fcount);
        let mut records = self.records.lock();
        let rec = &mut records[idx];
        if rec.fcount != fcount || rec.instance != instance {
            *rec = DebugRecord {
                fcount,
                instance,
                ..DebugRecord::default()
            };
        }
        rec.stamps[checkpoint.index()] = Some(stamp);
    }

    /// Record for `fcount`, if it is still in the ring.
    #[must_use]
    pub fn get(&self, fcount: u32) -> Option<DebugRecord> {
        let records = self.records.lock();
        let rec = &records[self.slot(fcount)];
        (rec.fcount == fcount && rec.stamps.iter().any(Option::is_some)).then(|| rec.clone())
    }

    /// All populated records, oldest fcount first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<DebugRecord> {
        let mut out: Vec<DebugRecord> = self
            .records
            .lock()
            .iter()
            .filter(|r| r.stamps.iter().any(Option::is_some))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.fcount);
        out
    }

    /// Forget every record.
    pub fn clear(&self) {
        self.records.lock().fill(DebugRecord::default());
    }
}

/// One register captured by a backend dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegisterValue {
    /// Byte offset within the block's register window
    pub offset: u32,
    /// Value read
    pub value: u32,
}
