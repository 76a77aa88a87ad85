//! Hardware-IP slots.
//!
//! A [`HwIp`] is one pipeline stage: its backend operations, clock gate,
//! state word, per-instance counters and its own [`FrameSet`]. Backends are
//! plugged in through [`HwIpOps`]; the scheduler never sees their private
//! state.

pub mod clock;
pub mod sim;

use crate::bitset::{IdSet, SetIndex};
use crate::chain::GroupId;
use crate::config::SchedulerConfig;
use crate::diag::{Checkpoint, DebugRing, RegisterValue, Stamp};
use crate::error::HwOpError;
use crate::frame::{OutputId, ParamMask, ShotDesc};
use crate::framemgr::FrameSet;
use crate::setfile::{SetfileEntry, SetfileTable};
use bitflags::bitflags;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use clock::{ClockGate, ClockGuard};

/// Maximum concurrent stream instances.
pub const MAX_INSTANCES: usize = 4;

/// Hardware blocks known to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum HwIpId {
    /// Phase-detect AF pre-processor 0
    Paf0,
    /// Phase-detect AF pre-processor 1
    Paf1,
    /// Bayer pre-processor (3AA) 0
    Taa0,
    /// Bayer pre-processor (3AA) 1
    Taa1,
    /// ISP core 0
    Isp0,
    /// ISP core 1
    Isp1,
    /// Multi-channel scaler 0
    Mcsc0,
    /// Multi-channel scaler 1
    Mcsc1,
    /// Detection engine
    Vra,
}

/// Functional class of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HwKind {
    /// Bayer-domain pre-processing
    PreProcessor,
    /// Main ISP core
    IspCore,
    /// Output scaler
    Scaler,
    /// Detection engine
    Detector,
}

impl HwIpId {
    /// Every block, in slot order.
    pub const ALL: [HwIpId; 9] = [
        HwIpId::Paf0,
        HwIpId::Paf1,
        HwIpId::Taa0,
        HwIpId::Taa1,
        HwIpId::Isp0,
        HwIpId::Isp1,
        HwIpId::Mcsc0,
        HwIpId::Mcsc1,
        HwIpId::Vra,
    ];

    /// Functional class.
    #[must_use]
    pub fn kind(self) -> HwKind {
        match self {
            HwIpId::Paf0 | HwIpId::Paf1 | HwIpId::Taa0 | HwIpId::Taa1 => HwKind::PreProcessor,
            HwIpId::Isp0 | HwIpId::Isp1 => HwKind::IspCore,
            HwIpId::Mcsc0 | HwIpId::Mcsc1 => HwKind::Scaler,
            HwIpId::Vra => HwKind::Detector,
        }
    }

    /// Display name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            HwIpId::Paf0 => "PAF0",
            HwIpId::Paf1 => "PAF1",
            HwIpId::Taa0 => "3AA0",
            HwIpId::Taa1 => "3AA1",
            HwIpId::Isp0 => "ISP0",
            HwIpId::Isp1 => "ISP1",
            HwIpId::Mcsc0 => "MCSC0",
            HwIpId::Mcsc1 => "MCSC1",
            HwIpId::Vra => "VRA",
        }
    }

    /// Output entry that represents this block as a chain leader.
    #[must_use]
    pub fn leader_entry(self) -> OutputId {
        match self {
            HwIpId::Paf0 | HwIpId::Paf1 => OutputId::Paf,
            HwIpId::Taa0 | HwIpId::Taa1 => OutputId::Taa,
            HwIpId::Isp0 | HwIpId::Isp1 => OutputId::Isp,
            HwIpId::Mcsc0 | HwIpId::Mcsc1 => OutputId::Mcsc,
            HwIpId::Vra => OutputId::Vra,
        }
    }

    /// DMA output ports the block drives.
    #[must_use]
    pub fn outputs(self) -> &'static [OutputId] {
        match self.kind() {
            HwKind::PreProcessor if matches!(self, HwIpId::Paf0 | HwIpId::Paf1) => &[],
            HwKind::PreProcessor => &[OutputId::TaaCapture, OutputId::TaaPreview],
            HwKind::IspCore => &[OutputId::IspCapture, OutputId::IspPreview],
            HwKind::Scaler => &[
                OutputId::Scaler0,
                OutputId::Scaler1,
                OutputId::Scaler2,
                OutputId::Scaler3,
                OutputId::Scaler4,
            ],
            HwKind::Detector => &[],
        }
    }

    /// Id by setfile hardware number.
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        HwIpId::ALL.get(raw as usize).copied()
    }
}

impl SetIndex for HwIpId {
    const CAPACITY: usize = HwIpId::ALL.len();

    fn index(self) -> usize {
        self as usize
    }

    fn from_index(index: usize) -> Option<Self> {
        HwIpId::ALL.get(index).copied()
    }
}

/// Set of hardware blocks (hw maps, `core_flag`).
pub type HwIpSet = IdSet<HwIpId>;

bitflags! {
    /// Slot state word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HwState: u32 {
        /// Resources acquired
        const OPENED = 1 << 0;
        /// Bound to a group
        const INITIALIZED = 1 << 1;
        /// Shot programmed, waiting for frame start
        const CONFIGURED = 1 << 2;
        /// Streaming
        const RUNNING = 1 << 3;
        /// Tuning tables loaded
        const SETFILE_LOADED = 1 << 4;
    }
}

/// Vertical window status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Vvalid {
    /// Between frames
    Blank,
    /// Frame being transferred
    Valid,
}

/// Interrupt counters; written by the slot's interrupt path only.
#[derive(Debug, Default)]
pub struct HwCounters {
    /// Frame-start events
    pub frame_start: AtomicU32,
    /// Core-end events
    pub core_done: AtomicU32,
    /// Frame-end events
    pub frame_end: AtomicU32,
    /// DMA-done events
    pub dma_done: AtomicU32,
}

/// Point-in-time copy of [`HwCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CounterSnapshot {
    /// Frame-start events
    pub frame_start: u32,
    /// Core-end events
    pub core_done: u32,
    /// Frame-end events
    pub frame_end: u32,
    /// DMA-done events
    pub dma_done: u32,
}

impl HwCounters {
    /// Set all four counters to `value`.
    pub fn reset_to(&self, value: u32) {
        self.frame_start.store(value, Ordering::Release);
        self.core_done.store(value, Ordering::Release);
        self.frame_end.store(value, Ordering::Release);
        self.dma_done.store(value, Ordering::Release);
    }

    /// Read all four counters.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            frame_start: self.frame_start.load(Ordering::Acquire),
            core_done: self.core_done.load(Ordering::Acquire),
            frame_end: self.frame_end.load(Ordering::Acquire),
            dma_done: self.dma_done.load(Ordering::Acquire),
        }
    }
}

/// Per-instance bookkeeping of a slot.
#[derive(Debug, Default)]
pub struct InstanceStatus {
    /// Interrupt counters
    pub counters: HwCounters,
    /// Last fcount synthesized internally
    pub internal_fcount: AtomicU32,
    /// Re-apply parameters on the next shot
    pub force_param: AtomicBool,
    /// Internal frames finished, for log throttling
    pub internal_done: AtomicU32,
    /// Instance holds a reference on the slot
    pub opened: AtomicBool,
    /// Instance is streaming
    pub running: AtomicBool,
}

impl InstanceStatus {
    fn reset(&self) {
        self.counters.reset_to(0);
        self.internal_fcount.store(0, Ordering::Release);
        self.force_param.store(false, Ordering::Release);
        self.internal_done.store(0, Ordering::Release);
        self.running.store(false, Ordering::Release);
    }
}

/// A parameter block handed to [`HwIpOps::set_param`].
#[derive(Debug, Clone, Default)]
pub struct ParamRegion {
    /// Regions updated
    pub mask: ParamMask,
    /// Opaque parameter payload
    pub data: Bytes,
}

/// Backend operations for one hardware block.
///
/// Calls are serialized per slot and never block indefinitely.
pub trait HwIpOps: Send {
    /// Acquire backend resources for `instance`.
    fn open(&mut self, instance: u32) -> Result<(), HwOpError>;

    /// Bind `instance` to `group`; `otf` selects direct-link input.
    fn init(&mut self, instance: u32, group: GroupId, otf: bool) -> Result<(), HwOpError>;

    /// Release resources for `instance`.
    fn close(&mut self, instance: u32) -> Result<(), HwOpError>;

    /// Start streaming.
    fn enable(&mut self, instance: u32) -> Result<(), HwOpError>;

    /// Stop streaming.
    fn disable(&mut self, instance: u32) -> Result<(), HwOpError>;

    /// Program one frame.
    fn shot(&mut self, desc: &ShotDesc, hw_map: &HwIpSet) -> Result<(), HwOpError>;

    /// Apply a parameter block.
    fn set_param(
        &mut self,
        region: &ParamRegion,
        instance: u32,
        hw_map: &HwIpSet,
    ) -> Result<(), HwOpError>;

    /// Take note of the slot's tuning table.
    fn load_setfile(&mut self, table: &SetfileTable, instance: u32) -> Result<(), HwOpError>;

    /// Program the tuning set for `scenario`.
    fn apply_setfile(
        &mut self,
        entry: &SetfileEntry,
        scenario: u32,
        instance: u32,
    ) -> Result<(), HwOpError>;

    /// Forget tuning tables.
    fn delete_setfile(&mut self, instance: u32) -> Result<(), HwOpError>;

    /// A frame this block was programmed with was force-retired.
    fn frame_not_done(
        &mut self,
        desc: &ShotDesc,
        instance: u32,
        is_late: bool,
    ) -> Result<(), HwOpError>;

    /// Gate the block's clock.
    fn clock_gate(&mut self, on: bool, is_close: bool) -> Result<(), HwOpError>;

    /// Log configured geometry and buffer sizes.
    fn size_dump(&mut self, instance: u32) -> Result<(), HwOpError>;

    /// Capture the register window.
    fn dump_regs(&self) -> Vec<RegisterValue> {
        Vec::new()
    }
}

/// One pipeline stage.
pub struct HwIp {
    id: HwIpId,
    ops: Mutex<Box<dyn HwIpOps>>,
    clock: Arc<ClockGate>,
    state: AtomicU32,
    rsccount: Mutex<u32>,
    instances: Vec<InstanceStatus>,
    pub(crate) frames: FrameSet,
    vvalid: Mutex<Vvalid>,
    vvalid_cond: Condvar,
    cur_fcount: AtomicU32,
    cur_instance: AtomicU32,
    pub(crate) setfile: RwLock<Option<SetfileTable>>,
    pub(crate) debug: DebugRing,
}

impl std::fmt::Debug for HwIp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HwIp")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("rsccount", &self.rsccount())
            .finish_non_exhaustive()
    }
}

impl HwIp {
    /// Slot for `id` driven by `ops`.
    pub fn new(
        id: HwIpId,
        ops: Box<dyn HwIpOps>,
        clock: Arc<ClockGate>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            id,
            ops: Mutex::new(ops),
            clock,
            state: AtomicU32::new(0),
            rsccount: Mutex::new(0),
            instances: (0..MAX_INSTANCES).map(|_| InstanceStatus::default()).collect(),
            frames: FrameSet::new(id, config.frames_per_slot, config.late_frames_per_slot),
            vvalid: Mutex::new(Vvalid::Blank),
            vvalid_cond: Condvar::new(),
            cur_fcount: AtomicU32::new(0),
            cur_instance: AtomicU32::new(0),
            setfile: RwLock::new(None),
            debug: DebugRing::new(config.debug_ring_depth),
        }
    }

    /// Block id.
    #[must_use]
    pub fn id(&self) -> HwIpId {
        self.id
    }

    /// Functional class.
    #[must_use]
    pub fn kind(&self) -> HwKind {
        self.id.kind()
    }

    /// Frame queues.
    #[must_use]
    pub fn frames(&self) -> &FrameSet {
        &self.frames
    }

    /// Current state word.
    #[must_use]
    pub fn state(&self) -> HwState {
        HwState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, flags: HwState) {
        self.state.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_state(&self, flags: HwState) {
        self.state.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Resource references held.
    #[must_use]
    pub fn rsccount(&self) -> u32 {
        *self.rsccount.lock()
    }

    /// Lifecycle lock: the reference count, held across the backend open
    /// on the first reference and the backend close on the last.
    pub(crate) fn lifecycle(&self) -> MutexGuard<'_, u32> {
        self.rsccount.lock()
    }

    /// Per-instance status.
    #[must_use]
    pub fn instance(&self, instance: u32) -> Option<&InstanceStatus> {
        self.instances.get(instance as usize)
    }

    pub(crate) fn instances(&self) -> &[InstanceStatus] {
        &self.instances
    }

    /// Shared clock gate.
    #[must_use]
    pub fn clock(&self) -> &ClockGate {
        &self.clock
    }

    /// Backend access with the clock held on.
    pub fn ops(&self, is_close: bool) -> ClockGuard<'_> {
        ClockGuard::acquire(self.id, self.ops.lock(), &self.clock, is_close)
    }

    /// Backend access without touching the clock gate.
    pub(crate) fn ops_ungated(&self) -> MutexGuard<'_, Box<dyn HwIpOps>> {
        self.ops.lock()
    }

    /// Run `f` on the backend. The detection engine shares its chain's
    /// gate domain and is called without a clock reference.
    pub(crate) fn call<R>(&self, f: impl FnOnce(&mut dyn HwIpOps) -> R) -> R {
        self.call_gated(false, f)
    }

    /// [`HwIp::call`] for the close path; the clock is turned off with
    /// `is_close` set.
    pub(crate) fn call_closing<R>(&self, f: impl FnOnce(&mut dyn HwIpOps) -> R) -> R {
        self.call_gated(true, f)
    }

    fn call_gated<R>(&self, is_close: bool, f: impl FnOnce(&mut dyn HwIpOps) -> R) -> R {
        if self.kind() == HwKind::Detector {
            let mut ops = self.ops_ungated();
            f(ops.as_mut())
        } else {
            let mut ops = self.ops(is_close);
            f(&mut *ops)
        }
    }

    /// Last shot's fcount and instance.
    #[must_use]
    pub fn current(&self) -> (u32, u32) {
        (
            self.cur_fcount.load(Ordering::Acquire),
            self.cur_instance.load(Ordering::Acquire),
        )
    }

    pub(crate) fn set_current(&self, instance: u32, fcount: u32) {
        self.cur_instance.store(instance, Ordering::Release);
        self.cur_fcount.store(fcount, Ordering::Release);
    }

    /// Vertical window status.
    #[must_use]
    pub fn vvalid(&self) -> Vvalid {
        *self.vvalid.lock()
    }

    pub(crate) fn set_vvalid(&self, status: Vvalid) {
        let mut cur = self.vvalid.lock();
        *cur = status;
        if status == Vvalid::Blank {
            self.vvalid_cond.notify_all();
        }
    }

    /// Wait until the block is in blanking; `false` on timeout.
    pub(crate) fn wait_vblank(&self, timeout: Duration) -> bool {
        let mut cur = self.vvalid.lock();
        if *cur == Vvalid::Blank {
            return true;
        }
        self.vvalid_cond
            .wait_while_for(&mut cur, |v| *v != Vvalid::Blank, timeout);
        *cur == Vvalid::Blank
    }

    pub(crate) fn record(&self, instance: u32, fcount: u32, checkpoint: Checkpoint, stamp: Stamp) {
        self.debug.record(instance, fcount, checkpoint, stamp);
    }

    /// Drop every per-frame counter and state flag; last close only.
    pub(crate) fn reset_all(&self) {
        for status in &self.instances {
            status.reset();
            status.opened.store(false, Ordering::Release);
        }
        self.state.store(0, Ordering::Release);
        self.set_current(0, 0);
        *self.vvalid.lock() = Vvalid::Blank;
        self.debug.clear();
    }
}
