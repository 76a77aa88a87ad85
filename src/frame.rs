//! Frame records.
//!
//! A [`Frame`] is one shot's identity plus its progress bits. Frames live in a
//! [`FrameManager`](crate::framemgr::FrameManager) slot array and are only
//! ever touched while the owning [`FrameSet`](crate::framemgr::FrameSet) is
//! locked; requests from callers are copied in, never aliased.
//!
//! Completion is tracked with two shrinking sets:
//!
//! - `out_flag`: output entries still owed a frame-end. External frames also
//!   carry the leader's own entry, which is only cleared on finalisation.
//! - `core_flag`: hardware slots that have not reported core-end yet.
//!
//! When both are empty (ignoring the leader entry) the single `shot_done`
//! token is released and the frame is finalised exactly once.

use crate::bitset::{IdSet, SetIndex};
use crate::chain::GroupId;
use crate::diag::{Checkpoint, Stamp};
use crate::hw::HwIpSet;
use bitflags::bitflags;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};

/// Maximum DMA planes per output buffer.
pub const MAX_PLANES: usize = 4;

/// How a frame entered the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FrameType {
    /// Copied from a caller request
    External,
    /// Synthesized by the scheduler to keep an OTF chain fed
    Internal,
    /// Arrived after hardware moved past its fcount
    Late,
}

/// Queue a frame currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FrameState {
    /// Available for acquisition
    Free,
    /// Accepted, not yet shot
    Requested,
    /// Shot issued, waiting for frame start
    InFlight,
    /// Started, waiting for core/output ends
    Completed,
}

impl FrameState {
    /// All states in queue order.
    pub const ALL: [FrameState; 4] = [
        FrameState::Free,
        FrameState::Requested,
        FrameState::InFlight,
        FrameState::Completed,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    /// Short name used in logs.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            FrameState::Free => "free",
            FrameState::Requested => "request",
            FrameState::InFlight => "process",
            FrameState::Completed => "complete",
        }
    }
}

/// Result reported by a completion interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DoneType {
    /// Hardware finished normally
    Done,
    /// Hardware reported an error or dropped the frame
    NotDone,
}

/// Output entries that can owe a frame-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[allow(missing_docs)]
pub enum OutputId {
    Paf,
    Taa,
    TaaCapture,
    TaaPreview,
    Isp,
    IspCapture,
    IspPreview,
    Mcsc,
    Scaler0,
    Scaler1,
    Scaler2,
    Scaler3,
    Scaler4,
    Vra,
}

impl OutputId {
    /// Every output id, in index order.
    pub const ALL: [OutputId; 14] = [
        OutputId::Paf,
        OutputId::Taa,
        OutputId::TaaCapture,
        OutputId::TaaPreview,
        OutputId::Isp,
        OutputId::IspCapture,
        OutputId::IspPreview,
        OutputId::Mcsc,
        OutputId::Scaler0,
        OutputId::Scaler1,
        OutputId::Scaler2,
        OutputId::Scaler3,
        OutputId::Scaler4,
        OutputId::Vra,
    ];
}

impl SetIndex for OutputId {
    const CAPACITY: usize = OutputId::ALL.len();

    fn index(self) -> usize {
        self as usize
    }

    fn from_index(index: usize) -> Option<Self> {
        OutputId::ALL.get(index).copied()
    }
}

/// Set of output entries.
pub type OutputSet = IdSet<OutputId>;

bitflags! {
    /// Parameter regions carried by a request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ParamMask: u32 {
        /// Sensor mode / exposure
        const SENSOR = 1 << 0;
        /// Bayer pre-processing
        const PREPROC = 1 << 1;
        /// ISP core
        const ISP = 1 << 2;
        /// Scaler ports and geometry
        const SCALER = 1 << 3;
        /// Detection engine
        const DETECTOR = 1 << 4;
        /// Tuning overrides
        const TUNING = 1 << 5;
    }
}

/// Device addresses for one output port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaBuffer {
    /// Output port the buffer is attached to
    pub output: OutputId,
    /// Per-plane device addresses
    pub planes: [u64; MAX_PLANES],
    /// Valid entries in `planes`
    pub num_planes: usize,
}

impl DmaBuffer {
    /// Buffer with the given plane addresses; extra planes are ignored.
    #[must_use]
    pub fn new(output: OutputId, addrs: &[u64]) -> Self {
        let mut planes = [0; MAX_PLANES];
        let num_planes = addrs.len().min(MAX_PLANES);
        planes[..num_planes].copy_from_slice(&addrs[..num_planes]);
        Self {
            output,
            planes,
            num_planes,
        }
    }

    /// The populated plane addresses.
    #[must_use]
    pub fn planes(&self) -> &[u64] {
        &self.planes[..self.num_planes]
    }
}

/// A shot request as handed in by the stream layer.
#[derive(Debug, Clone)]
pub struct FrameRequest {
    /// Stream instance
    pub instance: u32,
    /// Group the request targets
    pub group: GroupId,
    /// Frame number
    pub fcount: u32,
    /// Request ordinal
    pub rcount: u32,
    /// Output buffers; each attaches one output entry
    pub buffers: Vec<DmaBuffer>,
    /// Parameter regions updated with this shot
    pub params: ParamMask,
}

impl FrameRequest {
    /// Request for `fcount` with no outputs or parameters.
    #[must_use]
    pub fn new(instance: u32, group: GroupId, fcount: u32) -> Self {
        Self {
            instance,
            group,
            fcount,
            rcount: 0,
            buffers: Vec::new(),
            params: ParamMask::empty(),
        }
    }

    /// Set the request ordinal.
    #[must_use]
    pub fn with_rcount(mut self, rcount: u32) -> Self {
        self.rcount = rcount;
        self
    }

    /// Attach an output buffer.
    #[must_use]
    pub fn with_output(mut self, output: OutputId, addrs: &[u64]) -> Self {
        self.buffers.push(DmaBuffer::new(output, addrs));
        self
    }

    /// Mark parameter regions as updated.
    #[must_use]
    pub fn with_params(mut self, params: ParamMask) -> Self {
        self.params |= params;
        self
    }

    /// Output entries requested.
    #[must_use]
    pub fn outputs(&self) -> OutputSet {
        self.buffers.iter().map(|b| b.output).collect()
    }
}

/// What a backend sees when asked to shoot a frame.
#[derive(Debug, Clone)]
pub struct ShotDesc {
    /// Stream instance
    pub instance: u32,
    /// Frame number
    pub fcount: u32,
    /// Request ordinal
    pub rcount: u32,
    /// Frame classification
    pub kind: FrameType,
    /// Group the frame was requested on
    pub group: Option<GroupId>,
    /// Output buffers
    pub buffers: Vec<DmaBuffer>,
    /// Parameter regions to apply
    pub params: ParamMask,
    /// Re-apply parameters even if the backend thinks they are current
    pub force_param: bool,
}

/// Reference to a frame slot, valid while the frame stays in its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHandle {
    /// Slot in the owning manager
    pub index: usize,
    /// Frame number at the time the handle was taken
    pub fcount: u32,
}

/// One frame slot.
#[derive(Debug)]
pub struct Frame {
    pub(crate) index: usize,
    pub(crate) state: FrameState,
    pub(crate) kind: FrameType,
    pub(crate) instance: u32,
    pub(crate) group: Option<GroupId>,
    pub(crate) fcount: u32,
    pub(crate) rcount: u32,
    pub(crate) out_flag: OutputSet,
    pub(crate) bak_flag: OutputSet,
    pub(crate) core_flag: HwIpSet,
    pub(crate) chain_set: HwIpSet,
    pub(crate) shot_done: AtomicU32,
    pub(crate) buffers: Vec<DmaBuffer>,
    pub(crate) params: ParamMask,
    pub(crate) failed: bool,
    pub(crate) stamps: [Option<Stamp>; Checkpoint::COUNT],
}

impl Clone for Frame {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            state: self.state,
            kind: self.kind,
            instance: self.instance,
            group: self.group,
            fcount: self.fcount,
            rcount: self.rcount,
            out_flag: self.out_flag,
            bak_flag: self.bak_flag,
            core_flag: self.core_flag,
            chain_set: self.chain_set,
            shot_done: AtomicU32::new(self.shot_done.load(Ordering::Acquire)),
            buffers: self.buffers.clone(),
            params: self.params,
            failed: self.failed,
            stamps: self.stamps,
        }
    }
}

impl Frame {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            state: FrameState::Free,
            kind: FrameType::External,
            instance: 0,
            group: None,
            fcount: 0,
            rcount: 0,
            out_flag: OutputSet::new(),
            bak_flag: OutputSet::new(),
            core_flag: HwIpSet::new(),
            chain_set: HwIpSet::new(),
            shot_done: AtomicU32::new(0),
            buffers: Vec::new(),
            params: ParamMask::empty(),
            failed: false,
            stamps: [None; Checkpoint::COUNT],
        }
    }

    /// Copy a caller request into this slot.
    ///
    /// `leader_entry` is added to `out_flag` so the frame cannot look
    /// finished before the leader has seen every output.
    pub(crate) fn load_request(
        &mut self,
        req: &FrameRequest,
        kind: FrameType,
        leader_entry: OutputId,
        chain_set: HwIpSet,
    ) {
        self.reset();
        self.kind = kind;
        self.instance = req.instance;
        self.group = Some(req.group);
        self.fcount = req.fcount;
        self.rcount = req.rcount;
        self.buffers.extend_from_slice(&req.buffers);
        self.params = req.params;
        self.out_flag = req.outputs();
        self.out_flag.insert(leader_entry);
        self.bak_flag = self.out_flag;
        self.core_flag = chain_set;
        self.chain_set = chain_set;
        self.shot_done.store(1, Ordering::Release);
    }

    /// Turn this slot into a synthetic frame with no user-visible outputs.
    pub(crate) fn load_internal(
        &mut self,
        instance: u32,
        group: GroupId,
        fcount: u32,
        chain_set: HwIpSet,
    ) {
        self.reset();
        self.kind = FrameType::Internal;
        self.instance = instance;
        self.group = Some(group);
        self.fcount = fcount;
        self.core_flag = chain_set;
        self.chain_set = chain_set;
        self.shot_done.store(1, Ordering::Release);
    }

    /// Release the single finalisation token.
    ///
    /// Returns `true` only for the caller that moved the count from 1 to 0.
    pub(crate) fn release_shot(&self) -> bool {
        self.shot_done
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
            .map(|prev| prev == 1)
            .unwrap_or(false)
    }

    /// Clear every request-specific field.
    pub(crate) fn reset(&mut self) {
        self.kind = FrameType::External;
        self.instance = 0;
        self.group = None;
        self.fcount = 0;
        self.rcount = 0;
        self.out_flag.clear();
        self.bak_flag.clear();
        self.core_flag.clear();
        self.chain_set.clear();
        self.shot_done.store(0, Ordering::Release);
        self.buffers.clear();
        self.params = ParamMask::empty();
        self.failed = false;
        self.stamps = [None; Checkpoint::COUNT];
    }

    pub(crate) fn stamp(&mut self, checkpoint: Checkpoint, stamp: Stamp) {
        self.stamps[checkpoint.index()] = Some(stamp);
    }

    /// Backend view of this frame.
    pub(crate) fn desc(&self, force_param: bool) -> ShotDesc {
        ShotDesc {
            instance: self.instance,
            fcount: self.fcount,
            rcount: self.rcount,
            kind: self.kind,
            group: self.group,
            buffers: self.buffers.clone(),
            params: self.params,
            force_param,
        }
    }

    /// Outputs still owed a frame-end, not counting the leader entry.
    pub(crate) fn pending_outputs(&self, leader_entry: OutputId) -> OutputSet {
        self.out_flag.without(leader_entry)
    }

    /// Whether every output and core stage has reported.
    pub(crate) fn is_settled(&self, leader_entry: OutputId) -> bool {
        self.pending_outputs(leader_entry).is_empty() && self.core_flag.is_empty()
    }

    /// Handle to this frame.
    #[must_use]
    pub fn handle(&self) -> FrameHandle {
        FrameHandle {
            index: self.index,
            fcount: self.fcount,
        }
    }

    /// Frame number.
    #[must_use]
    pub fn fcount(&self) -> u32 {
        self.fcount
    }

    /// Request ordinal.
    #[must_use]
    pub fn rcount(&self) -> u32 {
        self.rcount
    }

    /// Stream instance.
    #[must_use]
    pub fn instance(&self) -> u32 {
        self.instance
    }

    /// Classification.
    #[must_use]
    pub fn kind(&self) -> FrameType {
        self.kind
    }

    /// Queue the frame is in.
    #[must_use]
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Pending output entries.
    #[must_use]
    pub fn out_flag(&self) -> OutputSet {
        self.out_flag
    }

    /// Output entries as submitted.
    #[must_use]
    pub fn bak_flag(&self) -> OutputSet {
        self.bak_flag
    }

    /// Slots still owing a core-end.
    #[must_use]
    pub fn core_flag(&self) -> HwIpSet {
        self.core_flag
    }

    /// Remaining finalisation tokens (1 while live, 0 once released).
    #[must_use]
    pub fn shot_done_count(&self) -> u32 {
        self.shot_done.load(Ordering::Acquire)
    }

    /// Checkpoint stamp, if reached.
    #[must_use]
    pub fn stamp_of(&self, checkpoint: Checkpoint) -> Option<Stamp> {
        self.stamps[checkpoint.index()]
    }
}
