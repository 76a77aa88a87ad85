//! Completion demultiplexer.
//!
//! Interrupt handlers report frame-start, core-end and per-output end for
//! each slot. All bookkeeping happens in the chain leader's frame set: the
//! leader moves frames In-Flight → Completed at frame start, every slot
//! clears its `core_flag` bit at core end, and output ends clear `out_flag`
//! bits and notify the stream layer. Whoever settles the last bit releases
//! the frame's single `shot_done` token and finalizes it.

use crate::chain::Chain;
use crate::diag::{Checkpoint, Stamp};
use crate::error::DoneError;
use crate::frame::{DoneType, FrameHandle, FrameState, FrameType, OutputId};
use crate::framemgr::{CallerContext, FrameQueues, SetKind};
use crate::hardware::{IspHardware, SchedCounters};
use crate::hw::{HwIp, HwIpId, HwState, InstanceStatus, Vvalid};
use crate::notify::{Notification, NotifyCommand};
use std::sync::atomic::Ordering;
use tracing::{debug, error, trace, warn};

/// Status code reported for failed or retired frames.
pub const STATUS_NOT_DONE: i32 = -1;

impl IspHardware {
    fn irq_target(&self, slot: HwIpId, instance: u32) -> Result<(&HwIp, &InstanceStatus, Chain), DoneError> {
        let ip = self.slot(slot).map_err(|_| DoneError::InvalidSlot { slot })?;
        let status = ip
            .instance(instance)
            .ok_or(DoneError::InvalidInstance { instance })?;
        let chain = self
            .resolver
            .chain_of_slot(instance, slot)
            .ok_or(DoneError::NotBound { slot, instance })?;
        Ok((ip, status, chain))
    }

    fn leader_of(&self, chain: &Chain) -> Result<&HwIp, DoneError> {
        self.slot(chain.leader)
            .map_err(|_| DoneError::InvalidSlot { slot: chain.leader })
    }

    fn violation(&self, q: &FrameQueues, leader: &HwIp, instance: u32, err: DoneError) -> DoneError {
        SchedCounters::bump(&self.counters.protocol_violations);
        error!(error = %err, "protocol violation");
        q.main.dump();
        q.late.dump();
        if let Some(status) = leader.instance(instance) {
            error!(
                slot = ?leader.id(),
                instance,
                counters = ?status.counters.snapshot(),
                internal_fcount = status.internal_fcount.load(Ordering::Acquire),
                "slot counters"
            );
        }
        let regs = leader.ops_ungated().dump_regs();
        error!(slot = ?leader.id(), registers = ?regs, "register dump");
        err
    }

    /// Frame-start interrupt.
    ///
    /// On the chain leader the oldest In-Flight frame moves to Completed and
    /// one late frame is retired. An empty In-Flight queue on an OTF leader
    /// is a protocol violation.
    pub fn on_frame_start(&self, slot: HwIpId, instance: u32) -> Result<(), DoneError> {
        let (ip, status, chain) = self.irq_target(slot, instance)?;
        let hw_fcount = status.counters.frame_start.fetch_add(1, Ordering::AcqRel) + 1;
        ip.record(instance, hw_fcount, Checkpoint::FrameStart, Stamp::now());
        ip.clear_state(HwState::CONFIGURED);
        ip.set_vvalid(Vvalid::Valid);

        if !chain.is_leader(slot) {
            return Ok(());
        }

        let mut q = ip.frames.lock(CallerContext::Interrupt);
        match q.main.peek_instance(FrameState::InFlight, instance) {
            Some(idx) => {
                q.main.trans(idx, FrameState::Completed);
                q.main.frame_mut(idx).stamp(Checkpoint::FrameStart, Stamp::now());
                trace!(slot = ?slot, instance, fcount = q.main.frame(idx).fcount, "frame start");
            }
            None if chain.otf_input => {
                let err = DoneError::EmptyQueue {
                    slot,
                    instance,
                    queue: FrameState::InFlight.name(),
                };
                return Err(self.violation(&q, ip, instance, err));
            }
            None => {
                trace!(slot = ?slot, instance, "frame start with nothing in flight");
            }
        }

        self.retire_late_locked(&mut q, slot, instance);
        Ok(())
    }

    /// Find the Completed frame for `hw_fcount`. A leader lagging at least
    /// `late_lag_threshold` frames first force-completes the stale head.
    fn match_completed(
        &self,
        q: &mut FrameQueues,
        chain: &Chain,
        slot: HwIpId,
        instance: u32,
        hw_fcount: u32,
    ) -> Result<usize, DoneError> {
        let leader = self.leader_of(chain)?;
        if let Some(head) = q.main.peek_instance(FrameState::Completed, instance) {
            let head_fcount = q.main.frame(head).fcount;
            if head_fcount == hw_fcount {
                return Ok(head);
            }
            let lag = hw_fcount.wrapping_sub(head_fcount);
            if chain.is_leader(slot)
                && hw_fcount > head_fcount
                && lag >= self.config.late_lag_threshold
            {
                warn!(slot = ?slot, instance, head = head_fcount, hw_fcount, lag, "force-completing stale head");
                SchedCounters::bump(&self.counters.self_heals);
                self.force_done_locked(q, chain.leader, SetKind::Main, head, false);
            }
        }

        match q.main.find_fcount(FrameState::Completed, instance, hw_fcount) {
            Some(idx) => Ok(idx),
            None => {
                let err = DoneError::FrameNotFound {
                    slot,
                    instance,
                    fcount: hw_fcount,
                };
                Err(self.violation(q, leader, instance, err))
            }
        }
    }

    /// Core-end interrupt: `slot` finished its core stage for `hw_fcount`.
    pub fn on_core_end(
        &self,
        slot: HwIpId,
        instance: u32,
        hw_fcount: u32,
        done: DoneType,
    ) -> Result<(), DoneError> {
        let (ip, status, chain) = self.irq_target(slot, instance)?;
        status.counters.core_done.fetch_add(1, Ordering::AcqRel);
        status.counters.frame_end.fetch_add(1, Ordering::AcqRel);
        ip.record(instance, hw_fcount, Checkpoint::CoreEnd, Stamp::now());
        ip.set_vvalid(Vvalid::Blank);

        let leader = self.leader_of(&chain)?;
        let mut q = leader.frames.lock(CallerContext::Interrupt);
        let idx = self.match_completed(&mut q, &chain, slot, instance, hw_fcount)?;

        let frame = q.main.frame_mut(idx);
        if done == DoneType::NotDone {
            frame.failed = true;
        }
        if !frame.core_flag.remove(slot) {
            warn!(slot = ?slot, instance, fcount = hw_fcount, "core flag already clear");
        }
        frame.stamp(Checkpoint::CoreEnd, Stamp::now());

        self.try_finalize(&mut q, &chain, idx);
        Ok(())
    }

    /// Output-end interrupt: `output` of `slot` finished for `hw_fcount`.
    pub fn on_output_end(
        &self,
        slot: HwIpId,
        instance: u32,
        hw_fcount: u32,
        output: OutputId,
        status_code: i32,
        done: DoneType,
    ) -> Result<(), DoneError> {
        let (ip, status, chain) = self.irq_target(slot, instance)?;
        status.counters.dma_done.fetch_add(1, Ordering::AcqRel);
        ip.record(instance, hw_fcount, Checkpoint::FrameEnd, Stamp::now());

        let leader = self.leader_of(&chain)?;
        let mut q = leader.frames.lock(CallerContext::Interrupt);
        let idx = self.match_completed(&mut q, &chain, slot, instance, hw_fcount)?;

        let frame = q.main.frame_mut(idx);
        if done == DoneType::NotDone {
            frame.failed = true;
        }
        frame.stamp(Checkpoint::FrameEnd, Stamp::now());
        if !frame.out_flag.remove(output) {
            warn!(slot = ?slot, instance, fcount = hw_fcount, output = ?output, "output flag already clear");
        } else if frame.kind != FrameType::Internal {
            let note = Notification {
                command: NotifyCommand::frame(done),
                instance,
                group: frame.group.unwrap_or(chain.head),
                output: Some(output),
                fcount: frame.fcount,
                rcount: frame.rcount,
                status: status_code,
            };
            self.post(note);
        }

        self.try_finalize(&mut q, &chain, idx);
        Ok(())
    }

    pub(crate) fn post(&self, note: Notification) {
        let counter = match note.command {
            NotifyCommand::FrameDone => &self.counters.frames_done,
            NotifyCommand::FrameNotDone => &self.counters.frames_not_done,
            NotifyCommand::ShotDone => &self.counters.shots_done,
            NotifyCommand::ShotNotDone => &self.counters.shots_not_done,
        };
        SchedCounters::bump(counter);
        let (command, fcount) = (note.command, note.fcount);
        if let Err(e) = self.notifier.post(note) {
            warn!(command = ?command, fcount, error = %e, "notification lost");
        }
    }

    fn try_finalize(&self, q: &mut FrameQueues, chain: &Chain, idx: usize) {
        let leader_entry = chain.leader.leader_entry();
        let frame = q.main.frame(idx);
        if frame.is_settled(leader_entry) && frame.release_shot() {
            self.finalize_shot(q, chain, idx);
        }
    }

    /// Report a settled frame and return it to Free. Runs once per frame.
    fn finalize_shot(&self, q: &mut FrameQueues, chain: &Chain, idx: usize) {
        let frame = q.main.frame_mut(idx);
        let (instance, fcount) = (frame.instance, frame.fcount);

        if frame.kind == FrameType::Internal {
            SchedCounters::bump(&self.counters.internal_done);
            let done = self
                .slot(chain.leader)
                .ok()
                .and_then(|ip| ip.instance(instance))
                .map_or(0, |st| st.internal_done.fetch_add(1, Ordering::AcqRel) + 1);
            if done % self.config.internal_done_log_period.max(1) == 1 {
                debug!(slot = ?chain.leader, instance, fcount, done, "internal frames done");
            }
        } else {
            let result = if frame.failed {
                DoneType::NotDone
            } else {
                DoneType::Done
            };
            let note = Notification {
                command: NotifyCommand::shot(result),
                instance,
                group: frame.group.unwrap_or(chain.head),
                output: None,
                fcount,
                rcount: frame.rcount,
                status: if frame.failed { STATUS_NOT_DONE } else { 0 },
            };
            trace!(slot = ?chain.leader, instance, fcount, result = ?result, "shot done");
            self.post(note);
        }

        frame.reset();
        q.main.trans(idx, FrameState::Free);
    }

    /// Force-retire a frame of `kind` owned by `owner`'s frame set.
    ///
    /// Every pending core bit is cleared, pending outputs and the shot are
    /// reported as not done (internal frames stay silent), each slot the
    /// frame was programmed on is told through `frame_not_done`, and the
    /// frame returns to Free.
    pub(crate) fn force_done_locked(
        &self,
        q: &mut FrameQueues,
        owner: HwIpId,
        kind: SetKind,
        idx: usize,
        is_late: bool,
    ) {
        let leader_entry = owner.leader_entry();
        let mgr = q.get_mut(kind);
        let frame = mgr.frame_mut(idx);
        frame.core_flag.clear();
        let desc = frame.desc(false);
        let (instance, fcount, rcount) = (frame.instance, frame.fcount, frame.rcount);
        let group = frame.group;
        let pending = frame.pending_outputs(leader_entry);
        let chain_set = frame.chain_set;
        let internal = frame.kind == FrameType::Internal;
        frame.out_flag.clear();

        if !frame.release_shot() {
            trace!(slot = ?owner, fcount, "force done on released frame");
        }

        if let Some(group) = group.filter(|_| !internal) {
            for output in pending.iter() {
                self.post(Notification {
                    command: NotifyCommand::FrameNotDone,
                    instance,
                    group,
                    output: Some(output),
                    fcount,
                    rcount,
                    status: STATUS_NOT_DONE,
                });
            }
            self.post(Notification {
                command: NotifyCommand::ShotNotDone,
                instance,
                group,
                output: None,
                fcount,
                rcount,
                status: STATUS_NOT_DONE,
            });
        }

        for slot in chain_set.iter() {
            let Ok(ip) = self.slot(slot) else { continue };
            if let Err(e) = ip.call(|ops| ops.frame_not_done(&desc, instance, is_late)) {
                warn!(slot = ?slot, instance, fcount, error = %e, "frame_not_done failed");
            }
        }

        SchedCounters::bump(&self.counters.force_done);
        debug!(slot = ?owner, instance, fcount, is_late, "force done");
        frame_reset(q, kind, idx);
    }

    /// Force-retire one frame of `slot` by handle.
    pub fn on_force_done(
        &self,
        slot: HwIpId,
        handle: FrameHandle,
        ctx: CallerContext,
    ) -> Result<(), DoneError> {
        let ip = self.slot(slot).map_err(|_| DoneError::InvalidSlot { slot })?;
        let mut q = ip.frames.lock(ctx);
        let live = handle.index < q.main.capacity() && {
            let frame = q.main.frame(handle.index);
            frame.state != FrameState::Free && frame.fcount == handle.fcount
        };
        if !live {
            return Err(DoneError::FrameNotFound {
                slot,
                instance: 0,
                fcount: handle.fcount,
            });
        }
        self.force_done_locked(&mut q, slot, SetKind::Main, handle.index, false);
        Ok(())
    }
}

fn frame_reset(q: &mut FrameQueues, kind: SetKind, idx: usize) {
    let mgr = q.get_mut(kind);
    mgr.frame_mut(idx).reset();
    mgr.trans(idx, FrameState::Free);
}
