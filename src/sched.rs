//! Shot scheduler.
//!
//! Submission copies a request into a frame owned by the chain leader's
//! frame set and drives it through the chain leaf to root. Requests whose
//! fcount the hardware has already passed go to the late queues instead and
//! are retired at the next frame start. On an OTF chain only the very first
//! request is driven at submission; later ones wait in Requested for the
//! leader's config-lock, which synthesizes an internal frame whenever no
//! request is ready.

use crate::chain::Chain;
use crate::diag::{Checkpoint, Stamp};
use crate::error::{ScheduleError, SynthError};
use crate::frame::{FrameHandle, FrameRequest, FrameState, FrameType};
use crate::framemgr::{CallerContext, FrameGuard, FrameQueues, SetKind};
use crate::hardware::{IspHardware, SchedCounters};
use crate::hw::{HwIpId, HwIpSet};
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, trace, warn};

/// A request is late if the hardware already has a frame with its fcount
/// in flight or completed, or has synthesized up to it.
fn is_late(q: &FrameQueues, instance: u32, fcount: u32, internal_fcount: u32) -> bool {
    internal_fcount >= fcount
        || q.main
            .find_fcount(FrameState::Completed, instance, fcount)
            .is_some()
        || q.main
            .find_fcount(FrameState::InFlight, instance, fcount)
            .is_some()
}

impl IspHardware {
    /// Submit a request to its chain.
    ///
    /// The request is copied; the caller keeps ownership of `req`. Any
    /// backend failure aborts the submission with
    /// [`ScheduleError::HardwareOpFailed`] and leaves the frame in flight for
    /// [`IspHardware::force_stop`] to retire.
    pub fn submit(&self, req: &FrameRequest, hw_map: &HwIpSet) -> Result<(), ScheduleError> {
        let (instance, fcount) = (req.instance, req.fcount);
        let chain = self.resolver.resolve(instance, req.group)?;
        let leader = self.slot(chain.leader)?;
        let status = self.status(leader, instance)?;
        if !status.opened.load(Ordering::Acquire) {
            return Err(ScheduleError::NotOpened {
                slot: chain.leader,
                instance,
            });
        }
        let chain_set = chain.hw_set().intersection(*hw_map);
        let leader_entry = chain.leader.leader_entry();

        let mut q = leader.frames.lock(CallerContext::Process);
        let internal_fcount = status.internal_fcount.load(Ordering::Acquire);
        if is_late(&q, instance, fcount, internal_fcount) {
            let idx = q.late.get_free().ok_or(ScheduleError::NoFreeFrame {
                slot: chain.leader,
            })?;
            q.late
                .frame_mut(idx)
                .load_request(req, FrameType::Late, leader_entry, chain_set);
            q.late.trans(idx, FrameState::Requested);
            SchedCounters::bump(&self.counters.late_shots);
            if !req.params.is_empty() {
                status.force_param.store(true, Ordering::Release);
            }
            warn!(
                slot = ?chain.leader,
                instance,
                fcount,
                internal_fcount,
                "late shot"
            );
            return Ok(());
        }

        let idx = q.main.get_free().ok_or(ScheduleError::NoFreeFrame {
            slot: chain.leader,
        })?;
        q.main
            .frame_mut(idx)
            .load_request(req, FrameType::External, leader_entry, chain_set);
        q.main.trans(idx, FrameState::Requested);

        if chain.otf_input {
            if !chain.mark_otf_started() {
                trace!(slot = ?chain.leader, instance, fcount, "queued for config lock");
                return Ok(());
            }
            let start = fcount.saturating_sub(1);
            for slot in &chain.slots {
                if let Some(st) = self.slot(*slot).ok().and_then(|ip| ip.instance(instance)) {
                    st.counters.reset_to(start);
                }
            }
            info!(slot = ?chain.leader, instance, fcount, "first OTF start");
        }

        self.drive_locked(&chain, q, idx, &chain_set)
    }

    /// Drive a Requested frame through `chain`.
    pub fn drive(
        &self,
        chain: &Chain,
        handle: FrameHandle,
        hw_map: &HwIpSet,
    ) -> Result<(), ScheduleError> {
        let leader = self.slot(chain.leader)?;
        let q = leader.frames.lock(CallerContext::Process);
        let requested = q.main.iter(FrameState::Requested).any(|f| {
            f.index == handle.index && f.fcount == handle.fcount && f.instance == chain.instance
        });
        if !requested {
            return Err(ScheduleError::StaleHandle {
                slot: chain.leader,
                fcount: handle.fcount,
            });
        }
        self.drive_locked(chain, q, handle.index, hw_map)
    }

    /// Move frame `idx` to In-Flight, release the frame set, then shoot
    /// every slot in `hw_map` leaf to root. Stops at the first failure.
    /// The frame waits for core end only from the slots it was shot on.
    pub(crate) fn drive_locked(
        &self,
        chain: &Chain,
        mut q: FrameGuard<'_>,
        idx: usize,
        hw_map: &HwIpSet,
    ) -> Result<(), ScheduleError> {
        let leader = self.slot(chain.leader)?;
        let status = self.status(leader, chain.instance)?;

        q.main.trans(idx, FrameState::InFlight);
        let frame = q.main.frame_mut(idx);
        // only slots that get a shot can report core end
        frame.core_flag = frame.core_flag.intersection(*hw_map);
        frame.chain_set = frame.chain_set.intersection(*hw_map);
        frame.stamp(Checkpoint::Shot, Stamp::now());
        let desc = frame.desc(status.force_param.swap(false, Ordering::AcqRel));
        drop(q);

        for slot in chain.submit_order() {
            if !hw_map.contains(slot) {
                trace!(slot = ?slot, fcount = desc.fcount, "not in hw map");
                continue;
            }
            let ip = self.slot(slot)?;
            ip.set_current(desc.instance, desc.fcount);
            if let Err(source) = ip.call(|ops| ops.shot(&desc, hw_map)) {
                error!(
                    slot = ?slot,
                    instance = desc.instance,
                    fcount = desc.fcount,
                    error = %source,
                    "shot failed"
                );
                return Err(ScheduleError::HardwareOpFailed { slot, source });
            }
            ip.set_state(crate::hw::HwState::CONFIGURED);
            ip.record(desc.instance, desc.fcount, Checkpoint::Shot, Stamp::now());
        }

        trace!(
            leader = ?chain.leader,
            instance = desc.instance,
            fcount = desc.fcount,
            kind = ?desc.kind,
            force_param = desc.force_param,
            "frame driven"
        );
        Ok(())
    }

    /// Synthesize and drive an internal frame for `fcount` on the chain
    /// `slot` belongs to.
    pub fn synthesize_internal(
        &self,
        slot: HwIpId,
        instance: u32,
        fcount: u32,
        ctx: CallerContext,
    ) -> Result<FrameHandle, SynthError> {
        let chain = self
            .resolver
            .chain_of_slot(instance, slot)
            .ok_or(ScheduleError::InvalidSlot { slot })?;
        let leader = self.slot(chain.leader)?;
        let q = leader.frames.lock(ctx);
        self.synthesize_locked(&chain, q, fcount)
    }

    fn synthesize_locked(
        &self,
        chain: &Chain,
        mut q: FrameGuard<'_>,
        fcount: u32,
    ) -> Result<FrameHandle, SynthError> {
        let slot = chain.leader;
        let instance = chain.instance;
        let status = self.status(self.slot(slot)?, instance)?;

        let free = q.main.count(FrameState::Free);
        if free < self.config.free_low_watermark {
            warn!(slot = ?slot, instance, free, "free frames running low");
        }
        if q.main
            .find_fcount(FrameState::Completed, instance, fcount)
            .or_else(|| q.main.find_fcount(FrameState::InFlight, instance, fcount))
            .is_some()
        {
            return Err(SynthError::AlreadyExists { slot, fcount });
        }

        let idx = q.main.get_free().ok_or(SynthError::NoFreeFrame { slot })?;
        let hw_map = chain.hw_set();
        let frame = q.main.frame_mut(idx);
        frame.load_internal(instance, chain.head, fcount, hw_map);
        let handle = frame.handle();
        q.main.trans(idx, FrameState::Requested);
        status.internal_fcount.store(fcount, Ordering::Release);
        SchedCounters::bump(&self.counters.internal_synthesized);
        debug!(slot = ?slot, instance, fcount, "internal shot");

        self.drive_locked(chain, q, idx, &hw_map)?;
        Ok(handle)
    }

    /// Retire the oldest late frame of `instance` on `slot`, if any.
    pub fn retire_one_late(
        &self,
        slot: HwIpId,
        instance: u32,
        ctx: CallerContext,
    ) -> Result<bool, ScheduleError> {
        let ip = self.slot(slot)?;
        let mut q = ip.frames.lock(ctx);
        Ok(self.retire_late_locked(&mut q, slot, instance))
    }

    pub(crate) fn retire_late_locked(&self, q: &mut FrameQueues, owner: HwIpId, instance: u32) -> bool {
        let Some(idx) = q
            .late
            .peek_instance(FrameState::Requested, instance)
            .or_else(|| q.late.peek_instance(FrameState::InFlight, instance))
        else {
            return false;
        };
        q.late.trans(idx, FrameState::Completed);
        debug!(
            slot = ?owner,
            instance,
            fcount = q.late.frame(idx).fcount,
            "retiring late frame"
        );
        self.force_done_locked(q, owner, SetKind::Late, idx, true);
        true
    }

    /// Vertical-blank configuration lock of an OTF leader.
    ///
    /// Requested frames the hardware has already passed are retired as
    /// late. A request for `hw_fcount + 1` is driven; otherwise an internal
    /// frame is synthesized for it. Non-leader and DMA-fed slots ignore the
    /// event.
    pub fn config_lock(&self, slot: HwIpId, instance: u32, hw_fcount: u32) -> Result<(), ScheduleError> {
        let chain = self
            .resolver
            .chain_of_slot(instance, slot)
            .ok_or(ScheduleError::InvalidSlot { slot })?;
        if !chain.is_leader(slot) || !chain.otf_input {
            return Ok(());
        }
        let leader = self.slot(slot)?;
        let target = hw_fcount.wrapping_add(1);
        leader.record(instance, target, Checkpoint::ConfigLock, Stamp::now());

        let mut q = leader.frames.lock(CallerContext::Interrupt);
        while let Some(idx) = q.main.peek_instance(FrameState::Requested, instance) {
            let fcount = q.main.frame(idx).fcount;
            if fcount == target {
                q.main.frame_mut(idx).stamp(Checkpoint::ConfigLock, Stamp::now());
                let hw_map = q.main.frame(idx).chain_set;
                return self.drive_locked(&chain, q, idx, &hw_map);
            }
            if fcount > hw_fcount {
                break;
            }
            warn!(slot = ?slot, instance, fcount, hw_fcount, "stale request retired at config lock");
            q.main.trans(idx, FrameState::Completed);
            self.force_done_locked(&mut q, slot, SetKind::Main, idx, true);
            SchedCounters::bump(&self.counters.stale_retired);
        }

        match self.synthesize_locked(&chain, q, target) {
            Ok(_) => Ok(()),
            Err(SynthError::AlreadyExists { fcount, .. }) => {
                trace!(slot = ?slot, instance, fcount, "frame already scheduled");
                Ok(())
            }
            Err(SynthError::NoFreeFrame { .. }) => {
                warn!(slot = ?slot, instance, fcount = target, "no free frame for internal shot");
                Ok(())
            }
            Err(SynthError::Drive(e)) => Err(e),
        }
    }
}
