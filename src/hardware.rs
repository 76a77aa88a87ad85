//! The hardware-IP array and its lifecycle surface.
//!
//! [`IspHardware`] owns every slot, the chain resolver and the outward
//! notifier. Scheduling lives in [`crate::sched`], interrupt handling in
//! [`crate::done`] and shutdown in [`crate::drain`]; this module covers
//! open/init/close, enable/disable, parameters, setfiles and diagnostics.

use crate::bitset::SetIndex;
use crate::chain::{Chain, ChainResolver, GroupId, Link};
use crate::config::SchedulerConfig;
use crate::diag::{DebugRecord, RegisterValue};
use crate::drain::ForceStopReport;
use crate::error::ScheduleError;
use crate::frame::{FrameHandle, FrameState};
use crate::framemgr::{CallerContext, FrameQueues};
use crate::hw::{
    ClockGate, CounterSnapshot, HwIp, HwIpId, HwIpOps, HwIpSet, HwState, InstanceStatus,
    ParamRegion, MAX_INSTANCES,
};
use crate::notify::{self, NotificationReceiver, Notifier};
use crate::setfile;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Event counters kept across the whole hardware.
#[derive(Debug, Default)]
pub(crate) struct SchedCounters {
    pub(crate) late_shots: AtomicU64,
    pub(crate) stale_retired: AtomicU64,
    pub(crate) internal_synthesized: AtomicU64,
    pub(crate) internal_done: AtomicU64,
    pub(crate) self_heals: AtomicU64,
    pub(crate) protocol_violations: AtomicU64,
    pub(crate) force_done: AtomicU64,
    pub(crate) frames_done: AtomicU64,
    pub(crate) frames_not_done: AtomicU64,
    pub(crate) shots_done: AtomicU64,
    pub(crate) shots_not_done: AtomicU64,
}

impl SchedCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of scheduler statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SchedStats {
    /// Submissions routed to the late queues
    pub late_shots: u64,
    /// Requested frames retired at config-lock because hardware passed them
    pub stale_retired: u64,
    /// Internal frames synthesized
    pub internal_synthesized: u64,
    /// Internal frames finished
    pub internal_done: u64,
    /// Stale Completed heads force-completed by the leader
    pub self_heals: u64,
    /// Empty-queue and frame-not-found violations
    pub protocol_violations: u64,
    /// Frames retired through the force-done path
    pub force_done: u64,
    /// Frame-done notifications generated
    pub frames_done: u64,
    /// Frame-not-done notifications generated
    pub frames_not_done: u64,
    /// Shot-done notifications generated
    pub shots_done: u64,
    /// Shot-not-done notifications generated
    pub shots_not_done: u64,
    /// Notifications delivered to the queue
    pub notifications_posted: u64,
    /// Notifications dropped on a full or closed queue
    pub notifications_lost: u64,
}

/// Queue occupancy of one slot for one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct QueueSnapshot {
    /// Free frames (shared by all instances)
    pub free: usize,
    /// Requested
    pub requested: usize,
    /// In-Flight
    pub in_flight: usize,
    /// Completed
    pub completed: usize,
    /// Free late frames
    pub late_free: usize,
    /// Late Requested
    pub late_requested: usize,
    /// Late In-Flight
    pub late_in_flight: usize,
    /// Late Completed
    pub late_completed: usize,
}

impl QueueSnapshot {
    fn of(q: &FrameQueues, instance: u32) -> Self {
        Self {
            free: q.main.count(FrameState::Free),
            requested: q.main.count_instance(FrameState::Requested, instance),
            in_flight: q.main.count_instance(FrameState::InFlight, instance),
            completed: q.main.count_instance(FrameState::Completed, instance),
            late_free: q.late.count(FrameState::Free),
            late_requested: q.late.count_instance(FrameState::Requested, instance),
            late_in_flight: q.late.count_instance(FrameState::InFlight, instance),
            late_completed: q.late.count_instance(FrameState::Completed, instance),
        }
    }

    /// Frames of the instance in any non-free queue.
    #[must_use]
    pub fn busy(&self) -> usize {
        self.requested
            + self.in_flight
            + self.completed
            + self.late_requested
            + self.late_in_flight
            + self.late_completed
    }
}

/// Captured state of one slot.
#[derive(Debug, Clone, Serialize)]
pub struct StateDump {
    /// Slot
    pub slot: HwIpId,
    /// State word bits
    pub state: u32,
    /// Resource references
    pub rsccount: u32,
    /// Per opened instance: queue occupancy and counters
    pub instances: Vec<(u32, QueueSnapshot, CounterSnapshot)>,
    /// Backend register window
    pub registers: Vec<RegisterValue>,
}

/// Builder for [`IspHardware`].
pub struct IspHardwareBuilder {
    config: SchedulerConfig,
    slots: Vec<(HwIpId, Box<dyn HwIpOps>)>,
    domains: Vec<Vec<HwIpId>>,
}

impl IspHardwareBuilder {
    /// Install a slot.
    #[must_use]
    pub fn slot(mut self, id: HwIpId, ops: Box<dyn HwIpOps>) -> Self {
        self.slots.retain(|(s, _)| *s != id);
        self.slots.push((id, ops));
        self
    }

    /// Put `ids` in one clock gate domain.
    #[must_use]
    pub fn gate_domain(mut self, ids: &[HwIpId]) -> Self {
        self.domains.push(ids.to_vec());
        self
    }

    /// Build the hardware and the receiving end of its notification queue.
    #[must_use]
    pub fn build(self) -> (IspHardware, NotificationReceiver) {
        let mut gates: HashMap<HwIpId, Arc<ClockGate>> = HashMap::new();
        for domain in &self.domains {
            let gate = Arc::new(ClockGate::new());
            for id in domain {
                gates.insert(*id, Arc::clone(&gate));
            }
        }

        let mut slots: Vec<Option<HwIp>> = (0..HwIpId::CAPACITY).map(|_| None).collect();
        for (id, ops) in self.slots {
            let gate = gates
                .remove(&id)
                .unwrap_or_else(|| Arc::new(ClockGate::new()));
            slots[id.index()] = Some(HwIp::new(id, ops, gate, &self.config));
        }

        let (notifier, rx) = notify::channel(self.config.notify_capacity);
        (
            IspHardware {
                slots,
                resolver: ChainResolver::new(),
                notifier,
                config: self.config,
                counters: SchedCounters::default(),
            },
            rx,
        )
    }
}

/// The ISP hardware-IP array.
pub struct IspHardware {
    slots: Vec<Option<HwIp>>,
    pub(crate) resolver: ChainResolver,
    pub(crate) notifier: Notifier,
    pub(crate) config: SchedulerConfig,
    pub(crate) counters: SchedCounters,
}

impl std::fmt::Debug for IspHardware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IspHardware")
            .field("slots", &self.slots.iter().flatten().map(HwIp::id).collect::<Vec<_>>())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl IspHardware {
    /// Start building with `config`.
    #[must_use]
    pub fn builder(config: SchedulerConfig) -> IspHardwareBuilder {
        IspHardwareBuilder {
            config,
            slots: Vec::new(),
            domains: Vec::new(),
        }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Slot by id.
    pub fn slot(&self, id: HwIpId) -> Result<&HwIp, ScheduleError> {
        self.slots
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(ScheduleError::InvalidSlot { slot: id })
    }

    pub(crate) fn status<'a>(
        &self,
        ip: &'a HwIp,
        instance: u32,
    ) -> Result<&'a InstanceStatus, ScheduleError> {
        ip.instance(instance).ok_or(ScheduleError::InvalidInstance {
            instance,
            max: MAX_INSTANCES as u32,
        })
    }

    /// Group topology.
    #[must_use]
    pub fn resolver(&self) -> &ChainResolver {
        &self.resolver
    }

    /// Resolve the chain `group` belongs to.
    pub fn chain(&self, instance: u32, group: GroupId) -> Result<Chain, ScheduleError> {
        self.resolver.resolve(instance, group)
    }

    /// Bind `group` for `instance`; `otf_input` marks a sensor-fed head.
    pub fn bind_group(&self, instance: u32, group: GroupId, otf_input: bool) -> Result<(), ScheduleError> {
        self.slot(group.hw_ip())?;
        self.resolver.bind(instance, group, otf_input)
    }

    /// Link `child` under `parent`.
    pub fn link_groups(
        &self,
        instance: u32,
        parent: GroupId,
        child: GroupId,
        link: Link,
    ) -> Result<(), ScheduleError> {
        self.resolver.link(instance, parent, child, link)
    }

    /// Take a resource reference on the group's slot. The first reference
    /// opens the backend; concurrent openers wait for it and see its result.
    pub fn open(&self, instance: u32, group: GroupId) -> Result<(), ScheduleError> {
        let ip = self.slot(group.hw_ip())?;
        let status = self.status(ip, instance)?;
        if !self.resolver.is_bound(instance, group) {
            return Err(ScheduleError::InvalidGroup { instance, group });
        }

        let mut rsccount = ip.lifecycle();
        if status.opened.load(Ordering::Acquire) {
            debug!(slot = ?ip.id(), instance, "already opened");
            return Ok(());
        }
        if *rsccount == 0 {
            if let Err(source) = ip.call(|ops| ops.open(instance)) {
                error!(slot = ?ip.id(), instance, error = %source, "open failed");
                return Err(ScheduleError::HardwareOpFailed { slot: ip.id(), source });
            }
            ip.set_state(HwState::OPENED);
        }
        *rsccount += 1;
        status.opened.store(true, Ordering::Release);
        info!(slot = ?ip.id(), instance, rsccount = *rsccount, "opened");
        Ok(())
    }

    /// Bind the backend of the group's slot to its chain.
    pub fn init(&self, instance: u32, group: GroupId) -> Result<(), ScheduleError> {
        let ip = self.slot(group.hw_ip())?;
        let status = self.status(ip, instance)?;
        if !status.opened.load(Ordering::Acquire) {
            return Err(ScheduleError::NotOpened { slot: ip.id(), instance });
        }
        let chain = self.resolver.resolve(instance, group)?;
        let otf = chain.otf_input || !chain.is_leader(ip.id());
        ip.call(|ops| ops.init(instance, group, otf))
            .map_err(|source| ScheduleError::HardwareOpFailed { slot: ip.id(), source })?;
        ip.set_state(HwState::INITIALIZED);
        debug!(slot = ?ip.id(), instance, otf, "initialized");
        Ok(())
    }

    /// Drop the instance's resource reference. The last closer retires any
    /// frame still queued on the slot, closes the backend and resets every
    /// counter and state flag.
    pub fn close(&self, instance: u32, group: GroupId) -> Result<(), ScheduleError> {
        let ip = self.slot(group.hw_ip())?;
        let status = self.status(ip, instance)?;

        let mut rsccount = ip.lifecycle();
        if !status.opened.swap(false, Ordering::AcqRel) {
            warn!(slot = ?ip.id(), instance, "close without open");
            return Ok(());
        }
        self.resolver.unbind(instance, group);

        *rsccount = rsccount.saturating_sub(1);
        if *rsccount > 0 {
            debug!(slot = ?ip.id(), instance, rsccount = *rsccount, "closed");
            return Ok(());
        }

        {
            let mut q = ip.frames.lock(CallerContext::Process);
            let retired = self.retire_all_locked(&mut q, ip.id());
            if retired > 0 {
                warn!(slot = ?ip.id(), retired, "frames outstanding at last close");
            }
        }

        let res = ip.call_closing(|ops| ops.close(instance));
        ip.reset_all();
        *ip.setfile.write() = None;
        info!(slot = ?ip.id(), instance, "last close");
        res.map_err(|source| ScheduleError::HardwareOpFailed { slot: ip.id(), source })
    }

    /// Start streaming on one slot.
    pub fn enable(&self, instance: u32, slot: HwIpId) -> Result<(), ScheduleError> {
        let ip = self.slot(slot)?;
        let status = self.status(ip, instance)?;
        if !status.opened.load(Ordering::Acquire) {
            return Err(ScheduleError::NotOpened { slot, instance });
        }
        ip.call(|ops| ops.enable(instance))
            .map_err(|source| ScheduleError::HardwareOpFailed { slot, source })?;
        status.running.store(true, Ordering::Release);
        ip.set_state(HwState::RUNNING);
        Ok(())
    }

    /// Stop streaming on one slot.
    ///
    /// The leader of an OTF chain first waits, bounded, for the instance's
    /// Completed frames to drain and for vertical blanking.
    pub fn disable(&self, instance: u32, slot: HwIpId) -> Result<(), ScheduleError> {
        let ip = self.slot(slot)?;
        let status = self.status(ip, instance)?;
        let is_otf_leader = self
            .resolver
            .chain_of_slot(instance, slot)
            .is_some_and(|c| c.otf_input && c.is_leader(slot));

        if is_otf_leader && ip.state().contains(HwState::RUNNING) {
            let timeout = self.config.otf_disable_timeout();
            if !self.wait_completed_empty(slot, instance, timeout) {
                warn!(slot = ?slot, instance, "completed frames remain at disable");
            }
            if !ip.wait_vblank(timeout) {
                warn!(slot = ?slot, instance, "disable outside vertical blank");
            }
        }

        ip.call(|ops| ops.disable(instance))
            .map_err(|source| ScheduleError::HardwareOpFailed { slot, source })?;
        status.running.store(false, Ordering::Release);
        if !ip.instances().iter().any(|s| s.running.load(Ordering::Acquire)) {
            ip.clear_state(HwState::RUNNING);
        }
        Ok(())
    }

    /// Enable every slot of the group's chain, leaf to root.
    pub fn process_start(&self, instance: u32, group: GroupId) -> Result<(), ScheduleError> {
        let chain = self.resolver.resolve(instance, group)?;
        for slot in chain.submit_order() {
            self.enable(instance, slot)?;
        }
        info!(instance, head = ?chain.head, "process start");
        Ok(())
    }

    /// Disable the chain root to leaf, force-stop the leader, and clear the
    /// first-OTF-start state.
    pub fn process_stop(&self, instance: u32, group: GroupId) -> Result<ForceStopReport, ScheduleError> {
        let chain = self.resolver.resolve(instance, group)?;
        for slot in chain.teardown_order() {
            self.disable(instance, slot)?;
        }
        let report = self.force_stop(chain.leader, instance)?;
        chain.reset_otf();
        for slot in &chain.slots {
            if let Ok(ip) = self.slot(*slot) {
                if let Some(status) = ip.instance(instance) {
                    status.internal_fcount.store(0, Ordering::Release);
                    status.force_param.store(false, Ordering::Release);
                }
            }
        }
        info!(instance, head = ?chain.head, retired = report.retired, "process stop");
        Ok(report)
    }

    /// Apply a parameter block to every slot of the group's chain.
    pub fn set_param(
        &self,
        instance: u32,
        group: GroupId,
        region: &ParamRegion,
    ) -> Result<(), ScheduleError> {
        let chain = self.resolver.resolve(instance, group)?;
        let hw_map = chain.hw_set();
        for slot in chain.submit_order() {
            let ip = self.slot(slot)?;
            ip.call(|ops| ops.set_param(region, instance, &hw_map))
                .map_err(|source| ScheduleError::HardwareOpFailed { slot, source })?;
        }
        Ok(())
    }

    /// Parse a tuning blob mapped at `base_addr` and hand each present slot
    /// its table. Tables for absent slots are skipped.
    pub fn load_setfile(&self, instance: u32, blob: &[u8], base_addr: u64) -> Result<(), ScheduleError> {
        let parsed = setfile::parse(blob, base_addr)?;
        for table in parsed.tables {
            let Ok(ip) = self.slot(table.hw) else {
                debug!(slot = ?table.hw, "setfile for absent slot");
                continue;
            };
            ip.call(|ops| ops.load_setfile(&table, instance))
                .map_err(|source| ScheduleError::HardwareOpFailed { slot: ip.id(), source })?;
            debug!(slot = ?ip.id(), entries = table.entries.len(), "setfile loaded");
            *ip.setfile.write() = Some(table);
            ip.set_state(HwState::SETFILE_LOADED);
        }
        Ok(())
    }

    /// Program the tuning set for `scenario` on every loaded slot of the
    /// group's chain.
    pub fn apply_setfile(&self, instance: u32, group: GroupId, scenario: u32) -> Result<(), ScheduleError> {
        let chain = self.resolver.resolve(instance, group)?;
        for slot in chain.submit_order() {
            let ip = self.slot(slot)?;
            let entry = {
                let table = ip.setfile.read();
                let Some(table) = table.as_ref() else {
                    continue;
                };
                *table
                    .resolve(scenario)
                    .ok_or(ScheduleError::UnknownScenario { slot, scenario })?
            };
            ip.call(|ops| ops.apply_setfile(&entry, scenario, instance))
                .map_err(|source| ScheduleError::HardwareOpFailed { slot, source })?;
        }
        Ok(())
    }

    /// Forget tuning tables on every slot that has one.
    pub fn delete_setfile(&self, instance: u32) -> Result<(), ScheduleError> {
        for ip in self.slots.iter().flatten() {
            if !ip.state().contains(HwState::SETFILE_LOADED) {
                continue;
            }
            ip.call(|ops| ops.delete_setfile(instance))
                .map_err(|source| ScheduleError::HardwareOpFailed { slot: ip.id(), source })?;
            *ip.setfile.write() = None;
            ip.clear_state(HwState::SETFILE_LOADED);
        }
        Ok(())
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> SchedStats {
        let c = &self.counters;
        let get = |a: &AtomicU64| a.load(Ordering::Relaxed);
        SchedStats {
            late_shots: get(&c.late_shots),
            stale_retired: get(&c.stale_retired),
            internal_synthesized: get(&c.internal_synthesized),
            internal_done: get(&c.internal_done),
            self_heals: get(&c.self_heals),
            protocol_violations: get(&c.protocol_violations),
            force_done: get(&c.force_done),
            frames_done: get(&c.frames_done),
            frames_not_done: get(&c.frames_not_done),
            shots_done: get(&c.shots_done),
            shots_not_done: get(&c.shots_not_done),
            notifications_posted: self.notifier.posted(),
            notifications_lost: self.notifier.lost(),
        }
    }

    /// Queue occupancy of `slot` for `instance`.
    pub fn queue_snapshot(&self, slot: HwIpId, instance: u32) -> Result<QueueSnapshot, ScheduleError> {
        let ip = self.slot(slot)?;
        let q = ip.frames.lock(CallerContext::Process);
        Ok(QueueSnapshot::of(&q, instance))
    }

    /// Run `f` with the slot's frame queues locked.
    pub fn with_frames<R>(&self, slot: HwIpId, f: impl FnOnce(&FrameQueues) -> R) -> Result<R, ScheduleError> {
        let ip = self.slot(slot)?;
        let q = ip.frames.lock(CallerContext::Process);
        Ok(f(&q))
    }

    /// Oldest Requested frame of `instance` on `slot`.
    pub fn peek_requested(&self, slot: HwIpId, instance: u32) -> Result<Option<FrameHandle>, ScheduleError> {
        self.with_frames(slot, |q| {
            q.main
                .peek_instance(FrameState::Requested, instance)
                .map(|idx| q.main.frame(idx).handle())
        })
    }

    /// Diagnostic ring of `slot`.
    pub fn debug_records(&self, slot: HwIpId) -> Result<Vec<DebugRecord>, ScheduleError> {
        Ok(self.slot(slot)?.debug.snapshot())
    }

    /// Log and capture the state of `slot`: queues, counters and registers.
    pub fn dump_state(&self, slot: HwIpId) -> Result<StateDump, ScheduleError> {
        let ip = self.slot(slot)?;
        let opened: Vec<u32> = (0..MAX_INSTANCES as u32)
            .filter(|&i| ip.instance(i).is_some_and(|s| s.opened.load(Ordering::Acquire)))
            .collect();

        let instances = {
            let q = ip.frames.lock(CallerContext::Process);
            q.main.dump();
            q.late.dump();
            opened
                .iter()
                .filter_map(|&i| {
                    let counters = ip.instance(i)?.counters.snapshot();
                    Some((i, QueueSnapshot::of(&q, i), counters))
                })
                .collect::<Vec<_>>()
        };

        let registers = ip.call(|ops| {
            for &i in &opened {
                if let Err(e) = ops.size_dump(i) {
                    warn!(slot = ?slot, instance = i, error = %e, "size dump failed");
                }
            }
            ops.dump_regs()
        });

        for (instance, queues, counters) in &instances {
            error!(
                slot = ?slot,
                instance,
                queues = ?queues,
                counters = ?counters,
                "slot state"
            );
        }

        Ok(StateDump {
            slot,
            state: ip.state().bits(),
            rsccount: ip.rsccount(),
            instances,
            registers,
        })
    }

    /// Slots of the group's chain as a hardware map; empty if unbound.
    #[must_use]
    pub fn hw_map(&self, instance: u32, group: GroupId) -> HwIpSet {
        self.resolver
            .resolve(instance, group)
            .map(|c| c.hw_set())
            .unwrap_or_default()
    }
}
