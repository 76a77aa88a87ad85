//! Simulated hardware backend.
//!
//! [`SimBlock`] implements [`HwIpOps`] for every block kind by keeping a small
//! register bank and recording each call in a shared [`SimLog`]. Failures can
//! be injected per operation, which is how tests exercise the abort paths,
//! and per-operation latency widens race windows for threaded tests.

use super::{HwIpId, HwIpOps, HwIpSet, HwKind, ParamRegion};
use crate::chain::GroupId;
use crate::diag::RegisterValue;
use crate::error::HwOpError;
use crate::frame::{FrameType, OutputSet, ParamMask, ShotDesc};
use crate::setfile::{SetfileEntry, SetfileTable};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

const REG_FCOUNT: usize = 0;
const REG_INSTANCE: usize = 1;
const REG_ENABLE: usize = 2;
const REG_PARAM: usize = 3;
const REG_SETFILE_ADDR: usize = 4;
const REG_SETFILE_SIZE: usize = 5;
const REG_OUTPUTS: usize = 6;
const NUM_REGS: usize = 8;

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum SimCall {
    Open { slot: HwIpId, instance: u32 },
    Init { slot: HwIpId, instance: u32, group: GroupId, otf: bool },
    Close { slot: HwIpId, instance: u32 },
    Enable { slot: HwIpId, instance: u32 },
    Disable { slot: HwIpId, instance: u32 },
    Shot { slot: HwIpId, instance: u32, fcount: u32, kind: FrameType, force_param: bool },
    SetParam { slot: HwIpId, instance: u32, mask: ParamMask },
    LoadSetfile { slot: HwIpId, instance: u32, entries: usize },
    ApplySetfile { slot: HwIpId, instance: u32, scenario: u32, index: usize },
    DeleteSetfile { slot: HwIpId, instance: u32 },
    FrameNotDone { slot: HwIpId, instance: u32, fcount: u32, is_late: bool },
    ClockGate { slot: HwIpId, on: bool },
    SizeDump { slot: HwIpId, instance: u32 },
}

impl SimCall {
    /// Slot that received the call.
    #[must_use]
    pub fn slot(&self) -> HwIpId {
        match self {
            SimCall::Open { slot, .. }
            | SimCall::Init { slot, .. }
            | SimCall::Close { slot, .. }
            | SimCall::Enable { slot, .. }
            | SimCall::Disable { slot, .. }
            | SimCall::Shot { slot, .. }
            | SimCall::SetParam { slot, .. }
            | SimCall::LoadSetfile { slot, .. }
            | SimCall::ApplySetfile { slot, .. }
            | SimCall::DeleteSetfile { slot, .. }
            | SimCall::FrameNotDone { slot, .. }
            | SimCall::ClockGate { slot, .. }
            | SimCall::SizeDump { slot, .. } => *slot,
        }
    }
}

/// Call log shared by a set of simulated blocks.
#[derive(Debug, Clone, Default)]
pub struct SimLog {
    calls: Arc<Mutex<Vec<SimCall>>>,
}

impl SimLog {
    /// Empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, call: SimCall) {
        self.calls.lock().push(call);
    }

    /// Every call so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<SimCall> {
        self.calls.lock().clone()
    }

    /// Calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&SimCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    /// `(slot, fcount)` of every shot, in issue order.
    #[must_use]
    pub fn shots(&self) -> Vec<(HwIpId, u32)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                SimCall::Shot { slot, fcount, .. } => Some((*slot, *fcount)),
                _ => None,
            })
            .collect()
    }

    /// Forget recorded calls.
    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

/// Injected failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimFault {
    /// Fail `operation` after `count` successful calls
    FailAfterN {
        /// Operation name (`"shot"`, `"open"`, ...)
        operation: &'static str,
        /// Successful calls allowed first
        count: u32,
    },
    /// Every call fails with this code
    HardwareFault {
        /// Error code reported
        code: i32,
    },
}

#[derive(Debug)]
enum SimPrivate {
    PreProcessor { bayer_bits: u8 },
    IspCore { applied: ParamMask },
    Scaler { ports: OutputSet },
    Detector { tracking: bool },
}

impl SimPrivate {
    fn for_kind(kind: HwKind) -> Self {
        match kind {
            HwKind::PreProcessor => SimPrivate::PreProcessor { bayer_bits: 10 },
            HwKind::IspCore => SimPrivate::IspCore {
                applied: ParamMask::empty(),
            },
            HwKind::Scaler => SimPrivate::Scaler {
                ports: OutputSet::new(),
            },
            HwKind::Detector => SimPrivate::Detector { tracking: false },
        }
    }
}

/// Simulated hardware block.
#[derive(Debug)]
pub struct SimBlock {
    id: HwIpId,
    log: SimLog,
    regs: [u32; NUM_REGS],
    private: SimPrivate,
    faults: Vec<SimFault>,
    op_counts: HashMap<&'static str, u32>,
    latency: HashMap<&'static str, Duration>,
}

impl SimBlock {
    /// Block for `id` with its own log.
    #[must_use]
    pub fn new(id: HwIpId) -> Self {
        Self {
            id,
            log: SimLog::new(),
            regs: [0; NUM_REGS],
            private: SimPrivate::for_kind(id.kind()),
            faults: Vec::new(),
            op_counts: HashMap::new(),
            latency: HashMap::new(),
        }
    }

    /// Record into `log` instead.
    #[must_use]
    pub fn with_log(mut self, log: SimLog) -> Self {
        self.log = log;
        self
    }

    /// Inject a failure.
    #[must_use]
    pub fn with_fault(mut self, fault: SimFault) -> Self {
        self.faults.push(fault);
        self
    }

    /// Fail `operation` after `count` successful calls.
    #[must_use]
    pub fn fail_after(self, operation: &'static str, count: u32) -> Self {
        self.with_fault(SimFault::FailAfterN { operation, count })
    }

    /// Sleep `delay` at the start of every `operation` call, before any
    /// injected failure and before the call is logged.
    #[must_use]
    pub fn with_latency(mut self, operation: &'static str, delay: Duration) -> Self {
        self.latency.insert(operation, delay);
        self
    }

    /// Handle to the call log.
    #[must_use]
    pub fn log(&self) -> SimLog {
        self.log.clone()
    }

    /// Box for installation into a slot.
    #[must_use]
    pub fn boxed(self) -> Box<dyn HwIpOps> {
        Box::new(self)
    }

    fn settle(&self, operation: &'static str) {
        if let Some(delay) = self.latency.get(operation) {
            std::thread::sleep(*delay);
        }
    }

    fn check(&mut self, operation: &'static str) -> Result<(), HwOpError> {
        self.settle(operation);
        let seen = self.op_counts.entry(operation).or_insert(0);
        *seen += 1;
        for fault in &self.faults {
            match fault {
                SimFault::FailAfterN { operation: op, count } if *op == operation && *seen > *count => {
                    return Err(HwOpError::new(
                        operation,
                        -5,
                        format!("injected failure after {count} operations"),
                    ));
                }
                SimFault::HardwareFault { code } => {
                    return Err(HwOpError::new(operation, *code, "hardware fault"));
                }
                SimFault::FailAfterN { .. } => {}
            }
        }
        Ok(())
    }
}

impl HwIpOps for SimBlock {
    fn open(&mut self, instance: u32) -> Result<(), HwOpError> {
        self.check("open")?;
        self.log.push(SimCall::Open {
            slot: self.id,
            instance,
        });
        Ok(())
    }

    fn init(&mut self, instance: u32, group: GroupId, otf: bool) -> Result<(), HwOpError> {
        self.check("init")?;
        self.regs[REG_INSTANCE] = instance;
        self.log.push(SimCall::Init {
            slot: self.id,
            instance,
            group,
            otf,
        });
        Ok(())
    }

    fn close(&mut self, instance: u32) -> Result<(), HwOpError> {
        self.check("close")?;
        self.regs = [0; NUM_REGS];
        self.private = SimPrivate::for_kind(self.id.kind());
        self.log.push(SimCall::Close {
            slot: self.id,
            instance,
        });
        Ok(())
    }

    fn enable(&mut self, instance: u32) -> Result<(), HwOpError> {
        self.check("enable")?;
        self.regs[REG_ENABLE] = 1;
        if let SimPrivate::Detector { tracking } = &mut self.private {
            *tracking = true;
        }
        self.log.push(SimCall::Enable {
            slot: self.id,
            instance,
        });
        Ok(())
    }

    fn disable(&mut self, instance: u32) -> Result<(), HwOpError> {
        self.check("disable")?;
        self.regs[REG_ENABLE] = 0;
        if let SimPrivate::Detector { tracking } = &mut self.private {
            *tracking = false;
        }
        self.log.push(SimCall::Disable {
            slot: self.id,
            instance,
        });
        Ok(())
    }

    fn shot(&mut self, desc: &ShotDesc, hw_map: &HwIpSet) -> Result<(), HwOpError> {
        self.check("shot")?;
        if !hw_map.contains(self.id) {
            return Err(HwOpError::new("shot", -22, "slot not in hw map"));
        }
        self.regs[REG_FCOUNT] = desc.fcount;
        self.regs[REG_INSTANCE] = desc.instance;
        match &mut self.private {
            SimPrivate::IspCore { applied } if desc.force_param || !desc.params.is_empty() => {
                *applied |= desc.params;
                self.regs[REG_PARAM] = applied.bits();
            }
            SimPrivate::Scaler { ports } => {
                *ports = desc
                    .buffers
                    .iter()
                    .map(|b| b.output)
                    .filter(|o| self.id.outputs().contains(o))
                    .collect();
                self.regs[REG_OUTPUTS] = ports.len() as u32;
            }
            _ => {}
        }
        trace!(slot = ?self.id, fcount = desc.fcount, kind = ?desc.kind, "sim shot");
        self.log.push(SimCall::Shot {
            slot: self.id,
            instance: desc.instance,
            fcount: desc.fcount,
            kind: desc.kind,
            force_param: desc.force_param,
        });
        Ok(())
    }

    fn set_param(
        &mut self,
        region: &ParamRegion,
        instance: u32,
        _hw_map: &HwIpSet,
    ) -> Result<(), HwOpError> {
        self.check("set_param")?;
        if let SimPrivate::PreProcessor { bayer_bits } = &mut self.private {
            if let Some(&bits) = region.data.first() {
                *bayer_bits = bits;
            }
        }
        self.regs[REG_PARAM] |= region.mask.bits();
        self.log.push(SimCall::SetParam {
            slot: self.id,
            instance,
            mask: region.mask,
        });
        Ok(())
    }

    fn load_setfile(&mut self, table: &SetfileTable, instance: u32) -> Result<(), HwOpError> {
        self.check("load_setfile")?;
        self.log.push(SimCall::LoadSetfile {
            slot: self.id,
            instance,
            entries: table.entries.len(),
        });
        Ok(())
    }

    fn apply_setfile(
        &mut self,
        entry: &SetfileEntry,
        scenario: u32,
        instance: u32,
    ) -> Result<(), HwOpError> {
        self.check("apply_setfile")?;
        self.regs[REG_SETFILE_ADDR] = entry.addr as u32;
        self.regs[REG_SETFILE_SIZE] = entry.size;
        self.log.push(SimCall::ApplySetfile {
            slot: self.id,
            instance,
            scenario,
            index: entry.index,
        });
        Ok(())
    }

    fn delete_setfile(&mut self, instance: u32) -> Result<(), HwOpError> {
        self.check("delete_setfile")?;
        self.regs[REG_SETFILE_ADDR] = 0;
        self.regs[REG_SETFILE_SIZE] = 0;
        self.log.push(SimCall::DeleteSetfile {
            slot: self.id,
            instance,
        });
        Ok(())
    }

    fn frame_not_done(
        &mut self,
        desc: &ShotDesc,
        instance: u32,
        is_late: bool,
    ) -> Result<(), HwOpError> {
        self.check("frame_not_done")?;
        self.log.push(SimCall::FrameNotDone {
            slot: self.id,
            instance,
            fcount: desc.fcount,
            is_late,
        });
        Ok(())
    }

    fn clock_gate(&mut self, on: bool, _is_close: bool) -> Result<(), HwOpError> {
        self.settle("clock_gate");
        self.log.push(SimCall::ClockGate { slot: self.id, on });
        Ok(())
    }

    fn size_dump(&mut self, instance: u32) -> Result<(), HwOpError> {
        self.settle("size_dump");
        match &self.private {
            SimPrivate::PreProcessor { bayer_bits } => {
                debug!(slot = ?self.id, instance, bayer_bits, "size dump");
            }
            SimPrivate::IspCore { applied } => {
                debug!(slot = ?self.id, instance, applied = ?applied, "size dump");
            }
            SimPrivate::Scaler { ports } => {
                debug!(slot = ?self.id, instance, ports = ?ports, "size dump");
            }
            SimPrivate::Detector { tracking } => {
                debug!(slot = ?self.id, instance, tracking, "size dump");
            }
        }
        self.log.push(SimCall::SizeDump {
            slot: self.id,
            instance,
        });
        Ok(())
    }

    fn dump_regs(&self) -> Vec<RegisterValue> {
        self.regs
            .iter()
            .enumerate()
            .map(|(i, &value)| RegisterValue {
                offset: (i * 4) as u32,
                value,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameRequest, OutputId};

    fn desc(fcount: u32) -> ShotDesc {
        let req = FrameRequest::new(0, GroupId::Mcs0, fcount)
            .with_output(OutputId::Scaler1, &[0x8000])
            .with_output(OutputId::IspCapture, &[0x9000]);
        ShotDesc {
            instance: 0,
            fcount,
            rcount: 0,
            kind: FrameType::External,
            group: Some(GroupId::Mcs0),
            buffers: req.buffers,
            params: ParamMask::empty(),
            force_param: false,
        }
    }

    #[test]
    fn test_shot_updates_registers() {
        let mut block = SimBlock::new(HwIpId::Mcsc0);
        let map: HwIpSet = [HwIpId::Mcsc0].into_iter().collect();
        block.shot(&desc(12), &map).unwrap();

        let regs = block.dump_regs();
        assert_eq!(regs[REG_FCOUNT].value, 12);
        assert_eq!(regs[REG_OUTPUTS].value, 1);
        assert_eq!(regs[REG_OUTPUTS].offset, 24);
        assert_eq!(block.log().shots(), vec![(HwIpId::Mcsc0, 12)]);
    }

    #[test]
    fn test_shot_outside_hw_map_fails() {
        let mut block = SimBlock::new(HwIpId::Isp0);
        let err = block.shot(&desc(1), &HwIpSet::new()).unwrap_err();
        assert_eq!(err.op, "shot");
        assert!(block.log().shots().is_empty());
    }

    #[test]
    fn test_fail_after_n() {
        let mut block = SimBlock::new(HwIpId::Taa0).fail_after("open", 1);
        assert!(block.open(0).is_ok());
        assert!(block.open(1).is_err());
        assert_eq!(block.log().count(|c| matches!(c, SimCall::Open { .. })), 1);
    }

    #[test]
    fn test_latency_delays_the_call() {
        let mut block = SimBlock::new(HwIpId::Isp0)
            .with_latency("open", Duration::from_millis(20))
            .fail_after("open", 0);
        let start = std::time::Instant::now();
        assert!(block.open(0).is_err());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_hardware_fault_fails_everything() {
        let mut block =
            SimBlock::new(HwIpId::Vra).with_fault(SimFault::HardwareFault { code: -110 });
        assert_eq!(block.enable(0).unwrap_err().code, -110);
        assert!(block.disable(0).is_err());
        // clock gating is not an injectable operation
        assert!(block.clock_gate(true, false).is_ok());
    }
}
