//! Shared rigs for the scheduler integration tests.
#![allow(dead_code)]

use isp_sched::hw::sim::{SimBlock, SimLog};
use isp_sched::{
    DoneType, FrameRequest, FrameState, GroupId, HwIpId, HwIpSet, IspHardware, Link,
    NotificationReceiver, OutputId, SchedulerConfig,
};

pub const OTF_CHAIN: [HwIpId; 4] = [HwIpId::Taa0, HwIpId::Isp0, HwIpId::Mcsc0, HwIpId::Vra];

/// Outputs every test request asks for.
pub const OUTPUTS: [OutputId; 2] = [OutputId::IspPreview, OutputId::Scaler0];

pub struct Rig {
    pub hw: IspHardware,
    pub rx: NotificationReceiver,
    pub log: SimLog,
    pub hw_map: HwIpSet,
}

/// Configuration with short waits.
pub fn config() -> SchedulerConfig {
    SchedulerConfig {
        force_stop_interval_ms: 0,
        otf_disable_timeout_ms: 5,
        notify_capacity: 1024,
        ..SchedulerConfig::default()
    }
}

fn slots(config: SchedulerConfig, ids: &[HwIpId], log: &SimLog) -> (IspHardware, NotificationReceiver) {
    let mut builder = IspHardware::builder(config).gate_domain(&[HwIpId::Mcsc0, HwIpId::Vra]);
    for &id in ids {
        builder = builder.slot(id, SimBlock::new(id).with_log(log.clone()).boxed());
    }
    builder.build()
}

/// Sensor-fed 3AA0 → ISP0 → MCSC0 → VRA chain, opened and streaming.
pub fn otf_rig(config: SchedulerConfig) -> Rig {
    otf_rig_with(config, |_, block| block)
}

/// Like [`otf_rig`], letting `customize` adjust each simulated block.
pub fn otf_rig_with(config: SchedulerConfig, customize: impl Fn(HwIpId, SimBlock) -> SimBlock) -> Rig {
    let log = SimLog::new();
    let mut builder = IspHardware::builder(config).gate_domain(&[HwIpId::Mcsc0, HwIpId::Vra]);
    for id in OTF_CHAIN {
        let block = customize(id, SimBlock::new(id).with_log(log.clone()));
        builder = builder.slot(id, block.boxed());
    }
    let (hw, rx) = builder.build();

    let groups = [GroupId::Taa0, GroupId::Isp0, GroupId::Mcs0, GroupId::Vra];
    hw.bind_group(0, GroupId::Taa0, true).unwrap();
    for g in &groups[1..] {
        hw.bind_group(0, *g, false).unwrap();
    }
    for pair in groups.windows(2) {
        hw.link_groups(0, pair[0], pair[1], Link::Otf).unwrap();
    }
    for g in groups {
        hw.open(0, g).unwrap();
        hw.init(0, g).unwrap();
    }
    hw.process_start(0, GroupId::Taa0).unwrap();
    let hw_map = hw.hw_map(0, GroupId::Taa0);
    log.clear();
    Rig { hw, rx, log, hw_map }
}

/// Memory-fed ISP0 on its own, opened and streaming.
pub fn dma_rig(config: SchedulerConfig) -> Rig {
    let log = SimLog::new();
    let (hw, rx) = slots(config, &[HwIpId::Isp0], &log);
    hw.bind_group(0, GroupId::Isp0, false).unwrap();
    hw.open(0, GroupId::Isp0).unwrap();
    hw.init(0, GroupId::Isp0).unwrap();
    hw.process_start(0, GroupId::Isp0).unwrap();
    let hw_map = hw.hw_map(0, GroupId::Isp0);
    log.clear();
    Rig { hw, rx, log, hw_map }
}

pub fn request(group: GroupId, fcount: u32) -> FrameRequest {
    OUTPUTS
        .iter()
        .fold(FrameRequest::new(0, group, fcount), |req, out| {
            req.with_output(*out, &[0x1000_0000 + u64::from(fcount) * 0x1000])
        })
        .with_rcount(fcount)
}

/// Slot that drives `output`.
pub fn owner_of(output: OutputId) -> HwIpId {
    match output {
        OutputId::IspPreview | OutputId::IspCapture => HwIpId::Isp0,
        _ => HwIpId::Mcsc0,
    }
}

/// Frame start on every slot of the OTF chain, leader first.
pub fn frame_start(rig: &Rig) {
    for id in OTF_CHAIN {
        rig.hw.on_frame_start(id, 0).unwrap();
    }
}

/// Core end on every chain slot, then every output still pending.
pub fn complete(rig: &Rig, fcount: u32) {
    for id in OTF_CHAIN {
        rig.hw.on_core_end(id, 0, fcount, DoneType::Done).unwrap();
    }
    for out in pending_outputs(rig, HwIpId::Taa0, fcount) {
        rig.hw
            .on_output_end(owner_of(out), 0, fcount, out, 0, DoneType::Done)
            .unwrap();
    }
}

/// Outputs of Completed frame `fcount` on `leader` still owed a frame end.
pub fn pending_outputs(rig: &Rig, leader: HwIpId, fcount: u32) -> Vec<OutputId> {
    rig.hw
        .with_frames(leader, |q| {
            q.main
                .find_fcount(FrameState::Completed, 0, fcount)
                .map(|idx| q.main.frame(idx).out_flag())
        })
        .unwrap()
        .map(|flags| flags.iter().filter(|o| OUTPUTS.contains(o)).collect())
        .unwrap_or_default()
}
