//! Open/close reference counting, setfiles, parameters and shutdown drain.

mod common;

use bytes::BufMut;
use common::{config, dma_rig, frame_start, otf_rig, request, OUTPUTS};
use isp_sched::frame::ParamMask;
use isp_sched::hw::sim::{SimBlock, SimCall, SimLog};
use isp_sched::hw::{HwState, ParamRegion};
use isp_sched::setfile::SETFILE_V2_MAGIC;
use isp_sched::{
    FrameState, GroupId, HwIpId, IspHardware, Link, NotifyCommand, ScheduleError, SchedulerConfig,
};
use std::sync::atomic::Ordering;

/// ISP0 table: three scenarios over two tuning sets.
fn setfile_blob() -> Vec<u8> {
    let mut b = Vec::new();
    b.put_u32_le(SETFILE_V2_MAGIC);
    b.put_u32_le(1);
    b.put_u32_le(HwIpId::Isp0 as u32);
    b.put_u32_le(3);
    b.put_u32_le(2);
    for idx in [0, 1, 1] {
        b.put_u32_le(idx);
    }
    b.put_u32_le(64);
    b.put_u32_le(16);
    b.put_u32_le(80);
    b.put_u32_le(32);
    b.resize(112, 0);
    b
}

#[test]
fn test_last_close_resets_slot() {
    let log = SimLog::new();
    let (hw, _rx) = IspHardware::builder(config())
        .slot(HwIpId::Isp0, SimBlock::new(HwIpId::Isp0).with_log(log.clone()).boxed())
        .build();
    for instance in [0, 1] {
        hw.bind_group(instance, GroupId::Isp0, false).unwrap();
        hw.open(instance, GroupId::Isp0).unwrap();
    }
    let ip = hw.slot(HwIpId::Isp0).unwrap();
    assert_eq!(ip.rsccount(), 2);
    ip.instance(1).unwrap().counters.reset_to(41);

    hw.close(0, GroupId::Isp0).unwrap();
    assert_eq!(ip.rsccount(), 1);
    assert_eq!(log.count(|c| matches!(c, SimCall::Close { .. })), 0);
    assert!(ip.state().contains(HwState::OPENED));

    hw.close(1, GroupId::Isp0).unwrap();
    assert_eq!(ip.rsccount(), 0);
    assert_eq!(log.count(|c| matches!(c, SimCall::Close { .. })), 1);
    assert!(ip.state().is_empty());
    assert_eq!(ip.instance(1).unwrap().counters.snapshot().frame_start, 0);
    assert!(!hw.resolver().is_bound(1, GroupId::Isp0));
}

#[test]
fn test_last_close_retires_outstanding_frames() {
    let mut rig = otf_rig(config());
    rig.hw.submit(&request(GroupId::Taa0, 1), &rig.hw_map).unwrap();
    rig.rx.drain();

    let groups = [GroupId::Taa0, GroupId::Isp0, GroupId::Mcs0, GroupId::Vra];
    for g in groups {
        rig.hw.close(0, g).unwrap();
    }
    assert_eq!(rig.hw.queue_snapshot(HwIpId::Taa0, 0).unwrap().busy(), 0);
    let notes = rig.rx.drain();
    assert_eq!(
        notes
            .iter()
            .filter(|n| n.command == NotifyCommand::ShotNotDone && n.fcount == 1)
            .count(),
        1
    );

    // a new session reuses fcount 1 without tripping late detection
    rig.hw.bind_group(0, GroupId::Taa0, true).unwrap();
    for g in &groups[1..] {
        rig.hw.bind_group(0, *g, false).unwrap();
    }
    for pair in groups.windows(2) {
        rig.hw.link_groups(0, pair[0], pair[1], Link::Otf).unwrap();
    }
    for g in groups {
        rig.hw.open(0, g).unwrap();
    }
    let hw_map = rig.hw.hw_map(0, GroupId::Taa0);
    rig.hw.submit(&request(GroupId::Taa0, 1), &hw_map).unwrap();
    assert_eq!(rig.hw.stats().late_shots, 0);
    assert_eq!(rig.hw.queue_snapshot(HwIpId::Taa0, 0).unwrap().in_flight, 1);
}

#[test]
fn test_open_failure_rolls_back() {
    let (hw, _rx) = IspHardware::builder(config())
        .slot(HwIpId::Isp0, SimBlock::new(HwIpId::Isp0).fail_after("open", 0).boxed())
        .build();
    hw.bind_group(0, GroupId::Isp0, false).unwrap();

    let err = hw.open(0, GroupId::Isp0).unwrap_err();
    assert!(err.is_hardware());
    let ip = hw.slot(HwIpId::Isp0).unwrap();
    assert_eq!(ip.rsccount(), 0);
    assert!(!ip.instance(0).unwrap().opened.load(Ordering::Acquire));
    assert!(matches!(
        hw.submit(&request(GroupId::Isp0, 1), &hw.hw_map(0, GroupId::Isp0)),
        Err(ScheduleError::NotOpened { .. })
    ));
}

#[test]
fn test_setfile_load_apply_delete() {
    let rig = dma_rig(config());
    rig.hw.load_setfile(0, &setfile_blob(), 0x4000_0000).unwrap();
    let ip = rig.hw.slot(HwIpId::Isp0).unwrap();
    assert!(ip.state().contains(HwState::SETFILE_LOADED));
    assert!(rig
        .log
        .calls()
        .contains(&SimCall::LoadSetfile { slot: HwIpId::Isp0, instance: 0, entries: 2 }));

    rig.hw.apply_setfile(0, GroupId::Isp0, 2).unwrap();
    assert!(rig.log.calls().contains(&SimCall::ApplySetfile {
        slot: HwIpId::Isp0,
        instance: 0,
        scenario: 2,
        index: 1,
    }));

    assert!(matches!(
        rig.hw.apply_setfile(0, GroupId::Isp0, 9),
        Err(ScheduleError::UnknownScenario { slot: HwIpId::Isp0, scenario: 9 })
    ));

    rig.hw.delete_setfile(0).unwrap();
    assert!(!ip.state().contains(HwState::SETFILE_LOADED));
    assert_eq!(rig.log.count(|c| matches!(c, SimCall::DeleteSetfile { .. })), 1);
    // nothing loaded any more: applying is a no-op
    rig.hw.apply_setfile(0, GroupId::Isp0, 9).unwrap();
}

#[test]
fn test_bad_setfile_is_rejected() {
    let rig = dma_rig(config());
    let mut blob = setfile_blob();
    blob[0] = 0;
    assert!(matches!(
        rig.hw.load_setfile(0, &blob, 0),
        Err(ScheduleError::Setfile(_))
    ));
}

#[test]
fn test_set_param_reaches_every_chain_slot() {
    let rig = otf_rig(config());
    let region = ParamRegion {
        mask: ParamMask::ISP | ParamMask::SCALER,
        data: bytes::Bytes::from_static(&[12]),
    };
    rig.hw.set_param(0, GroupId::Mcs0, &region).unwrap();
    let slots: Vec<HwIpId> = rig
        .log
        .calls()
        .iter()
        .filter(|c| matches!(c, SimCall::SetParam { .. }))
        .map(SimCall::slot)
        .collect();
    assert_eq!(slots, vec![HwIpId::Vra, HwIpId::Mcsc0, HwIpId::Isp0, HwIpId::Taa0]);
}

#[test]
fn test_process_start_enables_leaf_first() {
    let log = SimLog::new();
    let (hw, _rx) = IspHardware::builder(config())
        .slot(HwIpId::Taa0, SimBlock::new(HwIpId::Taa0).with_log(log.clone()).boxed())
        .slot(HwIpId::Isp0, SimBlock::new(HwIpId::Isp0).with_log(log.clone()).boxed())
        .build();
    hw.bind_group(0, GroupId::Taa0, true).unwrap();
    hw.bind_group(0, GroupId::Isp0, false).unwrap();
    hw.link_groups(0, GroupId::Taa0, GroupId::Isp0, isp_sched::Link::Otf).unwrap();
    hw.open(0, GroupId::Taa0).unwrap();
    hw.open(0, GroupId::Isp0).unwrap();

    hw.process_start(0, GroupId::Taa0).unwrap();
    let enabled: Vec<HwIpId> = log
        .calls()
        .iter()
        .filter(|c| matches!(c, SimCall::Enable { .. }))
        .map(SimCall::slot)
        .collect();
    assert_eq!(enabled, vec![HwIpId::Isp0, HwIpId::Taa0]);
}

#[test]
fn test_force_stop_drains_completed_then_in_flight() {
    let mut rig = dma_rig(config());
    for fcount in 1..=5 {
        rig.hw.submit(&request(GroupId::Isp0, fcount), &rig.hw_map).unwrap();
    }
    for _ in 0..3 {
        rig.hw.on_frame_start(HwIpId::Isp0, 0).unwrap();
    }
    let snap = rig.hw.queue_snapshot(HwIpId::Isp0, 0).unwrap();
    assert_eq!((snap.completed, snap.in_flight), (3, 2));

    let report = rig.hw.force_stop(HwIpId::Isp0, 0).unwrap();
    assert_eq!(report.retired, 5);
    assert!(report.is_clean());

    let retired: Vec<u32> = rig
        .log
        .calls()
        .iter()
        .filter_map(|c| match c {
            SimCall::FrameNotDone { fcount, is_late: false, .. } => Some(*fcount),
            _ => None,
        })
        .collect();
    assert_eq!(retired, vec![1, 2, 3, 4, 5]);

    let notes = rig.rx.drain();
    let shots = notes
        .iter()
        .filter(|n| n.command == NotifyCommand::ShotNotDone)
        .count();
    let frames = notes
        .iter()
        .filter(|n| n.command == NotifyCommand::FrameNotDone)
        .count();
    assert_eq!(shots, 5);
    assert_eq!(frames, 5 * OUTPUTS.len());

    let again = rig.hw.force_stop(HwIpId::Isp0, 0).unwrap();
    assert_eq!(again.retired, 0);
    assert_eq!(rig.hw.queue_snapshot(HwIpId::Isp0, 0).unwrap().busy(), 0);
}

#[test]
fn test_force_stop_gives_up_after_retries() {
    let rig = dma_rig(SchedulerConfig {
        force_stop_retries: 2,
        ..config()
    });
    for fcount in 1..=4 {
        rig.hw.submit(&request(GroupId::Isp0, fcount), &rig.hw_map).unwrap();
    }
    let report = rig.hw.force_stop(HwIpId::Isp0, 0).unwrap();
    assert_eq!(report.retired, 2);
    assert_eq!(report.abandoned, vec![(isp_sched::framemgr::SetKind::Main, FrameState::InFlight)]);
    assert_eq!(rig.hw.queue_snapshot(HwIpId::Isp0, 0).unwrap().in_flight, 2);
}

#[test]
fn test_process_stop_clears_otf_state() {
    let rig = otf_rig(config());
    rig.hw.submit(&request(GroupId::Taa0, 1), &rig.hw_map).unwrap();
    frame_start(&rig);
    rig.hw.config_lock(HwIpId::Taa0, 0, 1).unwrap();

    let report = rig.hw.process_stop(0, GroupId::Taa0).unwrap();
    assert_eq!(report.retired, 2);
    let chain = rig.hw.chain(0, GroupId::Taa0).unwrap();
    assert!(!chain.otf_started());
    let st = rig.hw.slot(HwIpId::Taa0).unwrap().instance(0).unwrap();
    assert_eq!(st.internal_fcount.load(Ordering::Acquire), 0);
    assert!(!rig.hw.slot(HwIpId::Taa0).unwrap().state().contains(HwState::RUNNING));

    // streaming again starts over with a first OTF start
    rig.log.clear();
    rig.hw.submit(&request(GroupId::Taa0, 50), &rig.hw_map).unwrap();
    assert_eq!(rig.log.shots().len(), 4);
}

#[test]
fn test_dump_state_reports_queues() {
    let rig = dma_rig(config());
    rig.hw.submit(&request(GroupId::Isp0, 1), &rig.hw_map).unwrap();
    let dump = rig.hw.dump_state(HwIpId::Isp0).unwrap();
    assert_eq!(dump.slot, HwIpId::Isp0);
    let (instance, queues, _) = dump.instances[0];
    assert_eq!(instance, 0);
    assert_eq!(queues.in_flight, 1);
    let json = serde_json::to_value(&dump).unwrap();
    assert_eq!(json["rsccount"], 1);
}
