//! Interrupt-side completion: exactly-once finalisation, notifications and
//! protocol violations.

mod common;

use common::{complete, config, dma_rig, frame_start, otf_rig, owner_of, request, OUTPUTS};
use isp_sched::diag::Checkpoint;
use isp_sched::hw::sim::SimCall;
use isp_sched::{
    CallerContext, DoneError, DoneType, FrameState, GroupId, HwIpId, NotifyCommand, OutputId,
    SchedulerConfig,
};
use tracing_test::traced_test;

#[test]
fn test_frame_finalised_exactly_once() {
    let mut rig = otf_rig(config());
    rig.hw.submit(&request(GroupId::Taa0, 1), &rig.hw_map).unwrap();
    frame_start(&rig);
    complete(&rig, 1);

    let notes = rig.rx.drain();
    let commands: Vec<_> = notes.iter().map(|n| n.command).collect();
    assert_eq!(
        commands,
        vec![
            NotifyCommand::FrameDone,
            NotifyCommand::FrameDone,
            NotifyCommand::ShotDone
        ]
    );
    let outputs: Vec<_> = notes.iter().filter_map(|n| n.output).collect();
    assert_eq!(outputs, OUTPUTS.to_vec());
    assert!(notes.iter().all(|n| n.fcount == 1 && n.rcount == 1 && n.group == GroupId::Taa0));

    let snap = rig.hw.queue_snapshot(HwIpId::Taa0, 0).unwrap();
    assert_eq!(snap.busy(), 0);
    assert_eq!(snap.free, config().frames_per_slot);

    let stats = rig.hw.stats();
    assert_eq!(stats.shots_done, 1);
    assert_eq!(stats.frames_done, 2);
}

#[test]
fn test_outputs_before_core_end_still_finalise_once() {
    let mut rig = otf_rig(config());
    rig.hw.submit(&request(GroupId::Taa0, 1), &rig.hw_map).unwrap();
    frame_start(&rig);

    for out in OUTPUTS {
        rig.hw
            .on_output_end(owner_of(out), 0, 1, out, 0, DoneType::Done)
            .unwrap();
    }
    assert!(rig
        .rx
        .drain()
        .iter()
        .all(|n| n.command == NotifyCommand::FrameDone));

    for id in [HwIpId::Vra, HwIpId::Mcsc0, HwIpId::Isp0] {
        rig.hw.on_core_end(id, 0, 1, DoneType::Done).unwrap();
    }
    assert!(rig.rx.drain().is_empty());

    rig.hw.on_core_end(HwIpId::Taa0, 0, 1, DoneType::Done).unwrap();
    let notes = rig.rx.drain();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].command, NotifyCommand::ShotDone);
}

#[test]
fn test_failed_output_reports_not_done() {
    let mut rig = otf_rig(config());
    rig.hw.submit(&request(GroupId::Taa0, 7), &rig.hw_map).unwrap();
    frame_start(&rig);

    for id in [HwIpId::Taa0, HwIpId::Isp0, HwIpId::Mcsc0, HwIpId::Vra] {
        rig.hw.on_core_end(id, 0, 7, DoneType::Done).unwrap();
    }
    rig.hw
        .on_output_end(HwIpId::Isp0, 0, 7, OutputId::IspPreview, -5, DoneType::NotDone)
        .unwrap();
    rig.hw
        .on_output_end(HwIpId::Mcsc0, 0, 7, OutputId::Scaler0, 0, DoneType::Done)
        .unwrap();

    let notes = rig.rx.drain();
    assert_eq!(notes[0].command, NotifyCommand::FrameNotDone);
    assert_eq!(notes[0].status, -5);
    assert_eq!(notes[1].command, NotifyCommand::FrameDone);
    assert_eq!(notes[2].command, NotifyCommand::ShotNotDone);
    assert_eq!(notes[2].status, -1);
}

#[test]
fn test_internal_frames_post_nothing() {
    let mut rig = otf_rig(config());
    rig.hw.submit(&request(GroupId::Taa0, 1), &rig.hw_map).unwrap();
    frame_start(&rig);
    rig.hw.config_lock(HwIpId::Taa0, 0, 1).unwrap();
    complete(&rig, 1);
    rig.rx.drain();

    frame_start(&rig);
    for id in [HwIpId::Taa0, HwIpId::Isp0, HwIpId::Mcsc0, HwIpId::Vra] {
        rig.hw.on_core_end(id, 0, 2, DoneType::Done).unwrap();
    }
    assert!(rig.rx.drain().is_empty());
    let stats = rig.hw.stats();
    assert_eq!(stats.internal_done, 1);
    assert_eq!(rig.hw.queue_snapshot(HwIpId::Taa0, 0).unwrap().busy(), 0);
}

#[test]
fn test_notification_loss_is_counted_not_fatal() {
    let rig = otf_rig(SchedulerConfig {
        notify_capacity: 1,
        ..config()
    });
    rig.hw.submit(&request(GroupId::Taa0, 1), &rig.hw_map).unwrap();
    frame_start(&rig);
    complete(&rig, 1);

    let stats = rig.hw.stats();
    assert_eq!(stats.notifications_posted, 1);
    assert_eq!(stats.notifications_lost, 2);
    assert_eq!(stats.shots_done, 1);
    assert_eq!(rig.hw.queue_snapshot(HwIpId::Taa0, 0).unwrap().busy(), 0);
}

#[test]
#[traced_test]
fn test_unknown_fcount_is_protocol_violation() {
    let rig = otf_rig(config());
    rig.hw.submit(&request(GroupId::Taa0, 1), &rig.hw_map).unwrap();
    frame_start(&rig);
    complete(&rig, 1);

    let err = rig
        .hw
        .on_core_end(HwIpId::Isp0, 0, 1, DoneType::Done)
        .unwrap_err();
    assert_eq!(
        err,
        DoneError::FrameNotFound {
            slot: HwIpId::Isp0,
            instance: 0,
            fcount: 1
        }
    );
    assert!(err.is_protocol_violation());
    assert_eq!(rig.hw.stats().protocol_violations, 1);
    assert!(logs_contain("protocol violation"));
    assert!(logs_contain("register dump"));
}

#[test]
#[traced_test]
fn test_empty_in_flight_on_otf_leader() {
    let rig = otf_rig(config());
    rig.hw.submit(&request(GroupId::Taa0, 1), &rig.hw_map).unwrap();
    frame_start(&rig);

    let err = rig.hw.on_frame_start(HwIpId::Taa0, 0).unwrap_err();
    assert_eq!(
        err,
        DoneError::EmptyQueue {
            slot: HwIpId::Taa0,
            instance: 0,
            queue: "process"
        }
    );
    assert!(logs_contain("protocol violation"));
}

#[test]
fn test_empty_in_flight_on_dma_leader_is_fine() {
    let rig = dma_rig(config());
    rig.hw.on_frame_start(HwIpId::Isp0, 0).unwrap();
    assert_eq!(rig.hw.stats().protocol_violations, 0);
}

#[test]
fn test_unbound_slot_interrupt() {
    let rig = dma_rig(config());
    assert_eq!(
        rig.hw.on_frame_start(HwIpId::Taa0, 0),
        Err(DoneError::InvalidSlot { slot: HwIpId::Taa0 })
    );
    assert_eq!(
        rig.hw.on_frame_start(HwIpId::Isp0, 2),
        Err(DoneError::NotBound {
            slot: HwIpId::Isp0,
            instance: 2
        })
    );
}

#[test]
#[traced_test]
fn test_duplicate_output_end_is_warned() {
    let rig = otf_rig(config());
    rig.hw.submit(&request(GroupId::Taa0, 1), &rig.hw_map).unwrap();
    frame_start(&rig);
    rig.hw
        .on_output_end(HwIpId::Isp0, 0, 1, OutputId::IspPreview, 0, DoneType::Done)
        .unwrap();
    rig.hw
        .on_output_end(HwIpId::Isp0, 0, 1, OutputId::IspPreview, 0, DoneType::Done)
        .unwrap();

    assert_eq!(rig.hw.stats().frames_done, 1);
    assert!(logs_contain("output flag already clear"));
}

#[test]
fn test_force_done_by_handle() {
    let mut rig = dma_rig(config());
    rig.hw.submit(&request(GroupId::Isp0, 4), &rig.hw_map).unwrap();
    let handle = rig
        .hw
        .with_frames(HwIpId::Isp0, |q| q.main.iter(FrameState::InFlight).next().map(|f| f.handle()))
        .unwrap()
        .unwrap();

    rig.hw
        .on_force_done(HwIpId::Isp0, handle, CallerContext::Process)
        .unwrap();
    assert_eq!(rig.hw.queue_snapshot(HwIpId::Isp0, 0).unwrap().busy(), 0);
    assert_eq!(
        rig.log.count(|c| matches!(c, SimCall::FrameNotDone { fcount: 4, is_late: false, .. })),
        1
    );
    let notes = rig.rx.drain();
    assert_eq!(notes.last().map(|n| n.command), Some(NotifyCommand::ShotNotDone));

    // the handle is spent
    assert!(rig
        .hw
        .on_force_done(HwIpId::Isp0, handle, CallerContext::Process)
        .is_err());
}

#[test]
fn test_debug_ring_records_checkpoints() {
    let rig = otf_rig(config());
    rig.hw.submit(&request(GroupId::Taa0, 1), &rig.hw_map).unwrap();
    frame_start(&rig);
    complete(&rig, 1);

    let records = rig.hw.debug_records(HwIpId::Isp0).unwrap();
    let rec = records.iter().find(|r| r.fcount == 1).unwrap();
    assert!(rec.stamp(Checkpoint::Shot).is_some());
    assert!(rec.stamp(Checkpoint::FrameStart).is_some());
    assert!(rec.stamp(Checkpoint::CoreEnd).is_some());
    assert!(rec.interval(Checkpoint::Shot, Checkpoint::CoreEnd).is_some());
}
