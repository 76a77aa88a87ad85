//! Randomised streaming runs checking queue membership and exactly-once
//! reporting under shuffled interrupt order, drops, late duplicates and
//! output errors.

mod common;

use common::{config, owner_of, pending_outputs, request, Rig, OTF_CHAIN, OUTPUTS};
use isp_sched::{DoneType, GroupId, HwIpId, NotifyCommand};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone, Copy)]
enum Event {
    Core(HwIpId),
    Output(isp_sched::OutputId),
}

fn membership_ok(rig: &Rig) -> bool {
    rig.hw
        .with_frames(HwIpId::Taa0, |q| q.main.check_membership() && q.late.check_membership())
        .unwrap()
}

struct Outcome {
    accepted: u64,
    shot_notes: u64,
    frame_notes: u64,
}

fn run(seed: u64, frames: u32) -> Outcome {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut rig = common::otf_rig(config());
    let mut accepted = 0u64;
    let (mut shot_notes, mut frame_notes) = (0u64, 0u64);
    let mut tally = |rig: &mut Rig| {
        for note in rig.rx.drain() {
            match note.command {
                NotifyCommand::ShotDone | NotifyCommand::ShotNotDone => shot_notes += 1,
                NotifyCommand::FrameDone | NotifyCommand::FrameNotDone => frame_notes += 1,
            }
        }
    };

    rig.hw.submit(&request(GroupId::Taa0, 1), &rig.hw_map).unwrap();
    accepted += 1;

    for fcount in 1..=frames {
        if rng.gen_bool(0.8) && rig.hw.submit(&request(GroupId::Taa0, fcount + 1), &rig.hw_map).is_ok() {
            accepted += 1;
        }
        if fcount > 1 && rng.gen_bool(0.1) && rig.hw.submit(&request(GroupId::Taa0, fcount), &rig.hw_map).is_ok() {
            accepted += 1;
        }
        assert!(membership_ok(&rig));

        for id in OTF_CHAIN {
            rig.hw.on_frame_start(id, 0).unwrap();
        }
        rig.hw.config_lock(HwIpId::Taa0, 0, fcount).unwrap();
        assert!(membership_ok(&rig));

        let mut events: Vec<Event> = OTF_CHAIN.into_iter().map(Event::Core).collect();
        events.extend(pending_outputs(&rig, HwIpId::Taa0, fcount).into_iter().map(Event::Output));
        events.shuffle(&mut rng);

        for event in events {
            match event {
                Event::Core(id) => rig.hw.on_core_end(id, 0, fcount, DoneType::Done).unwrap(),
                Event::Output(out) => {
                    let done = if rng.gen_bool(0.05) {
                        DoneType::NotDone
                    } else {
                        DoneType::Done
                    };
                    rig.hw
                        .on_output_end(owner_of(out), 0, fcount, out, 0, done)
                        .unwrap();
                }
            }
            let settled = rig
                .hw
                .with_frames(HwIpId::Taa0, |q| {
                    q.main.iter(isp_sched::FrameState::Completed).all(|f| {
                        f.shot_done_count() == 1 && f.core_flag().is_subset(&OTF_CHAIN.into_iter().collect())
                    })
                })
                .unwrap();
            assert!(settled, "seed {seed} frame {fcount}");
        }
        tally(&mut rig);
        assert_eq!(rig.hw.queue_snapshot(HwIpId::Taa0, 0).unwrap().completed, 0);
    }

    rig.hw.process_stop(0, GroupId::Taa0).unwrap();
    tally(&mut rig);
    assert!(membership_ok(&rig));
    assert_eq!(rig.hw.queue_snapshot(HwIpId::Taa0, 0).unwrap().busy(), 0);
    assert_eq!(rig.hw.stats().protocol_violations, 0);

    Outcome {
        accepted,
        shot_notes,
        frame_notes,
    }
}

#[test]
fn test_every_accepted_request_reported_exactly_once() {
    for seed in 0..16 {
        let out = run(seed, 60);
        assert_eq!(out.shot_notes, out.accepted, "seed {seed}");
        assert_eq!(out.frame_notes, out.accepted * OUTPUTS.len() as u64, "seed {seed}");
    }
}

#[test]
fn test_frames_recycle_under_long_runs() {
    let out = run(99, 400);
    assert!(out.accepted > 300);
}
