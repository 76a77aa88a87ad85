//! isp-sim: drive the scheduler against simulated hardware.
//!
//! Builds a 3AA → ISP → MCSC → VRA OTF chain on simulated blocks, streams
//! frames through it with interrupts delivered in random order, and prints
//! the scheduler statistics.
//!
//! # Usage
//!
//! ```bash
//! isp-sim --frames 500 --drop-rate 0.1 --late-rate 0.05 --seed 7
//! isp-sim --config config/isp_sched.toml --json
//! isp-sim --print-config > my_sched.toml
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use bytes::BufMut;
use clap::Parser;
use isp_sched::hw::sim::SimBlock;
use isp_sched::setfile::SETFILE_V2_MAGIC;
use isp_sched::{
    logging, DoneType, ForceStopReport, FrameRequest, GroupId, HwIpId, IspHardware, Link,
    Notification, NotificationReceiver, NotifyCommand, OutputId, SchedStats, SchedulerConfig,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};

const INSTANCE: u32 = 0;
const CHAIN: [HwIpId; 4] = [HwIpId::Taa0, HwIpId::Isp0, HwIpId::Mcsc0, HwIpId::Vra];
const OUTPUTS: [OutputId; 3] = [OutputId::IspPreview, OutputId::Scaler0, OutputId::Scaler1];
const SETFILE_BASE: u64 = 0x8000_0000;

#[derive(Parser, Debug)]
#[command(name = "isp-sim")]
#[command(about = "Stream frames through a simulated ISP chain", long_about = None)]
struct Cli {
    /// Frames to stream
    #[arg(long, default_value_t = 200)]
    frames: u32,

    /// Probability that a frame has no request ready at config lock
    #[arg(long, default_value_t = 0.1)]
    drop_rate: f64,

    /// Probability of resubmitting a frame the hardware already started
    #[arg(long, default_value_t = 0.05)]
    late_rate: f64,

    /// Probability that an output reports an error
    #[arg(long, default_value_t = 0.02)]
    error_rate: f64,

    /// RNG seed
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[derive(Debug, Default, Serialize)]
struct Tally {
    frame_done: u64,
    frame_not_done: u64,
    shot_done: u64,
    shot_not_done: u64,
}

impl Tally {
    fn record(&mut self, note: &Notification) {
        match note.command {
            NotifyCommand::FrameDone => self.frame_done += 1,
            NotifyCommand::FrameNotDone => self.frame_not_done += 1,
            NotifyCommand::ShotDone => self.shot_done += 1,
            NotifyCommand::ShotNotDone => self.shot_not_done += 1,
        }
    }
}

#[derive(Debug, Serialize)]
struct Summary {
    frames: u32,
    stats: SchedStats,
    stop: ForceStopReport,
    notifications: Tally,
}

#[derive(Debug, Clone, Copy)]
enum Event {
    Core(HwIpId),
    Output(HwIpId, OutputId),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => SchedulerConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SchedulerConfig::load()?,
    };
    if cli.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    let (hw, rx) = build(config)?;
    let consumer = tokio::spawn(consume(rx));

    let json = cli.json;
    let frames = cli.frames;
    let (stats, stop) = tokio::task::spawn_blocking(move || {
        let result = stream(&hw, &cli);
        result.map(|stop| (hw.stats(), stop))
    })
    .await??;

    let summary = Summary {
        frames,
        stats,
        stop,
        notifications: consumer.await?,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("frames streamed:      {}", summary.frames);
        println!("shots done/not done:  {}/{}", summary.notifications.shot_done, summary.notifications.shot_not_done);
        println!("frames done/not done: {}/{}", summary.notifications.frame_done, summary.notifications.frame_not_done);
        println!("internal frames:      {}", summary.stats.internal_synthesized);
        println!("late shots:           {}", summary.stats.late_shots);
        println!("self heals:           {}", summary.stats.self_heals);
        println!("protocol violations:  {}", summary.stats.protocol_violations);
        println!("notifications lost:   {}", summary.stats.notifications_lost);
        println!("retired at stop:      {}", summary.stop.retired);
    }
    Ok(())
}

async fn consume(mut rx: NotificationReceiver) -> Tally {
    let mut tally = Tally::default();
    while let Some(note) = rx.recv().await {
        tally.record(&note);
    }
    tally
}

fn build(config: SchedulerConfig) -> Result<(IspHardware, NotificationReceiver)> {
    let mut builder = IspHardware::builder(config).gate_domain(&[HwIpId::Mcsc0, HwIpId::Vra]);
    for id in CHAIN {
        builder = builder.slot(id, SimBlock::new(id).boxed());
    }
    let (hw, rx) = builder.build();

    hw.bind_group(INSTANCE, GroupId::Taa0, true)?;
    hw.bind_group(INSTANCE, GroupId::Isp0, false)?;
    hw.bind_group(INSTANCE, GroupId::Mcs0, false)?;
    hw.bind_group(INSTANCE, GroupId::Vra, false)?;
    hw.link_groups(INSTANCE, GroupId::Taa0, GroupId::Isp0, Link::Otf)?;
    hw.link_groups(INSTANCE, GroupId::Isp0, GroupId::Mcs0, Link::Otf)?;
    hw.link_groups(INSTANCE, GroupId::Mcs0, GroupId::Vra, Link::Otf)?;

    for group in [GroupId::Taa0, GroupId::Isp0, GroupId::Mcs0, GroupId::Vra] {
        hw.open(INSTANCE, group)?;
        hw.init(INSTANCE, group)?;
    }
    hw.load_setfile(INSTANCE, &sample_setfile(), SETFILE_BASE)?;
    hw.apply_setfile(INSTANCE, GroupId::Taa0, 0)?;
    Ok((hw, rx))
}

/// Two tuning sets each for 3AA0, ISP0 and MCSC0, two scenarios.
fn sample_setfile() -> Vec<u8> {
    let tables = [HwIpId::Taa0, HwIpId::Isp0, HwIpId::Mcsc0];
    let header_len = 8 + tables.len() * (12 + 2 * 4 + 2 * 8);
    let mut b = Vec::with_capacity(header_len + 256);
    b.put_u32_le(SETFILE_V2_MAGIC);
    b.put_u32_le(tables.len() as u32);
    for (i, hw) in tables.iter().enumerate() {
        b.put_u32_le(*hw as u32);
        b.put_u32_le(2);
        b.put_u32_le(2);
        b.put_u32_le(0);
        b.put_u32_le(1);
        for set in 0..2u32 {
            b.put_u32_le((header_len + i * 64) as u32 + set * 32);
            b.put_u32_le(32);
        }
    }
    b.resize(header_len + tables.len() * 64, 0);
    b
}

fn request(fcount: u32) -> FrameRequest {
    let base = 0x1_0000_0000 + u64::from(fcount) * 0x10_0000;
    OUTPUTS
        .iter()
        .enumerate()
        .fold(FrameRequest::new(INSTANCE, GroupId::Taa0, fcount), |req, (i, out)| {
            req.with_output(*out, &[base + (i as u64) * 0x4_0000])
        })
        .with_rcount(fcount)
}

fn owner_of(output: OutputId) -> Option<HwIpId> {
    CHAIN.into_iter().find(|id| id.outputs().contains(&output))
}

fn stream(hw: &IspHardware, cli: &Cli) -> Result<ForceStopReport> {
    for (name, p) in [("drop-rate", cli.drop_rate), ("late-rate", cli.late_rate), ("error-rate", cli.error_rate)] {
        anyhow::ensure!((0.0..=1.0).contains(&p), "{name} must be within 0..=1, got {p}");
    }
    let mut rng = StdRng::seed_from_u64(cli.seed);
    let hw_map = hw.hw_map(INSTANCE, GroupId::Taa0);

    hw.process_start(INSTANCE, GroupId::Taa0)?;
    hw.submit(&request(1), &hw_map)?;

    for fcount in 1..=cli.frames {
        if !rng.gen_bool(cli.drop_rate) {
            hw.submit(&request(fcount + 1), &hw_map)?;
        }
        if fcount > 1 && rng.gen_bool(cli.late_rate) {
            hw.submit(&request(fcount), &hw_map)?;
        }

        for id in CHAIN {
            if let Err(e) = hw.on_frame_start(id, INSTANCE) {
                warn!(slot = ?id, fcount, error = %e, "frame start rejected");
            }
        }
        hw.config_lock(HwIpId::Taa0, INSTANCE, fcount)?;

        let pending = hw.with_frames(HwIpId::Taa0, |q| {
            q.main
                .find_fcount(isp_sched::FrameState::Completed, INSTANCE, fcount)
                .map(|idx| q.main.frame(idx).out_flag())
        })?;
        let mut events: Vec<Event> = CHAIN.into_iter().map(Event::Core).collect();
        if let Some(outputs) = pending {
            events.extend(
                outputs
                    .iter()
                    .filter_map(|out| owner_of(out).map(|slot| Event::Output(slot, out))),
            );
        }
        events.shuffle(&mut rng);

        for event in events {
            let res = match event {
                Event::Core(slot) => hw.on_core_end(slot, INSTANCE, fcount, DoneType::Done),
                Event::Output(slot, out) => {
                    let (done, status) = if rng.gen_bool(cli.error_rate) {
                        (DoneType::NotDone, -5)
                    } else {
                        (DoneType::Done, 0)
                    };
                    hw.on_output_end(slot, INSTANCE, fcount, out, status, done)
                }
            };
            if let Err(e) = res {
                warn!(fcount, error = %e, "completion rejected");
                hw.dump_state(HwIpId::Taa0)?;
            }
        }
    }

    let stop = hw.process_stop(INSTANCE, GroupId::Taa0)?;
    info!(retired = stop.retired, "stream stopped");
    hw.delete_setfile(INSTANCE)?;
    for group in [GroupId::Vra, GroupId::Mcs0, GroupId::Isp0, GroupId::Taa0] {
        hw.close(INSTANCE, group)?;
    }
    Ok(stop)
}
