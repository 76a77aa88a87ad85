//! Force-stop and drain.
//!
//! Shutting a chain down retires every frame the leader still holds for an
//! instance: Completed first, then In-Flight, then Requested, for the main
//! queues and then the late ones. Each frame is reported not-done. A queue
//! that keeps refilling is abandoned after a bounded number of attempts.

use crate::error::ScheduleError;
use crate::frame::FrameState;
use crate::framemgr::{CallerContext, FrameQueues, SetKind};
use crate::hardware::IspHardware;
use crate::hw::HwIpId;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const DRAIN_ORDER: [(SetKind, FrameState); 6] = [
    (SetKind::Main, FrameState::Completed),
    (SetKind::Main, FrameState::InFlight),
    (SetKind::Main, FrameState::Requested),
    (SetKind::Late, FrameState::Completed),
    (SetKind::Late, FrameState::InFlight),
    (SetKind::Late, FrameState::Requested),
];

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Outcome of a force-stop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ForceStopReport {
    /// Frames retired
    pub retired: usize,
    /// Attempts spent across all queues
    pub retries: u32,
    /// Queues still non-empty when their attempts ran out
    #[serde(skip)]
    pub abandoned: Vec<(SetKind, FrameState)>,
}

impl ForceStopReport {
    /// Whether every queue drained.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.abandoned.is_empty()
    }
}

impl IspHardware {
    /// Retire every frame `instance` has queued on `slot`.
    ///
    /// Calling it again on a drained slot retires nothing.
    pub fn force_stop(&self, slot: HwIpId, instance: u32) -> Result<ForceStopReport, ScheduleError> {
        let ip = self.slot(slot)?;
        self.status(ip, instance)?;
        let retries = self.config.force_stop_retries;
        let interval = self.config.force_stop_interval();
        let mut report = ForceStopReport::default();

        for (kind, state) in DRAIN_ORDER {
            let mut attempts = 0;
            loop {
                let mut q = ip.frames.lock(CallerContext::Process);
                let Some(idx) = q.get(kind).peek_instance(state, instance) else {
                    break;
                };
                if attempts >= retries {
                    warn!(
                        slot = ?slot,
                        instance,
                        queue = state.name(),
                        late = kind == SetKind::Late,
                        remaining = q.get(kind).count_instance(state, instance),
                        "force stop gave up on queue"
                    );
                    report.abandoned.push((kind, state));
                    break;
                }
                attempts += 1;
                debug!(
                    slot = ?slot,
                    instance,
                    fcount = q.get(kind).frame(idx).fcount,
                    queue = state.name(),
                    "force stop"
                );
                self.force_done_locked(&mut q, slot, kind, idx, kind == SetKind::Late);
                drop(q);
                report.retired += 1;
                if !interval.is_zero() {
                    std::thread::sleep(interval);
                }
            }
            report.retries += attempts;
        }

        if report.retired > 0 || !report.is_clean() {
            info!(
                slot = ?slot,
                instance,
                retired = report.retired,
                abandoned = report.abandoned.len(),
                "force stop done"
            );
        }
        Ok(report)
    }

    /// Retire every non-free frame of `owner`'s set, whatever its instance.
    /// Used on the last close, when no instance can still complete them.
    pub(crate) fn retire_all_locked(&self, q: &mut FrameQueues, owner: HwIpId) -> usize {
        let mut retired = 0;
        for (kind, state) in DRAIN_ORDER {
            while let Some(idx) = q.get(kind).peek(state) {
                self.force_done_locked(q, owner, kind, idx, kind == SetKind::Late);
                retired += 1;
            }
        }
        retired
    }

    /// Poll until `instance` has nothing Completed on `slot`; `false` on
    /// timeout.
    pub fn wait_completed_empty(&self, slot: HwIpId, instance: u32, timeout: Duration) -> bool {
        let Ok(ip) = self.slot(slot) else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        loop {
            let pending = ip
                .frames
                .lock(CallerContext::Process)
                .main
                .count_instance(FrameState::Completed, instance);
            if pending == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                debug!(slot = ?slot, instance, pending, "completed queue did not drain");
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_default_is_clean() {
        let report = ForceStopReport::default();
        assert!(report.is_clean());
        assert_eq!(report.retired, 0);
    }

    #[test]
    fn test_drain_order_main_before_late() {
        let first_late = DRAIN_ORDER
            .iter()
            .position(|(k, _)| *k == SetKind::Late)
            .unwrap();
        assert!(DRAIN_ORDER[..first_late].iter().all(|(k, _)| *k == SetKind::Main));
        assert_eq!(DRAIN_ORDER[0].1, FrameState::Completed);
    }
}
