//! Reference-counted clock gating.
//!
//! A [`ClockGate`] may be shared by several slots in one gate domain. The
//! first holder turns the clock on and the last one turns it off. The count
//! and the edge calls happen under one lock, so no holder gets past
//! [`ClockGuard::acquire`] before the domain clock is actually on. A
//! [`ClockGuard`] holds both the slot's backend lock and one gate reference,
//! so only the holder touches registers.

use super::{HwIpId, HwIpOps};
use parking_lot::{Mutex, MutexGuard};
use std::ops::{Deref, DerefMut};
use tracing::{error, trace};

/// References above this are treated as a leak.
pub const MAX_CLOCK_REFS: i32 = 16;

/// Clock reference count for one gate domain.
#[derive(Debug, Default)]
pub struct ClockGate {
    refs: Mutex<i32>,
}

impl ClockGate {
    /// Gate with no references.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current reference count.
    #[must_use]
    pub fn refs(&self) -> i32 {
        *self.refs.lock()
    }

    /// Take a reference, turning the clock on through `ops` on the 0 → 1
    /// edge.
    fn get(&self, slot: HwIpId, ops: &mut dyn HwIpOps, is_close: bool) {
        let mut refs = self.refs.lock();
        if *refs >= MAX_CLOCK_REFS {
            error!(slot = ?slot, refs = *refs + 1, "clock gate reference overflow");
        }
        if *refs == 0 {
            trace!(slot = ?slot, "clock on");
            if let Err(e) = ops.clock_gate(true, is_close) {
                error!(slot = ?slot, error = %e, "clock gate on failed");
            }
        }
        *refs += 1;
    }

    /// Drop a reference, turning the clock off through `ops` on the 1 → 0
    /// edge.
    fn put(&self, slot: HwIpId, ops: &mut dyn HwIpOps, is_close: bool) {
        let mut refs = self.refs.lock();
        if *refs <= 0 {
            error!(slot = ?slot, refs = *refs - 1, "clock gate reference underflow");
            return;
        }
        if *refs == 1 {
            trace!(slot = ?slot, "clock off");
            if let Err(e) = ops.clock_gate(false, is_close) {
                error!(slot = ?slot, error = %e, "clock gate off failed");
            }
        }
        *refs -= 1;
    }
}

/// Backend access with the clock held on.
pub struct ClockGuard<'a> {
    slot: HwIpId,
    ops: MutexGuard<'a, Box<dyn HwIpOps>>,
    gate: &'a ClockGate,
    is_close: bool,
}

impl<'a> ClockGuard<'a> {
    pub(crate) fn acquire(
        slot: HwIpId,
        mut ops: MutexGuard<'a, Box<dyn HwIpOps>>,
        gate: &'a ClockGate,
        is_close: bool,
    ) -> Self {
        gate.get(slot, ops.as_mut(), is_close);
        Self {
            slot,
            ops,
            gate,
            is_close,
        }
    }
}

impl Deref for ClockGuard<'_> {
    type Target = dyn HwIpOps;

    fn deref(&self) -> &Self::Target {
        &**self.ops
    }
}

impl DerefMut for ClockGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.ops
    }
}

impl Drop for ClockGuard<'_> {
    fn drop(&mut self) {
        self.gate.put(self.slot, self.ops.as_mut(), self.is_close);
    }
}
