//! Frame managers and the per-slot frame set guard.
//!
//! A [`FrameManager`] owns a fixed array of frames and four ordered queues
//! (Free, Requested, In-Flight, Completed). Every frame index is in exactly
//! one queue; [`FrameManager::trans`] is the only way to move it.
//!
//! Each hardware slot has one [`FrameSet`]: a primary manager and a late
//! manager behind a single mutex, so moves between any two queues of the slot
//! are atomic. The lock is taken with an explicit [`CallerContext`].

use crate::frame::{Frame, FrameState};
use crate::hw::HwIpId;
use parking_lot::{Mutex, MutexGuard};
use std::cell::Cell;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use tracing::{error, warn};

/// Who is acquiring a frame set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerContext {
    /// Worker/process context; may be preempted by the slot's interrupt.
    Process,
    /// Interrupt handler; must not be entered while interrupts are masked.
    Interrupt,
}

thread_local! {
    static IRQ_MASK_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Whether the current thread holds a process-context frame set guard.
#[must_use]
pub fn local_irq_masked() -> bool {
    IRQ_MASK_DEPTH.with(|d| d.get() > 0)
}

/// Fixed pool of frames threaded through four queues.
#[derive(Debug)]
pub struct FrameManager {
    name: String,
    frames: Vec<Frame>,
    queues: [VecDeque<usize>; 4],
}

impl FrameManager {
    /// Manager with `count` frames, all Free.
    #[must_use]
    pub fn new(name: impl Into<String>, count: usize) -> Self {
        let frames: Vec<Frame> = (0..count).map(Frame::new).collect();
        let mut queues: [VecDeque<usize>; 4] = Default::default();
        queues[FrameState::Free.index()].extend(0..count);
        Self {
            name: name.into(),
            frames,
            queues,
        }
    }

    /// Manager name used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total frames owned.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Frames in `state`.
    #[must_use]
    pub fn count(&self, state: FrameState) -> usize {
        self.queues[state.index()].len()
    }

    /// Frames of `instance` in `state`.
    #[must_use]
    pub fn count_instance(&self, state: FrameState, instance: u32) -> usize {
        self.iter(state).filter(|f| f.instance == instance).count()
    }

    /// Oldest frame in `state`.
    #[must_use]
    pub fn peek(&self, state: FrameState) -> Option<usize> {
        self.queues[state.index()].front().copied()
    }

    /// Oldest frame of `instance` in `state`.
    #[must_use]
    pub fn peek_instance(&self, state: FrameState, instance: u32) -> Option<usize> {
        self.iter(state).find(|f| f.instance == instance).map(|f| f.index)
    }

    /// First Free frame, if any.
    #[must_use]
    pub fn get_free(&self) -> Option<usize> {
        self.peek(FrameState::Free)
    }

    /// Frame of `instance` carrying `fcount` in `state`.
    #[must_use]
    pub fn find_fcount(&self, state: FrameState, instance: u32, fcount: u32) -> Option<usize> {
        self.iter(state)
            .find(|f| f.instance == instance && f.fcount == fcount)
            .map(|f| f.index)
    }

    /// Frames in `state`, oldest first.
    pub fn iter(&self, state: FrameState) -> impl Iterator<Item = &Frame> + '_ {
        self.queues[state.index()]
            .iter()
            .map(move |&i| &self.frames[i])
    }

    /// Frame by index.
    #[must_use]
    pub fn frame(&self, index: usize) -> &Frame {
        &self.frames[index]
    }

    pub(crate) fn frame_mut(&mut self, index: usize) -> &mut Frame {
        &mut self.frames[index]
    }

    /// Move frame `index` to the tail of `to`.
    pub(crate) fn trans(&mut self, index: usize, to: FrameState) {
        let from = self.frames[index].state;
        let queue = &mut self.queues[from.index()];
        match queue.iter().position(|&i| i == index) {
            Some(pos) => {
                queue.remove(pos);
            }
            None => {
                error!(
                    manager = %self.name,
                    index,
                    from = from.name(),
                    "frame missing from its queue"
                );
            }
        }

        if to != FrameState::Free {
            let (fcount, instance) = (self.frames[index].fcount, self.frames[index].instance);
            let tail = self.queues[to.index()]
                .iter()
                .rev()
                .map(|&i| &self.frames[i])
                .find(|f| f.instance == instance);
            if let Some(tail) = tail {
                if tail.fcount > fcount {
                    warn!(
                        manager = %self.name,
                        queue = to.name(),
                        tail = tail.fcount,
                        fcount,
                        "fcount order break"
                    );
                }
            }
        }

        self.queues[to.index()].push_back(index);
        self.frames[index].state = to;
    }

    /// Every frame sits in exactly one queue, matching its recorded state.
    #[must_use]
    pub fn check_membership(&self) -> bool {
        let mut seen = vec![0u32; self.frames.len()];
        for state in FrameState::ALL {
            for &i in &self.queues[state.index()] {
                if i >= seen.len() || self.frames[i].state != state {
                    return false;
                }
                seen[i] += 1;
            }
        }
        seen.iter().all(|&n| n == 1)
    }

    /// Log queue contents.
    pub fn dump(&self) {
        for state in FrameState::ALL {
            let fcounts: Vec<u32> = self.iter(state).map(|f| f.fcount).collect();
            error!(
                manager = %self.name,
                queue = state.name(),
                count = fcounts.len(),
                fcounts = ?fcounts,
                "frame queue"
            );
        }
    }
}

/// Which manager of a set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetKind {
    /// Primary queues
    Main,
    /// Late queues
    Late,
}

/// Primary and late managers of one slot.
#[derive(Debug)]
pub struct FrameQueues {
    /// Primary queues
    pub main: FrameManager,
    /// Frames submitted after hardware passed their fcount
    pub late: FrameManager,
}

impl FrameQueues {
    /// Manager by kind.
    #[must_use]
    pub fn get(&self, kind: SetKind) -> &FrameManager {
        match kind {
            SetKind::Main => &self.main,
            SetKind::Late => &self.late,
        }
    }

    /// Mutable manager by kind.
    pub fn get_mut(&mut self, kind: SetKind) -> &mut FrameManager {
        match kind {
            SetKind::Main => &mut self.main,
            SetKind::Late => &mut self.late,
        }
    }
}

/// One slot's frame queues behind a context-aware lock.
#[derive(Debug)]
pub struct FrameSet {
    owner: HwIpId,
    inner: Mutex<FrameQueues>,
}

impl FrameSet {
    /// Frame set for `owner` with the given pool sizes.
    #[must_use]
    pub fn new(owner: HwIpId, frames: usize, late_frames: usize) -> Self {
        Self {
            owner,
            inner: Mutex::new(FrameQueues {
                main: FrameManager::new(owner.name(), frames),
                late: FrameManager::new(format!("{}-late", owner.name()), late_frames),
            }),
        }
    }

    /// Slot owning this set.
    #[must_use]
    pub fn owner(&self) -> HwIpId {
        self.owner
    }

    /// Acquire the set.
    ///
    /// `Process` masks local interrupt delivery for the guard's lifetime.
    /// `Interrupt` must not run while the current thread has them masked.
    pub fn lock(&self, ctx: CallerContext) -> FrameGuard<'_> {
        match ctx {
            CallerContext::Process => IRQ_MASK_DEPTH.with(|d| d.set(d.get() + 1)),
            CallerContext::Interrupt => {
                if local_irq_masked() {
                    error!(slot = ?self.owner, "interrupt-context lock taken with interrupts masked");
                }
            }
        }
        FrameGuard {
            guard: self.inner.lock(),
            ctx,
        }
    }
}

/// Exclusive access to a [`FrameQueues`].
pub struct FrameGuard<'a> {
    guard: MutexGuard<'a, FrameQueues>,
    ctx: CallerContext,
}

impl FrameGuard<'_> {
    /// Context the guard was taken in.
    #[must_use]
    pub fn context(&self) -> CallerContext {
        self.ctx
    }
}

impl Deref for FrameGuard<'_> {
    type Target = FrameQueues;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for FrameGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        if self.ctx == CallerContext::Process {
            IRQ_MASK_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
        }
    }
}
