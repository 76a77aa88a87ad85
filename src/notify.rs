//! Outward notifications.
//!
//! The interrupt path posts [`Notification`]s into a bounded queue consumed
//! by the stream layer. Posting never blocks: a full queue gets exactly one
//! retry before the record is dropped and counted.

use crate::chain::GroupId;
use crate::error::NotifyError;
use crate::frame::{DoneType, OutputId};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::warn;

/// Kind of notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NotifyCommand {
    /// One output finished
    FrameDone,
    /// One output failed or was retired
    FrameNotDone,
    /// Whole shot finished
    ShotDone,
    /// Whole shot failed or was retired
    ShotNotDone,
}

impl NotifyCommand {
    /// Per-output command for `done`.
    #[must_use]
    pub fn frame(done: DoneType) -> Self {
        match done {
            DoneType::Done => NotifyCommand::FrameDone,
            DoneType::NotDone => NotifyCommand::FrameNotDone,
        }
    }

    /// Per-shot command for `done`.
    #[must_use]
    pub fn shot(done: DoneType) -> Self {
        match done {
            DoneType::Done => NotifyCommand::ShotDone,
            DoneType::NotDone => NotifyCommand::ShotNotDone,
        }
    }
}

/// One outward record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    /// What happened
    pub command: NotifyCommand,
    /// Stream instance
    pub instance: u32,
    /// Owning group
    pub group: GroupId,
    /// Output entry, for per-output commands
    pub output: Option<OutputId>,
    /// Frame number
    pub fcount: u32,
    /// Request ordinal
    pub rcount: u32,
    /// Hardware status code; zero on success
    pub status: i32,
}

/// Producer half; cheap to clone.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Notification>,
    posted: Arc<AtomicU64>,
    lost: Arc<AtomicU64>,
}

/// Consumer half.
#[derive(Debug)]
pub struct NotificationReceiver {
    rx: mpsc::Receiver<Notification>,
}

/// Bounded notification queue holding `capacity` records.
#[must_use]
pub fn channel(capacity: usize) -> (Notifier, NotificationReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        Notifier {
            tx,
            posted: Arc::new(AtomicU64::new(0)),
            lost: Arc::new(AtomicU64::new(0)),
        },
        NotificationReceiver { rx },
    )
}

impl Notifier {
    /// Post `note`, retrying once if the queue is full.
    pub fn post(&self, note: Notification) -> Result<(), NotifyError> {
        let note = match self.tx.try_send(note) {
            Ok(()) => {
                self.posted.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(TrySendError::Closed(_)) => return self.drop_note(NotifyError::Closed),
            Err(TrySendError::Full(note)) => note,
        };

        std::hint::spin_loop();
        match self.tx.try_send(note) {
            Ok(()) => {
                self.posted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(note)) => {
                warn!(
                    command = ?note.command,
                    instance = note.instance,
                    fcount = note.fcount,
                    "notification pool exhausted"
                );
                self.drop_note(NotifyError::PoolExhausted)
            }
            Err(TrySendError::Closed(_)) => self.drop_note(NotifyError::Closed),
        }
    }

    fn drop_note(&self, err: NotifyError) -> Result<(), NotifyError> {
        self.lost.fetch_add(1, Ordering::Relaxed);
        Err(err)
    }

    /// Records delivered to the queue.
    #[must_use]
    pub fn posted(&self) -> u64 {
        self.posted.load(Ordering::Relaxed)
    }

    /// Records dropped.
    #[must_use]
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }
}

impl NotificationReceiver {
    /// Next record; `None` once every producer is gone.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    /// Next record if one is queued.
    pub fn try_recv(&mut self) -> Option<Notification> {
        match self.rx.try_recv() {
            Ok(note) => Some(note),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Every queued record.
    pub fn drain(&mut self) -> Vec<Notification> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(fcount: u32) -> Notification {
        Notification {
            command: NotifyCommand::ShotDone,
            instance: 0,
            group: GroupId::Taa0,
            output: None,
            fcount,
            rcount: 0,
            status: 0,
        }
    }

    #[test]
    fn test_post_and_drain() {
        let (tx, mut rx) = channel(4);
        tx.post(note(1)).unwrap();
        tx.post(note(2)).unwrap();
        let fcounts: Vec<u32> = rx.drain().iter().map(|n| n.fcount).collect();
        assert_eq!(fcounts, vec![1, 2]);
        assert_eq!(tx.posted(), 2);
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn test_full_queue_reports_exhaustion() {
        let (tx, mut rx) = channel(1);
        tx.post(note(1)).unwrap();
        assert_eq!(tx.post(note(2)), Err(NotifyError::PoolExhausted));
        assert_eq!(tx.lost(), 1);
        assert_eq!(rx.drain().len(), 1);
        tx.post(note(3)).unwrap();
    }

    #[test]
    fn test_closed_queue() {
        let (tx, rx) = channel(2);
        drop(rx);
        assert_eq!(tx.post(note(1)), Err(NotifyError::Closed));
        assert_eq!(tx.lost(), 1);
    }

    #[tokio::test]
    async fn test_async_recv() {
        let (tx, mut rx) = channel(2);
        let producer = tokio::spawn(async move {
            tx.post(note(7)).unwrap();
        });
        let got = rx.recv().await.unwrap();
        assert_eq!(got.fcount, 7);
        producer.await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_recv_after_close_drains_backlog() {
        let (tx, mut rx) = channel(2);
        tx.post(note(3)).unwrap();
        drop(tx);
        assert_eq!(tokio_test::block_on(rx.recv()).map(|n| n.fcount), Some(3));
        assert!(tokio_test::block_on(rx.recv()).is_none());
    }

    #[test]
    fn test_command_mapping() {
        assert_eq!(NotifyCommand::frame(DoneType::NotDone), NotifyCommand::FrameNotDone);
        assert_eq!(NotifyCommand::shot(DoneType::Done), NotifyCommand::ShotDone);
    }
}
