//! # ISP Scheduler Core Library
//!
//! Frame scheduling and completion tracking for a camera ISP built from a
//! chain of hardware blocks (pre-processor, ISP core, scaler, detector).
//! Callers submit frame requests; the scheduler programs each block of the
//! chain, follows frame-start/core-end/output-end interrupts, reports every
//! requested output exactly once and returns frames to the free pool.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: [`IspHardware`], the slot array with open/init/close,
//!   enable/disable, parameters, setfiles and diagnostics.
//! - **`sched`**: submission, late detection, config-lock and internal-frame
//!   synthesis.
//! - **`done`**: the interrupt-side completion demultiplexer.
//! - **`drain`**: force-stop of every queued frame at shutdown.
//! - **`chain`**: group topology and chain resolution.
//! - **`frame`** / **`framemgr`**: frame descriptors and the four-queue
//!   frame manager.
//! - **`hw`**: hardware slots, the backend trait and a simulated backend.
//! - **`notify`**: the bounded outward notification queue.
//! - **`setfile`**: tuning-file header parsing.
//! - **`config`** / **`logging`**: layered configuration and tracing setup.
//! - **`diag`**: per-frame timestamps and the debug ring.
//!
//! ## Example
//!
//! ```
//! use isp_sched::hw::sim::SimBlock;
//! use isp_sched::{FrameRequest, GroupId, HwIpId, IspHardware, SchedulerConfig};
//!
//! let (hw, _rx) = IspHardware::builder(SchedulerConfig::default())
//!     .slot(HwIpId::Isp0, SimBlock::new(HwIpId::Isp0).boxed())
//!     .build();
//! hw.bind_group(0, GroupId::Isp0, false)?;
//! hw.open(0, GroupId::Isp0)?;
//! let hw_map = hw.hw_map(0, GroupId::Isp0);
//! hw.submit(&FrameRequest::new(0, GroupId::Isp0, 1), &hw_map)?;
//! # Ok::<(), isp_sched::ScheduleError>(())
//! ```

pub mod bitset;
pub mod chain;
pub mod config;
pub mod diag;
pub mod done;
pub mod drain;
pub mod error;
pub mod frame;
pub mod framemgr;
pub mod hardware;
pub mod hw;
pub mod logging;
pub mod notify;
pub mod sched;
pub mod setfile;

pub use chain::{Chain, ChainResolver, GroupId, Link};
pub use config::SchedulerConfig;
pub use drain::ForceStopReport;
pub use error::{ConfigError, DoneError, HwOpError, NotifyError, ScheduleError, SetfileError, SynthError};
pub use frame::{DoneType, FrameHandle, FrameRequest, FrameState, FrameType, OutputId, ParamMask, ShotDesc};
pub use framemgr::CallerContext;
pub use hardware::{IspHardware, QueueSnapshot, SchedStats, StateDump};
pub use hw::{HwIpId, HwIpOps, HwIpSet};
pub use notify::{Notification, NotificationReceiver, NotifyCommand};
