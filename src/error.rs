//! Error types for the ISP scheduler.
//!
//! Errors are layered by concern. Backend operations fail with [`HwOpError`],
//! which submission and lifecycle paths wrap into [`ScheduleError`] together
//! with the slot that failed. Interrupt-side protocol violations are
//! [`DoneError`]s; they are returned to the interrupt caller, which decides
//! whether to escalate to a force-stop.

use crate::chain::GroupId;
use crate::hw::HwIpId;
use thiserror::Error;

/// Failure reported by a hardware-operations backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{op} failed (code {code}): {message}")]
pub struct HwOpError {
    /// Backend operation that failed (`shot`, `open`, ...).
    pub op: &'static str,
    /// Backend-specific error code.
    pub code: i32,
    /// Human-readable detail.
    pub message: String,
}

impl HwOpError {
    /// Create a new backend error.
    pub fn new(op: &'static str, code: i32, message: impl Into<String>) -> Self {
        Self {
            op,
            code,
            message: message.into(),
        }
    }
}

/// Errors returned by submission, lifecycle and configuration paths.
#[derive(Error, Debug)]
pub enum ScheduleError {
    /// Group id has no slot bound for this instance
    #[error("group {group:?} is not bound for instance {instance}")]
    InvalidGroup {
        /// Stream instance
        instance: u32,
        /// Group that was not found
        group: GroupId,
    },

    /// Instance index out of range
    #[error("invalid instance {instance}: at most {max} instances")]
    InvalidInstance {
        /// Requested instance
        instance: u32,
        /// Number of instances supported
        max: u32,
    },

    /// Slot not populated in this hardware
    #[error("hardware slot {slot:?} is not present")]
    InvalidSlot {
        /// Missing slot
        slot: HwIpId,
    },

    /// Slot must be opened first
    #[error("hardware slot {slot:?} is not opened for instance {instance}")]
    NotOpened {
        /// Slot that is closed
        slot: HwIpId,
        /// Instance without a reference
        instance: u32,
    },

    /// Free queue exhausted
    #[error("no free frame on {slot:?}")]
    NoFreeFrame {
        /// Leader whose frame set is full
        slot: HwIpId,
    },

    /// Handle no longer names a requested frame
    #[error("frame {fcount} is no longer requested on {slot:?}")]
    StaleHandle {
        /// Leader that owns the frame set
        slot: HwIpId,
        /// Frame count carried by the handle
        fcount: u32,
    },

    /// Backend call failed; the whole chain step is aborted
    #[error("hardware operation failed on {slot:?}: {source}")]
    HardwareOpFailed {
        /// Slot whose backend failed
        slot: HwIpId,
        /// Backend error
        #[source]
        source: HwOpError,
    },

    /// Tuning file could not be parsed
    #[error("setfile error: {0}")]
    Setfile(#[from] SetfileError),

    /// Scenario not present in the loaded setfile table
    #[error("scenario {scenario} has no setfile on {slot:?}")]
    UnknownScenario {
        /// Slot whose table was searched
        slot: HwIpId,
        /// Requested scenario
        scenario: u32,
    },
}

impl ScheduleError {
    /// Configuration errors are fatal to the call and never retried.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            ScheduleError::InvalidGroup { .. }
                | ScheduleError::InvalidInstance { .. }
                | ScheduleError::InvalidSlot { .. }
        )
    }

    /// Backend failure; caller is expected to force-stop the chain.
    #[must_use]
    pub fn is_hardware(&self) -> bool {
        matches!(self, ScheduleError::HardwareOpFailed { .. })
    }

    /// Slot that failed, if this is a hardware failure.
    #[must_use]
    pub fn failed_slot(&self) -> Option<HwIpId> {
        match self {
            ScheduleError::HardwareOpFailed { slot, .. } => Some(*slot),
            _ => None,
        }
    }
}

/// Errors from internal-frame synthesis.
#[derive(Error, Debug)]
pub enum SynthError {
    /// A frame with this fcount is already in flight or completed
    #[error("frame {fcount} already exists on {slot:?}")]
    AlreadyExists {
        /// Chain leader
        slot: HwIpId,
        /// Frame count already scheduled
        fcount: u32,
    },

    /// Free queue exhausted
    #[error("no free frame on {slot:?} for internal shot")]
    NoFreeFrame {
        /// Leader whose frame set is full
        slot: HwIpId,
    },

    /// Driving the synthesized frame failed
    #[error(transparent)]
    Drive(#[from] ScheduleError),
}

/// Protocol violations detected on the interrupt path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DoneError {
    /// A queue that must hold a frame at this checkpoint was empty
    #[error("{queue} queue empty on {slot:?} (instance {instance})")]
    EmptyQueue {
        /// Slot that took the interrupt
        slot: HwIpId,
        /// Stream instance
        instance: u32,
        /// Name of the empty queue
        queue: &'static str,
    },

    /// No frame matches the hardware-reported fcount
    #[error("frame {fcount} not found on {slot:?} (instance {instance})")]
    FrameNotFound {
        /// Slot that took the interrupt
        slot: HwIpId,
        /// Stream instance
        instance: u32,
        /// Frame count reported by hardware
        fcount: u32,
    },

    /// Slot not populated
    #[error("hardware slot {slot:?} is not present")]
    InvalidSlot {
        /// Missing slot
        slot: HwIpId,
    },

    /// Instance index out of range
    #[error("invalid instance {instance}")]
    InvalidInstance {
        /// Requested instance
        instance: u32,
    },

    /// Slot has no chain bound for the instance
    #[error("{slot:?} has no chain bound for instance {instance}")]
    NotBound {
        /// Slot that took the interrupt
        slot: HwIpId,
        /// Stream instance
        instance: u32,
    },
}

impl DoneError {
    /// Whether this is a queue/fcount protocol violation rather than a
    /// misaddressed interrupt.
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            DoneError::EmptyQueue { .. } | DoneError::FrameNotFound { .. }
        )
    }
}

/// Failure to post an outward notification.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyError {
    /// Pool still full after the retry
    #[error("notification pool exhausted")]
    PoolExhausted,

    /// Consumer has gone away
    #[error("notification queue closed")]
    Closed,
}

/// Tuning-file header parse failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SetfileError {
    /// Leading magic matches neither known layout
    #[error("unknown setfile magic {magic:#010x}")]
    BadMagic {
        /// Leading word of the buffer
        magic: u32,
    },

    /// Buffer ended inside the header
    #[error("setfile header truncated at byte {at} (need {need} more)")]
    Truncated {
        /// Offset where reading stopped
        at: usize,
        /// Bytes still required
        need: usize,
    },

    /// A table entry points outside the buffer
    #[error("setfile entry {index} for hw {hw_id} out of bounds: offset {offset:#x} size {size:#x} (buffer {len:#x})")]
    OutOfBounds {
        /// Hardware number of the table
        hw_id: u32,
        /// Entry index within the table
        index: usize,
        /// Entry offset
        offset: u32,
        /// Entry size
        size: u32,
        /// Buffer length
        len: usize,
    },

    /// Header names a hardware block this build does not know
    #[error("unknown hardware id {hw_id} in setfile")]
    UnknownHwIp {
        /// Hardware number found
        hw_id: u32,
    },
}

/// Configuration loading or validation failure.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Figment could not extract the configuration
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    /// Configuration loaded but is inconsistent
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScheduleError::HardwareOpFailed {
            slot: HwIpId::Isp0,
            source: HwOpError::new("shot", -5, "register write timeout"),
        };
        assert_eq!(
            err.to_string(),
            "hardware operation failed on Isp0: shot failed (code -5): register write timeout"
        );
        assert!(err.is_hardware());
        assert_eq!(err.failed_slot(), Some(HwIpId::Isp0));

        let err = SetfileError::BadMagic { magic: 0x1234 };
        assert_eq!(err.to_string(), "unknown setfile magic 0x00001234");
    }

    #[test]
    fn test_error_classification() {
        let err = ScheduleError::InvalidGroup {
            instance: 0,
            group: GroupId::Mcs0,
        };
        assert!(err.is_configuration());
        assert!(!err.is_hardware());
        assert_eq!(err.failed_slot(), None);

        let done = DoneError::FrameNotFound {
            slot: HwIpId::Taa0,
            instance: 1,
            fcount: 9,
        };
        assert!(done.is_protocol_violation());
        assert!(!DoneError::InvalidInstance { instance: 7 }.is_protocol_violation());
    }

    #[test]
    fn test_setfile_error_conversion() {
        let err: ScheduleError = SetfileError::Truncated { at: 4, need: 4 }.into();
        assert!(matches!(err, ScheduleError::Setfile(_)));
    }
}
