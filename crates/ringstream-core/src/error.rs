//! Error types for stream, registry and device operations.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::device::DeviceId;

/// Result type alias for RingStream operations.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors produced by the stream runtime and its device backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Construction or registration failed.
    #[error("Initialization failed: {0}")]
    InitFailed(String),

    /// The listener thread was already started for this stream.
    #[error("Listener already started for queue {queue}")]
    RepeatInit {
        /// Raw queue handle of the stream.
        queue: u64,
    },

    /// A required function or queue handle was missing.
    #[error("Invalid pointer: {0}")]
    InvalidPointer(String),

    /// Waiting for the listener to attach exceeded the bound.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Registry state was torn down or inconsistent.
    #[error("Communication failure: {0}")]
    CommFailure(String),

    /// A host resource (thread, memory) could not be allocated.
    #[error("Allocation failed: {0}")]
    AllocFailed(String),

    /// The device failed to drain a queue.
    #[error("Synchronization failed: {0}")]
    SyncFailed(String),

    /// Device id outside the range reported by the backend.
    #[error("Invalid device id {id} (device count: {count})")]
    InvalidDevice {
        /// Requested device.
        id: DeviceId,
        /// Number of devices the backend exposes.
        count: u32,
    },

    /// A device primitive returned a failure.
    #[error("Device error: {0}")]
    Device(String),
}

impl StreamError {
    /// Stable error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InitFailed(_) => ErrorCode::InitFailed,
            Self::RepeatInit { .. } => ErrorCode::RepeatInit,
            Self::InvalidPointer(_) => ErrorCode::InvalidPointer,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::CommFailure(_) => ErrorCode::CommFailure,
            Self::AllocFailed(_) => ErrorCode::AllocFailed,
            Self::SyncFailed(_) => ErrorCode::SyncFailed,
            Self::InvalidDevice { .. } => ErrorCode::InvalidParam,
            Self::Device(_) => ErrorCode::DeviceFailure,
        }
    }

    /// Returns true for failures caused by torn-down or inconsistent registry state.
    pub fn is_comm_failure(&self) -> bool {
        matches!(self, Self::CommFailure(_))
    }
}

/// Numeric error codes recorded in a stream's error log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    /// See [`StreamError::InitFailed`].
    InitFailed = 1001,
    /// See [`StreamError::RepeatInit`].
    RepeatInit = 1002,
    /// See [`StreamError::InvalidPointer`].
    InvalidPointer = 1003,
    /// See [`StreamError::Timeout`].
    Timeout = 1004,
    /// See [`StreamError::CommFailure`].
    CommFailure = 1005,
    /// See [`StreamError::AllocFailed`].
    AllocFailed = 1006,
    /// See [`StreamError::SyncFailed`].
    SyncFailed = 1007,
    /// Invalid parameter such as an out-of-range device id.
    InvalidParam = 1008,
    /// See [`StreamError::Device`].
    DeviceFailure = 1009,
}

impl ErrorCode {
    /// Raw numeric value.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Short human readable description.
    pub fn description(self) -> &'static str {
        match self {
            Self::InitFailed => "initialization failed",
            Self::RepeatInit => "repeated initialization",
            Self::InvalidPointer => "invalid pointer",
            Self::Timeout => "operation timed out",
            Self::CommFailure => "communication failure",
            Self::AllocFailed => "allocation failed",
            Self::SyncFailed => "synchronization failed",
            Self::InvalidParam => "invalid parameter",
            Self::DeviceFailure => "device failure",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.as_u32())
    }
}

impl From<&StreamError> for ErrorCode {
    fn from(err: &StreamError) -> Self {
        err.code()
    }
}
