//! # RingStream Core
//!
//! Core traits and types for the RingStream accelerator command-stream
//! runtime.
//!
//! ## Core Abstractions
//!
//! - [`DeviceBackend`] - Primitives a device must provide (queues, host
//!   callbacks, listener subscription, context binding)
//! - [`BufferRegistry`] - Per-stream list of buffers awaiting release
//! - [`DeviceBuffer`] - Shared handle to device memory
//! - [`RuntimeConfig`] - Listener and default-stream settings
//! - [`StreamError`] - Error taxonomy with stable [`ErrorCode`]s

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod registry;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::buffer::{DeviceBuffer, TrackedBuffer};
    pub use crate::config::{RuntimeConfig, RuntimeConfigBuilder};
    pub use crate::device::{
        CallbackMode, ChannelId, DeviceBackend, DeviceContext, DeviceId, HostCallback,
        LaunchPolicy, ListenerId, QueueHandle,
    };
    pub use crate::error::{ErrorCode, Result, StreamError};
    pub use crate::registry::{BufferRegistry, EntryStatus};
}

// Re-exports for convenience
pub use buffer::{DeviceBuffer, TrackedBuffer};
pub use config::{RuntimeConfig, RuntimeConfigBuilder};
pub use device::{
    CallbackMode, ChannelId, DeviceBackend, DeviceContext, DeviceId, HostCallback, LaunchPolicy,
    ListenerId, QueueHandle,
};
pub use error::{ErrorCode, Result, StreamError};
pub use registry::{BufferRegistry, EntryStatus};
