//! # RingStream
//!
//! Accelerator command streams with completion listener threads and
//! deferred release of device buffers.
//!
//! A [`Stream`] wraps one ordered device queue. Host callbacks launched on
//! it are delivered on a dedicated listener thread started with
//! [`Stream::start_async_mode`]. Buffers registered with
//! [`Stream::add_buffer_ref`] are kept alive until the device has passed the
//! release barrier that follows the next launched callback, or until the
//! stream is synchronized.
//!
//! ## Quick Start
//!
//! ```ignore
//! use ringstream::prelude::*;
//!
//! let runtime = StreamRuntime::builder().build();
//! let stream = runtime.create_stream(0, LaunchPolicy::Default)?;
//! stream.start_async_mode()?;
//!
//! let buffer = DeviceBuffer::alloc(0, 1024);
//! stream.enqueue(move || { /* device work using the buffer */ })?;
//! stream.add_buffer_ref(buffer);
//! stream.launch_callback(|| println!("done"))?;
//! stream.synchronize()?;
//! stream.destroy()?;
//! ```
//!
//! ## Backends
//!
//! Streams run against any [`DeviceBackend`]. The CPU-simulated device from
//! `ringstream-cpu` is the default.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod context;
mod default_stream;
mod listener;
mod runtime;
mod stream;

pub use context::StreamContext;
pub use default_stream::{DefaultStreamProvider, DefaultStreamState};
pub use listener::ListenerState;
pub use runtime::{default_stream, global, install_global, StreamRuntime, StreamRuntimeBuilder};
pub use stream::{ErrorCodes, Stream, StreamState};

pub use ringstream_core::{
    BufferRegistry, CallbackMode, ChannelId, DeviceBackend, DeviceBuffer, DeviceContext, DeviceId,
    EntryStatus, ErrorCode, LaunchPolicy, ListenerId, QueueHandle, Result, RuntimeConfig,
    RuntimeConfigBuilder, StreamError, TrackedBuffer,
};
pub use ringstream_cpu::{SimDevice, SimDeviceConfig, SimDeviceConfigBuilder, SimFaults};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::runtime::default_stream;
    pub use crate::{
        DefaultStreamState, ErrorCodes, Stream, StreamContext, StreamRuntime, StreamState,
    };
    pub use ringstream_core::prelude::*;
    pub use ringstream_cpu::{SimDevice, SimDeviceConfig};
}
