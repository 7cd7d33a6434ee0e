//! Device abstraction consumed by streams.
//!
//! A [`DeviceBackend`] exposes the handful of primitives a stream needs:
//! per-thread context binding, ordered queues, host callbacks delivered to
//! subscribed listener threads, and drain waits. Backends are expected to
//! execute the work of one queue in strict submission order.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{Result, StreamError};

/// Device ordinal.
pub type DeviceId = u32;

/// Opaque handle to a device command queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueHandle(u64);

impl QueueHandle {
    /// Wrap a raw backend handle.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw backend handle.
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// Identity of a listener thread subscribed to queue callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

impl ListenerId {
    /// Allocate a process-unique listener id.
    pub fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value.
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Secondary processing channel attached to a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u32);

/// Execution context a thread is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceContext {
    /// Device the context belongs to.
    pub device_id: DeviceId,
}

impl DeviceContext {
    /// Context for the given device.
    pub const fn new(device_id: DeviceId) -> Self {
        Self { device_id }
    }
}

/// Queue launch policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum LaunchPolicy {
    /// Backend default behavior.
    Default = 0,
    /// Optimize for launch latency.
    FastLaunch = 1,
    /// Optimize for synchronization latency.
    FastSync = 2,
    /// Launches are synchronous with respect to the queue.
    #[default]
    LaunchSync = 3,
}

impl LaunchPolicy {
    /// All supported policies.
    pub const ALL: [LaunchPolicy; 4] = [
        LaunchPolicy::Default,
        LaunchPolicy::FastLaunch,
        LaunchPolicy::FastSync,
        LaunchPolicy::LaunchSync,
    ];

    /// Validate a raw policy flag.
    pub fn from_raw(raw: u32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| *p as u32 == raw)
            .ok_or_else(|| {
                StreamError::InitFailed(format!("launch policy {} is out of range", raw))
            })
    }
}

/// How the device treats a queue while a host callback runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackMode {
    /// The queue waits until the listener has run the callback.
    Blocking,
    /// The queue hands the callback off and keeps executing.
    NonBlocking,
}

/// Owned host-side closure. The backend runs it at most once and drops it
/// exactly once.
pub type HostCallback = Box<dyn FnOnce() + Send + 'static>;

/// Primitives a device must provide to back a stream.
pub trait DeviceBackend: Send + Sync {
    /// Backend name for diagnostics.
    fn name(&self) -> &str;

    /// Number of addressable devices.
    fn device_count(&self) -> u32;

    /// Validate a device id.
    fn check_device_id(&self, id: DeviceId) -> Result<()> {
        let count = self.device_count();
        if id < count {
            Ok(())
        } else {
            Err(StreamError::InvalidDevice { id, count })
        }
    }

    /// Bind the calling thread to a device context.
    fn set_device(&self, ctx: DeviceContext) -> Result<()>;

    /// Context bound to the calling thread.
    fn current_device(&self) -> Result<DeviceContext>;

    /// Allocate a queue on the calling thread's device.
    fn create_queue(&self, policy: LaunchPolicy) -> Result<QueueHandle>;

    /// Release a queue. Pending work is discarded.
    fn destroy_queue(&self, queue: QueueHandle) -> Result<()>;

    /// Block until every operation submitted to the queue has completed.
    fn synchronize_queue(&self, queue: QueueHandle) -> Result<()>;

    /// Submit host-side work executed in queue order.
    fn submit(&self, queue: QueueHandle, work: HostCallback) -> Result<()>;

    /// Enqueue a callback delivered to the listener subscribed to `queue`.
    fn launch_callback(
        &self,
        queue: QueueHandle,
        callback: HostCallback,
        mode: CallbackMode,
    ) -> Result<()>;

    /// Route callbacks of `queue` to `listener`.
    fn subscribe(&self, listener: ListenerId, queue: QueueHandle) -> Result<()>;

    /// Stop routing callbacks of `queue` to `listener`.
    fn unsubscribe(&self, listener: ListenerId, queue: QueueHandle) -> Result<()>;

    /// Run callbacks pending for `listener`, waiting at most `timeout` for
    /// the first one. Returns the number of callbacks run.
    fn process_pending(&self, listener: ListenerId, timeout: Duration) -> Result<usize>;

    /// Whether secondary channels are available.
    fn supports_channels(&self) -> bool {
        false
    }

    /// Allocate a secondary channel on `device`.
    fn create_channel(&self, device: DeviceId) -> Result<ChannelId> {
        Err(StreamError::Device(format!(
            "{} does not support channels (device {})",
            self.name(),
            device
        )))
    }

    /// Release a secondary channel.
    fn destroy_channel(&self, _channel: ChannelId) -> Result<()> {
        Ok(())
    }
}
