//! Device command streams.
//!
//! A [`Stream`] owns one ordered device queue. Work and host callbacks
//! submitted to it complete in submission order. Once
//! [`start_async_mode`](Stream::start_async_mode) has attached a listener
//! thread, callbacks are delivered on that thread.
//!
//! # Deferred buffer release
//!
//! Buffers used by enqueued work are registered with
//! [`add_buffer_ref`](Stream::add_buffer_ref). Every
//! [`launch_callback`](Stream::launch_callback) enqueues a second, internal
//! callback right behind the caller's that captures the most recently
//! registered buffer. When the device reaches it, that buffer and everything
//! registered before it are released together. [`synchronize`](Stream::synchronize)
//! releases everything.
//!
//! ```text
//! Uninitialized --create--> Ready --start_async_mode--> Listening
//!                             |                            |
//!                             +---------destroy------------+--> TornDown
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use ringstream_core::buffer::DeviceBuffer;
use ringstream_core::device::{
    CallbackMode, ChannelId, DeviceContext, DeviceId, LaunchPolicy, QueueHandle,
};
use ringstream_core::error::{ErrorCode, Result, StreamError};

use crate::context::StreamContext;
use crate::listener::{Listener, ListenerState};

/// Lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Queue allocated, no listener.
    Ready,
    /// Listener attached.
    Listening,
    /// Destroyed. Terminal.
    TornDown,
}

/// The two error slots of a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorCodes {
    /// First error recorded.
    pub first: Option<ErrorCode>,
    /// Latest error recorded after the first.
    pub second: Option<ErrorCode>,
}

struct StreamInner {
    queue: Option<QueueHandle>,
    channel: Option<ChannelId>,
    listener: Option<Listener>,
    /// Set by `destroy` before it drains; no new work is accepted after.
    tearing_down: bool,
}

impl StreamInner {
    fn accepting(&self, op: &str) -> Result<QueueHandle> {
        match self.queue {
            Some(queue) if !self.tearing_down => Ok(queue),
            _ => {
                error!(op, "stream is destroyed or being torn down");
                Err(StreamError::InvalidPointer(format!(
                    "{}: stream is destroyed",
                    op
                )))
            }
        }
    }
}

/// Ordered command queue on one device.
pub struct Stream {
    ctx: StreamContext,
    device_id: DeviceId,
    policy: LaunchPolicy,
    is_default: bool,
    inner: Mutex<StreamInner>,
    /// Serializes `start_async_mode` and `destroy`.
    lifecycle: Mutex<()>,
    errors: Mutex<ErrorCodes>,
}

impl Stream {
    /// Create a stream on `device_id`.
    ///
    /// Binds the calling thread to the device, allocates the queue and
    /// registers it with the buffer registry. Any failure is reported as
    /// [`StreamError::InitFailed`] and no stream is produced.
    pub fn create(ctx: &StreamContext, device_id: DeviceId, policy: LaunchPolicy) -> Result<Self> {
        Self::build(ctx, device_id, policy, false)
    }

    /// Create a stream from a raw launch-policy flag.
    pub fn with_flags(ctx: &StreamContext, device_id: DeviceId, flags: u32) -> Result<Self> {
        let policy = LaunchPolicy::from_raw(flags).map_err(|e| {
            error!(device_id, flags, "launch policy out of range");
            e
        })?;
        Self::create(ctx, device_id, policy)
    }

    pub(crate) fn create_default(ctx: &StreamContext, device_id: DeviceId) -> Result<Self> {
        Self::build(ctx, device_id, ctx.config().default_launch_policy, true)
    }

    fn build(
        ctx: &StreamContext,
        device_id: DeviceId,
        policy: LaunchPolicy,
        is_default: bool,
    ) -> Result<Self> {
        let device = ctx.device();
        let init = |what: &str, e: StreamError| {
            error!(device_id, error = %e, "{}", what);
            StreamError::InitFailed(format!("{}: {}", what, e))
        };

        device
            .check_device_id(device_id)
            .map_err(|e| init("device id is out of range", e))?;
        device
            .set_device(DeviceContext::new(device_id))
            .map_err(|e| init("failed to bind device context", e))?;
        let queue = device
            .create_queue(policy)
            .map_err(|e| init("failed to create queue", e))?;

        if let Err(e) = ctx.registry().add_stream(queue) {
            if let Err(destroy) = device.destroy_queue(queue) {
                warn!(%queue, error = %destroy, "failed to release queue after registration failure");
            }
            return Err(init("failed to register stream", e));
        }

        debug!(%queue, device_id, ?policy, is_default, "created stream");
        Ok(Self {
            ctx: ctx.clone(),
            device_id,
            policy,
            is_default,
            inner: Mutex::new(StreamInner {
                queue: Some(queue),
                channel: None,
                listener: None,
                tearing_down: false,
            }),
            lifecycle: Mutex::new(()),
            errors: Mutex::new(ErrorCodes::default()),
        })
    }

    /// Device this stream runs on.
    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Launch policy the queue was created with.
    pub fn policy(&self) -> LaunchPolicy {
        self.policy
    }

    /// Whether this is the process-wide default stream.
    pub fn is_default(&self) -> bool {
        self.is_default
    }

    /// Queue handle, `None` once destroyed.
    pub fn queue(&self) -> Option<QueueHandle> {
        self.inner.lock().queue
    }

    /// Whether the queue is still allocated.
    pub fn is_alive(&self) -> bool {
        self.queue().is_some()
    }

    /// Secondary channel, if one was created.
    pub fn channel(&self) -> Option<ChannelId> {
        self.inner.lock().channel
    }

    /// Whether a listener thread is attached.
    pub fn has_listener(&self) -> bool {
        self.inner.lock().listener.is_some()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        let inner = self.inner.lock();
        match (&inner.queue, &inner.listener) {
            (None, _) => StreamState::TornDown,
            (Some(_), Some(_)) => StreamState::Listening,
            (Some(_), None) => StreamState::Ready,
        }
    }

    /// Context this stream was created against.
    pub fn context(&self) -> &StreamContext {
        &self.ctx
    }

    fn live_queue(&self, op: &str) -> Result<QueueHandle> {
        self.queue().ok_or_else(|| {
            error!(op, "stream queue is null");
            StreamError::InvalidPointer(format!("{}: stream is destroyed", op))
        })
    }

    /// Attach a listener thread that receives this stream's callbacks.
    ///
    /// Fails with [`StreamError::RepeatInit`] if a listener already exists.
    /// If the listener does not bind its device context within the
    /// configured window the thread is reclaimed and
    /// [`StreamError::Timeout`] is returned; the stream stays usable.
    ///
    /// The stream's state lock is not held while waiting for the listener,
    /// so accessors such as [`queue`](Self::queue) do not block.
    pub fn start_async_mode(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        let queue = {
            let inner = self.inner.lock();
            let queue = inner.accepting("start_async_mode")?;
            if inner.listener.is_some() {
                error!(%queue, "listener already started");
                return Err(StreamError::RepeatInit {
                    queue: queue.as_raw(),
                });
            }
            queue
        };

        let device = self.ctx.device();
        let config = self.ctx.config();
        let listener = Listener::spawn(&self.ctx, self.device_id)?;

        if let Err(e) = device.subscribe(listener.id(), queue) {
            error!(%queue, error = %e, "failed to subscribe listener");
            listener.stop();
            return Err(e);
        }

        if !listener.wait_attached(config.attach_attempts, config.attach_poll_interval) {
            let id = listener.id();
            warn!(%queue, state = ?listener.state(), "listener did not attach in time");
            listener.stop();
            if let Err(e) = device.unsubscribe(id, queue) {
                warn!(%queue, error = %e, "failed to unsubscribe timed out listener");
            }
            return Err(StreamError::Timeout(config.attach_timeout()));
        }

        info!(%queue, listener = %listener.id(), "async mode started");
        self.inner.lock().listener = Some(listener);
        Ok(())
    }

    /// Submit host-side work executed in queue order.
    pub fn enqueue<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = self.inner.lock();
        let queue = inner.accepting("enqueue")?;
        self.ctx.device().submit(queue, Box::new(work))
    }

    /// Enqueue `callback` and a release barrier behind it.
    ///
    /// The barrier captures the buffer most recently passed to
    /// [`add_buffer_ref`](Self::add_buffer_ref). When the device reaches it,
    /// that buffer and every buffer registered before it are released.
    pub fn launch_callback<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        // Held until both callbacks are queued so `destroy` drains them.
        let inner = self.inner.lock();
        let queue = inner.accepting("launch_callback")?;
        let device = self.ctx.device();

        device
            .launch_callback(queue, Box::new(callback), CallbackMode::Blocking)
            .map_err(|e| {
                error!(%queue, error = %e, "failed to launch user callback");
                e
            })?;

        let registry = Arc::clone(self.ctx.registry());
        let last = registry.last_tensor(queue).map_err(|e| {
            error!(%queue, error = %e, "failed to read last pending buffer");
            StreamError::CommFailure(format!("launch_callback: {}", e))
        })?;

        let release = move || {
            if let Err(e) = registry.delete_tensor(queue, &last) {
                error!(%queue, error = %e, "failed to release buffers");
            }
        };
        device
            .launch_callback(queue, Box::new(release), CallbackMode::Blocking)
            .map_err(|e| {
                error!(%queue, error = %e, "failed to launch release callback");
                e
            })?;
        drop(inner);
        Ok(())
    }

    /// Launch a plain function with owned user data.
    ///
    /// A missing function is rejected with [`StreamError::InvalidPointer`].
    pub fn launch_host_fn<T>(&self, func: Option<fn(T)>, user_data: T) -> Result<()>
    where
        T: Send + 'static,
    {
        let func = func.ok_or_else(|| {
            error!("launch_host_fn: function is null");
            StreamError::InvalidPointer("launch_host_fn: function is null".into())
        })?;
        self.launch_callback(move || func(user_data))
    }

    /// Keep `buffer` alive until the device has passed the next release
    /// barrier or the stream is synchronized.
    ///
    /// Tracking is best effort: failures are logged, never returned.
    pub fn add_buffer_ref(&self, buffer: DeviceBuffer) {
        let Some(queue) = self.queue() else {
            warn!("add_buffer_ref on a destroyed stream, buffer is not tracked");
            return;
        };
        if let Err(e) = self.ctx.registry().add_tensor(queue, buffer) {
            warn!(%queue, error = %e, "failed to track buffer");
        }
    }

    /// Block until the device drains the queue, then release every tracked
    /// buffer.
    pub fn synchronize(&self) -> Result<()> {
        let queue = self.live_queue("synchronize")?;
        self.synchronize_queue(queue)
    }

    fn synchronize_queue(&self, queue: QueueHandle) -> Result<()> {
        self.ctx.device().synchronize_queue(queue).map_err(|e| {
            error!(%queue, error = %e, "queue synchronization failed");
            StreamError::SyncFailed(e.to_string())
        })?;

        if let Err(e) = self.ctx.registry().clear_by_stream(queue) {
            error!(%queue, error = %e, "failed to clear buffers after synchronize");
        }
        Ok(())
    }

    /// Allocate the secondary channel, or return the existing one.
    pub fn create_channel(&self) -> Result<ChannelId> {
        let device = self.ctx.device();
        if !device.supports_channels() {
            error!(device = device.name(), "channels are not supported");
            return Err(StreamError::InitFailed(format!(
                "{} does not support channels",
                device.name()
            )));
        }
        device
            .set_device(DeviceContext::new(self.device_id))
            .map_err(|e| {
                error!(device_id = self.device_id, error = %e, "failed to bind device for channel");
                StreamError::InitFailed(format!("channel: {}", e))
            })?;

        let mut inner = self.inner.lock();
        inner.accepting("create_channel")?;
        if let Some(channel) = inner.channel {
            return Ok(channel);
        }
        let channel = device.create_channel(self.device_id)?;
        info!(device_id = self.device_id, channel = channel.0, "created channel");
        inner.channel = Some(channel);
        Ok(channel)
    }

    /// Tear the stream down. Repeated calls succeed without doing anything.
    ///
    /// New work is rejected from the moment teardown starts. Everything
    /// already queued runs before the listener is stopped.
    pub fn destroy(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        let queue = {
            let mut inner = self.inner.lock();
            let Some(queue) = inner.queue else {
                return Ok(());
            };
            inner.tearing_down = true;
            queue
        };
        let device = self.ctx.device();

        if let Err(e) = device.set_device(DeviceContext::new(self.device_id)) {
            error!(%queue, error = %e, "failed to bind device context for destroy");
        }
        if let Err(e) = self.synchronize_queue(queue) {
            error!(%queue, error = %e, "synchronize before destroy failed");
        }

        let listener = self.inner.lock().listener.take();
        if let Some(mut listener) = listener {
            if listener.state() != ListenerState::Stopped {
                listener.request_exit();
                if let Err(e) = device.launch_callback(
                    queue,
                    Box::new(|| debug!("stream teardown marker reached")),
                    CallbackMode::NonBlocking,
                ) {
                    error!(%queue, error = %e, "failed to launch teardown marker");
                }
                if let Err(e) = self.synchronize_queue(queue) {
                    error!(%queue, error = %e, "synchronize during teardown failed");
                }
            }
            let id = listener.id();
            listener.join();
            if let Err(e) = device.unsubscribe(id, queue) {
                error!(%queue, error = %e, "failed to unsubscribe listener");
            }
        }

        let channel = self.inner.lock().channel.take();
        if let Some(channel) = channel {
            if let Err(e) = device.destroy_channel(channel) {
                error!(%queue, channel = channel.0, error = %e, "failed to destroy channel");
            }
        }

        if let Err(e) = self.ctx.registry().delete_stream(queue) {
            error!(%queue, error = %e, "failed to retire stream in registry");
        }

        self.inner.lock().queue = None;
        device.destroy_queue(queue).map_err(|e| {
            error!(%queue, error = %e, "failed to destroy queue");
            e
        })?;
        info!(%queue, device_id = self.device_id, "destroyed stream");
        Ok(())
    }

    /// Record an error against this stream. Ignored on the default stream.
    pub fn set_error_code(&self, code: ErrorCode) {
        if self.is_default {
            return;
        }
        let mut errors = self.errors.lock();
        if errors.first.is_none() {
            errors.first = Some(code);
        } else {
            errors.second = Some(code);
        }
    }

    /// Errors recorded via [`set_error_code`](Self::set_error_code).
    pub fn error_codes(&self) -> ErrorCodes {
        *self.errors.lock()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.inner.get_mut().queue.is_some() {
            if let Err(e) = self.destroy() {
                warn!(error = %e, "failed to destroy stream on drop");
            }
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("device_id", &self.device_id)
            .field("policy", &self.policy)
            .field("is_default", &self.is_default)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringstream_core::config::RuntimeConfig;
    use ringstream_cpu::{SimDevice, SimDeviceConfig};

    fn context() -> (Arc<SimDevice>, StreamContext) {
        let device = Arc::new(SimDevice::new(SimDeviceConfig {
            device_count: 2,
            ..Default::default()
        }));
        let ctx = StreamContext::new(device.clone(), RuntimeConfig::for_testing());
        (device, ctx)
    }

    #[test]
    fn test_create_and_destroy() {
        let (device, ctx) = context();
        let stream = Stream::create(&ctx, 1, LaunchPolicy::FastSync).unwrap();
        let queue = stream.queue().unwrap();
        assert_eq!(stream.state(), StreamState::Ready);
        assert_eq!(device.queue_device(queue), Some(1));
        assert_eq!(device.queue_policy(queue), Some(LaunchPolicy::FastSync));

        stream.destroy().unwrap();
        assert_eq!(stream.state(), StreamState::TornDown);
        assert!(!device.has_queue(queue));
        stream.destroy().unwrap();
    }

    #[test]
    fn test_create_rejects_bad_input() {
        let (device, ctx) = context();
        assert!(matches!(
            Stream::create(&ctx, 2, LaunchPolicy::Default),
            Err(StreamError::InitFailed(_))
        ));
        assert!(matches!(
            Stream::with_flags(&ctx, 0, 9),
            Err(StreamError::InitFailed(_))
        ));

        device.faults().fail_create_queue(true);
        assert!(matches!(
            Stream::create(&ctx, 0, LaunchPolicy::Default),
            Err(StreamError::InitFailed(_))
        ));
        device.faults().reset();

        device.faults().fail_set_device(true);
        assert!(matches!(
            Stream::create(&ctx, 0, LaunchPolicy::Default),
            Err(StreamError::InitFailed(_))
        ));
    }

    #[test]
    fn test_error_log_two_slots() {
        let (_device, ctx) = context();
        let stream = Stream::create(&ctx, 0, LaunchPolicy::Default).unwrap();
        assert_eq!(stream.error_codes(), ErrorCodes::default());

        stream.set_error_code(ErrorCode::Timeout);
        stream.set_error_code(ErrorCode::CommFailure);
        stream.set_error_code(ErrorCode::SyncFailed);
        let codes = stream.error_codes();
        assert_eq!(codes.first, Some(ErrorCode::Timeout));
        assert_eq!(codes.second, Some(ErrorCode::SyncFailed));
    }

    #[test]
    fn test_default_stream_ignores_errors() {
        let (_device, ctx) = context();
        let stream = Stream::create_default(&ctx, 0).unwrap();
        assert!(stream.is_default());
        stream.set_error_code(ErrorCode::Timeout);
        assert_eq!(stream.error_codes(), ErrorCodes::default());
    }

    #[test]
    fn test_launch_without_listener_fails_fast() {
        let (_device, ctx) = context();
        let stream = Stream::create(&ctx, 0, LaunchPolicy::Default).unwrap();
        assert!(matches!(
            stream.launch_callback(|| {}),
            Err(StreamError::Device(_))
        ));
        stream.destroy().unwrap();
        assert!(matches!(
            stream.launch_callback(|| {}),
            Err(StreamError::InvalidPointer(_))
        ));
        assert!(matches!(
            stream.synchronize(),
            Err(StreamError::InvalidPointer(_))
        ));
    }

    #[test]
    fn test_launch_host_fn_rejects_missing_function() {
        let (_device, ctx) = context();
        let stream = Stream::create(&ctx, 0, LaunchPolicy::Default).unwrap();
        stream.start_async_mode().unwrap();
        assert!(matches!(
            stream.launch_host_fn::<u32>(None, 5),
            Err(StreamError::InvalidPointer(_))
        ));

        fn record(slot: Arc<Mutex<u32>>) {
            *slot.lock() = 42;
        }
        let slot = Arc::new(Mutex::new(0));
        stream
            .launch_host_fn(Some(record as fn(Arc<Mutex<u32>>)), Arc::clone(&slot))
            .unwrap();
        stream.synchronize().unwrap();
        assert_eq!(*slot.lock(), 42);
    }

    #[test]
    fn test_channel_lifecycle() {
        let (device, ctx) = context();
        let stream = Stream::create(&ctx, 0, LaunchPolicy::Default).unwrap();
        assert_eq!(stream.channel(), None);

        let channel = stream.create_channel().unwrap();
        assert_eq!(stream.create_channel().unwrap(), channel);
        assert_eq!(stream.channel(), Some(channel));
        assert_eq!(device.channel_count(), 1);

        stream.destroy().unwrap();
        assert_eq!(stream.channel(), None);
        assert_eq!(device.channel_count(), 0);
    }

    #[test]
    fn test_drop_destroys_queue() {
        let (device, ctx) = context();
        let queue = {
            let stream = Stream::create(&ctx, 0, LaunchPolicy::Default).unwrap();
            stream.start_async_mode().unwrap();
            stream.queue().unwrap()
        };
        assert!(!device.has_queue(queue));
        assert_eq!(ctx.active_listeners(), 0);
    }
}
