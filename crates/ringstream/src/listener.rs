//! Completion listener threads.
//!
//! A listener binds itself to the stream's device, reports readiness, and
//! then pumps the device's pending-callback dispatch until asked to exit.
//! Stopping is cooperative: the owner requests exit and the thread notices
//! after its current pump returns.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use ringstream_core::device::{DeviceBackend, DeviceContext, DeviceId, ListenerId};
use ringstream_core::error::{Result, StreamError};

use crate::context::StreamContext;

/// Lifecycle of a listener thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Spawned, device context not bound yet.
    Starting,
    /// Context bound, pumping callbacks.
    Attached,
    /// Exit requested, thread still running.
    Exiting,
    /// Thread body has returned.
    Stopped,
}

/// Control block shared between a stream and its listener thread.
pub(crate) struct ListenerControl {
    state: Mutex<ListenerState>,
    changed: Condvar,
    device_id: DeviceId,
}

impl ListenerControl {
    fn new(device_id: DeviceId) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ListenerState::Starting),
            changed: Condvar::new(),
            device_id,
        })
    }

    pub(crate) fn state(&self) -> ListenerState {
        *self.state.lock()
    }

    /// `Starting -> Attached`. Fails if exit was requested first.
    fn mark_attached(&self) -> bool {
        let mut state = self.state.lock();
        if *state != ListenerState::Starting {
            return false;
        }
        *state = ListenerState::Attached;
        self.changed.notify_all();
        true
    }

    fn request_exit(&self) {
        let mut state = self.state.lock();
        if *state != ListenerState::Stopped {
            *state = ListenerState::Exiting;
            self.changed.notify_all();
        }
    }

    fn exit_requested(&self) -> bool {
        *self.state.lock() == ListenerState::Exiting
    }

    fn mark_stopped(&self) {
        *self.state.lock() = ListenerState::Stopped;
        self.changed.notify_all();
    }

    /// Poll for `Attached`, at most `attempts` waits of `interval` each.
    fn wait_attached(&self, attempts: usize, interval: Duration) -> bool {
        let mut state = self.state.lock();
        for _ in 0..attempts {
            match *state {
                ListenerState::Attached => return true,
                ListenerState::Stopped | ListenerState::Exiting => return false,
                ListenerState::Starting => {
                    let _ = self.changed.wait_for(&mut state, interval);
                }
            }
        }
        *state == ListenerState::Attached
    }
}

/// Handle to a running listener thread.
pub(crate) struct Listener {
    id: ListenerId,
    control: Arc<ListenerControl>,
    handle: Option<JoinHandle<()>>,
}

impl Listener {
    /// Spawn a listener for `device_id`. Does not subscribe it to anything.
    pub(crate) fn spawn(ctx: &StreamContext, device_id: DeviceId) -> Result<Self> {
        let id = ListenerId::next();
        let control = ListenerControl::new(device_id);
        let config = ctx.config();

        let handle = {
            let device = Arc::clone(ctx.device());
            let control = Arc::clone(&control);
            let active = Arc::clone(ctx.listener_counter());
            let timeout = config.process_timeout;
            thread::Builder::new()
                .name(config.listener_thread_name.clone())
                .spawn(move || run(device, control, id, timeout, active))
                .map_err(|e| {
                    error!(device_id, error = %e, "failed to spawn listener thread");
                    StreamError::AllocFailed(format!("listener thread: {}", e))
                })?
        };

        debug!(%id, device_id, "spawned listener");
        Ok(Self {
            id,
            control,
            handle: Some(handle),
        })
    }

    pub(crate) fn id(&self) -> ListenerId {
        self.id
    }

    pub(crate) fn state(&self) -> ListenerState {
        self.control.state()
    }

    pub(crate) fn wait_attached(&self, attempts: usize, interval: Duration) -> bool {
        self.control.wait_attached(attempts, interval)
    }

    pub(crate) fn request_exit(&self) {
        self.control.request_exit();
    }

    /// Request exit and wait for the thread to finish.
    pub(crate) fn stop(mut self) {
        self.request_exit();
        self.join();
    }

    pub(crate) fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(id = %self.id, "listener thread panicked");
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.request_exit();
            self.join();
        }
    }
}

/// Decrements the live-listener count when the thread body returns.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn run(
    device: Arc<dyn DeviceBackend>,
    control: Arc<ListenerControl>,
    id: ListenerId,
    timeout: Duration,
    active: Arc<AtomicUsize>,
) {
    let _active = ActiveGuard::enter(active);

    if let Err(e) = device.set_device(DeviceContext::new(control.device_id)) {
        error!(%id, device_id = control.device_id, error = %e, "listener failed to bind device context");
        control.mark_stopped();
        return;
    }
    if !control.mark_attached() {
        control.mark_stopped();
        return;
    }
    info!(%id, device_id = control.device_id, "listener attached");

    loop {
        if let Err(e) = device.process_pending(id, timeout) {
            debug!(%id, error = %e, "process_pending failed");
        }
        if control.exit_requested() {
            break;
        }
    }

    control.mark_stopped();
    debug!(%id, "listener stopped");
}
