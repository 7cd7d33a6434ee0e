//! Lazily constructed, process-wide default stream.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use ringstream_core::device::DeviceId;
use ringstream_core::error::Result;

use crate::context::StreamContext;
use crate::stream::Stream;

/// Observable state of a [`DefaultStreamProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultStreamState {
    /// No stream built yet.
    NotInitialized,
    /// Holds a live stream.
    Ready,
    /// The held stream was destroyed; the next access rebuilds it.
    Invalidated,
}

enum Slot {
    NotInitialized,
    Ready { stream: Arc<Stream>, device: DeviceId },
    Invalidated { device: DeviceId },
}

impl Slot {
    fn state(&self) -> DefaultStreamState {
        match self {
            Slot::NotInitialized => DefaultStreamState::NotInitialized,
            Slot::Ready { stream, .. } if stream.is_alive() => DefaultStreamState::Ready,
            Slot::Ready { .. } | Slot::Invalidated { .. } => DefaultStreamState::Invalidated,
        }
    }

    fn live(&self) -> Option<&Arc<Stream>> {
        match self {
            Slot::Ready { stream, .. } if stream.is_alive() => Some(stream),
            _ => None,
        }
    }
}

/// Builds the default stream on first use and rebuilds it after it has
/// been destroyed.
pub struct DefaultStreamProvider {
    ctx: StreamContext,
    slot: RwLock<Slot>,
}

impl DefaultStreamProvider {
    /// Create an empty provider.
    pub fn new(ctx: StreamContext) -> Self {
        Self {
            ctx,
            slot: RwLock::new(Slot::NotInitialized),
        }
    }

    /// Return the default stream, building or rebuilding it if needed.
    ///
    /// Concurrent first calls observe the same instance.
    ///
    /// The liveness check on the fast path runs under a shared read guard,
    /// which only contends with a rebuild or [`invalidate`](Self::invalidate).
    /// Neither the stream's attach wait nor its teardown drain hold the
    /// stream lock the check reads.
    pub fn get(&self) -> Result<Arc<Stream>> {
        if let Some(stream) = self.slot.read().live() {
            return Ok(Arc::clone(stream));
        }

        let mut slot = self.slot.write();
        if let Some(stream) = slot.live() {
            return Ok(Arc::clone(stream));
        }

        let device = match &*slot {
            Slot::NotInitialized => self.resolve_device(),
            Slot::Ready { device, .. } => {
                debug!(device_id = *device, "default stream was destroyed");
                *device
            }
            Slot::Invalidated { device } => *device,
        };
        // A failed rebuild leaves the slot invalidated.
        if !matches!(*slot, Slot::NotInitialized) {
            *slot = Slot::Invalidated { device };
        }

        let stream = Arc::new(Stream::create_default(&self.ctx, device)?);
        info!(device_id = device, queue = ?stream.queue(), "default stream ready");
        *slot = Slot::Ready {
            stream: Arc::clone(&stream),
            device,
        };
        Ok(stream)
    }

    /// The held stream if it is live, without building one.
    pub fn current(&self) -> Option<Arc<Stream>> {
        self.slot.read().live().cloned()
    }

    /// Current state.
    pub fn state(&self) -> DefaultStreamState {
        self.slot.read().state()
    }

    /// Destroy the held stream, if any. The next [`get`](Self::get) rebuilds
    /// it on the same device.
    pub fn invalidate(&self) -> Result<()> {
        let mut slot = self.slot.write();
        let (stream, device) = match std::mem::replace(&mut *slot, Slot::NotInitialized) {
            Slot::NotInitialized => return Ok(()),
            Slot::Invalidated { device } => {
                *slot = Slot::Invalidated { device };
                return Ok(());
            }
            Slot::Ready { stream, device } => (stream, device),
        };
        *slot = Slot::Invalidated { device };
        drop(slot);
        stream.destroy()
    }

    fn resolve_device(&self) -> DeviceId {
        match self.ctx.device().current_device() {
            Ok(ctx) => ctx.device_id,
            Err(e) => {
                let fallback = self.ctx.config().default_device;
                warn!(error = %e, device_id = fallback, "no current device, using fallback for default stream");
                fallback
            }
        }
    }
}

impl std::fmt::Debug for DefaultStreamProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultStreamProvider")
            .field("state", &self.state())
            .finish()
    }
}
