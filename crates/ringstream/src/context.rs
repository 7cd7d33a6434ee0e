//! Services shared by every stream of a runtime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ringstream_core::buffer::DeviceBuffer;
use ringstream_core::config::RuntimeConfig;
use ringstream_core::device::DeviceBackend;
use ringstream_core::registry::BufferRegistry;

/// Device, buffer registry and configuration a stream is created against.
///
/// Cloning is cheap; all clones share the same services.
#[derive(Clone)]
pub struct StreamContext {
    device: Arc<dyn DeviceBackend>,
    registry: Arc<BufferRegistry<DeviceBuffer>>,
    config: Arc<RuntimeConfig>,
    listeners: Arc<AtomicUsize>,
}

impl StreamContext {
    /// Create a context with a fresh registry.
    pub fn new(device: Arc<dyn DeviceBackend>, config: RuntimeConfig) -> Self {
        Self::with_registry(device, Arc::new(BufferRegistry::new()), config)
    }

    /// Create a context around an existing registry.
    pub fn with_registry(
        device: Arc<dyn DeviceBackend>,
        registry: Arc<BufferRegistry<DeviceBuffer>>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            device,
            registry,
            config: Arc::new(config),
            listeners: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Device backend.
    pub fn device(&self) -> &Arc<dyn DeviceBackend> {
        &self.device
    }

    /// Buffer registry.
    pub fn registry(&self) -> &Arc<BufferRegistry<DeviceBuffer>> {
        &self.registry
    }

    /// Runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Listener threads currently running for streams of this context.
    pub fn active_listeners(&self) -> usize {
        self.listeners.load(Ordering::SeqCst)
    }

    pub(crate) fn listener_counter(&self) -> &Arc<AtomicUsize> {
        &self.listeners
    }
}

impl std::fmt::Debug for StreamContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamContext")
            .field("device", &self.device.name())
            .field("streams", &self.registry.len())
            .field("active_listeners", &self.active_listeners())
            .finish()
    }
}
