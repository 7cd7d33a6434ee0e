//! Runtime bundle and process-wide default runtime.

use std::sync::{Arc, OnceLock};

use tracing::{error, info};

use ringstream_core::config::RuntimeConfig;
use ringstream_core::device::{DeviceBackend, DeviceId, LaunchPolicy};
use ringstream_core::error::{Result, StreamError};
use ringstream_cpu::SimDevice;

use crate::context::StreamContext;
use crate::default_stream::{DefaultStreamProvider, DefaultStreamState};
use crate::stream::Stream;

static GLOBAL: OnceLock<StreamRuntime> = OnceLock::new();

/// Device, buffer registry, configuration and default stream.
#[derive(Debug)]
pub struct StreamRuntime {
    ctx: StreamContext,
    default_stream: DefaultStreamProvider,
}

impl StreamRuntime {
    /// Start building a runtime.
    pub fn builder() -> StreamRuntimeBuilder {
        StreamRuntimeBuilder::new()
    }

    /// Runtime on `device` with default configuration.
    pub fn new(device: Arc<dyn DeviceBackend>) -> Self {
        Self::builder().with_device(device).build()
    }

    /// Shared services for streams of this runtime.
    pub fn context(&self) -> &StreamContext {
        &self.ctx
    }

    /// Device backend.
    pub fn device(&self) -> &Arc<dyn DeviceBackend> {
        self.ctx.device()
    }

    /// Runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        self.ctx.config()
    }

    /// Create a stream on `device_id`.
    pub fn create_stream(&self, device_id: DeviceId, policy: LaunchPolicy) -> Result<Stream> {
        Stream::create(&self.ctx, device_id, policy)
    }

    /// The default stream, built on first use.
    pub fn default_stream(&self) -> Result<Arc<Stream>> {
        self.default_stream.get()
    }

    /// State of the default stream.
    pub fn default_stream_state(&self) -> DefaultStreamState {
        self.default_stream.state()
    }

    /// Listener threads currently running.
    pub fn active_listeners(&self) -> usize {
        self.ctx.active_listeners()
    }

    /// Destroy the default stream and drop every registry entry.
    ///
    /// Both steps always run. Any failure is reported as one
    /// [`StreamError::CommFailure`].
    pub fn shutdown(&self) -> Result<()> {
        let mut failures = Vec::new();

        if let Err(e) = self.default_stream.invalidate() {
            error!(error = %e, "failed to destroy default stream");
            failures.push(format!("default stream: {}", e));
        }
        self.ctx.registry().deinit();

        if failures.is_empty() {
            info!("runtime shut down");
            Ok(())
        } else {
            Err(StreamError::CommFailure(failures.join("; ")))
        }
    }
}

/// Builder for [`StreamRuntime`].
#[derive(Default)]
pub struct StreamRuntimeBuilder {
    device: Option<Arc<dyn DeviceBackend>>,
    config: RuntimeConfig,
}

impl StreamRuntimeBuilder {
    /// Creates a builder using the simulated device and default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the device backend.
    #[must_use]
    pub fn with_device(mut self, device: Arc<dyn DeviceBackend>) -> Self {
        self.device = Some(device);
        self
    }

    /// Sets the runtime configuration.
    #[must_use]
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the runtime.
    pub fn build(self) -> StreamRuntime {
        let device = self
            .device
            .unwrap_or_else(|| Arc::new(SimDevice::with_defaults()));
        info!(device = device.name(), devices = device.device_count(), "runtime created");
        let ctx = StreamContext::new(device, self.config);
        StreamRuntime {
            default_stream: DefaultStreamProvider::new(ctx.clone()),
            ctx,
        }
    }
}

/// Install the process-wide runtime. Fails if one is already installed.
pub fn install_global(runtime: StreamRuntime) -> Result<&'static StreamRuntime> {
    let mut runtime = Some(runtime);
    let installed = GLOBAL.get_or_init(|| {
        runtime
            .take()
            .unwrap_or_else(|| StreamRuntimeBuilder::new().build())
    });
    if runtime.is_some() {
        error!("global runtime is already installed");
        return Err(StreamError::InitFailed(
            "global runtime is already installed".into(),
        ));
    }
    Ok(installed)
}

/// The process-wide runtime, created with defaults if none was installed.
pub fn global() -> &'static StreamRuntime {
    GLOBAL.get_or_init(|| StreamRuntimeBuilder::new().build())
}

/// The process-wide default stream.
pub fn default_stream() -> Result<Arc<Stream>> {
    global().default_stream()
}
