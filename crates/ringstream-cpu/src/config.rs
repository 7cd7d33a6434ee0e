//! Simulated device configuration.

use std::time::Duration;

/// Configuration for [`SimDevice`](crate::SimDevice).
#[derive(Debug, Clone)]
pub struct SimDeviceConfig {
    /// Number of addressable devices.
    pub device_count: u32,
    /// Whether secondary channels can be created.
    pub supports_channels: bool,
    /// Artificial latency applied to every queued operation.
    pub execution_delay: Option<Duration>,
}

impl Default for SimDeviceConfig {
    fn default() -> Self {
        Self {
            device_count: 1,
            supports_channels: true,
            execution_delay: None,
        }
    }
}

/// Builder for [`SimDeviceConfig`].
#[derive(Debug, Default)]
pub struct SimDeviceConfigBuilder {
    config: SimDeviceConfig,
}

impl SimDeviceConfigBuilder {
    /// Creates a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of devices.
    #[must_use]
    pub fn with_device_count(mut self, count: u32) -> Self {
        self.config.device_count = count;
        self
    }

    /// Enables or disables secondary channels.
    #[must_use]
    pub fn with_channels(mut self, enabled: bool) -> Self {
        self.config.supports_channels = enabled;
        self
    }

    /// Delays every queued operation by `delay`.
    #[must_use]
    pub fn with_execution_delay(mut self, delay: Duration) -> Self {
        self.config.execution_delay = Some(delay);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> SimDeviceConfig {
        self.config
    }
}
