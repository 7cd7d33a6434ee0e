//! Runtime configuration.

use std::time::Duration;

use crate::device::{DeviceId, LaunchPolicy};

/// Configuration for streams and their listener threads.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How many times `start_async_mode` polls for listener readiness.
    pub attach_attempts: usize,
    /// Delay between readiness polls.
    pub attach_poll_interval: Duration,
    /// Upper bound for one "process pending callbacks" call in the listener.
    pub process_timeout: Duration,
    /// Name given to listener threads.
    pub listener_thread_name: String,
    /// Policy used for streams created without an explicit one.
    pub default_launch_policy: LaunchPolicy,
    /// Device used for the default stream when no context is bound.
    pub default_device: DeviceId,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            attach_attempts: 100,
            attach_poll_interval: Duration::from_micros(500),
            process_timeout: Duration::from_millis(100),
            listener_thread_name: "ringstream-listener".to_string(),
            default_launch_policy: LaunchPolicy::LaunchSync,
            default_device: 0,
        }
    }
}

impl RuntimeConfig {
    /// Total time `start_async_mode` waits for the listener.
    pub fn attach_timeout(&self) -> Duration {
        self.attach_poll_interval * self.attach_attempts as u32
    }

    /// Short listener pump and attach window, for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            attach_attempts: 200,
            attach_poll_interval: Duration::from_micros(500),
            process_timeout: Duration::from_millis(10),
            ..Self::default()
        }
    }
}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Creates a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder starting from the test preset.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            config: RuntimeConfig::for_testing(),
        }
    }

    /// Sets the number of readiness polls.
    #[must_use]
    pub fn with_attach_attempts(mut self, attempts: usize) -> Self {
        self.config.attach_attempts = attempts;
        self
    }

    /// Sets the delay between readiness polls.
    #[must_use]
    pub fn with_attach_poll_interval(mut self, interval: Duration) -> Self {
        self.config.attach_poll_interval = interval;
        self
    }

    /// Sets the listener pump timeout.
    #[must_use]
    pub fn with_process_timeout(mut self, timeout: Duration) -> Self {
        self.config.process_timeout = timeout;
        self
    }

    /// Sets the listener thread name.
    #[must_use]
    pub fn with_listener_thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.listener_thread_name = name.into();
        self
    }

    /// Sets the default launch policy.
    #[must_use]
    pub fn with_default_launch_policy(mut self, policy: LaunchPolicy) -> Self {
        self.config.default_launch_policy = policy;
        self
    }

    /// Sets the fallback device of the default stream.
    #[must_use]
    pub fn with_default_device(mut self, device: DeviceId) -> Self {
        self.config.default_device = device;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}
