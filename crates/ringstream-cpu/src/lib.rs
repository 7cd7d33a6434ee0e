//! CPU backend for RingStream.
//!
//! Simulates an accelerator on host threads: ordered queues, host
//! callbacks routed to subscribed listener threads, and drain waits. Used
//! for testing and as a fallback when no accelerator is present.

#![warn(missing_docs)]

mod config;
mod device;

pub use config::{SimDeviceConfig, SimDeviceConfigBuilder};
pub use device::{SimDevice, SimDeviceStats, SimFaults};
