//! CTAP HID engine configuration

use std::time::Duration;

/// Default time allowed between the initialization packet of a message and
/// its last continuation packet
pub const DEFAULT_ASSEMBLY_TIMEOUT: Duration = Duration::from_millis(500);

/// Default number of queued responses before the reader is blocked
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 100;

/// Longest lock a channel may request with CTAPHID_LOCK
pub const MAX_LOCK_SECONDS: u8 = 10;

/// Device version reported in INIT responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceVersion {
    pub major: u8,
    pub minor: u8,
    pub build: u8,
}

impl Default for DeviceVersion {
    fn default() -> Self {
        Self {
            major: 0,
            minor: 0,
            build: 1,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct CtapHidConfig {
    /// Time allowed to receive all packets of one message
    pub assembly_timeout: Duration,

    /// Capacity of the outbound response queue
    pub outbound_capacity: usize,

    /// Device version reported in INIT responses
    pub device_version: DeviceVersion,

    /// Upper bound for CTAPHID_LOCK durations
    pub max_lock_seconds: u8,
}

impl Default for CtapHidConfig {
    fn default() -> Self {
        Self {
            assembly_timeout: DEFAULT_ASSEMBLY_TIMEOUT,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            device_version: DeviceVersion::default(),
            max_lock_seconds: MAX_LOCK_SECONDS,
        }
    }
}

impl CtapHidConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the message assembly timeout
    pub fn with_assembly_timeout(mut self, timeout: Duration) -> Self {
        self.assembly_timeout = timeout;
        self
    }

    /// Set the outbound queue capacity (at least 1)
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }

    /// Set the device version reported in INIT responses
    pub fn with_device_version(mut self, major: u8, minor: u8, build: u8) -> Self {
        self.device_version = DeviceVersion {
            major,
            minor,
            build,
        };
        self
    }

    /// Set the maximum lock duration, capped at 10 seconds
    pub fn with_max_lock_seconds(mut self, seconds: u8) -> Self {
        self.max_lock_seconds = seconds.min(MAX_LOCK_SECONDS);
        self
    }
}
