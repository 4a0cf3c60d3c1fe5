//! Engine configuration.
//!
//! The orchestration layer owns where these values come from (CLI flags,
//! job records, …); this module only defines the shape, the defaults, and
//! the validation the engine applies before starting.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Default source-port rotation range.
pub const DEFAULT_PORT_RANGE: (u16, u16) = (20_000, 40_000);

/// Default grace window: how long a bucket stays open for late replies.
pub const DEFAULT_GRACE_SECS: u32 = 2;

/// Default interval between stat deliveries to the controller.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Configuration rejected before the engine starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("packet rate must be at least 1 packet/second")]
    ZeroRate,
    #[error("source port range [{0}, {1}) is empty")]
    EmptyPortRange(u16, u16),
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Everything the engine needs to run one traffic job.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Where probes are sent (the device under test's virtual server).
    pub destination: SocketAddr,

    /// Target send rate in packets per wall-clock second.
    pub packet_rate: u32,

    /// First source port of the rotation (inclusive).
    pub port_range_start: u16,

    /// End of the source-port rotation (exclusive); wraps back to start.
    pub port_range_stop: u16,

    /// Job identifier echoed into every stat record's `app_id` field.
    pub app_id: String,

    /// Seconds a bucket stays open after its second ends, so in-flight
    /// replies can still be counted.
    pub grace_secs: u32,

    /// How often queued stat records are shipped to the controller.
    pub report_interval: Duration,

    /// Controller endpoint receiving `{"data_list": [...]}` POSTs,
    /// e.g. `http://10.0.0.1:8000/api/v1/UDPTrafficStat/`.
    pub controller_url: String,
}

impl EngineConfig {
    /// Build a config with the standard defaults for everything but the
    /// per-job fields.
    pub fn new(
        destination: SocketAddr,
        packet_rate: u32,
        app_id: impl Into<String>,
        controller_url: impl Into<String>,
    ) -> Self {
        Self {
            destination,
            packet_rate,
            port_range_start: DEFAULT_PORT_RANGE.0,
            port_range_stop: DEFAULT_PORT_RANGE.1,
            app_id: app_id.into(),
            grace_secs: DEFAULT_GRACE_SECS,
            report_interval: DEFAULT_REPORT_INTERVAL,
            controller_url: controller_url.into(),
        }
    }

    /// Reject configurations the engine cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.packet_rate == 0 {
            return Err(ConfigError::ZeroRate);
        }
        if self.port_range_start >= self.port_range_stop {
            return Err(ConfigError::EmptyPortRange(
                self.port_range_start,
                self.port_range_stop,
            ));
        }
        Ok(())
    }
}
