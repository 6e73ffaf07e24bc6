//! Configuration for scanning, connection, reconnection and aggregation.
//!
//! All config structs carry validated defaults and builder-style setters so
//! a host application can construct them in code or deserialize them from
//! its own configuration file.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use lifeband_types::uuids::{DEVICE_NAME_PREFIX, VITALS_SERVICE};

use crate::error::{Error, Result};

/// Default scan window. The band advertises roughly every second, so a few
/// seconds is enough to observe RSSI for candidate selection.
const DEFAULT_SCAN_WINDOW: Duration = Duration::from_secs(5);

/// Default timeout for establishing the physical link.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for service discovery after connection.
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default aggregation window width: 30 minutes.
const DEFAULT_BUCKET_WINDOW: Duration = Duration::from_secs(30 * 60);

/// Options for the discovery scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// How long to scan before selecting a candidate.
    pub window: Duration,
    /// Advertised-name prefix that qualifies a candidate.
    pub name_prefix: String,
    /// Advertised service UUID that qualifies a candidate.
    pub service: Uuid,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_SCAN_WINDOW,
            name_prefix: DEVICE_NAME_PREFIX.to_string(),
            service: VITALS_SERVICE,
        }
    }
}

impl ScanConfig {
    /// Set the scan window.
    #[must_use]
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Set the qualifying name prefix.
    #[must_use]
    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }
}

/// Options for physical link establishment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Timeout for opening the physical link.
    pub timeout: Duration,
    /// Timeout for service discovery.
    pub discovery_timeout: Duration,
    /// Requested MTU. The platform stack performs the actual negotiation.
    pub mtu: u16,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CONNECT_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            mtu: 247,
        }
    }
}

impl ConnectConfig {
    /// Set the connect timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the requested MTU.
    #[must_use]
    pub fn mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }
}

/// Options for the bounded reconnection policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Maximum consecutive failed reconnect attempts before the policy
    /// gives up and surfaces a terminal notice.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// Options for vitals aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateConfig {
    /// Fixed aggregation window width.
    pub window: Duration,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_BUCKET_WINDOW,
        }
    }
}

/// Top-level session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Discovery scan options.
    pub scan: ScanConfig,
    /// Link establishment options.
    pub connect: ConnectConfig,
    /// Reconnection policy options.
    pub reconnect: ReconnectConfig,
    /// Aggregation options.
    pub aggregate: AggregateConfig,
    /// Capacity of the bounded sample channel bridging the notification
    /// push domain into the ingestion pipeline.
    pub sample_buffer: usize,
    /// Capacity of the session event broadcast channel.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scan: ScanConfig::default(),
            connect: ConnectConfig::default(),
            reconnect: ReconnectConfig::default(),
            aggregate: AggregateConfig::default(),
            sample_buffer: 64,
            event_capacity: 64,
        }
    }
}

impl SessionConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.scan.window.is_zero() {
            return Err(Error::invalid_config("scan window must be > 0"));
        }
        if self.connect.timeout.is_zero() {
            return Err(Error::invalid_config("connect timeout must be > 0"));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(Error::invalid_config("max_attempts must be >= 1"));
        }
        if self.aggregate.window.is_zero() {
            return Err(Error::invalid_config("aggregation window must be > 0"));
        }
        if self.sample_buffer == 0 {
            return Err(Error::invalid_config("sample_buffer must be > 0"));
        }
        Ok(())
    }
}
