//! Monitor configuration.

use std::time::Duration;

use crate::ble::uuids::TARGET_DEVICE_NAME;

/// Default bound on the connect request.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on service discovery and subscription.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of connection attempts per target match.
pub const DEFAULT_MAX_CONNECT_ATTEMPTS: u32 = 3;

/// Default delay unit between attempts.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Default broadcast channel capacity.
pub const DEFAULT_EVENT_BUFFER: usize = 100;

/// Configuration for [`WeatherMonitor`](crate::WeatherMonitor).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MonitorConfig {
    /// Advertised name that triggers the connection handoff.
    pub target_name: String,
    /// Bound on the connect request.
    pub connect_timeout: Duration,
    /// Bound on service discovery and on the subscription phase.
    pub discovery_timeout: Duration,
    /// Connection attempts before giving up. Values below 1 mean 1.
    pub max_connect_attempts: u32,
    /// Attempt `n` waits `retry_backoff * n` before attempt `n + 1`.
    pub retry_backoff: Duration,
    /// Capacity of the scan and telemetry broadcast channels.
    pub event_buffer: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            target_name: TARGET_DEVICE_NAME.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            max_connect_attempts: DEFAULT_MAX_CONNECT_ATTEMPTS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl MonitorConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the advertised name to connect to.
    #[must_use]
    pub fn target_name(mut self, name: impl Into<String>) -> Self {
        self.target_name = name.into();
        self
    }

    /// Sets the connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the discovery/subscription timeout.
    #[must_use]
    pub const fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Sets the number of connection attempts.
    #[must_use]
    pub const fn max_connect_attempts(mut self, attempts: u32) -> Self {
        self.max_connect_attempts = attempts;
        self
    }

    /// Sets the backoff unit between attempts.
    #[must_use]
    pub const fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Sets the broadcast channel capacity.
    #[must_use]
    pub const fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    /// Attempts actually made, never zero.
    pub(crate) fn attempts(&self) -> u32 {
        self.max_connect_attempts.max(1)
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub(crate) fn backoff_for(&self, attempt: u32) -> Duration {
        self.retry_backoff.saturating_mul(attempt)
    }
}
