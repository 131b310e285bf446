// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # ipvs-weather-ble
//!
//! A cross-platform Rust library for reading the IPVSWeather
//! temperature/humidity beacon via Bluetooth Low Energy.
//!
//! ## Features
//!
//! - **Discovery**: Scan for advertising devices and collect their names
//! - **Automatic Handoff**: Connect as soon as the beacon advertises
//! - **Live Telemetry**: Temperature notifications plus a one-off humidity read
//! - **Bounded Retries**: Timeouts on every radio phase, retried with backoff
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ipvs_weather_ble::{MonitorConfig, Result, WeatherMonitor};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let monitor = WeatherMonitor::new(MonitorConfig::default()).await?;
//!
//!     let _handle = monitor.store().on_reading_updated(|reading| {
//!         println!("Weather: {}", reading);
//!     });
//!
//!     // Scan, connect and receive until the beacon goes away
//!     if let Err(e) = monitor.run().await {
//!         eprintln!("Session ended: {}", e);
//!     }
//!
//!     println!("Last temperature: {} °C", monitor.store().temperature_display());
//!
//!     monitor.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod config;
pub mod data;
pub mod error;
pub mod monitor;
pub mod protocol;
pub mod store;

// Re-exports for convenience
pub use config::MonitorConfig;
pub use error::{DecodeError, Error, GattOperation, Result};
pub use monitor::WeatherMonitor;
pub use store::{CallbackHandle, TelemetryStore, TelemetryUpdate, NO_DATA};

// Re-export commonly used types from submodules
pub use ble::characteristics::CharacteristicRegistry;
pub use ble::connection::{ConnectionEvent, ConnectionState, ConnectionStateMachine};
pub use ble::link::{BtleplugLink, GattLink};
pub use ble::scanner::{BleScanner, ScanEvent};
pub use data::{DiscoveredDevice, TelemetryReading};
pub use protocol::decode;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<WeatherMonitor>();
        let _ = std::any::TypeId::of::<TelemetryStore>();
        let _ = std::any::TypeId::of::<ConnectionStateMachine>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<TelemetryReading>();
        let _ = std::any::TypeId::of::<DiscoveredDevice>();
    }

    #[test]
    fn test_decode_reexport() {
        let reading = decode(&[0x00, 0x34, 0x01, 0x01, 0x96]).unwrap();
        assert_eq!(reading, TelemetryReading::new(3, 41));
        assert_eq!(decode(&[0x00]), Err(DecodeError::InvalidLength { len: 1 }));
    }
}
