//! Data structures for beacon data.
//!
//! This module contains the value types handed to the presentation layer:
//! decoded telemetry readings and discovered devices.

pub mod device;
pub mod reading;

pub use device::DiscoveredDevice;
pub use reading::TelemetryReading;
