//! BLE communication module.
//!
//! This module provides low-level Bluetooth Low Energy functionality
//! for discovering and communicating with the IPVSWeather beacon.

pub mod characteristics;
pub mod connection;
pub mod link;
pub mod scanner;
pub mod session;
pub mod uuids;

pub use characteristics::{
    CharacteristicDescriptor, CharacteristicRegistry, NotificationEvent, ServiceDescriptor,
};
pub use connection::{ConnectionEvent, ConnectionState, ConnectionStateMachine, LinkEvent, Step};
pub use link::{BtleplugLink, GattLink};
pub use scanner::{BleScanner, ScanAbort, ScanEvent, ScanOutcome, ScanSession};
pub use session::{connect_with_retry, establish, ActiveSession};
pub use uuids::*;
