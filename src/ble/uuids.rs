//! BLE Service and Characteristic UUIDs.
//!
//! Contains all UUID constants used for IPVSWeather communication.

use uuid::Uuid;

// Weather Service (IPVS Custom)
/// IPVSWeather service UUID.
pub const WEATHER_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_0002_0000_0000_fdfd_fdfdfdfdfdfd);

/// Temperature characteristic UUID (Notify).
pub const TEMPERATURE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_2a1c_0000_1000_8000_00805f9b34fb);
/// Humidity characteristic UUID (Read).
pub const HUMIDITY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000_2a6f_0000_1000_8000_00805f9b34fb);

// Standard descriptors
/// Client Characteristic Configuration Descriptor UUID.
pub const CLIENT_CONFIG_DESCRIPTOR_UUID: Uuid =
    Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f9b34fb);

/// CCCD value that enables notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// Advertised local name of the weather beacon.
pub const TARGET_DEVICE_NAME: &str = "IPVSWeather";

/// Check if a characteristic UUID carries weather payloads.
pub fn is_weather_characteristic(uuid: &Uuid) -> bool {
    *uuid == TEMPERATURE_CHARACTERISTIC_UUID || *uuid == HUMIDITY_CHARACTERISTIC_UUID
}
