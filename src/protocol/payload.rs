//! Weather payload parsing.
//!
//! Parses the fixed-layout value delivered by the temperature notification
//! and the humidity read.

use tracing::debug;

use crate::data::TelemetryReading;
use crate::error::DecodeError;

/// Full-precision values of a payload, before quantization.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RawWeatherSample {
    /// Temperature in degrees Celsius.
    pub temperature_celsius: f64,
    /// Relative humidity in percent, clamped to `0.0..=100.0`.
    pub humidity_percent: f64,
}

/// Raw fields of a weather payload before quantization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeatherPayload {
    /// Flag byte at offset 0. Not interpreted.
    pub flags: u8,
    /// Temperature in hundredths of a degree Celsius.
    pub raw_temperature: u16,
    /// Relative humidity in tenths of a percent.
    pub raw_humidity: u16,
}

impl WeatherPayload {
    /// Size of the fixed layout.
    pub const MIN_SIZE: usize = 5;

    /// Parse a weather payload.
    ///
    /// Layout:
    /// - Byte 0: flags (reserved)
    /// - Bytes 1-2: temperature, uint16 little-endian, 0.01 °C
    /// - Bytes 3-4: humidity, uint16 **big-endian**, 0.1 %
    ///
    /// Trailing bytes are ignored.
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < Self::MIN_SIZE {
            return Err(DecodeError::InvalidLength { len: data.len() });
        }

        // The two fields use opposite byte orders on the wire.
        let raw_temperature = u16::from_le_bytes([data[1], data[2]]);
        let raw_humidity = u16::from_be_bytes([data[3], data[4]]);

        Ok(Self {
            flags: data[0],
            raw_temperature,
            raw_humidity,
        })
    }

    /// Temperature in degrees Celsius at full precision.
    pub fn temperature_celsius(&self) -> f64 {
        f64::from(self.raw_temperature) / 100.0
    }

    /// Humidity in percent, clamped to `0.0..=100.0`.
    pub fn humidity_percent(&self) -> f64 {
        (f64::from(self.raw_humidity) / 10.0).clamp(0.0, 100.0)
    }

    /// Values at full precision.
    pub fn sample(&self) -> RawWeatherSample {
        RawWeatherSample {
            temperature_celsius: self.temperature_celsius(),
            humidity_percent: self.humidity_percent(),
        }
    }

    /// Quantize into a reading: temperature truncated, humidity rounded.
    pub fn to_reading(&self) -> TelemetryReading {
        let sample = self.sample();
        TelemetryReading {
            temperature_celsius: sample.temperature_celsius.trunc() as i32,
            humidity_percent: sample.humidity_percent.round() as u8,
        }
    }
}

/// Decode a raw payload into a reading.
pub fn decode(data: &[u8]) -> Result<TelemetryReading, DecodeError> {
    let payload = WeatherPayload::parse(data)?;
    let sample = payload.sample();
    let reading = payload.to_reading();

    debug!(
        "Decoded {:02X?}: {:.2} °C -> {}, {:.1} % -> {}",
        data,
        sample.temperature_celsius,
        reading.temperature_celsius,
        sample.humidity_percent,
        reading.humidity_percent
    );

    Ok(reading)
}
