//! Telemetry reading data structures.

/// One decoded sample from the weather beacon.
///
/// Temperature is truncated toward zero to whole degrees Celsius, humidity is
/// rounded to a whole percent and always lies in `0..=100`. A reading is
/// immutable and replaced wholesale by the next sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TelemetryReading {
    /// Temperature in whole degrees Celsius.
    pub temperature_celsius: i32,
    /// Relative humidity in whole percent.
    pub humidity_percent: u8,
}

impl TelemetryReading {
    /// Upper bound for humidity.
    pub const MAX_HUMIDITY: u8 = 100;

    /// Create a reading, clamping humidity into range.
    pub fn new(temperature_celsius: i32, humidity_percent: u8) -> Self {
        Self {
            temperature_celsius,
            humidity_percent: humidity_percent.min(Self::MAX_HUMIDITY),
        }
    }
}

impl std::fmt::Display for TelemetryReading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} °C, {} %",
            self.temperature_celsius, self.humidity_percent
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_clamps_humidity() {
        assert_eq!(TelemetryReading::new(20, 150).humidity_percent, 100);
        assert_eq!(TelemetryReading::new(20, 42).humidity_percent, 42);
    }

    #[test]
    fn test_display() {
        assert_eq!(TelemetryReading::new(-3, 55).to_string(), "-3 °C, 55 %");
    }
}
