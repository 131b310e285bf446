//! Discovered device data structures.

/// A device reported by the scanner.
///
/// Devices are deduplicated by `id` within one scan session.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveredDevice {
    /// Platform peripheral identifier (radio address on most platforms).
    pub id: String,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

impl DiscoveredDevice {
    /// Create a new discovered device.
    pub fn new(id: impl Into<String>, name: Option<String>, rssi: Option<i16>) -> Self {
        Self {
            id: id.into(),
            name,
            rssi,
        }
    }

    /// Check whether the advertised name equals `target` exactly.
    pub fn has_name(&self, target: &str) -> bool {
        self.name.as_deref() == Some(target)
    }
}

impl std::fmt::Display for DiscoveredDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}
