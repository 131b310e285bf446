//! GATT characteristic handling.
//!
//! Provides the registry that resolves the weather characteristics of a
//! connected session and issues subscribe and read requests against them,
//! one at a time.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::ble::link::GattLink;
use crate::ble::uuids::is_weather_characteristic;
use crate::data::TelemetryReading;
use crate::error::{Error, Result};
use crate::protocol::payload;
use crate::store::TelemetryStore;

/// Notification event from a characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    /// UUID of the characteristic that sent the notification.
    pub characteristic_uuid: Uuid,
    /// The notification data.
    pub data: Vec<u8>,
}

/// A discovered GATT characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicDescriptor {
    /// UUID of the owning service.
    pub service_uuid: Uuid,
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Supports read requests.
    pub readable: bool,
    /// Supports notifications.
    pub notifiable: bool,
}

/// A discovered GATT service.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServiceDescriptor {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics of this service.
    pub characteristics: Vec<CharacteristicDescriptor>,
}

/// Look up a characteristic in a discovered service table.
pub fn resolve_in(
    services: &[ServiceDescriptor],
    service_id: Uuid,
    characteristic_id: Uuid,
) -> Result<CharacteristicDescriptor> {
    let service = services
        .iter()
        .find(|s| s.uuid == service_id)
        .ok_or_else(|| Error::ServiceNotFound {
            uuid: service_id.to_string(),
        })?;

    service
        .characteristics
        .iter()
        .find(|c| c.uuid == characteristic_id)
        .copied()
        .ok_or_else(|| {
            for c in &service.characteristics {
                debug!("  Available characteristic: {}", c.uuid);
            }
            Error::CharacteristicNotFound {
                uuid: characteristic_id.to_string(),
            }
        })
}

/// Characteristic access for one connected session.
///
/// Every request holds a single slot for its whole duration, so a request
/// issued while another is outstanding waits until the first completes.
pub struct CharacteristicRegistry<L: GattLink> {
    /// The session's link.
    link: Arc<L>,
    /// Services discovered on connect.
    services: Vec<ServiceDescriptor>,
    /// Decoded readings go here.
    store: Arc<TelemetryStore>,
    /// Outstanding-request slot.
    slot: Mutex<()>,
}

impl<L: GattLink> CharacteristicRegistry<L> {
    /// Create a registry for a session whose services have been discovered.
    pub fn new(link: Arc<L>, services: Vec<ServiceDescriptor>, store: Arc<TelemetryStore>) -> Self {
        Self {
            link,
            services,
            store,
            slot: Mutex::new(()),
        }
    }

    /// Resolve a characteristic by service and characteristic UUID.
    pub fn resolve(
        &self,
        service_id: Uuid,
        characteristic_id: Uuid,
    ) -> Result<CharacteristicDescriptor> {
        resolve_in(&self.services, service_id, characteristic_id)
    }

    /// Services discovered for this session.
    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    /// Check whether a request is currently outstanding.
    pub fn has_outstanding_request(&self) -> bool {
        self.slot.try_lock().is_err()
    }

    /// Enable notifications on a characteristic.
    ///
    /// Resolves once the client configuration descriptor write completes.
    pub async fn subscribe(&self, characteristic: &CharacteristicDescriptor) -> Result<()> {
        if !characteristic.notifiable {
            return Err(Error::NotSupported {
                operation: format!("notifications on {}", characteristic.uuid),
            });
        }

        let _slot = self.slot.lock().await;
        debug!("Subscribing to characteristic {}", characteristic.uuid);

        self.link.enable_notifications(characteristic).await?;

        debug!(
            "Successfully subscribed to notifications from {}",
            characteristic.uuid
        );

        Ok(())
    }

    /// Read a characteristic once and deliver the value to the decoder.
    pub async fn read_once(&self, characteristic: &CharacteristicDescriptor) -> Result<Vec<u8>> {
        if !characteristic.readable {
            return Err(Error::NotSupported {
                operation: format!("read of {}", characteristic.uuid),
            });
        }

        let data = {
            let _slot = self.slot.lock().await;
            trace!("Reading characteristic {}", characteristic.uuid);
            self.link.read(characteristic).await?
        };

        self.deliver(&characteristic.uuid, &data);

        Ok(data)
    }

    /// Decode a value and publish it.
    ///
    /// A payload that fails to decode is logged and dropped, and values from
    /// characteristics other than temperature and humidity are ignored.
    pub fn deliver(&self, uuid: &Uuid, data: &[u8]) -> Option<TelemetryReading> {
        if !is_weather_characteristic(uuid) {
            trace!("Ignoring value from characteristic {}", uuid);
            return None;
        }

        debug!(
            "Payload from {}: {} bytes, data: {:02X?}",
            uuid,
            data.len(),
            data
        );

        match payload::decode(data) {
            Ok(reading) => {
                self.store.update(reading);
                Some(reading)
            }
            Err(e) => {
                warn!("Discarding sample from {}: {}", uuid, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::link::fake::{weather_services, FakeLink};
    use crate::ble::uuids::*;
    use std::sync::atomic::Ordering;

    fn registry(link: Arc<FakeLink>) -> (CharacteristicRegistry<FakeLink>, Arc<TelemetryStore>) {
        let store = Arc::new(TelemetryStore::new(16));
        let services = link.services.clone();
        (CharacteristicRegistry::new(link, services, store.clone()), store)
    }

    #[test]
    fn test_resolve() {
        let services = weather_services();
        let temperature = resolve_in(
            &services,
            WEATHER_SERVICE_UUID,
            TEMPERATURE_CHARACTERISTIC_UUID,
        )
        .unwrap();
        assert_eq!(temperature.uuid, TEMPERATURE_CHARACTERISTIC_UUID);
        assert!(temperature.notifiable);
    }

    #[test]
    fn test_resolve_missing_service() {
        let err = resolve_in(&[], WEATHER_SERVICE_UUID, TEMPERATURE_CHARACTERISTIC_UUID)
            .unwrap_err();
        assert!(matches!(err, Error::ServiceNotFound { .. }));
    }

    #[test]
    fn test_resolve_missing_characteristic() {
        let err = resolve_in(
            &weather_services(),
            WEATHER_SERVICE_UUID,
            CLIENT_CONFIG_DESCRIPTOR_UUID,
        )
        .unwrap_err();
        assert!(matches!(err, Error::CharacteristicNotFound { .. }));
    }

    #[tokio::test]
    async fn test_back_to_back_requests_are_serialized() {
        let link = Arc::new(FakeLink::weather());
        let (registry, _) = registry(link.clone());
        let temperature = registry
            .resolve(WEATHER_SERVICE_UUID, TEMPERATURE_CHARACTERISTIC_UUID)
            .unwrap();
        let humidity = registry
            .resolve(WEATHER_SERVICE_UUID, HUMIDITY_CHARACTERISTIC_UUID)
            .unwrap();

        let (subscribed, read) = tokio::join!(
            registry.subscribe(&temperature),
            registry.read_once(&humidity)
        );

        assert!(subscribed.is_ok());
        assert!(read.is_ok());
        assert_eq!(link.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(*link.requests.lock(), vec!["subscribe", "read"]);
        assert!(!registry.has_outstanding_request());
    }

    #[tokio::test]
    async fn test_read_once_delivers_to_store() {
        let link = Arc::new(FakeLink::weather());
        let (registry, store) = registry(link);
        let humidity = registry
            .resolve(WEATHER_SERVICE_UUID, HUMIDITY_CHARACTERISTIC_UUID)
            .unwrap();

        registry.read_once(&humidity).await.unwrap();

        assert_eq!(store.latest(), Some(TelemetryReading::new(3, 41)));
    }

    #[tokio::test]
    async fn test_capability_flags_enforced() {
        let link = Arc::new(FakeLink::weather());
        let (registry, _) = registry(link.clone());
        let humidity = registry
            .resolve(WEATHER_SERVICE_UUID, HUMIDITY_CHARACTERISTIC_UUID)
            .unwrap();

        let err = registry.subscribe(&humidity).await.unwrap_err();
        assert!(matches!(err, Error::NotSupported { .. }));
        assert!(link.requests.lock().is_empty());
    }

    #[test]
    fn test_deliver_discards_short_payload() {
        let link = Arc::new(FakeLink::weather());
        let (registry, store) = registry(link);

        assert_eq!(
            registry.deliver(&TEMPERATURE_CHARACTERISTIC_UUID, &[1, 2, 3]),
            None
        );
        assert_eq!(store.latest(), None);

        let reading = registry.deliver(
            &TEMPERATURE_CHARACTERISTIC_UUID,
            &[0, 0x34, 0x01, 0x00, 0x96],
        );
        assert_eq!(reading, Some(TelemetryReading::new(3, 15)));
        assert_eq!(store.latest(), reading);
    }

    #[test]
    fn test_deliver_ignores_other_characteristics() {
        let link = Arc::new(FakeLink::weather());
        let (registry, store) = registry(link);

        let battery = Uuid::from_u128(0x0000_2a19_0000_1000_8000_00805f9b34fb);
        assert_eq!(
            registry.deliver(&battery, &[0, 0x34, 0x01, 0x00, 0x96]),
            None
        );
        assert_eq!(store.latest(), None);
    }
}
