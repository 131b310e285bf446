//! Radio link abstraction.
//!
//! [`GattLink`] is the set of GATT requests a session needs from the radio
//! stack. [`BtleplugLink`] implements it on top of a btleplug peripheral.

use async_trait::async_trait;
use btleplug::api::{Central as _, CentralEvent, CharPropFlags, Characteristic, Peripheral as _};
use btleplug::platform::{Adapter, Peripheral};
use futures::stream::{BoxStream, StreamExt};
use tracing::{debug, trace};

use crate::ble::characteristics::{CharacteristicDescriptor, NotificationEvent, ServiceDescriptor};
use crate::ble::connection::LinkEvent;
use crate::error::{Error, GattOperation, Result};

/// GATT requests against one peripheral.
///
/// Each request resolves once the radio stack reports completion. Callers
/// must not issue a second request before the first resolves; the
/// [`CharacteristicRegistry`](crate::ble::CharacteristicRegistry) enforces this.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Platform identifier of the peripheral.
    fn identifier(&self) -> String;

    /// Open the link.
    async fn connect(&self) -> Result<()>;

    /// Discover the peripheral's services and characteristics.
    async fn discover_services(&self) -> Result<Vec<ServiceDescriptor>>;

    /// Write the client configuration descriptor to enable notifications.
    async fn enable_notifications(&self, characteristic: &CharacteristicDescriptor) -> Result<()>;

    /// Read a characteristic value once.
    async fn read(&self, characteristic: &CharacteristicDescriptor) -> Result<Vec<u8>>;

    /// Stream of unsolicited events: notifications and link loss.
    async fn events(&self) -> Result<BoxStream<'static, LinkEvent>>;

    /// Close the link.
    async fn disconnect(&self) -> Result<()>;
}

/// [`GattLink`] backed by a btleplug peripheral.
#[derive(Debug, Clone)]
pub struct BtleplugLink {
    /// Adapter the peripheral was discovered on.
    adapter: Adapter,
    /// The peripheral handle.
    peripheral: Peripheral,
}

impl BtleplugLink {
    /// Create a link for a discovered peripheral.
    pub fn new(adapter: Adapter, peripheral: Peripheral) -> Self {
        Self {
            adapter,
            peripheral,
        }
    }

    /// Get the peripheral.
    pub fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    /// Find the platform characteristic matching a descriptor.
    fn find(&self, descriptor: &CharacteristicDescriptor) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == descriptor.uuid && c.service_uuid == descriptor.service_uuid)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: descriptor.uuid.to_string(),
            })
    }
}

/// Map a platform error raised by a GATT request.
fn gatt_error(operation: GattOperation, err: btleplug::Error) -> Error {
    match err {
        btleplug::Error::PermissionDenied => Error::PermissionDenied,
        other => Error::GattOperationFailed {
            operation,
            reason: other.to_string(),
        },
    }
}

#[async_trait]
impl GattLink for BtleplugLink {
    fn identifier(&self) -> String {
        self.peripheral.id().to_string()
    }

    async fn connect(&self) -> Result<()> {
        if self.peripheral.is_connected().await.unwrap_or(false) {
            debug!("Peripheral already connected at BLE level");
            return Ok(());
        }

        self.peripheral
            .connect()
            .await
            .map_err(|e| gatt_error(GattOperation::Connect, e))
    }

    async fn discover_services(&self) -> Result<Vec<ServiceDescriptor>> {
        self.peripheral
            .discover_services()
            .await
            .map_err(|e| gatt_error(GattOperation::DiscoverServices, e))?;

        let services = self
            .peripheral
            .services()
            .into_iter()
            .map(|service| ServiceDescriptor {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| CharacteristicDescriptor {
                        service_uuid: c.service_uuid,
                        uuid: c.uuid,
                        readable: c.properties.contains(CharPropFlags::READ),
                        notifiable: c.properties.contains(CharPropFlags::NOTIFY),
                    })
                    .collect(),
            })
            .collect::<Vec<_>>();

        debug!("Discovered {} services", services.len());

        Ok(services)
    }

    async fn enable_notifications(&self, characteristic: &CharacteristicDescriptor) -> Result<()> {
        let target = self.find(characteristic)?;

        // btleplug writes the CCCD itself; CoreBluetooth rejects direct writes to it.
        self.peripheral
            .subscribe(&target)
            .await
            .map_err(|e| gatt_error(GattOperation::Subscribe, e))
    }

    async fn read(&self, characteristic: &CharacteristicDescriptor) -> Result<Vec<u8>> {
        let target = self.find(characteristic)?;

        let data = self
            .peripheral
            .read(&target)
            .await
            .map_err(|e| gatt_error(GattOperation::Read, e))?;

        trace!(
            "Read {} bytes from characteristic {}",
            data.len(),
            characteristic.uuid
        );

        Ok(data)
    }

    async fn events(&self) -> Result<BoxStream<'static, LinkEvent>> {
        let notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(Error::Bluetooth)?
            .map(|n| {
                LinkEvent::Notification(NotificationEvent {
                    characteristic_uuid: n.uuid,
                    data: n.value,
                })
            });

        let id = self.peripheral.id();
        let disconnects = self
            .adapter
            .events()
            .await
            .map_err(Error::Bluetooth)?
            .filter_map(move |event| {
                let matches = matches!(&event, CentralEvent::DeviceDisconnected(d) if *d == id);
                async move { matches.then_some(LinkEvent::Disconnected) }
            });

        Ok(futures::stream::select(notifications, disconnects).boxed())
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await.map_err(Error::Bluetooth)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scriptable in-memory link for tests.

    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    use crate::ble::uuids::*;

    /// How the fake answers a connect request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ConnectBehavior {
        Succeed,
        Fail,
        Hang,
    }

    /// How the fake answers a read request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ReadBehavior {
        Succeed,
        Fail,
        Hang,
    }

    pub struct FakeLink {
        pub connect_behavior: Mutex<Vec<ConnectBehavior>>,
        pub services: Vec<ServiceDescriptor>,
        pub read_value: Vec<u8>,
        pub read_behavior: ReadBehavior,
        pub request_delay: Duration,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
        pub connect_calls: AtomicUsize,
        pub disconnect_calls: AtomicUsize,
        pub requests: Mutex<Vec<&'static str>>,
        event_tx: mpsc::UnboundedSender<LinkEvent>,
        event_rx: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
    }

    pub fn weather_services() -> Vec<ServiceDescriptor> {
        vec![ServiceDescriptor {
            uuid: WEATHER_SERVICE_UUID,
            characteristics: vec![
                CharacteristicDescriptor {
                    service_uuid: WEATHER_SERVICE_UUID,
                    uuid: TEMPERATURE_CHARACTERISTIC_UUID,
                    readable: true,
                    notifiable: true,
                },
                CharacteristicDescriptor {
                    service_uuid: WEATHER_SERVICE_UUID,
                    uuid: HUMIDITY_CHARACTERISTIC_UUID,
                    readable: true,
                    notifiable: false,
                },
            ],
        }]
    }

    impl FakeLink {
        pub fn new(services: Vec<ServiceDescriptor>) -> Self {
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            Self {
                connect_behavior: Mutex::new(Vec::new()),
                services,
                read_value: vec![0x00, 0x34, 0x01, 0x01, 0x96],
                read_behavior: ReadBehavior::Succeed,
                request_delay: Duration::from_millis(10),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                connect_calls: AtomicUsize::new(0),
                disconnect_calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
            }
        }

        pub fn weather() -> Self {
            Self::new(weather_services())
        }

        /// Script connect outcomes, consumed in order. Defaults to success.
        pub fn with_connect_behavior(self, behavior: Vec<ConnectBehavior>) -> Self {
            *self.connect_behavior.lock() = behavior;
            self
        }

        pub fn with_read_behavior(mut self, behavior: ReadBehavior) -> Self {
            self.read_behavior = behavior;
            self
        }

        pub fn emit(&self, event: LinkEvent) {
            let _ = self.event_tx.send(event);
        }

        async fn request<T>(&self, name: &'static str, value: T) -> T {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.requests.lock().push(name);
            tokio::time::sleep(self.request_delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            value
        }
    }

    #[async_trait]
    impl GattLink for FakeLink {
        fn identifier(&self) -> String {
            "fake".to_string()
        }

        async fn connect(&self) -> Result<()> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            let behavior = {
                let mut script = self.connect_behavior.lock();
                if script.is_empty() {
                    ConnectBehavior::Succeed
                } else {
                    script.remove(0)
                }
            };
            match behavior {
                ConnectBehavior::Succeed => Ok(()),
                ConnectBehavior::Fail => Err(Error::GattOperationFailed {
                    operation: GattOperation::Connect,
                    reason: "status 133".to_string(),
                }),
                ConnectBehavior::Hang => {
                    futures::future::pending::<()>().await;
                    Ok(())
                }
            }
        }

        async fn discover_services(&self) -> Result<Vec<ServiceDescriptor>> {
            Ok(self.request("discover", self.services.clone()).await)
        }

        async fn enable_notifications(&self, _: &CharacteristicDescriptor) -> Result<()> {
            self.request("subscribe", ()).await;
            Ok(())
        }

        async fn read(&self, _: &CharacteristicDescriptor) -> Result<Vec<u8>> {
            match self.read_behavior {
                ReadBehavior::Succeed => Ok(self.request("read", self.read_value.clone()).await),
                ReadBehavior::Fail => {
                    self.request("read", ()).await;
                    Err(Error::GattOperationFailed {
                        operation: GattOperation::Read,
                        reason: "status 2".to_string(),
                    })
                }
                ReadBehavior::Hang => {
                    self.requests.lock().push("read");
                    futures::future::pending::<()>().await;
                    Ok(Vec::new())
                }
            }
        }

        async fn events(&self) -> Result<BoxStream<'static, LinkEvent>> {
            let rx = self.event_rx.lock().take().ok_or(Error::NotConnected)?;
            Ok(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            })
            .boxed())
        }

        async fn disconnect(&self) -> Result<()> {
            self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
