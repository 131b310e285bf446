//! Session setup and teardown.
//!
//! Drives a [`ConnectionStateMachine`] against a [`GattLink`]: each step the
//! machine asks for is executed with a bound on its duration, and the
//! completion is fed back as a [`LinkEvent`]. The resulting
//! [`ActiveSession`] releases the link on every exit path.

use futures::stream::{BoxStream, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ble::characteristics::{CharacteristicDescriptor, CharacteristicRegistry};
use crate::ble::connection::{ConnectionStateMachine, LinkEvent, Step};
use crate::ble::link::GattLink;
use crate::config::MonitorConfig;
use crate::data::DiscoveredDevice;
use crate::error::{Error, GattOperation, Result};
use crate::store::TelemetryStore;

/// Run `fut` with a bound, mapping each outcome to a completion event.
async fn bounded<T, F>(
    limit: Duration,
    operation: GattOperation,
    fut: F,
    on_ok: impl FnOnce(T) -> LinkEvent,
    on_err: impl FnOnce(Error) -> LinkEvent,
) -> LinkEvent
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => on_ok(value),
        Ok(Err(e)) => on_err(e),
        Err(_) => LinkEvent::TimedOut {
            operation,
            after: limit,
        },
    }
}

/// Best-effort link release.
async fn release<L: GattLink>(link: &L) {
    if let Err(e) = link.disconnect().await {
        debug!("Disconnect during teardown failed: {}", e);
    }
}

/// Schedule a link release from a synchronous context.
fn spawn_release<L: GattLink + 'static>(link: Arc<L>) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move { release(link.as_ref()).await });
    }
}

/// Read a characteristic once in the background, bounded by `limit`.
///
/// Failures are logged; they never end the session.
fn spawn_initial_read<L: GattLink + 'static>(
    registry: Arc<CharacteristicRegistry<L>>,
    characteristic: CharacteristicDescriptor,
    limit: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::time::timeout(limit, registry.read_once(&characteristic)).await {
            Ok(Ok(data)) => debug!(
                "Initial read of {}: {} bytes",
                characteristic.uuid,
                data.len()
            ),
            Ok(Err(e)) => warn!("Read of {} failed: {}", characteristic.uuid, e),
            Err(_) => warn!("Read of {} timed out after {:?}", characteristic.uuid, limit),
        }
    })
}

/// Connection setup in progress.
///
/// Dropped while armed, it returns the machine to `Idle` and schedules a
/// link release.
struct SetupGuard<'a, L: GattLink + 'static> {
    machine: &'a mut ConnectionStateMachine,
    link: Arc<L>,
    armed: bool,
}

impl<L: GattLink + 'static> Drop for SetupGuard<'_, L> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        debug!("Connection setup abandoned in {}", self.machine.state());
        self.machine.reset();
        spawn_release(self.link.clone());
    }
}

/// An established, subscribed session.
///
/// Dropping the session without calling [`close`](Self::close) schedules a
/// disconnect on the current Tokio runtime.
pub struct ActiveSession<L: GattLink + 'static> {
    /// The connected device.
    device: DiscoveredDevice,
    /// The link.
    link: Arc<L>,
    /// Characteristic access for the session.
    registry: Arc<CharacteristicRegistry<L>>,
    /// Notifications and link loss.
    events: BoxStream<'static, LinkEvent>,
    /// The one-off humidity read, while it runs.
    initial_read: Option<JoinHandle<()>>,
    /// Whether the link has been released.
    released: bool,
}

impl<L: GattLink + 'static> ActiveSession<L> {
    /// The connected device.
    pub fn device(&self) -> &DiscoveredDevice {
        &self.device
    }

    /// Characteristic access for the session.
    pub fn registry(&self) -> &CharacteristicRegistry<L> {
        &self.registry
    }

    /// Wait for the one-off humidity read to finish or give up.
    pub async fn initial_read_done(&mut self) {
        if let Some(handle) = self.initial_read.take() {
            let _ = handle.await;
        }
    }

    /// Feed link events through the machine until the session ends.
    ///
    /// Returns the reason the session ended. The link is released before
    /// returning.
    pub async fn pump(&mut self, machine: &mut ConnectionStateMachine) -> Error {
        loop {
            // A finished stream means the platform dropped the link.
            let event = self.events.next().await.unwrap_or(LinkEvent::Disconnected);

            match machine.handle(event) {
                Step::Deliver(notification) => {
                    self.registry
                        .deliver(&notification.characteristic_uuid, &notification.data);
                }
                Step::TearDown(err) => {
                    warn!("Session with {} ended: {}", self.device, err);
                    self.release().await;
                    return err;
                }
                _ => {}
            }
        }
    }

    /// Disconnect and consume the session.
    pub async fn close(mut self) -> Result<()> {
        info!("Closing session with {}", self.device);
        self.stop_initial_read();
        self.released = true;
        self.link.disconnect().await
    }

    fn stop_initial_read(&mut self) {
        if let Some(handle) = self.initial_read.take() {
            handle.abort();
        }
    }

    async fn release(&mut self) {
        self.stop_initial_read();
        if !self.released {
            self.released = true;
            release(self.link.as_ref()).await;
        }
    }
}

impl<L: GattLink + 'static> Drop for ActiveSession<L> {
    fn drop(&mut self) {
        self.stop_initial_read();
        if !self.released {
            spawn_release(self.link.clone());
        }
    }
}

/// Perform one connection attempt.
///
/// On failure the machine is back in `Idle` and the link has been released.
/// If the returned future is dropped before it completes, the machine is
/// reset and the link released in the background.
///
/// `Ready` is reached once notifications are enabled on the temperature
/// characteristic. The humidity read is queued behind that write and runs
/// alongside the session; its outcome does not affect the connection.
pub async fn establish<L: GattLink + 'static>(
    link: Arc<L>,
    device: &DiscoveredDevice,
    machine: &mut ConnectionStateMachine,
    store: Arc<TelemetryStore>,
    config: &MonitorConfig,
) -> Result<ActiveSession<L>> {
    let mut step = machine.connect(device)?;
    let mut guard = SetupGuard {
        machine,
        link: link.clone(),
        armed: true,
    };
    let mut subscribed = None;

    loop {
        let event = match step {
            Step::OpenLink => {
                info!("Connecting to {}", device);
                bounded(
                    config.connect_timeout,
                    GattOperation::Connect,
                    link.connect(),
                    |()| LinkEvent::Connected,
                    LinkEvent::ConnectFailed,
                )
                .await
            }
            Step::DiscoverServices => {
                bounded(
                    config.discovery_timeout,
                    GattOperation::DiscoverServices,
                    link.discover_services(),
                    LinkEvent::ServicesDiscovered,
                    LinkEvent::DiscoveryFailed,
                )
                .await
            }
            Step::Subscribe {
                services,
                temperature,
                humidity,
            } => {
                let registry = Arc::new(CharacteristicRegistry::new(
                    link.clone(),
                    services,
                    store.clone(),
                ));

                let subscribe = async {
                    // Open the event stream first so no notification is missed.
                    let events = link.events().await?;
                    registry.subscribe(&temperature).await?;
                    Ok::<_, Error>(events)
                };

                let outcome = tokio::time::timeout(config.discovery_timeout, subscribe).await;
                match outcome {
                    Ok(Ok(events)) => {
                        subscribed = Some((registry, events, humidity));
                        LinkEvent::SubscriptionComplete
                    }
                    Ok(Err(e)) => LinkEvent::SubscriptionFailed(e),
                    Err(_) => LinkEvent::TimedOut {
                        operation: GattOperation::Subscribe,
                        after: config.discovery_timeout,
                    },
                }
            }
            Step::Ready => {
                let (registry, events, humidity) =
                    subscribed.take().ok_or_else(|| Error::InvalidState {
                        state: guard.machine.state(),
                    })?;
                info!("Receiving telemetry from {}", device);

                let initial_read =
                    spawn_initial_read(registry.clone(), humidity, config.discovery_timeout);
                guard.armed = false;

                return Ok(ActiveSession {
                    device: device.clone(),
                    link,
                    registry,
                    events,
                    initial_read: Some(initial_read),
                    released: false,
                });
            }
            Step::TearDown(err) => {
                release(link.as_ref()).await;
                guard.armed = false;
                return Err(err);
            }
            Step::Deliver(_) | Step::Ignore => {
                let state = guard.machine.state();
                guard.machine.reset();
                release(link.as_ref()).await;
                guard.armed = false;
                return Err(Error::InvalidState { state });
            }
        };

        step = guard.machine.handle(event);
    }
}

/// Connect with bounded retries.
///
/// Retryable failures are retried up to the configured attempt count with a
/// linearly growing delay. The last error is returned.
pub async fn connect_with_retry<L: GattLink + 'static>(
    link: Arc<L>,
    device: &DiscoveredDevice,
    machine: &mut ConnectionStateMachine,
    store: Arc<TelemetryStore>,
    config: &MonitorConfig,
) -> Result<ActiveSession<L>> {
    let max_attempts = config.attempts();
    let mut attempts = 0;

    loop {
        attempts += 1;
        debug!("Connection attempt {} of {}", attempts, max_attempts);

        match establish(link.clone(), device, machine, store.clone(), config).await {
            Ok(session) => return Ok(session),
            Err(e) if e.is_retryable() && attempts < max_attempts => {
                warn!("Connection attempt {} failed: {}", attempts, e);
                tokio::time::sleep(config.backoff_for(attempts)).await;
            }
            Err(e) => {
                warn!("Giving up on {} after {} attempts: {}", device, attempts, e);
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::characteristics::NotificationEvent;
    use crate::ble::connection::ConnectionState;
    use crate::ble::link::fake::{ConnectBehavior, FakeLink, ReadBehavior};
    use crate::ble::link::MockGattLink;
    use crate::ble::uuids::*;
    use crate::data::TelemetryReading;
    use std::sync::atomic::Ordering;

    fn device() -> DiscoveredDevice {
        DiscoveredDevice::new("fake", Some(TARGET_DEVICE_NAME.to_string()), Some(-40))
    }

    fn fast_config() -> MonitorConfig {
        MonitorConfig::new()
            .connect_timeout(Duration::from_millis(50))
            .discovery_timeout(Duration::from_millis(500))
            .retry_backoff(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_establish_reaches_ready_and_reads_humidity() {
        let link = Arc::new(FakeLink::weather());
        let store = Arc::new(TelemetryStore::default());
        let mut machine = ConnectionStateMachine::new();

        let mut session = establish(
            link.clone(),
            &device(),
            &mut machine,
            store.clone(),
            &fast_config(),
        )
        .await
        .unwrap();

        assert_eq!(machine.state(), ConnectionState::Ready);
        assert_eq!(session.device().id, "fake");

        session.initial_read_done().await;
        assert_eq!(link.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(*link.requests.lock(), vec!["discover", "subscribe", "read"]);
        assert_eq!(store.latest(), Some(TelemetryReading::new(3, 41)));

        session.close().await.unwrap();
        assert_eq!(link.disconnect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_humidity_read_keeps_session() {
        let link = Arc::new(FakeLink::weather().with_read_behavior(ReadBehavior::Fail));
        let store = Arc::new(TelemetryStore::default());
        let mut machine = ConnectionStateMachine::new();

        let mut session = establish(
            link.clone(),
            &device(),
            &mut machine,
            store.clone(),
            &fast_config(),
        )
        .await
        .unwrap();
        session.initial_read_done().await;

        assert_eq!(machine.state(), ConnectionState::Ready);
        assert_eq!(store.latest(), None);
        assert_eq!(link.disconnect_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_hung_humidity_read_does_not_delay_ready() {
        let link = Arc::new(FakeLink::weather().with_read_behavior(ReadBehavior::Hang));
        let store = Arc::new(TelemetryStore::default());
        let mut machine = ConnectionStateMachine::new();
        let config = fast_config().discovery_timeout(Duration::from_millis(200));

        let mut session = tokio::time::timeout(
            Duration::from_millis(150),
            establish(link.clone(), &device(), &mut machine, store, &config),
        )
        .await
        .expect("ready before the read bound")
        .unwrap();

        assert_eq!(machine.state(), ConnectionState::Ready);

        // The read gives up on its own bound; the session stays up.
        session.initial_read_done().await;
        assert_eq!(machine.state(), ConnectionState::Ready);
        assert_eq!(link.disconnect_calls.load(Ordering::SeqCst), 0);

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_setup_resets_machine_and_releases_link() {
        let link = Arc::new(FakeLink::weather().with_connect_behavior(vec![ConnectBehavior::Hang]));
        let store = Arc::new(TelemetryStore::default());
        let mut machine = ConnectionStateMachine::new();
        let config = fast_config().connect_timeout(Duration::from_secs(60));

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            establish(link.clone(), &device(), &mut machine, store.clone(), &config),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(machine.state(), ConnectionState::Idle);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(link.disconnect_calls.load(Ordering::SeqCst), 1);

        // The machine accepts a fresh attempt.
        let session = establish(link.clone(), &device(), &mut machine, store, &config)
            .await
            .unwrap();
        assert_eq!(machine.state(), ConnectionState::Ready);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_service_is_not_retried() {
        let link = Arc::new(FakeLink::new(Vec::new()));
        let store = Arc::new(TelemetryStore::default());
        let mut machine = ConnectionStateMachine::new();

        let err = connect_with_retry(link.clone(), &device(), &mut machine, store, &fast_config())
            .await
            .err()
            .unwrap();

        assert!(matches!(err, Error::ServiceNotFound { .. }));
        assert_eq!(link.connect_calls.load(Ordering::SeqCst), 1);
        assert_eq!(link.disconnect_calls.load(Ordering::SeqCst), 1);
        assert_eq!(machine.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_connect_failures_are_retried() {
        let link = Arc::new(
            FakeLink::weather()
                .with_connect_behavior(vec![ConnectBehavior::Fail, ConnectBehavior::Hang]),
        );
        let store = Arc::new(TelemetryStore::default());
        let mut machine = ConnectionStateMachine::new();

        let session =
            connect_with_retry(link.clone(), &device(), &mut machine, store, &fast_config())
                .await
                .unwrap();

        assert_eq!(link.connect_calls.load(Ordering::SeqCst), 3);
        assert_eq!(machine.state(), ConnectionState::Ready);
        drop(session);
    }

    #[tokio::test]
    async fn test_retries_are_capped() {
        let link = Arc::new(FakeLink::weather().with_connect_behavior(vec![
            ConnectBehavior::Hang,
            ConnectBehavior::Hang,
            ConnectBehavior::Hang,
        ]));
        let store = Arc::new(TelemetryStore::default());
        let mut machine = ConnectionStateMachine::new();

        let err = connect_with_retry(link.clone(), &device(), &mut machine, store, &fast_config())
            .await
            .err()
            .unwrap();

        assert!(matches!(
            err,
            Error::Timeout {
                operation: GattOperation::Connect,
                ..
            }
        ));
        assert_eq!(link.connect_calls.load(Ordering::SeqCst), 3);
        assert_eq!(machine.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_pump_delivers_and_ends_on_disconnect() {
        let link = Arc::new(FakeLink::weather());
        let store = Arc::new(TelemetryStore::default());
        let mut machine = ConnectionStateMachine::new();

        let mut session = establish(
            link.clone(),
            &device(),
            &mut machine,
            store.clone(),
            &fast_config(),
        )
        .await
        .unwrap();
        session.initial_read_done().await;

        link.emit(LinkEvent::Notification(NotificationEvent {
            characteristic_uuid: TEMPERATURE_CHARACTERISTIC_UUID,
            data: vec![0x00, 0x10, 0x09, 0x02, 0x1C],
        }));
        link.emit(LinkEvent::Notification(NotificationEvent {
            characteristic_uuid: TEMPERATURE_CHARACTERISTIC_UUID,
            data: vec![0x00, 0x01],
        }));
        link.emit(LinkEvent::Disconnected);

        let err = session.pump(&mut machine).await;

        assert!(matches!(err, Error::ConnectionLost));
        // 0x0910 = 2320 -> 23 °C, 0x021C = 540 -> 54 %; the short sample is dropped.
        assert_eq!(store.latest(), Some(TelemetryReading::new(23, 54)));
        assert_eq!(machine.state(), ConnectionState::Idle);
        assert_eq!(link.disconnect_calls.load(Ordering::SeqCst), 1);

        drop(session);
        tokio::task::yield_now().await;
        assert_eq!(link.disconnect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_session_releases_link() {
        let link = Arc::new(FakeLink::weather());
        let store = Arc::new(TelemetryStore::default());
        let mut machine = ConnectionStateMachine::new();

        let session = establish(link.clone(), &device(), &mut machine, store, &fast_config())
            .await
            .unwrap();
        drop(session);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(link.disconnect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_with_mock_link() {
        let mut link = MockGattLink::new();
        link.expect_connect().times(1).returning(|| {
            Err(Error::GattOperationFailed {
                operation: GattOperation::Connect,
                reason: "status 133".to_string(),
            })
        });
        link.expect_disconnect().times(1).returning(|| Ok(()));
        link.expect_discover_services().never();

        let store = Arc::new(TelemetryStore::default());
        let mut machine = ConnectionStateMachine::new();
        let config = fast_config().max_connect_attempts(1);

        let err = connect_with_retry(Arc::new(link), &device(), &mut machine, store, &config)
            .await
            .err()
            .unwrap();

        assert!(matches!(err, Error::GattOperationFailed { .. }));
        assert_eq!(machine.state(), ConnectionState::Idle);
    }
}
