//! BLE connection lifecycle.
//!
//! [`ConnectionStateMachine`] tracks one connection attempt from "address
//! known" to "subscribed and receiving". It performs no I/O: every
//! transition is caused by exactly one [`LinkEvent`] reporting the completion
//! of a radio operation, and each transition returns the [`Step`] the driver
//! must execute next.

use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::ble::characteristics::{
    resolve_in, CharacteristicDescriptor, NotificationEvent, ServiceDescriptor,
};
use crate::ble::uuids::*;
use crate::data::DiscoveredDevice;
use crate::error::{Error, GattOperation, Result};

/// Connection state for the beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No session.
    #[default]
    Idle,
    /// Waiting for the connect completion.
    Connecting,
    /// Link open.
    Connected,
    /// Waiting for the service discovery completion.
    DiscoveringServices,
    /// Waiting for the notification-enable write to complete.
    Subscribing,
    /// Subscribed and receiving.
    Ready,
    /// Link dropped or could not be opened.
    Disconnected,
    /// Session could not be set up.
    Failed,
}

impl ConnectionState {
    /// Check if a session exists in this state.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Idle | Self::Disconnected | Self::Failed)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected | Self::DiscoveringServices | Self::Subscribing
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::DiscoveringServices => write!(f, "DiscoveringServices"),
            Self::Subscribing => write!(f, "Subscribing"),
            Self::Ready => write!(f, "Ready"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Event for connection state changes.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    /// The identifier of the peripheral.
    pub identifier: String,
    /// The new connection state.
    pub state: ConnectionState,
}

/// Completion reported by the radio stack.
#[derive(Debug)]
pub enum LinkEvent {
    /// The connect request succeeded.
    Connected,
    /// The connect request failed.
    ConnectFailed(Error),
    /// Service discovery completed.
    ServicesDiscovered(Vec<ServiceDescriptor>),
    /// Service discovery completed with a failure status.
    DiscoveryFailed(Error),
    /// The notification-enable write completed.
    SubscriptionComplete,
    /// The notification-enable write failed.
    SubscriptionFailed(Error),
    /// A bounded wait expired.
    TimedOut {
        /// The operation that did not complete.
        operation: GattOperation,
        /// The bound that expired.
        after: Duration,
    },
    /// A characteristic value arrived.
    Notification(NotificationEvent),
    /// The link dropped.
    Disconnected,
}

/// What the driver must do after a transition.
#[derive(Debug)]
pub enum Step {
    /// Issue the connect request.
    OpenLink,
    /// Issue service discovery.
    DiscoverServices,
    /// Enable notifications on temperature and read humidity once.
    Subscribe {
        /// Services discovered for the session.
        services: Vec<ServiceDescriptor>,
        /// Temperature characteristic (notify).
        temperature: CharacteristicDescriptor,
        /// Humidity characteristic (read).
        humidity: CharacteristicDescriptor,
    },
    /// Session is ready; start consuming events.
    Ready,
    /// Decode and publish a value.
    Deliver(NotificationEvent),
    /// Release the link. The machine is already back in `Idle`.
    TearDown(Error),
    /// Event not valid in the current state.
    Ignore,
}

/// Lifecycle of a single connection.
pub struct ConnectionStateMachine {
    /// Current state.
    state: ConnectionState,
    /// Device of the current session.
    device: Option<DiscoveredDevice>,
    /// Channel for connection events.
    event_tx: broadcast::Sender<ConnectionEvent>,
    /// Latest state for observers that do not own the machine.
    state_tx: watch::Sender<ConnectionState>,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    /// Create a machine in `Idle`.
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(16);
        Self::with_sender(event_tx)
    }

    /// Create a machine publishing its events on an existing channel.
    pub fn with_sender(event_tx: broadcast::Sender<ConnectionEvent>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);

        Self {
            state: ConnectionState::Idle,
            device: None,
            event_tx,
            state_tx,
        }
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Device of the current session, if any.
    pub fn device(&self) -> Option<&DiscoveredDevice> {
        self.device.as_ref()
    }

    /// Subscribe to connection events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Watch the current state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Begin a connection attempt. Only valid from `Idle`.
    pub fn connect(&mut self, device: &DiscoveredDevice) -> Result<Step> {
        if self.state != ConnectionState::Idle {
            return Err(Error::InvalidState { state: self.state });
        }

        self.device = Some(device.clone());
        self.set_state(ConnectionState::Connecting);

        Ok(Step::OpenLink)
    }

    /// Apply one completion event.
    pub fn handle(&mut self, event: LinkEvent) -> Step {
        use ConnectionState::*;

        match (self.state, event) {
            (Connecting, LinkEvent::Connected) => {
                self.set_state(Connected);
                self.set_state(DiscoveringServices);
                Step::DiscoverServices
            }
            (Connecting, LinkEvent::ConnectFailed(err)) => self.tear_down(Disconnected, err),
            (DiscoveringServices, LinkEvent::ServicesDiscovered(services)) => {
                let resolved = resolve_in(
                    &services,
                    WEATHER_SERVICE_UUID,
                    TEMPERATURE_CHARACTERISTIC_UUID,
                )
                .and_then(|temperature| {
                    resolve_in(&services, WEATHER_SERVICE_UUID, HUMIDITY_CHARACTERISTIC_UUID)
                        .map(|humidity| (temperature, humidity))
                });

                match resolved {
                    Ok((temperature, humidity)) => {
                        self.set_state(Subscribing);
                        Step::Subscribe {
                            services,
                            temperature,
                            humidity,
                        }
                    }
                    Err(err) => self.tear_down(Failed, err),
                }
            }
            (DiscoveringServices, LinkEvent::DiscoveryFailed(err)) => self.tear_down(Failed, err),
            (Subscribing, LinkEvent::SubscriptionComplete) => {
                self.set_state(Ready);
                Step::Ready
            }
            (Subscribing, LinkEvent::SubscriptionFailed(err)) => self.tear_down(Failed, err),
            (
                Connecting | DiscoveringServices | Subscribing,
                LinkEvent::TimedOut { operation, after },
            ) => {
                let timeout_ms = u64::try_from(after.as_millis()).unwrap_or(u64::MAX);
                self.tear_down(Failed, Error::Timeout { operation, timeout_ms })
            }
            (Subscribing | Ready, LinkEvent::Notification(notification)) => {
                Step::Deliver(notification)
            }
            (state, LinkEvent::Disconnected) if state.is_active() => {
                self.tear_down(Disconnected, Error::ConnectionLost)
            }
            (state, event) => {
                debug!("Ignoring {:?} in state {}", event, state);
                Step::Ignore
            }
        }
    }

    /// Return to `Idle` from any state, dropping the session.
    pub fn reset(&mut self) {
        self.set_state(ConnectionState::Idle);
        self.device = None;
    }

    /// Pass through a terminal state and back to `Idle`.
    fn tear_down(&mut self, terminal: ConnectionState, err: Error) -> Step {
        debug!("Session ending in {}: {}", terminal, err);
        self.set_state(terminal);
        self.reset();
        Step::TearDown(err)
    }

    /// Update the connection state and emit an event.
    fn set_state(&mut self, new_state: ConnectionState) {
        let old_state = std::mem::replace(&mut self.state, new_state);

        if old_state != new_state {
            debug!("Connection state changed: {} -> {}", old_state, new_state);
            self.state_tx.send_replace(new_state);

            let identifier = self
                .device
                .as_ref()
                .map(|d| d.id.clone())
                .unwrap_or_default();
            let _ = self.event_tx.send(ConnectionEvent {
                identifier,
                state: new_state,
            });
        }
    }
}
