//! Weather monitor: scan, connect and keep the latest reading.
//!
//! The monitor owns the scanner, the connection state machine and the
//! telemetry store. [`WeatherMonitor::run`] drives one full cycle: scan until
//! the beacon advertises, connect with bounded retries, then feed
//! notifications into the store until the link goes away.

use btleplug::platform::Peripheral;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::ble::connection::{ConnectionEvent, ConnectionState, ConnectionStateMachine};
use crate::ble::link::{BtleplugLink, GattLink};
use crate::ble::scanner::{BleScanner, ScanEvent};
use crate::ble::session::connect_with_retry;
use crate::config::MonitorConfig;
use crate::data::DiscoveredDevice;
use crate::error::{Error, Result};
use crate::store::TelemetryStore;

/// Resolves once shutdown has been requested.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Returns the machine to `Idle` when a session ends, however it ends.
struct IdleOnDrop<'a> {
    machine: &'a mut ConnectionStateMachine,
}

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        self.machine.reset();
    }
}

/// Clears the monitor's link slot when a cycle ends, however it ends.
struct LinkSlot<'a> {
    slot: &'a Mutex<Option<Arc<BtleplugLink>>>,
}

impl Drop for LinkSlot<'_> {
    fn drop(&mut self) {
        self.slot.lock().take();
    }
}

/// Refuse to scan while a session holds the radio.
fn ensure_no_session(state: ConnectionState, link_held: bool) -> Result<()> {
    if state.is_active() || link_held {
        return Err(Error::InvalidState { state });
    }
    Ok(())
}

/// Connect to `device` and pump its events into `store`.
///
/// Returns `Ok(())` when shutdown was requested, and the session's terminal
/// error otherwise. The machine is back in `Idle` once this returns or is
/// dropped.
async fn drive<L: GattLink + 'static>(
    link: Arc<L>,
    device: &DiscoveredDevice,
    machine: &mut ConnectionStateMachine,
    store: Arc<TelemetryStore>,
    config: &MonitorConfig,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    let mut scope = IdleOnDrop { machine };

    let connected = tokio::select! {
        connected = connect_with_retry(link, device, &mut *scope.machine, store, config) => {
            connected
        }
        _ = stopped(shutdown) => {
            // Dropping the attempt releases the link.
            debug!("Shutdown during connection setup");
            return Ok(());
        }
    };

    let mut session = connected?;

    tokio::select! {
        err = session.pump(&mut *scope.machine) => Err(err),
        _ = stopped(shutdown) => session.close().await,
    }
}

/// High-level client for the IPVSWeather beacon.
pub struct WeatherMonitor {
    /// Monitor settings.
    config: MonitorConfig,
    /// BLE scanner.
    scanner: Arc<BleScanner>,
    /// Latest reading.
    store: Arc<TelemetryStore>,
    /// Connection lifecycle, held by `run` for the whole session.
    machine: tokio::sync::Mutex<ConnectionStateMachine>,
    /// Connection event channel shared with the machine.
    connection_tx: broadcast::Sender<ConnectionEvent>,
    /// Current connection state.
    state_rx: watch::Receiver<ConnectionState>,
    /// Shutdown signal.
    shutdown_tx: watch::Sender<bool>,
    /// Link of the session in progress.
    active_link: Mutex<Option<Arc<BtleplugLink>>>,
}

impl WeatherMonitor {
    /// Create a monitor on the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdapterUnavailable`] if Bluetooth is not available.
    pub async fn new(config: MonitorConfig) -> Result<Self> {
        let scanner = BleScanner::new(config.target_name.clone(), config.event_buffer).await?;
        Ok(Self::with_scanner(config, scanner))
    }

    /// Create a monitor around an existing scanner.
    pub fn with_scanner(config: MonitorConfig, scanner: BleScanner) -> Self {
        let (connection_tx, _) = broadcast::channel(config.event_buffer.max(1));
        let machine = ConnectionStateMachine::with_sender(connection_tx.clone());
        let state_rx = machine.watch_state();
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            store: Arc::new(TelemetryStore::new(config.event_buffer)),
            scanner: Arc::new(scanner),
            machine: tokio::sync::Mutex::new(machine),
            connection_tx,
            state_rx,
            shutdown_tx,
            active_link: Mutex::new(None),
            config,
        }
    }

    /// Start scanning for advertising devices.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] while a session is being set up or
    /// is active; scanning and connecting never overlap.
    pub async fn start_scanning(&self) -> Result<()> {
        let link_held = self.active_link.lock().is_some();
        ensure_no_session(self.connection_state(), link_held)?;

        self.scanner.start_scanning().await
    }

    /// Stop scanning.
    pub async fn stop_scanning(&self) -> Result<()> {
        self.scanner.stop_scanning().await
    }

    /// Check if scanning is active.
    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// Devices seen in the current scan session.
    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.scanner.discovered_devices()
    }

    /// Names seen in the current scan session, in discovery order.
    pub fn discovered_names(&self) -> Vec<String> {
        self.scanner.discovered_names()
    }

    /// Subscribe to scan events.
    pub fn subscribe_scan(&self) -> broadcast::Receiver<ScanEvent> {
        self.scanner.subscribe()
    }

    /// Subscribe to connection state changes.
    pub fn subscribe_connection(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection_tx.subscribe()
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// The telemetry store.
    pub fn store(&self) -> &Arc<TelemetryStore> {
        &self.store
    }

    /// The monitor settings.
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Run one scan/connect/receive cycle.
    ///
    /// Returns `Ok(())` after [`shutdown`](Self::shutdown), and
    /// [`Error::ConnectionLost`] when the beacon drops the link, so the
    /// caller can decide whether to run again.
    ///
    /// # Errors
    ///
    /// Returns the scan abort reason or the terminal connection error.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }

        let (device, peripheral) = tokio::select! {
            found = self.find_target() => found?,
            _ = stopped(&mut shutdown) => return Ok(()),
        };

        let link = Arc::new(BtleplugLink::new(self.scanner.adapter().clone(), peripheral));

        let mut machine = self.machine.lock().await;
        let _slot = LinkSlot {
            slot: &self.active_link,
        };
        *self.active_link.lock() = Some(link.clone());

        drive(
            link,
            &device,
            &mut machine,
            self.store.clone(),
            &self.config,
            &mut shutdown,
        )
        .await
    }

    /// Clean shutdown of scanning and any active session.
    ///
    /// A monitor that has been shut down returns from `run` immediately.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down weather monitor");

        self.shutdown_tx.send_replace(true);
        self.scanner.stop_scanning().await?;

        let link = self.active_link.lock().take();
        if let Some(link) = link {
            if let Err(e) = link.disconnect().await {
                warn!("Error disconnecting {}: {}", link.identifier(), e);
            }
        }

        self.scanner.clear_discovered();
        self.store.clear();

        Ok(())
    }

    /// Scan until the target advertises.
    async fn find_target(&self) -> Result<(DiscoveredDevice, Peripheral)> {
        // Subscribe first so a match right after the scan starts is not lost.
        let mut rx = self.scanner.subscribe();
        self.scanner.start_scanning().await?;

        loop {
            match rx.recv().await {
                Ok(ScanEvent::TargetFound { device, peripheral }) => {
                    return Ok((device, peripheral));
                }
                Ok(ScanEvent::Aborted(reason)) => return Err(reason.into()),
                Ok(ScanEvent::Discovered(device)) => debug!("Ignoring {}", device),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Scan events lagged, {} skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::Internal("scan event channel closed".to_string()));
                }
            }
        }
    }
}

impl Drop for WeatherMonitor {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}
