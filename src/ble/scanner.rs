//! BLE scanning functionality.
//!
//! Provides the scanner that discovers advertising devices and hands the
//! weather beacon off for connection.

use btleplug::api::{Central, CentralEvent, CentralState, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use crate::data::DiscoveredDevice;
use crate::error::{Error, Result};

/// Why a scan ended without a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanAbort {
    /// Scanning is not authorized.
    PermissionDenied,
    /// The adapter is absent or powered off.
    AdapterUnavailable,
}

impl From<ScanAbort> for Error {
    fn from(abort: ScanAbort) -> Self {
        match abort {
            ScanAbort::PermissionDenied => Error::PermissionDenied,
            ScanAbort::AdapterUnavailable => Error::AdapterUnavailable,
        }
    }
}

/// Event emitted by the scanner.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// A device was seen for the first time in this scan session.
    Discovered(DiscoveredDevice),
    /// The target device was found. Scanning has stopped.
    TargetFound {
        /// The matched device.
        device: DiscoveredDevice,
        /// The peripheral handle.
        peripheral: Peripheral,
    },
    /// The scan ended with an error and must be restarted explicitly.
    Aborted(ScanAbort),
}

/// Result of observing one advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Device already reported in this session.
    Duplicate,
    /// Device seen for the first time.
    New(DiscoveredDevice),
    /// Device carries the target name.
    Target(DiscoveredDevice),
}

/// Deduplication state of one scan session.
#[derive(Debug, Clone, Default)]
pub struct ScanSession {
    /// Name that triggers the handoff.
    target_name: String,
    /// Devices by identifier.
    devices: HashMap<String, DiscoveredDevice>,
    /// Identifiers in discovery order.
    order: Vec<String>,
    /// Advertised names in discovery order.
    names: Vec<String>,
    /// Whether the target has been reported.
    target_found: bool,
}

impl ScanSession {
    /// Create an empty session matching `target_name` exactly.
    pub fn new(target_name: impl Into<String>) -> Self {
        Self {
            target_name: target_name.into(),
            ..Self::default()
        }
    }

    /// Record an advertisement.
    pub fn observe(&mut self, device: DiscoveredDevice) -> ScanOutcome {
        let is_new = !self.devices.contains_key(&device.id);

        let entry = self
            .devices
            .entry(device.id.clone())
            .or_insert_with(|| DiscoveredDevice::new(device.id.clone(), None, None));

        if entry.name.is_none() {
            if let Some(name) = &device.name {
                if !self.names.contains(name) {
                    self.names.push(name.clone());
                }
                entry.name = Some(name.clone());
            }
        }
        if device.rssi.is_some() {
            entry.rssi = device.rssi;
        }

        let snapshot = entry.clone();
        if is_new {
            self.order.push(device.id);
        }

        if !self.target_found && snapshot.has_name(&self.target_name) {
            self.target_found = true;
            return ScanOutcome::Target(snapshot);
        }

        if is_new {
            ScanOutcome::New(snapshot)
        } else {
            ScanOutcome::Duplicate
        }
    }

    /// Forget everything seen, keeping the target name.
    pub fn clear(&mut self) {
        *self = Self::new(std::mem::take(&mut self.target_name));
    }

    /// Devices in discovery order.
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.order
            .iter()
            .filter_map(|id| self.devices.get(id).cloned())
            .collect()
    }

    /// Distinct advertised names in discovery order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Whether the target has been reported.
    pub fn target_found(&self) -> bool {
        self.target_found
    }
}

/// BLE scanner for discovering the weather beacon.
pub struct BleScanner {
    /// The BLE adapter to use for scanning.
    adapter: Adapter,
    /// Advertised name to hand off.
    target_name: String,
    /// Whether scanning is currently active.
    is_scanning: Arc<RwLock<bool>>,
    /// Current scan session.
    session: Arc<RwLock<ScanSession>>,
    /// Channel for scan events.
    event_tx: broadcast::Sender<ScanEvent>,
    /// Handle to the scanning task.
    scan_handle: Arc<RwLock<Option<tokio::task::JoinHandle<()>>>>,
}

impl BleScanner {
    /// Create a new BLE scanner on the first adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdapterUnavailable`] if there is no adapter.
    pub async fn new(target_name: impl Into<String>, capacity: usize) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::AdapterUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::from_radio)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::AdapterUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter, target_name, capacity))
    }

    /// Create a new BLE scanner with a specific adapter.
    pub fn with_adapter(adapter: Adapter, target_name: impl Into<String>, capacity: usize) -> Self {
        let target_name = target_name.into();
        let (event_tx, _) = broadcast::channel(capacity.max(1));

        Self {
            adapter,
            session: Arc::new(RwLock::new(ScanSession::new(target_name.clone()))),
            target_name,
            is_scanning: Arc::new(RwLock::new(false)),
            event_tx,
            scan_handle: Arc::new(RwLock::new(None)),
        }
    }

    /// Start a new scan session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdapterUnavailable`] if the radio is off and
    /// [`Error::PermissionDenied`] if scanning is not authorized.
    pub async fn start_scanning(&self) -> Result<()> {
        if *self.is_scanning.read() {
            debug!("Already scanning, ignoring start request");
            return Ok(());
        }

        if let Ok(CentralState::PoweredOff) = self.adapter.adapter_state().await {
            return Err(Error::AdapterUnavailable);
        }

        info!("Starting BLE scan for {}", self.target_name);

        *self.session.write() = ScanSession::new(self.target_name.clone());

        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(Error::from_radio)?;

        *self.is_scanning.write() = true;

        let previous = self.scan_handle.write().take();
        if let Some(handle) = previous {
            handle.abort();
        }

        // Start the event processing task
        let adapter = self.adapter.clone();
        let is_scanning = self.is_scanning.clone();
        let session = self.session.clone();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to get adapter events: {}", e);
                    Self::abort(&adapter, &is_scanning, &event_tx, Self::abort_reason(e)).await;
                    return;
                }
            };

            while *is_scanning.read() {
                tokio::select! {
                    Some(event) = events.next() => {
                        if Self::handle_event(event, &adapter, &is_scanning, &session, &event_tx)
                            .await
                        {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {
                        // Check if we should stop scanning
                        if !*is_scanning.read() {
                            break;
                        }
                    }
                }
            }

            debug!("Scan event loop ended");
        });

        *self.scan_handle.write() = Some(handle);

        Ok(())
    }

    /// Stop scanning.
    ///
    /// No discovery events are emitted after this returns.
    pub async fn stop_scanning(&self) -> Result<()> {
        let was_scanning = std::mem::replace(&mut *self.is_scanning.write(), false);

        let handle = self.scan_handle.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        if !was_scanning {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        }

        info!("Stopping BLE scan");

        self.adapter.stop_scan().await.map_err(Error::from_radio)
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        *self.is_scanning.read()
    }

    /// Devices of the current scan session, in discovery order.
    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.session.read().devices()
    }

    /// Advertised names of the current scan session, in discovery order.
    pub fn discovered_names(&self) -> Vec<String> {
        self.session.read().names().to_vec()
    }

    /// Discard the devices and names of the current scan session.
    pub fn clear_discovered(&self) {
        self.session.write().clear();
    }

    /// Subscribe to scan events.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.event_tx.subscribe()
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    fn abort_reason(err: btleplug::Error) -> ScanAbort {
        match err {
            btleplug::Error::PermissionDenied => ScanAbort::PermissionDenied,
            _ => ScanAbort::AdapterUnavailable,
        }
    }

    /// End the scan with an error.
    async fn abort(
        adapter: &Adapter,
        is_scanning: &Arc<RwLock<bool>>,
        event_tx: &broadcast::Sender<ScanEvent>,
        reason: ScanAbort,
    ) {
        warn!("Scan aborted: {:?}", reason);
        *is_scanning.write() = false;
        let _ = adapter.stop_scan().await;
        let _ = event_tx.send(ScanEvent::Aborted(reason));
    }

    /// Handle a BLE central event. Returns `true` when the scan is over.
    async fn handle_event(
        event: CentralEvent,
        adapter: &Adapter,
        is_scanning: &Arc<RwLock<bool>>,
        session: &Arc<RwLock<ScanSession>>,
        event_tx: &broadcast::Sender<ScanEvent>,
    ) -> bool {
        match event {
            CentralEvent::DeviceDiscovered(id) => {
                trace!("Device discovered: {:?}", id);
                Self::process_peripheral(adapter, id, is_scanning, session, event_tx).await
            }
            CentralEvent::DeviceUpdated(id) => {
                trace!("Device updated: {:?}", id);
                Self::process_peripheral(adapter, id, is_scanning, session, event_tx).await
            }
            CentralEvent::StateUpdate(CentralState::PoweredOff) => {
                Self::abort(
                    adapter,
                    is_scanning,
                    event_tx,
                    ScanAbort::AdapterUnavailable,
                )
                .await;
                true
            }
            _ => false,
        }
    }

    /// Process a discovered peripheral.
    async fn process_peripheral(
        adapter: &Adapter,
        id: PeripheralId,
        is_scanning: &Arc<RwLock<bool>>,
        session: &Arc<RwLock<ScanSession>>,
        event_tx: &broadcast::Sender<ScanEvent>,
    ) -> bool {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return false;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return false,
        };

        let device = DiscoveredDevice::new(id.to_string(), properties.local_name, properties.rssi);

        let outcome = session.write().observe(device);

        match outcome {
            ScanOutcome::Duplicate => false,
            ScanOutcome::New(device) => {
                debug!("Device found: {}", device);
                let _ = event_tx.send(ScanEvent::Discovered(device));
                false
            }
            ScanOutcome::Target(device) => {
                info!("Found target {}, stopping scan", device);
                *is_scanning.write() = false;
                if let Err(e) = adapter.stop_scan().await {
                    warn!("Failed to stop scan: {}", e);
                }
                let _ = event_tx.send(ScanEvent::TargetFound { device, peripheral });
                true
            }
        }
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        *self.is_scanning.write() = false;
    }
}
