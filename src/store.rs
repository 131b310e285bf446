//! Latest-reading store observed by the presentation layer.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::trace;

use crate::data::TelemetryReading;

/// Placeholder rendered while no reading has arrived.
pub const NO_DATA: &str = "-";

/// Callback handle for unregistering callbacks.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// A reading together with the time it was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TelemetryUpdate {
    /// The decoded reading.
    pub reading: TelemetryReading,
    /// When it was stored.
    pub received_at: DateTime<Utc>,
}

/// Holds the most recent reading.
///
/// Updates arrive from a single session's event stream, so each
/// `update` simply replaces the stored value.
pub struct TelemetryStore {
    /// Latest update, if any.
    latest: RwLock<Option<TelemetryUpdate>>,
    /// Update channel.
    update_tx: broadcast::Sender<TelemetryUpdate>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
}

impl Default for TelemetryStore {
    fn default() -> Self {
        Self::new(64)
    }
}

impl TelemetryStore {
    /// Create an empty store whose update channel buffers `capacity` updates.
    pub fn new(capacity: usize) -> Self {
        let (update_tx, _) = broadcast::channel(capacity.max(1));

        Self {
            latest: RwLock::new(None),
            update_tx,
            callback_counter: AtomicU64::new(0),
        }
    }

    /// Replace the stored reading and notify observers.
    pub fn update(&self, reading: TelemetryReading) {
        let update = TelemetryUpdate {
            reading,
            received_at: Utc::now(),
        };

        *self.latest.write() = Some(update);
        trace!("Stored reading {}", reading);

        let _ = self.update_tx.send(update);
    }

    /// Latest reading, or `None` before the first sample.
    pub fn latest(&self) -> Option<TelemetryReading> {
        self.latest.read().map(|u| u.reading)
    }

    /// Latest reading with its timestamp.
    pub fn latest_update(&self) -> Option<TelemetryUpdate> {
        *self.latest.read()
    }

    /// Forget the stored reading.
    pub fn clear(&self) {
        *self.latest.write() = None;
    }

    /// Temperature for display, or the placeholder.
    pub fn temperature_display(&self) -> String {
        self.latest()
            .map(|r| r.temperature_celsius.to_string())
            .unwrap_or_else(|| NO_DATA.to_string())
    }

    /// Humidity for display, or the placeholder.
    pub fn humidity_display(&self) -> String {
        self.latest()
            .map(|r| r.humidity_percent.to_string())
            .unwrap_or_else(|| NO_DATA.to_string())
    }

    /// Subscribe to reading updates.
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryUpdate> {
        self.update_tx.subscribe()
    }

    /// Register a callback for reading updates.
    pub fn on_reading_updated<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&TelemetryReading) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.update_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(update) => callback(&update.reading),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }
}
