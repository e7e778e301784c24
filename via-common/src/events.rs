//! Event types for the via event system
//!
//! Provides shared event definitions and the EventBus used by all via
//! components.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Via event types
///
/// Events are broadcast via EventBus and can be serialized for logging or
/// forwarding to a UI layer. All state-bearing components publish their
/// field-level changes here so consumers can bind to individual fields
/// without spurious redraws.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ViaEvent {
    /// Connected Bluetooth device display name changed
    DeviceNameChanged {
        /// New display name (empty when no device)
        name: String,
        /// When the change was observed
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Connected Bluetooth device address changed
    DeviceAddressChanged {
        /// New address (empty when no device)
        address: String,
        /// When the change was observed
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Connected Bluetooth device category hint changed
    DeviceTypeChanged {
        /// Icon/category hint, e.g. "phone" or "audio-card" (may be empty)
        device_type: String,
        /// When the change was observed
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Tracked device object path changed
    DevicePathChanged {
        /// Bus object path (empty when no device)
        path: String,
        /// When the change was observed
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Device presence transition (connected ⇄ disconnected)
    ///
    /// Triggers:
    /// - Media reconciler gating (poll start/stop)
    /// - UI: connection indicator
    DeviceConnectedChanged {
        /// Whether a device is now connected
        connected: bool,
        /// When the transition was observed
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Current track title changed
    TrackTitleChanged {
        /// New title ("No Track Playing" when idle)
        title: String,
        /// When the change was observed
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Current track artist changed
    ArtistNameChanged {
        /// New artist name (may be empty)
        artist: String,
        /// When the change was observed
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Current track album changed
    AlbumNameChanged {
        /// New album name (may be empty)
        album: String,
        /// When the change was observed
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Album art URL changed
    ///
    /// Either embedded art from the player (file:// URI) or a network
    /// lookup result. Empty means "no art".
    AlbumArtChanged {
        /// New art URL (may be empty)
        url: String,
        /// When the change was observed
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Playback state changed (playing ⇄ paused/stopped)
    PlaybackStateChanged {
        /// Whether playback is active
        playing: bool,
        /// When the change was observed
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Playback position update
    ///
    /// Emitted whenever position, duration or derived progress changes.
    PlaybackPositionChanged {
        /// Current position in whole seconds
        position_seconds: u64,
        /// Track duration in whole seconds (0 when unknown)
        duration_seconds: u64,
        /// position/duration, or 0.0 when duration is 0
        progress: f64,
        /// When the change was observed
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Engine link status string changed
    ///
    /// Values: "Not Connected", "Connecting...", "Connected",
    /// "No adapter found", "Disconnected", "Read error", "Error: {e}"
    EngineStatusChanged {
        /// New status string
        status: String,
        /// When the change was observed
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// One sampled set of engine values
    ///
    /// Emitted at the polling cadence; persisted rows are downsampled
    /// separately.
    EngineReading {
        /// Driving session the reading belongs to (None before link-up)
        session_id: Option<i64>,
        /// Engine speed in RPM
        rpm: Option<f64>,
        /// Vehicle speed in km/h
        speed_kph: Option<f64>,
        /// Coolant temperature in °C
        coolant_temp_c: Option<f64>,
        /// Throttle position in percent
        throttle_pct: Option<f64>,
        /// Calculated engine load in percent
        engine_load_pct: Option<f64>,
        /// When the reading was taken
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// New GPS fix
    GpsFixChanged {
        /// Driving session the fix belongs to (None before link-up)
        session_id: Option<i64>,
        /// Latitude in decimal degrees
        latitude: f64,
        /// Longitude in decimal degrees
        longitude: f64,
        /// Estimated accuracy in meters
        accuracy_m: f64,
        /// When the fix was taken
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Driving session started or ended
    ///
    /// Triggers:
    /// - GPS and Bluetooth cores store the id for row correlation
    SessionChanged {
        /// New session id, None when the session ended
        session_id: Option<i64>,
        /// When the session changed
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl ViaEvent {
    /// Get event type as string for filtering
    pub fn event_type(&self) -> &str {
        match self {
            ViaEvent::DeviceNameChanged { .. } => "DeviceNameChanged",
            ViaEvent::DeviceAddressChanged { .. } => "DeviceAddressChanged",
            ViaEvent::DeviceTypeChanged { .. } => "DeviceTypeChanged",
            ViaEvent::DevicePathChanged { .. } => "DevicePathChanged",
            ViaEvent::DeviceConnectedChanged { .. } => "DeviceConnectedChanged",
            ViaEvent::TrackTitleChanged { .. } => "TrackTitleChanged",
            ViaEvent::ArtistNameChanged { .. } => "ArtistNameChanged",
            ViaEvent::AlbumNameChanged { .. } => "AlbumNameChanged",
            ViaEvent::AlbumArtChanged { .. } => "AlbumArtChanged",
            ViaEvent::PlaybackStateChanged { .. } => "PlaybackStateChanged",
            ViaEvent::PlaybackPositionChanged { .. } => "PlaybackPositionChanged",
            ViaEvent::EngineStatusChanged { .. } => "EngineStatusChanged",
            ViaEvent::EngineReading { .. } => "EngineReading",
            ViaEvent::GpsFixChanged { .. } => "GpsFixChanged",
            ViaEvent::SessionChanged { .. } => "SessionChanged",
        }
    }
}

/// Central event distribution bus for application-wide events
///
/// The EventBus uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Automatic cleanup when subscribers drop
/// - Lagged message detection for slow subscribers
///
/// # Examples
///
/// ```
/// use via_common::events::{EventBus, ViaEvent};
/// use std::sync::Arc;
///
/// let event_bus = Arc::new(EventBus::new(1000));
///
/// // Subscribe to events
/// let mut rx = event_bus.subscribe();
///
/// // Emit an event
/// event_bus.emit(ViaEvent::PlaybackStateChanged {
///     playing: true,
///     timestamp: chrono::Utc::now(),
/// }).ok();
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ViaEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of events to buffer before dropping old events
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Returns a receiver that will receive all events emitted after
    /// subscription. Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<ViaEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: ViaEvent) -> Result<usize, broadcast::error::SendError<ViaEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    ///
    /// Useful for non-critical events where it's acceptable if no component
    /// is currently listening (position updates, simulated readings).
    pub fn emit_lossy(&self, event: ViaEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    ///
    /// Useful for debugging and monitoring
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}
