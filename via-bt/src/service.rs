//! Bluetooth core composition
//!
//! Connects the bus once at startup, runs the adapter bootstrap, spawns the
//! two reconcilers and wires the device→media gating channel between them.
//! When the bus transport is missing the whole core degrades to an inert
//! handle whose operations are all no-ops, logged once here.
//!
//! Also hosts the session bridge: the externally-supplied driving-session id
//! is stored for row correlation and is the only state this module owns.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use via_common::events::EventBus;

use crate::adapter;
use crate::agent;
use crate::artwork::{ArtLookup, ItunesArtLookup};
use crate::bus::{ObjectBus, ZbusObjectBus};
use crate::device::{DeviceCommand, DeviceReconciler};
use crate::media::{MediaCommand, MediaReconciler};

/// Command senders into the running reconciler tasks
struct CoreHandles {
    device_tx: mpsc::Sender<DeviceCommand>,
    media_tx: mpsc::Sender<MediaCommand>,
}

/// Public handle to the Bluetooth core
///
/// All control operations are fire-and-forget: there is never a synchronous
/// caller awaiting a result, so failures are logged and dropped.
pub struct BluetoothService {
    handles: Option<CoreHandles>,
    session_id: Arc<Mutex<Option<i64>>>,
}

impl BluetoothService {
    /// Connect the bus, bootstrap the adapter and start both reconcilers.
    ///
    /// A missing transport yields the inert service instead of an error so
    /// the rest of the dashboard starts normally.
    pub async fn start(events: EventBus, device_poll: Duration, media_poll: Duration) -> Self {
        let bus = match ZbusObjectBus::connect().await {
            Ok(bus) => Arc::new(bus),
            Err(e) => {
                warn!("Bluetooth unavailable on this platform: {}", e);
                return Self::inert();
            }
        };

        // Bootstrap is best-effort; polling works on an unconfigured adapter
        if let Err(e) = adapter::configure_adapter(bus.as_ref()).await {
            warn!("Adapter bootstrap failed: {}", e);
        }
        if let Err(e) = agent::register_agent(bus.connection()).await {
            warn!("Pairing agent registration failed: {}", e);
        }

        let handles = spawn_core(bus, events, ItunesArtLookup::new(), device_poll, media_poll);
        info!("Bluetooth core started");
        Self {
            handles: Some(handles),
            session_id: Arc::new(Mutex::new(None)),
        }
    }

    /// Service with no backing transport; every operation is a no-op
    pub fn inert() -> Self {
        Self {
            handles: None,
            session_id: Arc::new(Mutex::new(None)),
        }
    }

    pub fn play(&self) {
        self.send_media(MediaCommand::Play);
    }

    pub fn pause(&self) {
        self.send_media(MediaCommand::Pause);
    }

    pub fn next_track(&self) {
        self.send_media(MediaCommand::Next);
    }

    pub fn previous_track(&self) {
        self.send_media(MediaCommand::Previous);
    }

    pub fn seek(&self, position_seconds: i64) {
        self.send_media(MediaCommand::Seek(position_seconds));
    }

    /// Ask the currently tracked device to disconnect
    pub fn disconnect_device(&self) {
        if let Some(handles) = &self.handles {
            if handles.device_tx.try_send(DeviceCommand::Disconnect).is_err() {
                debug!("Disconnect request dropped");
            }
        }
    }

    /// Session bridge: store the driving-session id announced by the
    /// telemetry core. Held for row correlation only.
    pub fn session_changed(&self, session_id: Option<i64>) {
        debug!("Session id now {:?}", session_id);
        *self.session_id.lock().unwrap() = session_id;
    }

    pub fn session_id(&self) -> Option<i64> {
        *self.session_id.lock().unwrap()
    }

    fn send_media(&self, cmd: MediaCommand) {
        match &self.handles {
            Some(handles) => {
                if handles.media_tx.try_send(cmd).is_err() {
                    debug!("Media command dropped");
                }
            }
            None => debug!("Media command ignored, no transport"),
        }
    }
}

/// Spawn both reconciler tasks over any bus implementation.
///
/// The device reconciler owns the sending side of the gating channel; the
/// media reconciler drains it in the same loop as its poll timer, so gating
/// transitions are always applied between ticks, never during one.
fn spawn_core<B, L>(
    bus: Arc<B>,
    events: EventBus,
    lookup: L,
    device_poll: Duration,
    media_poll: Duration,
) -> CoreHandles
where
    B: ObjectBus + Send + Sync + 'static,
    L: ArtLookup + Send + 'static,
{
    let (gate_tx, gate_rx) = watch::channel(false);
    let (art_tx, art_rx) = mpsc::channel(8);
    let (device_tx, device_rx) = mpsc::channel(8);
    let (media_tx, media_rx) = mpsc::channel(8);

    let device = DeviceReconciler::new(bus.clone(), events.clone(), gate_tx);
    tokio::spawn(device.run(device_poll, device_rx));

    let media = MediaReconciler::new(bus, events, lookup, art_tx);
    tokio::spawn(media.run(media_poll, gate_rx, art_rx, media_rx));

    CoreHandles {
        device_tx,
        media_tx,
    }
}
