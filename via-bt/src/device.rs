//! Device presence reconciler
//!
//! Polls the bus on a fixed interval, selects the single best connected
//! device and emits change events only on field-level deltas against the
//! cached snapshot. Devices exposing the AVRCP control capability take
//! priority over plain connections; ties are broken by enumeration order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use via_common::events::{EventBus, ViaEvent};

use crate::bus::{ObjectBus, PropValue, PropertyMap, DEVICE_IFACE, MEDIA_CONTROL_IFACE};
use crate::error::Result;

/// Cached view of the currently connected device.
///
/// `path` empty means no device; all other string fields are empty exactly
/// when `path` is.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeviceSnapshot {
    pub path: String,
    pub name: String,
    pub address: String,
    pub device_type: String,
    pub has_media_control: bool,
}

impl DeviceSnapshot {
    pub fn is_present(&self) -> bool {
        !self.path.is_empty()
    }

    fn from_properties(path: &str, props: &PropertyMap, has_media_control: bool) -> Self {
        let address = props
            .get("Address")
            .and_then(PropValue::as_str)
            .unwrap_or("")
            .to_owned();

        // Display name falls back to the address, then to a placeholder;
        // some stacks report an empty Name briefly after connecting.
        let mut name = props
            .get("Name")
            .and_then(PropValue::as_str)
            .unwrap_or("")
            .to_owned();
        if name.is_empty() {
            name = address.clone();
        }
        if name.is_empty() {
            name = "Unknown".to_owned();
        }

        let device_type = props
            .get("Icon")
            .and_then(PropValue::as_str)
            .unwrap_or("")
            .to_owned();

        Self {
            path: path.to_owned(),
            name,
            address,
            device_type,
            has_media_control,
        }
    }
}

/// Control requests delivered into the reconciler's own loop
#[derive(Debug)]
pub enum DeviceCommand {
    /// Ask the tracked device to disconnect; no-op when none is tracked
    Disconnect,
}

/// Polls for connected devices and publishes presence and field deltas
pub struct DeviceReconciler<B> {
    bus: Arc<B>,
    events: EventBus,
    snapshot: DeviceSnapshot,
    has_connected_device: bool,
    gate_tx: watch::Sender<bool>,
}

impl<B: ObjectBus> DeviceReconciler<B> {
    pub fn new(bus: Arc<B>, events: EventBus, gate_tx: watch::Sender<bool>) -> Self {
        Self {
            bus,
            events,
            snapshot: DeviceSnapshot::default(),
            has_connected_device: false,
            gate_tx,
        }
    }

    /// Poll loop plus command drain. The first interval tick fires
    /// immediately, giving the eager startup poll.
    pub async fn run(mut self, poll_interval: Duration, mut commands: mpsc::Receiver<DeviceCommand>) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Device reconciler polling every {:?}", poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll_once().await,
                cmd = commands.recv() => match cmd {
                    Some(DeviceCommand::Disconnect) => self.disconnect_current().await,
                    None => break,
                },
            }
        }

        debug!("Device reconciler stopped");
    }

    /// One reconciliation tick. Errors skip the tick; the next timer fire
    /// retries at the same cadence.
    pub(crate) async fn poll_once(&mut self) {
        match self.scan().await {
            Ok(snapshot) => self.apply(snapshot),
            Err(e) => warn!("Device poll failed: {}", e),
        }
    }

    /// Enumerate connected devices and pick the winner.
    ///
    /// Two-pass selection collapsed into one scan: the first candidate with
    /// the media-control capability short-circuits, otherwise the first
    /// plain connected candidate is kept as fallback.
    async fn scan(&self) -> Result<DeviceSnapshot> {
        let objects = self.bus.list_managed_objects().await?;

        let mut fallback: Option<DeviceSnapshot> = None;
        for (path, interfaces) in &objects {
            let props = match interfaces.get(DEVICE_IFACE) {
                Some(props) => props,
                None => continue,
            };
            if props.get("Connected").and_then(PropValue::as_bool) != Some(true) {
                continue;
            }

            let candidate = DeviceSnapshot::from_properties(
                path,
                props,
                interfaces.contains_key(MEDIA_CONTROL_IFACE),
            );
            if candidate.has_media_control {
                return Ok(candidate);
            }
            if fallback.is_none() {
                fallback = Some(candidate);
            }
        }

        Ok(fallback.unwrap_or_default())
    }

    /// Diff the new snapshot field by field, then evaluate the presence
    /// transition. Presence comes last so gating consumers observe a fully
    /// updated snapshot.
    fn apply(&mut self, new: DeviceSnapshot) {
        let now = chrono::Utc::now();

        if new.name != self.snapshot.name {
            self.events.emit_lossy(ViaEvent::DeviceNameChanged {
                name: new.name.clone(),
                timestamp: now,
            });
        }
        if new.address != self.snapshot.address {
            self.events.emit_lossy(ViaEvent::DeviceAddressChanged {
                address: new.address.clone(),
                timestamp: now,
            });
        }
        if new.device_type != self.snapshot.device_type {
            self.events.emit_lossy(ViaEvent::DeviceTypeChanged {
                device_type: new.device_type.clone(),
                timestamp: now,
            });
        }
        if new.path != self.snapshot.path {
            self.events.emit_lossy(ViaEvent::DevicePathChanged {
                path: new.path.clone(),
                timestamp: now,
            });
        }

        self.snapshot = new;

        let present = self.snapshot.is_present();
        if present != self.has_connected_device {
            self.has_connected_device = present;
            if present {
                info!(
                    "Device connected: {} [{}]",
                    self.snapshot.name, self.snapshot.address
                );
            } else {
                info!("Device disconnected");
            }
            let _ = self.gate_tx.send(present);
            self.events.emit_lossy(ViaEvent::DeviceConnectedChanged {
                connected: present,
                timestamp: chrono::Utc::now(),
            });
        }
    }

    /// Best-effort disconnect of the tracked device. There is no
    /// synchronous caller awaiting a result, so bus errors are only logged.
    async fn disconnect_current(&self) {
        if !self.snapshot.is_present() {
            debug!("Disconnect requested with no device tracked");
            return;
        }
        info!("Disconnecting {}", self.snapshot.path);
        if let Err(e) = self
            .bus
            .call_method(&self.snapshot.path, DEVICE_IFACE, "Disconnect")
            .await
        {
            warn!("Disconnect failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::testing::FakeBus;
    use crate::bus::{InterfaceMap, ObjectMap};
    use tokio::sync::broadcast;

    fn device_entry(
        path: &str,
        name: Option<&str>,
        address: Option<&str>,
        icon: Option<&str>,
        connected: bool,
        media_control: bool,
    ) -> (String, InterfaceMap) {
        let mut props = PropertyMap::new();
        if let Some(name) = name {
            props.insert("Name".into(), PropValue::Str(name.into()));
        }
        if let Some(address) = address {
            props.insert("Address".into(), PropValue::Str(address.into()));
        }
        if let Some(icon) = icon {
            props.insert("Icon".into(), PropValue::Str(icon.into()));
        }
        props.insert("Connected".into(), PropValue::Bool(connected));

        let mut interfaces = InterfaceMap::new();
        interfaces.insert(DEVICE_IFACE.into(), props);
        if media_control {
            interfaces.insert(MEDIA_CONTROL_IFACE.into(), PropertyMap::new());
        }
        (path.to_owned(), interfaces)
    }

    fn objects(entries: Vec<(String, InterfaceMap)>) -> ObjectMap {
        entries.into_iter().collect()
    }

    fn drain(rx: &mut broadcast::Receiver<ViaEvent>) -> Vec<ViaEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn event_types(events: &[ViaEvent]) -> Vec<&str> {
        events.iter().map(|e| e.event_type()).collect()
    }

    struct Fixture {
        bus: Arc<FakeBus>,
        reconciler: DeviceReconciler<FakeBus>,
        rx: broadcast::Receiver<ViaEvent>,
        gate_rx: watch::Receiver<bool>,
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(FakeBus::new());
        let events = EventBus::new(64);
        let rx = events.subscribe();
        let (gate_tx, gate_rx) = watch::channel(false);
        let reconciler = DeviceReconciler::new(bus.clone(), events, gate_tx);
        Fixture {
            bus,
            reconciler,
            rx,
            gate_rx,
        }
    }

    #[tokio::test]
    async fn test_empty_bus_stays_silent() {
        let mut f = fixture();

        f.reconciler.poll_once().await;

        assert!(drain(&mut f.rx).is_empty());
        assert!(!*f.gate_rx.borrow());
    }

    #[tokio::test]
    async fn test_plain_device_connects() {
        let mut f = fixture();
        f.bus.set_objects(objects(vec![device_entry(
            "/org/bluez/hci0/dev_AA",
            Some("Phone"),
            Some("AA:BB:CC:DD:EE:FF"),
            None,
            true,
            false,
        )]));

        f.reconciler.poll_once().await;

        let events = drain(&mut f.rx);
        assert_eq!(
            event_types(&events),
            vec![
                "DeviceNameChanged",
                "DeviceAddressChanged",
                "DevicePathChanged",
                "DeviceConnectedChanged"
            ]
        );
        match &events[0] {
            ViaEvent::DeviceNameChanged { name, .. } => assert_eq!(name, "Phone"),
            other => panic!("unexpected event {:?}", other),
        }
        match &events[3] {
            ViaEvent::DeviceConnectedChanged { connected, .. } => assert!(connected),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(*f.gate_rx.borrow());
    }

    #[tokio::test]
    async fn test_media_control_tier_beats_enumeration_order() {
        let mut f = fixture();
        // Plain phone enumerates first, speaker with the control capability
        // later; the speaker must still win.
        f.bus.set_objects(objects(vec![
            device_entry(
                "/org/bluez/hci0/dev_AA",
                Some("Phone"),
                Some("AA:AA:AA:AA:AA:AA"),
                None,
                true,
                false,
            ),
            device_entry(
                "/org/bluez/hci0/dev_BB",
                Some("Speaker"),
                Some("BB:BB:BB:BB:BB:BB"),
                Some("audio-card"),
                true,
                true,
            ),
        ]));

        f.reconciler.poll_once().await;

        let events = drain(&mut f.rx);
        match &events[0] {
            ViaEvent::DeviceNameChanged { name, .. } => assert_eq!(name, "Speaker"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_first_match_wins_within_plain_tier() {
        let mut f = fixture();
        f.bus.set_objects(objects(vec![
            device_entry(
                "/org/bluez/hci0/dev_AA",
                Some("First"),
                Some("AA:AA:AA:AA:AA:AA"),
                None,
                true,
                false,
            ),
            device_entry(
                "/org/bluez/hci0/dev_BB",
                Some("Second"),
                Some("BB:BB:BB:BB:BB:BB"),
                None,
                true,
                false,
            ),
        ]));

        f.reconciler.poll_once().await;

        let events = drain(&mut f.rx);
        match &events[0] {
            ViaEvent::DeviceNameChanged { name, .. } => assert_eq!(name, "First"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_same_state_twice_is_idempotent() {
        let mut f = fixture();
        f.bus.set_objects(objects(vec![device_entry(
            "/org/bluez/hci0/dev_AA",
            Some("Phone"),
            Some("AA:BB:CC:DD:EE:FF"),
            Some("phone"),
            true,
            false,
        )]));

        f.reconciler.poll_once().await;
        drain(&mut f.rx);

        f.reconciler.poll_once().await;
        assert!(drain(&mut f.rx).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_clears_all_fields_and_presence() {
        let mut f = fixture();
        f.bus.set_objects(objects(vec![device_entry(
            "/org/bluez/hci0/dev_AA",
            Some("Phone"),
            Some("AA:BB:CC:DD:EE:FF"),
            Some("phone"),
            true,
            false,
        )]));
        f.reconciler.poll_once().await;
        drain(&mut f.rx);

        f.bus.set_objects(ObjectMap::new());
        f.reconciler.poll_once().await;

        let events = drain(&mut f.rx);
        assert_eq!(
            event_types(&events),
            vec![
                "DeviceNameChanged",
                "DeviceAddressChanged",
                "DeviceTypeChanged",
                "DevicePathChanged",
                "DeviceConnectedChanged"
            ]
        );
        match &events[0] {
            ViaEvent::DeviceNameChanged { name, .. } => assert_eq!(name, ""),
            other => panic!("unexpected event {:?}", other),
        }
        match events.last().unwrap() {
            ViaEvent::DeviceConnectedChanged { connected, .. } => assert!(!connected),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!*f.gate_rx.borrow());

        // A second empty poll must not fire the presence transition again
        f.reconciler.poll_once().await;
        assert!(drain(&mut f.rx).is_empty());
    }

    #[tokio::test]
    async fn test_name_falls_back_to_address_then_unknown() {
        let mut f = fixture();
        f.bus.set_objects(objects(vec![device_entry(
            "/org/bluez/hci0/dev_AA",
            None,
            Some("AA:BB:CC:DD:EE:FF"),
            None,
            true,
            false,
        )]));
        f.reconciler.poll_once().await;
        let events = drain(&mut f.rx);
        match &events[0] {
            ViaEvent::DeviceNameChanged { name, .. } => assert_eq!(name, "AA:BB:CC:DD:EE:FF"),
            other => panic!("unexpected event {:?}", other),
        }

        f.bus.set_objects(objects(vec![device_entry(
            "/org/bluez/hci0/dev_BB",
            None,
            None,
            None,
            true,
            false,
        )]));
        f.reconciler.poll_once().await;
        let events = drain(&mut f.rx);
        match &events[0] {
            ViaEvent::DeviceNameChanged { name, .. } => assert_eq!(name, "Unknown"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_only_changed_fields_emit() {
        let mut f = fixture();
        f.bus.set_objects(objects(vec![device_entry(
            "/org/bluez/hci0/dev_AA",
            Some("Phone"),
            Some("AA:BB:CC:DD:EE:FF"),
            Some("phone"),
            true,
            false,
        )]));
        f.reconciler.poll_once().await;
        drain(&mut f.rx);

        // Same device, new name only
        f.bus.set_objects(objects(vec![device_entry(
            "/org/bluez/hci0/dev_AA",
            Some("Renamed Phone"),
            Some("AA:BB:CC:DD:EE:FF"),
            Some("phone"),
            true,
            false,
        )]));
        f.reconciler.poll_once().await;

        let events = drain(&mut f.rx);
        assert_eq!(event_types(&events), vec!["DeviceNameChanged"]);
    }

    #[tokio::test]
    async fn test_disconnected_devices_are_ignored() {
        let mut f = fixture();
        f.bus.set_objects(objects(vec![device_entry(
            "/org/bluez/hci0/dev_AA",
            Some("Phone"),
            Some("AA:BB:CC:DD:EE:FF"),
            None,
            false,
            false,
        )]));

        f.reconciler.poll_once().await;

        assert!(drain(&mut f.rx).is_empty());
    }

    #[tokio::test]
    async fn test_poll_error_skips_tick_and_keeps_state() {
        let mut f = fixture();
        f.bus.set_objects(objects(vec![device_entry(
            "/org/bluez/hci0/dev_AA",
            Some("Phone"),
            Some("AA:BB:CC:DD:EE:FF"),
            None,
            true,
            false,
        )]));
        f.reconciler.poll_once().await;
        drain(&mut f.rx);

        f.bus.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        f.reconciler.poll_once().await;

        // Tick skipped: no events, presence unchanged
        assert!(drain(&mut f.rx).is_empty());
        assert!(f.reconciler.has_connected_device);
    }

    #[tokio::test]
    async fn test_disconnect_command_targets_tracked_device() {
        let mut f = fixture();
        f.bus.set_objects(objects(vec![device_entry(
            "/org/bluez/hci0/dev_AA",
            Some("Phone"),
            Some("AA:BB:CC:DD:EE:FF"),
            None,
            true,
            false,
        )]));
        f.reconciler.poll_once().await;

        f.reconciler.disconnect_current().await;

        let calls = f.bus.recorded_calls();
        assert_eq!(
            calls,
            vec![(
                "/org/bluez/hci0/dev_AA".to_owned(),
                DEVICE_IFACE.to_owned(),
                "Disconnect".to_owned()
            )]
        );
    }

    #[tokio::test]
    async fn test_disconnect_command_without_device_is_noop() {
        let f = fixture();

        f.reconciler.disconnect_current().await;

        assert!(f.bus.recorded_calls().is_empty());
    }
}
