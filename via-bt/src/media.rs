//! Media session reconciler
//!
//! Polls the bus for an AVRCP media player while a device is connected,
//! reads transport and track metadata, computes the derived playback
//! position, and emits change events only on delta. Owns a small state
//! machine over the player handle: Idle (no player known) and Bound (player
//! path held); a remote fault while Bound demotes back to Idle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use via_common::events::{EventBus, ViaEvent};

use crate::artwork::{ArtDelivery, ArtLookup};
use crate::bus::{ObjectBus, PropValue, PropertyMap, MEDIA_PLAYER_IFACE};

/// Title shown when no track metadata is available
pub const NO_TRACK_TITLE: &str = "No Track Playing";

/// Cached view of current playback
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSnapshot {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub album_art_url: String,
    pub is_playing: bool,
    pub position_seconds: u64,
    pub duration_seconds: u64,
    /// position/duration clamped to 1.0, or 0.0 when the duration is unknown
    pub progress: f64,
}

impl Default for MediaSnapshot {
    fn default() -> Self {
        Self {
            title: NO_TRACK_TITLE.to_owned(),
            artist: String::new(),
            album: String::new(),
            album_art_url: String::new(),
            is_playing: false,
            position_seconds: 0,
            duration_seconds: 0,
            progress: 0.0,
        }
    }
}

/// Playback control requests delivered into the reconciler's own loop
#[derive(Debug)]
pub enum MediaCommand {
    Play,
    Pause,
    Next,
    Previous,
    /// Accepted for interface symmetry; AVRCP over MediaPlayer1 offers no
    /// absolute seek, so this produces no bus call.
    Seek(i64),
}

/// Polls the bound media player and publishes field deltas
pub struct MediaReconciler<B, L> {
    bus: Arc<B>,
    events: EventBus,
    lookup: L,
    art_tx: mpsc::Sender<ArtDelivery>,
    snapshot: MediaSnapshot,
    player: Option<String>,
    consecutive_misses: u32,
    art_key: Option<(String, String)>,
}

impl<B: ObjectBus, L: ArtLookup> MediaReconciler<B, L> {
    pub fn new(bus: Arc<B>, events: EventBus, lookup: L, art_tx: mpsc::Sender<ArtDelivery>) -> Self {
        Self {
            bus,
            events,
            lookup,
            art_tx,
            snapshot: MediaSnapshot::default(),
            player: None,
            consecutive_misses: 0,
            art_key: None,
        }
    }

    /// Event loop: poll ticks (gated on device presence), gating
    /// transitions, art deliveries and control commands all drain here, so
    /// every state mutation happens on this one task.
    pub async fn run(
        mut self,
        poll_interval: Duration,
        mut gate_rx: watch::Receiver<bool>,
        mut art_rx: mpsc::Receiver<ArtDelivery>,
        mut commands: mpsc::Receiver<MediaCommand>,
    ) {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut device_connected = *gate_rx.borrow_and_update();
        info!("Media reconciler ready (poll every {:?})", poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick(), if device_connected => self.poll_once().await,
                changed = gate_rx.changed() => match changed {
                    Ok(()) => {
                        let connected = *gate_rx.borrow_and_update();
                        if connected != device_connected {
                            device_connected = connected;
                            self.set_device_connected(connected);
                        }
                    }
                    Err(_) => break,
                },
                Some(delivery) = art_rx.recv() => self.apply_art_delivery(delivery),
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
            }
        }

        debug!("Media reconciler stopped");
    }

    /// Device gating entry point.
    ///
    /// Connect restarts player discovery from scratch; disconnect resets
    /// every cached field so the UI never shows media info for a device
    /// that is gone. The poll timer itself is gated in [`run`].
    fn set_device_connected(&mut self, connected: bool) {
        self.player = None;
        self.consecutive_misses = 0;
        if connected {
            info!("Device connected, media polling started");
        } else {
            info!("Device disconnected, media polling stopped");
            self.art_key = None;
            self.apply_snapshot(MediaSnapshot::default());
        }
    }

    /// One reconciliation tick: bind if Idle, then read the bound player.
    pub(crate) async fn poll_once(&mut self) {
        if self.player.is_none() {
            self.try_bind().await;
        }
        let path = match &self.player {
            Some(path) => path.clone(),
            None => return,
        };

        match self.bus.get_all_properties(&path, MEDIA_PLAYER_IFACE).await {
            Ok(props) => self.apply_player_properties(&props),
            Err(e) => {
                // Player object vanished; rediscover on the next tick
                info!("Media player lost ({}), rediscovering", e);
                self.player = None;
            }
        }
    }

    /// Idle-state discovery: first object exposing the player interface.
    async fn try_bind(&mut self) {
        let objects = match self.bus.list_managed_objects().await {
            Ok(objects) => objects,
            Err(e) => {
                warn!("Media poll failed: {}", e);
                return;
            }
        };

        let found = objects
            .iter()
            .find(|(_, interfaces)| interfaces.contains_key(MEDIA_PLAYER_IFACE))
            .map(|(path, _)| path.clone());

        match found {
            Some(path) => {
                info!("Media player found: {}", path);
                self.player = Some(path);
                self.consecutive_misses = 0;
            }
            None => {
                self.consecutive_misses += 1;
                // Phones routinely sit connected without an active player;
                // log only every 10th consecutive miss
                if self.consecutive_misses % 10 == 0 {
                    debug!("No media player after {} polls", self.consecutive_misses);
                }
            }
        }
    }

    fn apply_player_properties(&mut self, props: &PropertyMap) {
        let empty = PropertyMap::new();
        let track = props
            .get("Track")
            .and_then(PropValue::as_dict)
            .unwrap_or(&empty);

        let title = track
            .get("Title")
            .and_then(PropValue::as_str)
            .unwrap_or(NO_TRACK_TITLE)
            .to_owned();
        let artist = track
            .get("Artist")
            .and_then(PropValue::as_str)
            .unwrap_or("")
            .to_owned();
        let album = track
            .get("Album")
            .and_then(PropValue::as_str)
            .unwrap_or("")
            .to_owned();
        let duration_ms = track.get("Duration").and_then(PropValue::as_u64).unwrap_or(0);
        let position_ms = props.get("Position").and_then(PropValue::as_u64).unwrap_or(0);
        let status = props.get("Status").and_then(PropValue::as_str).unwrap_or("");
        let embedded_art = props
            .get("AlbumArt")
            .and_then(PropValue::as_str)
            .filter(|s| !s.is_empty());

        // Art policy runs before the other field updates
        let album_art_url = self.resolve_art(&title, &artist, embedded_art);

        let duration_seconds = duration_ms / 1000;
        let position_seconds = position_ms / 1000;
        // Some stacks report Position past Duration near track end
        let progress = if duration_seconds > 0 {
            (position_seconds as f64 / duration_seconds as f64).min(1.0)
        } else {
            0.0
        };

        self.apply_snapshot(MediaSnapshot {
            title,
            artist,
            album,
            album_art_url,
            is_playing: status.eq_ignore_ascii_case("playing"),
            position_seconds,
            duration_seconds,
            progress,
        });
    }

    /// Album art resolution.
    ///
    /// Embedded art always wins and re-records the search key. A track
    /// change without embedded art clears the displayed art and dispatches
    /// exactly one lookup; an unchanged track leaves the art alone because
    /// an earlier fetch may still be in flight.
    fn resolve_art(&mut self, title: &str, artist: &str, embedded: Option<&str>) -> String {
        if let Some(raw) = embedded {
            self.art_key = Some((title.to_owned(), artist.to_owned()));
            return normalize_art_uri(raw);
        }

        let key = (title.to_owned(), artist.to_owned());
        let is_new_track = self.art_key.as_ref() != Some(&key);
        if is_new_track && title != NO_TRACK_TITLE && !artist.is_empty() {
            debug!("Track changed, looking up art for \"{}\" by \"{}\"", title, artist);
            self.art_key = Some(key);
            self.lookup
                .dispatch(title.to_owned(), artist.to_owned(), self.art_tx.clone());
            return String::new();
        }

        self.snapshot.album_art_url.clone()
    }

    /// A lookup result coming back through the channel. Applied only when
    /// the delivered key still matches the current search key; anything
    /// else is a late result for a track we have moved past.
    fn apply_art_delivery(&mut self, delivery: ArtDelivery) {
        let key = (delivery.title, delivery.artist);
        if self.art_key.as_ref() != Some(&key) {
            debug!("Discarding stale art for \"{}\" by \"{}\"", key.0, key.1);
            return;
        }
        if self.snapshot.album_art_url == delivery.url {
            return;
        }
        debug!("Album art resolved for \"{}\"", key.0);
        self.snapshot.album_art_url = delivery.url.clone();
        self.events.emit_lossy(ViaEvent::AlbumArtChanged {
            url: delivery.url,
            timestamp: chrono::Utc::now(),
        });
    }

    /// Field-level diff against the cached snapshot; each changed field
    /// fires its own event. Position, duration and derived progress travel
    /// together in one event.
    fn apply_snapshot(&mut self, new: MediaSnapshot) {
        let now = chrono::Utc::now();

        if new.title != self.snapshot.title {
            self.events.emit_lossy(ViaEvent::TrackTitleChanged {
                title: new.title.clone(),
                timestamp: now,
            });
        }
        if new.artist != self.snapshot.artist {
            self.events.emit_lossy(ViaEvent::ArtistNameChanged {
                artist: new.artist.clone(),
                timestamp: now,
            });
        }
        if new.album != self.snapshot.album {
            self.events.emit_lossy(ViaEvent::AlbumNameChanged {
                album: new.album.clone(),
                timestamp: now,
            });
        }
        if new.album_art_url != self.snapshot.album_art_url {
            self.events.emit_lossy(ViaEvent::AlbumArtChanged {
                url: new.album_art_url.clone(),
                timestamp: now,
            });
        }
        if new.is_playing != self.snapshot.is_playing {
            self.events.emit_lossy(ViaEvent::PlaybackStateChanged {
                playing: new.is_playing,
                timestamp: now,
            });
        }
        if new.position_seconds != self.snapshot.position_seconds
            || new.duration_seconds != self.snapshot.duration_seconds
            || new.progress != self.snapshot.progress
        {
            self.events.emit_lossy(ViaEvent::PlaybackPositionChanged {
                position_seconds: new.position_seconds,
                duration_seconds: new.duration_seconds,
                progress: new.progress,
                timestamp: now,
            });
        }

        self.snapshot = new;
    }

    /// Forward a control request to the bound player, best-effort.
    async fn handle_command(&mut self, cmd: MediaCommand) {
        let method = match cmd {
            MediaCommand::Play => "Play",
            MediaCommand::Pause => "Pause",
            MediaCommand::Next => "Next",
            MediaCommand::Previous => "Previous",
            MediaCommand::Seek(position) => {
                debug!("Seek to {}s requested; transport cannot seek", position);
                return;
            }
        };

        let path = match &self.player {
            Some(path) => path.clone(),
            None => {
                debug!("{} requested with no player bound", method);
                return;
            }
        };

        if let Err(e) = self.bus.call_method(&path, MEDIA_PLAYER_IFACE, method).await {
            warn!("{} failed: {}", method, e);
        }
    }
}

/// Some phones hand back a bare file path instead of a URI
fn normalize_art_uri(raw: &str) -> String {
    if raw.contains("://") {
        raw.to_owned()
    } else {
        format!("file://{}", raw)
    }
}
