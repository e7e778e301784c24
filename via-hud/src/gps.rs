//! GPS fix source and logger
//!
//! Publishes one fix per interval on the event bus and persists it as a
//! `gps_readings` row tagged with the current driving session. The source
//! sits behind [`FixSource`]; the shipped implementation is a random-walk
//! simulator. A hardware NMEA source can be added behind the same trait
//! using the `gps_port` / `gps_baud_rate` config fields.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sqlx::SqlitePool;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use via_common::db::writes;
use via_common::events::{EventBus, ViaEvent};

/// One position fix
#[derive(Debug, Clone, PartialEq)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: f64,
}

/// Position source seam
pub trait FixSource: Send {
    fn next_fix(&mut self) -> GpsFix;
}

/// Random walk around a fixed starting point
pub struct SimulatedFixSource {
    latitude: f64,
    longitude: f64,
    rng: StdRng,
}

impl SimulatedFixSource {
    pub fn new() -> Self {
        Self::seeded(rand::random())
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            latitude: 37.7749,
            longitude: -122.4194,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for SimulatedFixSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FixSource for SimulatedFixSource {
    fn next_fix(&mut self) -> GpsFix {
        self.latitude += self.rng.gen_range(-0.0001..=0.0001);
        self.longitude += self.rng.gen_range(-0.0001..=0.0001);

        GpsFix {
            latitude: self.latitude,
            longitude: self.longitude,
            accuracy_m: self.rng.gen_range(5.0..=20.0),
        }
    }
}

/// Pulls fixes from one source, publishes and persists them
pub struct GpsLogger<S> {
    source: S,
    pool: SqlitePool,
    events: EventBus,
    session_id: Option<i64>,
}

impl<S: FixSource> GpsLogger<S> {
    pub fn new(source: S, pool: SqlitePool, events: EventBus) -> Self {
        Self {
            source,
            pool,
            events,
            session_id: None,
        }
    }

    pub async fn run(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Track the session id announced by the engine monitor
        let mut session_rx = self.events.subscribe();
        info!("GPS logger started (fix every {:?})", interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                event = session_rx.recv() => match event {
                    Ok(ViaEvent::SessionChanged { session_id, .. }) => {
                        self.session_id = session_id;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("GPS logger lagged {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("GPS logger stopped");
    }

    pub(crate) async fn tick(&mut self) {
        let fix = self.source.next_fix();

        self.events.emit_lossy(ViaEvent::GpsFixChanged {
            session_id: self.session_id,
            latitude: fix.latitude,
            longitude: fix.longitude,
            accuracy_m: fix.accuracy_m,
            timestamp: chrono::Utc::now(),
        });

        if let Err(e) = writes::insert_gps_reading(
            &self.pool,
            self.session_id,
            chrono::Utc::now(),
            fix.latitude,
            fix.longitude,
            fix.accuracy_m,
        )
        .await
        {
            warn!("Failed to persist GPS fix: {}", e);
        }
    }
}
