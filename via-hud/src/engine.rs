//! Engine telemetry loop
//!
//! Polls the vehicle link at 10 Hz for a fixed PID set, publishes readings
//! on the event bus and downsamples them into `engine_readings` rows. Owns
//! the driving-session lifecycle: a session row is opened when the link
//! comes up and closed on link loss or shutdown.
//!
//! The transport sits behind [`EngineLink`] so the loop is testable and a
//! real serial OBD-II link can be slotted in later; the shipped
//! implementation is a seeded simulator.

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use via_common::db::writes;
use via_common::events::{EventBus, ViaEvent};

/// 10 Hz sampling, matching typical OBD-II adapter throughput
const TICK_INTERVAL: Duration = Duration::from_millis(100);
/// Reconnect attempts while the link is down
const CONNECT_RETRY: Duration = Duration::from_secs(2);

/// One sampled set of engine values; None = PID not answered
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EngineSample {
    pub rpm: Option<f64>,
    pub speed_kph: Option<f64>,
    pub coolant_temp_c: Option<f64>,
    pub throttle_pct: Option<f64>,
    pub engine_load_pct: Option<f64>,
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("no adapter found")]
    NoAdapter,
    #[error("read error")]
    Read,
    #[error("{0}")]
    Other(String),
}

/// Vehicle transport seam
pub trait EngineLink: Send {
    fn connect(&mut self) -> Result<(), LinkError>;
    fn is_connected(&self) -> bool;
    fn read(&mut self) -> Result<EngineSample, LinkError>;
    fn disconnect(&mut self);
}

/// Deterministic simulated vehicle: values random-walk within plausible
/// ranges. Connecting always succeeds.
pub struct SimulatedEngineLink {
    rng: StdRng,
    connected: bool,
    rpm: f64,
    speed_kph: f64,
    coolant_temp_c: f64,
    throttle_pct: f64,
}

impl SimulatedEngineLink {
    pub fn new() -> Self {
        Self::seeded(0x0bd)
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            connected: false,
            rpm: 850.0,
            speed_kph: 0.0,
            coolant_temp_c: 70.0,
            throttle_pct: 5.0,
        }
    }

    fn walk(&mut self, value: f64, step: f64, min: f64, max: f64) -> f64 {
        (value + self.rng.gen_range(-step..=step)).clamp(min, max)
    }
}

impl Default for SimulatedEngineLink {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineLink for SimulatedEngineLink {
    fn connect(&mut self) -> Result<(), LinkError> {
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn read(&mut self) -> Result<EngineSample, LinkError> {
        if !self.connected {
            return Err(LinkError::Read);
        }
        self.rpm = self.walk(self.rpm, 150.0, 750.0, 4500.0);
        self.speed_kph = self.walk(self.speed_kph, 3.0, 0.0, 130.0);
        self.coolant_temp_c = self.walk(self.coolant_temp_c, 0.3, 60.0, 105.0);
        self.throttle_pct = self.walk(self.throttle_pct, 4.0, 0.0, 100.0);
        // Load tracks throttle with some lag in a real engine; close enough
        let load = (self.throttle_pct * 0.8 + self.rng.gen_range(0.0..10.0)).clamp(0.0, 100.0);

        Ok(EngineSample {
            rpm: Some(self.rpm.round()),
            speed_kph: Some(self.speed_kph.round()),
            coolant_temp_c: Some(self.coolant_temp_c.round()),
            throttle_pct: Some(self.throttle_pct.round()),
            engine_load_pct: Some(load.round()),
        })
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}

/// "{n}°C", or "N/A" when the PID was not answered
pub fn format_temperature(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{}°C", v as i64),
        None => "N/A".to_owned(),
    }
}

/// "{n}%", or "N/A" when the PID was not answered
pub fn format_percent(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{}%", v as i64),
        None => "N/A".to_owned(),
    }
}

/// Drives one [`EngineLink`], publishing readings and owning the session row
pub struct EngineMonitor<L> {
    link: L,
    pool: SqlitePool,
    events: EventBus,
    status: String,
    session_id: Option<i64>,
    log_interval: Duration,
    last_logged: Option<Instant>,
    last_attempt: Option<Instant>,
    /// Link state at the end of the previous tick, for drop detection
    was_connected: bool,
}

impl<L: EngineLink> EngineMonitor<L> {
    pub fn new(link: L, pool: SqlitePool, events: EventBus, log_interval: Duration) -> Self {
        Self {
            link,
            pool,
            events,
            status: "Not Connected".to_owned(),
            session_id: None,
            log_interval,
            last_logged: None,
            last_attempt: None,
            was_connected: false,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Engine monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Close the open session so rows stay attributable
        if self.link.is_connected() {
            self.link.disconnect();
        }
        self.end_session().await;
        info!("Engine monitor stopped");
    }

    pub(crate) async fn tick(&mut self) {
        if !self.link.is_connected() {
            // Close out a dropped link before retrying so the open session
            // never leaks across a reconnect
            if self.was_connected {
                self.handle_link_drop().await;
            }
            self.try_connect().await;
            return;
        }

        match self.link.read() {
            Ok(sample) => {
                self.publish(&sample);
                self.maybe_persist(&sample).await;
            }
            Err(e) => {
                warn!("Engine read failed: {}", e);
                self.link.disconnect();
                self.was_connected = false;
                self.set_status("Read error");
                self.end_session().await;
                // Clear displayed values for the dead link
                self.publish(&EngineSample::default());
            }
        }
    }

    /// The link reported itself down between reads
    async fn handle_link_drop(&mut self) {
        warn!("Engine link lost");
        self.was_connected = false;
        // Release the dead handle; reconnect goes through connect() again
        self.link.disconnect();
        self.set_status("Disconnected");
        self.end_session().await;
        self.publish(&EngineSample::default());
    }

    /// Attempt a connection at most every 2 s while down
    async fn try_connect(&mut self) {
        if let Some(last) = self.last_attempt {
            if last.elapsed() < CONNECT_RETRY {
                return;
            }
        }
        self.last_attempt = Some(Instant::now());

        self.set_status("Connecting...");
        match self.link.connect() {
            Ok(()) => {
                self.was_connected = true;
                self.set_status("Connected");
                self.start_session().await;
            }
            Err(LinkError::NoAdapter) => self.set_status("No adapter found"),
            Err(e) => {
                let status = format!("Error: {}", e);
                self.set_status(&status);
            }
        }
    }

    async fn start_session(&mut self) {
        match writes::create_session(&self.pool, chrono::Utc::now()).await {
            Ok(id) => {
                info!("Driving session {} started", id);
                self.session_id = Some(id);
                self.events.emit_lossy(ViaEvent::SessionChanged {
                    session_id: Some(id),
                    timestamp: chrono::Utc::now(),
                });
            }
            Err(e) => warn!("Failed to create driving session: {}", e),
        }
    }

    async fn end_session(&mut self) {
        let id = match self.session_id.take() {
            Some(id) => id,
            None => return,
        };
        if let Err(e) = writes::end_session(&self.pool, id, chrono::Utc::now()).await {
            warn!("Failed to end driving session {}: {}", id, e);
        }
        info!("Driving session {} ended", id);
        self.events.emit_lossy(ViaEvent::SessionChanged {
            session_id: None,
            timestamp: chrono::Utc::now(),
        });
    }

    fn set_status(&mut self, status: &str) {
        if self.status != status {
            self.status = status.to_owned();
            self.events.emit_lossy(ViaEvent::EngineStatusChanged {
                status: status.to_owned(),
                timestamp: chrono::Utc::now(),
            });
        }
    }

    fn publish(&self, sample: &EngineSample) {
        self.events.emit_lossy(ViaEvent::EngineReading {
            session_id: self.session_id,
            rpm: sample.rpm,
            speed_kph: sample.speed_kph,
            coolant_temp_c: sample.coolant_temp_c,
            throttle_pct: sample.throttle_pct,
            engine_load_pct: sample.engine_load_pct,
            timestamp: chrono::Utc::now(),
        });
    }

    /// Readings arrive at 10 Hz; rows go in at the configured log interval
    async fn maybe_persist(&mut self, sample: &EngineSample) {
        let due = match self.last_logged {
            Some(last) => last.elapsed() >= self.log_interval,
            None => true,
        };
        if !due {
            return;
        }
        self.last_logged = Some(Instant::now());

        debug!(
            "Engine: {} rpm, {} kph, {} / throttle {}",
            sample.rpm.unwrap_or(0.0),
            sample.speed_kph.unwrap_or(0.0),
            format_temperature(sample.coolant_temp_c),
            format_percent(sample.throttle_pct),
        );

        if let Err(e) = writes::insert_engine_reading(
            &self.pool,
            self.session_id,
            chrono::Utc::now(),
            sample.rpm,
            sample.speed_kph,
            sample.coolant_temp_c,
            sample.throttle_pct,
            sample.engine_load_pct,
        )
        .await
        {
            warn!("Failed to persist engine reading: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    /// Link whose connect/read outcomes are scripted per call; `down`
    /// simulates the adapter vanishing between reads
    #[derive(Default)]
    struct ScriptedLink {
        connects: VecDeque<Result<(), LinkError>>,
        reads: VecDeque<Result<EngineSample, LinkError>>,
        connected: bool,
        down: Arc<AtomicBool>,
    }

    impl EngineLink for ScriptedLink {
        fn connect(&mut self) -> Result<(), LinkError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(LinkError::NoAdapter);
            }
            let result = self.connects.pop_front().unwrap_or(Ok(()));
            self.connected = result.is_ok();
            result
        }

        fn is_connected(&self) -> bool {
            self.connected && !self.down.load(Ordering::SeqCst)
        }

        fn read(&mut self) -> Result<EngineSample, LinkError> {
            match self.reads.pop_front() {
                Some(Ok(sample)) => Ok(sample),
                Some(Err(e)) => Err(e),
                None => Err(LinkError::Read),
            }
        }

        fn disconnect(&mut self) {
            self.connected = false;
        }
    }

    fn sample() -> EngineSample {
        EngineSample {
            rpm: Some(2400.0),
            speed_kph: Some(62.0),
            coolant_temp_c: Some(88.0),
            throttle_pct: Some(34.0),
            engine_load_pct: Some(31.0),
        }
    }

    async fn test_pool() -> (TempDir, SqlitePool) {
        let dir = TempDir::new().unwrap();
        let pool = via_common::db::init::init_database(&dir.path().join("dash.db"))
            .await
            .unwrap();
        (dir, pool)
    }

    fn drain(rx: &mut broadcast::Receiver<ViaEvent>) -> Vec<ViaEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn statuses(events: &[ViaEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                ViaEvent::EngineStatusChanged { status, .. } => Some(status.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_temperature(Some(88.0)), "88°C");
        assert_eq!(format_temperature(None), "N/A");
        assert_eq!(format_percent(Some(34.0)), "34%");
        assert_eq!(format_percent(None), "N/A");
    }

    #[test]
    fn test_simulated_link_values_stay_in_range() {
        let mut link = SimulatedEngineLink::seeded(7);
        link.connect().unwrap();

        for _ in 0..200 {
            let sample = link.read().unwrap();
            let rpm = sample.rpm.unwrap();
            assert!((750.0..=4500.0).contains(&rpm));
            let speed = sample.speed_kph.unwrap();
            assert!((0.0..=130.0).contains(&speed));
            let load = sample.engine_load_pct.unwrap();
            assert!((0.0..=100.0).contains(&load));
        }
    }

    #[test]
    fn test_simulated_link_is_deterministic() {
        let mut a = SimulatedEngineLink::seeded(7);
        let mut b = SimulatedEngineLink::seeded(7);
        a.connect().unwrap();
        b.connect().unwrap();

        for _ in 0..10 {
            assert_eq!(a.read().unwrap(), b.read().unwrap());
        }
    }

    #[tokio::test]
    async fn test_connect_starts_session_and_reports_status() {
        let (_dir, pool) = test_pool().await;
        let events = EventBus::new(64);
        let mut rx = events.subscribe();

        let mut link = ScriptedLink::default();
        link.reads.push_back(Ok(sample()));
        let mut monitor = EngineMonitor::new(link, pool, events, Duration::from_secs(1));

        // First tick connects, second reads
        monitor.tick().await;
        monitor.tick().await;

        let received = drain(&mut rx);
        assert_eq!(
            statuses(&received),
            vec!["Connecting...".to_owned(), "Connected".to_owned()]
        );
        assert!(received
            .iter()
            .any(|e| matches!(e, ViaEvent::SessionChanged { session_id: Some(_), .. })));
        assert!(received.iter().any(|e| matches!(
            e,
            ViaEvent::EngineReading { rpm: Some(r), .. } if *r == 2400.0
        )));
        assert!(monitor.session_id.is_some());
    }

    #[tokio::test]
    async fn test_no_adapter_status_without_session() {
        let (_dir, pool) = test_pool().await;
        let events = EventBus::new(64);
        let mut rx = events.subscribe();

        let mut link = ScriptedLink::default();
        link.connects.push_back(Err(LinkError::NoAdapter));
        let mut monitor = EngineMonitor::new(link, pool, events, Duration::from_secs(1));

        monitor.tick().await;

        let received = drain(&mut rx);
        assert_eq!(
            statuses(&received),
            vec!["Connecting...".to_owned(), "No adapter found".to_owned()]
        );
        assert!(monitor.session_id.is_none());
    }

    #[tokio::test]
    async fn test_read_error_ends_session_and_resets_fields() {
        let (_dir, pool) = test_pool().await;
        let events = EventBus::new(64);
        let mut rx = events.subscribe();

        let mut link = ScriptedLink::default();
        link.reads.push_back(Ok(sample()));
        link.reads.push_back(Err(LinkError::Read));
        let mut monitor = EngineMonitor::new(link, pool.clone(), events, Duration::from_secs(1));

        monitor.tick().await; // connect
        monitor.tick().await; // good read
        drain(&mut rx);
        monitor.tick().await; // failing read

        let received = drain(&mut rx);
        assert_eq!(statuses(&received), vec!["Read error".to_owned()]);
        assert!(received
            .iter()
            .any(|e| matches!(e, ViaEvent::SessionChanged { session_id: None, .. })));
        // Cleared reading published after link loss
        assert!(received
            .iter()
            .any(|e| matches!(e, ViaEvent::EngineReading { rpm: None, .. })));
        assert!(monitor.session_id.is_none());

        let ended: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM driving_sessions WHERE ended_at IS NOT NULL")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(ended, 1);
    }

    #[tokio::test]
    async fn test_link_drop_ends_session_before_reconnect() {
        let (_dir, pool) = test_pool().await;
        let events = EventBus::new(64);
        let mut rx = events.subscribe();

        let down = Arc::new(AtomicBool::new(false));
        let mut link = ScriptedLink {
            down: down.clone(),
            ..Default::default()
        };
        link.reads.push_back(Ok(sample()));
        link.reads.push_back(Ok(sample()));
        let mut monitor = EngineMonitor::new(link, pool.clone(), events, Duration::from_secs(1));

        monitor.tick().await; // connect
        monitor.tick().await; // good read
        let first_session = monitor.session_id;
        assert!(first_session.is_some());
        drain(&mut rx);

        // Adapter vanishes between reads
        down.store(true, Ordering::SeqCst);
        monitor.tick().await;

        let received = drain(&mut rx);
        assert_eq!(statuses(&received), vec!["Disconnected".to_owned()]);
        assert!(received
            .iter()
            .any(|e| matches!(e, ViaEvent::SessionChanged { session_id: None, .. })));
        // Cleared reading published for the dead link
        assert!(received
            .iter()
            .any(|e| matches!(e, ViaEvent::EngineReading { rpm: None, .. })));
        assert!(monitor.session_id.is_none());

        // Link comes back: a new session starts, the old one stays closed
        down.store(false, Ordering::SeqCst);
        monitor.last_attempt = None;
        monitor.tick().await;

        assert!(monitor.session_id.is_some());
        assert_ne!(monitor.session_id, first_session);

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM driving_sessions")
            .fetch_one(&pool)
            .await
            .unwrap();
        let open: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM driving_sessions WHERE ended_at IS NULL")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(total, 2);
        assert_eq!(open, 1);
    }

    #[tokio::test]
    async fn test_readings_are_downsampled_into_rows() {
        let (_dir, pool) = test_pool().await;
        let events = EventBus::new(256);

        let mut link = ScriptedLink::default();
        for _ in 0..5 {
            link.reads.push_back(Ok(sample()));
        }
        // Long log interval: only the first read may persist
        let mut monitor =
            EngineMonitor::new(link, pool.clone(), events, Duration::from_secs(3600));

        monitor.tick().await; // connect
        for _ in 0..5 {
            monitor.tick().await;
        }

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM engine_readings")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn test_rows_carry_session_id() {
        let (_dir, pool) = test_pool().await;
        let events = EventBus::new(64);

        let mut link = ScriptedLink::default();
        link.reads.push_back(Ok(sample()));
        let mut monitor = EngineMonitor::new(link, pool.clone(), events, Duration::from_secs(1));

        monitor.tick().await;
        monitor.tick().await;

        let session_id: Option<i64> =
            sqlx::query_scalar("SELECT session_id FROM engine_readings LIMIT 1")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(session_id, monitor.session_id);
        assert!(session_id.is_some());
    }
}
