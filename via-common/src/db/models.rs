//! Database models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DrivingSession {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EngineReading {
    pub id: i64,
    pub session_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub rpm: Option<f64>,
    pub speed_kph: Option<f64>,
    pub coolant_temp_c: Option<f64>,
    pub throttle_pct: Option<f64>,
    pub engine_load_pct: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GpsReading {
    pub id: i64,
    pub session_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub accuracy_m: Option<f64>,
}
