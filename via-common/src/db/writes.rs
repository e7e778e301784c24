//! Single-row write operations
//!
//! All writers are fire-and-forget from the polling loops' point of view;
//! callers log failures and keep polling.

use crate::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

/// Insert a new driving session, returning its id
pub async fn create_session(pool: &SqlitePool, started_at: DateTime<Utc>) -> Result<i64> {
    let result = sqlx::query("INSERT INTO driving_sessions (started_at) VALUES (?)")
        .bind(started_at)
        .execute(pool)
        .await?;

    Ok(result.last_insert_rowid())
}

/// Mark a driving session as ended
pub async fn end_session(
    pool: &SqlitePool,
    session_id: i64,
    ended_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE driving_sessions SET ended_at = ? WHERE id = ?")
        .bind(ended_at)
        .bind(session_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Insert one engine telemetry row
#[allow(clippy::too_many_arguments)]
pub async fn insert_engine_reading(
    pool: &SqlitePool,
    session_id: Option<i64>,
    timestamp: DateTime<Utc>,
    rpm: Option<f64>,
    speed_kph: Option<f64>,
    coolant_temp_c: Option<f64>,
    throttle_pct: Option<f64>,
    engine_load_pct: Option<f64>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO engine_readings
            (session_id, timestamp, rpm, speed_kph, coolant_temp_c, throttle_pct, engine_load_pct)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(session_id)
    .bind(timestamp)
    .bind(rpm)
    .bind(speed_kph)
    .bind(coolant_temp_c)
    .bind(throttle_pct)
    .bind(engine_load_pct)
    .execute(pool)
    .await?;

    Ok(())
}

/// Insert one GPS fix row
pub async fn insert_gps_reading(
    pool: &SqlitePool,
    session_id: Option<i64>,
    timestamp: DateTime<Utc>,
    latitude: f64,
    longitude: f64,
    accuracy_m: f64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO gps_readings (session_id, timestamp, latitude, longitude, accuracy_m)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(session_id)
    .bind(timestamp)
    .bind(latitude)
    .bind(longitude)
    .bind(accuracy_m)
    .execute(pool)
    .await?;

    Ok(())
}
