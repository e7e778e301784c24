//! Database initialization
//!
//! Creates the database file and schema on first run; reopening an existing
//! database is a no-op thanks to CREATE TABLE IF NOT EXISTS.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Use sqlite options to create database if it doesn't exist
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // Enable foreign keys
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&pool)
        .await?;

    // WAL mode: the engine and GPS loops write while the UI reads
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;

    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    // Idempotent, safe to call on every startup
    create_driving_sessions_table(&pool).await?;
    create_engine_readings_table(&pool).await?;
    create_gps_readings_table(&pool).await?;

    Ok(pool)
}

async fn create_driving_sessions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS driving_sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at TEXT NOT NULL,
            ended_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_engine_readings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS engine_readings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER REFERENCES driving_sessions(id),
            timestamp TEXT NOT NULL,
            rpm REAL,
            speed_kph REAL,
            coolant_temp_c REAL,
            throttle_pct REAL,
            engine_load_pct REAL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_engine_readings_session
         ON engine_readings(session_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_gps_readings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS gps_readings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id INTEGER REFERENCES driving_sessions(id),
            timestamp TEXT NOT NULL,
            latitude REAL,
            longitude REAL,
            accuracy_m REAL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_gps_readings_session
         ON gps_readings(session_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
