//! # Via Bluetooth Core
//!
//! Best-effort reconciliation between the system Bluetooth stack (BlueZ over
//! D-Bus) and the dashboard's cached view of it:
//! - Device presence polling with field-level delta events
//! - AVRCP media session polling with derived playback position
//! - Album art enrichment through the iTunes Search API
//! - One-shot adapter bootstrap with an auto-accept pairing agent
//!
//! Nothing here raises to its caller; failures degrade to "no device shown"
//! and "no track shown" states published on the shared event bus.

pub mod adapter;
pub mod agent;
pub mod artwork;
pub mod bus;
pub mod device;
pub mod error;
pub mod media;
pub mod service;

pub use error::{Error, Result};
pub use service::BluetoothService;
