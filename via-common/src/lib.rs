//! # Via Common Library
//!
//! Shared code for the via dashboard binaries including:
//! - Database initialization and row writers
//! - Event types (ViaEvent enum) and the EventBus
//! - Configuration loading

pub mod config;
pub mod db;
pub mod error;
pub mod events;

pub use error::{Error, Result};
