//! Database initialization, models and row writers

pub mod init;
pub mod models;
pub mod writes;

pub use init::*;
pub use models::*;
pub use writes::*;
