//! One-shot adapter bootstrap
//!
//! Makes the first local adapter powered, discoverable and pairable with no
//! discoverability timeout. Every step is independently best-effort; a
//! failure is logged and the remaining steps still run, and a total failure
//! never prevents application startup.

use tracing::{info, warn};

use crate::bus::{ObjectBus, PropValue, ADAPTER_IFACE};
use crate::error::{Error, Result};

/// Find the first adapter object and configure it for open pairing.
///
/// Returns `Bootstrap` when no adapter object exists at all; individual
/// property failures are logged and swallowed.
pub async fn configure_adapter<B: ObjectBus>(bus: &B) -> Result<()> {
    let objects = bus.list_managed_objects().await.map_err(Error::bootstrap)?;

    let adapter_path = objects
        .iter()
        .find(|(_, interfaces)| interfaces.contains_key(ADAPTER_IFACE))
        .map(|(path, _)| path.clone())
        .ok_or_else(|| Error::Bootstrap("no adapter object found".to_owned()))?;

    let settings = [
        ("Powered", PropValue::Bool(true)),
        ("Discoverable", PropValue::Bool(true)),
        ("Pairable", PropValue::Bool(true)),
        // 0 = discoverable forever
        ("DiscoverableTimeout", PropValue::Uint(0)),
    ];

    for (name, value) in settings {
        if let Err(e) = bus
            .set_property(&adapter_path, ADAPTER_IFACE, name, value)
            .await
        {
            warn!("Failed to set adapter {}: {}", name, e);
        }
    }

    info!("Adapter {} configured for open pairing", adapter_path);
    Ok(())
}
