//! Auto-accept pairing agent
//!
//! A stateless `org.bluez.Agent1` object exported on the system bus. Every
//! authorization request succeeds immediately so passengers can pair a phone
//! without touching the head unit. Registered as the system default agent
//! with capability "NoInputNoOutput".

use tracing::{debug, info};
use zbus::interface;
use zbus::zvariant::ObjectPath;
use zbus::Connection;

use crate::bus::BLUEZ_SERVICE;
use crate::error::{Error, Result};

/// Object path the agent is exported at
pub const AGENT_PATH: &str = "/via/agent";

const AGENT_MANAGER_IFACE: &str = "org.bluez.AgentManager1";
const BLUEZ_ROOT_PATH: &str = "/org/bluez";
const AGENT_CAPABILITY: &str = "NoInputNoOutput";

/// Stateless request handler; all methods are side-effect-free except logging
pub struct PairingAgent;

#[interface(name = "org.bluez.Agent1")]
impl PairingAgent {
    /// Incoming connection from a paired device. Always accepts.
    async fn request_authorization(&self, device: ObjectPath<'_>) -> zbus::fdo::Result<()> {
        info!("Authorizing device {}", device);
        Ok(())
    }

    /// Service-level authorization (A2DP, AVRCP, ...). Always accepts.
    async fn authorize_service(
        &self,
        device: ObjectPath<'_>,
        uuid: String,
    ) -> zbus::fdo::Result<()> {
        info!("Authorizing service {} for {}", uuid, device);
        Ok(())
    }

    /// Pairing attempt cancelled by the remote side
    async fn cancel(&self) {
        debug!("Pairing request cancelled");
    }

    /// Agent unregistered by bluetoothd
    async fn release(&self) {
        debug!("Pairing agent released");
    }
}

/// Export the agent and register it as both a named agent and the default.
pub async fn register_agent(conn: &Connection) -> Result<()> {
    conn.object_server()
        .at(AGENT_PATH, PairingAgent)
        .await
        .map_err(Error::bootstrap)?;

    let manager = zbus::Proxy::new(conn, BLUEZ_SERVICE, BLUEZ_ROOT_PATH, AGENT_MANAGER_IFACE)
        .await
        .map_err(Error::bootstrap)?;

    let path = ObjectPath::try_from(AGENT_PATH).map_err(Error::bootstrap)?;
    manager
        .call_method("RegisterAgent", &(&path, AGENT_CAPABILITY))
        .await
        .map_err(Error::bootstrap)?;
    manager
        .call_method("RequestDefaultAgent", &(&path,))
        .await
        .map_err(Error::bootstrap)?;

    info!("Pairing agent registered as default ({})", AGENT_CAPABILITY);
    Ok(())
}
