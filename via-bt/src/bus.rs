//! Object-bus accessor for the BlueZ service
//!
//! Wraps the D-Bus capability the reconcilers need: enumerate managed
//! objects, read all properties of one (path, interface), call a method,
//! set a property. No caching; every call round-trips to the bus.
//!
//! Property values cross the boundary as [`PropValue`], a sum type over the
//! variant shapes BlueZ actually uses, with a raw passthrough for anything
//! unmodeled.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use zbus::zvariant::{OwnedObjectPath, OwnedValue};
use zbus::{fdo, names::InterfaceName, Connection};

use crate::error::{Error, Result};

/// Well-known BlueZ service name
pub const BLUEZ_SERVICE: &str = "org.bluez";
/// Adapter interface (local radio)
pub const ADAPTER_IFACE: &str = "org.bluez.Adapter1";
/// Remote device interface
pub const DEVICE_IFACE: &str = "org.bluez.Device1";
/// AVRCP media player interface (track metadata and transport)
pub const MEDIA_PLAYER_IFACE: &str = "org.bluez.MediaPlayer1";
/// AVRCP remote-control capability marker
pub const MEDIA_CONTROL_IFACE: &str = "org.bluez.MediaControl1";

/// Properties of one interface on one object
pub type PropertyMap = BTreeMap<String, PropValue>;
/// Interfaces exposed by one object
pub type InterfaceMap = BTreeMap<String, PropertyMap>;
/// All managed objects, keyed by object path
///
/// BTreeMap keeps enumeration order stable across polls, which makes
/// first-match device selection deterministic within a session.
pub type ObjectMap = BTreeMap<String, InterfaceMap>;

/// A property value as seen on the bus
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Str(String),
    Bool(bool),
    Uint(u64),
    Int(i64),
    ObjectPath(String),
    Dict(PropertyMap),
    /// Unmodeled shape, kept for diagnostics only
    Raw(String),
}

impl PropValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Widen any non-negative integer shape; BlueZ reports durations and
    /// positions as unsigned milliseconds but some stacks use int64.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            PropValue::Uint(n) => Some(*n),
            PropValue::Int(n) if *n >= 0 => Some(*n as u64),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&PropertyMap> {
        match self {
            PropValue::Dict(map) => Some(map),
            _ => None,
        }
    }
}

/// Bus accessor contract (enables testing with fakes)
///
/// Errors map onto the core taxonomy: `TransportUnavailable` only at
/// connect time, `RemoteFault` for any per-call failure.
#[async_trait]
pub trait ObjectBus: Send + Sync {
    /// All managed objects with their interfaces and properties
    async fn list_managed_objects(&self) -> Result<ObjectMap>;

    /// All properties of `interface` on the object at `path`
    async fn get_all_properties(&self, path: &str, interface: &str) -> Result<PropertyMap>;

    /// Invoke a no-argument method on (path, interface)
    async fn call_method(&self, path: &str, interface: &str, method: &str) -> Result<()>;

    /// Set one property on (path, interface)
    async fn set_property(
        &self,
        path: &str,
        interface: &str,
        name: &str,
        value: PropValue,
    ) -> Result<()>;
}

/// Accessor backed by the system D-Bus
pub struct ZbusObjectBus {
    conn: Connection,
}

impl ZbusObjectBus {
    /// Connect to the system bus and probe the BlueZ service once.
    ///
    /// A missing bus or missing bluetoothd is a permanent condition for the
    /// life of the process, surfaced here instead of on every poll tick.
    pub async fn connect() -> Result<Self> {
        let conn = Connection::system()
            .await
            .map_err(|e| Error::TransportUnavailable(e.to_string()))?;
        let bus = Self { conn };
        bus.list_managed_objects()
            .await
            .map_err(|e| Error::TransportUnavailable(e.to_string()))?;
        Ok(bus)
    }

    /// Underlying connection, needed to export the pairing agent
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

#[async_trait]
impl ObjectBus for ZbusObjectBus {
    async fn list_managed_objects(&self) -> Result<ObjectMap> {
        let proxy = fdo::ObjectManagerProxy::builder(&self.conn)
            .destination(BLUEZ_SERVICE)
            .map_err(Error::remote_fault)?
            .path("/")
            .map_err(Error::remote_fault)?
            .build()
            .await
            .map_err(Error::remote_fault)?;

        let managed = proxy
            .get_managed_objects()
            .await
            .map_err(Error::remote_fault)?;

        let mut objects = ObjectMap::new();
        for (path, interfaces) in managed {
            let mut by_interface = InterfaceMap::new();
            for (name, props) in interfaces {
                by_interface.insert(name.to_string(), decode_property_map(&props));
            }
            objects.insert(path.to_string(), by_interface);
        }
        Ok(objects)
    }

    async fn get_all_properties(&self, path: &str, interface: &str) -> Result<PropertyMap> {
        let proxy = fdo::PropertiesProxy::builder(&self.conn)
            .destination(BLUEZ_SERVICE)
            .map_err(Error::remote_fault)?
            .path(path.to_owned())
            .map_err(Error::remote_fault)?
            .build()
            .await
            .map_err(Error::remote_fault)?;

        let iface = InterfaceName::try_from(interface).map_err(Error::remote_fault)?;
        let props = proxy.get_all(iface).await.map_err(Error::remote_fault)?;
        Ok(decode_property_map(&props))
    }

    async fn call_method(&self, path: &str, interface: &str, method: &str) -> Result<()> {
        let proxy = zbus::Proxy::new(&self.conn, BLUEZ_SERVICE, path, interface)
            .await
            .map_err(Error::remote_fault)?;
        proxy
            .call_method(method, &())
            .await
            .map_err(Error::remote_fault)?;
        Ok(())
    }

    async fn set_property(
        &self,
        path: &str,
        interface: &str,
        name: &str,
        value: PropValue,
    ) -> Result<()> {
        let proxy = zbus::Proxy::new(&self.conn, BLUEZ_SERVICE, path, interface)
            .await
            .map_err(Error::remote_fault)?;
        match value {
            PropValue::Bool(b) => proxy.set_property(name, b).await,
            PropValue::Uint(n) => proxy.set_property(name, n as u32).await,
            PropValue::Int(n) => proxy.set_property(name, n).await,
            PropValue::Str(s) => proxy.set_property(name, s.as_str()).await,
            other => {
                return Err(Error::remote_fault(format!(
                    "unsupported property shape for {}: {:?}",
                    name, other
                )))
            }
        }
        .map_err(Error::remote_fault)?;
        Ok(())
    }
}

fn decode_property_map(props: &HashMap<String, OwnedValue>) -> PropertyMap {
    props
        .iter()
        .map(|(k, v)| (k.clone(), decode_value(v)))
        .collect()
}

/// Decode one zvariant value into the shapes the reconcilers understand.
fn decode_value(value: &OwnedValue) -> PropValue {
    if let Ok(s) = <&str>::try_from(value) {
        return PropValue::Str(s.to_owned());
    }
    if let Ok(b) = bool::try_from(value) {
        return PropValue::Bool(b);
    }
    if let Ok(p) = OwnedObjectPath::try_from(value.clone()) {
        return PropValue::ObjectPath(p.to_string());
    }
    if let Ok(n) = u32::try_from(value) {
        return PropValue::Uint(n.into());
    }
    if let Ok(n) = u16::try_from(value) {
        return PropValue::Uint(n.into());
    }
    if let Ok(n) = u64::try_from(value) {
        return PropValue::Uint(n);
    }
    if let Ok(n) = i64::try_from(value) {
        return PropValue::Int(n);
    }
    if let Ok(n) = i32::try_from(value) {
        return PropValue::Int(n.into());
    }
    if let Ok(n) = i16::try_from(value) {
        return PropValue::Int(n.into());
    }
    if let Ok(dict) = <HashMap<String, OwnedValue>>::try_from(value.clone()) {
        return PropValue::Dict(decode_property_map(&dict));
    }
    PropValue::Raw(format!("{:?}", value))
}
