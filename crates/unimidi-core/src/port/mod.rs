//! Port identity.
//!
//! A [`PortHandle`] names one endpoint of one backend. Identity is the pair
//! (API, backend-local [`PortKey`]); everything else on the handle is
//! descriptive and never takes part in comparisons.

mod matcher;
pub use matcher::{find_closest_port, match_score, MatchScore};

use crate::api::Api;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Backend-local port key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PortKey {
    Index(u64),
    Id(String),
}

impl fmt::Display for PortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortKey::Index(i) => write!(f, "#{}", i),
            PortKey::Id(id) => f.write_str(id),
        }
    }
}

impl From<u64> for PortKey {
    fn from(i: u64) -> Self {
        PortKey::Index(i)
    }
}

impl From<&str> for PortKey {
    fn from(id: &str) -> Self {
        PortKey::Id(id.to_string())
    }
}

impl From<String> for PortKey {
    fn from(id: String) -> Self {
        PortKey::Id(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Input,
    Output,
}

/// What a port can carry on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[default]
    Midi1,
    Midi1AndUmp,
}

impl Protocol {
    pub fn supports_ump(self) -> bool {
        self == Protocol::Midi1AndUmp
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportType {
    #[default]
    Unknown,
    Hardware,
    Software,
    Network,
}

/// Descriptive port metadata. Backends fill in what they know.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub display_name: String,
    pub protocol: Protocol,
    pub transport: TransportType,
    pub client_name: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
    pub device_name: Option<String>,
    pub port_name: Option<String>,
    /// Stable hardware identifier (USB container id etc.) when the OS exposes one.
    pub hardware_id: Option<String>,
}

impl PortInfo {
    pub fn named(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            ..Default::default()
        }
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn transport(mut self, transport: TransportType) -> Self {
        self.transport = transport;
        self
    }

    pub fn manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = Some(manufacturer.into());
        self
    }

    pub fn product(mut self, product: impl Into<String>) -> Self {
        self.product = Some(product.into());
        self
    }

    pub fn serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = Some(client_name.into());
        self
    }

    pub fn device_name(mut self, device_name: impl Into<String>) -> Self {
        self.device_name = Some(device_name.into());
        self
    }

    pub fn port_name(mut self, port_name: impl Into<String>) -> Self {
        self.port_name = Some(port_name.into());
        self
    }

    pub fn hardware_id(mut self, hardware_id: impl Into<String>) -> Self {
        self.hardware_id = Some(hardware_id.into());
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PortData {
    api: Api,
    key: PortKey,
    direction: Direction,
    info: PortInfo,
}

/// Immutable, cheaply clonable handle to a discovered endpoint.
///
/// Equality, ordering and hashing use the API and key only. A handle may go
/// stale when its device disappears; backends then reject it with
/// `Error::PortUnavailable`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortHandle(Arc<PortData>);

impl PortHandle {
    pub fn new(api: Api, key: impl Into<PortKey>, direction: Direction, info: PortInfo) -> Self {
        Self(Arc::new(PortData {
            api,
            key: key.into(),
            direction,
            info,
        }))
    }

    pub fn api(&self) -> Api {
        self.0.api
    }

    pub fn key(&self) -> &PortKey {
        &self.0.key
    }

    pub fn direction(&self) -> Direction {
        self.0.direction
    }

    pub fn display_name(&self) -> &str {
        &self.0.info.display_name
    }

    pub fn protocol(&self) -> Protocol {
        self.0.info.protocol
    }

    pub fn transport(&self) -> TransportType {
        self.0.info.transport
    }

    pub fn info(&self) -> &PortInfo {
        &self.0.info
    }

    /// Compares display names. Handy for persisting a port choice, never for identity.
    pub fn same_name(&self, other: &PortHandle) -> bool {
        self.api() == other.api() && self.display_name() == other.display_name()
    }
}

impl PartialEq for PortHandle {
    fn eq(&self, other: &Self) -> bool {
        self.0.api == other.0.api && self.0.key == other.0.key
    }
}

impl Eq for PortHandle {}

impl Hash for PortHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.api.hash(state);
        self.0.key.hash(state);
    }
}

impl PartialOrd for PortHandle {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PortHandle {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.0.api, &self.0.key).cmp(&(other.0.api, &other.0.key))
    }
}

impl fmt::Debug for PortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortHandle")
            .field("api", &self.0.api)
            .field("key", &self.0.key)
            .field("direction", &self.0.direction)
            .field("name", &self.0.info.display_name)
            .finish()
    }
}

impl fmt::Display for PortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} {})", self.display_name(), self.api(), self.key())
    }
}
