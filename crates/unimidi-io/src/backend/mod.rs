//! Backend contract.
//!
//! One [`Backend`] implementation per native MIDI subsystem. Backends move
//! raw wire data (bytes or UMP words) and know nothing about decoding;
//! the input and output engines put the codec in the data path.

pub mod dummy;
pub mod loopback;
#[cfg(feature = "midi-io")]
pub mod native;

pub use dummy::DummyBackend;
pub use loopback::{LoopbackBackend, LoopbackBuilder};
#[cfg(feature = "midi-io")]
pub use native::MidirBackend;

use ringbuf::{traits::*, HeapRb};
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use unimidi_core::{Api, Direction, Error, MidiProtocol, PortHandle, Protocol, Result};

/// Identifies one open connection inside a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpenPortId(pub u64);

impl fmt::Display for OpenPortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "open#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Carries MIDI 1.0 byte streams.
    pub midi1: bool,
    /// Carries UMP word streams.
    pub ump: bool,
    pub virtual_ports: bool,
    /// Stamps incoming data with its own clock.
    pub timestamps: bool,
    /// Notifies port changes; otherwise observers poll.
    pub hotplug: bool,
    /// Largest SysEx chunk the transport accepts in one send.
    pub sysex_chunk_limit: Option<usize>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            midi1: true,
            ump: false,
            virtual_ports: false,
            timestamps: false,
            hotplug: false,
            sysex_chunk_limit: None,
        }
    }
}

/// Wire format of one open connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wire {
    Bytes,
    Words,
}

impl Wire {
    /// Wire format for a connection. `port_protocol` is `None` for virtual
    /// ports, which speak whatever the backend carries.
    pub fn select(
        caps: &Capabilities,
        protocol: MidiProtocol,
        port_protocol: Option<Protocol>,
    ) -> Result<Wire> {
        if !caps.midi1 && !caps.ump {
            return Err(Error::Unsupported("backend carries no MIDI data".to_string()));
        }
        if protocol == MidiProtocol::Midi2 {
            if !caps.ump {
                return Err(Error::Unsupported(
                    "MIDI 2.0 requested on a MIDI 1.0-only backend".to_string(),
                ));
            }
            let port_speaks_ump = port_protocol.map(Protocol::supports_ump).unwrap_or(true);
            if port_speaks_ump {
                return Ok(Wire::Words);
            }
        }
        Ok(if caps.midi1 { Wire::Bytes } else { Wire::Words })
    }
}

#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub direction: Direction,
    pub wire: Wire,
    pub client_name: String,
    pub virtual_port_name: Option<String>,
    /// Capacity of the backend-side queue used until a receive callback is set.
    pub buffer_size: usize,
}

impl OpenOptions {
    pub fn new(direction: Direction, wire: Wire) -> Self {
        Self {
            direction,
            wire,
            client_name: unimidi_core::config::DEFAULT_CLIENT_NAME.to_string(),
            virtual_port_name: None,
            buffer_size: 1024,
        }
    }
}

/// Borrowed outgoing data.
#[derive(Debug, Clone, Copy)]
pub enum RawData<'a> {
    Bytes(&'a [u8]),
    Words(&'a [u32]),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawPayload {
    Bytes(SmallVec<[u8; 8]>),
    Words(SmallVec<[u32; 4]>),
}

/// Incoming data as delivered by the native subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub payload: RawPayload,
    /// Backend timestamp in nanoseconds, if the backend stamps input.
    pub timestamp: Option<u64>,
}

impl RawPacket {
    pub fn bytes(data: &[u8], timestamp: Option<u64>) -> Self {
        Self {
            payload: RawPayload::Bytes(SmallVec::from_slice(data)),
            timestamp,
        }
    }

    pub fn words(data: &[u32], timestamp: Option<u64>) -> Self {
        Self {
            payload: RawPayload::Words(SmallVec::from_slice(data)),
            timestamp,
        }
    }

    pub(crate) fn from_raw(data: RawData<'_>, timestamp: Option<u64>) -> Self {
        match data {
            RawData::Bytes(b) => Self::bytes(b, timestamp),
            RawData::Words(w) => Self::words(w, timestamp),
        }
    }
}

/// Invoked from whatever thread the native subsystem delivers on.
/// Must return quickly and never block indefinitely.
pub type ReceiveCallback = Box<dyn FnMut(Result<RawPacket>) + Send>;

/// Called by a backend whenever its set of ports may have changed.
pub type ChangeNotifier = Arc<dyn Fn() + Send + Sync>;

/// Keeps a hot-plug subscription alive; dropping it unsubscribes.
pub struct WatchGuard {
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchGuard {
    pub fn new(on_drop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_drop: Some(Box::new(on_drop)),
        }
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f();
        }
    }
}

impl fmt::Debug for WatchGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WatchGuard")
    }
}

pub trait Backend: Send + Sync {
    fn api(&self) -> Api;

    fn capabilities(&self) -> Capabilities;

    /// Ports currently visible in `direction`, without duplicate keys.
    fn list_ports(&self, direction: Direction) -> Result<Vec<PortHandle>>;

    /// Fails with `PortUnavailable`, `AlreadyOpen` or `PermissionDenied`.
    fn open(&self, port: &PortHandle, options: &OpenOptions) -> Result<OpenPortId>;

    /// Creates a port other applications can connect to.
    fn open_virtual(&self, options: &OpenOptions) -> Result<OpenPortId> {
        let _ = options;
        Err(Error::Unsupported(format!(
            "{} does not support virtual ports",
            self.api()
        )))
    }

    /// Idempotent. Unknown or already-closed ids are not an error.
    fn close(&self, id: OpenPortId) -> Result<()>;

    fn send(&self, id: OpenPortId, data: RawData<'_>) -> Result<()>;

    /// Replaces the queue of an input connection with push delivery.
    /// Backends that can only be polled return `Unsupported`.
    fn set_receive_callback(&self, id: OpenPortId, callback: ReceiveCallback) -> Result<()>;

    /// Next queued input, or `None`. Never blocks.
    fn poll(&self, id: OpenPortId) -> Result<Option<RawPacket>>;

    /// Subscribes to port changes. `Ok(None)` means no native hot-plug support.
    fn watch(&self, notify: ChangeNotifier) -> Result<Option<WatchGuard>> {
        let _ = notify;
        Ok(None)
    }
}

/// Bounded drop-oldest queue of raw input, for connections without a callback.
pub struct Inbox {
    ring: HeapRb<Result<RawPacket>>,
    dropped: u64,
}

impl Inbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: HeapRb::new(capacity.max(1)),
            dropped: 0,
        }
    }

    pub fn push(&mut self, item: Result<RawPacket>) {
        if self.ring.push_overwrite(item).is_some() {
            self.dropped += 1;
            debug!("MIDI inbox full, dropped oldest item");
        }
    }

    pub fn pop(&mut self) -> Option<Result<RawPacket>> {
        self.ring.try_pop()
    }

    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Where a backend hands incoming data: the engine's callback, or a queue
/// drained by [`Backend::poll`].
pub(crate) enum Delivery {
    Callback(ReceiveCallback),
    Inbox(Inbox),
}

impl Delivery {
    pub(crate) fn deliver(&mut self, item: Result<RawPacket>) {
        match self {
            Delivery::Callback(cb) => cb(item),
            Delivery::Inbox(inbox) => inbox.push(item),
        }
    }

    pub(crate) fn poll(&mut self) -> Result<Option<RawPacket>> {
        match self {
            Delivery::Callback(_) => Ok(None),
            Delivery::Inbox(inbox) => inbox.pop().transpose(),
        }
    }
}
