//! Native MIDI 1.0 backend built on midir.
//!
//! midir picks the platform subsystem at compile time (ALSA sequencer,
//! CoreMIDI, WinMM or Web MIDI), so this backend registers under
//! [`Api::native_midi1`]. It moves byte streams only.

use super::{
    Backend, Capabilities, Delivery, Inbox, OpenOptions, OpenPortId, RawData, RawPacket,
    ReceiveCallback, Wire,
};
use midir::{
    ConnectError, ConnectErrorKind, Ignore, InitError, MidiInput, MidiInputConnection, MidiOutput,
    MidiOutputConnection, SendError,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use unimidi_core::{Api, Direction, Error, PortHandle, PortInfo, PortKey, Protocol, Result};

fn init_error(e: InitError) -> Error {
    Error::BackendIo(format!("MIDI subsystem init failed: {}", e))
}

fn connect_error<T>(e: ConnectError<T>, port: &str) -> Error {
    match e.kind() {
        ConnectErrorKind::InvalidPort => Error::PortUnavailable(port.to_string()),
        ConnectErrorKind::Other(reason) => {
            Error::BackendIo(format!("failed to connect to {}: {}", port, reason))
        }
    }
}

fn send_error(e: SendError) -> Error {
    Error::BackendIo(format!("MIDI send failed: {}", e))
}

enum NativeConnection {
    Input {
        port_id: Option<String>,
        // Held for its drop, which disconnects.
        _conn: MidiInputConnection<()>,
        delivery: Arc<Mutex<Delivery>>,
    },
    Output {
        port_id: Option<String>,
        conn: MidiOutputConnection,
    },
}

impl NativeConnection {
    fn port_id(&self) -> Option<&str> {
        match self {
            NativeConnection::Input { port_id, .. } | NativeConnection::Output { port_id, .. } => {
                port_id.as_deref()
            }
        }
    }

    fn direction(&self) -> Direction {
        match self {
            NativeConnection::Input { .. } => Direction::Input,
            NativeConnection::Output { .. } => Direction::Output,
        }
    }
}

pub struct MidirBackend {
    api: Api,
    client_name: String,
    connections: Mutex<HashMap<OpenPortId, NativeConnection>>,
    next_id: AtomicU64,
}

impl MidirBackend {
    pub fn new() -> Result<Self> {
        Self::with_client_name(unimidi_core::config::DEFAULT_CLIENT_NAME)
    }

    pub fn with_client_name(client_name: impl Into<String>) -> Result<Self> {
        let api = Api::native_midi1().ok_or_else(|| {
            Error::Unsupported("no native MIDI subsystem on this platform".to_string())
        })?;
        Ok(Self {
            api,
            client_name: client_name.into(),
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    fn midi_input(&self, client_name: &str) -> Result<MidiInput> {
        let mut input = MidiInput::new(client_name).map_err(init_error)?;
        // Filtering happens in the input engine.
        input.ignore(Ignore::None);
        Ok(input)
    }

    fn midi_output(&self, client_name: &str) -> Result<MidiOutput> {
        MidiOutput::new(client_name).map_err(init_error)
    }

    fn port_id<'a>(&self, port: &'a PortHandle) -> Result<&'a str> {
        match port.key() {
            PortKey::Id(id) if port.api() == self.api => Ok(id),
            _ => Err(Error::PortUnavailable(port.to_string())),
        }
    }

    fn check_not_open(&self, port_id: &str, direction: Direction, name: &str) -> Result<()> {
        let held = self
            .connections
            .lock()
            .values()
            .any(|c| c.direction() == direction && c.port_id() == Some(port_id));
        if held {
            return Err(Error::AlreadyOpen(name.to_string()));
        }
        Ok(())
    }

    fn insert(&self, connection: NativeConnection) -> OpenPortId {
        let id = OpenPortId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.connections.lock().insert(id, connection);
        id
    }

    fn forward(
        delivery: Arc<Mutex<Delivery>>,
    ) -> impl FnMut(u64, &[u8], &mut ()) + Send + 'static {
        move |stamp_us: u64, bytes: &[u8], _: &mut ()| {
            delivery
                .lock()
                .deliver(Ok(RawPacket::bytes(bytes, Some(stamp_us.saturating_mul(1000)))));
        }
    }
}

impl Backend for MidirBackend {
    fn api(&self) -> Api {
        self.api
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            midi1: true,
            ump: false,
            virtual_ports: cfg!(all(unix, not(target_arch = "wasm32"))),
            timestamps: true,
            hotplug: false,
            sysex_chunk_limit: None,
        }
    }

    fn list_ports(&self, direction: Direction) -> Result<Vec<PortHandle>> {
        let client = format!("{}-enum", self.client_name);
        let named: Vec<(String, String)> = match direction {
            Direction::Input => {
                let input = self.midi_input(&client)?;
                input
                    .ports()
                    .iter()
                    .filter_map(|p| input.port_name(p).ok().map(|name| (p.id(), name)))
                    .collect()
            }
            Direction::Output => {
                let output = self.midi_output(&client)?;
                output
                    .ports()
                    .iter()
                    .filter_map(|p| output.port_name(p).ok().map(|name| (p.id(), name)))
                    .collect()
            }
        };

        let mut seen = std::collections::HashSet::new();
        Ok(named
            .into_iter()
            .filter(|(id, _)| seen.insert(id.clone()))
            .map(|(id, name)| {
                let info = PortInfo::named(name.clone())
                    .protocol(Protocol::Midi1)
                    .port_name(name);
                PortHandle::new(self.api, id, direction, info)
            })
            .collect())
    }

    fn open(&self, port: &PortHandle, options: &OpenOptions) -> Result<OpenPortId> {
        if options.wire != Wire::Bytes {
            return Err(Error::Unsupported(format!("{} carries MIDI 1.0 only", self.api)));
        }
        let port_id = self.port_id(port)?;
        let name = port.display_name();
        self.check_not_open(port_id, options.direction, name)?;

        let connection = match options.direction {
            Direction::Input => {
                let input = self.midi_input(&options.client_name)?;
                let native = input
                    .find_port_by_id(port_id.to_string())
                    .ok_or_else(|| Error::PortUnavailable(port.to_string()))?;
                let delivery = Arc::new(Mutex::new(Delivery::Inbox(Inbox::new(
                    options.buffer_size,
                ))));
                let conn = input
                    .connect(&native, name, Self::forward(Arc::clone(&delivery)), ())
                    .map_err(|e| connect_error(e, name))?;
                NativeConnection::Input {
                    port_id: Some(port_id.to_string()),
                    _conn: conn,
                    delivery,
                }
            }
            Direction::Output => {
                let output = self.midi_output(&options.client_name)?;
                let native = output
                    .find_port_by_id(port_id.to_string())
                    .ok_or_else(|| Error::PortUnavailable(port.to_string()))?;
                let conn = output
                    .connect(&native, name)
                    .map_err(|e| connect_error(e, name))?;
                NativeConnection::Output {
                    port_id: Some(port_id.to_string()),
                    conn,
                }
            }
        };

        let id = self.insert(connection);
        debug!("{} {:?} {} opened: {}", self.api, options.direction, id, name);
        Ok(id)
    }

    #[cfg(all(unix, not(target_arch = "wasm32")))]
    fn open_virtual(&self, options: &OpenOptions) -> Result<OpenPortId> {
        use midir::os::unix::{VirtualInput, VirtualOutput};

        if options.wire != Wire::Bytes {
            return Err(Error::Unsupported(format!("{} carries MIDI 1.0 only", self.api)));
        }
        let name = options
            .virtual_port_name
            .as_deref()
            .ok_or_else(|| Error::InvalidConfig("virtual port needs a name".to_string()))?;

        let connection = match options.direction {
            Direction::Input => {
                let delivery = Arc::new(Mutex::new(Delivery::Inbox(Inbox::new(
                    options.buffer_size,
                ))));
                let conn = self
                    .midi_input(&options.client_name)?
                    .create_virtual(name, Self::forward(Arc::clone(&delivery)), ())
                    .map_err(|e| connect_error(e, name))?;
                NativeConnection::Input {
                    port_id: None,
                    _conn: conn,
                    delivery,
                }
            }
            Direction::Output => {
                let conn = self
                    .midi_output(&options.client_name)?
                    .create_virtual(name)
                    .map_err(|e| connect_error(e, name))?;
                NativeConnection::Output {
                    port_id: None,
                    conn,
                }
            }
        };

        let id = self.insert(connection);
        debug!("{} virtual {:?} {} created: {}", self.api, options.direction, id, name);
        Ok(id)
    }

    fn close(&self, id: OpenPortId) -> Result<()> {
        let removed = self.connections.lock().remove(&id);
        if removed.is_some() {
            debug!("{} {} closed", self.api, id);
        }
        Ok(())
    }

    fn send(&self, id: OpenPortId, data: RawData<'_>) -> Result<()> {
        let RawData::Bytes(bytes) = data else {
            return Err(Error::Unsupported(format!("{} carries MIDI 1.0 only", self.api)));
        };
        let mut connections = self.connections.lock();
        match connections.get_mut(&id) {
            Some(NativeConnection::Output { conn, .. }) => conn.send(bytes).map_err(send_error),
            Some(NativeConnection::Input { .. }) => {
                Err(Error::Unsupported("cannot send on an input".to_string()))
            }
            None => Err(Error::NotOpen),
        }
    }

    fn set_receive_callback(&self, id: OpenPortId, mut callback: ReceiveCallback) -> Result<()> {
        let delivery = match self.connections.lock().get(&id) {
            Some(NativeConnection::Input { delivery, .. }) => Arc::clone(delivery),
            Some(NativeConnection::Output { .. }) => {
                return Err(Error::Unsupported(
                    "receive callback on an output".to_string(),
                ))
            }
            None => return Err(Error::NotOpen),
        };

        let mut delivery = delivery.lock();
        if let Delivery::Inbox(inbox) = &mut *delivery {
            while let Some(item) = inbox.pop() {
                callback(item);
            }
        }
        *delivery = Delivery::Callback(callback);
        Ok(())
    }

    fn poll(&self, id: OpenPortId) -> Result<Option<RawPacket>> {
        let delivery = match self.connections.lock().get(&id) {
            Some(NativeConnection::Input { delivery, .. }) => Arc::clone(delivery),
            Some(NativeConnection::Output { .. }) => return Ok(None),
            None => return Err(Error::NotOpen),
        };
        let mut delivery = delivery.lock();
        delivery.poll()
    }
}
