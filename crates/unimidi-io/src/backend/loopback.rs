//! In-memory backend.
//!
//! Every port has an input and an output endpoint joined by a virtual
//! cable: data sent to the output endpoint arrives at the input endpoint
//! of the same port. Devices can be plugged and unplugged at runtime,
//! which makes this the backend of choice for tests and demos.

use super::{
    Backend, Capabilities, ChangeNotifier, Delivery, Inbox, OpenOptions, OpenPortId, RawData,
    RawPacket, RawPayload, ReceiveCallback, WatchGuard, Wire,
};
use crate::clock;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;
use unimidi_core::{Api, Direction, Error, PortHandle, PortInfo, PortKey, Protocol, Result, TransportType};

struct LoopPort {
    info: PortInfo,
    input: Option<OpenPortId>,
    output: Option<OpenPortId>,
    /// Set for virtual ports: the side owned by the creating connection.
    virtual_side: Option<(Direction, OpenPortId)>,
}

impl LoopPort {
    fn slot(&mut self, direction: Direction) -> &mut Option<OpenPortId> {
        match direction {
            Direction::Input => &mut self.input,
            Direction::Output => &mut self.output,
        }
    }
}

struct Connection {
    key: u64,
    direction: Direction,
    wire: Wire,
    delivery: Mutex<Delivery>,
    stale: AtomicBool,
}

struct Inner {
    caps: Capabilities,
    push_delivery: bool,
    record: bool,
    ports: RwLock<BTreeMap<u64, LoopPort>>,
    connections: DashMap<OpenPortId, Connection>,
    watchers: Mutex<Vec<(u64, ChangeNotifier)>>,
    sent: Mutex<Vec<(u64, RawPayload)>>,
    next_port: AtomicU64,
    next_connection: AtomicU64,
    next_watch: AtomicU64,
    failing: AtomicBool,
}

impl Inner {
    fn notify(&self) {
        let watchers: Vec<ChangeNotifier> =
            self.watchers.lock().iter().map(|(_, n)| Arc::clone(n)).collect();
        for notify in watchers {
            notify();
        }
    }

    fn check_failing(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::BackendIo("loopback backend failure".to_string()));
        }
        Ok(())
    }

    /// Marks connections on `port` stale and tells the input side.
    fn detach(&self, port: &LoopPort) {
        for id in [port.input, port.output].into_iter().flatten() {
            if let Some(conn) = self.connections.get(&id) {
                conn.stale.store(true, Ordering::SeqCst);
                if conn.direction == Direction::Input {
                    conn.delivery.lock().deliver(Err(Error::PortUnavailable(
                        port.info.display_name.clone(),
                    )));
                }
            }
        }
    }

    fn remove_port(&self, key: u64) -> bool {
        let removed = self.ports.write().remove(&key);
        match removed {
            Some(port) => {
                debug!("Loopback port {} removed: {}", key, port.info.display_name);
                self.detach(&port);
                self.notify();
                true
            }
            None => false,
        }
    }
}

/// Builder for [`LoopbackBackend`].
pub struct LoopbackBuilder {
    caps: Capabilities,
    push_delivery: bool,
    record: bool,
}

impl Default for LoopbackBuilder {
    fn default() -> Self {
        Self {
            caps: Capabilities {
                midi1: true,
                ump: true,
                virtual_ports: true,
                timestamps: true,
                hotplug: true,
                sysex_chunk_limit: None,
            },
            push_delivery: true,
            record: false,
        }
    }
}

impl LoopbackBuilder {
    pub fn ump(mut self, enabled: bool) -> Self {
        self.caps.ump = enabled;
        self
    }

    pub fn hotplug(mut self, enabled: bool) -> Self {
        self.caps.hotplug = enabled;
        self
    }

    /// Sends of more bytes than `limit` fail, as on size-limited transports.
    pub fn sysex_chunk_limit(mut self, limit: usize) -> Self {
        self.caps.sysex_chunk_limit = Some(limit);
        self
    }

    /// When off, inputs can only be polled.
    pub fn push_delivery(mut self, enabled: bool) -> Self {
        self.push_delivery = enabled;
        self
    }

    /// Keep a log of every send, read back with [`LoopbackBackend::take_sent`].
    pub fn record_sends(mut self, enabled: bool) -> Self {
        self.record = enabled;
        self
    }

    pub fn build(self) -> LoopbackBackend {
        LoopbackBackend {
            inner: Arc::new(Inner {
                caps: self.caps,
                push_delivery: self.push_delivery,
                record: self.record,
                ports: RwLock::new(BTreeMap::new()),
                connections: DashMap::new(),
                watchers: Mutex::new(Vec::new()),
                sent: Mutex::new(Vec::new()),
                next_port: AtomicU64::new(0),
                next_connection: AtomicU64::new(1),
                next_watch: AtomicU64::new(0),
                failing: AtomicBool::new(false),
            }),
        }
    }
}

/// Cloning shares the same set of ports and connections.
#[derive(Clone)]
pub struct LoopbackBackend {
    inner: Arc<Inner>,
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBackend {
    pub fn new() -> Self {
        LoopbackBuilder::default().build()
    }

    pub fn builder() -> LoopbackBuilder {
        LoopbackBuilder::default()
    }

    /// Simulates plugging in a device. Returns its port key.
    pub fn add_port(&self, name: &str) -> u64 {
        let protocol = if self.inner.caps.ump {
            Protocol::Midi1AndUmp
        } else {
            Protocol::Midi1
        };
        self.add_port_with(
            PortInfo::named(name)
                .protocol(protocol)
                .transport(TransportType::Hardware)
                .client_name("loopback"),
        )
    }

    pub fn add_port_with(&self, info: PortInfo) -> u64 {
        let key = self.inner.next_port.fetch_add(1, Ordering::SeqCst);
        debug!("Loopback port {} added: {}", key, info.display_name);
        self.inner.ports.write().insert(
            key,
            LoopPort {
                info,
                input: None,
                output: None,
                virtual_side: None,
            },
        );
        self.inner.notify();
        key
    }

    /// Simulates unplugging a device. Open connections on it go stale.
    pub fn remove_port(&self, key: u64) -> bool {
        self.inner.remove_port(key)
    }

    pub fn port(&self, key: u64, direction: Direction) -> Option<PortHandle> {
        self.inner
            .ports
            .read()
            .get(&key)
            .map(|p| PortHandle::new(Api::Loopback, key, direction, p.info.clone()))
    }

    /// Makes every subsequent call fail with `BackendIo` until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    /// Feeds data into the input endpoint of `key`, as if a device sent it.
    /// Returns false when nothing has that input open.
    pub fn inject(&self, key: u64, data: RawData<'_>) -> bool {
        let input = self.inner.ports.read().get(&key).and_then(|p| p.input);
        match input.and_then(|id| self.inner.connections.get(&id)) {
            Some(conn) => {
                conn.delivery
                    .lock()
                    .deliver(Ok(RawPacket::from_raw(data, Some(clock::now_ns()))));
                true
            }
            None => false,
        }
    }

    /// Drains the send log (see [`LoopbackBuilder::record_sends`]).
    pub fn take_sent(&self) -> Vec<(u64, RawPayload)> {
        std::mem::take(&mut *self.inner.sent.lock())
    }

    pub fn open_connections(&self) -> usize {
        self.inner.connections.len()
    }

    fn key_of(port: &PortHandle) -> Result<u64> {
        match (port.api(), port.key()) {
            (Api::Loopback, PortKey::Index(k)) => Ok(*k),
            _ => Err(Error::PortUnavailable(port.to_string())),
        }
    }

    fn connect(&self, key: u64, options: &OpenOptions) -> Connection {
        let delivery = Delivery::Inbox(Inbox::new(options.buffer_size));
        Connection {
            key,
            direction: options.direction,
            wire: options.wire,
            delivery: Mutex::new(delivery),
            stale: AtomicBool::new(false),
        }
    }

    fn check_wire(&self, wire: Wire) -> Result<()> {
        let ok = match wire {
            Wire::Bytes => self.inner.caps.midi1,
            Wire::Words => self.inner.caps.ump,
        };
        if !ok {
            return Err(Error::Unsupported(format!(
                "loopback backend does not carry {:?}",
                wire
            )));
        }
        Ok(())
    }

    fn next_id(&self) -> OpenPortId {
        OpenPortId(self.inner.next_connection.fetch_add(1, Ordering::SeqCst))
    }
}

impl Backend for LoopbackBackend {
    fn api(&self) -> Api {
        Api::Loopback
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.caps
    }

    fn list_ports(&self, direction: Direction) -> Result<Vec<PortHandle>> {
        self.inner.check_failing()?;
        Ok(self
            .inner
            .ports
            .read()
            .iter()
            .filter(|(_, p)| !matches!(p.virtual_side, Some((side, _)) if side == direction))
            .map(|(key, p)| PortHandle::new(Api::Loopback, *key, direction, p.info.clone()))
            .collect())
    }

    fn open(&self, port: &PortHandle, options: &OpenOptions) -> Result<OpenPortId> {
        self.inner.check_failing()?;
        self.check_wire(options.wire)?;
        let key = Self::key_of(port)?;
        let id = self.next_id();

        let mut ports = self.inner.ports.write();
        let entry = ports
            .get_mut(&key)
            .ok_or_else(|| Error::PortUnavailable(port.to_string()))?;
        if matches!(entry.virtual_side, Some((side, _)) if side == options.direction) {
            return Err(Error::PermissionDenied(format!(
                "{} is owned by the application that created it",
                port
            )));
        }
        let slot = entry.slot(options.direction);
        if slot.is_some() {
            return Err(Error::AlreadyOpen(port.to_string()));
        }
        *slot = Some(id);
        self.inner.connections.insert(id, self.connect(key, options));
        drop(ports);

        debug!("Loopback {:?} {} opened on port {}", options.direction, id, key);
        Ok(id)
    }

    fn open_virtual(&self, options: &OpenOptions) -> Result<OpenPortId> {
        self.inner.check_failing()?;
        self.check_wire(options.wire)?;
        let name = options
            .virtual_port_name
            .clone()
            .ok_or_else(|| Error::InvalidConfig("virtual port needs a name".to_string()))?;
        let protocol = if self.inner.caps.ump {
            Protocol::Midi1AndUmp
        } else {
            Protocol::Midi1
        };

        let id = self.next_id();
        let key = self.inner.next_port.fetch_add(1, Ordering::SeqCst);
        let mut port = LoopPort {
            info: PortInfo::named(name)
                .protocol(protocol)
                .transport(TransportType::Software)
                .client_name(options.client_name.clone()),
            input: None,
            output: None,
            virtual_side: Some((options.direction, id)),
        };
        *port.slot(options.direction) = Some(id);
        self.inner.connections.insert(id, self.connect(key, options));
        self.inner.ports.write().insert(key, port);
        self.inner.notify();
        Ok(id)
    }

    fn close(&self, id: OpenPortId) -> Result<()> {
        let Some((_, conn)) = self.inner.connections.remove(&id) else {
            return Ok(());
        };

        let owned_port = {
            let mut ports = self.inner.ports.write();
            match ports.get_mut(&conn.key) {
                Some(port) if matches!(port.virtual_side, Some((_, owner)) if owner == id) => {
                    Some(conn.key)
                }
                Some(port) => {
                    let slot = port.slot(conn.direction);
                    if *slot == Some(id) {
                        *slot = None;
                    }
                    None
                }
                None => None,
            }
        };
        if let Some(key) = owned_port {
            self.inner.remove_port(key);
        }

        debug!("Loopback {} closed", id);
        Ok(())
    }

    fn send(&self, id: OpenPortId, data: RawData<'_>) -> Result<()> {
        self.inner.check_failing()?;
        let (key, wire) = {
            let conn = self.inner.connections.get(&id).ok_or(Error::NotOpen)?;
            if conn.stale.load(Ordering::SeqCst) {
                return Err(Error::PortUnavailable(format!("loopback port {}", conn.key)));
            }
            if conn.direction != Direction::Output {
                return Err(Error::Unsupported("cannot send on an input".to_string()));
            }
            (conn.key, conn.wire)
        };

        match (wire, data) {
            (Wire::Bytes, RawData::Bytes(bytes)) => {
                if let Some(limit) = self.inner.caps.sysex_chunk_limit {
                    if bytes.len() > limit {
                        return Err(Error::BackendIo(format!(
                            "{} bytes exceed the {} byte transport limit",
                            bytes.len(),
                            limit
                        )));
                    }
                }
            }
            (Wire::Words, RawData::Words(_)) => {}
            _ => {
                return Err(Error::Unsupported(format!(
                    "connection {} expects {:?}",
                    id, wire
                )))
            }
        }

        let packet = RawPacket::from_raw(data, Some(clock::now_ns()));
        if self.inner.record {
            self.inner.sent.lock().push((key, packet.payload.clone()));
        }

        let input = self.inner.ports.read().get(&key).and_then(|p| p.input);
        if let Some(conn) = input.and_then(|in_id| self.inner.connections.get(&in_id)) {
            conn.delivery.lock().deliver(Ok(packet));
        }
        Ok(())
    }

    fn set_receive_callback(&self, id: OpenPortId, mut callback: ReceiveCallback) -> Result<()> {
        if !self.inner.push_delivery {
            return Err(Error::Unsupported(
                "loopback configured for polling only".to_string(),
            ));
        }
        let conn = self.inner.connections.get(&id).ok_or(Error::NotOpen)?;
        if conn.direction != Direction::Input {
            return Err(Error::Unsupported(
                "receive callback on an output".to_string(),
            ));
        }
        let mut delivery = conn.delivery.lock();
        if let Delivery::Inbox(inbox) = &mut *delivery {
            while let Some(item) = inbox.pop() {
                callback(item);
            }
        }
        *delivery = Delivery::Callback(callback);
        Ok(())
    }

    fn poll(&self, id: OpenPortId) -> Result<Option<RawPacket>> {
        let conn = self.inner.connections.get(&id).ok_or(Error::NotOpen)?;
        let next = conn.delivery.lock().poll()?;
        if next.is_none() && conn.stale.load(Ordering::SeqCst) {
            return Err(Error::PortUnavailable(format!("loopback port {}", conn.key)));
        }
        Ok(next)
    }

    fn watch(&self, notify: ChangeNotifier) -> Result<Option<WatchGuard>> {
        if !self.inner.caps.hotplug {
            return Ok(None);
        }
        let watch_id = self.inner.next_watch.fetch_add(1, Ordering::SeqCst);
        self.inner.watchers.lock().push((watch_id, notify));

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Ok(Some(WatchGuard::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.watchers.lock().retain(|(id, _)| *id != watch_id);
            }
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn opts(direction: Direction) -> OpenOptions {
        OpenOptions::new(direction, Wire::Bytes)
    }

    #[test]
    fn test_output_loops_back_to_input() {
        let backend = LoopbackBackend::new();
        let key = backend.add_port("Loop A");
        let input = backend
            .open(&backend.port(key, Direction::Input).unwrap(), &opts(Direction::Input))
            .unwrap();
        let output = backend
            .open(&backend.port(key, Direction::Output).unwrap(), &opts(Direction::Output))
            .unwrap();

        backend.send(output, RawData::Bytes(&[0x90, 0x40, 0x7F])).unwrap();
        let packet = backend.poll(input).unwrap().unwrap();
        assert_eq!(packet.payload, RawPayload::Bytes(smallvec::smallvec![0x90, 0x40, 0x7F]));
        assert!(packet.timestamp.is_some());
        assert!(backend.poll(input).unwrap().is_none());
    }

    #[test]
    fn test_exclusive_open() {
        let backend = LoopbackBackend::new();
        let key = backend.add_port("Loop A");
        let port = backend.port(key, Direction::Input).unwrap();
        let id = backend.open(&port, &opts(Direction::Input)).unwrap();
        assert!(matches!(
            backend.open(&port, &opts(Direction::Input)),
            Err(Error::AlreadyOpen(_))
        ));
        backend.close(id).unwrap();
        assert!(backend.open(&port, &opts(Direction::Input)).is_ok());
    }

    #[test]
    fn test_close_is_idempotent() {
        let backend = LoopbackBackend::new();
        let key = backend.add_port("Loop A");
        let id = backend
            .open(&backend.port(key, Direction::Output).unwrap(), &opts(Direction::Output))
            .unwrap();
        assert_eq!(backend.open_connections(), 1);
        backend.close(id).unwrap();
        backend.close(id).unwrap();
        assert_eq!(backend.open_connections(), 0);
        assert!(matches!(
            backend.send(id, RawData::Bytes(&[0xF8])),
            Err(Error::NotOpen)
        ));
    }

    #[test]
    fn test_unplug_makes_connections_stale() {
        let backend = LoopbackBackend::new();
        let key = backend.add_port("USB Keys");
        let input = backend
            .open(&backend.port(key, Direction::Input).unwrap(), &opts(Direction::Input))
            .unwrap();
        let output = backend
            .open(&backend.port(key, Direction::Output).unwrap(), &opts(Direction::Output))
            .unwrap();

        let stale_handle = backend.port(key, Direction::Input).unwrap();
        assert!(backend.remove_port(key));

        assert!(matches!(
            backend.send(output, RawData::Bytes(&[0xF8])),
            Err(Error::PortUnavailable(_))
        ));
        assert!(matches!(backend.poll(input), Err(Error::PortUnavailable(_))));
        assert!(matches!(backend.poll(input), Err(Error::PortUnavailable(_))));
        assert!(matches!(
            backend.open(&stale_handle, &opts(Direction::Input)),
            Err(Error::PortUnavailable(_))
        ));
    }

    #[test]
    fn test_chunk_limit_enforced() {
        let backend = LoopbackBackend::builder().sysex_chunk_limit(4).build();
        let key = backend.add_port("Slow");
        let out = backend
            .open(&backend.port(key, Direction::Output).unwrap(), &opts(Direction::Output))
            .unwrap();
        assert!(backend.send(out, RawData::Bytes(&[0xF0, 1, 2, 3])).is_ok());
        assert!(matches!(
            backend.send(out, RawData::Bytes(&[0xF0, 1, 2, 3, 0xF7])),
            Err(Error::BackendIo(_))
        ));
    }

    #[test]
    fn test_words_require_ump() {
        let backend = LoopbackBackend::builder().ump(false).build();
        let key = backend.add_port("Legacy");
        let port = backend.port(key, Direction::Input).unwrap();
        assert_eq!(port.protocol(), Protocol::Midi1);
        let err = backend
            .open(&port, &OpenOptions::new(Direction::Input, Wire::Words))
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[test]
    fn test_callback_receives_queued_then_live_data() {
        let backend = LoopbackBackend::new();
        let key = backend.add_port("Loop");
        let input = backend
            .open(&backend.port(key, Direction::Input).unwrap(), &opts(Direction::Input))
            .unwrap();
        assert!(backend.inject(key, RawData::Bytes(&[0xFA])));

        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        backend
            .set_receive_callback(
                input,
                Box::new(move |r: Result<RawPacket>| {
                    assert!(r.is_ok());
                    c.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        backend.inject(key, RawData::Bytes(&[0xFC]));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_virtual_port_visible_to_others_and_removed_on_close() {
        let backend = LoopbackBackend::new();
        let mut options = opts(Direction::Output);
        options.virtual_port_name = Some("My Virtual Out".to_string());
        let id = backend.open_virtual(&options).unwrap();

        let inputs = backend.list_ports(Direction::Input).unwrap();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].display_name(), "My Virtual Out");
        assert_eq!(inputs[0].transport(), TransportType::Software);
        assert!(backend.list_ports(Direction::Output).unwrap().is_empty());

        backend.close(id).unwrap();
        assert!(backend.list_ports(Direction::Input).unwrap().is_empty());
    }

    #[test]
    fn test_watchers_notified_until_guard_dropped() {
        let backend = LoopbackBackend::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let guard = backend
            .watch(Arc::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap()
            .unwrap();

        let key = backend.add_port("A");
        backend.remove_port(key);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        drop(guard);
        backend.add_port("B");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failing_backend() {
        let backend = LoopbackBackend::new();
        backend.set_failing(true);
        assert!(matches!(
            backend.list_ports(Direction::Input),
            Err(Error::BackendIo(_))
        ));
        backend.set_failing(false);
        assert!(backend.list_ports(Direction::Input).unwrap().is_empty());
    }
}
