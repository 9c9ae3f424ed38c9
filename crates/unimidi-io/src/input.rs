//! Input engine.
//!
//! A [`MidiInput`] owns one open input connection. Raw data from the
//! backend runs through the codec (running status, SysEx reassembly, UMP
//! packetisation, protocol translation) and ends up either
//!
//! - in the caller's `on_message` callback (callback mode), invoked from a
//!   dispatch thread so a slow callback never stalls the native subsystem, or
//! - in a bounded queue drained with [`MidiInput::poll`] (poll mode).
//!
//! Both paths are bounded. When full, callback mode drops the newest item
//! and poll mode evicts the oldest; either way [`MidiInput::dropped`]
//! counts the loss.

use crate::backend::{Backend, OpenOptions, OpenPortId, RawPacket, RawPayload, Wire};
use crate::clock;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;
use tracing::{debug, warn};
use unimidi_core::codec::{
    upgrade_midi1_packet, LegacyDecoder, Midi1ToUmp, UmpDecoder, UmpToMidi1,
};
use unimidi_core::config::{ErrorCallback, MessageCallback};
use unimidi_core::{
    Api, Direction, Error, ErrorKind, IgnoreFilter, InputConfig, LegacyBytes, Message,
    MidiProtocol, Payload, PortHandle, Result, TimestampMode, UmpMessageType, UmpPacket,
    UmpTarget,
};

const ERROR_QUEUE_SIZE: usize = 64;
const DISPATCH_TIMEOUT: Duration = Duration::from_millis(100);
const PULL_INTERVAL: Duration = Duration::from_millis(1);

/// State shared between the engine, the backend's delivery context and
/// the dispatch thread.
struct InputShared {
    closed: AtomicBool,
    dropped: AtomicU64,
    dropped_errors: AtomicU64,
    queue: Mutex<HeapRb<Message>>,
    errors: Mutex<HeapRb<Error>>,
    /// Set once the port disappears; reported by `poll` after the queue drains.
    gone: Mutex<Option<Error>>,
}

impl InputShared {
    fn new(capacity: usize) -> Self {
        Self {
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            dropped_errors: AtomicU64::new(0),
            queue: Mutex::new(HeapRb::new(capacity.max(1))),
            errors: Mutex::new(HeapRb::new(ERROR_QUEUE_SIZE)),
            gone: Mutex::new(None),
        }
    }

    fn count_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn count_error_drop(&self) {
        self.dropped_errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Where decoded messages go.
///
/// In poll mode errors go straight to `on_error` when one is set, from
/// whichever thread decoded the data.
#[derive(Clone)]
enum Sink {
    Channel(Sender<Result<Message>>, Arc<InputShared>),
    Queue(Arc<InputShared>, Option<ErrorCallback>),
}

impl Sink {
    fn shared(&self) -> &InputShared {
        match self {
            Sink::Channel(_, shared) | Sink::Queue(shared, _) => shared,
        }
    }

    fn push(&self, item: Result<Message>) {
        let shared = self.shared();
        if shared.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = &item {
            if e.kind() == ErrorKind::PortUnavailable {
                shared.gone.lock().get_or_insert_with(|| e.clone());
            }
        }

        match self {
            Sink::Channel(tx, shared) => match tx.try_send(item) {
                Ok(()) => {}
                Err(TrySendError::Full(Ok(_))) => {
                    shared.count_drop();
                    debug!("MIDI input queue full, dropped newest message");
                }
                Err(TrySendError::Full(Err(e))) => {
                    shared.count_error_drop();
                    warn!("MIDI input queue full, dropped error: {}", e);
                }
                Err(TrySendError::Disconnected(_)) => {}
            },
            Sink::Queue(shared, on_error) => match item {
                Ok(message) => {
                    if shared.queue.lock().push_overwrite(message).is_some() {
                        shared.count_drop();
                        debug!("MIDI input queue full, evicted oldest message");
                    }
                }
                Err(e) => match on_error {
                    Some(callback) => callback(e),
                    None => {
                        warn!("MIDI input error: {}", e);
                        if let Some(evicted) = shared.errors.lock().push_overwrite(e) {
                            shared.count_error_drop();
                            warn!("MIDI input error queue full, evicted: {}", evicted);
                        }
                    }
                },
            },
        }
    }
}

/// Raw backend data to caller-facing messages.
struct Pipeline {
    legacy: LegacyDecoder,
    ump: UmpDecoder,
    to_ump: Midi1ToUmp,
    to_midi1: UmpToMidi1,
    protocol: MidiProtocol,
    ignore: IgnoreFilter,
    group: Option<u8>,
    upgrade: bool,
    timestamp_mode: TimestampMode,
    last_stamp: Option<u64>,
    source: Option<PortHandle>,
}

impl Pipeline {
    fn new(config: &InputConfig, source: Option<PortHandle>) -> Self {
        let target = if config.upgrade_midi1_to_midi2 {
            UmpTarget::Midi2
        } else {
            UmpTarget::Midi1
        };
        Self {
            legacy: LegacyDecoder::new()
                .with_filter(config.ignore)
                .with_policy(config.malformed_policy),
            ump: UmpDecoder::new(),
            to_ump: Midi1ToUmp::new(target, config.group.unwrap_or(0)),
            to_midi1: UmpToMidi1::new(),
            protocol: config.protocol,
            ignore: config.ignore,
            group: config.group,
            upgrade: config.upgrade_midi1_to_midi2,
            timestamp_mode: config.timestamp_mode,
            last_stamp: None,
            source,
        }
    }

    fn stamp(&mut self, backend_stamp: Option<u64>) -> Option<u64> {
        match self.timestamp_mode {
            TimestampMode::None => None,
            TimestampMode::Absolute => Some(clock::now_ns()),
            TimestampMode::Delta => {
                // Backend clocks have their own epochs; only differences are used.
                let now = backend_stamp.unwrap_or_else(clock::now_ns);
                let delta = self.last_stamp.map_or(0, |last| now.saturating_sub(last));
                self.last_stamp = Some(now);
                Some(delta)
            }
        }
    }

    fn finish(&mut self, payload: Payload, backend_stamp: Option<u64>) -> Message {
        Message::from_payload(payload)
            .with_timestamp(self.stamp(backend_stamp))
            .with_source(self.source.clone())
    }

    fn process(&mut self, item: Result<RawPacket>, sink: &Sink) {
        let packet = match item {
            Ok(packet) => packet,
            Err(e) => return sink.push(Err(e)),
        };
        match &packet.payload {
            RawPayload::Bytes(bytes) => {
                let mut decoded: SmallVec<[Result<LegacyBytes>; 4]> = SmallVec::new();
                self.legacy.feed(bytes, |r| decoded.push(r));
                for result in decoded {
                    match result {
                        Ok(message) => self.legacy_message(message, packet.timestamp, sink),
                        Err(e) => sink.push(Err(e)),
                    }
                }
            }
            RawPayload::Words(words) => {
                let mut decoded: SmallVec<[Result<UmpPacket>; 4]> = SmallVec::new();
                self.ump.feed(words, |r| decoded.push(r));
                for result in decoded {
                    match result {
                        Ok(p) => self.ump_packet(p, packet.timestamp, sink),
                        Err(e) => sink.push(Err(e)),
                    }
                }
            }
        }
    }

    fn legacy_message(&mut self, bytes: LegacyBytes, stamp: Option<u64>, sink: &Sink) {
        match self.protocol {
            MidiProtocol::Midi1 => {
                let message = self.finish(Payload::Legacy(bytes), stamp);
                sink.push(Ok(message));
            }
            MidiProtocol::Midi2 => match self.to_ump.convert(&bytes) {
                Ok(packets) => {
                    for p in packets {
                        let message = self.finish(Payload::Ump(p), stamp);
                        sink.push(Ok(message));
                    }
                }
                Err(e) => sink.push(Err(e)),
            },
        }
    }

    fn ump_ignored(&self, p: &UmpPacket) -> bool {
        if let Some(group) = self.group {
            if p.message_type() != UmpMessageType::Utility && p.group() != group {
                return true;
            }
        }
        match p.message_type() {
            UmpMessageType::System => self.ignore.ignores(&[(p.words()[0] >> 16) as u8]),
            UmpMessageType::Data64 => self.ignore.sysex,
            _ => false,
        }
    }

    fn ump_packet(&mut self, p: UmpPacket, stamp: Option<u64>, sink: &Sink) {
        if self.ump_ignored(&p) {
            return;
        }
        match self.protocol {
            MidiProtocol::Midi2 => {
                let p = if self.upgrade {
                    upgrade_midi1_packet(p)
                } else {
                    p
                };
                let message = self.finish(Payload::Ump(p), stamp);
                sink.push(Ok(message));
            }
            MidiProtocol::Midi1 => {
                let mut converted: SmallVec<[LegacyBytes; 2]> = SmallVec::new();
                let result = self
                    .to_midi1
                    .convert(&p, |bytes| converted.push(LegacyBytes::from_slice(bytes)));
                for bytes in converted {
                    let message = self.finish(Payload::Legacy(bytes), stamp);
                    sink.push(Ok(message));
                }
                if let Err(e) = result {
                    sink.push(Err(e));
                }
            }
        }
    }
}

/// Backend connection polled by the engine instead of pushing data.
struct PullSource {
    backend: Arc<dyn Backend>,
    id: OpenPortId,
    pipeline: Arc<Mutex<Pipeline>>,
    sink: Sink,
}

impl PullSource {
    fn drain(&self) {
        if self.sink.shared().gone.lock().is_some() {
            return;
        }
        let mut pipeline = self.pipeline.lock();
        loop {
            match self.backend.poll(self.id) {
                Ok(Some(packet)) => pipeline.process(Ok(packet), &self.sink),
                Ok(None) => break,
                Err(e) => {
                    pipeline.process(Err(e), &self.sink);
                    break;
                }
            }
        }
    }
}

pub struct MidiInput {
    backend: Arc<dyn Backend>,
    id: OpenPortId,
    port: Option<PortHandle>,
    callback_mode: bool,
    shared: Arc<InputShared>,
    pull: Option<Arc<PullSource>>,
    dispatch: Option<(JoinHandle<()>, ThreadId)>,
    open: bool,
}

impl MidiInput {
    /// Opens `port` through the backend registered for its API.
    pub fn open(port: &PortHandle, config: InputConfig) -> Result<Self> {
        Self::open_with(crate::registry::resolve(port.api())?, port, config)
    }

    pub fn open_with(
        backend: Arc<dyn Backend>,
        port: &PortHandle,
        config: InputConfig,
    ) -> Result<Self> {
        if port.direction() != Direction::Input {
            return Err(Error::InvalidConfig(format!("{} is not an input", port)));
        }
        if port.api() != backend.api() {
            return Err(Error::PortUnavailable(format!(
                "{} belongs to {}, not {}",
                port,
                port.api(),
                backend.api()
            )));
        }
        Self::start(backend, Some(port.clone()), config)
    }

    /// Creates a virtual input named by `config.virtual_port_name`.
    pub fn open_virtual(api: Api, config: InputConfig) -> Result<Self> {
        Self::open_virtual_with(crate::registry::resolve(api)?, config)
    }

    pub fn open_virtual_with(backend: Arc<dyn Backend>, config: InputConfig) -> Result<Self> {
        if config.virtual_port_name.is_none() {
            return Err(Error::InvalidConfig(
                "virtual input needs virtual_port_name".to_string(),
            ));
        }
        Self::start(backend, None, config)
    }

    fn start(
        backend: Arc<dyn Backend>,
        port: Option<PortHandle>,
        config: InputConfig,
    ) -> Result<Self> {
        config.validate()?;
        let caps = backend.capabilities();
        let wire = Wire::select(&caps, config.protocol, port.as_ref().map(|p| p.protocol()))?;

        let mut options = OpenOptions::new(Direction::Input, wire);
        options.client_name = config.client_name.clone();
        options.virtual_port_name = config.virtual_port_name.clone();
        options.buffer_size = config.buffer_size;

        let id = match &port {
            Some(port) => backend.open(port, &options)?,
            None => backend.open_virtual(&options)?,
        };

        let shared = Arc::new(InputShared::new(config.buffer_size));
        let (sink, receiver) = if config.is_callback_mode() {
            let (tx, rx) = bounded(config.buffer_size);
            (Sink::Channel(tx, Arc::clone(&shared)), Some(rx))
        } else {
            (Sink::Queue(Arc::clone(&shared), config.on_error.clone()), None)
        };

        let pipeline = Arc::new(Mutex::new(Pipeline::new(&config, port.clone())));
        let push_pipeline = Arc::clone(&pipeline);
        let push_sink = sink.clone();
        let pull = match backend.set_receive_callback(
            id,
            Box::new(move |item| push_pipeline.lock().process(item, &push_sink)),
        ) {
            Ok(()) => None,
            Err(Error::Unsupported(_)) => {
                debug!("{} delivers by polling only", backend.api());
                Some(Arc::new(PullSource {
                    backend: Arc::clone(&backend),
                    id,
                    pipeline,
                    sink,
                }))
            }
            Err(e) => {
                let _ = backend.close(id);
                return Err(e);
            }
        };

        let dispatch = match receiver {
            Some(rx) => {
                let spawned = spawn_dispatch(
                    rx,
                    config.on_message.clone(),
                    config.on_error.clone(),
                    Arc::clone(&shared),
                    pull.clone(),
                );
                match spawned {
                    Ok(handle) => {
                        let thread_id = handle.thread().id();
                        Some((handle, thread_id))
                    }
                    Err(e) => {
                        let _ = backend.close(id);
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        debug!(
            "MIDI input {} opened on {} ({:?}, {} mode)",
            port.as_ref()
                .map(|p| p.display_name())
                .or(config.virtual_port_name.as_deref())
                .unwrap_or_default(),
            backend.api(),
            wire,
            if dispatch.is_some() { "callback" } else { "poll" }
        );

        Ok(Self {
            backend,
            id,
            port,
            callback_mode: config.is_callback_mode(),
            shared,
            pull,
            dispatch,
            open: true,
        })
    }

    pub fn api(&self) -> Api {
        self.backend.api()
    }

    /// The opened port; `None` for virtual inputs.
    pub fn port(&self) -> Option<&PortHandle> {
        self.port.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_callback_mode(&self) -> bool {
        self.callback_mode
    }

    /// Next queued message. Never blocks.
    ///
    /// Fails with `NotOpen` after close, `Unsupported` in callback mode,
    /// and with the backend's error once the port has disappeared and the
    /// queue is drained.
    pub fn poll(&self) -> Result<Option<Message>> {
        if !self.open {
            return Err(Error::NotOpen);
        }
        if self.callback_mode {
            return Err(Error::Unsupported(
                "input is in callback mode".to_string(),
            ));
        }
        if let Some(pull) = &self.pull {
            pull.drain();
        }
        if let Some(message) = self.shared.queue.lock().try_pop() {
            return Ok(Some(message));
        }
        match self.shared.gone.lock().clone() {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    /// Receive-path error queued in poll mode (malformed input, backend
    /// failures), oldest first. Only used when no `on_error` callback is
    /// configured; the queue keeps the latest 64 errors.
    pub fn poll_error(&self) -> Option<Error> {
        self.shared.errors.lock().try_pop()
    }

    /// Messages queued in poll mode.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().occupied_len()
    }

    /// Messages lost to a full queue since open.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Like [`dropped`](Self::dropped), resetting the counter.
    pub fn take_dropped(&self) -> u64 {
        self.shared.dropped.swap(0, Ordering::Relaxed)
    }

    /// Receive-path errors lost to a full error queue or dispatch channel.
    pub fn dropped_errors(&self) -> u64 {
        self.shared.dropped_errors.load(Ordering::Relaxed)
    }

    /// Closes the connection. Idempotent; after it returns no callback runs
    /// and the queue is empty.
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.shared.closed.store(true, Ordering::Release);

        let result = self.backend.close(self.id);
        if let Some((handle, id)) = self.dispatch.take() {
            if thread::current().id() != id {
                let _ = handle.join();
            }
        }
        self.pull = None;
        self.shared.queue.lock().clear();
        self.shared.errors.lock().clear();
        debug!("MIDI input {} closed on {}", self.id, self.backend.api());
        result
    }
}

impl Drop for MidiInput {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Error closing MIDI input: {}", e);
        }
    }
}

fn spawn_dispatch(
    receiver: Receiver<Result<Message>>,
    on_message: Option<MessageCallback>,
    on_error: Option<ErrorCallback>,
    shared: Arc<InputShared>,
    pull: Option<Arc<PullSource>>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("midi-input-dispatch".to_string())
        .spawn(move || {
            let timeout = if pull.is_some() {
                PULL_INTERVAL
            } else {
                DISPATCH_TIMEOUT
            };
            loop {
                if shared.closed.load(Ordering::Acquire) {
                    break;
                }
                match receiver.recv_timeout(timeout) {
                    Ok(_) if shared.closed.load(Ordering::Acquire) => break,
                    Ok(Ok(message)) => {
                        if let Some(callback) = &on_message {
                            callback(message);
                        }
                    }
                    Ok(Err(e)) => match &on_error {
                        Some(callback) => callback(e),
                        None => warn!("MIDI input error: {}", e),
                    },
                    Err(RecvTimeoutError::Timeout) => {
                        if let Some(pull) = &pull {
                            pull.drain();
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })
        .map_err(|e| Error::BackendIo(format!("failed to spawn dispatch thread: {}", e)))
}
