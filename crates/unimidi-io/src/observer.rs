//! Port observer: enumeration and hot-plug notification.
//!
//! An [`Observer`] keeps a snapshot of the ports its backend exposes and
//! reports differences as [`PortEvent`]s, both through the callbacks in
//! [`ObserverConfig`] and through a channel returned by
//! [`Observer::events`].
//!
//! Backends with native hot-plug support wake the observer thread through
//! [`Backend::watch`]; for the others the thread re-enumerates every
//! `poll_interval`.

use crate::backend::{Backend, WatchGuard};
use arc_swap::ArcSwap;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, warn};
use unimidi_core::{Api, Direction, Error, ObserverConfig, PortHandle, Result};

const EVENT_QUEUE_SIZE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    Added(PortHandle),
    Removed(PortHandle),
}

impl PortEvent {
    pub fn port(&self) -> &PortHandle {
        match self {
            PortEvent::Added(p) | PortEvent::Removed(p) => p,
        }
    }

    pub fn is_added(&self) -> bool {
        matches!(self, PortEvent::Added(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObserverState {
    Idle = 0,
    Watching = 1,
    Stopped = 2,
}

impl ObserverState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ObserverState::Idle,
            1 => ObserverState::Watching,
            _ => ObserverState::Stopped,
        }
    }
}

enum Signal {
    Refresh,
    Stop,
}

struct Shared {
    backend: Arc<dyn Backend>,
    config: ObserverConfig,
    state: AtomicU8,
    inputs: ArcSwap<Vec<PortHandle>>,
    outputs: ArcSwap<Vec<PortHandle>>,
    /// Held while diffing and emitting. Reentrant so callbacks may call
    /// back into the observer.
    emit_lock: ReentrantMutex<()>,
    events: Sender<PortEvent>,
}

impl Shared {
    fn state(&self) -> ObserverState {
        ObserverState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn snapshot(&self, direction: Direction) -> &ArcSwap<Vec<PortHandle>> {
        match direction {
            Direction::Input => &self.inputs,
            Direction::Output => &self.outputs,
        }
    }

    fn enumerate(&self, direction: Direction) -> Result<Vec<PortHandle>> {
        let mut seen = HashSet::new();
        Ok(self
            .backend
            .list_ports(direction)?
            .into_iter()
            .filter(|p| self.config.tracks(p))
            .filter(|p| seen.insert(p.key().clone()))
            .collect())
    }

    fn emit(&self, event: PortEvent) {
        // Checked under emit_lock, so nothing is emitted once stop() returns.
        if self.state() == ObserverState::Stopped {
            return;
        }
        let callback = match (&event, event.port().direction()) {
            (PortEvent::Added(_), Direction::Input) => &self.config.on_input_added,
            (PortEvent::Removed(_), Direction::Input) => &self.config.on_input_removed,
            (PortEvent::Added(_), Direction::Output) => &self.config.on_output_added,
            (PortEvent::Removed(_), Direction::Output) => &self.config.on_output_removed,
        };
        if let Some(callback) = callback {
            callback(event.port());
        }
        if self.events.try_send(event).is_err() {
            debug!("Port event queue full, event dropped");
        }
    }

    /// Re-enumerates both directions and emits the differences.
    fn refresh(&self) -> Result<Vec<PortEvent>> {
        let _guard = self.emit_lock.lock();
        if self.state() == ObserverState::Stopped {
            return Ok(Vec::new());
        }

        let inputs = self.enumerate(Direction::Input)?;
        let outputs = self.enumerate(Direction::Output)?;

        let mut events = Vec::new();
        for (direction, current) in [(Direction::Input, inputs), (Direction::Output, outputs)] {
            let previous = self.snapshot(direction).load_full();
            events.extend(
                previous
                    .iter()
                    .filter(|p| !current.contains(p))
                    .cloned()
                    .map(PortEvent::Removed),
            );
            events.extend(
                current
                    .iter()
                    .filter(|p| !previous.contains(p))
                    .cloned()
                    .map(PortEvent::Added),
            );
            self.snapshot(direction).store(Arc::new(current));
        }

        for event in &events {
            debug!("{:?}", event);
            self.emit(event.clone());
        }
        Ok(events)
    }
}

pub struct Observer {
    shared: Arc<Shared>,
    events: Receiver<PortEvent>,
    signal: Mutex<Option<Sender<Signal>>>,
    watch: Mutex<Option<WatchGuard>>,
    thread: Mutex<Option<(JoinHandle<()>, ThreadId)>>,
}

impl Observer {
    /// Observer on the backend registered for `api` in the global registry.
    pub fn new(api: Api, config: ObserverConfig) -> Result<Self> {
        Self::with_backend(crate::registry::resolve(api)?, config)
    }

    pub fn with_backend(backend: Arc<dyn Backend>, config: ObserverConfig) -> Result<Self> {
        config.validate()?;
        let (tx, rx) = bounded(EVENT_QUEUE_SIZE);
        Ok(Self {
            shared: Arc::new(Shared {
                backend,
                config,
                state: AtomicU8::new(ObserverState::Idle as u8),
                inputs: ArcSwap::from_pointee(Vec::new()),
                outputs: ArcSwap::from_pointee(Vec::new()),
                emit_lock: ReentrantMutex::new(()),
                events: tx,
            }),
            events: rx,
            signal: Mutex::new(None),
            watch: Mutex::new(None),
            thread: Mutex::new(None),
        })
    }

    pub fn api(&self) -> Api {
        self.shared.backend.api()
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.shared.backend
    }

    pub fn state(&self) -> ObserverState {
        self.shared.state()
    }

    /// Live enumeration, filtered by the configured transports.
    /// An empty system yields an empty list.
    pub fn enumerate(&self, direction: Direction) -> Result<Vec<PortHandle>> {
        self.shared.enumerate(direction)
    }

    /// Ports as of the last refresh.
    pub fn snapshot(&self, direction: Direction) -> Arc<Vec<PortHandle>> {
        self.shared.snapshot(direction).load_full()
    }

    /// Every emitted event, in order. Events are dropped when nobody drains
    /// the channel and it fills up.
    pub fn events(&self) -> Receiver<PortEvent> {
        self.events.clone()
    }

    /// Re-enumerates now and emits whatever changed. Returns the emitted
    /// events; after `stop()` nothing is emitted.
    pub fn refresh(&self) -> Result<Vec<PortEvent>> {
        self.shared.refresh()
    }

    /// Takes the initial snapshot and starts watching. Calling it again
    /// while watching is a no-op; a stopped observer cannot be restarted.
    pub fn start(&self) -> Result<()> {
        match self.shared.state.compare_exchange(
            ObserverState::Idle as u8,
            ObserverState::Watching as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(s) if ObserverState::from_u8(s) == ObserverState::Watching => return Ok(()),
            Err(_) => {
                return Err(Error::Unsupported(
                    "a stopped observer cannot be restarted".to_string(),
                ))
            }
        }

        let (signal_tx, signal_rx) = bounded::<Signal>(16);

        // Subscribe before the first enumeration so no change slips between them.
        let notifier_tx = signal_tx.clone();
        let watch = self.shared.backend.watch(Arc::new(move || {
            let _ = notifier_tx.try_send(Signal::Refresh);
        }));
        let watch = match watch {
            Ok(watch) => watch,
            Err(e) => {
                self.shared
                    .state
                    .store(ObserverState::Idle as u8, Ordering::SeqCst);
                return Err(e);
            }
        };
        let hotplug = watch.is_some();

        if let Err(e) = self.initial_snapshot() {
            self.shared
                .state
                .store(ObserverState::Idle as u8, Ordering::SeqCst);
            return Err(e);
        }

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("midi-observer".to_string())
            .spawn(move || observer_thread(shared, signal_rx, hotplug));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.shared
                    .state
                    .store(ObserverState::Idle as u8, Ordering::SeqCst);
                return Err(Error::BackendIo(format!(
                    "failed to spawn observer thread: {}",
                    e
                )));
            }
        };

        let thread_id = handle.thread().id();
        *self.thread.lock() = Some((handle, thread_id));
        *self.watch.lock() = watch;
        *self.signal.lock() = Some(signal_tx);
        debug!(
            "Observer started on {} ({})",
            self.api(),
            if hotplug { "hot-plug" } else { "polling" }
        );
        Ok(())
    }

    fn initial_snapshot(&self) -> Result<()> {
        let _guard = self.shared.emit_lock.lock();
        let inputs = self.shared.enumerate(Direction::Input)?;
        let outputs = self.shared.enumerate(Direction::Output)?;
        self.shared.inputs.store(Arc::new(inputs));
        self.shared.outputs.store(Arc::new(outputs));

        if self.shared.config.notify_existing {
            for direction in [Direction::Input, Direction::Output] {
                for port in self.shared.snapshot(direction).load().iter() {
                    self.shared.emit(PortEvent::Added(port.clone()));
                }
            }
        }
        Ok(())
    }

    /// Stops watching. Idempotent; no event is delivered after it returns.
    /// May be called from inside an observer callback, on any thread; the
    /// observer thread is then detached instead of joined.
    pub fn stop(&self) {
        let previous = self
            .shared
            .state
            .swap(ObserverState::Stopped as u8, Ordering::SeqCst);
        if ObserverState::from_u8(previous) == ObserverState::Stopped {
            return;
        }

        // Wait out any emission in progress.
        drop(self.shared.emit_lock.lock());
        // Inside a callback the observer thread may be blocked on the lock
        // this thread holds; it exits by itself once the lock is released.
        let in_emission = self.shared.emit_lock.is_owned_by_current_thread();

        drop(self.watch.lock().take());
        if let Some(tx) = self.signal.lock().take() {
            let _ = tx.try_send(Signal::Stop);
        }
        if let Some((handle, id)) = self.thread.lock().take() {
            if thread::current().id() != id && !in_emission {
                let _ = handle.join();
            }
        }
        debug!("Observer stopped on {}", self.api());
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn observer_thread(shared: Arc<Shared>, signals: Receiver<Signal>, hotplug: bool) {
    let interval = shared.config.poll_interval;
    loop {
        if shared.state() == ObserverState::Stopped {
            break;
        }
        let refresh = match signals.recv_timeout(interval) {
            Ok(Signal::Refresh) => {
                // Coalesce bursts of notifications.
                while let Ok(Signal::Refresh) = signals.try_recv() {}
                true
            }
            Ok(Signal::Stop) => break,
            Err(RecvTimeoutError::Timeout) => !hotplug,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if refresh {
            if let Err(e) = shared.refresh() {
                warn!("Port enumeration failed on {}: {}", shared.backend.api(), e);
            }
        }
    }
}
