//! Observer, input and output configuration.
//!
//! Each config has a builder whose `build()` validates; a built config is
//! moved into the engine that uses it and never changes afterwards.

use crate::codec::{IgnoreFilter, MalformedPolicy, UmpTarget};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::port::{PortHandle, TransportType};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub type MessageCallback = Arc<dyn Fn(Message) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(Error) + Send + Sync>;
pub type PortCallback = Arc<dyn Fn(&PortHandle) + Send + Sync>;
/// Called between SysEx chunks with the configured interval and the bytes
/// written so far. Returning `false` aborts the rest of the message.
pub type ChunkWait = Arc<dyn Fn(Duration, usize) -> bool + Send + Sync>;

pub const DEFAULT_CLIENT_NAME: &str = "unimidi";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimestampMode {
    None,
    /// Nanoseconds since the previous message; the first message reports 0.
    #[default]
    Delta,
    /// Nanoseconds since the engine epoch.
    Absolute,
}

/// Wire format seen by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MidiProtocol {
    #[default]
    Midi1,
    /// UMP words.
    Midi2,
}

fn check_group(group: u8) -> Result<()> {
    if group > 15 {
        return Err(Error::InvalidConfig(format!(
            "group {} out of range (0-15)",
            group
        )));
    }
    Ok(())
}

fn check_port_name(name: &Option<String>) -> Result<()> {
    if matches!(name, Some(n) if n.trim().is_empty()) {
        return Err(Error::InvalidConfig(
            "virtual_port_name must not be empty".to_string(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct InputConfig {
    /// Present: callback mode. Absent: poll mode.
    pub on_message: Option<MessageCallback>,
    /// Receive-path errors. Called from the dispatch thread in callback
    /// mode and from the decoding context in poll mode, where it must not
    /// call back into the input. Absent in poll mode: errors queue for
    /// `poll_error`.
    pub on_error: Option<ErrorCallback>,
    /// Queue capacity in messages.
    pub buffer_size: usize,
    pub timestamp_mode: TimestampMode,
    pub protocol: MidiProtocol,
    pub virtual_port_name: Option<String>,
    pub ignore: IgnoreFilter,
    /// Only deliver UMP packets of this group.
    pub group: Option<u8>,
    /// Deliver MIDI 1.0-in-UMP packets as MIDI 2.0 channel voice.
    pub upgrade_midi1_to_midi2: bool,
    pub malformed_policy: MalformedPolicy,
    pub client_name: String,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            on_message: None,
            on_error: None,
            buffer_size: 1024,
            timestamp_mode: TimestampMode::default(),
            protocol: MidiProtocol::default(),
            virtual_port_name: None,
            ignore: IgnoreFilter::default(),
            group: None,
            upgrade_midi1_to_midi2: false,
            malformed_policy: MalformedPolicy::default(),
            client_name: DEFAULT_CLIENT_NAME.to_string(),
        }
    }
}

impl fmt::Debug for InputConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputConfig")
            .field("callback_mode", &self.on_message.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("buffer_size", &self.buffer_size)
            .field("timestamp_mode", &self.timestamp_mode)
            .field("protocol", &self.protocol)
            .field("virtual_port_name", &self.virtual_port_name)
            .field("ignore", &self.ignore)
            .field("group", &self.group)
            .field("upgrade_midi1_to_midi2", &self.upgrade_midi1_to_midi2)
            .field("malformed_policy", &self.malformed_policy)
            .field("client_name", &self.client_name)
            .finish()
    }
}

impl InputConfig {
    pub fn builder() -> InputConfigBuilder {
        InputConfigBuilder::default()
    }

    pub fn is_callback_mode(&self) -> bool {
        self.on_message.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(Error::InvalidConfig(
                "buffer_size must be at least 1".to_string(),
            ));
        }
        if let Some(group) = self.group {
            check_group(group)?;
        }
        check_port_name(&self.virtual_port_name)
    }
}

#[derive(Default)]
pub struct InputConfigBuilder {
    config: InputConfig,
}

impl InputConfigBuilder {
    pub fn on_message(mut self, f: impl Fn(Message) + Send + Sync + 'static) -> Self {
        self.config.on_message = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(Error) + Send + Sync + 'static) -> Self {
        self.config.on_error = Some(Arc::new(f));
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    pub fn timestamp_mode(mut self, mode: TimestampMode) -> Self {
        self.config.timestamp_mode = mode;
        self
    }

    pub fn protocol(mut self, protocol: MidiProtocol) -> Self {
        self.config.protocol = protocol;
        self
    }

    pub fn virtual_port(mut self, name: impl Into<String>) -> Self {
        self.config.virtual_port_name = Some(name.into());
        self
    }

    pub fn ignore(mut self, filter: IgnoreFilter) -> Self {
        self.config.ignore = filter;
        self
    }

    pub fn group(mut self, group: u8) -> Self {
        self.config.group = Some(group);
        self
    }

    pub fn upgrade_midi1_to_midi2(mut self, upgrade: bool) -> Self {
        self.config.upgrade_midi1_to_midi2 = upgrade;
        self
    }

    pub fn malformed_policy(mut self, policy: MalformedPolicy) -> Self {
        self.config.malformed_policy = policy;
        self
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.config.client_name = name.into();
        self
    }

    pub fn build(self) -> Result<InputConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// SysEx chunking for slow or size-limited transports.
#[derive(Clone)]
pub struct ChunkingConfig {
    pub size: usize,
    pub interval: Duration,
    pub wait: Option<ChunkWait>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            size: 4096,
            interval: Duration::from_millis(1),
            wait: None,
        }
    }
}

impl fmt::Debug for ChunkingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkingConfig")
            .field("size", &self.size)
            .field("interval", &self.interval)
            .field("wait", &self.wait.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub protocol: MidiProtocol,
    pub virtual_port_name: Option<String>,
    /// Omit repeated channel status bytes on the wire.
    pub running_status: bool,
    /// Group stamped on packets when MIDI 1.0 is sent to a UMP port.
    pub group: u8,
    pub ump_target: UmpTarget,
    /// Overrides the backend's chunk limit when smaller.
    pub chunking: Option<ChunkingConfig>,
    pub client_name: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            protocol: MidiProtocol::default(),
            virtual_port_name: None,
            running_status: false,
            group: 0,
            ump_target: UmpTarget::default(),
            chunking: None,
            client_name: DEFAULT_CLIENT_NAME.to_string(),
        }
    }
}

impl OutputConfig {
    pub fn builder() -> OutputConfigBuilder {
        OutputConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        check_group(self.group)?;
        if let Some(chunking) = &self.chunking {
            if chunking.size == 0 {
                return Err(Error::InvalidConfig(
                    "chunking size must be at least 1".to_string(),
                ));
            }
        }
        check_port_name(&self.virtual_port_name)
    }
}

#[derive(Default)]
pub struct OutputConfigBuilder {
    config: OutputConfig,
}

impl OutputConfigBuilder {
    pub fn protocol(mut self, protocol: MidiProtocol) -> Self {
        self.config.protocol = protocol;
        self
    }

    pub fn virtual_port(mut self, name: impl Into<String>) -> Self {
        self.config.virtual_port_name = Some(name.into());
        self
    }

    pub fn running_status(mut self, enabled: bool) -> Self {
        self.config.running_status = enabled;
        self
    }

    pub fn group(mut self, group: u8) -> Self {
        self.config.group = group;
        self
    }

    pub fn ump_target(mut self, target: UmpTarget) -> Self {
        self.config.ump_target = target;
        self
    }

    pub fn chunking(mut self, chunking: ChunkingConfig) -> Self {
        self.config.chunking = Some(chunking);
        self
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.config.client_name = name.into();
        self
    }

    pub fn build(self) -> Result<OutputConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ObserverConfig {
    pub on_input_added: Option<PortCallback>,
    pub on_input_removed: Option<PortCallback>,
    pub on_output_added: Option<PortCallback>,
    pub on_output_removed: Option<PortCallback>,
    pub track_hardware: bool,
    pub track_virtual: bool,
    pub track_network: bool,
    /// Report the ports present at `start()` as Added events.
    pub notify_existing: bool,
    /// Re-enumeration interval for backends without hot-plug notification.
    pub poll_interval: Duration,
    pub client_name: String,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            on_input_added: None,
            on_input_removed: None,
            on_output_added: None,
            on_output_removed: None,
            track_hardware: true,
            track_virtual: true,
            track_network: true,
            notify_existing: true,
            poll_interval: Duration::from_millis(500),
            client_name: DEFAULT_CLIENT_NAME.to_string(),
        }
    }
}

impl fmt::Debug for ObserverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverConfig")
            .field("track_hardware", &self.track_hardware)
            .field("track_virtual", &self.track_virtual)
            .field("track_network", &self.track_network)
            .field("notify_existing", &self.notify_existing)
            .field("poll_interval", &self.poll_interval)
            .field("client_name", &self.client_name)
            .finish_non_exhaustive()
    }
}

impl ObserverConfig {
    pub fn builder() -> ObserverConfigBuilder {
        ObserverConfigBuilder::default()
    }

    /// Whether a port passes the transport filters. Ports of unknown
    /// transport are treated as hardware.
    pub fn tracks(&self, port: &PortHandle) -> bool {
        match port.transport() {
            TransportType::Hardware | TransportType::Unknown => self.track_hardware,
            TransportType::Software => self.track_virtual,
            TransportType::Network => self.track_network,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "poll_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct ObserverConfigBuilder {
    config: ObserverConfig,
}

impl ObserverConfigBuilder {
    pub fn on_input_added(mut self, f: impl Fn(&PortHandle) + Send + Sync + 'static) -> Self {
        self.config.on_input_added = Some(Arc::new(f));
        self
    }

    pub fn on_input_removed(mut self, f: impl Fn(&PortHandle) + Send + Sync + 'static) -> Self {
        self.config.on_input_removed = Some(Arc::new(f));
        self
    }

    pub fn on_output_added(mut self, f: impl Fn(&PortHandle) + Send + Sync + 'static) -> Self {
        self.config.on_output_added = Some(Arc::new(f));
        self
    }

    pub fn on_output_removed(mut self, f: impl Fn(&PortHandle) + Send + Sync + 'static) -> Self {
        self.config.on_output_removed = Some(Arc::new(f));
        self
    }

    pub fn track_hardware(mut self, track: bool) -> Self {
        self.config.track_hardware = track;
        self
    }

    pub fn track_virtual(mut self, track: bool) -> Self {
        self.config.track_virtual = track;
        self
    }

    pub fn track_network(mut self, track: bool) -> Self {
        self.config.track_network = track;
        self
    }

    pub fn track_any(self) -> Self {
        self.track_hardware(true)
            .track_virtual(true)
            .track_network(true)
    }

    pub fn notify_existing(mut self, notify: bool) -> Self {
        self.config.notify_existing = notify;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.config.client_name = name.into();
        self
    }

    pub fn build(self) -> Result<ObserverConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
