//! # unimidi - Realtime MIDI I/O
//!
//! One API over the platform MIDI subsystems, for MIDI 1.0 byte streams
//! and MIDI 2.0 Universal MIDI Packets alike.
//!
//! ## Architecture
//!
//! unimidi is an umbrella crate that coordinates:
//! - **unimidi-core** - Port identity, messages, MIDI 1.0 / UMP codecs, configuration
//! - **unimidi-io** - Backend contract, backend registry, port observer, input and output engines
//!
//! ## Quick Start
//!
//! ```ignore
//! use unimidi::prelude::*;
//!
//! let observer = Observer::new(default_api(), ObserverConfig::default())?;
//! let Some(port) = observer.enumerate(Direction::Output)?.into_iter().next() else {
//!     return Ok(()); // no output available
//! };
//!
//! let mut output = MidiOutput::open(&port, OutputConfig::default())?;
//! output.send(&Message::note_on(0, 60, 100))?;
//! ```
//!
//! ## Feature Flags
//!
//! - `default` - Native MIDI backend
//! - `midi-io` - Native MIDI 1.0 backend through midir

/// Re-export of unimidi-core for direct access
pub use unimidi_core as core;
/// Re-export of unimidi-io for direct access
pub use unimidi_io as io;

// Data model
pub use unimidi_core::{
    // Ports
    find_closest_port,
    Api,
    // Configuration
    ChunkingConfig,
    Direction,
    // Error
    Error,
    ErrorKind,
    IgnoreFilter,
    InputConfig,
    LegacyBytes,
    MalformedPolicy,
    // Messages
    Message,
    MidiProtocol,
    ObserverConfig,
    OutputConfig,
    Payload,
    PortHandle,
    PortInfo,
    PortKey,
    Protocol,
    Result,
    TimestampMode,
    TransportType,
    UmpPacket,
    UmpTarget,
};

// Codecs
pub use unimidi_core::codec;

// I/O
pub use unimidi_io::{
    registry, Backend, BackendRegistry, Capabilities, DummyBackend, LoopbackBackend, MidiInput,
    MidiOutput, Observer, ObserverState, PortEvent, RegistryBuilder, Wire,
};

#[cfg(feature = "midi-io")]
pub use unimidi_io::MidirBackend;

/// Items needed for everyday use.
pub mod prelude {
    pub use unimidi_io::prelude::*;
}
