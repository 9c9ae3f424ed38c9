//! Data model and wire codecs for unimidi.
//!
//! Port identity, the message model, MIDI 1.0 / UMP codecs and the
//! configuration records shared by every backend. No I/O happens here;
//! see `unimidi-io` for backends and engines.

pub mod error;
pub use error::{Error, ErrorKind, Result};

pub mod api;
pub use api::Api;

pub mod port;
pub use port::{
    find_closest_port, Direction, PortHandle, PortInfo, PortKey, Protocol, TransportType,
};

pub mod message;
pub use message::{LegacyBytes, Message, Payload, UmpPacket};

pub mod codec;
pub use codec::{IgnoreFilter, MalformedPolicy, UmpMessageType, UmpTarget};

pub mod config;
pub use config::{
    ChunkingConfig, InputConfig, InputConfigBuilder, MidiProtocol, ObserverConfig,
    ObserverConfigBuilder, OutputConfig, OutputConfigBuilder, TimestampMode,
};
