//! MIDI I/O for unimidi.
//!
//! Backend contract, backend registry and API selection, port observer,
//! input and output engines.
//!
//! Feature gates: `midi-io` (native MIDI 1.0 backend through midir).

pub mod backend;
pub use backend::{
    Backend, Capabilities, DummyBackend, LoopbackBackend, LoopbackBuilder, OpenOptions,
    OpenPortId, RawData, RawPacket, RawPayload, Wire,
};
#[cfg(feature = "midi-io")]
pub use backend::MidirBackend;

pub mod clock;

pub mod registry;
pub use registry::{BackendFactory, BackendRegistry, RegistryBuilder};

mod observer;
pub use observer::{Observer, ObserverState, PortEvent};

mod input;
pub use input::MidiInput;

mod output;
pub use output::MidiOutput;

pub use unimidi_core::{
    Api, Direction, Error, ErrorKind, InputConfig, Message, ObserverConfig, OutputConfig,
    PortHandle, Result,
};

/// Items needed for everyday use.
pub mod prelude {
    pub use crate::registry::{available_apis, default_api};
    pub use crate::{MidiInput, MidiOutput, Observer, PortEvent};
    pub use unimidi_core::{
        Api, Direction, Error, InputConfig, Message, MidiProtocol, ObserverConfig, OutputConfig,
        PortHandle, Result, TimestampMode,
    };
}
