//! Wire codecs.
//!
//! - [`legacy`]: MIDI 1.0 byte streams (running status, SysEx accumulation, chunking)
//! - [`ump`]: Universal MIDI Packet word streams
//! - [`translate`]: MIDI 1.0 <-> UMP translation and value scaling

pub mod legacy;
pub mod translate;
pub mod ump;

pub use legacy::{chunk_sysex, IgnoreFilter, LegacyDecoder, LegacyEncoder, MalformedPolicy};
pub use translate::{upgrade_midi1_packet, Midi1ToUmp, UmpTarget, UmpToMidi1};
pub use ump::{UmpDecoder, UmpMessageType};
