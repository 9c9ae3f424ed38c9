//! MIDI API identifiers.
//!
//! An [`Api`] names one native MIDI subsystem (or one of the built-in
//! software backends). The identifier is what callers pass around; the
//! concrete backend is looked up in the registry of `unimidi-io`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Api {
    /// Resolved at open time to the platform's preferred backend.
    #[default]
    Default,
    Dummy,
    Loopback,
    AlsaSeq,
    AlsaRaw,
    AlsaSeqUmp,
    AlsaRawUmp,
    CoreMidi,
    CoreMidiUmp,
    WindowsMm,
    WindowsUwp,
    WindowsMidiServices,
    Jack,
    PipeWire,
    WebMidi,
}

impl Api {
    pub const ALL: [Api; 15] = [
        Api::Default,
        Api::Dummy,
        Api::Loopback,
        Api::AlsaSeq,
        Api::AlsaRaw,
        Api::AlsaSeqUmp,
        Api::AlsaRawUmp,
        Api::CoreMidi,
        Api::CoreMidiUmp,
        Api::WindowsMm,
        Api::WindowsUwp,
        Api::WindowsMidiServices,
        Api::Jack,
        Api::PipeWire,
        Api::WebMidi,
    ];

    /// Stable lowercase identifier, suitable for config files.
    pub fn name(self) -> &'static str {
        match self {
            Api::Default => "default",
            Api::Dummy => "dummy",
            Api::Loopback => "loopback",
            Api::AlsaSeq => "alsa_seq",
            Api::AlsaRaw => "alsa_raw",
            Api::AlsaSeqUmp => "alsa_seq_ump",
            Api::AlsaRawUmp => "alsa_raw_ump",
            Api::CoreMidi => "coremidi",
            Api::CoreMidiUmp => "coremidi_ump",
            Api::WindowsMm => "winmm",
            Api::WindowsUwp => "winuwp",
            Api::WindowsMidiServices => "winmidi",
            Api::Jack => "jack",
            Api::PipeWire => "pipewire",
            Api::WebMidi => "webmidi",
        }
    }

    /// Human-readable name for port pickers and logs.
    pub fn display_name(self) -> &'static str {
        match self {
            Api::Default => "Default",
            Api::Dummy => "Dummy",
            Api::Loopback => "Loopback",
            Api::AlsaSeq => "ALSA (sequencer)",
            Api::AlsaRaw => "ALSA (raw)",
            Api::AlsaSeqUmp => "ALSA (sequencer, UMP)",
            Api::AlsaRawUmp => "ALSA (raw, UMP)",
            Api::CoreMidi => "CoreMIDI",
            Api::CoreMidiUmp => "CoreMIDI (UMP)",
            Api::WindowsMm => "Windows Multimedia",
            Api::WindowsUwp => "Windows UWP",
            Api::WindowsMidiServices => "Windows MIDI Services",
            Api::Jack => "JACK",
            Api::PipeWire => "PipeWire",
            Api::WebMidi => "Web MIDI",
        }
    }

    /// Case-insensitive lookup by [`name`](Self::name) or display name.
    pub fn from_name(name: &str) -> Result<Api> {
        let trimmed = name.trim();
        Api::ALL
            .iter()
            .copied()
            .find(|api| {
                api.name().eq_ignore_ascii_case(trimmed)
                    || api.display_name().eq_ignore_ascii_case(trimmed)
            })
            .ok_or_else(|| Error::UnknownApi(name.to_string()))
    }

    /// Speaks MIDI 1.0 byte streams natively.
    pub fn is_midi1(self) -> bool {
        matches!(
            self,
            Api::Dummy
                | Api::Loopback
                | Api::AlsaSeq
                | Api::AlsaRaw
                | Api::CoreMidi
                | Api::WindowsMm
                | Api::WindowsUwp
                | Api::Jack
                | Api::PipeWire
                | Api::WebMidi
        )
    }

    /// Speaks UMP natively.
    pub fn is_midi2(self) -> bool {
        matches!(
            self,
            Api::Loopback
                | Api::AlsaSeqUmp
                | Api::AlsaRawUmp
                | Api::CoreMidiUmp
                | Api::WindowsMidiServices
        )
    }

    /// Priority order used to pick the default API on this platform.
    /// UMP-capable subsystems come first; `Dummy` is always last.
    pub fn platform_defaults() -> &'static [Api] {
        #[cfg(target_os = "linux")]
        {
            &[
                Api::AlsaSeqUmp,
                Api::AlsaSeq,
                Api::AlsaRawUmp,
                Api::AlsaRaw,
                Api::PipeWire,
                Api::Jack,
                Api::Dummy,
            ]
        }
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        {
            &[Api::CoreMidiUmp, Api::CoreMidi, Api::Jack, Api::Dummy]
        }
        #[cfg(target_os = "windows")]
        {
            &[
                Api::WindowsMidiServices,
                Api::WindowsUwp,
                Api::WindowsMm,
                Api::Dummy,
            ]
        }
        #[cfg(target_arch = "wasm32")]
        {
            &[Api::WebMidi, Api::Dummy]
        }
        #[cfg(not(any(
            target_os = "linux",
            target_os = "macos",
            target_os = "ios",
            target_os = "windows",
            target_arch = "wasm32"
        )))]
        {
            &[Api::Jack, Api::Dummy]
        }
    }

    /// The conventional MIDI 1.0 subsystem of this platform, if there is one.
    pub fn native_midi1() -> Option<Api> {
        if cfg!(target_os = "linux") {
            Some(Api::AlsaSeq)
        } else if cfg!(any(target_os = "macos", target_os = "ios")) {
            Some(Api::CoreMidi)
        } else if cfg!(target_os = "windows") {
            Some(Api::WindowsMm)
        } else if cfg!(target_arch = "wasm32") {
            Some(Api::WebMidi)
        } else {
            None
        }
    }
}

impl fmt::Display for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Api {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Api::from_name(s)
    }
}
