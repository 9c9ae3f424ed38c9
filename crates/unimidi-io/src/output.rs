//! Output engine.
//!
//! A [`MidiOutput`] owns one open output connection and encodes caller
//! messages for its wire: MIDI 1.0 bytes (optionally with running status,
//! SysEx split into chunks the transport accepts) or UMP words. Messages
//! in the other format are translated on the way out.

use crate::backend::{Backend, Capabilities, OpenOptions, OpenPortId, RawData, Wire};
use smallvec::SmallVec;
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};
use unimidi_core::codec::{chunk_sysex, LegacyEncoder, Midi1ToUmp, UmpToMidi1};
use unimidi_core::{
    Api, ChunkingConfig, Direction, Error, LegacyBytes, Message, OutputConfig, Payload,
    PortHandle, Result, UmpPacket,
};

pub struct MidiOutput {
    backend: Arc<dyn Backend>,
    id: OpenPortId,
    port: Option<PortHandle>,
    wire: Wire,
    caps: Capabilities,
    config: OutputConfig,
    encoder: LegacyEncoder,
    to_ump: Midi1ToUmp,
    to_midi1: UmpToMidi1,
    scratch: Vec<u8>,
    open: bool,
}

impl MidiOutput {
    /// Opens `port` through the backend registered for its API.
    pub fn open(port: &PortHandle, config: OutputConfig) -> Result<Self> {
        Self::open_with(crate::registry::resolve(port.api())?, port, config)
    }

    pub fn open_with(
        backend: Arc<dyn Backend>,
        port: &PortHandle,
        config: OutputConfig,
    ) -> Result<Self> {
        if port.direction() != Direction::Output {
            return Err(Error::InvalidConfig(format!("{} is not an output", port)));
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

    /// Creates a virtual output named by `config.virtual_port_name`.
    pub fn open_virtual(api: Api, config: OutputConfig) -> Result<Self> {
        Self::open_virtual_with(crate::registry::resolve(api)?, config)
    }

    pub fn open_virtual_with(backend: Arc<dyn Backend>, config: OutputConfig) -> Result<Self> {
        if config.virtual_port_name.is_none() {
            return Err(Error::InvalidConfig(
                "virtual output needs virtual_port_name".to_string(),
            ));
        }
        Self::start(backend, None, config)
    }

    fn start(
        backend: Arc<dyn Backend>,
        port: Option<PortHandle>,
        config: OutputConfig,
    ) -> Result<Self> {
        config.validate()?;
        let caps = backend.capabilities();
        let wire = Wire::select(&caps, config.protocol, port.as_ref().map(|p| p.protocol()))?;

        let mut options = OpenOptions::new(Direction::Output, wire);
        options.client_name = config.client_name.clone();
        options.virtual_port_name = config.virtual_port_name.clone();

        let id = match &port {
            Some(port) => backend.open(port, &options)?,
            None => backend.open_virtual(&options)?,
        };
        debug!("MIDI output {} opened on {} ({:?})", id, backend.api(), wire);

        Ok(Self {
            encoder: LegacyEncoder::new(config.running_status),
            to_ump: Midi1ToUmp::new(config.ump_target, config.group),
            to_midi1: UmpToMidi1::new(),
            scratch: Vec::with_capacity(64),
            backend,
            id,
            port,
            wire,
            caps,
            config,
            open: true,
        })
    }

    pub fn api(&self) -> Api {
        self.backend.api()
    }

    /// The opened port; `None` for virtual outputs.
    pub fn port(&self) -> Option<&PortHandle> {
        self.port.as_ref()
    }

    pub fn wire(&self) -> Wire {
        self.wire
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn send(&mut self, message: &Message) -> Result<()> {
        if !self.open {
            return Err(Error::NotOpen);
        }
        match (&message.payload, self.wire) {
            (Payload::Legacy(bytes), Wire::Bytes) => self.send_legacy(bytes),
            (Payload::Ump(packet), Wire::Words) => {
                self.backend.send(self.id, RawData::Words(packet.words()))
            }
            (Payload::Ump(packet), Wire::Bytes) => {
                let mut converted: SmallVec<[LegacyBytes; 2]> = SmallVec::new();
                self.to_midi1
                    .convert(packet, |b| converted.push(LegacyBytes::from_slice(b)))?;
                for bytes in &converted {
                    self.send_legacy(bytes)?;
                }
                Ok(())
            }
            (Payload::Legacy(bytes), Wire::Words) => {
                for packet in self.to_ump.convert(bytes)? {
                    self.backend.send(self.id, RawData::Words(packet.words()))?;
                }
                Ok(())
            }
        }
    }

    /// Validates and sends one MIDI 1.0 message or SysEx chunk.
    pub fn send_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.send(&Message::legacy(bytes)?)
    }

    /// Validates and sends one UMP packet.
    pub fn send_ump(&mut self, words: &[u32]) -> Result<()> {
        self.send(&Message::from_payload(Payload::Ump(UmpPacket::new(words)?)))
    }

    /// Hands `data` to the backend untouched: no validation, running
    /// status or chunking. Must match the connection's wire format.
    pub fn send_raw(&mut self, data: RawData<'_>) -> Result<()> {
        if !self.open {
            return Err(Error::NotOpen);
        }
        self.backend.send(self.id, data)
    }

    fn chunk_limit(&self) -> Option<usize> {
        let configured = self.config.chunking.as_ref().map(|c| c.size);
        match (self.caps.sysex_chunk_limit, configured) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn send_legacy(&mut self, bytes: &[u8]) -> Result<()> {
        let is_sysex = bytes.first().is_some_and(|s| *s == 0xF0 || *s < 0x80);
        if is_sysex {
            // SysEx cancels running status on the wire.
            self.encoder.reset();
            return match self.chunk_limit() {
                Some(limit) if bytes.len() > limit => self.send_chunked(bytes, limit),
                _ => self.backend.send(self.id, RawData::Bytes(bytes)),
            };
        }

        self.scratch.clear();
        self.encoder.encode(bytes, &mut self.scratch)?;
        self.backend.send(self.id, RawData::Bytes(&self.scratch))
    }

    fn send_chunked(&mut self, bytes: &[u8], limit: usize) -> Result<()> {
        let chunks = chunk_sysex(bytes, limit);
        debug!("Sending {} byte SysEx in {} chunks", bytes.len(), chunks.len());

        let mut written = 0;
        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 {
                if let Some(chunking) = &self.config.chunking {
                    wait_between_chunks(chunking, written)?;
                }
            }
            self.backend.send(self.id, RawData::Bytes(chunk))?;
            written += chunk.len();
        }
        Ok(())
    }

    /// Closes the connection. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        debug!("MIDI output {} closed on {}", self.id, self.backend.api());
        self.backend.close(self.id)
    }
}

fn wait_between_chunks(chunking: &ChunkingConfig, written: usize) -> Result<()> {
    match &chunking.wait {
        Some(wait) => {
            if !wait(chunking.interval, written) {
                return Err(Error::BackendIo(format!(
                    "SysEx send aborted after {} bytes",
                    written
                )));
            }
        }
        None if !chunking.interval.is_zero() => thread::sleep(chunking.interval),
        None => {}
    }
    Ok(())
}

impl Drop for MidiOutput {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Error closing MIDI output: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LoopbackBackend, RawPayload};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use unimidi_core::{MidiProtocol, UmpTarget};

    fn setup(backend: &LoopbackBackend, config: OutputConfig) -> (u64, MidiOutput) {
        let key = backend.add_port("Synth");
        let port = backend.port(key, Direction::Output).unwrap();
        let output = MidiOutput::open_with(Arc::new(backend.clone()), &port, config).unwrap();
        (key, output)
    }

    fn sent_bytes(backend: &LoopbackBackend) -> Vec<Vec<u8>> {
        backend
            .take_sent()
            .into_iter()
            .map(|(_, payload)| match payload {
                RawPayload::Bytes(b) => b.to_vec(),
                RawPayload::Words(w) => panic!("unexpected words {:?}", w),
            })
            .collect()
    }

    #[test]
    fn test_running_status_on_the_wire() {
        let backend = LoopbackBackend::builder().record_sends(true).build();
        let config = OutputConfig::builder().running_status(true).build().unwrap();
        let (_, mut output) = setup(&backend, config);

        output.send(&Message::note_on(0, 60, 100)).unwrap();
        output.send(&Message::note_on(0, 62, 100)).unwrap();
        output.send(&Message::sysex(&[0x7E])).unwrap();
        output.send(&Message::note_on(0, 64, 100)).unwrap();

        assert_eq!(
            sent_bytes(&backend),
            vec![
                vec![0x90, 60, 100],
                vec![62, 100],
                vec![0xF0, 0x7E, 0xF7],
                vec![0x90, 64, 100],
            ]
        );
    }

    #[test]
    fn test_sysex_chunked_to_backend_limit() {
        let backend = LoopbackBackend::builder()
            .record_sends(true)
            .sysex_chunk_limit(64)
            .build();
        let (_, mut output) = setup(&backend, OutputConfig::default());

        let mut sysex = vec![0xF0];
        sysex.extend_from_slice(&[0x11; 298]);
        sysex.push(0xF7);
        output.send_bytes(&sysex).unwrap();

        let chunks = sent_bytes(&backend);
        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|c| c.len() <= 64));
        assert_eq!(chunks.concat(), sysex);
    }

    #[test]
    fn test_chunk_wait_can_abort() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let chunking = ChunkingConfig {
            size: 4,
            interval: Duration::from_millis(5),
            wait: Some(Arc::new(move |interval, written| {
                assert_eq!(interval, Duration::from_millis(5));
                c.fetch_add(1, Ordering::SeqCst);
                written < 8
            })),
        };
        let backend = LoopbackBackend::builder().record_sends(true).build();
        let config = OutputConfig::builder().chunking(chunking).build().unwrap();
        let (_, mut output) = setup(&backend, config);

        let err = output
            .send_bytes(&[0xF0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 0xF7])
            .unwrap_err();
        assert!(matches!(err, Error::BackendIo(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(sent_bytes(&backend).len(), 2);
    }

    #[test]
    fn test_ump_message_downgraded_on_byte_wire() {
        let backend = LoopbackBackend::builder().record_sends(true).build();
        let (_, mut output) = setup(&backend, OutputConfig::default());
        assert_eq!(output.wire(), Wire::Bytes);
        output.send_ump(&[0x2090_3C40]).unwrap();
        assert_eq!(sent_bytes(&backend), vec![vec![0x90, 0x3C, 0x40]]);
    }

    #[test]
    fn test_legacy_message_upgraded_on_word_wire() {
        let backend = LoopbackBackend::builder().record_sends(true).build();
        let config = OutputConfig::builder()
            .protocol(MidiProtocol::Midi2)
            .ump_target(UmpTarget::Midi1)
            .group(3)
            .build()
            .unwrap();
        let (_, mut output) = setup(&backend, config);
        assert_eq!(output.wire(), Wire::Words);

        output.send(&Message::control_change(1, 7, 100)).unwrap();
        let sent = backend.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].1,
            RawPayload::Words(smallvec::smallvec![0x23B1_0764])
        );
    }

    #[test]
    fn test_midi2_on_midi1_backend_unsupported() {
        let backend = LoopbackBackend::builder().ump(false).build();
        let key = backend.add_port("Legacy");
        let port = backend.port(key, Direction::Output).unwrap();
        let config = OutputConfig::builder()
            .protocol(MidiProtocol::Midi2)
            .build()
            .unwrap();
        assert!(matches!(
            MidiOutput::open_with(Arc::new(backend), &port, config),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_close_twice_then_send_fails() {
        let backend = LoopbackBackend::new();
        let (_, mut output) = setup(&backend, OutputConfig::default());
        output.close().unwrap();
        output.close().unwrap();
        assert!(matches!(
            output.send(&Message::note_off(0, 60, 0)),
            Err(Error::NotOpen)
        ));
        assert_eq!(backend.open_connections(), 0);
    }

    #[test]
    fn test_send_after_unplug_fails() {
        let backend = LoopbackBackend::new();
        let (key, mut output) = setup(&backend, OutputConfig::default());
        backend.remove_port(key);
        assert!(matches!(
            output.send(&Message::note_on(0, 60, 1)),
            Err(Error::PortUnavailable(_))
        ));
    }

    #[test]
    fn test_wrong_direction_rejected() {
        let backend = LoopbackBackend::new();
        let key = backend.add_port("Synth");
        let port = backend.port(key, Direction::Input).unwrap();
        assert!(matches!(
            MidiOutput::open_with(Arc::new(backend), &port, OutputConfig::default()),
            Err(Error::InvalidConfig(_))
        ));
    }
}
