//! MIDI 1.0 byte stream codec.

use crate::error::{Error, Result};
use crate::message::LegacyBytes;
use smallvec::SmallVec;
use tracing::debug;

/// Total length of a message starting with `status`, or `None` for
/// variable-length (SysEx) and stray EOX.
pub fn message_len(status: u8) -> Option<usize> {
    match status {
        0x80..=0xBF => Some(3),
        0xC0..=0xDF => Some(2),
        0xE0..=0xEF => Some(3),
        0xF1 | 0xF3 => Some(2),
        0xF2 => Some(3),
        0xF0 | 0xF7 => None,
        // Undefined system common, tune request and real-time are single bytes.
        0xF4..=0xF6 | 0xF8..=0xFF => Some(1),
        _ => None,
    }
}

/// Message classes dropped by the decoder after parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IgnoreFilter {
    pub sysex: bool,
    /// Timing clock (0xF8) and MTC quarter frames (0xF1).
    pub timing: bool,
    /// Active sensing (0xFE).
    pub sensing: bool,
}

impl Default for IgnoreFilter {
    fn default() -> Self {
        Self {
            sysex: false,
            timing: true,
            sensing: true,
        }
    }
}

impl IgnoreFilter {
    /// Delivers everything.
    pub fn none() -> Self {
        Self {
            sysex: false,
            timing: false,
            sensing: false,
        }
    }

    /// True when the complete message `bytes` belongs to a dropped class.
    pub fn ignores(&self, bytes: &[u8]) -> bool {
        match bytes.first() {
            Some(0xF0) => self.sysex,
            Some(0xF1) | Some(0xF8) => self.timing,
            Some(0xFE) => self.sensing,
            _ => false,
        }
    }
}

/// What to do with the rest of a delivery after a malformed byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MalformedPolicy {
    /// Report, skip the offending byte (or word) and keep decoding.
    #[default]
    Resync,
    /// Report and drop the remainder of the current delivery.
    Abort,
}

/// Stateful MIDI 1.0 stream decoder.
///
/// Keeps running status and SysEx accumulation across `feed` calls, so a
/// backend may deliver bytes in arbitrary fragments.
#[derive(Debug, Default)]
pub struct LegacyDecoder {
    running_status: Option<u8>,
    pending: LegacyBytes,
    sysex: Option<Vec<u8>>,
    filter: IgnoreFilter,
    policy: MalformedPolicy,
}

impl LegacyDecoder {
    /// Decoder with the default filter (timing and active sensing dropped)
    /// and [`MalformedPolicy::Resync`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Message classes to drop after parsing.
    pub fn with_filter(mut self, filter: IgnoreFilter) -> Self {
        self.filter = filter;
        self
    }

    /// What happens to the rest of a delivery after a malformed byte.
    pub fn with_policy(mut self, policy: MalformedPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn running_status(&self) -> Option<u8> {
        self.running_status
    }

    /// True while a SysEx or a partial channel message is buffered.
    pub fn in_message(&self) -> bool {
        self.sysex.is_some() || !self.pending.is_empty()
    }

    pub fn reset(&mut self) {
        self.running_status = None;
        self.pending.clear();
        self.sysex = None;
    }

    /// Decodes `bytes`, calling `emit` once per complete message or error.
    pub fn feed(&mut self, bytes: &[u8], mut emit: impl FnMut(Result<LegacyBytes>)) {
        for &byte in bytes {
            if let Err(err) = self.push_byte(byte, &mut emit) {
                emit(Err(err));
                if self.policy == MalformedPolicy::Abort {
                    self.reset();
                    return;
                }
            }
        }
    }

    /// Convenience wrapper collecting the output of [`feed`](Self::feed).
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<Result<LegacyBytes>> {
        let mut out = Vec::new();
        self.feed(bytes, |r| out.push(r));
        out
    }

    /// Ends the stream. Buffered partial data is reported, never dropped silently.
    pub fn finish(&mut self) -> Result<()> {
        let leftover = match self.sysex.take() {
            Some(sysex) => Some((sysex, "Unterminated SysEx at end of stream")),
            None if !self.pending.is_empty() => {
                Some((self.pending.to_vec(), "Truncated message at end of stream"))
            }
            None => None,
        };
        self.reset();
        match leftover {
            Some((bytes, reason)) => Err(Error::malformed(&bytes, reason)),
            None => Ok(()),
        }
    }

    fn deliver(&self, bytes: LegacyBytes, emit: &mut impl FnMut(Result<LegacyBytes>)) {
        if self.filter.ignores(&bytes) {
            return;
        }
        emit(Ok(bytes));
    }

    fn push_byte(&mut self, byte: u8, emit: &mut impl FnMut(Result<LegacyBytes>)) -> Result<()> {
        // Real-time bytes may appear anywhere, even inside SysEx, and leave all state alone.
        if byte >= 0xF8 {
            self.deliver(SmallVec::from_slice(&[byte]), emit);
            return Ok(());
        }

        if let Some(sysex) = self.sysex.as_mut() {
            if byte < 0x80 {
                sysex.push(byte);
                return Ok(());
            }
            if byte == 0xF7 {
                sysex.push(byte);
                if let Some(done) = self.sysex.take() {
                    self.deliver(LegacyBytes::from_vec(done), emit);
                }
                return Ok(());
            }
            // Any other status ends the SysEx early. Report it and keep the new status.
            let truncated = self.sysex.take().unwrap_or_default();
            self.start_status(byte, emit)?;
            return Err(Error::malformed(&truncated, "SysEx interrupted by status byte"));
        }

        match byte {
            0xF7 => Err(Error::malformed(&[byte], "End of SysEx without start")),
            0x80..=0xF6 => self.start_status(byte, emit),
            _ => self.push_data(byte, emit),
        }
    }

    fn start_status(&mut self, status: u8, emit: &mut impl FnMut(Result<LegacyBytes>)) -> Result<()> {
        let interrupted = std::mem::take(&mut self.pending);

        if status == 0xF0 {
            self.running_status = None;
            self.sysex = Some(vec![0xF0]);
        } else {
            // System common cancels running status.
            self.running_status = (status < 0xF0).then_some(status);
            self.pending.push(status);
            if message_len(status) == Some(1) {
                let done = std::mem::take(&mut self.pending);
                self.deliver(done, emit);
            }
        }

        if interrupted.is_empty() {
            Ok(())
        } else {
            Err(Error::malformed(&interrupted, "Message interrupted by status byte"))
        }
    }

    fn push_data(&mut self, byte: u8, emit: &mut impl FnMut(Result<LegacyBytes>)) -> Result<()> {
        if self.pending.is_empty() {
            match self.running_status {
                Some(status) => self.pending.push(status),
                None => {
                    debug!("Dropping data byte {:#04X} without status", byte);
                    return Err(Error::malformed(&[byte], "Data byte without status"));
                }
            }
        }

        self.pending.push(byte);
        if message_len(self.pending[0]) == Some(self.pending.len()) {
            let done = std::mem::take(&mut self.pending);
            self.deliver(done, emit);
        }
        Ok(())
    }
}

/// MIDI 1.0 encoder with optional running-status compression.
#[derive(Debug, Default)]
pub struct LegacyEncoder {
    running_status: bool,
    last_status: Option<u8>,
}

impl LegacyEncoder {
    pub fn new(running_status: bool) -> Self {
        Self {
            running_status,
            last_status: None,
        }
    }

    pub fn reset(&mut self) {
        self.last_status = None;
    }

    /// Appends the wire bytes of one message (or SysEx chunk) to `out`.
    pub fn encode(&mut self, bytes: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let status = *bytes
            .first()
            .ok_or_else(|| Error::malformed(bytes, "Empty message"))?;

        match status {
            0xF8..=0xFF => {
                out.push(status);
            }
            0x80..=0xEF => {
                if self.running_status && self.last_status == Some(status) {
                    out.extend_from_slice(&bytes[1..]);
                } else {
                    out.extend_from_slice(bytes);
                }
                self.last_status = Some(status);
            }
            _ => {
                out.extend_from_slice(bytes);
                self.last_status = None;
            }
        }
        Ok(())
    }
}

/// Splits a SysEx stream into chunks of at most `limit` bytes.
///
/// Messages are first separated at each 0xF7 so no chunk spans two SysEx
/// messages. Concatenating the chunks yields `bytes` unchanged.
pub fn chunk_sysex(bytes: &[u8], limit: usize) -> Vec<&[u8]> {
    let limit = limit.max(1);
    bytes
        .split_inclusive(|b| *b == 0xF7)
        .flat_map(|message| message.chunks(limit))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_ok(decoder: &mut LegacyDecoder, bytes: &[u8]) -> Vec<Vec<u8>> {
        decoder
            .decode(bytes)
            .into_iter()
            .map(|r| r.unwrap().to_vec())
            .collect()
    }

    #[test]
    fn test_running_status() {
        let mut decoder = LegacyDecoder::new();
        let out = decode_ok(&mut decoder, &[0x90, 0x40, 0x7F, 0x41, 0x7F]);
        assert_eq!(out, vec![vec![0x90, 0x40, 0x7F], vec![0x90, 0x41, 0x7F]]);
        assert_eq!(decoder.running_status(), Some(0x90));
    }

    #[test]
    fn test_running_status_survives_fragmented_delivery() {
        let mut decoder = LegacyDecoder::new();
        assert!(decoder.decode(&[0xB0, 0x07]).is_empty());
        assert!(decoder.in_message());
        let out = decode_ok(&mut decoder, &[0x64, 0x0A, 0x40]);
        assert_eq!(out, vec![vec![0xB0, 0x07, 0x64], vec![0xB0, 0x0A, 0x40]]);
    }

    #[test]
    fn test_two_byte_messages() {
        let mut decoder = LegacyDecoder::new();
        let out = decode_ok(&mut decoder, &[0xC5, 0x01, 0x02, 0xD0, 0x7F]);
        assert_eq!(out, vec![vec![0xC5, 0x01], vec![0xC5, 0x02], vec![0xD0, 0x7F]]);
    }

    #[test]
    fn test_realtime_inside_sysex_passes_through() {
        let mut decoder = LegacyDecoder::new().with_filter(IgnoreFilter::none());
        let out = decode_ok(&mut decoder, &[0xF0, 0x43, 0xF8, 0x12, 0xF7]);
        assert_eq!(out, vec![vec![0xF8], vec![0xF0, 0x43, 0x12, 0xF7]]);
    }

    #[test]
    fn test_realtime_keeps_running_status() {
        let mut decoder = LegacyDecoder::new().with_filter(IgnoreFilter::none());
        let out = decode_ok(&mut decoder, &[0x90, 0x40, 0xFE, 0x7F, 0x41, 0x00]);
        assert_eq!(
            out,
            vec![vec![0xFE], vec![0x90, 0x40, 0x7F], vec![0x90, 0x41, 0x00]]
        );
    }

    #[test]
    fn test_system_common_cancels_running_status() {
        let mut decoder = LegacyDecoder::new().with_filter(IgnoreFilter::none());
        let results = decoder.decode(&[0x90, 0x40, 0x7F, 0xF3, 0x01, 0x41, 0x7F]);
        assert_eq!(results.len(), 4);
        assert_eq!(results[1].as_ref().unwrap().as_slice(), &[0xF3, 0x01]);
        assert!(results[2].is_err());
        assert!(results[3].is_err());
    }

    #[test]
    fn test_default_filter_drops_clock_and_sensing() {
        let mut decoder = LegacyDecoder::new();
        let out = decode_ok(&mut decoder, &[0xF8, 0xFE, 0xFA, 0xF1, 0x10]);
        assert_eq!(out, vec![vec![0xFA]]);
    }

    #[test]
    fn test_sysex_filter() {
        let filter = IgnoreFilter {
            sysex: true,
            ..IgnoreFilter::none()
        };
        let mut decoder = LegacyDecoder::new().with_filter(filter);
        let out = decode_ok(&mut decoder, &[0xF0, 0x01, 0xF7, 0x80, 0x40, 0x00]);
        assert_eq!(out, vec![vec![0x80, 0x40, 0x00]]);
    }

    #[test]
    fn test_sysex_across_deliveries() {
        let mut decoder = LegacyDecoder::new();
        assert!(decoder.decode(&[0xF0, 0x7D, 0x01]).is_empty());
        assert!(decoder.decode(&[0x02, 0x03]).is_empty());
        let out = decode_ok(&mut decoder, &[0x04, 0xF7]);
        assert_eq!(out, vec![vec![0xF0, 0x7D, 0x01, 0x02, 0x03, 0x04, 0xF7]]);
    }

    #[test]
    fn test_data_without_status_is_reported_and_skipped() {
        let mut decoder = LegacyDecoder::new();
        let results = decoder.decode(&[0x40, 0x90, 0x40, 0x7F]);
        assert_eq!(results.len(), 2);
        match &results[0] {
            Err(Error::MalformedMessage { bytes, .. }) => assert_eq!(bytes, &vec![0x40]),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(results[1].as_ref().unwrap().as_slice(), &[0x90, 0x40, 0x7F]);
    }

    #[test]
    fn test_abort_policy_drops_rest_of_delivery() {
        let mut decoder = LegacyDecoder::new().with_policy(MalformedPolicy::Abort);
        let results = decoder.decode(&[0x40, 0x90, 0x40, 0x7F]);
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
        let out = decode_ok(&mut decoder, &[0x90, 0x40, 0x7F]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_interrupted_sysex_reports_collected_bytes() {
        let mut decoder = LegacyDecoder::new();
        let results = decoder.decode(&[0xF0, 0x01, 0x02, 0x90, 0x40, 0x7F]);
        assert_eq!(results.len(), 2);
        match &results[0] {
            Err(Error::MalformedMessage { bytes, .. }) => assert_eq!(bytes, &vec![0xF0, 0x01, 0x02]),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(results[1].as_ref().unwrap().as_slice(), &[0x90, 0x40, 0x7F]);
    }

    #[test]
    fn test_finish_reports_truncated_tail() {
        let mut decoder = LegacyDecoder::new();
        assert!(decoder.decode(&[0x90, 0x40]).is_empty());
        assert!(decoder.finish().is_err());
        assert!(decoder.finish().is_ok());

        assert!(decoder.decode(&[0xF0, 0x01]).is_empty());
        match decoder.finish() {
            Err(Error::MalformedMessage { bytes, .. }) => assert_eq!(bytes, vec![0xF0, 0x01]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stray_eox() {
        let mut decoder = LegacyDecoder::new();
        let results = decoder.decode(&[0xF7]);
        assert!(matches!(results[0], Err(Error::MalformedMessage { .. })));
    }

    #[test]
    fn test_encoder_running_status_is_opt_in() {
        let messages: [&[u8]; 3] = [&[0x90, 0x40, 0x7F], &[0x90, 0x41, 0x7F], &[0x80, 0x40, 0x00]];

        let mut plain = LegacyEncoder::new(false);
        let mut out = Vec::new();
        for m in messages {
            plain.encode(m, &mut out).unwrap();
        }
        assert_eq!(out, vec![0x90, 0x40, 0x7F, 0x90, 0x41, 0x7F, 0x80, 0x40, 0x00]);

        let mut compact = LegacyEncoder::new(true);
        let mut out = Vec::new();
        for m in messages {
            compact.encode(m, &mut out).unwrap();
        }
        assert_eq!(out, vec![0x90, 0x40, 0x7F, 0x41, 0x7F, 0x80, 0x40, 0x00]);
    }

    #[test]
    fn test_encoder_realtime_does_not_break_running_status() {
        let mut encoder = LegacyEncoder::new(true);
        let mut out = Vec::new();
        encoder.encode(&[0x90, 0x40, 0x7F], &mut out).unwrap();
        encoder.encode(&[0xF8], &mut out).unwrap();
        encoder.encode(&[0x90, 0x41, 0x7F], &mut out).unwrap();
        encoder.encode(&[0xF0, 0x01, 0xF7], &mut out).unwrap();
        encoder.encode(&[0x90, 0x42, 0x7F], &mut out).unwrap();
        assert_eq!(
            out,
            vec![0x90, 0x40, 0x7F, 0xF8, 0x41, 0x7F, 0xF0, 0x01, 0xF7, 0x90, 0x42, 0x7F]
        );
    }

    #[test]
    fn test_encode_then_decode_restores_messages() {
        let messages: Vec<Vec<u8>> = vec![
            vec![0x90, 0x40, 0x7F],
            vec![0x90, 0x41, 0x00],
            vec![0xB3, 0x07, 0x64],
            vec![0xC3, 0x05],
            vec![0xF0, 0x7E, 0x00, 0x09, 0x01, 0xF7],
            vec![0xE0, 0x00, 0x40],
            vec![0xF2, 0x10, 0x20],
            vec![0xFA],
        ];
        let mut encoder = LegacyEncoder::new(true);
        let mut wire = Vec::new();
        for m in &messages {
            encoder.encode(m, &mut wire).unwrap();
        }
        let mut decoder = LegacyDecoder::new().with_filter(IgnoreFilter::none());
        assert_eq!(decode_ok(&mut decoder, &wire), messages);
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn test_chunk_sysex_300_bytes_into_64() {
        let mut sysex = vec![0xF0];
        sysex.extend((0..298).map(|i| (i % 128) as u8));
        sysex.push(0xF7);
        assert_eq!(sysex.len(), 300);

        let chunks = chunk_sysex(&sysex, 64);
        assert_eq!(chunks.len(), 5);
        assert!(chunks.iter().all(|c| c.len() <= 64));
        assert_eq!(chunks.concat(), sysex);
    }

    #[test]
    fn test_chunk_sysex_splits_at_eox() {
        let stream = [0xF0, 0x01, 0xF7, 0xF0, 0x02, 0x03, 0xF7];
        let chunks = chunk_sysex(&stream, 64);
        assert_eq!(chunks, vec![&stream[..3], &stream[3..]]);
    }
}
