//! Message model: one MIDI 1.0 message (or SysEx chunk) or one UMP packet,
//! plus timestamp and source port.

use crate::codec::legacy::message_len;
use crate::codec::ump::{word_count, UmpMessageType};
use crate::error::{Error, Result};
use crate::port::PortHandle;
use smallvec::SmallVec;
use std::fmt;

/// Bytes of one MIDI 1.0 message. Three bytes inline covers every channel message.
pub type LegacyBytes = SmallVec<[u8; 3]>;

/// One Universal MIDI Packet of 1 to 4 words.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UmpPacket {
    words: [u32; 4],
    len: u8,
}

impl UmpPacket {
    /// Validates that `words.len()` matches the message type of the first word.
    pub fn new(words: &[u32]) -> Result<Self> {
        let first = *words
            .first()
            .ok_or_else(|| Error::malformed_ump(words, "Empty UMP packet"))?;
        let expected = word_count(first);
        if words.len() != expected {
            return Err(Error::malformed_ump(
                words,
                format!("Expected {} words, got {}", expected, words.len()),
            ));
        }
        let mut packet = [0u32; 4];
        packet[..expected].copy_from_slice(words);
        Ok(Self {
            words: packet,
            len: expected as u8,
        })
    }

    /// Trusted constructor for codec output: length comes from the message
    /// type, missing words are zero.
    pub(crate) fn from_words(words: &[u32]) -> Self {
        let len = words.first().map_or(1, |w| word_count(*w));
        let mut packet = [0u32; 4];
        let n = len.min(words.len());
        packet[..n].copy_from_slice(&words[..n]);
        Self {
            words: packet,
            len: len as u8,
        }
    }

    pub fn words(&self) -> &[u32] {
        &self.words[..self.len as usize]
    }

    pub fn message_type(&self) -> UmpMessageType {
        UmpMessageType::from_word(self.words[0])
    }

    pub fn group(&self) -> u8 {
        ((self.words[0] >> 24) & 0x0F) as u8
    }

    /// Upper status nibble (opcode) for channel voice packets.
    pub fn status(&self) -> u8 {
        ((self.words[0] >> 20) & 0x0F) as u8
    }

    pub fn channel(&self) -> u8 {
        ((self.words[0] >> 16) & 0x0F) as u8
    }

    /// Copy of this packet addressed to another group. Utility packets are groupless.
    pub fn with_group(mut self, group: u8) -> Self {
        if self.message_type() != UmpMessageType::Utility {
            self.words[0] = (self.words[0] & 0xF0FF_FFFF) | (u32::from(group & 0x0F) << 24);
        }
        self
    }
}

impl fmt::Debug for UmpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UmpPacket({:08X?})", self.words())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Legacy(LegacyBytes),
    Ump(UmpPacket),
}

/// A timestamped MIDI message.
///
/// `timestamp` is in nanoseconds; its meaning (absolute since the engine
/// epoch, or delta since the previous message) follows the input
/// configuration that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub payload: Payload,
    pub timestamp: Option<u64>,
    pub source: Option<PortHandle>,
}

fn validate_legacy(bytes: &[u8]) -> Result<()> {
    let status = *bytes
        .first()
        .ok_or_else(|| Error::malformed(bytes, "Empty message"))?;

    if status < 0x80 {
        // SysEx continuation chunk: data bytes, optionally closed by EOX.
        let body = bytes.strip_suffix(&[0xF7]).unwrap_or(bytes);
        if body.iter().any(|b| *b >= 0x80) {
            return Err(Error::malformed(bytes, "Status byte inside SysEx chunk"));
        }
        return Ok(());
    }

    if status == 0xF0 {
        let body = bytes[1..].strip_suffix(&[0xF7]).unwrap_or(&bytes[1..]);
        if body.iter().any(|b| *b >= 0x80) {
            return Err(Error::malformed(bytes, "Status byte inside SysEx"));
        }
        return Ok(());
    }

    let expected = message_len(status)
        .ok_or_else(|| Error::malformed(bytes, "Stray end of SysEx"))?;
    if bytes.len() != expected {
        return Err(Error::malformed(
            bytes,
            format!("Expected {} bytes, got {}", expected, bytes.len()),
        ));
    }
    if bytes[1..].iter().any(|b| *b >= 0x80) {
        return Err(Error::malformed(bytes, "Data byte has high bit set"));
    }
    Ok(())
}

impl Message {
    /// A complete MIDI 1.0 message, or one chunk of a SysEx stream.
    pub fn legacy(bytes: &[u8]) -> Result<Self> {
        validate_legacy(bytes)?;
        Ok(Self::from_payload(Payload::Legacy(LegacyBytes::from_slice(bytes))))
    }

    pub fn ump(words: &[u32]) -> Result<Self> {
        Ok(Self::from_payload(Payload::Ump(UmpPacket::new(words)?)))
    }

    pub fn from_payload(payload: Payload) -> Self {
        Self {
            payload,
            timestamp: None,
            source: None,
        }
    }

    pub(crate) fn from_legacy_unchecked(bytes: LegacyBytes) -> Self {
        Self::from_payload(Payload::Legacy(bytes))
    }

    pub fn with_timestamp(mut self, timestamp: Option<u64>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_source(mut self, source: Option<PortHandle>) -> Self {
        self.source = source;
        self
    }

    pub fn note_on(channel: u8, note: u8, velocity: u8) -> Self {
        Self::channel_message(0x90, channel, &[note, velocity])
    }

    pub fn note_off(channel: u8, note: u8, velocity: u8) -> Self {
        Self::channel_message(0x80, channel, &[note, velocity])
    }

    pub fn poly_pressure(channel: u8, note: u8, pressure: u8) -> Self {
        Self::channel_message(0xA0, channel, &[note, pressure])
    }

    pub fn control_change(channel: u8, cc_number: u8, value: u8) -> Self {
        Self::channel_message(0xB0, channel, &[cc_number, value])
    }

    pub fn program_change(channel: u8, program: u8) -> Self {
        Self::channel_message(0xC0, channel, &[program])
    }

    pub fn channel_pressure(channel: u8, pressure: u8) -> Self {
        Self::channel_message(0xD0, channel, &[pressure])
    }

    /// `value`: signed 14-bit (-8192 to 8191).
    pub fn pitch_bend(channel: u8, value: i16) -> Self {
        let unsigned = (i32::from(value) + 8192).clamp(0, 16383) as u16;
        let lsb = (unsigned & 0x7F) as u8;
        let msb = ((unsigned >> 7) & 0x7F) as u8;
        Self::channel_message(0xE0, channel, &[lsb, msb])
    }

    /// Wraps `data` in F0 .. F7. Data bytes are masked to 7 bits.
    pub fn sysex(data: &[u8]) -> Self {
        let mut bytes = LegacyBytes::with_capacity(data.len() + 2);
        bytes.push(0xF0);
        bytes.extend(data.iter().map(|b| b & 0x7F));
        bytes.push(0xF7);
        Self::from_legacy_unchecked(bytes)
    }

    fn channel_message(kind: u8, channel: u8, data: &[u8]) -> Self {
        let mut bytes = LegacyBytes::new();
        bytes.push(kind | channel.min(15));
        bytes.extend(data.iter().map(|b| b & 0x7F));
        Self::from_legacy_unchecked(bytes)
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Legacy(bytes) => Some(bytes),
            Payload::Ump(_) => None,
        }
    }

    pub fn words(&self) -> Option<&[u32]> {
        match &self.payload {
            Payload::Legacy(_) => None,
            Payload::Ump(packet) => Some(packet.words()),
        }
    }

    pub fn is_ump(&self) -> bool {
        matches!(self.payload, Payload::Ump(_))
    }

    /// First byte of a legacy message; `None` for UMP and SysEx continuation chunks.
    pub fn status(&self) -> Option<u8> {
        self.bytes()
            .and_then(|b| b.first().copied())
            .filter(|s| *s >= 0x80)
    }

    pub fn channel(&self) -> Option<u8> {
        match &self.payload {
            Payload::Legacy(_) => self.status().filter(|s| *s < 0xF0).map(|s| s & 0x0F),
            Payload::Ump(p) => match p.message_type() {
                UmpMessageType::Midi1ChannelVoice | UmpMessageType::Midi2ChannelVoice => {
                    Some(p.channel())
                }
                _ => None,
            },
        }
    }

    pub fn is_note_on(&self) -> bool {
        match &self.payload {
            Payload::Legacy(b) => b.len() == 3 && b[0] & 0xF0 == 0x90 && b[2] > 0,
            Payload::Ump(p) => {
                matches!(
                    p.message_type(),
                    UmpMessageType::Midi1ChannelVoice | UmpMessageType::Midi2ChannelVoice
                ) && p.status() == 0x9
            }
        }
    }

    pub fn is_sysex(&self) -> bool {
        match &self.payload {
            Payload::Legacy(b) => b.first().is_some_and(|s| *s == 0xF0 || *s < 0x80),
            Payload::Ump(p) => p.message_type() == UmpMessageType::Data64,
        }
    }

    pub fn is_realtime(&self) -> bool {
        self.status().is_some_and(|s| s >= 0xF8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_legacy_payload_predicates() {
        let empty = Message::from_payload(Payload::Legacy(LegacyBytes::new()));
        assert!(!empty.is_sysex());
        assert!(!empty.is_note_on());
        assert!(!empty.is_realtime());
        assert_eq!(empty.status(), None);
    }

    #[test]
    fn test_channel_constructors() {
        assert_eq!(Message::note_on(0, 60, 100).bytes().unwrap(), &[0x90, 60, 100]);
        assert_eq!(Message::note_off(3, 60, 0).bytes().unwrap(), &[0x83, 60, 0]);
        assert_eq!(Message::control_change(1, 7, 127).bytes().unwrap(), &[0xB1, 7, 127]);
        assert_eq!(Message::program_change(9, 42).bytes().unwrap(), &[0xC9, 42]);
        assert_eq!(Message::channel_pressure(0, 64).bytes().unwrap(), &[0xD0, 64]);
        assert_eq!(Message::poly_pressure(2, 60, 5).bytes().unwrap(), &[0xA2, 60, 5]);
    }

    #[test]
    fn test_channel_clamped_and_data_masked() {
        let msg = Message::note_on(20, 200, 255);
        assert_eq!(msg.bytes().unwrap(), &[0x9F, 200 & 0x7F, 0x7F]);
    }

    #[test]
    fn test_pitch_bend_center_and_extremes() {
        assert_eq!(Message::pitch_bend(0, 0).bytes().unwrap(), &[0xE0, 0x00, 0x40]);
        assert_eq!(Message::pitch_bend(0, -8192).bytes().unwrap(), &[0xE0, 0x00, 0x00]);
        assert_eq!(Message::pitch_bend(0, 8191).bytes().unwrap(), &[0xE0, 0x7F, 0x7F]);
        assert_eq!(Message::pitch_bend(0, i16::MAX).bytes().unwrap(), &[0xE0, 0x7F, 0x7F]);
    }

    #[test]
    fn test_sysex_wrapping() {
        let msg = Message::sysex(&[0x7E, 0x7F, 0x06, 0x01]);
        assert_eq!(msg.bytes().unwrap(), &[0xF0, 0x7E, 0x7F, 0x06, 0x01, 0xF7]);
        assert!(msg.is_sysex());
        assert_eq!(msg.channel(), None);
    }

    #[test]
    fn test_legacy_validation() {
        assert!(Message::legacy(&[]).is_err());
        assert!(Message::legacy(&[0x90, 0x40]).is_err());
        assert!(Message::legacy(&[0x90, 0x40, 0x80]).is_err());
        assert!(Message::legacy(&[0xF7]).is_err());
        assert!(Message::legacy(&[0xF0, 0x01, 0x90, 0xF7]).is_err());
        assert!(Message::legacy(&[0x90, 0x40, 0x7F]).is_ok());
        assert!(Message::legacy(&[0xF8]).is_ok());
        assert!(Message::legacy(&[0x01, 0x02, 0xF7]).is_ok());
        assert!(Message::legacy(&[0xF0, 0x01, 0x02]).is_ok());
    }

    #[test]
    fn test_ump_length_checked_against_type() {
        assert!(Message::ump(&[0x2090_4040]).is_ok());
        assert!(Message::ump(&[0x4090_4000, 0xC104_0000]).is_ok());
        assert!(Message::ump(&[0x4090_4000]).is_err());
        assert!(Message::ump(&[0x2090_4040, 0]).is_err());
        assert!(Message::ump(&[]).is_err());
    }

    #[test]
    fn test_ump_accessors() {
        let msg = Message::ump(&[0x2392_3C64]).unwrap();
        assert!(msg.is_ump());
        assert!(msg.is_note_on());
        assert_eq!(msg.channel(), Some(2));
        let Payload::Ump(p) = msg.payload else {
            panic!("expected UMP payload");
        };
        assert_eq!(p.group(), 3);
        assert_eq!(p.with_group(5).words(), &[0x2592_3C64]);
    }

    #[test]
    fn test_note_on_with_zero_velocity_is_not_note_on() {
        assert!(!Message::note_on(0, 60, 0).is_note_on());
        assert!(Message::note_on(0, 60, 1).is_note_on());
    }
}
