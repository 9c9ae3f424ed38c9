//! UMP word stream codec.

use crate::error::{Error, Result};
use crate::message::UmpPacket;
use smallvec::SmallVec;

/// UMP message type, the top nibble of the first word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UmpMessageType {
    Utility,
    System,
    Midi1ChannelVoice,
    /// SysEx7.
    Data64,
    Midi2ChannelVoice,
    /// SysEx8 and mixed data sets.
    Data128,
    FlexData,
    UmpStream,
    Reserved(u8),
}

impl UmpMessageType {
    pub fn from_word(word: u32) -> Self {
        match (word >> 28) as u8 {
            0x0 => Self::Utility,
            0x1 => Self::System,
            0x2 => Self::Midi1ChannelVoice,
            0x3 => Self::Data64,
            0x4 => Self::Midi2ChannelVoice,
            0x5 => Self::Data128,
            0xD => Self::FlexData,
            0xF => Self::UmpStream,
            other => Self::Reserved(other),
        }
    }
}

/// Packet length in words, from the message type of the first word.
pub fn word_count(first_word: u32) -> usize {
    match first_word >> 28 {
        0x0 | 0x1 | 0x2 | 0x6 | 0x7 => 1,
        0x3 | 0x4 | 0x8 | 0x9 | 0xA => 2,
        0xB | 0xC => 3,
        _ => 4,
    }
}

/// Size in bytes of a packet, as some native APIs count UMP in bytes.
pub fn byte_count(first_word: u32) -> usize {
    word_count(first_word) * 4
}

/// Stateful UMP stream decoder. Splits a word stream into packets,
/// carrying a partial packet across `feed` calls.
#[derive(Debug, Default)]
pub struct UmpDecoder {
    pending: SmallVec<[u32; 4]>,
}

impl UmpDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes `words`, calling `emit` once per complete packet or error.
    /// A packet split across calls is completed by the next call.
    pub fn feed(&mut self, words: &[u32], mut emit: impl FnMut(Result<UmpPacket>)) {
        for &word in words {
            if self.pending.is_empty() {
                // Zero words are NOOP padding between packets.
                if word == 0 {
                    continue;
                }
            }
            self.pending.push(word);
            if self.pending.len() == word_count(self.pending[0]) {
                emit(UmpPacket::new(&self.pending));
                self.pending.clear();
            }
        }
    }

    pub fn decode(&mut self, words: &[u32]) -> Vec<Result<UmpPacket>> {
        let mut out = Vec::new();
        self.feed(words, |r| out.push(r));
        out
    }

    /// Ends the stream, reporting a trailing partial packet.
    pub fn finish(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let words = std::mem::take(&mut self.pending);
        Err(Error::malformed_ump(&words, "Truncated packet at end of stream"))
    }
}

/// Reinterprets a little-endian byte buffer as UMP words. Trailing bytes
/// that do not fill a word are reported.
pub fn words_from_bytes(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return Err(Error::malformed(bytes, "UMP byte buffer is not word aligned"));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
