//! MIDI 1.0 <-> UMP translation.
//!
//! Value scaling follows the MIDI Association min-center-max law: upscaling
//! shifts left and, above the centre value, fills the new low bits by
//! repeating the source bits; downscaling is a plain right shift. So
//! `down(up(v)) == v` for every coarse value, and 0, centre and max map to
//! 0, centre and max.

use crate::codec::legacy::message_len;
use crate::codec::ump::UmpMessageType;
use crate::error::{Error, Result};
use crate::message::UmpPacket;
use midi2::channel_voice2::{self, ChannelVoice2};
use midi2::prelude::*;
use smallvec::SmallVec;
use tracing::debug;

/// Min-center-max upscale from `src_bits` to `dst_bits` (at most 32).
pub fn scale_up(value: u32, src_bits: u32, dst_bits: u32) -> u32 {
    debug_assert!(src_bits > 0 && src_bits <= dst_bits && dst_bits <= 32);
    let value = u64::from(value) & ((1u64 << src_bits) - 1);
    let scale_bits = dst_bits - src_bits;
    let shifted = value << scale_bits;
    let center = 1u64 << (src_bits - 1);
    if value <= center || src_bits == 1 {
        return shifted as u32;
    }

    let repeat_bits = src_bits - 1;
    let repeat_mask = (1u64 << repeat_bits) - 1;
    let mut repeat = value & repeat_mask;
    if scale_bits > repeat_bits {
        repeat <<= scale_bits - repeat_bits;
    } else {
        repeat >>= repeat_bits - scale_bits;
    }

    let mut out = shifted;
    while repeat != 0 {
        out |= repeat;
        repeat >>= repeat_bits;
    }
    out as u32
}

/// Inverse of [`scale_up`]: drops the low `src_bits - dst_bits` bits.
pub fn scale_down(value: u32, src_bits: u32, dst_bits: u32) -> u32 {
    debug_assert!(dst_bits > 0 && dst_bits <= src_bits && src_bits <= 32);
    value >> (src_bits - dst_bits)
}

/// 7-bit velocity to 16-bit.
#[inline]
pub fn midi1_velocity_to_midi2(v: u8) -> u16 {
    scale_up(u32::from(v), 7, 16) as u16
}

#[inline]
pub fn midi2_velocity_to_midi1(v: u16) -> u8 {
    scale_down(u32::from(v), 16, 7) as u8
}

/// 7-bit controller, pressure or data value to 32-bit.
#[inline]
pub fn midi1_cc_to_midi2(v: u8) -> u32 {
    scale_up(u32::from(v), 7, 32)
}

#[inline]
pub fn midi2_cc_to_midi1(v: u32) -> u8 {
    scale_down(v, 32, 7) as u8
}

/// 14-bit unsigned pitch bend (centre 8192) to 32-bit (centre 0x8000_0000).
#[inline]
pub fn midi1_pitch_bend_to_midi2(v: u16) -> u32 {
    scale_up(u32::from(v), 14, 32)
}

#[inline]
pub fn midi2_pitch_bend_to_midi1(v: u32) -> u16 {
    scale_down(v, 32, 14) as u16
}

/// Which UMP flavour MIDI 1.0 channel messages become.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UmpTarget {
    /// MIDI 1.0 channel voice in UMP (type 2).
    #[default]
    Midi1,
    /// MIDI 2.0 channel voice (type 4) with upscaled values.
    Midi2,
}

pub type UmpPackets = SmallVec<[UmpPacket; 2]>;

fn packet(words: &[u32]) -> UmpPacket {
    UmpPacket::from_words(words)
}

fn word0(mt: u32, group: u8, b1: u8, b2: u8, b3: u8) -> u32 {
    (mt << 28)
        | (u32::from(group & 0x0F) << 24)
        | (u32::from(b1) << 16)
        | (u32::from(b2) << 8)
        | u32::from(b3)
}

fn note_off(group: u4, channel: u4, note: u8, velocity: u16) -> UmpPacket {
    let mut msg = channel_voice2::NoteOff::<[u32; 2]>::new();
    msg.set_group(group);
    msg.set_channel(channel);
    msg.set_note_number(u7::new(note & 0x7F));
    msg.set_velocity(velocity);
    packet(msg.data())
}

fn note_on(group: u4, channel: u4, note: u8, velocity: u16) -> UmpPacket {
    let mut msg = channel_voice2::NoteOn::<[u32; 2]>::new();
    msg.set_group(group);
    msg.set_channel(channel);
    msg.set_note_number(u7::new(note & 0x7F));
    msg.set_velocity(velocity);
    packet(msg.data())
}

fn key_pressure(group: u4, channel: u4, note: u8, pressure: u32) -> UmpPacket {
    let mut msg = channel_voice2::KeyPressure::<[u32; 2]>::new();
    msg.set_group(group);
    msg.set_channel(channel);
    msg.set_note_number(u7::new(note & 0x7F));
    msg.set_key_pressure_data(pressure);
    packet(msg.data())
}

fn control_change(group: u4, channel: u4, control: u8, value: u32) -> UmpPacket {
    let mut msg = channel_voice2::ControlChange::<[u32; 2]>::new();
    msg.set_group(group);
    msg.set_channel(channel);
    msg.set_control(u7::new(control & 0x7F));
    msg.set_control_change_data(value);
    packet(msg.data())
}

fn program_change(group: u4, channel: u4, program: u8, bank: Option<u16>) -> UmpPacket {
    let mut msg = channel_voice2::ProgramChange::<[u32; 2]>::new();
    msg.set_group(group);
    msg.set_channel(channel);
    msg.set_program(u7::new(program & 0x7F));
    msg.set_bank(bank.map(|b| u14::new(b & 0x3FFF)));
    packet(msg.data())
}

fn channel_pressure(group: u4, channel: u4, pressure: u32) -> UmpPacket {
    let mut msg = channel_voice2::ChannelPressure::<[u32; 2]>::new();
    msg.set_group(group);
    msg.set_channel(channel);
    msg.set_channel_pressure_data(pressure);
    packet(msg.data())
}

fn channel_pitch_bend(group: u4, channel: u4, bend: u32) -> UmpPacket {
    let mut msg = channel_voice2::ChannelPitchBend::<[u32; 2]>::new();
    msg.set_group(group);
    msg.set_channel(channel);
    msg.set_pitch_bend_data(bend);
    packet(msg.data())
}

fn parameter_controller(
    kind: ParamKind,
    group: u4,
    channel: u4,
    bank: u8,
    index: u8,
    value: u32,
) -> UmpPacket {
    match kind {
        ParamKind::Registered => {
            let mut msg = channel_voice2::RegisteredController::<[u32; 2]>::new();
            msg.set_group(group);
            msg.set_channel(channel);
            msg.set_bank(u7::new(bank & 0x7F));
            msg.set_index(u7::new(index & 0x7F));
            msg.set_controller_data(value);
            packet(msg.data())
        }
        ParamKind::Assignable => {
            let mut msg = channel_voice2::AssignableController::<[u32; 2]>::new();
            msg.set_group(group);
            msg.set_channel(channel);
            msg.set_bank(u7::new(bank & 0x7F));
            msg.set_index(u7::new(index & 0x7F));
            msg.set_controller_data(value);
            packet(msg.data())
        }
    }
}

/// Stateless MIDI 1.0 channel voice -> MIDI 2.0 channel voice.
fn channel_voice_to_midi2(group: u8, bytes: &[u8]) -> UmpPacket {
    let status = bytes[0];
    let group = u4::new(group & 0x0F);
    let channel = u4::new(status & 0x0F);
    let d1 = bytes.get(1).copied().unwrap_or(0) & 0x7F;
    let d2 = bytes.get(2).copied().unwrap_or(0) & 0x7F;

    match status & 0xF0 {
        0x80 => note_off(group, channel, d1, midi1_velocity_to_midi2(d2)),
        // Note-on with velocity 0 is a note-off at the default release velocity.
        0x90 if d2 == 0 => note_off(group, channel, d1, midi1_velocity_to_midi2(64)),
        0x90 => note_on(group, channel, d1, midi1_velocity_to_midi2(d2)),
        0xA0 => key_pressure(group, channel, d1, midi1_cc_to_midi2(d2)),
        0xB0 => control_change(group, channel, d1, midi1_cc_to_midi2(d2)),
        0xC0 => program_change(group, channel, d1, None),
        0xD0 => channel_pressure(group, channel, midi1_cc_to_midi2(d1)),
        _ => {
            let bend = u16::from(d1) | (u16::from(d2) << 7);
            channel_pitch_bend(group, channel, midi1_pitch_bend_to_midi2(bend))
        }
    }
}

/// Upgrades a MIDI 1.0-in-UMP packet (type 2) to MIDI 2.0 channel voice
/// (type 4). Every other packet is returned unchanged.
pub fn upgrade_midi1_packet(p: UmpPacket) -> UmpPacket {
    if p.message_type() != UmpMessageType::Midi1ChannelVoice {
        return p;
    }
    let w = p.words()[0];
    let bytes = [(w >> 16) as u8, ((w >> 8) & 0x7F) as u8, (w & 0x7F) as u8];
    if bytes[0] < 0x80 || bytes[0] >= 0xF0 {
        return p;
    }
    channel_voice_to_midi2(p.group(), &bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamKind {
    Registered,
    Assignable,
}

#[derive(Debug, Clone, Copy, Default)]
struct ChannelState {
    bank_msb: Option<u8>,
    bank_lsb: Option<u8>,
    param_kind: Option<ParamKind>,
    param_msb: Option<u8>,
    param_lsb: Option<u8>,
    data_msb: u8,
}

/// Converts MIDI 1.0 messages (one complete message or SysEx chunk per
/// call) into UMP packets.
///
/// With [`UmpTarget::Midi2`], bank select is folded into the following
/// program change and RPN/NRPN sequences become MIDI 2.0 registered and
/// assignable controllers.
#[derive(Debug)]
pub struct Midi1ToUmp {
    target: UmpTarget,
    group: u8,
    channels: [ChannelState; 16],
    sysex_open: bool,
}

impl Midi1ToUmp {
    pub fn new(target: UmpTarget, group: u8) -> Self {
        Self {
            target,
            group: group & 0x0F,
            channels: [ChannelState::default(); 16],
            sysex_open: false,
        }
    }

    pub fn reset(&mut self) {
        self.channels = [ChannelState::default(); 16];
        self.sysex_open = false;
    }

    pub fn convert(&mut self, bytes: &[u8]) -> Result<UmpPackets> {
        let mut out = UmpPackets::new();
        let status = *bytes
            .first()
            .ok_or_else(|| Error::malformed(bytes, "Empty message"))?;

        if status == 0xF0 || status < 0x80 {
            self.sysex7(bytes, &mut out)?;
            return Ok(out);
        }

        let len = message_len(status)
            .ok_or_else(|| Error::malformed(bytes, "End of SysEx without start"))?;
        if bytes.len() < len {
            return Err(Error::malformed(bytes, "Truncated message"));
        }
        let d1 = bytes.get(1).copied().unwrap_or(0) & 0x7F;
        let d2 = bytes.get(2).copied().unwrap_or(0) & 0x7F;

        if status >= 0xF0 {
            out.push(packet(&[word0(1, self.group, status, d1, d2)]));
            return Ok(out);
        }

        match self.target {
            UmpTarget::Midi1 => out.push(packet(&[word0(2, self.group, status, d1, d2)])),
            UmpTarget::Midi2 => self.push_midi2(status, d1, d2, &bytes[..len], &mut out),
        }
        Ok(out)
    }

    fn push_midi2(&mut self, status: u8, d1: u8, d2: u8, bytes: &[u8], out: &mut UmpPackets) {
        let channel = status & 0x0F;
        let group = self.group;
        let state = &mut self.channels[channel as usize];

        match status & 0xF0 {
            0xB0 => match d1 {
                0 => state.bank_msb = Some(d2),
                32 => state.bank_lsb = Some(d2),
                99 | 101 => {
                    state.param_kind = Some(if d1 == 101 {
                        ParamKind::Registered
                    } else {
                        ParamKind::Assignable
                    });
                    state.param_msb = Some(d2);
                }
                98 | 100 => {
                    state.param_kind = Some(if d1 == 100 {
                        ParamKind::Registered
                    } else {
                        ParamKind::Assignable
                    });
                    state.param_lsb = Some(d2);
                }
                6 | 38 => {
                    let (kind, msb, lsb) = match (state.param_kind, state.param_msb, state.param_lsb) {
                        (Some(k), Some(m), Some(l)) if !(m == 0x7F && l == 0x7F) => (k, m, l),
                        _ => {
                            out.push(channel_voice_to_midi2(group, bytes));
                            return;
                        }
                    };
                    let lsb_value = if d1 == 6 {
                        state.data_msb = d2;
                        0
                    } else {
                        d2
                    };
                    let value14 = (u32::from(state.data_msb) << 7) | u32::from(lsb_value);
                    out.push(parameter_controller(
                        kind,
                        u4::new(group),
                        u4::new(channel),
                        msb,
                        lsb,
                        scale_up(value14, 14, 32),
                    ));
                }
                _ => out.push(channel_voice_to_midi2(group, bytes)),
            },
            0xC0 => {
                let bank = match (state.bank_msb, state.bank_lsb) {
                    (None, None) => None,
                    (msb, lsb) => Some(
                        (u16::from(msb.unwrap_or(0)) << 7) | u16::from(lsb.unwrap_or(0)),
                    ),
                };
                out.push(program_change(u4::new(group), u4::new(channel), d1, bank));
            }
            _ => out.push(channel_voice_to_midi2(group, bytes)),
        }
    }

    fn sysex7(&mut self, bytes: &[u8], out: &mut UmpPackets) -> Result<()> {
        let starts = bytes[0] == 0xF0;
        if !starts && !self.sysex_open {
            return Err(Error::malformed(bytes, "SysEx continuation without start"));
        }
        let body = if starts { &bytes[1..] } else { bytes };
        let (data, ends) = match body.strip_suffix(&[0xF7]) {
            Some(data) => (data, true),
            None => (body, false),
        };

        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[]]
        } else {
            data.chunks(6).collect()
        };
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.iter().enumerate() {
            let first = i == 0 && starts;
            let end = i == last && ends;
            let status: u8 = match (first, end) {
                (true, true) => 0x0,
                (true, false) => 0x1,
                (false, false) => 0x2,
                (false, true) => 0x3,
            };
            let mut d = [0u8; 6];
            d[..chunk.len()].copy_from_slice(chunk);
            let w0 = word0(
                3,
                self.group,
                (status << 4) | chunk.len() as u8,
                d[0],
                d[1],
            );
            let w1 = u32::from_be_bytes([d[2], d[3], d[4], d[5]]);
            out.push(packet(&[w0, w1]));
        }
        self.sysex_open = !ends;
        Ok(())
    }
}

/// Converts UMP packets into MIDI 1.0 byte messages.
///
/// SysEx7 packets are reassembled into one F0 .. F7 message. Packets
/// without a MIDI 1.0 equivalent (per-note controllers, per-note pitch
/// bend, flex data, stream messages) fail with `Unsupported`; utility
/// packets produce no output.
#[derive(Debug, Default)]
pub struct UmpToMidi1 {
    sysex: Option<Vec<u8>>,
}

impl UmpToMidi1 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.sysex = None;
    }

    /// Calls `emit` once per translated MIDI 1.0 message. Returns the number emitted.
    pub fn convert(&mut self, p: &UmpPacket, mut emit: impl FnMut(&[u8])) -> Result<usize> {
        let words = p.words();
        let w0 = words[0];
        let b1 = ((w0 >> 16) & 0xFF) as u8;
        let b2 = ((w0 >> 8) & 0x7F) as u8;
        let b3 = (w0 & 0x7F) as u8;

        match p.message_type() {
            UmpMessageType::System => {
                let len = message_len(b1)
                    .filter(|_| b1 >= 0xF1)
                    .ok_or_else(|| Error::malformed_ump(words, "Invalid system status"))?;
                emit(&[b1, b2, b3][..len]);
                Ok(1)
            }
            UmpMessageType::Midi1ChannelVoice => {
                let len = message_len(b1)
                    .filter(|_| (0x80..0xF0).contains(&b1))
                    .ok_or_else(|| Error::malformed_ump(words, "Invalid channel voice status"))?;
                emit(&[b1, b2, b3][..len]);
                Ok(1)
            }
            UmpMessageType::Data64 => self.sysex7(words, emit),
            UmpMessageType::Midi2ChannelVoice => Self::midi2(words, emit),
            // NOOP and jitter-reduction timestamps carry no message.
            UmpMessageType::Utility => Ok(0),
            other => {
                debug!("No MIDI 1.0 equivalent for UMP {:?}", other);
                Err(untranslatable(words))
            }
        }
    }

    fn sysex7(&mut self, words: &[u32], mut emit: impl FnMut(&[u8])) -> Result<usize> {
        let status = ((words[0] >> 20) & 0x0F) as u8;
        let count = ((words[0] >> 16) & 0x0F) as usize;
        if count > 6 {
            return Err(Error::malformed_ump(words, "SysEx7 byte count above 6"));
        }
        let raw = [
            (words[0] >> 8) as u8,
            words[0] as u8,
            (words[1] >> 24) as u8,
            (words[1] >> 16) as u8,
            (words[1] >> 8) as u8,
            words[1] as u8,
        ];
        let data = raw[..count].iter().map(|b| b & 0x7F);

        match status {
            0x0 => {
                let mut msg = Vec::with_capacity(count + 2);
                msg.push(0xF0);
                msg.extend(data);
                msg.push(0xF7);
                self.sysex = None;
                emit(&msg);
                Ok(1)
            }
            0x1 => {
                let mut msg = vec![0xF0];
                msg.extend(data);
                self.sysex = Some(msg);
                Ok(0)
            }
            0x2 | 0x3 => {
                let Some(msg) = self.sysex.as_mut() else {
                    return Err(Error::malformed_ump(words, "SysEx7 continuation without start"));
                };
                msg.extend(data);
                if status == 0x3 {
                    msg.push(0xF7);
                    if let Some(done) = self.sysex.take() {
                        emit(&done);
                    }
                    return Ok(1);
                }
                Ok(0)
            }
            _ => Err(Error::malformed_ump(words, "Invalid SysEx7 status")),
        }
    }

    fn midi2(words: &[u32], mut emit: impl FnMut(&[u8])) -> Result<usize> {
        let message = ChannelVoice2::try_from(words)
            .map_err(|_| Error::malformed_ump(words, "Invalid MIDI 2.0 channel voice message"))?;

        let sent = match message {
            ChannelVoice2::NoteOff(m) => {
                let channel = u8::from(m.channel());
                let vel = midi2_velocity_to_midi1(m.velocity());
                emit(&[0x80 | channel, u8::from(m.note_number()), vel]);
                1
            }
            ChannelVoice2::NoteOn(m) => {
                let channel = u8::from(m.channel());
                // Velocity 0 would turn the note-on into a note-off.
                let vel = midi2_velocity_to_midi1(m.velocity()).max(1);
                emit(&[0x90 | channel, u8::from(m.note_number()), vel]);
                1
            }
            ChannelVoice2::KeyPressure(m) => {
                let channel = u8::from(m.channel());
                let pressure = midi2_cc_to_midi1(m.key_pressure_data());
                emit(&[0xA0 | channel, u8::from(m.note_number()), pressure]);
                1
            }
            ChannelVoice2::ControlChange(m) => {
                let channel = u8::from(m.channel());
                let value = midi2_cc_to_midi1(m.control_change_data());
                emit(&[0xB0 | channel, u8::from(m.control()), value]);
                1
            }
            ChannelVoice2::ProgramChange(m) => {
                let channel = u8::from(m.channel());
                let mut sent = 0;
                if let Some(bank) = m.bank() {
                    let bank = u16::from(bank);
                    emit(&[0xB0 | channel, 0, ((bank >> 7) & 0x7F) as u8]);
                    emit(&[0xB0 | channel, 32, (bank & 0x7F) as u8]);
                    sent += 2;
                }
                emit(&[0xC0 | channel, u8::from(m.program())]);
                sent + 1
            }
            ChannelVoice2::ChannelPressure(m) => {
                let channel = u8::from(m.channel());
                emit(&[0xD0 | channel, midi2_cc_to_midi1(m.channel_pressure_data())]);
                1
            }
            ChannelVoice2::ChannelPitchBend(m) => {
                let channel = u8::from(m.channel());
                let bend = midi2_pitch_bend_to_midi1(m.pitch_bend_data());
                emit(&[0xE0 | channel, (bend & 0x7F) as u8, (bend >> 7) as u8]);
                1
            }
            ChannelVoice2::RegisteredController(m) => {
                let channel = u8::from(m.channel());
                let value = scale_down(m.controller_data(), 32, 14);
                emit_parameter(
                    &mut emit,
                    channel,
                    (101, 100),
                    u8::from(m.bank()),
                    u8::from(m.index()),
                    value,
                )
            }
            ChannelVoice2::AssignableController(m) => {
                let channel = u8::from(m.channel());
                let value = scale_down(m.controller_data(), 32, 14);
                emit_parameter(
                    &mut emit,
                    channel,
                    (99, 98),
                    u8::from(m.bank()),
                    u8::from(m.index()),
                    value,
                )
            }
            _ => {
                debug!("No MIDI 1.0 equivalent for MIDI 2.0 packet {:08X?}", words);
                return Err(untranslatable(words));
            }
        };
        Ok(sent)
    }
}

/// RPN/NRPN select followed by 14-bit data entry.
fn emit_parameter(
    emit: &mut impl FnMut(&[u8]),
    channel: u8,
    (select_msb, select_lsb): (u8, u8),
    bank: u8,
    index: u8,
    value: u32,
) -> usize {
    let cc = 0xB0 | channel;
    emit(&[cc, select_msb, bank]);
    emit(&[cc, select_lsb, index]);
    emit(&[cc, 6, ((value >> 7) & 0x7F) as u8]);
    emit(&[cc, 38, (value & 0x7F) as u8]);
    4
}

fn untranslatable(words: &[u32]) -> Error {
    Error::Unsupported(format!("no MIDI 1.0 equivalent for UMP {:08X?}", words))
}
