//! Running-status MIDI parser and event handlers (§4.H).
//!
//! Grounded on `examples/other_examples/071ef3a3_wmedrano-bats__bmidi-src-midi_message.rs.rs`
//! for the shape of a running-status byte-stream parser in Rust, adapted to
//! the exact semantics `original_source/VLSG/VLSG.c`'s `ProcessMidiData`
//! implements: a fixed 32-byte event buffer, 2/3-byte fixed-length events,
//! and `0xF7`-delimited SysEx.

use crate::channel::Channel;
use crate::constants::{section, DRUM_CHANNEL, CHANNEL_COUNT};
use crate::rom::Rom;
use crate::voice::VoicePool;

/// Mutable knobs SysEx vendor messages can change (§4.H, §4.K).
#[derive(Clone, Copy, Debug)]
pub struct RuntimeConfig {
    pub max_polyphony: usize,
    pub reverb_shift: Option<u32>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            max_polyphony: 24,
            reverb_shift: Some(1),
        }
    }
}

const EVENT_BUF_LEN: usize = 32;

/// Byte-stream MIDI parser. One instance per synthesis core; the producer's
/// bytes are fed through [`Dispatcher::feed_byte`] one at a time after
/// passing through the MIDI FIFO's timestamp framing.
pub struct Dispatcher {
    status: u8,
    buf: [u8; EVENT_BUF_LEN],
    len: usize,
    in_sysex: bool,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Dispatcher {
            status: 0,
            buf: [0; EVENT_BUF_LEN],
            len: 0,
            in_sysex: false,
        }
    }
}

fn expected_length(status: u8) -> Option<usize> {
    match status & 0xF0 {
        0x80 | 0x90 | 0xA0 | 0xB0 | 0xE0 => Some(3),
        0xC0 | 0xD0 => Some(2),
        _ => None,
    }
}

fn is_realtime(byte: u8) -> bool {
    (0xF8..=0xFF).contains(&byte)
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one byte through the running-status FSM, dispatching a
    /// complete event (and resetting the buffer for it) as soon as one is
    /// recognized. Real-time bytes outside `0xF0`/`0xF7` are ignored as
    /// §4.H specifies.
    pub fn feed_byte(
        &mut self,
        byte: u8,
        channels: &mut [Channel; CHANNEL_COUNT],
        voices: &mut VoicePool,
        rom: &mut Rom,
        config: &mut RuntimeConfig,
    ) {
        if is_realtime(byte) && byte != 0xF0 && byte != 0xF7 {
            return;
        }

        if byte == 0xF7 {
            if self.in_sysex && self.len < EVENT_BUF_LEN {
                self.buf[self.len] = byte;
                self.len += 1;
            }
            self.dispatch_sysex(channels, voices, config);
            self.in_sysex = false;
            self.len = 0;
            return;
        }

        if byte >= 0x80 {
            self.status = byte;
            self.buf[0] = byte;
            self.len = 1;
            self.in_sysex = byte == 0xF0;
            return;
        }

        if self.len == 0 {
            // Running status: no status byte seen yet for this data byte,
            // and no prior status captured either. Drop it.
            if self.status == 0 {
                return;
            }
            self.buf[0] = self.status;
            self.len = 1;
        }

        if self.len < EVENT_BUF_LEN {
            self.buf[self.len] = byte;
            self.len += 1;
        }

        if self.in_sysex {
            return; // terminated by 0xF7 above
        }

        if let Some(expected) = expected_length(self.status) {
            if self.len >= expected {
                self.dispatch_channel_event(channels, voices, rom);
                self.len = 1; // keep status byte for running status
            }
        }
    }

    fn dispatch_channel_event(
        &mut self,
        channels: &mut [Channel; CHANNEL_COUNT],
        voices: &mut VoicePool,
        rom: &mut Rom,
    ) {
        let status = self.buf[0];
        let channel_idx = (status & 0x0F) as usize;
        let kind = status & 0xF0;
        let d1 = self.buf[1];
        let d2 = if self.len > 2 { self.buf[2] } else { 0 };

        match kind {
            0x80 => handle_note_off(channel_idx, d1, channels, voices),
            0x90 => {
                if d2 == 0 {
                    handle_note_off(channel_idx, d1, channels, voices);
                } else {
                    handle_note_on(channel_idx, d1, d2, channels, voices, rom);
                }
            }
            0xB0 => handle_control_change(channel_idx, d1, d2, channels, voices),
            0xC0 => {
                channels[channel_idx].program = if channel_idx == DRUM_CHANNEL {
                    crate::constants::map_drum_kit_program(d1) as u16
                } else {
                    d1 as u16
                };
            }
            0xD0 => {
                channels[channel_idx].channel_pressure = d1 as i16;
            }
            0xE0 => {
                let value = ((d2 as i16) << 7 | d1 as i16) - 8192;
                channels[channel_idx].pitch_bend = value;
            }
            0xA0 => { /* polyphonic key pressure: not modeled further */ }
            _ => {}
        }
    }

    fn dispatch_sysex(
        &mut self,
        channels: &mut [Channel; CHANNEL_COUNT],
        voices: &mut VoicePool,
        config: &mut RuntimeConfig,
    ) {
        let msg = &self.buf[..self.len];
        const GM_RESET: [u8; 6] = [0xF0, 0x7E, 0x7F, 0x09, 0x01, 0xF7];
        const GS_RESET: [u8; 11] = [0xF0, 0x41, 0x10, 0x42, 0x12, 0x40, 0x00, 0x7F, 0x00, 0x41, 0xF7];
        const VENDOR_PREFIX: [u8; 4] = [0xF0, 0x44, 0x0E, 0x03];

        if msg == GM_RESET || msg == GS_RESET {
            voices.all_sounds_off();
            for ch in channels.iter_mut() {
                ch.reset_all();
            }
            return;
        }

        // Three sibling vendor-message checks share the same `F0 44 0E 03`
        // prefix. The original has three consecutive `if` blocks here, each
        // returning on match; only the first reachable one ever fires for
        // a given suffix byte, and that ordering is preserved deliberately
        // rather than merged into one `match` (§9).
        if msg.len() == 6 && msg[..4] == VENDOR_PREFIX {
            let sub = msg[4];
            if (0x10..=0x13).contains(&sub) {
                config.max_polyphony = crate::constants::polyphony_for_selector(
                    match sub {
                        0x11 => 0x11,
                        0x12 => 0x12,
                        0x13 => 0x13,
                        _ => 0x10,
                    },
                );
                voices.set_max_polyphony(config.max_polyphony);
                return;
            }
        }
        if msg.len() == 6 && msg[..4] == VENDOR_PREFIX {
            let sub = msg[4];
            if (0x20..=0x22).contains(&sub) {
                config.reverb_shift = crate::constants::reverb_shift_for_selector(sub as u32);
                return;
            }
        }
        if msg.len() == 6 && msg[..4] == VENDOR_PREFIX {
            let sub = msg[4];
            if (0x40..=0x4A).contains(&sub) {
                // Effect-type selection: no further state modeled beyond
                // accepting the message (§3: out of scope beyond reverb).
                return;
            }
        }
        // Unknown SysEx is dropped (§4.H).
    }
}

/// Reads a program's second-layer stacking flag straight out of its ROM
/// data record (§4.H: `stru6_data[1] & 0x8000`). `stru6_data` is the
/// program's two-word header at the front of its section-1 record; the
/// second word's top bit marks instruments that stack a layer-1 voice on
/// top of layer 0.
fn program_has_second_layer(rom: &mut Rom, program: u16) -> bool {
    rom.seek(section::PROGRAM_DATA, program as i32);
    let _stru6_word0 = rom.read_u16();
    let stru6_word1 = rom.read_u16();
    stru6_word1 & 0x8000 != 0
}

fn handle_note_on(
    channel_idx: usize,
    note: u8,
    velocity: u8,
    channels: &mut [Channel; CHANNEL_COUNT],
    voices: &mut VoicePool,
    rom: &mut Rom,
) {
    let is_drum = channel_idx == DRUM_CHANNEL;
    let pan = channels[channel_idx].pan;

    if is_drum {
        let slot = voices.find_available();
        start_voice(voices, slot, (2 * channel_idx) as u8, note, velocity, rom, pan, is_drum);
        return;
    }

    let program = channels[channel_idx].program;
    let slot = voices.find_available();
    start_voice(voices, slot, (2 * channel_idx) as u8, note, velocity, rom, pan, is_drum);

    // Dual-layer stacking (§4.H): instruments with the second-layer flag
    // set in their ROM data allocate a second voice on layer 1, seeded
    // from the same note/velocity/pan as layer 0.
    if program_has_second_layer(rom, program) {
        let layer1_slot = voices.find_available();
        start_voice(
            voices,
            layer1_slot,
            (2 * channel_idx + 1) as u8,
            note,
            velocity,
            rom,
            pan,
            is_drum,
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn start_voice(
    voices: &mut VoicePool,
    slot: usize,
    channel_layer: u8,
    note: u8,
    velocity: u8,
    rom: &mut Rom,
    pan: i16,
    is_drum: bool,
) {
    let v = &mut voices.voices[slot];
    v.note = note;
    v.velocity = velocity;
    v.channel_layer = channel_layer;
    v.flags.reset_segments();
    v.flags.set_note_off(false);
    v.flags.set_held_by_pedal(false);
    v.window = [0; 4];
    v.amp_smoothed = 0;
    v.env_amp = 0;
    v.amp_mult = 0;
    crate::envelope::start_envelopes(v, rom, note, velocity, pan, is_drum);
}

fn handle_note_off(
    channel_idx: usize,
    note: u8,
    channels: &mut [Channel; CHANNEL_COUNT],
    voices: &mut VoicePool,
) {
    if channel_idx == DRUM_CHANNEL {
        // Only program 7, note 88 (Applause/Orchestra Kit) releases on the
        // drum channel (§4.H).
        if channels[DRUM_CHANNEL].program != 7 || note != 88 {
            return;
        }
    }

    for layer in 0..2u8 {
        let channel_layer = 2 * channel_idx as u8 + layer;
        if let Some(idx) = voices.find_voice(channel_layer, note) {
            let pedal_down = channels[channel_idx].pedals.intersects(
                crate::channel::PedalFlags::SUSTAIN | crate::channel::PedalFlags::SOSTENUTO,
            );
            let v = &mut voices.voices[idx];
            v.flags.set_note_off(true);
            v.flags.set_held_by_pedal(pedal_down);
        }
    }
}

fn handle_control_change(
    channel_idx: usize,
    cc: u8,
    value: u8,
    channels: &mut [Channel; CHANNEL_COUNT],
    voices: &mut VoicePool,
) {
    use crate::channel::PedalFlags;
    let ch = &mut channels[channel_idx];
    match cc {
        1 => ch.modulation = value as i16,
        6 => {
            ch.data_msb = value;
            ch.apply_rpn_data_entry();
        }
        7 => ch.volume = value as i16,
        10 => ch.pan = value as i16 - 64,
        11 => ch.expression = value as i16,
        26 => {
            ch.data_lsb = value;
            ch.apply_rpn_data_entry();
        }
        38 => { /* data entry LSB, fine-grained; folded into 6/38 pairs via data_lsb above */ }
        64 => set_pedal(ch, voices, channel_idx, PedalFlags::SUSTAIN, value),
        66 => set_pedal(ch, voices, channel_idx, PedalFlags::SOSTENUTO, value),
        67 => set_pedal(ch, voices, channel_idx, PedalFlags::SOFT, value),
        98 | 99 => ch.select_nrpn(),
        100 => ch.rpn_lsb = value,
        101 => ch.rpn_msb = value,
        120 => voices.all_sounds_off(),
        121 => ch.reset_controllers(),
        123 => voices.all_notes_off(),
        _ => {}
    }
}

fn set_pedal(
    ch: &mut Channel,
    voices: &mut VoicePool,
    channel_idx: usize,
    pedal: crate::channel::PedalFlags,
    value: u8,
) {
    let was_down = ch.pedals.contains(pedal);
    let down = value >= 64;
    ch.pedals.set(pedal, down);

    if was_down && !down {
        // Pedal released: execute any deferred releases for this channel
        // that are no longer held by any pedal (§8 boundary behavior).
        let still_held = ch.pedals.intersects(PedalFlags::SUSTAIN | PedalFlags::SOSTENUTO);
        if !still_held {
            for layer in 0..2u8 {
                let channel_layer = 2 * channel_idx as u8 + layer;
                for v in voices.voices.iter_mut() {
                    if v.channel_layer == channel_layer && v.flags.note_off() {
                        v.flags.set_held_by_pedal(false);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::ROM_SIZE;

    fn ctx() -> ([Channel; CHANNEL_COUNT], VoicePool, Vec<u8>, RuntimeConfig) {
        (
            std::array::from_fn(|_| Channel::new()),
            VoicePool::new(24),
            vec![0u8; ROM_SIZE],
            RuntimeConfig::default(),
        )
    }

    /// A ROM whose program 0 record sets the second-layer stacking bit
    /// (`stru6_data[1] & 0x8000`) so `program_has_second_layer` fires.
    fn rom_with_dual_layer_program() -> Vec<u8> {
        let mut rom = vec![0u8; ROM_SIZE];
        let entry =
            crate::constants::ROM_DIRECTORY_OFFSET as usize + 4 * section::PROGRAM_DATA as usize;
        let table_base: u32 = 0x2000;
        rom[entry] = 0;
        rom[entry + 1] = (table_base & 0xFF) as u8;
        rom[entry + 2] = ((table_base >> 8) & 0xFF) as u8;
        rom[entry + 3] = ((table_base >> 16) & 0xFF) as u8;

        let stride: u16 = 8;
        rom[table_base as usize + 2] = (stride & 0xFF) as u8;
        rom[table_base as usize + 3] = (stride >> 8) as u8;

        let rec = table_base as usize + 4; // program 0's record (index 0)
        let word1: u16 = 0x8000;
        rom[rec + 2] = (word1 & 0xFF) as u8;
        rom[rec + 3] = (word1 >> 8) as u8;
        rom
    }

    #[test]
    fn note_on_then_off_allocates_and_releases_a_voice() {
        let (mut channels, mut voices, rom_bytes, mut config) = ctx();
        let mut rom = Rom::new(&rom_bytes);
        let mut d = Dispatcher::new();
        for &b in &[0x90, 60, 100] {
            d.feed_byte(b, &mut channels, &mut voices, &mut rom, &mut config);
        }
        assert_eq!(voices.active_count(), 1);

        for &b in &[0x80, 60, 0] {
            d.feed_byte(b, &mut channels, &mut voices, &mut rom, &mut config);
        }
        assert!(voices.voices.iter().any(|v| !v.is_free() && v.flags.note_off()));
    }

    #[test]
    fn dual_layer_program_allocates_a_second_voice_on_layer_1() {
        let (mut channels, mut voices, _blank, mut config) = ctx();
        let rom_bytes = rom_with_dual_layer_program();
        let mut rom = Rom::new(&rom_bytes);
        let mut d = Dispatcher::new();
        for &b in &[0x90, 60, 100] {
            d.feed_byte(b, &mut channels, &mut voices, &mut rom, &mut config);
        }
        assert_eq!(voices.active_count(), 2);
        assert!(voices.find_voice(0, 60).is_some());
        assert!(voices.find_voice(1, 60).is_some());
    }

    #[test]
    fn non_stacking_program_allocates_only_one_voice() {
        let (mut channels, mut voices, rom_bytes, mut config) = ctx();
        let mut rom = Rom::new(&rom_bytes);
        let mut d = Dispatcher::new();
        for &b in &[0x90, 60, 100] {
            d.feed_byte(b, &mut channels, &mut voices, &mut rom, &mut config);
        }
        assert_eq!(voices.active_count(), 1);
    }

    #[test]
    fn program_change_on_drum_channel_maps_through_kit_lut() {
        let (mut channels, mut voices, rom_bytes, mut config) = ctx();
        let mut rom = Rom::new(&rom_bytes);
        let mut d = Dispatcher::new();
        let status = 0xC0 | DRUM_CHANNEL as u8;
        for &b in &[status, 20] {
            // Between kit entries 16 and 24; maps down to index 2.
            d.feed_byte(b, &mut channels, &mut voices, &mut rom, &mut config);
        }
        assert_eq!(channels[DRUM_CHANNEL].program, 2);
    }

    #[test]
    fn note_on_velocity_zero_is_note_off() {
        let (mut channels, mut voices, rom_bytes, mut config) = ctx();
        let mut rom = Rom::new(&rom_bytes);
        let mut d = Dispatcher::new();
        for &b in &[0x90, 60, 100] {
            d.feed_byte(b, &mut channels, &mut voices, &mut rom, &mut config);
        }
        for &b in &[0x90, 60, 0] {
            d.feed_byte(b, &mut channels, &mut voices, &mut rom, &mut config);
        }
        assert!(voices.voices.iter().any(|v| !v.is_free() && v.flags.note_off()));
    }

    #[test]
    fn running_status_reuses_prior_status_byte() {
        let (mut channels, mut voices, rom_bytes, mut config) = ctx();
        let mut rom = Rom::new(&rom_bytes);
        let mut d = Dispatcher::new();
        for &b in &[0x90, 60, 100, 61, 100] {
            d.feed_byte(b, &mut channels, &mut voices, &mut rom, &mut config);
        }
        assert_eq!(voices.active_count(), 2);
    }

    #[test]
    fn control_change_volume_updates_channel() {
        let (mut channels, mut voices, rom_bytes, mut config) = ctx();
        let mut rom = Rom::new(&rom_bytes);
        let mut d = Dispatcher::new();
        for &b in &[0xB0, 7, 50] {
            d.feed_byte(b, &mut channels, &mut voices, &mut rom, &mut config);
        }
        assert_eq!(channels[0].volume, 50);
    }

    #[test]
    fn sustain_pedal_keeps_released_voice_alive_until_released() {
        let (mut channels, mut voices, rom_bytes, mut config) = ctx();
        let mut rom = Rom::new(&rom_bytes);
        let mut d = Dispatcher::new();
        for &b in &[0x90, 60, 100] {
            d.feed_byte(b, &mut channels, &mut voices, &mut rom, &mut config);
        }
        for &b in &[0xB0, 64, 127] {
            d.feed_byte(b, &mut channels, &mut voices, &mut rom, &mut config);
        }
        for &b in &[0x80, 60, 0] {
            d.feed_byte(b, &mut channels, &mut voices, &mut rom, &mut config);
        }
        let v = voices.voices.iter().find(|v| !v.is_free()).unwrap();
        assert!(v.flags.note_off());
        assert!(v.flags.held_by_pedal());

        for &b in &[0xB0, 64, 0] {
            d.feed_byte(b, &mut channels, &mut voices, &mut rom, &mut config);
        }
        let v = voices.voices.iter().find(|v| !v.is_free()).unwrap();
        assert!(!v.flags.held_by_pedal());
    }

    #[test]
    fn gm_reset_clears_channels_and_voices() {
        let (mut channels, mut voices, rom_bytes, mut config) = ctx();
        let mut rom = Rom::new(&rom_bytes);
        let mut d = Dispatcher::new();
        for &b in &[0x90, 60, 100] {
            d.feed_byte(b, &mut channels, &mut voices, &mut rom, &mut config);
        }
        channels[0].volume = 5;
        for &b in &[0xF0, 0x7E, 0x7F, 0x09, 0x01, 0xF7] {
            d.feed_byte(b, &mut channels, &mut voices, &mut rom, &mut config);
        }
        assert_eq!(voices.active_count(), 0);
        assert_eq!(channels[0].volume, 100);
    }

    #[test]
    fn vendor_sysex_changes_polyphony() {
        let (mut channels, mut voices, rom_bytes, mut config) = ctx();
        let mut rom = Rom::new(&rom_bytes);
        let mut d = Dispatcher::new();
        for &b in &[0xF0, 0x44, 0x0E, 0x03, 0x13, 0xF7] {
            d.feed_byte(b, &mut channels, &mut voices, &mut rom, &mut config);
        }
        assert_eq!(config.max_polyphony, 64);
    }

    #[test]
    fn drum_channel_note_off_only_releases_kit_88() {
        let (mut channels, mut voices, rom_bytes, mut config) = ctx();
        let mut rom = Rom::new(&rom_bytes);
        channels[DRUM_CHANNEL].program = 0;
        let mut d = Dispatcher::new();
        let status_on = 0x90 | DRUM_CHANNEL as u8;
        for &b in &[status_on, 88, 100] {
            d.feed_byte(b, &mut channels, &mut voices, &mut rom, &mut config);
        }
        let status_off = 0x80 | DRUM_CHANNEL as u8;
        for &b in &[status_off, 88, 0] {
            d.feed_byte(b, &mut channels, &mut voices, &mut rom, &mut config);
        }
        // program != 7, so the note-off is ignored.
        assert!(voices.voices.iter().any(|v| !v.is_free() && !v.flags.note_off()));
    }
}
