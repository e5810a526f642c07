//! Voice control blocks and the 64-slot voice pool (§3, §4.D).

use crate::constants::{DRUM_CHANNEL, MAX_VOICES, VOICE_FREE};

/// Bit-packed voice state: 3 bits of pitch-envelope segment, 3 bits of
/// amplitude-envelope segment, a release gate bit, and a note-off bit.
/// Kept as a single newtype rather than four booleans because the low six
/// bits are used directly as ROM envelope-table segment indices (§9).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VoiceFlags(u8);

impl VoiceFlags {
    const PITCH_SEG_MASK: u8 = 0x07;
    const AMP_SEG_SHIFT: u8 = 3;
    const AMP_SEG_MASK: u8 = 0x38;
    /// Set while the voice is held open by a sustain/sostenuto pedal after
    /// its NoteOff arrived (§3: "release flag (bit 6)").
    const RELEASED_BY_PEDAL: u8 = 0x40;
    /// Set once NoteOff has been received, independent of the pedal gate.
    const NOTE_OFF: u8 = 0x80;

    pub fn pitch_segment(self) -> u8 {
        self.0 & Self::PITCH_SEG_MASK
    }

    pub fn set_pitch_segment(&mut self, segment: u8) {
        self.0 = (self.0 & !Self::PITCH_SEG_MASK) | (segment & Self::PITCH_SEG_MASK);
    }

    pub fn amp_segment(self) -> u8 {
        (self.0 & Self::AMP_SEG_MASK) >> Self::AMP_SEG_SHIFT
    }

    pub fn set_amp_segment(&mut self, segment: u8) {
        self.0 = (self.0 & !Self::AMP_SEG_MASK) | ((segment << Self::AMP_SEG_SHIFT) & Self::AMP_SEG_MASK);
    }

    pub fn held_by_pedal(self) -> bool {
        self.0 & Self::RELEASED_BY_PEDAL != 0
    }

    pub fn set_held_by_pedal(&mut self, value: bool) {
        if value {
            self.0 |= Self::RELEASED_BY_PEDAL;
        } else {
            self.0 &= !Self::RELEASED_BY_PEDAL;
        }
    }

    pub fn note_off(self) -> bool {
        self.0 & Self::NOTE_OFF != 0
    }

    pub fn set_note_off(&mut self, value: bool) {
        if value {
            self.0 |= Self::NOTE_OFF;
        } else {
            self.0 &= !Self::NOTE_OFF;
        }
    }

    /// Resets both envelope segment indices to 0 while preserving the
    /// release/note-off bits, as happens when (re)triggering a voice.
    pub fn reset_segments(&mut self) {
        self.0 &= !(Self::PITCH_SEG_MASK | Self::AMP_SEG_MASK);
    }
}

/// One of the 64 voice control blocks (§3).
#[derive(Clone, Debug)]
pub struct Voice {
    /// `2*channel | layer`; meaningless while the voice is free.
    pub channel_layer: u8,
    /// MIDI note number, or [`VOICE_FREE`] when the slot is unused.
    pub note: u8,
    pub velocity: u8,

    /// 22.10 fixed-point sample phase; `phase >> 10` is the integer ROM
    /// position, `phase & 0x3FF` the fractional part (§4.F).
    pub phase: u32,
    pub rate: u32,
    pub loop_start: u32,
    pub loop_end: u32,

    /// Four-entry ADPCM interpolation window (§3, §4.F).
    pub window: [i32; 4],
    pub block_shift: i32,
    pub block_ptr: u32,

    /// One-pole smoothed copy of `amp_mult` carried between samples (§4.F
    /// step 4).
    pub amp_smoothed: i32,

    /// Interpolated envelope-table amplitude (`field_28`, §4.E).
    pub env_amp: i32,
    /// Composite per-sample amplitude (`field_38`, §4.E/§4.F).
    pub amp_mult: i32,
    /// Per-sample amplitude multiplier refreshed on phase 4 (`field_64`,
    /// §4.E).
    pub amp_scale: i32,
    /// L/R pan attenuation shifts (`field_30`/`field_34`, §3).
    pub pan_shift_l: i32,
    pub pan_shift_r: i32,

    /// Pitch/mod envelope (`field_48` target, `field_4a` rate, `field_4c`
    /// current, §4.E).
    pub pitch_target: i16,
    pub pitch_rate: i16,
    pub pitch_current: i16,

    /// Amplitude envelope (`field_4e` target hi byte, `field_50` rate,
    /// `field_52` current, §4.E).
    pub amp_target: u16,
    pub amp_rate: i16,
    pub amp_current: i16,

    /// LFO phase accumulator (`field_54`, §4.I).
    pub lfo_phase: i16,
    /// Four pitch/level offsets derived from program data (§3).
    pub field_56: i16,
    pub field_58: i16,
    pub field_5a: i16,
    pub field_5c: u16,
    pub field_5e: u16,

    /// Base pitch used by the phase-increment rebuild (§4.I).
    pub base_pitch: i16,
    pub velocity_scale: i16,

    pub flags: VoiceFlags,
}

impl Default for Voice {
    fn default() -> Self {
        Voice {
            channel_layer: 0,
            note: VOICE_FREE,
            velocity: 0,
            phase: 0,
            rate: 0,
            loop_start: 0,
            loop_end: 0,
            window: [0; 4],
            block_shift: 0,
            block_ptr: 0,
            amp_smoothed: 0,
            env_amp: 0,
            amp_mult: 0,
            amp_scale: 0,
            pan_shift_l: 0,
            pan_shift_r: 0,
            pitch_target: 0,
            pitch_rate: 0,
            pitch_current: 0,
            amp_target: 0,
            amp_rate: 0,
            amp_current: 0,
            lfo_phase: 0,
            field_56: 0,
            field_58: 0,
            field_5a: 0,
            field_5c: 0,
            field_5e: 0,
            base_pitch: 0,
            velocity_scale: 0,
            flags: VoiceFlags::default(),
        }
    }
}

impl Voice {
    pub fn is_free(&self) -> bool {
        self.note == VOICE_FREE
    }

    pub fn free(&mut self) {
        self.note = VOICE_FREE;
        self.env_amp = 0;
        self.amp_mult = 0;
    }

    pub fn matches(&self, channel_layer: u8, note: u8) -> bool {
        !self.is_free() && self.channel_layer == channel_layer && self.note == note
    }
}

/// The 64-slot voice pool and its allocation/stealing policy (§4.D).
pub struct VoicePool {
    pub voices: [Voice; MAX_VOICES],
    pub max_polyphony: usize,
    /// Round-robin cursor that prevents the just-started voice from being
    /// immediately re-stolen.
    pub recent: usize,
}

impl Default for VoicePool {
    fn default() -> Self {
        VoicePool::new(24)
    }
}

impl VoicePool {
    pub fn new(max_polyphony: usize) -> Self {
        VoicePool {
            voices: std::array::from_fn(|_| Voice::default()),
            max_polyphony: max_polyphony.min(MAX_VOICES),
            recent: 0,
        }
    }

    pub fn reset(&mut self) {
        for v in &mut self.voices {
            *v = Voice::default();
        }
        self.recent = 0;
    }

    pub fn active_count(&self) -> usize {
        self.voices.iter().filter(|v| !v.is_free()).count()
    }

    /// `find_available` (§4.D): scans circularly from `recent+1`, returning
    /// in priority order a free slot, else a released voice, else any drum
    /// voice, else the cursor position itself. Slot selection is channel-
    /// blind by design: the scan order depends only on voice state.
    pub fn find_available(&mut self) -> usize {
        let n = MAX_VOICES;
        let mut free_slot = None;
        let mut released_slot = None;
        let mut drum_slot = None;

        for step in 1..=n {
            let idx = (self.recent + step) % n;
            let v = &self.voices[idx];
            if v.is_free() {
                free_slot = Some(idx);
                break;
            }
            if released_slot.is_none() && v.flags.note_off() && !v.flags.held_by_pedal() {
                released_slot = Some(idx);
            }
            if drum_slot.is_none() && (v.channel_layer as usize) / 2 == DRUM_CHANNEL {
                drum_slot = Some(idx);
            }
        }

        let chosen = free_slot
            .or(released_slot)
            .or(drum_slot)
            .unwrap_or((self.recent + 1) % n);
        self.recent = chosen;
        chosen
    }

    /// `find_voice` (§4.D): linear scan for an active, non-released voice
    /// matching both the channel/layer key and the note.
    pub fn find_voice(&self, channel_layer: u8, note: u8) -> Option<usize> {
        self.voices.iter().position(|v| {
            !v.is_free() && v.channel_layer == channel_layer && v.note == note && !v.flags.note_off()
        })
    }

    /// `defragment` (§4.D): compacts active voices to the front, preserving
    /// relative order, so that after this call active entries occupy
    /// `[0, active_count)`.
    pub fn defragment(&mut self) {
        let mut write = 0usize;
        for read in 0..MAX_VOICES {
            if !self.voices[read].is_free() {
                if write != read {
                    self.voices.swap(write, read);
                }
                write += 1;
            }
        }
        self.recent = 0;
    }

    /// `reduce_to` (§4.D): kills released voices first, in circular order
    /// from the cursor, then any voice, until `active_count() <= n`.
    pub fn reduce_to(&mut self, n: usize) {
        let total = MAX_VOICES;
        for step in 1..=total {
            if self.active_count() <= n {
                return;
            }
            let idx = (self.recent + step) % total;
            if !self.voices[idx].is_free() && self.voices[idx].flags.note_off() {
                self.voices[idx].free();
            }
        }
        for step in 1..=total {
            if self.active_count() <= n {
                return;
            }
            let idx = (self.recent + step) % total;
            if !self.voices[idx].is_free() {
                self.voices[idx].free();
            }
        }
    }

    /// `SetMaximumVoices`: trims to the new ceiling, defragments, and
    /// adopts it (§4.D, §4.J).
    pub fn set_max_polyphony(&mut self, n: usize) {
        let n = n.min(MAX_VOICES);
        self.reduce_to(n);
        self.defragment();
        self.max_polyphony = n;
    }

    pub fn all_notes_off(&mut self) {
        for v in &mut self.voices {
            if !v.is_free() {
                v.flags.set_note_off(true);
            }
        }
    }

    pub fn all_sounds_off(&mut self) {
        for v in &mut self.voices {
            v.free();
        }
        self.recent = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_round_trip_segments() {
        let mut f = VoiceFlags::default();
        f.set_pitch_segment(5);
        f.set_amp_segment(3);
        f.set_held_by_pedal(true);
        f.set_note_off(true);
        assert_eq!(f.pitch_segment(), 5);
        assert_eq!(f.amp_segment(), 3);
        assert!(f.held_by_pedal());
        assert!(f.note_off());
        f.reset_segments();
        assert_eq!(f.pitch_segment(), 0);
        assert_eq!(f.amp_segment(), 0);
        assert!(f.held_by_pedal());
        assert!(f.note_off());
    }

    #[test]
    fn pool_starts_fully_free() {
        let pool = VoicePool::new(24);
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn find_available_prefers_free_slot() {
        let mut pool = VoicePool::new(24);
        let idx = pool.find_available();
        assert!(pool.voices[idx].is_free());
    }

    #[test]
    fn defragment_compacts_active_voices_to_front() {
        let mut pool = VoicePool::new(24);
        pool.voices[5].note = 60;
        pool.voices[10].note = 64;
        pool.defragment();
        assert_eq!(pool.active_count(), 2);
        assert!(!pool.voices[0].is_free());
        assert!(!pool.voices[1].is_free());
        for v in &pool.voices[2..] {
            assert!(v.is_free());
        }
    }

    #[test]
    fn reduce_to_kills_released_voices_first() {
        let mut pool = VoicePool::new(24);
        for i in 0..4 {
            pool.voices[i].note = 60 + i as u8;
        }
        pool.voices[1].flags.set_note_off(true);
        pool.reduce_to(3);
        assert_eq!(pool.active_count(), 3);
        assert!(pool.voices[1].is_free());
    }

    #[test]
    fn set_max_polyphony_caps_active_count() {
        let mut pool = VoicePool::new(24);
        for i in 0..10 {
            pool.voices[i].note = 40 + i as u8;
        }
        pool.set_max_polyphony(4);
        assert!(pool.active_count() <= 4);
        assert_eq!(pool.max_polyphony, 4);
    }
}
