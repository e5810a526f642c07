//! Control-rate tick scheduler: 8 phases, 4 per audio block (§4.I).

use crate::channel::Channel;
use crate::constants::CHANNEL_COUNT;
use crate::envelope::{lookup_note_offset, refresh_amp_scale, refresh_out_mult, step_amp, step_pitch};
use crate::rom::Rom;
use crate::voice::VoicePool;
use crate::wavetable::{compute_rate, FreqTables};

/// Tracks the rolling 3-bit phase counter (§4.I).
#[derive(Default)]
pub struct Scheduler {
    phase: u8,
}

/// ROM-table-driven LFO rate lookup would live in `Rom` section data; here
/// the per-voice `field_5a`-indexed rate is modeled as a simple table the
/// engine owns, mirroring the "rateTable[field_5a+112]" reference in §4.I.
pub const LFO_RATE_TABLE_LEN: usize = 256;

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.phase = 0;
    }

    /// Runs one of the eight control-rate phases across all voices (§4.I).
    #[allow(clippy::too_many_arguments)]
    pub fn tick(
        &mut self,
        voices: &mut VoicePool,
        channels: &[Channel; CHANNEL_COUNT],
        lfo_rate_table: &[i16; LFO_RATE_TABLE_LEN],
        tables: &FreqTables,
        freq_selector: u32,
        rom: &mut Rom,
    ) {
        let phase = self.phase & 0x07;

        for v in voices.voices.iter_mut() {
            if v.is_free() {
                continue;
            }
            let channel_idx = (v.channel_layer as usize / 2).min(CHANNEL_COUNT - 1);
            let ch = &channels[channel_idx];
            let note_offset = lookup_note_offset(rom, v.note);
            let velocity_curve = v.velocity_scale as i32;

            // A fully-decayed amplitude envelope frees the voice outright
            // (§4.E: "when amplitude reaches target with target=0 and
            // current=0, the voice is freed"); every other phase action is
            // skipped once that happens this tick.
            let ended = match phase {
                0 => {
                    let rate_idx = (v.field_5a as usize + 112) % LFO_RATE_TABLE_LEN;
                    v.lfo_phase = v.lfo_phase.wrapping_add(lfo_rate_table[rate_idx]);
                    step_amp(v, rom, note_offset, velocity_curve)
                }
                1 | 5 => {
                    let ended = step_amp(v, rom, note_offset, velocity_curve);
                    step_pitch(v, rom, note_offset);
                    ended
                }
                2 | 6 => step_amp(v, rom, note_offset, velocity_curve),
                3 | 7 => {
                    let ended = step_amp(v, rom, note_offset, velocity_curve);
                    rebuild_phase_increment(v, ch, tables, freq_selector);
                    ended
                }
                4 => {
                    refresh_amp_scale(v, ch, v.velocity_scale);
                    step_amp(v, rom, note_offset, velocity_curve)
                }
                _ => unreachable!(),
            };

            if ended {
                v.free();
                continue;
            }
            refresh_out_mult(v);
        }

        self.phase = self.phase.wrapping_add(1);
    }
}

/// Phase-increment rebuild (§4.I): clamps the LFO/pressure/modulation mix
/// to `[0, 127]` then recomputes the voice's phase rate.
fn rebuild_phase_increment(
    v: &mut crate::voice::Voice,
    ch: &Channel,
    tables: &FreqTables,
    freq_selector: u32,
) {
    let lfo_mix = ((v.field_58 as i32) + ch.channel_pressure as i32 + ch.modulation as i32)
        .clamp(0, 127);
    let lfo_term = (lfo_mix * ((v.lfo_phase as i32) >> 8)) >> 7;
    let pitch_term = (v.pitch_current as i32) >> 3;
    let pitch_256ths = (v.base_pitch as i64) * 256
        + (ch.coarse_tune as i64) * 256
        + ch.fine_tune as i64
        + ((ch.pitch_bend as i64 * ch.pitch_bend_sense as i64) >> 13)
        + lfo_term as i64
        + pitch_term as i64;
    v.rate = compute_rate(pitch_256ths, tables, freq_selector);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_rom() -> Vec<u8> {
        vec![0u8; crate::constants::ROM_SIZE]
    }

    #[test]
    fn phase_cycles_through_eight_values() {
        let mut sched = Scheduler::new();
        let mut voices = VoicePool::new(24);
        let channels: [Channel; CHANNEL_COUNT] = std::array::from_fn(|_| Channel::new());
        let lfo = [0i16; LFO_RATE_TABLE_LEN];
        let tables = FreqTables::build();
        let rom_bytes = blank_rom();
        let mut rom = Rom::new(&rom_bytes);
        for expected in 0..16u8 {
            assert_eq!(sched.phase & 0x07, expected % 8);
            sched.tick(&mut voices, &channels, &lfo, &tables, 2, &mut rom);
        }
    }

    #[test]
    fn tick_is_a_no_op_over_an_empty_pool() {
        let mut sched = Scheduler::new();
        let mut voices = VoicePool::new(24);
        let channels: [Channel; CHANNEL_COUNT] = std::array::from_fn(|_| Channel::new());
        let lfo = [0i16; LFO_RATE_TABLE_LEN];
        let tables = FreqTables::build();
        let rom_bytes = blank_rom();
        let mut rom = Rom::new(&rom_bytes);
        sched.tick(&mut voices, &channels, &lfo, &tables, 2, &mut rom);
        assert_eq!(voices.active_count(), 0);
    }

    #[test]
    fn a_voice_decayed_to_silence_is_freed() {
        let mut sched = Scheduler::new();
        let mut voices = VoicePool::new(24);
        let channels: [Channel; CHANNEL_COUNT] = std::array::from_fn(|_| Channel::new());
        let lfo = [0i16; LFO_RATE_TABLE_LEN];
        let tables = FreqTables::build();
        let rom_bytes = blank_rom();
        let mut rom = Rom::new(&rom_bytes);

        voices.voices[0].note = 60;
        voices.voices[0].amp_current = 0;
        voices.voices[0].amp_target = 0;
        voices.voices[0].amp_rate = 0;

        sched.tick(&mut voices, &channels, &lfo, &tables, 2, &mut rom);
        assert!(voices.voices[0].is_free());
    }
}
