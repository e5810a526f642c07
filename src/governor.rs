//! Wall-clock-driven polyphony governor and drift-compensating virtual
//! clock (§4.J, §9).

use crate::voice::VoicePool;

/// How many callbacks the drift estimator's moving target spans (§4.J,
/// §9: "a 7-callback moving target").
const DRIFT_WINDOW: i64 = 7;

/// State carried between `fill_output_buffer` calls to track drift between
/// the caller's wall clock and the synthesizer's notion of "now" (§4.J).
pub struct Governor {
    tick_count: i64,
    interval_estimate: i64,
    last_wall_time: i64,
    last_virtual_time: i64,
    first_call: bool,
    pub system_time: i64,
}

impl Default for Governor {
    fn default() -> Self {
        Governor {
            tick_count: 0,
            interval_estimate: 0,
            last_wall_time: 0,
            last_virtual_time: 0,
            first_call: true,
            system_time: 0,
        }
    }
}

impl Governor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Updates the drift estimator at the start of a callback and returns
    /// the synthesizer's corrected "now" to use for MIDI staleness tests
    /// (§4.J, §9).
    pub fn begin_callback(&mut self, wall_time_ms: i64) -> i64 {
        if self.first_call || wall_time_ms - self.last_wall_time > 200 {
            self.tick_count = 0;
            self.last_virtual_time = wall_time_ms;
            self.last_wall_time = wall_time_ms;
            self.first_call = false;
        }

        if self.tick_count >= 512 {
            self.tick_count = 0;
            self.last_virtual_time += self.interval_estimate;
            let target = DRIFT_WINDOW * self.interval_estimate - self.last_wall_time + wall_time_ms;
            let delta = wall_time_ms - self.last_virtual_time;
            let nudge = delta.abs() >> 4;
            let corrected = if delta >= 0 {
                target + nudge
            } else {
                target - nudge
            };
            self.last_wall_time = wall_time_ms;
            self.interval_estimate = (corrected >> 3) + ((corrected & 4) >> 2);
        }

        self.tick_count += 1;
        self.system_time =
            ((self.tick_count * self.interval_estimate) >> 9) + self.last_virtual_time;
        self.system_time
    }

    /// Applies the load-based polyphony trim described in §4.J given the
    /// measured callback duration in milliseconds.
    pub fn apply_load(&self, voices: &mut VoicePool, elapsed_ms: i64, user_ceiling: usize) {
        let active = voices.active_count();
        let target = if elapsed_ms > 300 {
            2
        } else if elapsed_ms >= 20 {
            (3 * active) / 4
        } else if elapsed_ms >= 16 {
            (7 * active) / 8
        } else {
            user_ceiling
        };
        voices.set_max_polyphony(target.min(user_ceiling).max(0));
    }
}
