//! Per-channel MIDI control state (§3, §4.C).

use bitflags::bitflags;

bitflags! {
    /// Pedal state, one independent flag per pedal (§3).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PedalFlags: u16 {
        const SOSTENUTO = 0x2000;
        const SOFT      = 0x4000;
        const SUSTAIN   = 0x8000;
    }
}

/// RPN index meaning "no RPN selected" — writes to data entry are ignored
/// while either half of the RPN pair holds this value (§4.C).
pub const RPN_NONE: u8 = 255;

/// One of the 16 MIDI channel control blocks.
#[derive(Clone, Debug)]
pub struct Channel {
    pub program: u16,
    pub modulation: i16,
    pub channel_pressure: i16,
    pub expression: i16,
    pub volume: i16,
    pub pitch_bend: i16,
    pub pan: i16,
    pub pitch_bend_sense: i16,
    pub fine_tune: i16,
    pub coarse_tune: i16,
    pub rpn_msb: u8,
    pub rpn_lsb: u8,
    pub data_msb: u8,
    pub data_lsb: u8,
    pub pedals: PedalFlags,
}

impl Default for Channel {
    fn default() -> Self {
        Channel::new()
    }
}

impl Channel {
    pub fn new() -> Self {
        let mut ch = Channel {
            program: 0,
            modulation: 0,
            channel_pressure: 0,
            expression: 127,
            volume: 100,
            pitch_bend: 0,
            pan: 0,
            pitch_bend_sense: 512,
            fine_tune: 0,
            coarse_tune: 0,
            rpn_msb: RPN_NONE,
            rpn_lsb: RPN_NONE,
            data_msb: 0,
            data_lsb: 0,
            pedals: PedalFlags::empty(),
        };
        ch.reset_all();
        ch
    }

    /// `ResetAll` (§4.C): restores every controller to its power-on default.
    pub fn reset_all(&mut self) {
        self.program = 0;
        self.expression = 127;
        self.volume = 100;
        self.pan = 0;
        self.pitch_bend = 0;
        self.pitch_bend_sense = 512;
        self.channel_pressure = 0;
        self.modulation = 0;
        self.rpn_msb = RPN_NONE;
        self.rpn_lsb = RPN_NONE;
        self.data_msb = 0;
        self.data_lsb = 0;
        self.fine_tune = 0;
        self.coarse_tune = 0;
        self.pedals = PedalFlags::empty();
    }

    /// `ResetControllers` (§4.C): the GM "reset all controllers" subset,
    /// which unlike `reset_all` leaves volume, pan, program, and tuning
    /// untouched.
    pub fn reset_controllers(&mut self) {
        self.expression = 127;
        self.pitch_bend = 0;
        self.channel_pressure = 0;
        self.modulation = 0;
        self.rpn_msb = RPN_NONE;
        self.rpn_lsb = RPN_NONE;
        self.data_msb = 0;
        self.data_lsb = 0;
        self.pedals = PedalFlags::empty();
    }

    /// Applies a data-entry MSB/LSB write against the currently selected
    /// RPN pair (§4.C). NRPN selection (handled by the dispatcher setting
    /// `rpn_msb`/`rpn_lsb` to [`RPN_NONE`]) makes this a no-op.
    pub fn apply_rpn_data_entry(&mut self) {
        if self.rpn_msb != 0 {
            return;
        }
        match self.rpn_lsb {
            0 => {
                if self.data_msb <= 12 {
                    self.pitch_bend_sense = 2 * (self.data_msb as i16 * 128 + self.data_lsb as i16);
                }
            }
            1 => {
                self.fine_tune =
                    (((self.data_lsb >> 5) as i16) + 4 * self.data_msb as i16) - 256;
            }
            2 => {
                let msb = self.data_msb as i16;
                if (40..=88).contains(&msb) {
                    self.coarse_tune = msb - 64;
                }
            }
            _ => {}
        }
    }

    /// NRPN selection (CC 98/99, `0x62`/`0x63`) inhibits subsequent data
    /// entries until an RPN is explicitly reselected (§4.C).
    pub fn select_nrpn(&mut self) {
        self.rpn_msb = RPN_NONE;
        self.rpn_lsb = RPN_NONE;
    }
}
