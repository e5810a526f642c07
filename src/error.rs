//! Crate-wide error type.

use thiserror::Error;

/// Failure modes surfaced by the public configuration surface.
///
/// The real-time path (`Engine::fill_output_buffer`) never returns this type:
/// once playback has started it is expected to run to completion every call,
/// recovering from bad input on its own (stale MIDI, overload) rather than
/// failing the callback. Only setup-time calls can fail.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SynthError {
    /// `set_parameter` was called with an id outside the `Parameter` enum.
    #[error("unknown parameter id {0}")]
    UnknownParameter(u32),

    /// `Frequency` was set to a value outside `{0, 1, 2}`.
    #[error("unsupported output frequency selector {0}")]
    InvalidFrequency(u32),

    /// `playback_start` was called before a ROM image was supplied.
    #[error("no ROM image has been set")]
    MissingRom,

    /// `playback_start` was called before an output buffer was supplied.
    #[error("no output buffer has been set")]
    MissingOutputBuffer,

    /// The supplied ROM slice is not exactly 2 MiB.
    #[error("ROM image must be exactly {expected} bytes, got {actual}")]
    RomSizeMismatch { expected: usize, actual: usize },

    /// `playback_start` was called twice without an intervening `playback_stop`.
    #[error("playback is already running")]
    AlreadyRunning,

    /// A call that requires a running engine (`add_midi_data`,
    /// `fill_output_buffer`) was made before `playback_start`.
    #[error("playback has not been started")]
    NotRunning,
}

/// Convenience alias used throughout the crate's public surface.
pub type Result<T> = std::result::Result<T, SynthError>;
