//! Real-time wavetable synthesis core for a CASIO SW-10 compatible General
//! MIDI sound generator.
//!
//! This crate reconstructs the ROM-driven sample playback, envelope, and
//! mixing pipeline of a hardware GM wavetable synth as a standalone,
//! embeddable synthesis engine: feed it a 2 MiB wavetable ROM image and a
//! stream of MIDI bytes, and it fills caller-owned PCM buffers in real
//! time.
//!
//! # Quick start
//! ```no_run
//! use sw10_synth_core::Engine;
//!
//! let rom = std::fs::read("gm.rom").unwrap();
//! let mut engine = Engine::new();
//! engine.set_rom(&rom).unwrap();
//! engine.set_time_source(|| 0); // replace with a real monotonic clock
//! engine.playback_start().unwrap();
//!
//! engine.add_midi_data(&[0x90, 60, 100]).unwrap(); // note on, C4
//!
//! let frames = engine.frames_per_callback();
//! let mut out = vec![0i16; frames * 2];
//! engine.fill_output_buffer(0, &mut out);
//! ```
//!
//! The real-time path (`fill_output_buffer`, `add_midi_data`) never
//! allocates and never returns an error: setup mistakes (missing ROM,
//! unknown parameter ids) are reported by the setup-time methods instead,
//! through [`SynthError`].

#![warn(missing_docs)]

pub mod channel;
pub mod constants;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod governor;
pub mod midi;
pub mod mixer;
pub mod rom;
pub mod scheduler;
pub mod voice;
pub mod wavetable;

pub use engine::{Engine, EngineStats, Parameter};
pub use error::{Result, SynthError};
