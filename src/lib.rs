//! Singing-voice-synthesis inference core.
//!
//! Orchestrates five neural models — duration, pitch, variance, acoustic,
//! vocoder — over a shared mutable score context to turn a score (words,
//! phonemes, notes, per-frame parameters) into a mono PCM waveform.
//!
//! ## Architecture
//!
//! ```text
//! score ──► duration ──► pitch ──► variance ──► acoustic ──► vocoder ──► PCM
//!           (phone       (pitch    (variance    (mel, f0)    (waveform)
//!            starts)      curve)    params)
//! ```
//!
//! Each stage assembles name→tensor inputs from the score context and its
//! configuration, calls into an externally provided neural runtime (the
//! [`session`] traits), and writes its outputs back into the context. Graph
//! execution itself is out of scope: callers register a driver for their
//! runtime of choice and the pipeline never looks inside a model.
//!
//! ## Modules
//!
//! - [`score`] — score-context data model (words, phones, notes, parameters)
//! - [`dict`] — phoneme lookup table loaded from a lexicon file
//! - [`tensor`] — typed n-dim arrays exchanged with the runtime
//! - [`prep`] — resampling, token/duration encodings, speaker-embedding mixes
//! - [`stages`] — the five stage runners and their shared lifecycle
//! - [`pipeline`] — cross-stage driver with the acoustic/vocoder compat check
//! - [`config`] / [`package`] — singer-package configurations and schemas
//! - [`audio`] — RIFF/WAVE float-PCM output

pub mod audio;
pub mod config;
pub mod dict;
pub mod input;
pub mod package;
pub mod pipeline;
pub mod prep;
pub mod score;
pub mod session;
pub mod stages;
pub mod tensor;

mod error;

pub use error::{Error, Result};
