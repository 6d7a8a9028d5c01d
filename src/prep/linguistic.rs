//! Linguistic-encoder input assembly.
//!
//! The duration, pitch, and variance stages all run a linguistic encoder
//! before their predictor. Its inputs depend on the configured mode:
//!
//! - word mode: `tokens`, `word_div` (per-word phone counts), `word_dur`
//!   (per-word frame counts), optional `languages`
//! - phoneme mode: `tokens`, `ph_dur` (per-phone frame counts), optional
//!   `languages`
//!
//! Whatever the encoder produces is forwarded verbatim into the predictor's
//! inputs under the same names.

use std::collections::HashMap;

use crate::score::Word;
use crate::session::{InferenceSession, SessionInput};
use crate::tensor::Tensor;
use crate::Result;

use super::phoneme::{phoneme_durations, phoneme_languages, phoneme_tokens};

/// Assemble encoder inputs for word mode.
pub fn linguistic_word_input(
    words: &[Word],
    phonemes: &HashMap<String, i64>,
    languages: &HashMap<String, i64>,
    use_language_id: bool,
    frame_width: f64,
) -> Result<SessionInput> {
    let mut input = SessionInput::default();
    input
        .inputs
        .insert("tokens".to_string(), phoneme_tokens(words, phonemes)?);
    if use_language_id {
        input
            .inputs
            .insert("languages".to_string(), phoneme_languages(words, languages)?);
    }

    let mut word_div = Vec::with_capacity(words.len());
    let mut word_dur = Vec::with_capacity(words.len());
    let mut cumulative = 0.0f64;
    let mut prev_frames = 0i64;
    for word in words {
        word_div.push(word.phones.len() as i64);
        cumulative += word.duration();
        let frames = (cumulative / frame_width).round() as i64;
        word_dur.push(frames - prev_frames);
        prev_frames = frames;
    }
    let n = words.len() as i64;
    input.inputs.insert(
        "word_div".to_string(),
        Tensor::create_from_view::<i64>(vec![1, n], &word_div)?,
    );
    input.inputs.insert(
        "word_dur".to_string(),
        Tensor::create_from_view::<i64>(vec![1, n], &word_dur)?,
    );
    Ok(input)
}

/// Assemble encoder inputs for phoneme mode.
pub fn linguistic_phoneme_input(
    words: &[Word],
    phonemes: &HashMap<String, i64>,
    languages: &HashMap<String, i64>,
    use_language_id: bool,
    frame_width: f64,
) -> Result<SessionInput> {
    let mut input = SessionInput::default();
    input
        .inputs
        .insert("tokens".to_string(), phoneme_tokens(words, phonemes)?);
    if use_language_id {
        input
            .inputs
            .insert("languages".to_string(), phoneme_languages(words, languages)?);
    }
    let (ph_dur, _) = phoneme_durations(words, frame_width)?;
    input.inputs.insert("ph_dur".to_string(), ph_dur);
    Ok(input)
}

/// Run the encoder and forward all of its outputs into `predictor_input`
/// under the same names.
pub fn run_encoder(
    session: &dyn InferenceSession,
    encoder_input: SessionInput,
    predictor_input: &mut SessionInput,
) -> Result<()> {
    let output = session.start(encoder_input)?;
    for (name, tensor) in output.outputs {
        predictor_input.inputs.insert(name, tensor);
    }
    Ok(())
}
