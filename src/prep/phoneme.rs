//! Phoneme-level tensor encodings.

use std::collections::HashMap;

use crate::score::{phone_count, Word};
use crate::tensor::Tensor;
use crate::{Error, Result};

use super::fill_rest_with_nearest;

/// Encode every phone's token id into an int64 tensor of shape
/// `[1, totalPhones]`.
pub fn phoneme_tokens(words: &[Word], phonemes: &HashMap<String, i64>) -> Result<Tensor> {
    let mut tokens = Vec::with_capacity(phone_count(words));
    for word in words {
        for phone in &word.phones {
            let id = phonemes.get(&phone.token).ok_or_else(|| {
                Error::Session(format!(r#"phoneme "{}" not in dictionary"#, phone.token))
            })?;
            tokens.push(*id);
        }
    }
    let shape = vec![1, tokens.len() as i64];
    Tensor::create_from_view::<i64>(shape, &tokens)
}

/// Encode every phone's language id into an int64 tensor of shape
/// `[1, totalPhones]`. A phone's language is its word's active language tag.
pub fn phoneme_languages(words: &[Word], languages: &HashMap<String, i64>) -> Result<Tensor> {
    let mut ids = Vec::with_capacity(phone_count(words));
    for word in words {
        let tag = word.language.as_deref().ok_or_else(|| {
            Error::Session("word has no language tag but the model uses language ids".to_string())
        })?;
        let id = *languages
            .get(tag)
            .ok_or_else(|| Error::Session(format!(r#"language "{tag}" not in dictionary"#)))?;
        ids.extend(std::iter::repeat(id).take(word.phones.len()));
    }
    let shape = vec![1, ids.len() as i64];
    Tensor::create_from_view::<i64>(shape, &ids)
}

/// Convert each phone's span into whole frames by rounding the cumulative
/// seconds-since-word-origin to `frame_width` and differencing, so frame
/// counts telescope to the word total. Returns the `[1, totalPhones]` int64
/// tensor together with the frame sum.
pub fn phoneme_durations(words: &[Word], frame_width: f64) -> Result<(Tensor, i64)> {
    if !frame_width.is_finite() || frame_width <= 0.0 {
        return Err(Error::InvalidArgument(
            "frame width must be positive".to_string(),
        ));
    }
    let mut frames = Vec::with_capacity(phone_count(words));
    let mut total = 0i64;
    for word in words {
        let word_end = word.duration();
        for (j, phone) in word.phones.iter().enumerate() {
            let span_end = match word.phones.get(j + 1) {
                Some(next) => next.start,
                None => word_end,
            };
            let start_frames = (phone.start / frame_width).round() as i64;
            let end_frames = (span_end / frame_width).round() as i64;
            let n = end_frames - start_frames;
            frames.push(n);
            total += n;
        }
    }
    let shape = vec![1, frames.len() as i64];
    let tensor = Tensor::create_from_view::<i64>(shape, &frames)?;
    Ok((tensor, total))
}

/// Assign each phone the midi key of the note whose cumulative duration
/// first covers the phone's start. Rests are filled per word with the
/// nearest non-rest key; a word whose notes are all rests fails.
pub fn phoneme_midi(words: &[Word]) -> Result<Tensor> {
    let mut midi: Vec<i64> = Vec::with_capacity(phone_count(words));
    let mut rest: Vec<bool> = Vec::with_capacity(phone_count(words));
    for word in words {
        if word.notes.is_empty() {
            continue;
        }
        let word_begin = midi.len();
        let mut cumulative = Vec::with_capacity(word.notes.len());
        let mut sum = 0.0;
        for note in &word.notes {
            sum += note.duration;
            cumulative.push(sum);
        }
        for phone in &word.phones {
            let mut idx = 0;
            while idx < cumulative.len() && phone.start > cumulative[idx] {
                idx += 1;
            }
            if idx >= word.notes.len() {
                idx = word.notes.len() - 1;
            }
            let note = &word.notes[idx];
            rest.push(note.is_rest);
            midi.push(if note.is_rest { 0 } else { note.key });
        }
        fill_rest_with_nearest(&mut midi[word_begin..], &rest[word_begin..])?;
    }
    let shape = vec![1, midi.len() as i64];
    Tensor::create_from_view::<i64>(shape, &midi)
}
