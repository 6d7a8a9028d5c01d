//! Speaker-embedding mixes.

use std::collections::HashMap;

use crate::score::{phone_count, SpeakerMix, Word};
use crate::tensor::{DataType, Tensor};
use crate::{Error, Result};

fn mix_into(
    accumulator: &mut [f32],
    speakers: &[SpeakerMix],
    table: &HashMap<String, Vec<f32>>,
) {
    for speaker in speakers {
        match table.get(&speaker.name) {
            Some(embedding) => {
                for (acc, &e) in accumulator.iter_mut().zip(embedding) {
                    *acc += speaker.proportion as f32 * e;
                }
            }
            None => {
                tracing::warn!(speaker = %speaker.name, "unknown speaker name in embedding mix, skipping");
            }
        }
    }
}

/// Build the `[1, targetLength, hiddenSize]` float tensor holding the
/// score-level speaker mix repeated for every frame. Unknown speaker names
/// are skipped with a warning.
pub fn speaker_embedding_frames(
    speakers: &[SpeakerMix],
    table: &HashMap<String, Vec<f32>>,
    hidden_size: i64,
    target_length: i64,
) -> Result<Tensor> {
    let hidden = hidden_size as usize;
    let mut mix = vec![0.0f32; hidden];
    mix_into(&mut mix, speakers, table);

    let mut tensor = Tensor::create(
        DataType::Float32,
        vec![1, target_length, hidden_size],
    )?;
    let data = tensor.mutable_data::<f32>()?;
    for frame in data.chunks_exact_mut(hidden) {
        frame.copy_from_slice(&mix);
    }
    Ok(tensor)
}

/// Build the `[1, nPhones, hiddenSize]` float tensor mixing each phone's own
/// speaker list. A phone with no speakers fails, naming the phoneme.
pub fn speaker_embedding_phones(
    words: &[Word],
    table: &HashMap<String, Vec<f32>>,
    hidden_size: i64,
) -> Result<Tensor> {
    let hidden = hidden_size as usize;
    let n_phones = phone_count(words);
    let mut tensor = Tensor::create(
        DataType::Float32,
        vec![1, n_phones as i64, hidden_size],
    )?;
    let data = tensor.mutable_data::<f32>()?;
    let mut index = 0usize;
    for word in words {
        for phone in &word.phones {
            if phone.speakers.is_empty() {
                return Err(Error::Session(format!(
                    "phoneme {} missing speakers",
                    phone.token
                )));
            }
            let frame = &mut data[index * hidden..(index + 1) * hidden];
            mix_into(frame, &phone.speakers, table);
            index += 1;
        }
    }
    Ok(tensor)
}
