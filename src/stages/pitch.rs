//! Pitch stage: linguistic encoder plus pitch predictor.
//!
//! Note tensors (`note_midi`, `note_rest`, `note_dur`) describe the melody;
//! the user's pitch curve and retake window gate which frames the model
//! regenerates. The predicted curve is written back to the score context as
//! a Pitch parameter at the stage's frame width.

use std::sync::{Arc, PoisonError, RwLock};

use crate::config::{LinguisticMode, PitchConfig};
use crate::prep::linguistic::{linguistic_phoneme_input, linguistic_word_input, run_encoder};
use crate::prep::phoneme::phoneme_durations;
use crate::prep::speaker::speaker_embedding_frames;
use crate::prep::{fill_rest_with_nearest, resample, speedup_from_steps, DIFFUSION_TOTAL_STEPS};
use crate::score::{note_count, ParamTag};
use crate::session::{InferenceDriver, InferenceSession, SessionInput, SessionOpenArgs};
use crate::tensor::{DataType, Tensor};
use crate::{Error, Result};

use super::{
    check_startable, fail, Inference, PitchOutput, StageInput, StageOutput, StageState, StateCell,
};

/// Manifest class name of the pitch inference.
pub const API_CLASS: &str = "svs.inference.pitch";

const OUT_PITCH_PRED: &str = "pitch_pred";

#[derive(Default)]
struct Inner {
    driver: Option<Arc<dyn InferenceDriver>>,
    encoder: Option<Arc<dyn InferenceSession>>,
    predictor: Option<Arc<dyn InferenceSession>>,
    result: Option<PitchOutput>,
}

pub struct PitchStage {
    config: Arc<PitchConfig>,
    state: StateCell,
    inner: RwLock<Inner>,
}

impl PitchStage {
    pub fn new(config: Arc<PitchConfig>) -> PitchStage {
        PitchStage {
            config,
            state: StateCell::new(),
            inner: RwLock::new(Inner::default()),
        }
    }
}

/// Retake mask over `target_length` frames: true inside the window (or
/// everywhere when no window is given), all false for a zero-length window.
fn retake_mask(
    window: Option<(f64, f64)>,
    frame_width: f64,
    target_length: i64,
) -> Vec<u8> {
    let mut mask = vec![1u8; target_length as usize];
    if let Some((start, end)) = window {
        let clamp = |t: f64| -> i64 { ((t / frame_width).round() as i64).clamp(0, target_length) };
        let start_frame = clamp(start);
        let end_frame = clamp(end);
        if start_frame == end_frame {
            mask.fill(0);
        } else if start_frame < end_frame {
            mask[..start_frame as usize].fill(0);
            mask[end_frame as usize..].fill(0);
        }
    }
    mask
}

impl Inference for PitchStage {
    fn initialize(&self, driver: Arc<dyn InferenceDriver>) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.result = None;

        let encoder = driver.create_session();
        if let Err(e) = encoder.open(&self.config.encoder, &SessionOpenArgs::default()) {
            return fail(&self.state, e);
        }
        let predictor = driver.create_session();
        if let Err(e) = predictor.open(&self.config.predictor, &SessionOpenArgs::default()) {
            return fail(&self.state, e);
        }

        inner.encoder = Some(encoder);
        inner.predictor = Some(predictor);
        inner.driver = Some(driver);
        self.state.set(StageState::Idle);
        Ok(())
    }

    fn start(&self, input: &StageInput) -> Result<StageOutput> {
        check_startable("pitch", &self.state)?;
        {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            if inner.driver.is_none() {
                return fail(
                    &self.state,
                    Error::Session("inference driver not initialized".to_string()),
                );
            }
        }

        self.state.set(StageState::Running);

        let StageInput::Pitch(input) = input else {
            return fail(
                &self.state,
                Error::InvalidArgument("pitch stage expects a pitch input payload".to_string()),
            );
        };

        let config = &self.config;
        let frame_width = config.frame_width;
        if !frame_width.is_finite() || frame_width <= 0.0 {
            return fail(
                &self.state,
                Error::InvalidArgument("frame width must be positive".to_string()),
            );
        }

        // Part 1: linguistic encoder.
        let linguistic = match config.linguistic_mode {
            LinguisticMode::Word => linguistic_word_input(
                &input.words,
                &config.phonemes,
                &config.languages,
                config.use_language_id,
                frame_width,
            ),
            LinguisticMode::Phoneme => linguistic_phoneme_input(
                &input.words,
                &config.phonemes,
                &config.languages,
                config.use_language_id,
                frame_width,
            ),
        };
        let linguistic = match linguistic {
            Ok(v) => v,
            Err(e) => return fail(&self.state, e),
        };

        let mut session_input = SessionInput::default();
        {
            let inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let encoder = match inner.encoder.as_ref().filter(|s| s.is_open()) {
                Some(encoder) => encoder,
                None => {
                    return fail(
                        &self.state,
                        Error::Session(
                            "pitch linguistic encoder session is not initialized".to_string(),
                        ),
                    )
                }
            };
            if let Err(e) = run_encoder(encoder.as_ref(), linguistic, &mut session_input) {
                return fail(&self.state, e);
            }
        }

        // Part 2: note tensors. Frame counts use cumulative rounding carried
        // across the whole score so the total never drifts.
        let total_notes = note_count(&input.words);
        let mut note_rest: Vec<bool> = Vec::with_capacity(total_notes);
        let mut note_midi: Vec<f32> = Vec::with_capacity(total_notes);
        let mut note_dur: Vec<i64> = Vec::with_capacity(total_notes);
        let mut seconds = 0.0f64;
        let mut prev_frames = 0i64;
        for word in &input.words {
            for note in &word.notes {
                note_rest.push(note.is_rest);
                note_midi.push(if note.is_rest {
                    0.0
                } else {
                    note.key as f32 + note.cents as f32 / 100.0
                });
                seconds += note.duration;
                let frames = (seconds / frame_width).round() as i64;
                note_dur.push(frames - prev_frames);
                prev_frames = frames;
            }
        }
        let target_length: i64 = note_dur.iter().sum();

        if let Err(e) = fill_rest_with_nearest(&mut note_midi, &note_rest) {
            return fail(&self.state, e);
        }

        let n_notes = note_midi.len() as i64;
        match Tensor::create_from_view::<f32>(vec![1, n_notes], &note_midi) {
            Ok(t) => {
                session_input.inputs.insert("note_midi".to_string(), t);
            }
            Err(e) => return fail(&self.state, e),
        }
        if config.use_rest_flags {
            let bytes: Vec<u8> = note_rest.iter().map(|&r| r as u8).collect();
            match Tensor::create_from_view::<u8>(vec![1, n_notes], &bytes) {
                Ok(t) => {
                    session_input.inputs.insert("note_rest".to_string(), t);
                }
                Err(e) => return fail(&self.state, e),
            }
        }
        match Tensor::create_from_view::<i64>(vec![1, n_notes], &note_dur) {
            Ok(t) => {
                session_input.inputs.insert("note_dur".to_string(), t);
            }
            Err(e) => return fail(&self.state, e),
        }

        match phoneme_durations(&input.words, frame_width) {
            Ok((t, _)) => {
                session_input.inputs.insert("ph_dur".to_string(), t);
            }
            Err(e) => return fail(&self.state, e),
        }

        // User pitch and expressiveness curves.
        let mut satisfy_pitch = false;
        let mut satisfy_expr = !config.use_expressiveness;
        for param in &input.parameters {
            let is_pitch = param.tag == ParamTag::Pitch;
            let is_expr = param.tag == ParamTag::Expr;
            if !is_pitch && !is_expr {
                continue;
            }
            let samples = resample(
                &param.values,
                param.interval,
                frame_width,
                target_length as usize,
                true,
            );
            if samples.len() != target_length as usize {
                return fail(
                    &self.state,
                    Error::Session(format!(
                        "parameter {} resample failed",
                        param.tag.name()
                    )),
                );
            }
            let curve: Vec<f32> = samples.iter().map(|&v| v as f32).collect();

            if is_pitch {
                match Tensor::create_from_view::<f32>(vec![1, target_length], &curve) {
                    Ok(t) => {
                        session_input.inputs.insert("pitch".to_string(), t);
                    }
                    Err(e) => return fail(&self.state, e),
                }
                let mask = retake_mask(
                    param.retake.map(|w| (w.start, w.end)),
                    frame_width,
                    target_length,
                );
                match Tensor::create_from_view::<u8>(vec![1, target_length], &mask) {
                    Ok(t) => {
                        session_input.inputs.insert("retake".to_string(), t);
                    }
                    Err(e) => return fail(&self.state, e),
                }
                satisfy_pitch = true;
            } else if !satisfy_expr {
                match Tensor::create_from_view::<f32>(vec![1, target_length], &curve) {
                    Ok(t) => {
                        session_input.inputs.insert("expr".to_string(), t);
                    }
                    Err(e) => return fail(&self.state, e),
                }
                satisfy_expr = true;
            }
        }

        if !satisfy_pitch {
            // No user pitch: all zeros, regenerate everywhere.
            match Tensor::create_filled::<f32>(vec![1, target_length], 0.0) {
                Ok(t) => {
                    session_input.inputs.insert("pitch".to_string(), t);
                }
                Err(e) => return fail(&self.state, e),
            }
            match Tensor::create_filled::<u8>(vec![1, target_length], 1) {
                Ok(t) => {
                    session_input.inputs.insert("retake".to_string(), t);
                }
                Err(e) => return fail(&self.state, e),
            }
        }

        if !satisfy_expr {
            // Model needs expr but none was supplied; use all ones.
            match Tensor::create_filled::<f32>(vec![1, target_length], 1.0) {
                Ok(t) => {
                    session_input.inputs.insert("expr".to_string(), t);
                }
                Err(e) => return fail(&self.state, e),
            }
        }

        if config.use_speaker_embedding {
            if input.speakers.is_empty() {
                return fail(
                    &self.state,
                    Error::Session("no speakers found in pitch input".to_string()),
                );
            }
            match speaker_embedding_frames(
                &input.speakers,
                &config.speakers,
                config.hidden_size,
                target_length,
            ) {
                Ok(t) => {
                    session_input.inputs.insert("spk_embed".to_string(), t);
                }
                Err(e) => return fail(&self.state, e),
            }
        }

        // Acceleration scalar.
        let mut acceleration = input.steps;
        if !config.use_continuous_acceleration {
            acceleration = speedup_from_steps(acceleration, DIFFUSION_TOTAL_STEPS);
        }
        let name = if config.use_continuous_acceleration {
            "steps"
        } else {
            "speedup"
        };
        session_input
            .inputs
            .insert(name.to_string(), Tensor::create_scalar::<i64>(acceleration));

        session_input.outputs.insert(OUT_PITCH_PRED.to_string());

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let predictor = match inner.predictor.as_ref().filter(|s| s.is_open()) {
            Some(predictor) => predictor,
            None => {
                return fail(
                    &self.state,
                    Error::Session("pitch predictor session is not initialized".to_string()),
                )
            }
        };
        let output = match predictor.start(session_input) {
            Ok(output) => output,
            Err(e) => return fail(&self.state, e),
        };

        let tensor = match output.outputs.get(OUT_PITCH_PRED) {
            Some(tensor) => tensor,
            None => return fail(&self.state, Error::Session("invalid result output".to_string())),
        };
        if tensor.dtype() != DataType::Float32 {
            return fail(
                &self.state,
                Error::Session("model output is not float".to_string()),
            );
        }
        let view = match tensor.view::<f32>() {
            Ok(view) => view,
            Err(e) => return fail(&self.state, e),
        };
        if view.is_empty() {
            return fail(&self.state, Error::Session("model output is empty".to_string()));
        }

        let result = PitchOutput {
            values: view.iter().map(|&v| v as f64).collect(),
            interval: frame_width,
        };
        inner.result = Some(result.clone());
        drop(inner);

        self.state.set(StageState::Idle);
        Ok(StageOutput::Pitch(result))
    }

    fn stop(&self) -> bool {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut flag = true;
        for session in [&inner.encoder, &inner.predictor] {
            if let Some(session) = session {
                flag &= session.stop();
            }
        }
        self.state.set(StageState::Terminated);
        flag
    }

    fn state(&self) -> StageState {
        self.state.get()
    }

    fn result(&self) -> Option<StageOutput> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.result.clone().map(StageOutput::Pitch)
    }
}
