//! End-to-end inference pipeline.
//!
//! Orchestrates the five stages over one mutable score context:
//!
//! 1. Duration — rewrites `phone.start` in place
//! 2. Pitch — adds/replaces the Pitch parameter
//! 3. Variance — adds/replaces each schema-predicted parameter
//! 4. Acoustic — produces `mel` and `f0`
//! 5. Vocoder — produces the audio bytes
//!
//! The acoustic and vocoder configurations must agree on every spectral
//! parameter; the pipeline refuses to load otherwise, before any model runs.
//! Stage failures are surfaced verbatim, prefixed with the stage and singer.

use std::sync::Arc;
use std::time::Instant;

use crate::config::{AcousticConfig, VocoderConfig};
use crate::package::SingerPackage;
use crate::score::{ParamTag, Parameter, Score, Word};
use crate::session::InferenceDriver;
use crate::stages::{
    AcousticInput, AcousticStage, DurationInput, DurationStage, Inference, PitchInput, PitchStage,
    StageInput, StageOutput, VarianceInput, VarianceStage, VocoderInput, VocoderStage,
};
use crate::{Error, Result};

/// Rendered mono audio.
#[derive(Debug)]
pub struct RenderedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// The five-stage pipeline bound to one singer.
pub struct SvsPipeline {
    singer: String,
    sample_rate: u32,
    duration: DurationStage,
    pitch: PitchStage,
    variance: VarianceStage,
    acoustic: AcousticStage,
    vocoder: VocoderStage,
}

/// Refuse to couple an acoustic model with a vocoder trained on different
/// spectral parameters.
pub fn check_compatibility(acoustic: &AcousticConfig, vocoder: &VocoderConfig) -> Result<()> {
    let mismatched = acoustic.mel.mismatched_fields(&vocoder.mel);
    if mismatched.is_empty() {
        Ok(())
    } else {
        Err(Error::Session(format!(
            "acoustic and vocoder config mismatch: {}",
            mismatched.join(", ")
        )))
    }
}

impl std::fmt::Debug for SvsPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SvsPipeline")
            .field("singer", &self.singer)
            .field("sample_rate", &self.sample_rate)
            .finish_non_exhaustive()
    }
}

fn init_error(stage: &str, singer: &str, error: Error) -> Error {
    Error::Session(format!(
        r#"failed to initialize {stage} inference for singer "{singer}": {error}"#
    ))
}

fn run_error(stage: &str, singer: &str, error: Error) -> Error {
    Error::Session(format!(
        r#"failed to run {stage} inference for singer "{singer}": {error}"#
    ))
}

impl SvsPipeline {
    /// Build and initialise all five stages from a loaded singer package.
    pub fn load(package: &SingerPackage, driver: Arc<dyn InferenceDriver>) -> Result<SvsPipeline> {
        check_compatibility(&package.acoustic, &package.vocoder)?;

        let singer = package.id.clone();
        let sample_rate = package.vocoder.mel.sample_rate;
        let pipeline = SvsPipeline {
            singer: singer.clone(),
            sample_rate,
            duration: DurationStage::new(package.duration.clone()),
            pitch: PitchStage::new(package.pitch.clone()),
            variance: VarianceStage::new(package.variance.clone(), package.variance_schema.clone()),
            acoustic: AcousticStage::new(package.acoustic.clone()),
            vocoder: VocoderStage::new(package.vocoder.clone()),
        };

        pipeline
            .duration
            .initialize(driver.clone())
            .map_err(|e| init_error("duration", &singer, e))?;
        pipeline
            .pitch
            .initialize(driver.clone())
            .map_err(|e| init_error("pitch", &singer, e))?;
        pipeline
            .variance
            .initialize(driver.clone())
            .map_err(|e| init_error("variance", &singer, e))?;
        pipeline
            .acoustic
            .initialize(driver.clone())
            .map_err(|e| init_error("acoustic", &singer, e))?;
        pipeline
            .vocoder
            .initialize(driver)
            .map_err(|e| init_error("vocoder", &singer, e))?;

        tracing::info!(singer = %pipeline.singer, "pipeline loaded");
        Ok(pipeline)
    }

    /// Run the five stages in order, mutating `score` in place, and return
    /// the rendered audio.
    pub fn render(&self, score: &mut Score) -> Result<RenderedAudio> {
        let t0 = Instant::now();

        // 1. Duration.
        let t = Instant::now();
        let input = StageInput::Duration(DurationInput {
            duration: score.duration,
            words: score.words.clone(),
        });
        let output = self
            .duration
            .start(&input)
            .map_err(|e| run_error("duration", &self.singer, e))?;
        let StageOutput::Duration(result) = output else {
            return Err(Error::Session(
                "duration stage returned a mismatched payload".to_string(),
            ));
        };
        apply_durations(&mut score.words, &result.durations);
        tracing::info!("duration stage: {:.2}s", t.elapsed().as_secs_f64());

        // 2. Pitch.
        let t = Instant::now();
        let parameters: Vec<Parameter> = score
            .parameters
            .iter()
            .filter(|p| matches!(p.tag, ParamTag::Pitch | ParamTag::Expr))
            .cloned()
            .collect();
        let input = StageInput::Pitch(PitchInput {
            duration: score.duration,
            words: score.words.clone(),
            parameters,
            speakers: score.speakers.clone(),
            steps: score.steps,
        });
        let output = self
            .pitch
            .start(&input)
            .map_err(|e| run_error("pitch", &self.singer, e))?;
        let StageOutput::Pitch(result) = output else {
            return Err(Error::Session(
                "pitch stage returned a mismatched payload".to_string(),
            ));
        };
        apply_pitch(&mut score.parameters, result.values, result.interval);
        tracing::info!("pitch stage: {:.2}s", t.elapsed().as_secs_f64());

        // 3. Variance.
        let t = Instant::now();
        let predictions = self.variance.schema().predictions.clone();
        let parameters: Vec<Parameter> = score
            .parameters
            .iter()
            .filter(|p| p.tag == ParamTag::Pitch || predictions.contains(&p.tag))
            .cloned()
            .collect();
        let input = StageInput::Variance(VarianceInput {
            duration: score.duration,
            words: score.words.clone(),
            parameters,
            speakers: score.speakers.clone(),
            steps: score.steps,
        });
        let output = self
            .variance
            .start(&input)
            .map_err(|e| run_error("variance", &self.singer, e))?;
        let StageOutput::Variance(result) = output else {
            return Err(Error::Session(
                "variance stage returned a mismatched payload".to_string(),
            ));
        };
        apply_variance(&mut score.parameters, result.predictions);
        tracing::info!("variance stage: {:.2}s", t.elapsed().as_secs_f64());

        // 4. Acoustic.
        let t = Instant::now();
        let input = StageInput::Acoustic(AcousticInput {
            duration: score.duration,
            words: score.words.clone(),
            parameters: score.parameters.clone(),
            speakers: score.speakers.clone(),
            steps: score.steps,
            depth: score.depth,
        });
        let output = self
            .acoustic
            .start(&input)
            .map_err(|e| run_error("acoustic", &self.singer, e))?;
        let StageOutput::Acoustic(result) = output else {
            return Err(Error::Session(
                "acoustic stage returned a mismatched payload".to_string(),
            ));
        };
        tracing::info!("acoustic stage: {:.2}s", t.elapsed().as_secs_f64());

        // 5. Vocoder. Handing over mel and f0 bumps refcounts, not bytes.
        let t = Instant::now();
        let input = StageInput::Vocoder(VocoderInput {
            mel: result.mel,
            f0: result.f0,
        });
        let output = self
            .vocoder
            .start(&input)
            .map_err(|e| run_error("vocoder", &self.singer, e))?;
        let StageOutput::Vocoder(result) = output else {
            return Err(Error::Session(
                "vocoder stage returned a mismatched payload".to_string(),
            ));
        };
        tracing::info!("vocoder stage: {:.2}s", t.elapsed().as_secs_f64());

        let samples: Vec<f32> = result
            .audio
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        tracing::info!(
            "rendered {:.2}s of audio in {:.2}s",
            samples.len() as f64 / self.sample_rate as f64,
            t0.elapsed().as_secs_f64()
        );

        Ok(RenderedAudio {
            samples,
            sample_rate: self.sample_rate,
        })
    }
}

/// Rewrite phone starts from the predicted per-phone durations, word by word.
fn apply_durations(words: &mut [Word], durations: &[f64]) {
    let mut i = 0usize;
    for word in words {
        let mut cursor = 0.0f64;
        for phone in &mut word.phones {
            if i >= durations.len() {
                return;
            }
            phone.start = cursor;
            cursor += durations[i];
            i += 1;
        }
    }
}

/// Replace the Pitch parameter's curve, keeping any retake window, or attach
/// a new parameter when none exists.
fn apply_pitch(parameters: &mut Vec<Parameter>, values: Vec<f64>, interval: f64) {
    if let Some(param) = parameters.iter_mut().find(|p| p.tag == ParamTag::Pitch) {
        param.values = values;
        param.interval = interval;
    } else {
        parameters.push(Parameter {
            tag: ParamTag::Pitch,
            values,
            interval,
            retake: None,
        });
    }
}

/// Overwrite each predicted parameter (clearing its retake window) or attach
/// it when the score had none.
fn apply_variance(parameters: &mut Vec<Parameter>, predictions: Vec<Parameter>) {
    for predicted in predictions {
        if let Some(param) = parameters.iter_mut().find(|p| p.tag == predicted.tag) {
            param.values = predicted.values;
            param.interval = predicted.interval;
            param.retake = None;
        } else {
            parameters.push(predicted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DurationConfig, LinguisticMode, MelSpec, PitchConfig, VarianceConfig, VarianceSchema,
    };
    use crate::score::{Note, Phone, RetakeWindow};
    use crate::session::testing::{emit_floats, MockDriver};
    use std::collections::HashMap;

    fn phoneme_map() -> HashMap<String, i64> {
        [("a", 1i64), ("b", 2)].map(|(k, v)| (k.to_string(), v)).into()
    }

    fn mel() -> MelSpec {
        MelSpec {
            sample_rate: 100,
            hop_size: 1,
            ..MelSpec::default()
        }
    }

    fn package() -> SingerPackage {
        SingerPackage {
            id: "test-singer".to_string(),
            root: "pkg".into(),
            duration: Arc::new(DurationConfig {
                encoder: "d-enc.onnx".into(),
                predictor: "d-pred.onnx".into(),
                frame_width: 0.01,
                phonemes: phoneme_map(),
                languages: HashMap::new(),
                speakers: HashMap::new(),
                hidden_size: 0,
                linguistic_mode: LinguisticMode::Word,
                use_language_id: false,
                use_speaker_embedding: false,
            }),
            pitch: Arc::new(PitchConfig {
                encoder: "p-enc.onnx".into(),
                predictor: "p-pred.onnx".into(),
                frame_width: 0.01,
                phonemes: phoneme_map(),
                languages: HashMap::new(),
                speakers: HashMap::new(),
                hidden_size: 0,
                linguistic_mode: LinguisticMode::Word,
                use_language_id: false,
                use_speaker_embedding: false,
                use_rest_flags: false,
                use_expressiveness: false,
                use_continuous_acceleration: false,
            }),
            variance: Arc::new(VarianceConfig {
                encoder: "v-enc.onnx".into(),
                predictor: "v-pred.onnx".into(),
                frame_width: 0.01,
                phonemes: phoneme_map(),
                languages: HashMap::new(),
                speakers: HashMap::new(),
                hidden_size: 0,
                linguistic_mode: LinguisticMode::Word,
                use_language_id: false,
                use_speaker_embedding: false,
                use_continuous_acceleration: false,
            }),
            variance_schema: Arc::new(VarianceSchema {
                predictions: vec![ParamTag::Energy],
                use_rest_flags: false,
                use_expressiveness: false,
            }),
            acoustic: Arc::new(crate::config::AcousticConfig {
                model: "acoustic.onnx".into(),
                mel: mel(),
                phonemes: phoneme_map(),
                languages: HashMap::new(),
                speakers: HashMap::new(),
                hidden_size: 0,
                parameters: Default::default(),
                use_language_id: false,
                use_speaker_embedding: false,
                use_variable_depth: false,
                use_continuous_acceleration: false,
                max_depth: 1000,
            }),
            vocoder: Arc::new(VocoderConfig {
                model: "vocoder.onnx".into(),
                mel: mel(),
            }),
        }
    }

    fn score() -> Score {
        Score {
            duration: 0.1,
            words: vec![Word {
                phones: vec![
                    Phone {
                        token: "a".to_string(),
                        start: 0.0,
                        speakers: vec![],
                    },
                    Phone {
                        token: "b".to_string(),
                        start: 0.0,
                        speakers: vec![],
                    },
                ],
                notes: vec![Note {
                    key: 60,
                    cents: 0,
                    duration: 0.1,
                    is_rest: false,
                }],
                language: None,
            }],
            parameters: vec![],
            speakers: vec![],
            steps: 50,
            depth: 1.0,
        }
    }

    /// Session creation order during load: duration enc/pred, pitch
    /// enc/pred, variance enc/pred, acoustic, vocoder.
    fn full_driver() -> Arc<MockDriver> {
        MockDriver::with_handlers(vec![
            emit_floats(vec![("encoder_out", vec![0.1])]),
            emit_floats(vec![("ph_dur_pred", vec![1.0, 3.0])]),
            emit_floats(vec![("encoder_out", vec![0.2])]),
            emit_floats(vec![("pitch_pred", vec![69.0; 10])]),
            emit_floats(vec![("encoder_out", vec![0.3])]),
            emit_floats(vec![("energy_pred", vec![0.5; 10])]),
            emit_floats(vec![("mel", vec![0.125; 10])]),
            emit_floats(vec![("waveform", vec![0.0, 0.5, -0.5, 0.25])]),
        ])
    }

    #[test]
    fn compat_rejection_names_the_field_before_any_model_runs() {
        let mut package = package();
        let mut vocoder_mel = mel();
        vocoder_mel.hop_size = 256;
        let mut acoustic_mel = mel();
        acoustic_mel.hop_size = 512;
        Arc::make_mut(&mut package.acoustic).mel = acoustic_mel;
        Arc::make_mut(&mut package.vocoder).mel = vocoder_mel;

        let driver = full_driver();
        let err = SvsPipeline::load(&package, driver.clone()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "session error: acoustic and vocoder config mismatch: hopSize"
        );
        assert_eq!(driver.session_count(), 0);
    }

    #[test]
    fn render_runs_all_stages_and_mutates_the_score() {
        let driver = full_driver();
        let pipeline = SvsPipeline::load(&package(), driver.clone()).unwrap();

        let mut score = score();
        let audio = pipeline.render(&mut score).unwrap();

        // Duration write-back: predicted [1, 3] rescaled to 0.1 s.
        assert!((score.words[0].phones[0].start - 0.0).abs() < 1e-9);
        assert!((score.words[0].phones[1].start - 0.025).abs() < 1e-9);

        // Pitch write-back.
        let pitch = score
            .parameters
            .iter()
            .find(|p| p.tag == ParamTag::Pitch)
            .expect("pitch parameter attached");
        assert_eq!(pitch.values, vec![69.0; 10]);
        assert_eq!(pitch.interval, 0.01);

        // Variance write-back.
        let energy = score
            .parameters
            .iter()
            .find(|p| p.tag == ParamTag::Energy)
            .expect("energy parameter attached");
        assert_eq!(energy.values, vec![0.5; 10]);

        // Audio at the vocoder's sample rate.
        assert_eq!(audio.sample_rate, 100);
        assert_eq!(audio.samples, vec![0.0, 0.5, -0.5, 0.25]);

        // Eight sessions, each called exactly once.
        assert_eq!(driver.session_count(), 8);
        for i in 0..8 {
            assert_eq!(driver.session(i).call_count(), 1);
        }
        // The vocoder received the acoustic f0 (midi 69 → 440 Hz).
        let vocoder_call = driver.session(7).call(0);
        let f0 = vocoder_call.inputs["f0"].view::<f32>().unwrap();
        assert!((f0[0] - 440.0).abs() < 1e-3);
    }

    #[test]
    fn stage_failures_name_stage_and_singer() {
        // The variance predictor returns the wrong outputs.
        let driver = MockDriver::with_handlers(vec![
            emit_floats(vec![("encoder_out", vec![0.1])]),
            emit_floats(vec![("ph_dur_pred", vec![1.0, 3.0])]),
            emit_floats(vec![("encoder_out", vec![0.2])]),
            emit_floats(vec![("pitch_pred", vec![69.0; 10])]),
            emit_floats(vec![("encoder_out", vec![0.3])]),
            emit_floats(vec![("unexpected", vec![0.5; 10])]),
        ]);
        let pipeline = SvsPipeline::load(&package(), driver).unwrap();
        let err = pipeline.render(&mut score()).unwrap_err();
        let msg = err.to_string();
        assert!(
            msg.contains(r#"failed to run variance inference for singer "test-singer""#),
            "{msg}"
        );
        assert!(msg.contains("predicted parameter count mismatch"), "{msg}");
    }

    #[test]
    fn pitch_writeback_keeps_existing_retake_window() {
        let mut parameters = vec![Parameter {
            tag: ParamTag::Pitch,
            values: vec![60.0],
            interval: 0.005,
            retake: Some(RetakeWindow {
                start: 0.0,
                end: 1.0,
            }),
        }];
        apply_pitch(&mut parameters, vec![69.0, 70.0], 0.01);
        assert_eq!(parameters.len(), 1);
        assert_eq!(parameters[0].values, vec![69.0, 70.0]);
        assert_eq!(parameters[0].interval, 0.01);
        assert!(parameters[0].retake.is_some());
    }

    #[test]
    fn variance_writeback_clears_retake() {
        let mut parameters = vec![Parameter {
            tag: ParamTag::Energy,
            values: vec![1.0],
            interval: 0.005,
            retake: Some(RetakeWindow {
                start: 0.0,
                end: 1.0,
            }),
        }];
        apply_variance(
            &mut parameters,
            vec![Parameter {
                tag: ParamTag::Energy,
                values: vec![0.5, 0.5],
                interval: 0.01,
                retake: None,
            }],
        );
        assert_eq!(parameters.len(), 1);
        assert_eq!(parameters[0].values, vec![0.5, 0.5]);
        assert!(parameters[0].retake.is_none());
    }
}
