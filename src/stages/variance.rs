//! Variance stage: linguistic encoder plus multi-parameter predictor.
//!
//! The schema lists which parameter curves the model predicts. Every
//! prediction gets an input curve (the user's values, or zeros) and an
//! output name `<tag>_pred`; a single combined retake tensor gates
//! regeneration per prediction. The predicted curves are re-attached to the
//! score context at the stage's frame width.

use std::sync::{Arc, PoisonError, RwLock};

use crate::config::{LinguisticMode, VarianceConfig, VarianceSchema};
use crate::prep::linguistic::{linguistic_phoneme_input, linguistic_word_input, run_encoder};
use crate::prep::phoneme::phoneme_durations;
use crate::prep::speaker::speaker_embedding_frames;
use crate::prep::{resample, speedup_from_steps, DIFFUSION_TOTAL_STEPS};
use crate::score::{total_duration, ParamTag, Parameter};
use crate::session::{InferenceDriver, InferenceSession, SessionInput, SessionOpenArgs};
use crate::tensor::{DataType, Tensor};
use crate::{Error, Result};

use super::{
    check_startable, fail, Inference, StageInput, StageOutput, StageState, StateCell,
    VarianceOutput,
};

/// Manifest class name of the variance inference.
pub const API_CLASS: &str = "svs.inference.variance";

#[derive(Default)]
struct Inner {
    driver: Option<Arc<dyn InferenceDriver>>,
    encoder: Option<Arc<dyn InferenceSession>>,
    predictor: Option<Arc<dyn InferenceSession>>,
    result: Option<VarianceOutput>,
}

pub struct VarianceStage {
    config: Arc<VarianceConfig>,
    schema: Arc<VarianceSchema>,
    state: StateCell,
    inner: RwLock<Inner>,
}

impl VarianceStage {
    pub fn new(config: Arc<VarianceConfig>, schema: Arc<VarianceSchema>) -> VarianceStage {
        VarianceStage {
            config,
            schema,
            state: StateCell::new(),
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn schema(&self) -> &VarianceSchema {
        &self.schema
    }
}

/// Mark the j-th prediction's slab of the combined retake container.
///
/// The slab stays all-true without a window, turns all-false for a
/// zero-length window, and otherwise keeps only `[start, end)` true.
/// Non-finite or negative endpoints fall back to the slab edges.
fn mark_retake_slab(
    slab: &mut [u8],
    window: Option<(f64, f64)>,
    frame_width: f64,
    target_length: i64,
) {
    let Some((start, end)) = window else {
        return;
    };
    let mut start_frame = 0i64;
    if start.is_finite() && start >= 0.0 {
        start_frame = ((start / frame_width).round() as i64).clamp(0, target_length);
    }
    let mut end_frame = target_length;
    if end.is_finite() && end >= 0.0 {
        end_frame = ((end / frame_width).round() as i64).clamp(0, target_length);
    }
    if start_frame == end_frame {
        slab.fill(0);
    } else if start_frame < end_frame {
        slab[..start_frame as usize].fill(0);
        slab[end_frame as usize..].fill(0);
    }
}

impl Inference for VarianceStage {
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
        check_startable("variance", &self.state)?;
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

        let StageInput::Variance(input) = input else {
            return fail(
                &self.state,
                Error::InvalidArgument(
                    "variance stage expects a variance input payload".to_string(),
                ),
            );
        };

        let config = &self.config;
        let schema = &self.schema;
        let frame_width = config.frame_width;
        if !frame_width.is_finite() || frame_width <= 0.0 {
            return fail(
                &self.state,
                Error::InvalidArgument("frame width must be positive".to_string()),
            );
        }
        if schema.predictions.is_empty() {
            return fail(
                &self.state,
                Error::Session("no parameters to predict".to_string()),
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
                            "variance linguistic encoder session is not initialized".to_string(),
                        ),
                    )
                }
            };
            if let Err(e) = run_encoder(encoder.as_ref(), linguistic, &mut session_input) {
                return fail(&self.state, e);
            }
        }

        // Part 2: variance predictor.
        let target_length = (total_duration(&input.words) / frame_width).round() as i64;

        match phoneme_durations(&input.words, frame_width) {
            Ok((t, _)) => {
                session_input.inputs.insert("ph_dur".to_string(), t);
            }
            Err(e) => return fail(&self.state, e),
        }

        let n_predictions = schema.predictions.len();
        let mut satisfy_pitch = false;
        let mut satisfied = vec![false; n_predictions];
        let mut retake = vec![1u8; target_length as usize * n_predictions];

        for param in &input.parameters {
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

            if param.tag == ParamTag::Pitch {
                match Tensor::create_from_view::<f32>(vec![1, target_length], &curve) {
                    Ok(t) => {
                        session_input.inputs.insert("pitch".to_string(), t);
                    }
                    Err(e) => return fail(&self.state, e),
                }
                satisfy_pitch = true;
                continue;
            }

            for (j, &prediction) in schema.predictions.iter().enumerate() {
                if param.tag != prediction {
                    continue;
                }
                match Tensor::create_from_view::<f32>(vec![1, target_length], &curve) {
                    Ok(t) => {
                        session_input.inputs.insert(prediction.name().to_string(), t);
                    }
                    Err(e) => return fail(&self.state, e),
                }
                session_input
                    .outputs
                    .insert(format!("{}_pred", prediction.name()));

                let slab =
                    &mut retake[j * target_length as usize..(j + 1) * target_length as usize];
                mark_retake_slab(
                    slab,
                    param.retake.map(|w| (w.start, w.end)),
                    frame_width,
                    target_length,
                );
                satisfied[j] = true;
            }
        }

        match Tensor::create_from_view::<u8>(
            vec![1, target_length, n_predictions as i64],
            &retake,
        ) {
            Ok(t) => {
                session_input.inputs.insert("retake".to_string(), t);
            }
            Err(e) => return fail(&self.state, e),
        }

        if !satisfy_pitch {
            return fail(&self.state, Error::Session("missing pitch input".to_string()));
        }

        for (j, &prediction) in schema.predictions.iter().enumerate() {
            if satisfied[j] {
                continue;
            }
            match Tensor::create_filled::<f32>(vec![1, target_length], 0.0) {
                Ok(t) => {
                    session_input.inputs.insert(prediction.name().to_string(), t);
                }
                Err(e) => return fail(&self.state, e),
            }
            session_input
                .outputs
                .insert(format!("{}_pred", prediction.name()));
        }

        if config.use_speaker_embedding {
            if input.speakers.is_empty() {
                return fail(
                    &self.state,
                    Error::Session("no speakers found in variance input".to_string()),
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

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let predictor = match inner.predictor.as_ref().filter(|s| s.is_open()) {
            Some(predictor) => predictor,
            None => {
                return fail(
                    &self.state,
                    Error::Session("variance predictor session is not initialized".to_string()),
                )
            }
        };
        let output = match predictor.start(session_input) {
            Ok(output) => output,
            Err(e) => return fail(&self.state, e),
        };

        let mut predictions = Vec::with_capacity(n_predictions);
        for (name, tensor) in &output.outputs {
            for &prediction in &schema.predictions {
                if name != &format!("{}_pred", prediction.name()) {
                    continue;
                }
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
                predictions.push(Parameter {
                    tag: prediction,
                    values: view.iter().map(|&v| v as f64).collect(),
                    interval: frame_width,
                    retake: None,
                });
            }
        }

        if predictions.len() != n_predictions {
            return fail(
                &self.state,
                Error::Session(format!(
                    "predicted parameter count mismatch: expected {n_predictions}, got {}",
                    predictions.len()
                )),
            );
        }

        let result = VarianceOutput { predictions };
        inner.result = Some(result.clone());
        drop(inner);

        self.state.set(StageState::Idle);
        Ok(StageOutput::Variance(result))
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
        inner.result.clone().map(StageOutput::Variance)
    }
}

#[cfg(test)]
mod tests {
    use super::super::VarianceInput;
    use super::*;
    use crate::score::{Note, Phone, RetakeWindow, Word};
    use crate::session::testing::{emit_floats, MockDriver};
    use std::collections::HashMap;

    fn config() -> Arc<VarianceConfig> {
        Arc::new(VarianceConfig {
            encoder: "enc.onnx".into(),
            predictor: "pred.onnx".into(),
            frame_width: 0.01,
            phonemes: [("a", 1i64)].map(|(k, v)| (k.to_string(), v)).into(),
            languages: HashMap::new(),
            speakers: HashMap::new(),
            hidden_size: 0,
            linguistic_mode: LinguisticMode::Phoneme,
            use_language_id: false,
            use_speaker_embedding: false,
            use_continuous_acceleration: false,
        })
    }

    fn schema() -> Arc<VarianceSchema> {
        Arc::new(VarianceSchema {
            predictions: vec![ParamTag::Energy, ParamTag::Breathiness],
            use_rest_flags: false,
            use_expressiveness: false,
        })
    }

    fn words() -> Vec<Word> {
        vec![Word {
            phones: vec![Phone {
                token: "a".to_string(),
                start: 0.0,
                speakers: vec![],
            }],
            notes: vec![Note {
                key: 60,
                cents: 0,
                duration: 0.1,
                is_rest: false,
            }],
            language: None,
        }]
    }

    fn pitch_param() -> Parameter {
        Parameter {
            tag: ParamTag::Pitch,
            values: vec![60.0; 10],
            interval: 0.01,
            retake: None,
        }
    }

    fn input(parameters: Vec<Parameter>) -> StageInput {
        StageInput::Variance(VarianceInput {
            duration: 0.1,
            words: words(),
            parameters,
            speakers: vec![],
            steps: 50,
        })
    }

    fn prediction_handler() -> crate::session::testing::Handler {
        emit_floats(vec![
            ("energy_pred", vec![0.5; 10]),
            ("breathiness_pred", vec![0.25; 10]),
        ])
    }

    #[test]
    fn missing_pitch_fails() {
        let driver = MockDriver::with_handlers(vec![
            emit_floats(vec![("encoder_out", vec![0.5])]),
        ]);
        let stage = VarianceStage::new(config(), schema());
        stage.initialize(driver).unwrap();
        let err = stage.start(&input(vec![])).unwrap_err();
        assert!(err.to_string().contains("missing pitch input"));
        assert_eq!(stage.state(), StageState::Failed);
    }

    #[test]
    fn unsupplied_predictions_are_zero_filled() {
        let driver = MockDriver::with_handlers(vec![
            emit_floats(vec![("encoder_out", vec![0.5])]),
            prediction_handler(),
        ]);
        let stage = VarianceStage::new(config(), schema());
        stage.initialize(driver.clone()).unwrap();

        let StageOutput::Variance(out) = stage.start(&input(vec![pitch_param()])).unwrap() else {
            panic!("wrong output variant");
        };
        assert_eq!(out.predictions.len(), 2);
        for p in &out.predictions {
            assert_eq!(p.interval, 0.01);
            assert!(p.retake.is_none());
        }

        let call = driver.session(1).call(0);
        assert_eq!(call.inputs["energy"].view::<f32>().unwrap(), &[0.0; 10]);
        assert_eq!(
            call.inputs["breathiness"].view::<f32>().unwrap(),
            &[0.0; 10]
        );
        assert!(call.outputs.contains("energy_pred"));
        assert!(call.outputs.contains("breathiness_pred"));
        // Combined retake mask covers every prediction and stays all-true.
        let retake = call.inputs["retake"].clone();
        assert_eq!(retake.shape(), &[1, 10, 2]);
        assert_eq!(retake.view::<u8>().unwrap(), &[1; 20]);
    }

    #[test]
    fn retake_marks_only_the_owning_slab() {
        let driver = MockDriver::with_handlers(vec![
            emit_floats(vec![("encoder_out", vec![0.5])]),
            prediction_handler(),
        ]);
        let stage = VarianceStage::new(config(), schema());
        stage.initialize(driver.clone()).unwrap();

        let energy = Parameter {
            tag: ParamTag::Energy,
            values: vec![1.0; 10],
            interval: 0.01,
            retake: Some(RetakeWindow {
                start: 0.02,
                end: 0.06,
            }),
        };
        stage
            .start(&input(vec![pitch_param(), energy]))
            .unwrap();

        let call = driver.session(1).call(0);
        let mask = call.inputs["retake"].view::<u8>().unwrap().to_vec();
        // Energy slab: frames [2, 6) stay true.
        assert_eq!(&mask[..10], &[0, 0, 1, 1, 1, 1, 0, 0, 0, 0]);
        // Breathiness slab untouched.
        assert_eq!(&mask[10..], &[1; 10]);
        assert_eq!(call.inputs["energy"].view::<f32>().unwrap(), &[1.0; 10]);
    }

    #[test]
    fn zero_length_retake_blanks_the_slab() {
        let driver = MockDriver::with_handlers(vec![
            emit_floats(vec![("encoder_out", vec![0.5])]),
            prediction_handler(),
        ]);
        let stage = VarianceStage::new(config(), schema());
        stage.initialize(driver.clone()).unwrap();

        let energy = Parameter {
            tag: ParamTag::Energy,
            values: vec![1.0; 10],
            interval: 0.01,
            retake: Some(RetakeWindow {
                start: 0.04,
                end: 0.04,
            }),
        };
        stage
            .start(&input(vec![pitch_param(), energy]))
            .unwrap();

        let call = driver.session(1).call(0);
        let mask = call.inputs["retake"].view::<u8>().unwrap().to_vec();
        assert_eq!(&mask[..10], &[0; 10]);
        assert_eq!(&mask[10..], &[1; 10]);
    }

    #[test]
    fn prediction_count_mismatch_fails() {
        let driver = MockDriver::with_handlers(vec![
            emit_floats(vec![("encoder_out", vec![0.5])]),
            emit_floats(vec![("energy_pred", vec![0.5; 10])]),
        ]);
        let stage = VarianceStage::new(config(), schema());
        stage.initialize(driver).unwrap();
        let err = stage.start(&input(vec![pitch_param()])).unwrap_err();
        assert!(err
            .to_string()
            .contains("predicted parameter count mismatch: expected 2, got 1"));
    }

    #[test]
    fn empty_schema_fails() {
        let driver = MockDriver::with_handlers(vec![]);
        let stage = VarianceStage::new(
            config(),
            Arc::new(VarianceSchema {
                predictions: vec![],
                use_rest_flags: false,
                use_expressiveness: false,
            }),
        );
        stage.initialize(driver).unwrap();
        let err = stage.start(&input(vec![pitch_param()])).unwrap_err();
        assert!(err.to_string().contains("no parameters to predict"));
    }
}
