//! Duration stage: linguistic encoder plus phoneme-duration predictor.
//!
//! The predictor receives the encoder's outputs, a per-phone midi curve
//! (`ph_midi`), and optionally a per-phone speaker mix (`spk_embed`). Its
//! `ph_dur_pred` output is rescaled word by word so each word's predicted
//! durations sum to the word's note length.

use std::sync::{Arc, PoisonError, RwLock};

use crate::config::{DurationConfig, LinguisticMode};
use crate::prep::linguistic::{linguistic_phoneme_input, linguistic_word_input, run_encoder};
use crate::prep::phoneme::phoneme_midi;
use crate::prep::speaker::speaker_embedding_phones;
use crate::score::phone_count;
use crate::session::{InferenceDriver, InferenceSession, SessionInput, SessionOpenArgs};
use crate::tensor::DataType;
use crate::{Error, Result};

use super::{
    check_startable, fail, DurationOutput, Inference, StageInput, StageOutput, StageState,
    StateCell,
};

/// Manifest class name of the duration inference.
pub const API_CLASS: &str = "svs.inference.duration";

const OUT_PH_DUR_PRED: &str = "ph_dur_pred";

#[derive(Default)]
struct Inner {
    driver: Option<Arc<dyn InferenceDriver>>,
    encoder: Option<Arc<dyn InferenceSession>>,
    predictor: Option<Arc<dyn InferenceSession>>,
    result: Option<DurationOutput>,
}

pub struct DurationStage {
    config: Arc<DurationConfig>,
    state: StateCell,
    inner: RwLock<Inner>,
}

impl DurationStage {
    pub fn new(config: Arc<DurationConfig>) -> DurationStage {
        DurationStage {
            config,
            state: StateCell::new(),
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Inference for DurationStage {
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
        check_startable("duration", &self.state)?;
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

        let StageInput::Duration(input) = input else {
            return fail(
                &self.state,
                Error::InvalidArgument("duration stage expects a duration input payload".to_string()),
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
                            "duration linguistic encoder session is not initialized".to_string(),
                        ),
                    )
                }
            };
            if let Err(e) = run_encoder(encoder.as_ref(), linguistic, &mut session_input) {
                return fail(&self.state, e);
            }
        }

        // Part 2: duration predictor.
        match phoneme_midi(&input.words) {
            Ok(tensor) => {
                session_input.inputs.insert("ph_midi".to_string(), tensor);
            }
            Err(e) => return fail(&self.state, e),
        }

        let n_phones = phone_count(&input.words);
        if config.use_speaker_embedding {
            match speaker_embedding_phones(&input.words, &config.speakers, config.hidden_size) {
                Ok(tensor) => {
                    session_input.inputs.insert("spk_embed".to_string(), tensor);
                }
                Err(e) => return fail(&self.state, e),
            }
        }

        session_input.outputs.insert(OUT_PH_DUR_PRED.to_string());

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let predictor = match inner.predictor.as_ref().filter(|s| s.is_open()) {
            Some(predictor) => predictor,
            None => {
                return fail(
                    &self.state,
                    Error::Session("duration predictor session is not initialized".to_string()),
                )
            }
        };
        let output = match predictor.start(session_input) {
            Ok(output) => output,
            Err(e) => return fail(&self.state, e),
        };

        let tensor = match output.outputs.get(OUT_PH_DUR_PRED) {
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

        // Rescale every word's predicted durations to its score length.
        let mut durations: Vec<f64> = view.iter().map(|&v| v as f64).collect();
        let mut begin = 0usize;
        for word in &input.words {
            if word.phones.is_empty() {
                return fail(
                    &self.state,
                    Error::Session(
                        "error scaling duration results: word with no phonemes".to_string(),
                    ),
                );
            }
            let end = begin + word.phones.len();
            if end > durations.len() {
                break;
            }
            let predicted: f64 = durations[begin..end].iter().sum();
            if predicted == 0.0 || predicted.is_nan() || predicted.is_infinite() {
                return fail(
                    &self.state,
                    Error::Session(format!(
                        "error scaling duration results: invalid predicted word duration: {predicted}"
                    )),
                );
            }
            let scale = word.duration() / predicted;
            for d in &mut durations[begin..end] {
                *d *= scale;
            }
            begin = end;
        }

        if durations.len() != n_phones {
            return fail(
                &self.state,
                Error::Session(format!(
                    "predicted phoneme count mismatch: expected {n_phones}, got {}",
                    durations.len()
                )),
            );
        }

        let result = DurationOutput { durations };
        inner.result = Some(result.clone());
        drop(inner);

        self.state.set(StageState::Idle);
        Ok(StageOutput::Duration(result))
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
        inner.result.clone().map(StageOutput::Duration)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{DurationInput, VocoderInput};
    use super::*;
    use crate::score::{Note, Phone, SpeakerMix, Word};
    use crate::session::testing::{emit_floats, MockDriver};
    use std::collections::HashMap;

    fn config() -> Arc<DurationConfig> {
        Arc::new(DurationConfig {
            encoder: "enc.onnx".into(),
            predictor: "pred.onnx".into(),
            frame_width: 0.01,
            phonemes: [("a", 1i64), ("b", 2), ("c", 3)]
                .map(|(k, v)| (k.to_string(), v))
                .into(),
            languages: HashMap::new(),
            speakers: HashMap::new(),
            hidden_size: 0,
            linguistic_mode: LinguisticMode::Word,
            use_language_id: false,
            use_speaker_embedding: false,
        })
    }

    fn words() -> Vec<Word> {
        vec![Word {
            phones: vec![
                Phone {
                    token: "a".to_string(),
                    start: 0.0,
                    speakers: vec![],
                },
                Phone {
                    token: "b".to_string(),
                    start: 0.2,
                    speakers: vec![],
                },
            ],
            notes: vec![Note {
                key: 60,
                cents: 0,
                duration: 0.5,
                is_rest: false,
            }],
            language: None,
        }]
    }

    fn input() -> StageInput {
        StageInput::Duration(DurationInput {
            duration: 0.5,
            words: words(),
        })
    }

    #[test]
    fn rescales_predictions_to_word_length() {
        let driver = MockDriver::with_handlers(vec![
            emit_floats(vec![("encoder_out", vec![0.1, 0.2])]),
            emit_floats(vec![(OUT_PH_DUR_PRED, vec![1.0, 3.0])]),
        ]);
        let stage = DurationStage::new(config());
        stage.initialize(driver.clone()).unwrap();

        let StageOutput::Duration(out) = stage.start(&input()).unwrap() else {
            panic!("wrong output variant");
        };
        // Word is 0.5 s, predicted sum 4.0 → scale 0.125.
        assert_eq!(out.durations, vec![0.125, 0.375]);
        assert_eq!(stage.state(), StageState::Idle);
        assert!(stage.result().is_some());

        // The predictor saw the encoder's outputs plus ph_midi.
        let predictor_call = driver.session(1).call(0);
        assert!(predictor_call.inputs.contains_key("encoder_out"));
        assert_eq!(
            predictor_call.inputs["ph_midi"].view::<i64>().unwrap(),
            &[60, 60]
        );
        assert!(predictor_call.outputs.contains(OUT_PH_DUR_PRED));
        // The encoder saw the linguistic tensors.
        let encoder_call = driver.session(0).call(0);
        assert!(encoder_call.inputs.contains_key("tokens"));
        assert!(encoder_call.inputs.contains_key("word_dur"));
    }

    #[test]
    fn zero_predicted_sum_fails_the_stage() {
        let driver = MockDriver::with_handlers(vec![
            emit_floats(vec![("encoder_out", vec![0.0, 0.0])]),
            emit_floats(vec![(OUT_PH_DUR_PRED, vec![0.0, 0.0])]),
        ]);
        let stage = DurationStage::new(config());
        stage.initialize(driver).unwrap();

        let err = stage.start(&input()).unwrap_err();
        assert!(err
            .to_string()
            .contains("invalid predicted word duration"));
        assert_eq!(stage.state(), StageState::Failed);

        // A failed stage rejects further starts.
        let err = stage.start(&input()).unwrap_err();
        assert!(err.to_string().contains("terminal state"));
    }

    #[test]
    fn predicted_count_mismatch_fails() {
        let driver = MockDriver::with_handlers(vec![
            emit_floats(vec![("encoder_out", vec![0.0])]),
            emit_floats(vec![(OUT_PH_DUR_PRED, vec![1.0, 1.0, 1.0])]),
        ]);
        let stage = DurationStage::new(config());
        stage.initialize(driver).unwrap();

        let err = stage.start(&input()).unwrap_err();
        assert!(err
            .to_string()
            .contains("predicted phoneme count mismatch: expected 2, got 3"));
    }

    #[test]
    fn start_before_initialize_reports_missing_driver() {
        let stage = DurationStage::new(config());
        let err = stage.start(&input()).unwrap_err();
        assert!(err.to_string().contains("inference driver not initialized"));
        assert_eq!(stage.state(), StageState::Failed);
    }

    #[test]
    fn wrong_input_variant_is_invalid_argument() {
        let driver = MockDriver::with_handlers(vec![]);
        let stage = DurationStage::new(config());
        stage.initialize(driver).unwrap();
        let err = stage
            .start(&StageInput::Vocoder(VocoderInput {
                mel: crate::tensor::Tensor::create_scalar::<f32>(0.0),
                f0: crate::tensor::Tensor::create_scalar::<f32>(0.0),
            }))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn per_phone_speaker_mix_when_enabled() {
        let mut config = (*config()).clone();
        config.use_speaker_embedding = true;
        config.hidden_size = 2;
        config
            .speakers
            .insert("alto".to_string(), vec![1.0, -1.0]);
        let driver = MockDriver::with_handlers(vec![
            emit_floats(vec![("encoder_out", vec![0.0, 0.0])]),
            emit_floats(vec![(OUT_PH_DUR_PRED, vec![1.0, 1.0])]),
        ]);
        let stage = DurationStage::new(Arc::new(config));
        stage.initialize(driver.clone()).unwrap();

        let mut words = words();
        for phone in &mut words[0].phones {
            phone.speakers = vec![SpeakerMix {
                name: "alto".to_string(),
                proportion: 0.5,
            }];
        }
        stage
            .start(&StageInput::Duration(DurationInput {
                duration: 0.5,
                words,
            }))
            .unwrap();

        let spk = driver.session(1).call(0).inputs["spk_embed"].clone();
        assert_eq!(spk.shape(), &[1, 2, 2]);
        assert_eq!(spk.view::<f32>().unwrap(), &[0.5, -0.5, 0.5, -0.5]);
    }

    #[test]
    fn stop_terminates_the_stage() {
        let driver = MockDriver::with_handlers(vec![]);
        let stage = DurationStage::new(config());
        stage.initialize(driver).unwrap();
        assert!(stage.stop());
        assert_eq!(stage.state(), StageState::Terminated);
        assert!(stage.start(&input()).is_err());
    }

    #[test]
    fn start_async_is_not_implemented() {
        let stage = DurationStage::new(config());
        let err = stage.start_async(&input()).unwrap_err();
        assert!(matches!(err, Error::NotImplemented(_)));
    }
}
