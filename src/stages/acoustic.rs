//! Acoustic stage: token/duration/f0/parameter tensors in, mel out.
//!
//! The f0 curve fed to the model is also part of the stage result so the
//! vocoder receives exactly the curve the mel was rendered with. ToneShift
//! is applied additively (`shift/100`) when the base curve is midi pitch and
//! multiplicatively (`2^(shift/1200)`) when it is already F0 in Hz.

use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};

use crate::config::AcousticConfig;
use crate::prep::phoneme::{phoneme_durations, phoneme_languages, phoneme_tokens};
use crate::prep::speaker::speaker_embedding_frames;
use crate::prep::{resample, speedup_from_steps, DIFFUSION_TOTAL_STEPS};
use crate::score::{ParamTag, Parameter};
use crate::session::{InferenceDriver, InferenceSession, SessionInput, SessionOpenArgs};
use crate::tensor::Tensor;
use crate::{Error, Result};

use super::{
    check_startable, fail, AcousticOutput, Inference, StageInput, StageOutput, StageState,
    StateCell,
};

/// Manifest class name of the acoustic inference.
pub const API_CLASS: &str = "svs.inference.acoustic";

const OUT_MEL: &str = "mel";

const A4_FREQ_HZ: f64 = 440.0;
const MIDI_A4_NOTE: f64 = 69.0;

#[derive(Default)]
struct Inner {
    driver: Option<Arc<dyn InferenceDriver>>,
    session: Option<Arc<dyn InferenceSession>>,
    result: Option<AcousticOutput>,
}

pub struct AcousticStage {
    config: Arc<AcousticConfig>,
    state: StateCell,
    inner: RwLock<Inner>,
}

impl AcousticStage {
    pub fn new(config: Arc<AcousticConfig>) -> AcousticStage {
        AcousticStage {
            config,
            state: StateCell::new(),
            inner: RwLock::new(Inner::default()),
        }
    }
}

/// Build the f0 tensor from the base curve, optionally tone-shifted, and
/// converted from midi when the base is a Pitch parameter.
fn build_f0(
    base: &Parameter,
    convert_from_midi: bool,
    tone_shift: Option<&Parameter>,
    frame_width: f64,
    target_length: usize,
) -> Result<Tensor> {
    let mut samples = resample(&base.values, base.interval, frame_width, target_length, true);
    if samples.len() != target_length {
        return Err(Error::Session(format!(
            "parameter {} resample failed",
            base.tag.name()
        )));
    }

    if let Some(shift) = tone_shift {
        if !shift.values.is_empty() {
            let shift_samples = resample(
                &shift.values,
                shift.interval,
                frame_width,
                target_length,
                false,
            );
            if shift_samples.len() != target_length {
                return Err(Error::Session(format!(
                    "parameter {} resample failed",
                    shift.tag.name()
                )));
            }
            if convert_from_midi {
                for (s, shift) in samples.iter_mut().zip(&shift_samples) {
                    *s += shift / 100.0;
                }
            } else {
                for (s, shift) in samples.iter_mut().zip(&shift_samples) {
                    *s *= (shift / 1200.0).exp2();
                }
            }
        }
    }

    let curve: Vec<f32> = if convert_from_midi {
        samples
            .iter()
            .map(|&midi| (A4_FREQ_HZ * ((midi - MIDI_A4_NOTE) / 12.0).exp2()) as f32)
            .collect()
    } else {
        samples.iter().map(|&hz| hz as f32).collect()
    };
    Tensor::create_from_view::<f32>(vec![1, target_length as i64], &curve)
}

impl Inference for AcousticStage {
    fn initialize(&self, driver: Arc<dyn InferenceDriver>) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.result = None;

        let session = driver.create_session();
        if let Err(e) = session.open(&self.config.model, &SessionOpenArgs::default()) {
            return fail(&self.state, e);
        }

        inner.session = Some(session);
        inner.driver = Some(driver);
        self.state.set(StageState::Idle);
        Ok(())
    }

    fn start(&self, input: &StageInput) -> Result<StageOutput> {
        check_startable("acoustic", &self.state)?;
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

        let StageInput::Acoustic(input) = input else {
            return fail(
                &self.state,
                Error::InvalidArgument(
                    "acoustic stage expects an acoustic input payload".to_string(),
                ),
            );
        };

        let config = &self.config;
        let frame_width = config.frame_width();

        let mut session_input = SessionInput::default();

        match phoneme_tokens(&input.words, &config.phonemes) {
            Ok(t) => {
                session_input.inputs.insert("tokens".to_string(), t);
            }
            Err(e) => return fail(&self.state, e),
        }
        if config.use_language_id {
            match phoneme_languages(&input.words, &config.languages) {
                Ok(t) => {
                    session_input.inputs.insert("languages".to_string(), t);
                }
                Err(e) => return fail(&self.state, e),
            }
        }

        let target_length;
        match phoneme_durations(&input.words, frame_width) {
            Ok((t, total)) => {
                session_input.inputs.insert("durations".to_string(), t);
                target_length = total;
            }
            Err(e) => return fail(&self.state, e),
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

        // Shallow-diffusion depth.
        if config.use_variable_depth {
            session_input.inputs.insert(
                "depth".to_string(),
                Tensor::create_scalar::<f32>(input.depth as f32),
            );
        } else {
            let mut int_depth = (input.depth * 1000.0).round() as i64;
            int_depth = int_depth.min(config.max_depth);
            // Keep the depth divisible by the acceleration.
            let step = acceleration.max(1);
            int_depth = int_depth / step * step;
            session_input
                .inputs
                .insert("depth".to_string(), Tensor::create_scalar::<i64>(int_depth));
        }

        // Per-frame parameter curves.
        let declared = |tag: ParamTag| config.parameters.contains(&tag);
        let mut satisfied: BTreeSet<ParamTag> = BTreeSet::new();
        let mut f0_param: Option<&Parameter> = None;
        let mut pitch_param: Option<&Parameter> = None;
        let mut tone_shift_param: Option<&Parameter> = None;

        for param in &input.parameters {
            match param.tag {
                ParamTag::F0 => {
                    f0_param = Some(param);
                    continue;
                }
                ParamTag::Pitch => {
                    pitch_param = Some(param);
                    continue;
                }
                ParamTag::ToneShift => {
                    tone_shift_param = Some(param);
                    continue;
                }
                _ => {}
            }
            if !declared(param.tag) || param.values.is_empty() {
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
            match Tensor::create_from_view::<f32>(vec![1, target_length], &curve) {
                Ok(t) => {
                    session_input.inputs.insert(param.tag.name().to_string(), t);
                }
                Err(e) => return fail(&self.state, e),
            }
            satisfied.insert(param.tag);
        }

        // Gender and velocity have defaults; the remaining declared variance
        // curves are hard requirements, except mouth opening.
        if declared(ParamTag::Gender) && !satisfied.contains(&ParamTag::Gender) {
            match Tensor::create_filled::<f32>(vec![1, target_length], 0.0) {
                Ok(t) => {
                    session_input.inputs.insert("gender".to_string(), t);
                }
                Err(e) => return fail(&self.state, e),
            }
        }
        if declared(ParamTag::Velocity) && !satisfied.contains(&ParamTag::Velocity) {
            match Tensor::create_filled::<f32>(vec![1, target_length], 1.0) {
                Ok(t) => {
                    session_input.inputs.insert("velocity".to_string(), t);
                }
                Err(e) => return fail(&self.state, e),
            }
        }
        let missing: Vec<&str> = [
            ParamTag::Energy,
            ParamTag::Breathiness,
            ParamTag::Voicing,
            ParamTag::Tension,
        ]
        .iter()
        .filter(|&&tag| declared(tag) && !satisfied.contains(&tag))
        .map(|&tag| tag.name())
        .collect();
        if !missing.is_empty() {
            let list: Vec<String> = missing.iter().map(|n| format!(r#""{n}""#)).collect();
            return fail(
                &self.state,
                Error::Session(format!(
                    "some required parameters missing: {}",
                    list.join(" ")
                )),
            );
        }

        // f0 first; fall back to midi pitch converted to Hz.
        let f0_tensor = if let Some(param) = f0_param {
            build_f0(
                param,
                false,
                tone_shift_param,
                frame_width,
                target_length as usize,
            )
        } else if let Some(param) = pitch_param {
            build_f0(
                param,
                true,
                tone_shift_param,
                frame_width,
                target_length as usize,
            )
        } else {
            Err(Error::Session("parameter f0 or pitch missing".to_string()))
        };
        let f0_tensor = match f0_tensor {
            Ok(t) => t,
            Err(e) => return fail(&self.state, e),
        };
        session_input
            .inputs
            .insert("f0".to_string(), f0_tensor.clone());

        if config.use_speaker_embedding {
            if input.speakers.is_empty() {
                return fail(
                    &self.state,
                    Error::Session("no speakers found in acoustic input".to_string()),
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

        session_input.outputs.insert(OUT_MEL.to_string());

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let session = match inner.session.as_ref().filter(|s| s.is_open()) {
            Some(session) => session,
            None => {
                return fail(
                    &self.state,
                    Error::Session("acoustic session is not initialized".to_string()),
                )
            }
        };
        let output = match session.start(session_input) {
            Ok(output) => output,
            Err(e) => return fail(&self.state, e),
        };

        let mel = match output.outputs.get(OUT_MEL) {
            Some(mel) => mel.clone(),
            None => return fail(&self.state, Error::Session("invalid result output".to_string())),
        };

        let result = AcousticOutput {
            mel,
            f0: f0_tensor,
        };
        inner.result = Some(result.clone());
        drop(inner);

        self.state.set(StageState::Idle);
        Ok(StageOutput::Acoustic(result))
    }

    fn stop(&self) -> bool {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let Some(session) = inner.session.as_ref() else {
            return false;
        };
        if !session.is_open() {
            return false;
        }
        if !session.stop() {
            return false;
        }
        self.state.set(StageState::Terminated);
        true
    }

    fn state(&self) -> StageState {
        self.state.get()
    }

    fn result(&self) -> Option<StageOutput> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.result.clone().map(StageOutput::Acoustic)
    }
}

#[cfg(test)]
mod tests {
    use super::super::AcousticInput;
    use super::*;
    use crate::config::MelSpec;
    use crate::score::{Note, Phone, Word};
    use crate::session::testing::{emit_floats, MockDriver};
    use std::collections::HashMap;

    fn config(parameters: &[ParamTag]) -> Arc<AcousticConfig> {
        Arc::new(AcousticConfig {
            model: "acoustic.onnx".into(),
            mel: MelSpec {
                sample_rate: 100,
                hop_size: 1,
                ..MelSpec::default()
            },
            phonemes: [("a", 1i64)].map(|(k, v)| (k.to_string(), v)).into(),
            languages: HashMap::new(),
            speakers: HashMap::new(),
            hidden_size: 0,
            parameters: parameters.iter().copied().collect(),
            use_language_id: false,
            use_speaker_embedding: false,
            use_variable_depth: false,
            use_continuous_acceleration: false,
            max_depth: 1000,
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

    fn param(tag: ParamTag, values: Vec<f64>) -> Parameter {
        Parameter {
            tag,
            values,
            interval: 0.01,
            retake: None,
        }
    }

    fn input(parameters: Vec<Parameter>, steps: i64, depth: f64) -> StageInput {
        StageInput::Acoustic(AcousticInput {
            duration: 0.1,
            words: words(),
            parameters,
            speakers: vec![],
            steps,
            depth,
        })
    }

    fn mel_handler() -> crate::session::testing::Handler {
        emit_floats(vec![(OUT_MEL, vec![0.125; 10])])
    }

    fn stage(config: Arc<AcousticConfig>) -> (Arc<MockDriver>, AcousticStage) {
        let driver = MockDriver::with_handlers(vec![mel_handler()]);
        let stage = AcousticStage::new(config);
        stage.initialize(driver.clone()).unwrap();
        (driver, stage)
    }

    #[test]
    fn depth_is_clipped_and_discretised() {
        let (driver, stage) = stage(config(&[]));
        // steps 37 → speedup 25; depth 0.417 → 417 → 400.
        stage
            .start(&input(vec![param(ParamTag::Pitch, vec![69.0; 10])], 37, 0.417))
            .unwrap();
        let call = driver.session(0).call(0);
        assert_eq!(call.inputs["speedup"].view::<i64>().unwrap(), &[25]);
        assert_eq!(call.inputs["depth"].view::<i64>().unwrap(), &[400]);
        assert_eq!(call.inputs["durations"].view::<i64>().unwrap(), &[10]);
        assert!(call.outputs.contains(OUT_MEL));
    }

    #[test]
    fn variable_depth_passes_float() {
        let mut config = (*config(&[])).clone();
        config.use_variable_depth = true;
        let (driver, stage) = stage(Arc::new(config));
        stage
            .start(&input(vec![param(ParamTag::Pitch, vec![69.0; 10])], 37, 0.417))
            .unwrap();
        let call = driver.session(0).call(0);
        assert_eq!(call.inputs["depth"].view::<f32>().unwrap(), &[0.417]);
    }

    #[test]
    fn midi_pitch_converts_to_hz() {
        let (driver, stage) = stage(config(&[]));
        let StageOutput::Acoustic(out) = stage
            .start(&input(vec![param(ParamTag::Pitch, vec![69.0; 10])], 50, 1.0))
            .unwrap()
        else {
            panic!("wrong output variant");
        };
        let f0 = out.f0.view::<f32>().unwrap();
        for &hz in f0 {
            assert!((hz - 440.0).abs() < 1e-3);
        }
        // The same tensor went to the model.
        let call = driver.session(0).call(0);
        assert_eq!(call.inputs["f0"], out.f0);
        assert_eq!(out.mel.view::<f32>().unwrap(), &[0.125; 10]);
    }

    #[test]
    fn tone_shift_is_additive_on_midi() {
        let (driver, stage) = stage(config(&[]));
        stage
            .start(&input(
                vec![
                    param(ParamTag::Pitch, vec![69.0; 10]),
                    param(ParamTag::ToneShift, vec![100.0; 10]),
                ],
                50,
                1.0,
            ))
            .unwrap();
        let call = driver.session(0).call(0);
        let f0 = call.inputs["f0"].view::<f32>().unwrap();
        let expected = 440.0 * 2f32.powf(1.0 / 12.0);
        for &hz in f0 {
            assert!((hz - expected).abs() < 1e-2);
        }
    }

    #[test]
    fn tone_shift_is_multiplicative_on_hz() {
        let (driver, stage) = stage(config(&[]));
        stage
            .start(&input(
                vec![
                    param(ParamTag::F0, vec![440.0; 10]),
                    param(ParamTag::ToneShift, vec![1200.0; 10]),
                ],
                50,
                1.0,
            ))
            .unwrap();
        let call = driver.session(0).call(0);
        let f0 = call.inputs["f0"].view::<f32>().unwrap();
        for &hz in f0 {
            assert!((hz - 880.0).abs() < 1e-2);
        }
    }

    #[test]
    fn missing_f0_and_pitch_fails() {
        let (_driver, stage) = stage(config(&[]));
        let err = stage.start(&input(vec![], 50, 1.0)).unwrap_err();
        assert!(err.to_string().contains("parameter f0 or pitch missing"));
        assert_eq!(stage.state(), StageState::Failed);
    }

    #[test]
    fn declared_variance_curves_are_required() {
        let (_driver, stage) = stage(config(&[
            ParamTag::Energy,
            ParamTag::Breathiness,
            ParamTag::MouthOpening,
        ]));
        let err = stage
            .start(&input(
                vec![
                    param(ParamTag::Pitch, vec![69.0; 10]),
                    param(ParamTag::Energy, vec![0.5; 10]),
                ],
                50,
                1.0,
            ))
            .unwrap_err();
        // Breathiness is required; mouth opening is not.
        let msg = err.to_string();
        assert!(msg.contains(r#"some required parameters missing: "breathiness""#), "{msg}");
        assert!(!msg.contains("mouth_opening"), "{msg}");
    }

    #[test]
    fn gender_and_velocity_default_when_declared() {
        let (driver, stage) = stage(config(&[ParamTag::Gender, ParamTag::Velocity]));
        stage
            .start(&input(vec![param(ParamTag::Pitch, vec![69.0; 10])], 50, 1.0))
            .unwrap();
        let call = driver.session(0).call(0);
        assert_eq!(call.inputs["gender"].view::<f32>().unwrap(), &[0.0; 10]);
        assert_eq!(call.inputs["velocity"].view::<f32>().unwrap(), &[1.0; 10]);
    }

    #[test]
    fn supplied_transition_curves_are_resampled_in() {
        let (driver, stage) = stage(config(&[ParamTag::Gender]));
        stage
            .start(&input(
                vec![
                    param(ParamTag::Pitch, vec![69.0; 10]),
                    param(ParamTag::Gender, vec![0.5; 10]),
                ],
                50,
                1.0,
            ))
            .unwrap();
        let call = driver.session(0).call(0);
        assert_eq!(call.inputs["gender"].view::<f32>().unwrap(), &[0.5; 10]);
    }

    #[test]
    fn undeclared_curves_are_ignored() {
        let (driver, stage) = stage(config(&[]));
        stage
            .start(&input(
                vec![
                    param(ParamTag::Pitch, vec![69.0; 10]),
                    param(ParamTag::Energy, vec![0.5; 10]),
                ],
                50,
                1.0,
            ))
            .unwrap();
        let call = driver.session(0).call(0);
        assert!(!call.inputs.contains_key("energy"));
    }
}
