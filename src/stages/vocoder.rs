//! Vocoder stage: mel plus f0 in, raw waveform bytes out.

use std::sync::{Arc, PoisonError, RwLock};

use crate::config::VocoderConfig;
use crate::session::{InferenceDriver, InferenceSession, SessionInput, SessionOpenArgs};
use crate::{Error, Result};

use super::{
    check_startable, fail, Inference, StageInput, StageOutput, StageState, StateCell,
    VocoderOutput,
};

/// Manifest class name of the vocoder inference.
pub const API_CLASS: &str = "svs.inference.vocoder";

const OUT_WAVEFORM: &str = "waveform";

#[derive(Default)]
struct Inner {
    driver: Option<Arc<dyn InferenceDriver>>,
    session: Option<Arc<dyn InferenceSession>>,
    result: Option<VocoderOutput>,
}

pub struct VocoderStage {
    config: Arc<VocoderConfig>,
    state: StateCell,
    inner: RwLock<Inner>,
}

impl VocoderStage {
    pub fn new(config: Arc<VocoderConfig>) -> VocoderStage {
        VocoderStage {
            config,
            state: StateCell::new(),
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Inference for VocoderStage {
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
        check_startable("vocoder", &self.state)?;
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

        let StageInput::Vocoder(input) = input else {
            return fail(
                &self.state,
                Error::InvalidArgument("vocoder stage expects a vocoder input payload".to_string()),
            );
        };

        let mut session_input = SessionInput::default();
        session_input
            .inputs
            .insert("mel".to_string(), input.mel.clone());
        session_input
            .inputs
            .insert("f0".to_string(), input.f0.clone());
        session_input.outputs.insert(OUT_WAVEFORM.to_string());

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let session = match inner.session.as_ref().filter(|s| s.is_open()) {
            Some(session) => session,
            None => {
                return fail(
                    &self.state,
                    Error::Session("vocoder session is not initialized".to_string()),
                )
            }
        };
        let output = match session.start(session_input) {
            Ok(output) => output,
            Err(e) => return fail(&self.state, e),
        };

        let waveform = match output.outputs.get(OUT_WAVEFORM) {
            Some(waveform) => waveform,
            None => return fail(&self.state, Error::Session("invalid result output".to_string())),
        };

        let result = VocoderOutput {
            audio: waveform.raw_bytes(),
        };
        inner.result = Some(result.clone());
        drop(inner);

        self.state.set(StageState::Idle);
        Ok(StageOutput::Vocoder(result))
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
        inner.result.clone().map(StageOutput::Vocoder)
    }
}
