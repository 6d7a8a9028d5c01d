//! The five stage runners and their shared lifecycle.
//!
//! Each stage owns its sessions behind a readers-writer lock and exposes the
//! same lifecycle: `initialize` opens the sessions, `start` runs one blocking
//! inference on the calling thread, `stop` requests cooperative cancellation
//! of an in-flight run, and `result` returns the most recent output.
//!
//! ```text
//! Uninitialised ──initialize──► Idle ──start──► Running ──► Idle
//!        │                       │                 │
//!        └────────── any failure ┴──────────► Failed (terminal)
//!                                  Running ──stop──► Terminated (terminal)
//! ```

pub mod acoustic;
pub mod duration;
pub mod pitch;
pub mod variance;
pub mod vocoder;

use std::sync::{Arc, PoisonError, RwLock};

use crate::score::{Parameter, SpeakerMix, Word};
use crate::session::InferenceDriver;
use crate::tensor::Tensor;
use crate::{Error, Result};

pub use acoustic::AcousticStage;
pub use duration::DurationStage;
pub use pitch::PitchStage;
pub use variance::VarianceStage;
pub use vocoder::VocoderStage;

/// Lifecycle state of a stage instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Uninitialized,
    Idle,
    Running,
    /// Terminal: a transition or run failed.
    Failed,
    /// Terminal: cancelled via `stop`.
    Terminated,
}

/// Readers-writer cell around the state variable; the enum drives validity.
pub(crate) struct StateCell(RwLock<StageState>);

impl StateCell {
    pub(crate) fn new() -> StateCell {
        StateCell(RwLock::new(StageState::Uninitialized))
    }

    pub(crate) fn get(&self) -> StageState {
        *self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set(&self, state: StageState) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Move the stage to `Failed` and propagate the error.
pub(crate) fn fail<T>(state: &StateCell, error: Error) -> Result<T> {
    state.set(StageState::Failed);
    Err(error)
}

/// Reject `start` on a terminal stage.
pub(crate) fn check_startable(stage: &str, state: &StateCell) -> Result<()> {
    match state.get() {
        StageState::Failed | StageState::Terminated => Err(Error::Session(format!(
            "{stage} stage is in a terminal state and cannot start"
        ))),
        _ => Ok(()),
    }
}

/// Input payload of the duration stage.
#[derive(Debug, Clone)]
pub struct DurationInput {
    pub duration: f64,
    pub words: Vec<Word>,
}

/// Input payload of the pitch stage.
#[derive(Debug, Clone)]
pub struct PitchInput {
    pub duration: f64,
    pub words: Vec<Word>,
    pub parameters: Vec<Parameter>,
    pub speakers: Vec<SpeakerMix>,
    pub steps: i64,
}

/// Input payload of the variance stage.
#[derive(Debug, Clone)]
pub struct VarianceInput {
    pub duration: f64,
    pub words: Vec<Word>,
    pub parameters: Vec<Parameter>,
    pub speakers: Vec<SpeakerMix>,
    pub steps: i64,
}

/// Input payload of the acoustic stage.
#[derive(Debug, Clone)]
pub struct AcousticInput {
    pub duration: f64,
    pub words: Vec<Word>,
    pub parameters: Vec<Parameter>,
    pub speakers: Vec<SpeakerMix>,
    pub steps: i64,
    pub depth: f64,
}

/// Input payload of the vocoder stage: the acoustic stage's outputs,
/// unmodified. Cloning these tensors bumps a refcount.
#[derive(Debug, Clone)]
pub struct VocoderInput {
    pub mel: Tensor,
    pub f0: Tensor,
}

/// Sum type over the five stage-specific inputs.
#[derive(Debug, Clone)]
pub enum StageInput {
    Duration(DurationInput),
    Pitch(PitchInput),
    Variance(VarianceInput),
    Acoustic(AcousticInput),
    Vocoder(VocoderInput),
}

/// Per-phone durations in seconds, rescaled to the score's word lengths.
#[derive(Debug, Clone)]
pub struct DurationOutput {
    pub durations: Vec<f64>,
}

/// The predicted pitch curve.
#[derive(Debug, Clone)]
pub struct PitchOutput {
    pub values: Vec<f64>,
    /// Seconds between consecutive samples (the stage's frame width).
    pub interval: f64,
}

/// One predicted parameter per schema entry.
#[derive(Debug, Clone)]
pub struct VarianceOutput {
    pub predictions: Vec<Parameter>,
}

/// Mel spectrogram plus the f0 curve fed to the model, both handed to the
/// vocoder by refcount bump.
#[derive(Debug, Clone)]
pub struct AcousticOutput {
    pub mel: Tensor,
    pub f0: Tensor,
}

/// Raw little-endian float32 mono PCM.
#[derive(Debug, Clone)]
pub struct VocoderOutput {
    pub audio: Vec<u8>,
}

/// Sum type over the five stage-specific outputs.
#[derive(Debug, Clone)]
pub enum StageOutput {
    Duration(DurationOutput),
    Pitch(PitchOutput),
    Variance(VarianceOutput),
    Acoustic(AcousticOutput),
    Vocoder(VocoderOutput),
}

/// Common lifecycle of the five inference stages.
pub trait Inference: Send + Sync {
    /// Open this stage's sessions on the given driver.
    /// `Uninitialised → Idle` on success, else `Failed`.
    fn initialize(&self, driver: Arc<dyn InferenceDriver>) -> Result<()>;

    /// Run one inference synchronously. `Idle → Running → Idle` on success,
    /// else `Failed`. Rejected once the stage is `Failed` or `Terminated`.
    fn start(&self, input: &StageInput) -> Result<StageOutput>;

    /// Asynchronous start is declared unsupported.
    fn start_async(&self, _input: &StageInput) -> Result<()> {
        Err(Error::NotImplemented("asynchronous stage start"))
    }

    /// Best-effort cancellation of an in-flight `start`; never blocks.
    fn stop(&self) -> bool;

    fn state(&self) -> StageState;

    /// The most recently produced output, if any.
    fn result(&self) -> Option<StageOutput>;
}
