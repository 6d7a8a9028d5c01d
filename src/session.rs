//! Interfaces to the neural runtime.
//!
//! Graph execution is an external collaborator: callers bring a driver for
//! their runtime of choice (ONNX or otherwise) and register it in a
//! [`RuntimeContext`]. The pipeline only ever exchanges name→tensor maps
//! through these traits.
//!
//! Sessions synchronise internally: `start` runs the model to completion on
//! the calling thread, while `stop` may be called concurrently from another
//! thread to request cooperative cancellation of an in-flight `start`.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use crate::tensor::Tensor;
use crate::Result;

/// Execution providers the CLI understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionProvider {
    #[default]
    Cpu,
    Cuda,
    DirectMl,
    CoreMl,
}

impl ExecutionProvider {
    /// Parse an execution-provider string. Unknown strings map to `None`.
    pub fn parse(s: &str) -> Option<ExecutionProvider> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Some(ExecutionProvider::Cpu),
            "cuda" => Some(ExecutionProvider::Cuda),
            "dml" | "directml" => Some(ExecutionProvider::DirectMl),
            "coreml" => Some(ExecutionProvider::CoreMl),
            _ => None,
        }
    }
}

/// Backend initialisation options.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverOptions {
    pub ep: ExecutionProvider,
    pub device_index: i32,
}

/// Per-session open options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOpenArgs {
    /// Force this session onto the CPU even when the driver targets a GPU.
    pub use_cpu: bool,
}

/// Name→tensor inputs plus the set of output names to fetch.
#[derive(Debug, Clone, Default)]
pub struct SessionInput {
    pub inputs: HashMap<String, Tensor>,
    /// Output names to fetch. Empty means "all model outputs".
    pub outputs: BTreeSet<String>,
}

/// Name→tensor outputs produced by a session run.
#[derive(Debug, Clone, Default)]
pub struct SessionOutput {
    pub outputs: HashMap<String, Tensor>,
}

/// One loaded model instance.
pub trait InferenceSession: Send + Sync {
    /// Load the model at `path`.
    fn open(&self, path: &Path, args: &SessionOpenArgs) -> Result<()>;

    /// Run the model synchronously to completion.
    fn start(&self, input: SessionInput) -> Result<SessionOutput>;

    /// Request cooperative cancellation of an in-flight [`start`]. Returns
    /// whether the request was accepted; it never blocks.
    ///
    /// [`start`]: InferenceSession::start
    fn stop(&self) -> bool;

    fn is_open(&self) -> bool;
}

/// Factory for [`InferenceSession`]s.
pub trait InferenceDriver: Send + Sync {
    /// Prepare the backend for the requested execution provider.
    fn initialize(&self, options: &DriverOptions) -> Result<()>;

    fn create_session(&self) -> Arc<dyn InferenceSession>;
}

/// Explicit registry of drivers, created at program start and threaded
/// through the pipeline instead of hiding behind module-level globals.
#[derive(Default)]
pub struct RuntimeContext {
    drivers: HashMap<String, Arc<dyn InferenceDriver>>,
}

impl RuntimeContext {
    pub fn new() -> RuntimeContext {
        RuntimeContext::default()
    }

    pub fn register_driver(&mut self, name: impl Into<String>, driver: Arc<dyn InferenceDriver>) {
        self.drivers.insert(name.into(), driver);
    }

    pub fn driver(&self, name: &str) -> Option<Arc<dyn InferenceDriver>> {
        self.drivers.get(name).cloned()
    }
}
