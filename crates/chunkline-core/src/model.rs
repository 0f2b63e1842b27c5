//! The execution-layer boundary: what a loaded model declares and how it is
//! invoked.
//!
//! Concrete runtimes (an accelerator framework, a CPU reference, the
//! synthetic models used in tests) implement [`Model`] and [`ModelLoader`];
//! the pipeline never sees anything else.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{DType, FeatureMap, Result, Shape};

/// Declared name, dtype and shape of one model input or output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDescription {
    pub name: String,
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorDescription {
    pub fn new(name: impl Into<String>, dtype: DType, shape: impl Into<Shape>) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape: shape.into(),
        }
    }
}

/// Everything a model declares about its interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelDescription {
    pub inputs: Vec<TensorDescription>,
    pub outputs: Vec<TensorDescription>,
}

impl ModelDescription {
    pub fn new(inputs: Vec<TensorDescription>, outputs: Vec<TensorDescription>) -> Self {
        Self { inputs, outputs }
    }

    pub fn input(&self, name: &str) -> Option<&TensorDescription> {
        self.inputs.iter().find(|d| d.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&TensorDescription> {
        self.outputs.iter().find(|d| d.name == name)
    }

    pub fn has_input(&self, name: &str) -> bool {
        self.input(name).is_some()
    }
}

/// A loaded, executable model.
///
/// `predict` receives the inputs plus a map of output backings. Every output
/// named in `backings` must be written into that exact tensor and returned as
/// (a clone of) it; outputs without a backing may be freshly allocated.
/// Implementations are called from blocking worker threads.
pub trait Model: Send + Sync {
    fn description(&self) -> &ModelDescription;

    fn predict(&self, inputs: &FeatureMap, backings: &FeatureMap) -> Result<FeatureMap>;
}

/// Where a model is allowed to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputePlacement {
    /// Host CPU only, for graphs with ops the accelerator cannot run.
    CpuOnly,
    /// Prefer the accelerator, fall back to the CPU.
    #[default]
    CpuAndAccelerator,
    /// Let the runtime pick any available unit.
    All,
}

impl fmt::Display for ComputePlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputePlacement::CpuOnly => write!(f, "cpu-only"),
            ComputePlacement::CpuAndAccelerator => write!(f, "cpu+accelerator"),
            ComputePlacement::All => write!(f, "all"),
        }
    }
}

/// Options for loading one artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOptions {
    pub placement: ComputePlacement,
    /// Named entry point inside a multi-function artifact.
    pub function: Option<String>,
}

/// Loads artifacts from disk into executable models.
pub trait ModelLoader: Send + Sync {
    fn load(&self, path: &Path, options: &LoadOptions) -> Result<Arc<dyn Model>>;

    /// Named entry points the artifact exposes. Runtimes without
    /// multi-function support report none.
    fn functions(&self, _path: &Path) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}
