use std::path::PathBuf;

use crate::{BufferId, DType, Shape};

/// Errors raised by tensors, the buffer arena and the model boundary.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("expected {expected} elements for shape {shape}, got {got}")]
    ElementCount {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    #[error("buffer handle {0} is not live in this arena")]
    StaleHandle(usize),

    #[error("could not allocate {dtype} buffer of shape {shape}: {reason}")]
    Allocation {
        dtype: DType,
        shape: Shape,
        reason: String,
    },

    #[error("sequence axis mismatch between buffers {first} ({first_shape}) and {second} ({second_shape})")]
    SequenceAxis {
        first: BufferId,
        first_shape: Shape,
        second: BufferId,
        second_shape: Shape,
    },

    #[error("missing feature '{0}'")]
    MissingFeature(String),

    #[error("failed to load model '{path}': {reason}")]
    ModelLoad { path: PathBuf, reason: String },

    #[error("model execution failed: {0}")]
    Execution(String),
}
