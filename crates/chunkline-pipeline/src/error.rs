use std::path::PathBuf;

use chunkline_core::{BufferId, CoreError, Shape};

/// Errors returned by the pipeline.
///
/// Configuration and capacity errors are returned before generation starts;
/// the rest abort a running generation.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid pipeline config: {0}")]
    Config(String),

    #[error("found several model prefixes in {}: {prefixes:?}; set model_prefix to pick one", dir.display())]
    AmbiguousModelPrefix { dir: PathBuf, prefixes: Vec<String> },

    #[error("no chunk artifacts found in {}", .0.display())]
    NoChunksFound(PathBuf),

    #[error("chunk indices must be contiguous from 0, found {0:?}")]
    NonContiguousChunks(Vec<usize>),

    #[error("unsupported inference configuration: {0}")]
    UnsupportedInferenceConfiguration(String),

    #[error("prompt of {prompt} tokens does not fit the context length {context}")]
    PromptTooLong { prompt: usize, context: usize },

    #[error("prompt is empty")]
    EmptyPrompt,

    #[error("chunk {chunk} wrote '{name}' into buffer {actual}, expected {expected}")]
    AliasingViolation {
        chunk: usize,
        name: String,
        expected: BufferId,
        actual: BufferId,
    },

    #[error("buffer '{name}' is declared as {first} and as {second}")]
    ShapeConflict { name: String, first: Shape, second: Shape },

    #[error("failed to load {}: {source}", path.display())]
    ModelLoad {
        path: PathBuf,
        #[source]
        source: CoreError,
    },

    #[error("pipeline is not loaded")]
    NotLoaded,

    #[error("chunk {chunk} runs {native} tokens per step but the configuration expects {expected}")]
    SequenceLengthMismatch {
        chunk: usize,
        native: usize,
        expected: usize,
    },

    #[error("cache maintenance for chunk {chunk} failed: {reason}")]
    CacheMaintenance { chunk: usize, reason: String },

    #[error("background task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
