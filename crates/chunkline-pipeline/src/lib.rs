//! # chunkline-pipeline
//!
//! Autoregressive inference over a transformer split into sequentially
//! executed chunks.
//!
//! - [`ModelPipeline`] discovers, loads and resolves a chunk set, then
//!   starts [`Generation`]s that yield one [`Prediction`] per token.
//! - [`BufferStore`] keeps one zero-copy buffer per tensor so chunks read
//!   and write in place across steps.
//! - [`CacheMaintainer`] folds each window's new key/value slices into the
//!   caches in the background, overlapping later chunks.
//! - `testing` (behind the `testing` feature) holds a synthetic runtime
//!   for exercising the engine without real model artifacts.

pub mod buffers;
pub mod chunk;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod instrument;
pub mod maintainer;
pub mod names;
pub mod resolver;
pub mod sampler;
pub mod task_group;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Vocabulary index of a token.
pub type TokenId = i32;

pub use buffers::{BufferScope, BufferStore, OutputAliases, ResizeReport};
pub use chunk::{ChunkModel, ChunkVariant};
pub use config::PipelineConfig;
pub use discovery::{discover_chunks, ChunkArtifacts};
pub use engine::{Generation, ModelPipeline, PipelineState, Prediction, PredictionKind, Window};
pub use error::{PipelineError, Result};
pub use instrument::{Instrumentation, IntervalToken, NoopInstrumentation, TracingInstrumentation};
pub use maintainer::{CacheMaintainer, CacheUpdateTask, TaskState};
pub use resolver::{resolve, InferenceConfiguration};
pub use sampler::{ArgmaxSampler, ModelSampler, Sampler};
pub use task_group::TaskGroup;
