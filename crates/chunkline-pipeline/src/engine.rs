//! Pipeline engine: token-by-token generation across a chunked model.
//!
//! Each forward step runs every chunk in order. The buffer store supplies
//! inputs and output backings, the chunk's selected variant executes on the
//! blocking pool, and the outputs are checked to have landed in place. When
//! a step fills a whole window, each chunk's new cache slices are handed to
//! the cache maintainer and folded in the background while later chunks
//! run; the fold is joined right before that chunk runs again.
//!
//! ```text
//! prompt:     [piece 0][piece 1]...[piece k] → sample → transition
//! generation: [tok][tok][tok]...             → sample each step
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chunkline_core::{
    BufferId, ComputePlacement, DType, FeatureMap, HostAllocator, LoadOptions, Model, ModelDescription,
    ModelLoader, Shape, TensorAllocator, ZeroCopyTensor,
};
use futures::Stream;

use crate::buffers::{BufferScope, BufferStore, OutputAliases};
use crate::chunk::ChunkModel;
use crate::config::PipelineConfig;
use crate::discovery::discover_chunks;
use crate::error::{PipelineError, Result};
use crate::instrument::{Instrumentation, TracingInstrumentation};
use crate::maintainer::CacheMaintainer;
use crate::names;
use crate::resolver::{resolve, InferenceConfiguration};
use crate::sampler::{collect_logits, ArgmaxSampler, ModelSampler, Sampler};
use crate::TokenId;

/// Lifecycle of a [`ModelPipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Unloaded,
    Loading,
    Ready,
}

/// The slice of the token sequence one forward step processes.
///
/// With `count` tokens the window starts at the last multiple of
/// `query_length` below `count` and holds `count - start` real tokens
/// followed by padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: usize,
    pub real: usize,
    pub query_length: usize,
}

impl Window {
    pub fn new(count: usize, query_length: usize) -> Self {
        let query_length = query_length.max(1);
        let start = (count.saturating_sub(1) / query_length) * query_length;
        Self {
            start,
            real: count - start,
            query_length,
        }
    }

    pub fn padding(&self) -> usize {
        self.query_length - self.real
    }

    pub fn is_full(&self) -> bool {
        self.real == self.query_length
    }

    /// Window position of the most recent token.
    pub fn last_position(&self) -> usize {
        self.real.saturating_sub(1)
    }
}

/// Where a predicted token came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionKind {
    /// Taken from the prompt, not sampled.
    Prompt,
    Generated,
}

/// One emitted token.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub token: TokenId,
    /// Every token so far, prompt included.
    pub tokens: Vec<TokenId>,
    pub kind: PredictionKind,
    /// Wall time of the forward step that emitted this token.
    pub latency: Duration,
    /// Time from the start of generation to the first generated token. Set
    /// only on that token.
    pub prompt_latency: Option<Duration>,
}

/// Everything that stays fixed between load and unload.
struct LoadedPipeline {
    chunks: Vec<ChunkModel>,
    cache_processor: Arc<dyn Model>,
    sampler: Arc<dyn Sampler>,
    configuration: InferenceConfiguration,
    pad_token_id: TokenId,
    output_aliases: OutputAliases,
}

impl LoadedPipeline {
    fn prompt_descriptions(&self) -> Result<Vec<&ModelDescription>> {
        self.chunks
            .iter()
            .map(|c| c.prompt_variant().map(|v| v.description()))
            .collect()
    }

    fn generation_descriptions(&self) -> Result<Vec<&ModelDescription>> {
        self.chunks
            .iter()
            .map(|c| c.generation_variant().map(|v| v.description()))
            .collect()
    }
}

fn unload_all(chunks: &mut [ChunkModel]) {
    for chunk in chunks {
        chunk.unload();
    }
}

/// A chunked model ready to generate.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use chunkline_core::ModelLoader;
/// use chunkline_pipeline::{ModelPipeline, PipelineConfig};
///
/// # async fn run(loader: Arc<dyn ModelLoader>) -> chunkline_pipeline::Result<()> {
/// let mut pipeline = ModelPipeline::new(PipelineConfig::new("./model"), loader)?;
/// pipeline.load()?;
/// let mut generation = pipeline.predict(&[1, 2, 3], 16)?;
/// while let Some(prediction) = generation.next().await {
///     println!("{}", prediction?.token);
/// }
/// # Ok(())
/// # }
/// ```
pub struct ModelPipeline {
    config: PipelineConfig,
    loader: Arc<dyn ModelLoader>,
    allocator: Arc<dyn TensorAllocator>,
    instrumentation: Arc<dyn Instrumentation>,
    sampler: Option<Arc<dyn Sampler>>,
    state: PipelineState,
    loaded: Option<Arc<LoadedPipeline>>,
}

impl ModelPipeline {
    pub fn new(config: PipelineConfig, loader: Arc<dyn ModelLoader>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            loader,
            allocator: Arc::new(HostAllocator),
            instrumentation: Arc::new(TracingInstrumentation),
            sampler: None,
            state: PipelineState::Unloaded,
            loaded: None,
        })
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn TensorAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn with_instrumentation(mut self, instrumentation: Arc<dyn Instrumentation>) -> Self {
        self.instrumentation = instrumentation;
        self
    }

    /// Use `sampler` instead of the configured logit processor.
    pub fn with_sampler(mut self, sampler: Arc<dyn Sampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Prompt-phase configuration, once loaded.
    pub fn configuration(&self) -> Option<InferenceConfiguration> {
        self.loaded.as_ref().map(|l| l.configuration)
    }

    pub fn chunk_count(&self) -> usize {
        self.loaded.as_ref().map_or(0, |l| l.chunks.len())
    }

    /// Load the auxiliary models and every chunk, then resolve the
    /// configuration. Blocks while the runtime loads artifacts; a second
    /// call is a no-op.
    pub fn load(&mut self) -> Result<()> {
        if self.loaded.is_some() {
            return Ok(());
        }
        self.state = PipelineState::Loading;
        match self.load_inner() {
            Ok(loaded) => {
                self.loaded = Some(Arc::new(loaded));
                self.state = PipelineState::Ready;
                Ok(())
            }
            Err(e) => {
                self.state = PipelineState::Unloaded;
                Err(e)
            }
        }
    }

    fn load_aux(&self, path: std::path::PathBuf) -> Result<Arc<dyn Model>> {
        self.loader
            .load(&path, &LoadOptions::default())
            .map_err(|source| PipelineError::ModelLoad { path, source })
    }

    fn load_inner(&self) -> Result<LoadedPipeline> {
        let started = Instant::now();
        let artifacts = discover_chunks(
            &self.config.model_dir,
            &self.config.artifact_extension,
            self.config.model_prefix.as_deref(),
        )?;

        let cache_processor = self.load_aux(self.config.cache_processor_path())?;
        let sampler: Arc<dyn Sampler> = match (&self.sampler, self.config.logit_processor_path()) {
            (Some(sampler), _) => sampler.clone(),
            (None, Some(path)) => Arc::new(ModelSampler::new(self.load_aux(path)?)?),
            (None, None) => Arc::new(ArgmaxSampler),
        };

        let mut chunks: Vec<ChunkModel> = Vec::with_capacity(artifacts.len());
        for (index, path) in artifacts.paths.into_iter().enumerate() {
            let placement = if index == 0 {
                ComputePlacement::CpuOnly
            } else {
                ComputePlacement::CpuAndAccelerator
            };
            let mut chunk = ChunkModel::new(
                index,
                path,
                placement,
                self.config.prompt_function.clone(),
                self.config.generation_function.clone(),
            );
            if let Err(e) = chunk.load(self.loader.as_ref()) {
                tracing::warn!("chunk {} failed to load, unloading {} loaded chunks", index, chunks.len());
                unload_all(&mut chunks);
                return Err(e);
            }
            chunks.push(chunk);
        }

        let resolved = {
            let descriptions: Result<Vec<&ModelDescription>> =
                chunks.iter().map(|c| c.prompt_variant().map(|v| v.description())).collect();
            descriptions.and_then(|d| resolve(&d))
        };
        let configuration = match resolved {
            Ok(configuration) => configuration,
            Err(e) => {
                unload_all(&mut chunks);
                return Err(e);
            }
        };

        tracing::info!(
            "ModelPipeline: {} chunks '{}', {} ({:.1}ms)",
            chunks.len(),
            artifacts.prefix,
            configuration,
            started.elapsed().as_secs_f64() * 1e3,
        );

        Ok(LoadedPipeline {
            chunks,
            cache_processor,
            sampler,
            configuration,
            pad_token_id: self.config.pad_token_id,
            output_aliases: OutputAliases::new(self.config.output_aliases.clone()),
        })
    }

    /// Release every loaded model. Generations already started keep theirs
    /// alive until they finish.
    pub fn unload(&mut self) {
        if self.loaded.take().is_some() {
            tracing::info!("ModelPipeline unloaded");
        }
        self.state = PipelineState::Unloaded;
    }

    /// Start generating up to `max_new_tokens` tokens after `tokens`.
    ///
    /// Capacity and configuration errors are returned here, before any
    /// model runs.
    pub fn predict(&self, tokens: &[TokenId], max_new_tokens: usize) -> Result<Generation> {
        let pipeline = self.loaded.clone().ok_or(PipelineError::NotLoaded)?;
        if tokens.is_empty() {
            return Err(PipelineError::EmptyPrompt);
        }
        let configuration = pipeline.configuration;
        if tokens.len() > configuration.context_length {
            return Err(PipelineError::PromptTooLong {
                prompt: tokens.len(),
                context: configuration.context_length,
            });
        }

        let (store, token_inputs) = {
            let descriptions = pipeline.prompt_descriptions()?;
            let store = BufferStore::initialize(
                &descriptions,
                pipeline.output_aliases.clone(),
                self.allocator.clone(),
            )?;
            (store, TokenInputs::for_chunks(&descriptions)?)
        };
        tracing::debug!(
            "generation: {} prompt tokens, up to {} new, {} buffer bytes",
            tokens.len(),
            max_new_tokens,
            store.live_bytes(),
        );

        let mut pieces: VecDeque<Vec<TokenId>> = tokens
            .chunks(configuration.query_length)
            .map(<[TokenId]>::to_vec)
            .collect();
        let first = pieces.pop_front().unwrap_or_default();
        let maintainer = CacheMaintainer::new(pipeline.cache_processor.clone(), self.instrumentation.clone());

        Ok(Generation {
            state: Some(GenerationState {
                pipeline,
                instrumentation: self.instrumentation.clone(),
                store,
                maintainer,
                token_inputs,
                configuration,
                phase: Phase::Prompt,
                tokens: first,
                pieces,
                target_length: tokens.len().saturating_add(max_new_tokens),
                started: Instant::now(),
                steps: 0,
                transitions: 0,
            }),
            queued: VecDeque::new(),
            steps: 0,
            transitions: 0,
        })
    }
}

impl fmt::Debug for ModelPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelPipeline")
            .field("model_dir", &self.config.model_dir)
            .field("state", &self.state)
            .field("configuration", &self.configuration())
            .finish()
    }
}

/// The integer inputs the engine supplies itself: the window's token ids
/// and the running token count.
struct TokenInputs {
    input_ids: ZeroCopyTensor,
    full_sequence_length: ZeroCopyTensor,
}

impl TokenInputs {
    fn for_chunks(chunks: &[&ModelDescription]) -> Result<Self> {
        let ids = chunks
            .first()
            .and_then(|d| d.input(names::INPUT_IDS))
            .ok_or_else(|| {
                PipelineError::UnsupportedInferenceConfiguration(format!(
                    "first chunk declares no '{}' input",
                    names::INPUT_IDS
                ))
            })?;
        let counter = chunks
            .iter()
            .find_map(|d| d.input(names::FULL_SEQUENCE_LENGTH))
            .map_or_else(|| Shape::new(&[1]), |d| d.shape.clone());
        Ok(Self {
            input_ids: ZeroCopyTensor::zeros(DType::I32, ids.shape.clone()),
            full_sequence_length: ZeroCopyTensor::zeros(DType::I32, counter),
        })
    }

    fn fill(&self, tokens: &[TokenId], window: &Window, pad: TokenId) -> Result<()> {
        let mut ids = vec![pad; self.input_ids.numel()];
        for (slot, &token) in ids.iter_mut().zip(&tokens[window.start..]) {
            *slot = token;
        }
        self.input_ids.write_i32(&ids)?;
        let count = tokens.len() as i32;
        self.full_sequence_length
            .write_i32(&vec![count; self.full_sequence_length.numel()])?;
        Ok(())
    }

    /// Add whichever of the two inputs `model` declares.
    fn supply(&self, model: &ModelDescription, inputs: &mut FeatureMap) {
        if model.has_input(names::INPUT_IDS) {
            inputs.insert(names::INPUT_IDS, self.input_ids.clone());
        }
        if model.has_input(names::FULL_SEQUENCE_LENGTH) {
            inputs.insert(names::FULL_SEQUENCE_LENGTH, self.full_sequence_length.clone());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Prompt,
    Generation,
}

fn task_error(e: tokio::task::JoinError) -> PipelineError {
    PipelineError::Task(format!("model execution panicked or was cancelled: {e}"))
}

/// State of one generation call.
struct GenerationState {
    pipeline: Arc<LoadedPipeline>,
    instrumentation: Arc<dyn Instrumentation>,
    store: BufferStore,
    maintainer: CacheMaintainer,
    token_inputs: TokenInputs,
    configuration: InferenceConfiguration,
    phase: Phase,
    tokens: Vec<TokenId>,
    pieces: VecDeque<Vec<TokenId>>,
    target_length: usize,
    started: Instant,
    steps: usize,
    transitions: usize,
}

impl GenerationState {
    fn is_done(&self) -> bool {
        self.pieces.is_empty() && self.tokens.len() >= self.target_length
    }

    /// One forward step, returning the predictions it emits.
    async fn step(&mut self) -> Result<Vec<Prediction>> {
        let step_started = Instant::now();
        let window = Window::new(self.tokens.len(), self.configuration.query_length);
        tracing::debug!(
            "step {}: {} tokens, window at {} ({} real, {} padding)",
            self.steps,
            self.tokens.len(),
            window.start,
            window.real,
            window.padding(),
        );

        let interval = self.instrumentation.begin_interval("forward");
        let logits = self.forward(&window).await?;
        self.instrumentation.end_interval(interval);
        self.steps += 1;

        if let Some(piece) = self.pieces.pop_front() {
            let latency = step_started.elapsed();
            let mut predictions = Vec::with_capacity(piece.len());
            for token in piece {
                self.tokens.push(token);
                predictions.push(Prediction {
                    token,
                    tokens: self.tokens.clone(),
                    kind: PredictionKind::Prompt,
                    latency,
                    prompt_latency: None,
                });
            }
            return Ok(predictions);
        }

        let sampler = self.pipeline.sampler.clone();
        let position = window.last_position();
        let token = tokio::task::spawn_blocking(move || sampler.sample(&logits, position))
            .await
            .map_err(task_error)??;
        self.tokens.push(token);

        let prompt_latency = match self.phase {
            Phase::Prompt => {
                let elapsed = self.started.elapsed();
                self.transition(&window).await?;
                Some(elapsed)
            }
            Phase::Generation => None,
        };

        Ok(vec![Prediction {
            token,
            tokens: self.tokens.clone(),
            kind: PredictionKind::Generated,
            latency: step_started.elapsed(),
            prompt_latency,
        }])
    }

    /// Run every chunk once over `window`; returns the logits parts.
    async fn forward(&mut self, window: &Window) -> Result<Vec<(String, ZeroCopyTensor)>> {
        let count = self.tokens.len();
        let query_length = window.query_length;
        self.token_inputs
            .fill(&self.tokens, window, self.pipeline.pad_token_id)?;

        let pipeline = self.pipeline.clone();
        let last = pipeline.chunks.len() - 1;
        let mut logits = Vec::new();

        for chunk in &pipeline.chunks {
            let index = chunk.index();
            let variant = chunk.variant_for(count, query_length)?;
            if variant.native_sequence_length() != query_length {
                return Err(PipelineError::SequenceLengthMismatch {
                    chunk: index,
                    native: variant.native_sequence_length(),
                    expected: query_length,
                });
            }
            let desc = variant.description();

            self.maintainer.wait(index).await?;

            let mut inputs = self.store.inputs_for(index, desc);
            self.token_inputs.supply(desc, &mut inputs);
            let backings = self.store.output_backings_for(index, desc);

            let model = variant.model().clone();
            let interval = self.instrumentation.begin_interval(&format!("chunk {index}"));
            let (inputs, outputs) = tokio::task::spawn_blocking(move || {
                let outputs = model.predict(&inputs, &backings);
                (inputs, outputs)
            })
            .await
            .map_err(task_error)?;
            self.instrumentation.end_interval(interval);
            let outputs = outputs?;

            self.store.capture_outputs(&outputs, index)?;
            tracing::trace!("chunk {} done", index);

            if window.is_full() && CacheMaintainer::block_count(&inputs) > 0 {
                self.maintainer.submit(index, &inputs, &outputs).await?;
            }
            if index == last {
                logits = collect_logits(&outputs)?;
            }
        }
        Ok(logits)
    }

    /// Switch from the prompt variants to the generation variants.
    async fn transition(&mut self, window: &Window) -> Result<()> {
        self.maintainer.drain().await?;

        let pipeline = self.pipeline.clone();
        let descriptions = pipeline.generation_descriptions()?;
        let next = resolve(&descriptions)?;

        // Positions of the last window that maintenance never folded but the
        // next window no longer covers.
        let following = Window::new(self.tokens.len(), next.query_length);
        let unmerged = if window.is_full() {
            0
        } else {
            following.start.saturating_sub(window.start).min(window.real)
        };

        let report = self.store.resize(&descriptions, unmerged)?;
        self.token_inputs = TokenInputs::for_chunks(&descriptions)?;
        tracing::info!(
            "prompt done after {} steps ({:.1}ms): {} -> {}; buffers {}",
            self.steps,
            self.started.elapsed().as_secs_f64() * 1e3,
            self.configuration,
            next,
            report,
        );
        self.configuration = next;
        self.phase = Phase::Generation;
        self.transitions += 1;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.maintainer.drain().await?;
        tracing::info!(
            "generation finished: {} tokens in {} steps ({:.1}ms), {} cache updates, peak {} buffer bytes",
            self.tokens.len(),
            self.steps,
            self.started.elapsed().as_secs_f64() * 1e3,
            self.maintainer.submitted(),
            self.store.peak_bytes(),
        );
        Ok(())
    }
}

/// A running generation: a lazy, finite, non-restartable sequence of
/// predictions.
///
/// Dropping it mid-way is safe: in-flight cache updates hold their buffers
/// until they finish. [`cancel`](Self::cancel) additionally waits for them.
pub struct Generation {
    state: Option<GenerationState>,
    queued: VecDeque<Prediction>,
    steps: usize,
    transitions: usize,
}

impl Generation {
    /// The next prediction, or `None` once generation is over.
    pub async fn next(&mut self) -> Option<Result<Prediction>> {
        if let Some(prediction) = self.queued.pop_front() {
            return Some(Ok(prediction));
        }
        let state = self.state.as_mut()?;

        if state.is_done() {
            let result = state.finish().await;
            self.close();
            return result.err().map(Err);
        }

        match state.step().await {
            Ok(predictions) => {
                self.queued.extend(predictions);
                self.queued.pop_front().map(Ok)
            }
            Err(e) => {
                tracing::warn!("generation failed: {}", e);
                if let Err(drain) = state.maintainer.drain().await {
                    tracing::warn!("cache maintenance after failure: {}", drain);
                }
                self.close();
                Some(Err(e))
            }
        }
    }

    fn close(&mut self) {
        if let Some(state) = self.state.take() {
            self.steps = state.steps;
            self.transitions = state.transitions;
        }
    }

    /// Stop generating and wait for outstanding cache maintenance.
    pub async fn cancel(mut self) -> Result<()> {
        self.queued.clear();
        let result = match self.state.as_mut() {
            Some(state) => state.maintainer.drain().await,
            None => Ok(()),
        };
        self.close();
        result
    }

    /// Drive the generation as a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Result<Prediction>> + Send {
        futures::stream::unfold(self, |mut generation| async move {
            let item = generation.next().await?;
            Some((item, generation))
        })
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_none() && self.queued.is_empty()
    }

    /// Tokens so far, including any not yet returned by [`next`](Self::next).
    pub fn tokens(&self) -> Option<&[TokenId]> {
        self.state.as_ref().map(|s| s.tokens.as_slice())
    }

    /// Active configuration: the prompt configuration until the phase
    /// transition, the generation configuration after.
    pub fn configuration(&self) -> Option<InferenceConfiguration> {
        self.state.as_ref().map(|s| s.configuration)
    }

    pub fn steps(&self) -> usize {
        self.state.as_ref().map_or(self.steps, |s| s.steps)
    }

    pub fn transitions(&self) -> usize {
        self.state.as_ref().map_or(self.transitions, |s| s.transitions)
    }

    /// Identity of every buffer in the store.
    pub fn buffer_ids(&self) -> Option<BTreeMap<(BufferScope, String), BufferId>> {
        self.state.as_ref().map(|s| s.store.snapshot())
    }

    /// The backing of `name` as chunk `chunk` sees it.
    pub fn buffer(&self, chunk: usize, name: &str) -> Option<ZeroCopyTensor> {
        self.state.as_ref()?.store.buffer(chunk, name).cloned()
    }

    pub fn cache_maintainer(&self) -> Option<&CacheMaintainer> {
        self.state.as_ref().map(|s| &s.maintainer)
    }
}
