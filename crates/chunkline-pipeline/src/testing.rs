//! A synthetic runtime for exercising the pipeline without real artifacts.
//!
//! The stub chunks follow the full tensor contract (token ids, hidden state,
//! mask, per-block caches, split logits) with tiny shapes. Interior chunks
//! stamp every cache position they produce with `position + 1` and, on each
//! run, check that the last cache position they read carries the stamp of
//! the token just before the window. A cache read before its maintenance
//! finished, or a resize that lost positions, shows up as a recorded
//! violation. The final chunk always favours [`FAVOURED_TOKEN`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chunkline_core::{
    sequence_suffix, CoreError, DType, FeatureMap, LoadOptions, Model, ModelDescription, ModelLoader,
    TensorDescription, ZeroCopyTensor,
};
use parking_lot::Mutex;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::names;
use crate::TokenId;

/// Token the last stub chunk always ranks highest.
pub const FAVOURED_TOKEN: TokenId = 42;

/// Dimensions of one stub phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubSpec {
    pub query_length: usize,
    pub cache_length: usize,
    pub heads: usize,
    pub blocks: usize,
    pub vocabulary_size: usize,
    pub logit_parts: usize,
}

impl StubSpec {
    pub fn new(query_length: usize, cache_length: usize) -> Self {
        Self {
            query_length,
            cache_length,
            heads: 2,
            blocks: 1,
            vocabulary_size: 64,
            logit_parts: 1,
        }
    }

    pub fn with_blocks(mut self, blocks: usize) -> Self {
        self.blocks = blocks;
        self
    }

    pub fn with_logit_parts(mut self, parts: usize) -> Self {
        self.logit_parts = parts;
        self
    }

    pub fn context_length(&self) -> usize {
        self.query_length + self.cache_length
    }

    fn hidden(&self) -> [usize; 4] {
        [1, self.heads, 1, self.query_length]
    }

    fn cache(&self) -> [usize; 4] {
        [1, self.heads, 1, self.cache_length]
    }

    fn mask(&self) -> [usize; 4] {
        [1, 1, self.query_length, self.context_length()]
    }

    fn logits_names(&self) -> Vec<String> {
        if self.logit_parts <= 1 {
            vec![names::LOGITS.to_string()]
        } else {
            (0..self.logit_parts).map(|i| format!("{}_{i}", names::LOGITS)).collect()
        }
    }
}

pub fn first_chunk_description(spec: &StubSpec) -> ModelDescription {
    ModelDescription::new(
        vec![
            TensorDescription::new(names::INPUT_IDS, DType::I32, [1, spec.query_length]),
            TensorDescription::new(names::FULL_SEQUENCE_LENGTH, DType::I32, [1]),
        ],
        vec![
            TensorDescription::new("new_x", DType::F16, spec.hidden()),
            TensorDescription::new("mask", DType::F16, spec.mask()),
        ],
    )
}

pub fn interior_chunk_description(spec: &StubSpec) -> ModelDescription {
    let mut inputs = vec![
        TensorDescription::new(names::HIDDEN_STATE, DType::F16, spec.hidden()),
        TensorDescription::new("mask", DType::F16, spec.mask()),
        TensorDescription::new(names::FULL_SEQUENCE_LENGTH, DType::I32, [1]),
    ];
    let mut outputs = vec![TensorDescription::new("new_x", DType::F16, spec.hidden())];
    for b in 0..spec.blocks {
        for cache in [names::key_cache(b), names::value_cache(b)] {
            outputs.push(TensorDescription::new(names::new_slice(&cache), DType::F16, spec.hidden()));
            inputs.push(TensorDescription::new(cache, DType::F16, spec.cache()));
        }
    }
    ModelDescription::new(inputs, outputs)
}

pub fn last_chunk_description(spec: &StubSpec) -> ModelDescription {
    let parts = spec.logit_parts.max(1);
    let width = spec.vocabulary_size / parts;
    ModelDescription::new(
        vec![TensorDescription::new(names::HIDDEN_STATE, DType::F16, spec.hidden())],
        spec.logits_names()
            .into_iter()
            .map(|name| TensorDescription::new(name, DType::F16, [1, spec.query_length, width]))
            .collect(),
    )
}

/// Something a stub observed.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ChunkRan { chunk: usize, token_count: usize },
    CacheChecked { chunk: usize, block: usize, found: f32, expected: f32 },
    MaintenanceRan,
    Violation(String),
}

/// Shared record of stub activity.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<Event>>,
}

impl EventLog {
    pub fn record(&self, event: Event) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn violations(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Violation(v) => Some(v.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn maintenance_runs(&self) -> usize {
        self.count(|e| matches!(e, Event::MaintenanceRan))
    }

    pub fn chunk_runs(&self, chunk: usize) -> usize {
        self.count(|e| matches!(e, Event::ChunkRan { chunk: c, .. } if *c == chunk))
    }

    pub fn cache_checks(&self) -> usize {
        self.count(|e| matches!(e, Event::CacheChecked { .. }))
    }

    fn count(&self, f: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|e| f(e)).count()
    }
}

/// The backing an output should be written into: the requested one, or a
/// fresh tensor when the stub is told to ignore backings.
fn output_target(backings: &FeatureMap, declared: &TensorDescription, honor_backings: bool) -> ZeroCopyTensor {
    match backings.get(&declared.name) {
        Some(t) if honor_backings => t.clone(),
        _ => ZeroCopyTensor::zeros(declared.dtype, declared.shape.clone()),
    }
}

fn write_output(
    outputs: &mut FeatureMap,
    backings: &FeatureMap,
    declared: &TensorDescription,
    honor_backings: bool,
    values: &[f32],
) -> chunkline_core::Result<()> {
    let target = output_target(backings, declared, honor_backings);
    target.write_f32(values)?;
    outputs.insert(declared.name.clone(), target);
    Ok(())
}

fn token_count(inputs: &FeatureMap) -> chunkline_core::Result<usize> {
    let counts = inputs.require(names::FULL_SEQUENCE_LENGTH)?.to_i32_vec()?;
    match counts.first() {
        Some(&n) if n > 0 => Ok(n as usize),
        _ => Err(CoreError::Execution(format!("bad {}: {counts:?}", names::FULL_SEQUENCE_LENGTH))),
    }
}

/// Embedding stand-in: token ids become the hidden state, plus a causal mask.
pub struct FirstChunkStub {
    description: ModelDescription,
    spec: StubSpec,
    honor_backings: bool,
    log: Arc<EventLog>,
}

impl Model for FirstChunkStub {
    fn description(&self) -> &ModelDescription {
        &self.description
    }

    fn predict(&self, inputs: &FeatureMap, backings: &FeatureMap) -> chunkline_core::Result<FeatureMap> {
        let ids = inputs.require(names::INPUT_IDS)?.to_i32_vec()?;
        let n = token_count(inputs)?;
        self.log.record(Event::ChunkRan { chunk: 0, token_count: n });

        let q = self.spec.query_length;
        let hidden: Vec<f32> = (0..self.spec.heads)
            .flat_map(|_| ids.iter().take(q).map(|&t| t as f32))
            .collect();

        let cache = self.spec.cache_length;
        let context = self.spec.context_length();
        let mut mask = Vec::with_capacity(q * context);
        for row in 0..q {
            for col in 0..context {
                let visible = col < cache || col - cache <= row;
                mask.push(if visible { 0.0 } else { -1e4 });
            }
        }

        let mut outputs = FeatureMap::new();
        for declared in &self.description.outputs {
            let values = if declared.name == "mask" { &mask } else { &hidden };
            write_output(&mut outputs, backings, declared, self.honor_backings, values)?;
        }
        Ok(outputs)
    }
}

/// Transformer-block stand-in: passes the hidden state through, checks the
/// cache it was given and stamps the slices it produces.
pub struct InteriorChunkStub {
    description: ModelDescription,
    spec: StubSpec,
    chunk: usize,
    honor_backings: bool,
    log: Arc<EventLog>,
}

impl Model for InteriorChunkStub {
    fn description(&self) -> &ModelDescription {
        &self.description
    }

    fn predict(&self, inputs: &FeatureMap, backings: &FeatureMap) -> chunkline_core::Result<FeatureMap> {
        let n = token_count(inputs)?;
        let q = self.spec.query_length;
        let window_start = ((n - 1) / q) * q;
        self.log.record(Event::ChunkRan {
            chunk: self.chunk,
            token_count: n,
        });

        for b in 0..self.spec.blocks {
            for name in [names::key_cache(b), names::value_cache(b)] {
                let cache = inputs.require(&name)?;
                let found = cache.row_f32(0)?.last().copied().unwrap_or(0.0);
                let expected = window_start as f32;
                self.log.record(Event::CacheChecked {
                    chunk: self.chunk,
                    block: b,
                    found,
                    expected,
                });
                if found != expected {
                    self.log.record(Event::Violation(format!(
                        "chunk {} read {name} ending in {found} at {n} tokens, expected {expected}",
                        self.chunk
                    )));
                }
            }
        }

        let hidden = inputs.require(names::HIDDEN_STATE)?.to_f32_vec();
        let stamps: Vec<f32> = (0..self.spec.heads)
            .flat_map(|_| (0..q).map(|p| (window_start + p + 1) as f32))
            .collect();

        let mut outputs = FeatureMap::new();
        for declared in &self.description.outputs {
            let values = if names::is_cache_output(&declared.name) { &stamps } else { &hidden };
            write_output(&mut outputs, backings, declared, self.honor_backings, values)?;
        }
        Ok(outputs)
    }
}

/// Output-head stand-in: every position ranks [`FAVOURED_TOKEN`] first.
pub struct LastChunkStub {
    description: ModelDescription,
    spec: StubSpec,
    chunk: usize,
    honor_backings: bool,
    log: Arc<EventLog>,
}

impl Model for LastChunkStub {
    fn description(&self) -> &ModelDescription {
        &self.description
    }

    fn predict(&self, inputs: &FeatureMap, backings: &FeatureMap) -> chunkline_core::Result<FeatureMap> {
        inputs.require(names::HIDDEN_STATE)?;
        self.log.record(Event::ChunkRan {
            chunk: self.chunk,
            token_count: 0,
        });

        let q = self.spec.query_length;
        let mut outputs = FeatureMap::new();
        let mut offset = 0;
        for declared in &self.description.outputs {
            let width = declared.shape.last_dim().unwrap_or(0);
            let favoured = FAVOURED_TOKEN as usize;
            let mut values = vec![0.0; q * width];
            if (offset..offset + width).contains(&favoured) {
                for row in 0..q {
                    values[row * width + favoured - offset] = 1.0;
                }
            }
            write_output(&mut outputs, backings, declared, self.honor_backings, &values)?;
            offset += width;
        }
        Ok(outputs)
    }
}

/// Maintenance model: keeps the last `cache_length` positions of
/// `old ++ new`. Accepts any cache shape; the declared shapes are nominal.
pub struct SlidingCacheModel {
    description: ModelDescription,
    delay: Duration,
    honor_backings: bool,
    log: Arc<EventLog>,
}

impl SlidingCacheModel {
    pub fn new(delay: Duration, log: Arc<EventLog>) -> Self {
        let nominal = [1, 1, 1, 1];
        let description = ModelDescription::new(
            [names::OLD_K_CACHE, names::NEW_K_CACHE, names::OLD_V_CACHE, names::NEW_V_CACHE]
                .into_iter()
                .map(|n| TensorDescription::new(n, DType::F16, nominal))
                .collect(),
            [names::UPDATED_K_CACHE, names::UPDATED_V_CACHE]
                .into_iter()
                .map(|n| TensorDescription::new(n, DType::F16, nominal))
                .collect(),
        );
        Self {
            description,
            delay,
            honor_backings: true,
            log,
        }
    }

    pub fn ignoring_backings(mut self) -> Self {
        self.honor_backings = false;
        self
    }
}

impl Model for SlidingCacheModel {
    fn description(&self) -> &ModelDescription {
        &self.description
    }

    fn predict(&self, inputs: &FeatureMap, backings: &FeatureMap) -> chunkline_core::Result<FeatureMap> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let mut outputs = FeatureMap::new();
        for (old, new, updated) in [
            (names::OLD_K_CACHE, names::NEW_K_CACHE, names::UPDATED_K_CACHE),
            (names::OLD_V_CACHE, names::NEW_V_CACHE, names::UPDATED_V_CACHE),
        ] {
            let old = inputs.require(old)?;
            let new = inputs.require(new)?;
            let len = old.shape().last_dim().unwrap_or(0);
            let values = sequence_suffix(old, new, new.shape().last_dim().unwrap_or(0), len)?;
            let target = match backings.get(updated) {
                Some(t) if self.honor_backings => t.clone(),
                _ => ZeroCopyTensor::zeros(old.dtype(), old.shape().clone()),
            };
            target.write_f32(&values)?;
            outputs.insert(updated, target);
        }
        self.log.record(Event::MaintenanceRan);
        Ok(outputs)
    }
}

/// Sampling model: arg-max over the concatenated logits parts, per position.
pub struct ArgmaxModel {
    description: ModelDescription,
}

impl ArgmaxModel {
    pub fn new(inputs: &[&str], query_length: usize) -> Self {
        Self {
            description: ModelDescription::new(
                inputs
                    .iter()
                    .map(|n| TensorDescription::new(*n, DType::F16, [1, query_length, 1]))
                    .collect(),
                vec![TensorDescription::new(names::ARGMAX, DType::I32, [1, query_length])],
            ),
        }
    }
}

impl Model for ArgmaxModel {
    fn description(&self) -> &ModelDescription {
        &self.description
    }

    fn predict(&self, inputs: &FeatureMap, _backings: &FeatureMap) -> chunkline_core::Result<FeatureMap> {
        let parts: Vec<&ZeroCopyTensor> = self
            .description
            .inputs
            .iter()
            .map(|d| inputs.require(&d.name))
            .collect::<chunkline_core::Result<_>>()?;
        let rows = parts.first().map_or(0, |p| p.shape().outer_size());

        let mut argmax = Vec::with_capacity(rows);
        for row in 0..rows {
            let mut best = (0usize, f32::NEG_INFINITY);
            let mut offset = 0;
            for part in &parts {
                let values = part.row_f32(row)?;
                for (i, &v) in values.iter().enumerate() {
                    if v > best.1 {
                        best = (offset + i, v);
                    }
                }
                offset += values.len();
            }
            argmax.push(best.0 as i32);
        }

        let mut outputs = FeatureMap::new();
        outputs.insert(names::ARGMAX, ZeroCopyTensor::from_i32([1, rows], &argmax)?);
        Ok(outputs)
    }
}

/// Which stub a chunk artifact resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkRole {
    First,
    Interior,
    Last,
}

enum Artifact {
    Single(Arc<dyn Model>),
    Functions(BTreeMap<String, Arc<dyn Model>>),
    Broken(String),
}

/// A [`ModelLoader`] serving registered in-memory models by path.
pub struct SyntheticLoader {
    artifacts: Mutex<HashMap<PathBuf, Artifact>>,
    loads: Mutex<Vec<(PathBuf, LoadOptions)>>,
    log: Arc<EventLog>,
    honor_backings: bool,
}

impl Default for SyntheticLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticLoader {
    pub fn new() -> Self {
        Self {
            artifacts: Mutex::new(HashMap::new()),
            loads: Mutex::new(Vec::new()),
            log: Arc::new(EventLog::default()),
            honor_backings: true,
        }
    }

    /// Chunk stubs registered afterwards return fresh tensors instead of
    /// writing into their backings.
    pub fn ignoring_backings(mut self) -> Self {
        self.honor_backings = false;
        self
    }

    pub fn log(&self) -> Arc<EventLog> {
        self.log.clone()
    }

    pub fn register(&self, path: impl Into<PathBuf>, model: Arc<dyn Model>) {
        self.artifacts.lock().insert(path.into(), Artifact::Single(model));
    }

    pub fn register_functions(&self, path: impl Into<PathBuf>, functions: Vec<(String, Arc<dyn Model>)>) {
        self.artifacts
            .lock()
            .insert(path.into(), Artifact::Functions(functions.into_iter().collect()));
    }

    /// Loading `path` fails with `reason`.
    pub fn register_broken(&self, path: impl Into<PathBuf>, reason: impl Into<String>) {
        self.artifacts.lock().insert(path.into(), Artifact::Broken(reason.into()));
    }

    fn stub(&self, chunk: usize, role: ChunkRole, spec: StubSpec) -> Arc<dyn Model> {
        let log = self.log.clone();
        let honor_backings = self.honor_backings;
        match role {
            ChunkRole::First => Arc::new(FirstChunkStub {
                description: first_chunk_description(&spec),
                spec,
                honor_backings,
                log,
            }),
            ChunkRole::Interior => Arc::new(InteriorChunkStub {
                description: interior_chunk_description(&spec),
                spec,
                chunk,
                honor_backings,
                log,
            }),
            ChunkRole::Last => Arc::new(LastChunkStub {
                description: last_chunk_description(&spec),
                spec,
                chunk,
                honor_backings,
                log,
            }),
        }
    }

    /// Register a stub chunk. With `generation` set the artifact exposes
    /// `prompt` and `generation` entry points.
    pub fn register_chunk(
        &self,
        path: impl Into<PathBuf>,
        chunk: usize,
        role: ChunkRole,
        prompt: StubSpec,
        generation: Option<StubSpec>,
    ) {
        let prompt_model = self.stub(chunk, role, prompt);
        match generation {
            Some(generation) => {
                let generation_model = self.stub(chunk, role, generation);
                self.register_functions(
                    path,
                    vec![
                        ("prompt".to_string(), prompt_model),
                        ("generation".to_string(), generation_model),
                    ],
                );
            }
            None => self.register(path, prompt_model),
        }
    }

    pub fn register_interior(&self, path: impl Into<PathBuf>, prompt: StubSpec, generation: Option<StubSpec>) {
        self.register_chunk(path, 1, ChunkRole::Interior, prompt, generation);
    }

    pub fn load_count(&self, path: &Path) -> usize {
        self.loads.lock().iter().filter(|(p, _)| p == path).count()
    }

    pub fn loads(&self) -> Vec<(PathBuf, LoadOptions)> {
        self.loads.lock().clone()
    }
}

fn load_error(path: &Path, reason: impl Into<String>) -> CoreError {
    CoreError::ModelLoad {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

impl ModelLoader for SyntheticLoader {
    fn load(&self, path: &Path, options: &LoadOptions) -> chunkline_core::Result<Arc<dyn Model>> {
        let artifacts = self.artifacts.lock();
        let model = match (artifacts.get(path), options.function.as_deref()) {
            (None, _) => return Err(load_error(path, "no such artifact")),
            (Some(Artifact::Broken(reason)), _) => return Err(load_error(path, reason.clone())),
            (Some(Artifact::Single(model)), None) => model.clone(),
            (Some(Artifact::Single(_)), Some(f)) => {
                return Err(load_error(path, format!("artifact has no function '{f}'")))
            }
            (Some(Artifact::Functions(map)), Some(f)) => map
                .get(f)
                .cloned()
                .ok_or_else(|| load_error(path, format!("artifact has no function '{f}'")))?,
            (Some(Artifact::Functions(map)), None) => map
                .values()
                .next()
                .cloned()
                .ok_or_else(|| load_error(path, "artifact has no functions"))?,
        };
        drop(artifacts);
        self.loads.lock().push((path.to_path_buf(), options.clone()));
        Ok(model)
    }

    fn functions(&self, path: &Path) -> chunkline_core::Result<Vec<String>> {
        match self.artifacts.lock().get(path) {
            Some(Artifact::Functions(map)) => Ok(map.keys().cloned().collect()),
            Some(Artifact::Single(_)) | Some(Artifact::Broken(_)) => Ok(Vec::new()),
            None => Err(load_error(path, "no such artifact")),
        }
    }
}

/// A whole stub pipeline: chunk artifacts, maintenance model and optionally
/// a sampling model.
#[derive(Debug, Clone)]
pub struct SyntheticPipeline {
    pub chunks: usize,
    pub prompt: StubSpec,
    pub generation: Option<StubSpec>,
    pub maintenance_delay: Duration,
    pub honor_backings: bool,
    pub sampling_model: bool,
    pub prefix: String,
}

impl SyntheticPipeline {
    pub fn new(chunks: usize, prompt: StubSpec) -> Self {
        Self {
            chunks,
            prompt,
            generation: None,
            maintenance_delay: Duration::ZERO,
            honor_backings: true,
            sampling_model: false,
            prefix: "stub".into(),
        }
    }

    pub fn with_generation(mut self, generation: StubSpec) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn with_maintenance_delay(mut self, delay: Duration) -> Self {
        self.maintenance_delay = delay;
        self
    }

    pub fn ignoring_backings(mut self) -> Self {
        self.honor_backings = false;
        self
    }

    pub fn with_sampling_model(mut self) -> Self {
        self.sampling_model = true;
        self
    }

    pub fn chunk_path(&self, dir: &Path, chunk: usize) -> PathBuf {
        dir.join(format!("{}_chunk{chunk}.model", self.prefix))
    }

    /// Write placeholder artifacts into `dir` and register a stub model for
    /// each of them.
    pub fn install(&self, dir: &Path) -> Result<(PipelineConfig, Arc<SyntheticLoader>)> {
        let mut loader = SyntheticLoader::new();
        if !self.honor_backings {
            loader = loader.ignoring_backings();
        }
        let config = PipelineConfig::new(dir);

        for chunk in 0..self.chunks {
            let role = match chunk {
                0 => ChunkRole::First,
                c if c + 1 == self.chunks => ChunkRole::Last,
                _ => ChunkRole::Interior,
            };
            let path = self.chunk_path(dir, chunk);
            std::fs::write(&path, b"")?;
            loader.register_chunk(path, chunk, role, self.prompt, self.generation);
        }

        let cache_processor = config.cache_processor_path();
        std::fs::write(&cache_processor, b"")?;
        loader.register(
            cache_processor,
            Arc::new(SlidingCacheModel::new(self.maintenance_delay, loader.log())),
        );

        let mut config = config;
        if self.sampling_model {
            config.logit_processor = Some("logit-processor.model".into());
            if let Some(path) = config.logit_processor_path() {
                std::fs::write(&path, b"")?;
                let logits = self.prompt.logits_names();
                let inputs: Vec<&str> = logits.iter().map(String::as_str).collect();
                loader.register(path, Arc::new(ArgmaxModel::new(&inputs, self.prompt.query_length)));
            }
        }

        Ok((config, Arc::new(loader)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_chunk_favours_token() {
        let spec = StubSpec::new(4, 4).with_logit_parts(2);
        let loader = SyntheticLoader::new();
        loader.register_chunk("/v/last", 3, ChunkRole::Last, spec, None);
        let model = loader.load(Path::new("/v/last"), &LoadOptions::default()).unwrap();
        let mut inputs = FeatureMap::new();
        inputs.insert("x", ZeroCopyTensor::zeros(DType::F16, spec.hidden()));
        let outputs = model.predict(&inputs, &FeatureMap::new()).unwrap();
        let second = outputs.require("logits_1").unwrap();
        // 64-wide vocabulary split in two: token 42 is column 10 of part 1.
        assert_eq!(second.row_f32(3).unwrap()[10], 1.0);
    }

    #[test]
    fn test_loader_functions() {
        let loader = SyntheticLoader::new();
        let spec = StubSpec::new(4, 4);
        loader.register_interior("/v/split", spec, Some(StubSpec::new(1, 7)));
        loader.register_broken("/v/broken", "corrupt");
        assert_eq!(
            loader.functions(Path::new("/v/split")).unwrap(),
            vec!["generation".to_string(), "prompt".to_string()]
        );
        assert!(loader.functions(Path::new("/v/missing")).is_err());
        assert!(loader.load(Path::new("/v/broken"), &LoadOptions::default()).is_err());
        let options = LoadOptions {
            function: Some("generation".into()),
            ..Default::default()
        };
        let model = loader.load(Path::new("/v/split"), &options).unwrap();
        assert_eq!(model.description().input("x").unwrap().shape.last_dim(), Some(1));
    }
}
