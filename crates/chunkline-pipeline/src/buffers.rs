//! The buffer store: every zero-copy tensor the chunks read and write.
//!
//! Buffers whose name contains the cache marker belong to one chunk; all
//! others (hidden state, mask, rotary tables, logits) are shared by every
//! chunk that declares them. Each distinct buffer is allocated once and
//! handed to the models on every step; outputs are written straight into
//! their buffer, and a model that returns a different backing is a fatal
//! aliasing violation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chunkline_core::{
    sequence_suffix, BufferArena, BufferHandle, BufferId, DType, FeatureMap, ModelDescription, Shape,
    TensorAllocator, TensorDescription, ZeroCopyTensor,
};

use crate::error::{PipelineError, Result};
use crate::names;

/// Output name -> buffer name remapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputAliases {
    aliases: BTreeMap<String, String>,
}

impl OutputAliases {
    pub fn new(aliases: BTreeMap<String, String>) -> Self {
        Self { aliases }
    }

    /// Buffer an output is written into.
    pub fn buffer_for<'a>(&'a self, output: &'a str) -> &'a str {
        self.aliases.get(output).map(String::as_str).unwrap_or(output)
    }
}

/// Which map a buffer lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BufferScope {
    Shared,
    Chunk(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BufferSpec {
    dtype: DType,
    shape: Shape,
}

/// The buffers a set of chunk models needs.
#[derive(Debug, Default)]
struct Layout {
    shared: BTreeMap<String, BufferSpec>,
    scoped: Vec<BTreeMap<String, BufferSpec>>,
}

impl Layout {
    fn collect(chunks: &[&ModelDescription], aliases: &OutputAliases) -> Result<Self> {
        let mut layout = Layout {
            shared: BTreeMap::new(),
            scoped: vec![BTreeMap::new(); chunks.len()],
        };
        for (index, desc) in chunks.iter().enumerate() {
            let inputs = desc.inputs.iter().map(|d| (d.name.as_str(), d));
            let outputs = desc.outputs.iter().map(|d| (aliases.buffer_for(&d.name), d));
            for (name, declared) in inputs.chain(outputs) {
                if !declared.dtype.is_float() {
                    continue;
                }
                let map = if names::is_chunk_scoped(name) {
                    &mut layout.scoped[index]
                } else {
                    &mut layout.shared
                };
                register(map, name, declared)?;
            }
        }
        Ok(layout)
    }
}

fn register(map: &mut BTreeMap<String, BufferSpec>, name: &str, declared: &TensorDescription) -> Result<()> {
    match map.get(name) {
        Some(existing) if existing.shape != declared.shape || existing.dtype != declared.dtype => {
            Err(PipelineError::ShapeConflict {
                name: name.to_string(),
                first: existing.shape.clone(),
                second: declared.shape.clone(),
            })
        }
        Some(_) => Ok(()),
        None => {
            map.insert(
                name.to_string(),
                BufferSpec {
                    dtype: declared.dtype,
                    shape: declared.shape.clone(),
                },
            );
            Ok(())
        }
    }
}

/// What a resize did, buffer by buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResizeReport {
    /// Same backing, same shape.
    pub kept: usize,
    /// Cache inputs that took over their old output slice.
    pub adopted: usize,
    /// Cache inputs rebuilt from old cache + unmerged slice.
    pub recombined: usize,
    /// Fresh zeroed backings.
    pub reallocated: usize,
    /// Backings no longer declared by any chunk.
    pub released: usize,
}

impl std::fmt::Display for ResizeReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "kept {}, adopted {}, recombined {}, reallocated {}, released {}",
            self.kept, self.adopted, self.recombined, self.reallocated, self.released
        )
    }
}

/// Owns the zero-copy buffers of one generation call.
pub struct BufferStore {
    arena: BufferArena,
    shared: HashMap<String, BufferHandle>,
    scoped: Vec<HashMap<String, BufferHandle>>,
    aliases: OutputAliases,
}

impl BufferStore {
    /// Allocate one backing per distinct buffer the chunks declare.
    pub fn initialize(
        chunks: &[&ModelDescription],
        aliases: OutputAliases,
        allocator: Arc<dyn TensorAllocator>,
    ) -> Result<Self> {
        let layout = Layout::collect(chunks, &aliases)?;
        let mut arena = BufferArena::new(allocator);

        let mut shared = HashMap::with_capacity(layout.shared.len());
        for (name, spec) in &layout.shared {
            shared.insert(name.clone(), arena.alloc(spec.dtype, &spec.shape)?);
        }
        let mut scoped = Vec::with_capacity(layout.scoped.len());
        for chunk in &layout.scoped {
            let mut map = HashMap::with_capacity(chunk.len());
            for (name, spec) in chunk {
                map.insert(name.clone(), arena.alloc(spec.dtype, &spec.shape)?);
            }
            scoped.push(map);
        }

        tracing::debug!(
            "buffer store: {} shared, {} chunk-scoped, {} bytes",
            shared.len(),
            scoped.iter().map(HashMap::len).sum::<usize>(),
            arena.used_bytes(),
        );

        Ok(Self {
            arena,
            shared,
            scoped,
            aliases,
        })
    }

    pub fn chunk_count(&self) -> usize {
        self.scoped.len()
    }

    fn handle(&self, chunk: usize, name: &str) -> Option<BufferHandle> {
        self.scoped
            .get(chunk)
            .and_then(|m| m.get(name))
            .or_else(|| self.shared.get(name))
            .copied()
    }

    /// The backing of `name` as seen by `chunk`: chunk scope first, then
    /// shared.
    pub fn buffer(&self, chunk: usize, name: &str) -> Option<&ZeroCopyTensor> {
        self.handle(chunk, name).and_then(|h| self.arena.get(h).ok())
    }

    /// Backings for every declared input that has one. Inputs the store does
    /// not own (token ids, counters) are left for the caller.
    pub fn inputs_for(&self, chunk: usize, model: &ModelDescription) -> FeatureMap {
        model
            .inputs
            .iter()
            .filter_map(|d| Some((d.name.clone(), self.buffer(chunk, &d.name)?.clone())))
            .collect()
    }

    /// Backings every declared output must be written into, keyed by output
    /// name.
    pub fn output_backings_for(&self, chunk: usize, model: &ModelDescription) -> FeatureMap {
        model
            .outputs
            .iter()
            .filter_map(|d| {
                let buffer = self.buffer(chunk, self.aliases.buffer_for(&d.name))?;
                Some((d.name.clone(), buffer.clone()))
            })
            .collect()
    }

    /// Check that every float output landed in its buffer.
    pub fn capture_outputs(&self, outputs: &FeatureMap, chunk: usize) -> Result<()> {
        for (name, produced) in outputs.iter() {
            if !produced.dtype().is_float() {
                continue;
            }
            let Some(expected) = self.buffer(chunk, self.aliases.buffer_for(name)) else {
                continue;
            };
            if !produced.same_backing(expected) {
                return Err(PipelineError::AliasingViolation {
                    chunk,
                    name: name.to_string(),
                    expected: expected.id(),
                    actual: produced.id(),
                });
            }
        }
        Ok(())
    }

    /// Move every buffer to the shapes `chunks` declare.
    ///
    /// `unmerged` is the number of leading positions of each `new_*cache*`
    /// slice that were produced but never folded into the cache by
    /// maintenance. Cache inputs are carried across the resize; every other
    /// buffer keeps its backing when its shape is unchanged and is zeroed
    /// otherwise. Outstanding maintenance must be drained first.
    pub fn resize(&mut self, chunks: &[&ModelDescription], unmerged: usize) -> Result<ResizeReport> {
        if chunks.len() != self.scoped.len() {
            return Err(PipelineError::UnsupportedInferenceConfiguration(format!(
                "resize to {} chunks, store holds {}",
                chunks.len(),
                self.scoped.len()
            )));
        }
        let layout = Layout::collect(chunks, &self.aliases)?;
        let mut report = ResizeReport::default();

        let old_shared = std::mem::take(&mut self.shared);
        let mut next_shared = HashMap::with_capacity(layout.shared.len());
        for (name, spec) in &layout.shared {
            let handle = match old_shared.get(name) {
                Some(&h) if self.matches(h, spec)? => {
                    report.kept += 1;
                    h
                }
                _ => {
                    report.reallocated += 1;
                    self.arena.alloc(spec.dtype, &spec.shape)?
                }
            };
            next_shared.insert(name.clone(), handle);
        }
        report.released += self.release_unused(&old_shared, &next_shared);
        self.shared = next_shared;

        for (index, targets) in layout.scoped.iter().enumerate() {
            let old = std::mem::take(&mut self.scoped[index]);
            let next = self.resize_chunk(&old, targets, unmerged, &mut report)?;
            report.released += self.release_unused(&old, &next);
            self.scoped[index] = next;
        }

        tracing::info!(
            "buffer store resized: {} (live {} bytes, peak {} bytes)",
            report,
            self.arena.used_bytes(),
            self.arena.peak_bytes(),
        );
        Ok(report)
    }

    fn resize_chunk(
        &mut self,
        old: &HashMap<String, BufferHandle>,
        targets: &BTreeMap<String, BufferSpec>,
        unmerged: usize,
        report: &mut ResizeReport,
    ) -> Result<HashMap<String, BufferHandle>> {
        let mut next = HashMap::with_capacity(targets.len());
        for (name, spec) in targets {
            let previous = old.get(name).copied();

            if names::is_cache_input(name) {
                if let Some(cache) = previous {
                    let handle = self.carry_cache(old, targets, name, cache, spec, unmerged, report)?;
                    next.insert(name.clone(), handle);
                    continue;
                }
            }

            let handle = match previous {
                Some(h) if self.matches(h, spec)? => {
                    report.kept += 1;
                    h
                }
                _ => {
                    report.reallocated += 1;
                    self.arena.alloc(spec.dtype, &spec.shape)?
                }
            };
            next.insert(name.clone(), handle);
        }
        Ok(next)
    }

    /// Bring one cache input to its new shape without losing its contents.
    #[allow(clippy::too_many_arguments)]
    fn carry_cache(
        &mut self,
        old: &HashMap<String, BufferHandle>,
        targets: &BTreeMap<String, BufferSpec>,
        name: &str,
        cache: BufferHandle,
        spec: &BufferSpec,
        unmerged: usize,
        report: &mut ResizeReport,
    ) -> Result<BufferHandle> {
        if unmerged == 0 && self.matches(cache, spec)? {
            report.kept += 1;
            return Ok(cache);
        }

        let slice_name = names::new_slice(name);
        let slice = old.get(&slice_name).copied();

        if let Some(slice) = slice {
            let slice_tensor = self.arena.get(slice)?;
            let slice_reshaped = targets
                .get(&slice_name)
                .map_or(true, |s| s.shape != *slice_tensor.shape());
            if unmerged == 0 && slice_reshaped && self.matches(slice, spec)? {
                report.adopted += 1;
                return Ok(slice);
            }
        }

        let len = spec.shape.last_dim().unwrap_or(0);
        let head = self.arena.get(cache)?.clone();
        let values = match slice {
            Some(slice) => {
                let tail = self.arena.get(slice)?.clone();
                sequence_suffix(&head, &tail, unmerged, len)?
            }
            None => sequence_suffix(&head, &head, 0, len)?,
        };
        report.recombined += 1;
        Ok(self.arena.alloc_from_f32(spec.dtype, &spec.shape, &values)?)
    }

    fn matches(&self, handle: BufferHandle, spec: &BufferSpec) -> Result<bool> {
        let tensor = self.arena.get(handle)?;
        Ok(tensor.dtype() == spec.dtype && *tensor.shape() == spec.shape)
    }

    fn release_unused(
        &mut self,
        old: &HashMap<String, BufferHandle>,
        next: &HashMap<String, BufferHandle>,
    ) -> usize {
        let live: HashSet<BufferHandle> = next.values().copied().collect();
        let mut released = 0;
        for handle in old.values() {
            if !live.contains(handle) && self.arena.release(*handle).is_some() {
                released += 1;
            }
        }
        released
    }

    /// Identity of every buffer, for checking what a step or resize touched.
    pub fn snapshot(&self) -> BTreeMap<(BufferScope, String), BufferId> {
        let mut out = BTreeMap::new();
        for (name, &h) in &self.shared {
            if let Ok(t) = self.arena.get(h) {
                out.insert((BufferScope::Shared, name.clone()), t.id());
            }
        }
        for (index, map) in self.scoped.iter().enumerate() {
            for (name, &h) in map {
                if let Ok(t) = self.arena.get(h) {
                    out.insert((BufferScope::Chunk(index), name.clone()), t.id());
                }
            }
        }
        out
    }

    pub fn live_bytes(&self) -> usize {
        self.arena.used_bytes()
    }

    pub fn peak_bytes(&self) -> usize {
        self.arena.peak_bytes()
    }
}
