//! Asynchronous key/value cache maintenance.
//!
//! When a forward step fills a whole window, each chunk's new cache slices
//! have to be folded into its cache before that chunk runs again. The
//! maintainer runs the fold off the critical path, one blocking subtask per
//! cache block, writing straight into the chunk's cache buffers:
//!
//! ```text
//! step N:    [chunk 0][chunk 1][chunk 2][chunk 3]
//!                      └ fold 1 ┘└ fold 2 ┘
//! step N+1:  [chunk 0] wait 1 [chunk 1] wait 2 [chunk 2] ...
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chunkline_core::{FeatureMap, Model, ZeroCopyTensor};
use parking_lot::Mutex;

use crate::error::{PipelineError, Result};
use crate::instrument::Instrumentation;
use crate::names;
use crate::task_group::TaskGroup;

/// Lifecycle of one cache update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Scheduled,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Scheduled => "scheduled",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// The fold of one cache block of one chunk.
#[derive(Debug, Clone)]
pub struct CacheUpdateTask {
    chunk: usize,
    block: usize,
    state: Arc<Mutex<TaskState>>,
}

impl CacheUpdateTask {
    fn new(chunk: usize, block: usize) -> Self {
        Self {
            chunk,
            block,
            state: Arc::new(Mutex::new(TaskState::Scheduled)),
        }
    }

    pub fn chunk(&self) -> usize {
        self.chunk
    }

    pub fn block(&self) -> usize {
        self.block
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    fn set_state(&self, state: TaskState) {
        *self.state.lock() = state;
    }
}

/// Buffers one subtask reads and writes. The task owns handles to all four
/// so none can be freed while it runs.
struct BlockBuffers {
    old_k: ZeroCopyTensor,
    new_k: ZeroCopyTensor,
    old_v: ZeroCopyTensor,
    new_v: ZeroCopyTensor,
}

impl BlockBuffers {
    fn gather(block: usize, inputs: &FeatureMap, outputs: &FeatureMap) -> Result<Self> {
        let key = names::key_cache(block);
        let value = names::value_cache(block);
        Ok(Self {
            old_k: inputs.require(&key)?.clone(),
            new_k: outputs.require(&names::new_slice(&key))?.clone(),
            old_v: inputs.require(&value)?.clone(),
            new_v: outputs.require(&names::new_slice(&value))?.clone(),
        })
    }
}

struct PendingUpdate {
    group: TaskGroup<()>,
}

/// Runs cache folds for every chunk and tracks their completion.
pub struct CacheMaintainer {
    model: Arc<dyn Model>,
    instrumentation: Arc<dyn Instrumentation>,
    pending: HashMap<usize, PendingUpdate>,
    recent: HashMap<usize, Vec<CacheUpdateTask>>,
    submitted: usize,
}

impl CacheMaintainer {
    pub fn new(model: Arc<dyn Model>, instrumentation: Arc<dyn Instrumentation>) -> Self {
        Self {
            model,
            instrumentation,
            pending: HashMap::new(),
            recent: HashMap::new(),
            submitted: 0,
        }
    }

    /// Number of cache blocks among `inputs`: highest `k_cache_{b}` index
    /// plus one.
    pub fn block_count(inputs: &FeatureMap) -> usize {
        inputs
            .names()
            .filter_map(names::key_cache_block)
            .max()
            .map_or(0, |b| b + 1)
    }

    /// Start folding `outputs`' new slices into `inputs`' caches for `chunk`.
    ///
    /// Waits for the chunk's previous submission first, so at most one set
    /// of subtasks per chunk is outstanding.
    pub async fn submit(&mut self, chunk: usize, inputs: &FeatureMap, outputs: &FeatureMap) -> Result<()> {
        self.wait(chunk).await?;

        let blocks = Self::block_count(inputs);
        if blocks == 0 {
            return Ok(());
        }

        let mut group = TaskGroup::new();
        let mut tasks = Vec::with_capacity(blocks);
        for block in 0..blocks {
            let buffers = BlockBuffers::gather(block, inputs, outputs)?;
            let task = CacheUpdateTask::new(chunk, block);
            let model = self.model.clone();
            let instrumentation = self.instrumentation.clone();
            let tracked = task.clone();
            group.spawn_blocking(move || {
                tracked.set_state(TaskState::Running);
                let interval = instrumentation.begin_interval(&format!("cache update {chunk}.{block}"));
                let result = fold_block(model.as_ref(), chunk, block, &buffers);
                instrumentation.end_interval(interval);
                tracked.set_state(if result.is_ok() {
                    TaskState::Completed
                } else {
                    TaskState::Failed
                });
                result
            });
            tasks.push(task);
        }

        tracing::trace!("chunk {}: submitted {} cache updates", chunk, blocks);
        self.submitted += blocks;
        self.recent.insert(chunk, tasks);
        self.pending.insert(chunk, PendingUpdate { group });
        Ok(())
    }

    /// Wait for `chunk`'s outstanding updates. No-op when none are pending.
    pub async fn wait(&mut self, chunk: usize) -> Result<()> {
        let Some(pending) = self.pending.remove(&chunk) else {
            return Ok(());
        };
        pending.group.join_all().await?;
        Ok(())
    }

    /// Wait for every chunk. All chunks are joined even if one fails; the
    /// first failure is returned.
    pub async fn drain(&mut self) -> Result<()> {
        let mut chunks: Vec<usize> = self.pending.keys().copied().collect();
        chunks.sort_unstable();
        let mut first_error = None;
        for chunk in chunks {
            if let Err(e) = self.wait(chunk).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_pending(&self, chunk: usize) -> bool {
        self.pending.contains_key(&chunk)
    }

    pub fn pending_chunks(&self) -> usize {
        self.pending.len()
    }

    /// Tasks of the chunk's most recent submission.
    pub fn tasks(&self, chunk: usize) -> &[CacheUpdateTask] {
        self.recent.get(&chunk).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total subtasks submitted so far.
    pub fn submitted(&self) -> usize {
        self.submitted
    }
}

/// Run the maintenance model for one block, writing the result into the old
/// cache buffers.
fn fold_block(model: &dyn Model, chunk: usize, block: usize, buffers: &BlockBuffers) -> Result<()> {
    let mut inputs = FeatureMap::new();
    inputs.insert(names::OLD_K_CACHE, buffers.old_k.clone());
    inputs.insert(names::NEW_K_CACHE, buffers.new_k.clone());
    inputs.insert(names::OLD_V_CACHE, buffers.old_v.clone());
    inputs.insert(names::NEW_V_CACHE, buffers.new_v.clone());

    let mut backings = FeatureMap::new();
    backings.insert(names::UPDATED_K_CACHE, buffers.old_k.clone());
    backings.insert(names::UPDATED_V_CACHE, buffers.old_v.clone());

    let outputs = model.predict(&inputs, &backings).map_err(|e| PipelineError::CacheMaintenance {
        chunk,
        reason: format!("block {block}: {e}"),
    })?;

    for (name, target) in [
        (names::UPDATED_K_CACHE, &buffers.old_k),
        (names::UPDATED_V_CACHE, &buffers.old_v),
    ] {
        let produced = outputs.require(name).map_err(|e| PipelineError::CacheMaintenance {
            chunk,
            reason: format!("block {block}: {e}"),
        })?;
        if !produced.same_backing(target) {
            return Err(PipelineError::AliasingViolation {
                chunk,
                name: format!("{name}[{block}]"),
                expected: target.id(),
                actual: produced.id(),
            });
        }
    }
    Ok(())
}
