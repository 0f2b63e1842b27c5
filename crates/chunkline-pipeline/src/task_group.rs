//! Bounded fan-out of blocking work: spawn N, join all, keep the first error.

use tokio::task::JoinSet;

use crate::error::{PipelineError, Result};

/// A set of blocking subtasks joined as one.
///
/// Joining always waits for every subtask, even after one has failed, so no
/// subtask is still touching its buffers when the join returns.
pub struct TaskGroup<T> {
    set: JoinSet<Result<T>>,
}

impl<T: Send + 'static> TaskGroup<T> {
    pub fn new() -> Self {
        Self { set: JoinSet::new() }
    }

    /// Run `f` on the blocking pool.
    pub fn spawn_blocking<F>(&mut self, f: F)
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.set.spawn_blocking(f);
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Wait for every subtask. Returns the results in completion order, or
    /// the first error observed.
    pub async fn join_all(mut self) -> Result<Vec<T>> {
        let mut results = Vec::with_capacity(self.set.len());
        let mut first_error = None;
        while let Some(joined) = self.set.join_next().await {
            let outcome = match joined {
                Ok(inner) => inner,
                Err(e) => Err(PipelineError::Task(format!("subtask panicked or was cancelled: {e}"))),
            };
            match outcome {
                Ok(value) => results.push(value),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }
}

impl<T: Send + 'static> Default for TaskGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}
