//! Named timing intervals around chunk executions, cache updates and steps.

use std::time::{Duration, Instant};

/// An open interval, returned by [`Instrumentation::begin_interval`].
#[derive(Debug)]
pub struct IntervalToken {
    name: String,
    started: Instant,
}

impl IntervalToken {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            started: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Receives begin/end events for named intervals.
///
/// Implementations must be cheap: intervals are opened on the critical path
/// and inside cache-maintenance subtasks.
pub trait Instrumentation: Send + Sync {
    fn begin_interval(&self, name: &str) -> IntervalToken {
        IntervalToken::new(name)
    }

    fn end_interval(&self, token: IntervalToken);
}

/// Logs every interval's duration at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingInstrumentation;

impl Instrumentation for TracingInstrumentation {
    fn end_interval(&self, token: IntervalToken) {
        tracing::debug!("{} took {:.3}ms", token.name(), token.elapsed().as_secs_f64() * 1e3);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInstrumentation;

impl Instrumentation for NoopInstrumentation {
    fn end_interval(&self, _token: IntervalToken) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_measures_time() {
        let token = TracingInstrumentation.begin_interval("chunk 1");
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(token.name(), "chunk 1");
        assert!(token.elapsed() >= Duration::from_millis(2));
        TracingInstrumentation.end_interval(token);
    }
}
