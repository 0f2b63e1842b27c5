//! Deriving the inference configuration from the chunks' declared shapes.

use std::fmt;

use chunkline_core::ModelDescription;
use serde::Serialize;

use crate::error::{PipelineError, Result};
use crate::names;

/// Dimensions of one inference phase, read from the loaded models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct InferenceConfiguration {
    pub vocabulary_size: usize,
    /// Tokens processed per forward step.
    pub query_length: usize,
    /// `query_length` plus the cache length.
    pub context_length: usize,
}

impl InferenceConfiguration {
    pub fn cache_length(&self) -> usize {
        self.context_length - self.query_length
    }
}

impl fmt::Display for InferenceConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "vocab={}, query={}, context={}",
            self.vocabulary_size, self.query_length, self.context_length
        )
    }
}

fn unsupported(reason: String) -> PipelineError {
    PipelineError::UnsupportedInferenceConfiguration(reason)
}

/// Resolve the configuration of a chunk set, in chunk order.
///
/// Needs at least an input chunk, one interior chunk and an output chunk.
/// Every cache input must declare the same cache length and every cache
/// slice output the query length.
pub fn resolve(chunks: &[&ModelDescription]) -> Result<InferenceConfiguration> {
    let (first, rest) = match chunks {
        [first, rest @ ..] if rest.len() >= 2 => (first, rest),
        _ => {
            return Err(unsupported(format!(
                "need at least 3 chunks, found {}",
                chunks.len()
            )))
        }
    };
    let last = rest[rest.len() - 1];
    let interior = rest[0];

    let query_length = first
        .input(names::INPUT_IDS)
        .and_then(|d| d.shape.last_dim())
        .ok_or_else(|| unsupported(format!("first chunk declares no '{}' input", names::INPUT_IDS)))?;
    if query_length == 0 {
        return Err(unsupported(format!("'{}' has an empty token axis", names::INPUT_IDS)));
    }

    let mut vocabulary_size = 0;
    let mut parts = 0;
    for output in &last.outputs {
        if names::logits_part(&output.name).is_some() {
            vocabulary_size += output.shape.last_dim().unwrap_or(0);
            parts += 1;
        }
    }
    if parts == 0 || vocabulary_size == 0 {
        return Err(unsupported(format!("last chunk declares no '{}' output", names::LOGITS)));
    }

    let cache_source = interior
        .inputs
        .iter()
        .find(|d| names::is_cache_input(&d.name))
        .or_else(|| interior.input(names::HIDDEN_STATE))
        .ok_or_else(|| {
            unsupported(format!(
                "interior chunk declares neither a cache input nor '{}'",
                names::HIDDEN_STATE
            ))
        })?;
    let cache_length = cache_source.shape.last_dim().unwrap_or(0);

    for (index, chunk) in chunks.iter().enumerate() {
        for input in chunk.inputs.iter().filter(|d| names::is_cache_input(&d.name)) {
            if input.shape.last_dim() != Some(cache_length) {
                return Err(unsupported(format!(
                    "chunk {index} input '{}' has shape {}, expected cache length {cache_length}",
                    input.name, input.shape
                )));
            }
        }
        for output in chunk.outputs.iter().filter(|d| names::is_cache_output(&d.name)) {
            if output.shape.last_dim() != Some(query_length) {
                return Err(unsupported(format!(
                    "chunk {index} output '{}' has shape {}, expected query length {query_length}",
                    output.name, output.shape
                )));
            }
        }
    }

    Ok(InferenceConfiguration {
        vocabulary_size,
        query_length,
        context_length: query_length + cache_length,
    })
}
