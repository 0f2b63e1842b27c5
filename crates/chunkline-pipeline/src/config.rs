//! Configuration for chunked inference.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::TokenId;

/// Configuration for a chunked pipeline.
///
/// Everything about the model's dimensions is read from the loaded chunks;
/// this only says where the artifacts are and how they are named.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory containing `{prefix}_chunk{N}.{ext}` artifacts.
    pub model_dir: PathBuf,

    /// Artifact prefix. Required only when the directory holds several.
    pub model_prefix: Option<String>,

    /// Artifact file extension, without the dot.
    pub artifact_extension: String,

    /// Filename of the cache-maintenance model inside `model_dir`.
    pub cache_processor: String,

    /// Filename of the token-sampling model. `None` samples with a native
    /// arg-max.
    pub logit_processor: Option<String>,

    /// Entry point used for wide, prompt-phase windows.
    pub prompt_function: String,

    /// Entry point used for single-token generation.
    pub generation_function: String,

    /// Token written into the unused tail of a window.
    pub pad_token_id: TokenId,

    /// Output name -> buffer name. An output registered under an alias is
    /// written in place into that buffer (`new_x` updates `x`).
    pub output_aliases: BTreeMap<String, String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new(PathBuf::new())
    }
}

impl PipelineConfig {
    /// Defaults for a model directory.
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        let mut output_aliases = BTreeMap::new();
        output_aliases.insert("new_x".to_string(), "x".to_string());
        Self {
            model_dir: model_dir.into(),
            model_prefix: None,
            artifact_extension: "model".into(),
            cache_processor: "cache-processor.model".into(),
            logit_processor: None,
            prompt_function: "prompt".into(),
            generation_function: "generation".into(),
            pad_token_id: 0,
            output_aliases,
        }
    }

    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.artifact_extension.is_empty() || self.artifact_extension.starts_with('.') {
            return Err(PipelineError::Config(format!(
                "artifact_extension must be a bare extension, got '{}'",
                self.artifact_extension
            )));
        }
        if self.cache_processor.is_empty() {
            return Err(PipelineError::Config("cache_processor must not be empty".into()));
        }
        if self.prompt_function.is_empty() || self.generation_function.is_empty() {
            return Err(PipelineError::Config("function names must not be empty".into()));
        }
        if self.prompt_function == self.generation_function {
            return Err(PipelineError::Config(format!(
                "prompt and generation functions are both '{}'",
                self.prompt_function
            )));
        }
        for (output, buffer) in &self.output_aliases {
            if output.is_empty() || buffer.is_empty() || output == buffer {
                return Err(PipelineError::Config(format!(
                    "bad output alias '{output}' -> '{buffer}'"
                )));
            }
        }
        Ok(())
    }

    pub fn cache_processor_path(&self) -> PathBuf {
        self.model_dir.join(&self.cache_processor)
    }

    pub fn logit_processor_path(&self) -> Option<PathBuf> {
        self.logit_processor.as_ref().map(|f| self.model_dir.join(f))
    }
}
