//! One partition of the model and its loaded variants.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chunkline_core::{ComputePlacement, LoadOptions, Model, ModelDescription, ModelLoader};

use crate::error::{PipelineError, Result};
use crate::names;

/// A loaded entry point of a chunk artifact.
#[derive(Clone)]
pub struct ChunkVariant {
    model: Arc<dyn Model>,
    function: Option<String>,
    native_sequence_length: usize,
}

impl ChunkVariant {
    fn new(model: Arc<dyn Model>, function: Option<String>, path: &Path) -> Result<Self> {
        let desc = model.description();
        let native_sequence_length = desc
            .input(names::INPUT_IDS)
            .or_else(|| desc.input(names::HIDDEN_STATE))
            .and_then(|d| d.shape.last_dim())
            .ok_or_else(|| {
                PipelineError::UnsupportedInferenceConfiguration(format!(
                    "{} declares neither '{}' nor '{}'",
                    path.display(),
                    names::INPUT_IDS,
                    names::HIDDEN_STATE
                ))
            })?;
        Ok(Self {
            model,
            function,
            native_sequence_length,
        })
    }

    pub fn model(&self) -> &Arc<dyn Model> {
        &self.model
    }

    pub fn description(&self) -> &ModelDescription {
        self.model.description()
    }

    pub fn function(&self) -> Option<&str> {
        self.function.as_deref()
    }

    /// Tokens processed per execution: the trailing dim of `input_ids`, or
    /// of `x` for chunks that take the hidden state.
    pub fn native_sequence_length(&self) -> usize {
        self.native_sequence_length
    }
}

impl std::fmt::Debug for ChunkVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkVariant")
            .field("function", &self.function)
            .field("native_sequence_length", &self.native_sequence_length)
            .finish()
    }
}

#[derive(Debug)]
enum Variants {
    Single(ChunkVariant),
    Split { prompt: ChunkVariant, generation: ChunkVariant },
}

/// Owns the loaded variant(s) of one chunk.
#[derive(Debug)]
pub struct ChunkModel {
    index: usize,
    path: PathBuf,
    placement: ComputePlacement,
    prompt_function: String,
    generation_function: String,
    variants: Option<Variants>,
}

impl ChunkModel {
    pub fn new(
        index: usize,
        path: PathBuf,
        placement: ComputePlacement,
        prompt_function: impl Into<String>,
        generation_function: impl Into<String>,
    ) -> Self {
        Self {
            index,
            path,
            placement,
            prompt_function: prompt_function.into(),
            generation_function: generation_function.into(),
            variants: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn placement(&self) -> ComputePlacement {
        self.placement
    }

    pub fn is_loaded(&self) -> bool {
        self.variants.is_some()
    }

    /// Whether prompt and generation run different entry points.
    pub fn has_split_variants(&self) -> bool {
        matches!(self.variants, Some(Variants::Split { .. }))
    }

    /// Load the artifact. A second call is a no-op.
    ///
    /// When the artifact exposes both the prompt and the generation entry
    /// point each is loaded as its own variant; otherwise the default entry
    /// point serves both phases.
    pub fn load(&mut self, loader: &dyn ModelLoader) -> Result<()> {
        if self.variants.is_some() {
            return Ok(());
        }
        let functions = loader.functions(&self.path).map_err(|source| self.load_error(source))?;
        let split = functions.contains(&self.prompt_function) && functions.contains(&self.generation_function);

        let variants = if split {
            Variants::Split {
                prompt: self.load_variant(loader, Some(self.prompt_function.clone()))?,
                generation: self.load_variant(loader, Some(self.generation_function.clone()))?,
            }
        } else {
            Variants::Single(self.load_variant(loader, None)?)
        };

        tracing::debug!(
            "chunk {} loaded from {} ({}, {})",
            self.index,
            self.path.display(),
            if split { "prompt+generation" } else { "single variant" },
            self.placement,
        );
        self.variants = Some(variants);
        Ok(())
    }

    fn load_variant(&self, loader: &dyn ModelLoader, function: Option<String>) -> Result<ChunkVariant> {
        let options = LoadOptions {
            placement: self.placement,
            function: function.clone(),
        };
        let model = loader
            .load(&self.path, &options)
            .map_err(|source| self.load_error(source))?;
        ChunkVariant::new(model, function, &self.path)
    }

    fn load_error(&self, source: chunkline_core::CoreError) -> PipelineError {
        PipelineError::ModelLoad {
            path: self.path.clone(),
            source,
        }
    }

    pub fn unload(&mut self) {
        if self.variants.take().is_some() {
            tracing::debug!("chunk {} unloaded", self.index);
        }
    }

    pub fn prompt_variant(&self) -> Result<&ChunkVariant> {
        match &self.variants {
            Some(Variants::Single(v)) | Some(Variants::Split { prompt: v, .. }) => Ok(v),
            None => Err(PipelineError::NotLoaded),
        }
    }

    pub fn generation_variant(&self) -> Result<&ChunkVariant> {
        match &self.variants {
            Some(Variants::Single(v)) | Some(Variants::Split { generation: v, .. }) => Ok(v),
            None => Err(PipelineError::NotLoaded),
        }
    }

    /// The variant to run when `new_token_count` tokens are processed on
    /// top of `current_token_count`: generation unless the new tokens do not
    /// fit its native sequence length.
    pub fn variant_for(&self, _current_token_count: usize, new_token_count: usize) -> Result<&ChunkVariant> {
        let generation = self.generation_variant()?;
        if new_token_count > generation.native_sequence_length() {
            self.prompt_variant()
        } else {
            Ok(generation)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StubSpec, SyntheticLoader};

    fn stub_chunk(loader: &SyntheticLoader, split: bool) -> ChunkModel {
        let path = PathBuf::from("/virtual/m_chunk1.model");
        let prompt = StubSpec::new(64, 64);
        let generation = StubSpec::new(1, 127);
        if split {
            loader.register_interior(&path, prompt, Some(generation));
        } else {
            loader.register_interior(&path, prompt, None);
        }
        ChunkModel::new(1, path, ComputePlacement::CpuAndAccelerator, "prompt", "generation")
    }

    #[test]
    fn test_split_variants() {
        let loader = SyntheticLoader::new();
        let mut chunk = stub_chunk(&loader, true);
        assert!(chunk.prompt_variant().is_err());
        chunk.load(&loader).unwrap();
        assert!(chunk.has_split_variants());
        assert_eq!(chunk.prompt_variant().unwrap().native_sequence_length(), 64);
        assert_eq!(chunk.generation_variant().unwrap().native_sequence_length(), 1);
        assert_eq!(chunk.variant_for(0, 64).unwrap().function(), Some("prompt"));
        assert_eq!(chunk.variant_for(64, 1).unwrap().function(), Some("generation"));
    }

    #[test]
    fn test_single_variant_serves_both_phases() {
        let loader = SyntheticLoader::new();
        let mut chunk = stub_chunk(&loader, false);
        chunk.load(&loader).unwrap();
        assert!(!chunk.has_split_variants());
        assert_eq!(chunk.variant_for(0, 64).unwrap().native_sequence_length(), 64);
        assert_eq!(chunk.variant_for(64, 1).unwrap().native_sequence_length(), 64);
    }

    #[test]
    fn test_load_is_idempotent_and_unload_releases() {
        let loader = SyntheticLoader::new();
        let mut chunk = stub_chunk(&loader, true);
        chunk.load(&loader).unwrap();
        chunk.load(&loader).unwrap();
        assert_eq!(loader.load_count(chunk.path()), 2);
        chunk.unload();
        assert!(!chunk.is_loaded());
        assert!(matches!(chunk.generation_variant(), Err(PipelineError::NotLoaded)));
    }

    #[test]
    fn test_missing_artifact_is_a_load_error() {
        let loader = SyntheticLoader::new();
        let mut chunk = ChunkModel::new(
            0,
            PathBuf::from("/virtual/missing_chunk0.model"),
            ComputePlacement::CpuOnly,
            "prompt",
            "generation",
        );
        assert!(matches!(chunk.load(&loader), Err(PipelineError::ModelLoad { .. })));
    }
}
