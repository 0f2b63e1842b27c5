//! Locating chunk artifacts on disk.
//!
//! A pipeline directory holds `{prefix}_chunk{N}.{ext}` for N = 0..count.
//! Artifacts may be files or bundle directories.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};

/// Chunk artifacts of one pipeline, ordered by index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkArtifacts {
    pub prefix: String,
    pub paths: Vec<PathBuf>,
}

impl ChunkArtifacts {
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Split `llama_chunk3.model` into `("llama", 3)`.
fn parse_artifact_name(file_name: &str, extension: &str) -> Option<(String, usize)> {
    let stem = file_name.strip_suffix(extension)?.strip_suffix('.')?;
    let (prefix, index) = stem.rsplit_once("_chunk")?;
    if prefix.is_empty() || index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((prefix.to_string(), index.parse().ok()?))
}

/// Find the chunk artifacts in `dir`.
///
/// With `prefix` set only matching artifacts are considered; otherwise the
/// directory must hold exactly one prefix.
pub fn discover_chunks(dir: &Path, extension: &str, prefix: Option<&str>) -> Result<ChunkArtifacts> {
    let mut by_prefix: BTreeMap<String, BTreeMap<usize, PathBuf>> = BTreeMap::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let Some((found, index)) = parse_artifact_name(file_name, extension) else {
            continue;
        };
        if prefix.is_some_and(|p| p != found) {
            continue;
        }
        by_prefix.entry(found).or_default().insert(index, entry.path());
    }

    if by_prefix.len() > 1 {
        return Err(PipelineError::AmbiguousModelPrefix {
            dir: dir.to_path_buf(),
            prefixes: by_prefix.into_keys().collect(),
        });
    }
    let Some((prefix, chunks)) = by_prefix.into_iter().next() else {
        return Err(PipelineError::NoChunksFound(dir.to_path_buf()));
    };

    let indices: Vec<usize> = chunks.keys().copied().collect();
    if indices.iter().enumerate().any(|(expected, &found)| expected != found) {
        return Err(PipelineError::NonContiguousChunks(indices));
    }

    tracing::debug!("found {} chunks with prefix '{}' in {}", chunks.len(), prefix, dir.display());

    Ok(ChunkArtifacts {
        prefix,
        paths: chunks.into_values().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"").unwrap();
    }

    #[test]
    fn test_parse_artifact_name() {
        assert_eq!(parse_artifact_name("llama_chunk3.model", "model"), Some(("llama".into(), 3)));
        assert_eq!(
            parse_artifact_name("my_model_chunk10.model", "model"),
            Some(("my_model".into(), 10))
        );
        assert_eq!(parse_artifact_name("llama_chunk3.bin", "model"), None);
        assert_eq!(parse_artifact_name("_chunk0.model", "model"), None);
        assert_eq!(parse_artifact_name("llama_chunkx.model", "model"), None);
        assert_eq!(parse_artifact_name("cache-processor.model", "model"), None);
    }

    #[test]
    fn test_discovers_in_index_order() {
        let dir = tempfile::tempdir().unwrap();
        for i in [2, 0, 1] {
            touch(dir.path(), &format!("llama_chunk{i}.model"));
        }
        touch(dir.path(), "cache-processor.model");
        let found = discover_chunks(dir.path(), "model", None).unwrap();
        assert_eq!(found.prefix, "llama");
        assert_eq!(found.len(), 3);
        assert!(found.paths[0].ends_with("llama_chunk0.model"));
        assert!(found.paths[2].ends_with("llama_chunk2.model"));
    }

    #[test]
    fn test_bundle_directories_count() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..3 {
            std::fs::create_dir(dir.path().join(format!("m_chunk{i}.model"))).unwrap();
        }
        assert_eq!(discover_chunks(dir.path(), "model", None).unwrap().len(), 3);
    }

    #[test]
    fn test_ambiguous_prefix_and_disambiguation() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..3 {
            touch(dir.path(), &format!("a_chunk{i}.model"));
            touch(dir.path(), &format!("b_chunk{i}.model"));
        }
        let err = discover_chunks(dir.path(), "model", None).unwrap_err();
        assert!(matches!(err, PipelineError::AmbiguousModelPrefix { ref prefixes, .. } if prefixes.len() == 2));
        let found = discover_chunks(dir.path(), "model", Some("b")).unwrap();
        assert_eq!(found.prefix, "b");
    }

    #[test]
    fn test_no_chunks_and_gaps() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            discover_chunks(dir.path(), "model", None),
            Err(PipelineError::NoChunksFound(_))
        ));
        touch(dir.path(), "m_chunk0.model");
        touch(dir.path(), "m_chunk2.model");
        assert!(matches!(
            discover_chunks(dir.path(), "model", None),
            Err(PipelineError::NonContiguousChunks(ref v)) if v == &vec![0, 2]
        ));
    }
}
