//! End-to-end generation against the synthetic runtime.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chunkline_pipeline::testing::{StubSpec, SyntheticLoader, SyntheticPipeline, FAVOURED_TOKEN};
use chunkline_pipeline::{
    BufferScope, Generation, ModelPipeline, PipelineError, Prediction, PredictionKind, TaskState, TokenId,
};
use futures::StreamExt;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn loaded(stub: &SyntheticPipeline, dir: &Path) -> anyhow::Result<(ModelPipeline, Arc<SyntheticLoader>)> {
    init_tracing();
    let (config, loader) = stub.install(dir)?;
    let mut pipeline = ModelPipeline::new(config, loader.clone())?;
    pipeline.load()?;
    Ok((pipeline, loader))
}

async fn drain(generation: &mut Generation) -> anyhow::Result<Vec<Prediction>> {
    let mut predictions = Vec::new();
    while let Some(prediction) = generation.next().await {
        predictions.push(prediction?);
    }
    Ok(predictions)
}

fn cache_row(generation: &Generation, chunk: usize, name: &str) -> Vec<f32> {
    generation
        .buffer(chunk, name)
        .and_then(|t| t.row_f32(0).ok())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_end_to_end_generation() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (pipeline, loader) = loaded(&SyntheticPipeline::new(4, StubSpec::new(4, 8)), dir.path())?;

    let mut generation = pipeline.predict(&[1, 2, 3], 2)?;
    let predictions = drain(&mut generation).await?;

    assert_eq!(predictions.len(), 2);
    assert!(predictions.iter().all(|p| p.kind == PredictionKind::Generated));
    assert_eq!(predictions[0].token, FAVOURED_TOKEN);
    assert_eq!(predictions[0].tokens, vec![1, 2, 3, 42]);
    assert_eq!(predictions[1].tokens, vec![1, 2, 3, 42, 42]);
    assert!(predictions[0].prompt_latency.is_some());
    assert!(predictions[1].prompt_latency.is_none());

    assert!(generation.is_finished());
    assert!(generation.next().await.is_none());
    assert_eq!(generation.steps(), 2);
    assert_eq!(generation.transitions(), 1);

    let log = loader.log();
    assert!(log.violations().is_empty(), "{:?}", log.violations());
    assert_eq!(log.chunk_runs(0), 2);
    // Only the second step fills its window: one update per interior chunk.
    assert_eq!(log.maintenance_runs(), 2);
    Ok(())
}

#[tokio::test]
async fn test_zero_new_tokens_runs_nothing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (pipeline, loader) = loaded(&SyntheticPipeline::new(3, StubSpec::new(4, 8)), dir.path())?;
    let mut generation = pipeline.predict(&[5, 6, 7], 0)?;
    assert!(generation.next().await.is_none());
    assert!(loader.log().events().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_unbounded_generation_keeps_going() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (pipeline, loader) = loaded(&SyntheticPipeline::new(3, StubSpec::new(4, 8)), dir.path())?;

    let mut generation = pipeline.predict(&[1, 2, 3], usize::MAX)?;
    for expected_len in 4..=10 {
        let prediction = generation.next().await.transpose()?;
        let prediction = prediction.ok_or_else(|| anyhow::anyhow!("generation ended early"))?;
        assert_eq!(prediction.kind, PredictionKind::Generated);
        assert_eq!(prediction.tokens.len(), expected_len);
    }
    assert!(!generation.is_finished());
    generation.cancel().await?;
    assert!(loader.log().violations().is_empty(), "{:?}", loader.log().violations());
    Ok(())
}

#[tokio::test]
async fn test_multi_piece_prompt_waits_for_maintenance() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let stub = SyntheticPipeline::new(4, StubSpec::new(4, 8).with_blocks(2))
        .with_maintenance_delay(Duration::from_millis(30));
    let (pipeline, loader) = loaded(&stub, dir.path())?;

    let prompt: Vec<TokenId> = (1..=10).collect();
    let mut generation = pipeline.predict(&prompt, 2)?;
    let predictions = drain(&mut generation).await?;

    let kinds: Vec<PredictionKind> = predictions.iter().map(|p| p.kind).collect();
    let mut expected = vec![PredictionKind::Prompt; 6];
    expected.extend([PredictionKind::Generated; 2]);
    assert_eq!(kinds, expected);
    // Prompt pieces after the first are echoed one token at a time.
    assert_eq!(predictions[0].tokens, vec![1, 2, 3, 4, 5]);
    assert_eq!(predictions[5].tokens, prompt);
    assert_eq!(predictions[7].tokens.len(), 12);

    let log = loader.log();
    assert!(log.violations().is_empty(), "{:?}", log.violations());
    // Two full windows, two interior chunks, two blocks.
    assert_eq!(log.maintenance_runs(), 8);
    assert!(log.cache_checks() > 0);
    Ok(())
}

#[tokio::test]
async fn test_transition_recombines_shorter_cache() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let stub = SyntheticPipeline::new(4, StubSpec::new(512, 512)).with_generation(StubSpec::new(1, 511));
    let (pipeline, loader) = loaded(&stub, dir.path())?;

    let prompt: Vec<TokenId> = (0..512).map(|t| t % 60).collect();
    let mut generation = pipeline.predict(&prompt, 3)?;
    assert_eq!(generation.configuration().map(|c| c.query_length), Some(512));

    let first = generation.next().await.transpose()?;
    assert_eq!(first.map(|p| p.kind), Some(PredictionKind::Generated));
    let configuration = generation.configuration();
    assert_eq!(configuration.map(|c| (c.query_length, c.context_length)), Some((1, 512)));

    let cache = cache_row(&generation, 1, "k_cache_0");
    assert_eq!(cache.len(), 511);
    assert_eq!(cache.first().copied(), Some(2.0));
    assert_eq!(cache.last().copied(), Some(512.0));

    let rest = drain(&mut generation).await?;
    assert_eq!(rest.len(), 2);
    assert!(loader.log().violations().is_empty(), "{:?}", loader.log().violations());
    Ok(())
}

#[tokio::test]
async fn test_transition_adopts_matching_slice() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let stub = SyntheticPipeline::new(3, StubSpec::new(512, 1024)).with_generation(StubSpec::new(1, 512));
    let (pipeline, loader) = loaded(&stub, dir.path())?;

    let prompt: Vec<TokenId> = (0..512).map(|t| t % 60).collect();
    let mut generation = pipeline.predict(&prompt, 2)?;
    let before = generation.buffer_ids().unwrap_or_default();
    let slice = before.get(&(BufferScope::Chunk(1), "new_k_cache_0".to_string())).copied();

    let first = generation.next().await.transpose()?;
    assert!(first.is_some());
    let after = generation.buffer_ids().unwrap_or_default();
    let cache = after.get(&(BufferScope::Chunk(1), "k_cache_0".to_string())).copied();
    assert!(slice.is_some());
    assert_eq!(cache, slice);

    let row = cache_row(&generation, 1, "k_cache_0");
    assert_eq!(row.len(), 512);
    assert_eq!(row.last().copied(), Some(512.0));

    drain(&mut generation).await?;
    assert!(loader.log().violations().is_empty(), "{:?}", loader.log().violations());
    Ok(())
}

#[tokio::test]
async fn test_transition_after_partial_window() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let stub = SyntheticPipeline::new(4, StubSpec::new(4, 8)).with_generation(StubSpec::new(1, 8));
    let (pipeline, loader) = loaded(&stub, dir.path())?;

    let mut generation = pipeline.predict(&[1, 2, 3, 4, 5, 6], 3)?;
    let mut predictions = Vec::new();
    while predictions.iter().all(|p: &Prediction| p.kind == PredictionKind::Prompt) {
        match generation.next().await {
            Some(p) => predictions.push(p?),
            None => break,
        }
    }
    assert_eq!(predictions.len(), 3);
    // Positions 5 and 6 were never folded by maintenance; the resize appends
    // them from the prompt-phase slices.
    assert_eq!(
        cache_row(&generation, 2, "v_cache_0"),
        vec![0.0, 0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]
    );

    drain(&mut generation).await?;
    assert!(loader.log().violations().is_empty(), "{:?}", loader.log().violations());
    Ok(())
}

#[tokio::test]
async fn test_buffers_keep_identity_across_steps() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (pipeline, _loader) = loaded(&SyntheticPipeline::new(4, StubSpec::new(4, 8)), dir.path())?;

    let mut generation = pipeline.predict(&[1, 2, 3, 4], 4)?;
    let initial = generation.buffer_ids().unwrap_or_default();
    assert!(!initial.is_empty());
    while let Some(prediction) = generation.next().await {
        prediction?;
        if let Some(ids) = generation.buffer_ids() {
            assert_eq!(ids, initial);
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_model_ignoring_backings_is_rejected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (pipeline, _loader) = loaded(&SyntheticPipeline::new(3, StubSpec::new(4, 8)).ignoring_backings(), dir.path())?;

    let mut generation = pipeline.predict(&[1, 2], 2)?;
    let err = generation.next().await.and_then(Result::err);
    assert!(matches!(err, Some(PipelineError::AliasingViolation { chunk: 0, .. })), "{err:?}");
    assert!(generation.next().await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_stream_and_sampling_model() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let stub = SyntheticPipeline::new(3, StubSpec::new(4, 8).with_logit_parts(2)).with_sampling_model();
    let (pipeline, _loader) = loaded(&stub, dir.path())?;
    assert_eq!(pipeline.configuration().map(|c| c.vocabulary_size), Some(64));

    let predictions: Vec<_> = pipeline.predict(&[9, 8, 7], 3)?.into_stream().collect().await;
    let tokens = predictions
        .into_iter()
        .map(|p| p.map(|p| p.token))
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(tokens, vec![FAVOURED_TOKEN; 3]);
    Ok(())
}

#[tokio::test]
async fn test_cancel_waits_for_cache_updates() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let stub = SyntheticPipeline::new(4, StubSpec::new(4, 8)).with_maintenance_delay(Duration::from_millis(40));
    let (pipeline, loader) = loaded(&stub, dir.path())?;

    let mut generation = pipeline.predict(&(1..=8).collect::<Vec<_>>(), 4)?;
    let first = generation.next().await.transpose()?;
    assert_eq!(first.map(|p| p.kind), Some(PredictionKind::Prompt));

    let maintainer = generation.cache_maintainer().map(|m| m.pending_chunks());
    assert_eq!(maintainer, Some(2));

    generation.cancel().await?;
    assert_eq!(loader.log().maintenance_runs(), 2);
    Ok(())
}

#[tokio::test]
async fn test_cache_update_tasks_complete() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (pipeline, _loader) = loaded(&SyntheticPipeline::new(3, StubSpec::new(2, 4)), dir.path())?;

    let mut generation = pipeline.predict(&[1, 2], 2)?;
    generation.next().await.transpose()?;
    // The first step filled its window; the transition drained its update.
    let states: Vec<TaskState> = generation
        .cache_maintainer()
        .map(|m| m.tasks(1).iter().map(|t| t.state()).collect())
        .unwrap_or_default();
    assert_eq!(states, vec![TaskState::Completed]);
    Ok(())
}

#[tokio::test]
async fn test_unload_keeps_running_generation_alive() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (mut pipeline, _loader) = loaded(&SyntheticPipeline::new(3, StubSpec::new(4, 8)), dir.path())?;

    let mut generation = pipeline.predict(&[1], 2)?;
    pipeline.unload();
    assert!(matches!(pipeline.predict(&[1], 2), Err(PipelineError::NotLoaded)));
    assert_eq!(drain(&mut generation).await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_missing_chunk_fails_discovery() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let stub = SyntheticPipeline::new(4, StubSpec::new(4, 8));
    let (config, loader) = stub.install(dir.path())?;
    std::fs::remove_file(stub.chunk_path(dir.path(), 1))?;

    let mut pipeline = ModelPipeline::new(config, loader)?;
    assert!(matches!(pipeline.load(), Err(PipelineError::NonContiguousChunks(_))));
    Ok(())
}
