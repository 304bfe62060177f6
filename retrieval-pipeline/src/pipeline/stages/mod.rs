use async_trait::async_trait;
use common::{error::AppError, utils::embedding::EmbeddingProvider};
use std::collections::HashSet;
use tracing::{debug, instrument, warn};

use crate::{
    dense::DenseIndex,
    expansion::{AvailableFilters, QueryExpander},
    hybrid::{HybridSearcher, HybridWeights},
    quality::classify,
    reranking::RerankerLease,
    sparse::SparseIndex,
    Metadata, ScoreStage, ScoredChunk,
};

use super::{
    config::RetrievalConfig, PipelineDeps, PipelineStage, PipelineStageTimings, RetrievalOutcome,
    StageKind,
};

/// State threaded through the stages of one retrieval request. Holds
/// borrowed handles to the shared indices and models plus the per-request
/// query context; discarded when the run finishes.
pub struct PipelineContext<'a> {
    pub dense: &'a DenseIndex,
    pub sparse: &'a SparseIndex,
    pub embedder: &'a EmbeddingProvider,
    pub expander: Option<&'a QueryExpander>,
    pub available_filters: &'a AvailableFilters,
    pub reranker: Option<RerankerLease>,
    pub config: RetrievalConfig,
    pub raw_query: String,
    pub cleaned_query: String,
    pub filters: Metadata,
    pub variants: Vec<String>,
    pub pool: Vec<ScoredChunk>,
    pub outcome_chunks: Vec<ScoredChunk>,
    pub quality: crate::RetrievalQuality,
    stage_timings: PipelineStageTimings,
}

impl<'a> PipelineContext<'a> {
    pub fn new(deps: PipelineDeps<'a>, query: &str, config: RetrievalConfig) -> Self {
        let filters = config.base_filters.clone();
        Self {
            dense: deps.dense,
            sparse: deps.sparse,
            embedder: deps.embedder,
            expander: deps.expander,
            available_filters: deps.available_filters,
            reranker: deps.reranker,
            config,
            raw_query: query.to_owned(),
            cleaned_query: query.to_owned(),
            filters,
            variants: Vec::new(),
            pool: Vec::new(),
            outcome_chunks: Vec::new(),
            quality: crate::RetrievalQuality::Low,
            stage_timings: PipelineStageTimings::default(),
        }
    }

    pub fn record_stage_duration(&mut self, kind: StageKind, duration: std::time::Duration) {
        self.stage_timings.record(kind, duration);
    }

    pub fn into_outcome(self) -> RetrievalOutcome {
        RetrievalOutcome {
            chunks: self.outcome_chunks,
            quality: self.quality,
            stage_timings: self.stage_timings,
        }
    }

    fn active_filter(&self) -> Option<&Metadata> {
        (!self.filters.is_empty()).then_some(&self.filters)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SelfQueryStage;

#[async_trait]
impl PipelineStage for SelfQueryStage {
    fn kind(&self) -> StageKind {
        StageKind::SelfQuery
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        self_query(ctx).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExpandStage;

#[async_trait]
impl PipelineStage for ExpandStage {
    fn kind(&self) -> StageKind {
        StageKind::Expand
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        expand(ctx).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetrieveStage;

#[async_trait]
impl PipelineStage for RetrieveStage {
    fn kind(&self) -> StageKind {
        StageKind::Retrieve
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        retrieve(ctx).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RerankStage;

#[async_trait]
impl PipelineStage for RerankStage {
    fn kind(&self) -> StageKind {
        StageKind::Rerank
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        rerank(ctx).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AssembleStage;

#[async_trait]
impl PipelineStage for AssembleStage {
    fn kind(&self) -> StageKind {
        StageKind::Assemble
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        assemble(ctx)
    }
}

/// Self-querying: pull structured constraints out of the raw query. Never
/// aborts the request; a failed or absent expander leaves the query as-is.
#[instrument(level = "trace", skip_all)]
async fn self_query(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    let Some(expander) = ctx.expander else {
        debug!("No query expander configured; skipping self-querying");
        return Ok(());
    };

    let extraction = expander
        .extract_metadata_filters(&ctx.raw_query, ctx.available_filters)
        .await;

    let mut filters = extraction.filters;
    // Caller-pinned filters override whatever the extractor found.
    for (key, value) in &ctx.config.base_filters {
        filters.insert(key.clone(), value.clone());
    }

    ctx.filters = filters;
    ctx.cleaned_query = extraction.cleaned_query;

    debug!(
        filters = ctx.filters.len(),
        cleaned_query = %ctx.cleaned_query,
        "Self-querying complete"
    );
    Ok(())
}

/// Query expansion: paraphrase the cleaned query. The original query is
/// always variant zero; on failure the list collapses to just that.
#[instrument(level = "trace", skip_all)]
async fn expand(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    let num_variants = ctx.config.tuning.num_query_variants;

    ctx.variants = match ctx.expander {
        Some(expander) if num_variants > 0 => {
            expander.expand_query(&ctx.cleaned_query, num_variants).await
        }
        _ => vec![ctx.cleaned_query.clone()],
    };

    debug!(variants = ctx.variants.len(), "Query variants ready");
    Ok(())
}

/// Multi-query hybrid retrieval: one hybrid search per variant with the
/// extracted filters applied uniformly, merged into one pool, deduplicated
/// by id with the first occurrence winning.
#[instrument(level = "trace", skip_all)]
async fn retrieve(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    if ctx.variants.is_empty() {
        ctx.variants.push(ctx.cleaned_query.clone());
    }

    let tuning = &ctx.config.tuning;
    let candidate_k = tuning.top_k * tuning.candidate_multiplier.max(1);
    let weights = HybridWeights {
        dense: tuning.dense_weight,
        sparse: tuning.sparse_weight,
    };
    let searcher = HybridSearcher::new(ctx.dense, ctx.sparse, ctx.embedder);

    let mut seen: HashSet<String> = HashSet::new();
    let mut pool: Vec<ScoredChunk> = Vec::new();

    // Variants run in request order so dedup stays deterministic: the
    // first variant that surfaces a chunk keeps its fused score.
    for variant in &ctx.variants {
        let hits = searcher
            .search(
                variant,
                candidate_k,
                weights,
                tuning.rrf_k,
                ctx.active_filter(),
            )
            .await?;

        for hit in hits {
            if seen.insert(hit.id.clone()) {
                pool.push(hit);
            }
        }
    }

    debug!(
        variants = ctx.variants.len(),
        unique_candidates = pool.len(),
        "Merged multi-query candidate pool"
    );
    ctx.pool = pool;
    Ok(())
}

/// Cross-encoder reranking over the capped candidate pool, scored against
/// the cleaned (not variant-expanded) query. Without a reranker lease the
/// pool passes through unchanged, truncated to `top_k`.
#[instrument(level = "trace", skip_all)]
async fn rerank(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    let tuning = &ctx.config.tuning;
    let top_k = tuning.top_k;

    // Bound reranker cost before scoring anything.
    let cap = top_k * tuning.prerank_multiplier.max(1);
    if ctx.pool.len() > cap {
        ctx.pool.truncate(cap);
    }

    let Some(reranker) = ctx.reranker.as_ref() else {
        debug!("No reranker lease provided; truncating pool to top_k");
        ctx.pool.truncate(top_k);
        return Ok(());
    };

    if ctx.pool.len() <= 1 {
        ctx.pool.truncate(top_k);
        return Ok(());
    }

    let documents: Vec<String> = ctx.pool.iter().map(|chunk| chunk.text.clone()).collect();

    match reranker.rerank(&ctx.cleaned_query, documents).await {
        Ok(results) if !results.is_empty() => {
            apply_rerank_results(&mut ctx.pool, results, top_k);
            debug!(kept = ctx.pool.len(), "Applied cross-encoder reranking");
        }
        Ok(_) => {
            debug!("Reranker returned no results; retaining fused ordering");
            ctx.pool.truncate(top_k);
        }
        Err(err) => {
            warn!(error = %err, "Reranking failed; continuing with fused ordering");
            ctx.pool.truncate(top_k);
        }
    }

    Ok(())
}

/// Quality evaluation over the final chunk set.
#[instrument(level = "trace", skip_all)]
fn assemble(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    ctx.outcome_chunks = std::mem::take(&mut ctx.pool);
    ctx.quality = classify(
        &ctx.outcome_chunks,
        ctx.config.tuning.quality_thresholds(),
    );

    debug!(
        results = ctx.outcome_chunks.len(),
        quality = %ctx.quality,
        "Retrieval pipeline assembled"
    );
    Ok(())
}

/// Reorder the pool to the reranker's ordering, overwrite scores with the
/// cross-encoder scores, keep `top_k`. Results arrive ranked best-first and
/// reference pool positions by index; out-of-range indices are skipped.
fn apply_rerank_results(
    pool: &mut Vec<ScoredChunk>,
    results: Vec<fastembed::RerankResult>,
    top_k: usize,
) {
    let mut remaining: Vec<Option<ScoredChunk>> = std::mem::take(pool).into_iter().map(Some).collect();
    let mut reranked: Vec<ScoredChunk> = Vec::with_capacity(remaining.len());

    for result in results {
        if let Some(slot) = remaining.get_mut(result.index) {
            if let Some(mut candidate) = slot.take() {
                candidate.score = result.score;
                candidate.stage = ScoreStage::Reranked;
                reranked.push(candidate);
            }
        } else {
            warn!(
                result_index = result.index,
                "Reranker returned out-of-range index; skipping"
            );
        }
    }

    // Anything the reranker failed to score keeps its fused order behind
    // the scored results.
    for slot in remaining {
        if let Some(candidate) = slot {
            reranked.push(candidate);
        }
    }

    reranked.truncate(top_k);
    *pool = reranked;
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastembed::RerankResult;

    fn chunk(id: &str, score: f32) -> ScoredChunk {
        ScoredChunk {
            id: id.to_owned(),
            text: format!("text {id}"),
            metadata: Metadata::new(),
            score,
            stage: ScoreStage::Fused,
        }
    }

    fn rerank_result(index: usize, score: f32) -> RerankResult {
        RerankResult {
            document: None,
            score,
            index,
        }
    }

    #[test]
    fn rerank_results_reorder_and_rescore_the_pool() {
        let mut pool = vec![chunk("a", 0.03), chunk("b", 0.02), chunk("c", 0.01)];

        apply_rerank_results(
            &mut pool,
            vec![
                rerank_result(2, 0.95),
                rerank_result(0, 0.40),
                rerank_result(1, 0.10),
            ],
            2,
        );

        assert_eq!(pool.len(), 2);
        assert_eq!(pool[0].id, "c");
        assert!((pool[0].score - 0.95).abs() < f32::EPSILON);
        assert_eq!(pool[0].stage, ScoreStage::Reranked);
        assert_eq!(pool[1].id, "a");
    }

    #[test]
    fn out_of_range_indices_are_skipped_and_leftovers_follow() {
        let mut pool = vec![chunk("a", 0.03), chunk("b", 0.02)];

        apply_rerank_results(&mut pool, vec![rerank_result(7, 0.9), rerank_result(1, 0.5)], 5);

        assert_eq!(pool.len(), 2);
        assert_eq!(pool[0].id, "b");
        assert_eq!(pool[0].stage, ScoreStage::Reranked);
        // "a" was never scored; it trails in its fused position.
        assert_eq!(pool[1].id, "a");
        assert_eq!(pool[1].stage, ScoreStage::Fused);
    }
}
