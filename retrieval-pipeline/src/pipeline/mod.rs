mod config;
mod stages;
mod strategies;

pub use config::{RetrievalConfig, RetrievalStrategy, RetrievalTuning};

use async_trait::async_trait;
use common::{error::AppError, utils::embedding::EmbeddingProvider};
use std::time::{Duration, Instant};
use tracing::info;

use crate::{
    dense::DenseIndex,
    expansion::{AvailableFilters, QueryExpander},
    quality::RetrievalQuality,
    reranking::RerankerLease,
    sparse::SparseIndex,
    ScoredChunk,
};

use stages::PipelineContext;
use strategies::{AdvancedStrategyDriver, BaselineStrategyDriver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    SelfQuery,
    Expand,
    Retrieve,
    Rerank,
    Assemble,
}

#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn kind(&self) -> StageKind;
    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError>;
}

pub type BoxedStage = Box<dyn PipelineStage>;

pub trait StrategyDriver: Send + Sync {
    fn stages(&self) -> Vec<BoxedStage>;
}

#[derive(Debug, Default, Clone)]
pub struct PipelineStageTimings {
    timings: Vec<(StageKind, Duration)>,
}

impl PipelineStageTimings {
    pub fn record(&mut self, kind: StageKind, duration: Duration) {
        self.timings.push((kind, duration));
    }

    pub fn into_vec(self) -> Vec<(StageKind, Duration)> {
        self.timings
    }

    fn get_stage_ms(&self, kind: StageKind) -> u128 {
        self.timings
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, d)| d.as_millis())
            .unwrap_or(0)
    }

    pub fn retrieve_ms(&self) -> u128 {
        self.get_stage_ms(StageKind::Retrieve)
    }

    pub fn rerank_ms(&self) -> u128 {
        self.get_stage_ms(StageKind::Rerank)
    }
}

/// Shared handles the pipeline borrows for the duration of one request.
/// The indices and models are request-parallel: nothing here is mutated,
/// so any number of retrievals may run against them concurrently.
pub struct PipelineDeps<'a> {
    pub dense: &'a DenseIndex,
    pub sparse: &'a SparseIndex,
    pub embedder: &'a EmbeddingProvider,
    pub expander: Option<&'a QueryExpander>,
    pub available_filters: &'a AvailableFilters,
    pub reranker: Option<RerankerLease>,
}

/// Final output of one pipeline run: the ranked chunk set plus its quality
/// classification and per-stage timings.
#[derive(Debug)]
pub struct RetrievalOutcome {
    pub chunks: Vec<ScoredChunk>,
    pub quality: RetrievalQuality,
    pub stage_timings: PipelineStageTimings,
}

impl RetrievalOutcome {
    /// Hook for corrective re-retrieval: a caller may broaden filters and
    /// re-run when this is true. Nothing in the pipeline acts on it.
    pub fn suggests_retry(&self) -> bool {
        self.quality == RetrievalQuality::Low
    }
}

pub async fn run_pipeline(
    deps: PipelineDeps<'_>,
    query: &str,
    config: RetrievalConfig,
) -> Result<RetrievalOutcome, AppError> {
    let query_chars = query.chars().count();
    let preview: String = query.chars().take(120).collect();
    let preview_clean = preview.replace('\n', " ");
    info!(
        query_chars,
        preview = %preview_clean,
        strategy = %config.strategy,
        "Starting retrieval pipeline"
    );

    let driver: Box<dyn StrategyDriver> = match config.strategy {
        RetrievalStrategy::Advanced => Box::new(AdvancedStrategyDriver),
        RetrievalStrategy::Baseline => Box::new(BaselineStrategyDriver),
    };

    let mut ctx = PipelineContext::new(deps, query, config);

    if ctx.config.strategy == RetrievalStrategy::Baseline {
        // Baseline means plain hybrid retrieval: identity reranking even
        // when a reranker happens to be loaded.
        ctx.reranker = None;
    }

    for stage in driver.stages() {
        let start = Instant::now();
        stage.execute(&mut ctx).await?;
        ctx.record_stage_duration(stage.kind(), start.elapsed());
    }

    let outcome = ctx.into_outcome();
    info!(
        results = outcome.chunks.len(),
        quality = %outcome.quality,
        "Retrieval pipeline finished"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Metadata, MetadataValue, ScoreStage};
    use common::storage::db::SurrealDbClient;
    use std::sync::Arc;
    use uuid::Uuid;

    const DIM: usize = 128;

    const CORPUS: [(&str, &str); 3] = [
        ("doc_a_chunk_0", "Fördermittel für Tablets in Grundschulen"),
        ("doc_b_chunk_0", "BMBF Förderung für MINT-Projekte"),
        ("doc_c_chunk_0", "Digitalisierung im Bildungswesen"),
    ];

    struct Fixture {
        dense: DenseIndex,
        sparse: SparseIndex,
        embedder: EmbeddingProvider,
        available_filters: AvailableFilters,
    }

    impl Fixture {
        fn deps(&self) -> PipelineDeps<'_> {
            PipelineDeps {
                dense: &self.dense,
                sparse: &self.sparse,
                embedder: &self.embedder,
                expander: None,
                available_filters: &self.available_filters,
                reranker: None,
            }
        }
    }

    async fn fixture(corpus: &[(&str, &str)]) -> Fixture {
        let embedder = EmbeddingProvider::new_hashed(DIM);

        let db = SurrealDbClient::memory("pipeline_test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("failed to start in-memory surrealdb");
        let dense = DenseIndex::new(Arc::new(db), DIM);
        dense.ensure_index().await.expect("failed to define index");

        if !corpus.is_empty() {
            let ids: Vec<String> = corpus.iter().map(|(id, _)| (*id).to_owned()).collect();
            let texts: Vec<String> = corpus.iter().map(|(_, text)| (*text).to_owned()).collect();
            let embeddings = embedder
                .embed_documents(&texts)
                .await
                .expect("embedding corpus failed");
            let metadatas: Vec<Metadata> = corpus
                .iter()
                .map(|(id, _)| {
                    [("document_id".to_owned(), MetadataValue::from(*id))]
                        .into_iter()
                        .collect()
                })
                .collect();
            dense
                .upsert(&ids, &embeddings, &texts, &metadatas)
                .await
                .expect("upsert failed");
        }

        let mut sparse = SparseIndex::new();
        let documents: Vec<crate::sparse::SparseDocument> = corpus
            .iter()
            .map(|(id, text)| crate::sparse::SparseDocument {
                id: (*id).to_owned(),
                text: (*text).to_owned(),
            })
            .collect();
        if !documents.is_empty() {
            sparse.build(&documents);
        }

        Fixture {
            dense,
            sparse,
            embedder,
            available_filters: AvailableFilters::default(),
        }
    }

    #[tokio::test]
    async fn end_to_end_scenario_ranks_the_tablet_chunk_first() {
        let fixture = fixture(&CORPUS).await;

        let outcome = run_pipeline(
            fixture.deps(),
            "Tablets für Schüler",
            RetrievalConfig::default(),
        )
        .await
        .expect("pipeline run failed");

        assert!(!outcome.chunks.is_empty());
        assert_eq!(outcome.chunks[0].id, "doc_a_chunk_0");
        for other in &outcome.chunks[1..] {
            assert!(outcome.chunks[0].score > other.score);
        }
    }

    #[tokio::test]
    async fn without_reranker_output_is_the_pool_truncated_in_order() {
        let fixture = fixture(&CORPUS).await;

        let full = run_pipeline(
            fixture.deps(),
            "Tablets für Schüler",
            RetrievalConfig::default().with_top_k(10),
        )
        .await
        .expect("pipeline run failed");

        let truncated = run_pipeline(
            fixture.deps(),
            "Tablets für Schüler",
            RetrievalConfig::default().with_top_k(2),
        )
        .await
        .expect("pipeline run failed");

        // Identity reranking: the smaller run is a prefix of the larger
        // one, in the same fused order.
        assert_eq!(truncated.chunks.len(), 2.min(full.chunks.len()));
        for (small, large) in truncated.chunks.iter().zip(full.chunks.iter()) {
            assert_eq!(small.id, large.id);
        }
        assert!(truncated
            .chunks
            .iter()
            .all(|chunk| chunk.stage == ScoreStage::Fused));
    }

    #[tokio::test]
    async fn empty_corpus_yields_empty_results_and_low_quality() {
        let fixture = fixture(&[]).await;

        let outcome = run_pipeline(
            fixture.deps(),
            "Tablets für Schüler",
            RetrievalConfig::default(),
        )
        .await
        .expect("pipeline run failed");

        assert!(outcome.chunks.is_empty());
        assert_eq!(outcome.quality, RetrievalQuality::Low);
        assert!(outcome.suggests_retry());
    }

    #[tokio::test]
    async fn baseline_strategy_skips_expansion_and_reranking() {
        let fixture = fixture(&CORPUS).await;

        let outcome = run_pipeline(
            fixture.deps(),
            "Tablets für Schüler",
            RetrievalConfig::with_strategy(RetrievalStrategy::Baseline),
        )
        .await
        .expect("pipeline run failed");

        assert!(!outcome.chunks.is_empty());
        assert_eq!(outcome.chunks[0].id, "doc_a_chunk_0");
        assert!(outcome
            .chunks
            .iter()
            .all(|chunk| chunk.stage == ScoreStage::Fused));
    }

    #[tokio::test]
    async fn base_filters_restrict_every_variant() {
        let fixture = fixture(&CORPUS).await;

        let filters: Metadata = [(
            "document_id".to_owned(),
            MetadataValue::from("doc_b_chunk_0"),
        )]
        .into_iter()
        .collect();

        let outcome = run_pipeline(
            fixture.deps(),
            "Förderung für MINT",
            RetrievalConfig::default().with_base_filters(filters),
        )
        .await
        .expect("pipeline run failed");

        assert!(!outcome.chunks.is_empty());
        assert!(outcome
            .chunks
            .iter()
            .all(|chunk| chunk.id == "doc_b_chunk_0"));
    }
}
