pub mod dense;
pub mod expansion;
pub mod fusion;
pub mod hybrid;
pub mod pipeline;
pub mod quality;
pub mod reranking;
pub mod sparse;

use std::collections::HashMap;

use common::error::AppError;
use serde::{Deserialize, Serialize};
use tracing::instrument;

pub use pipeline::{
    run_pipeline, PipelineDeps, PipelineStageTimings, RetrievalConfig, RetrievalOutcome,
    RetrievalStrategy, RetrievalTuning,
};
pub use quality::RetrievalQuality;

/// Scalar metadata value. Chunk metadata is a flat map of these; nested
/// structures are rejected at the index boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Number(f64),
    Text(String),
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

pub type Metadata = HashMap<String, MetadataValue>;

/// Which stage produced the current `score` of a [`ScoredChunk`]. Scores
/// from different stages live on different scales and must never be
/// compared across stages; the tag keeps the ranking key honest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreStage {
    /// Vector similarity from the dense index.
    Similarity,
    /// BM25 score from the sparse index.
    Lexical,
    /// Reciprocal rank fusion score.
    Fused,
    /// Cross-encoder score.
    Reranked,
}

/// One retrievable chunk with its current ranking score. Transient; built
/// per request, handed to the draft generator, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub score: f32,
    pub stage: ScoreStage,
}

/// Run the retrieval pipeline for one query and return the ranked chunk
/// set plus its quality classification.
#[instrument(skip_all, fields(query_chars = query.chars().count()))]
pub async fn retrieve_chunks(
    deps: PipelineDeps<'_>,
    query: &str,
    config: RetrievalConfig,
) -> Result<RetrievalOutcome, AppError> {
    pipeline::run_pipeline(deps, query, config).await
}
