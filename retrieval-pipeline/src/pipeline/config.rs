use serde::{Deserialize, Serialize};
use std::fmt;

use crate::fusion::DEFAULT_RRF_K;
use crate::hybrid::{DEFAULT_DENSE_WEIGHT, DEFAULT_SPARSE_WEIGHT};
use crate::quality::QualityThresholds;
use crate::Metadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStrategy {
    /// Full pipeline: self-querying, query expansion, multi-query hybrid
    /// retrieval, reranking, quality evaluation.
    #[default]
    Advanced,
    /// Plain hybrid retrieval: no LLM round-trips, identity reranking.
    Baseline,
}

impl std::str::FromStr for RetrievalStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "advanced" => Ok(Self::Advanced),
            "baseline" => Ok(Self::Baseline),
            other => Err(format!("unknown retrieval strategy '{other}'")),
        }
    }
}

impl fmt::Display for RetrievalStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RetrievalStrategy::Advanced => "advanced",
            RetrievalStrategy::Baseline => "baseline",
        };
        f.write_str(label)
    }
}

/// Tunable parameters that govern each retrieval stage. The fusion weights
/// and the RRF constant are carried over from the first deployment and are
/// deliberately configuration, not constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalTuning {
    /// Final number of chunks handed to the caller.
    pub top_k: usize,
    /// Each query variant asks the hybrid searcher for
    /// `top_k * candidate_multiplier` candidates.
    pub candidate_multiplier: usize,
    /// The deduplicated pool is capped at `top_k * prerank_multiplier`
    /// before reranking, to bound cross-encoder cost.
    pub prerank_multiplier: usize,
    /// Paraphrases requested from the query expander, not counting the
    /// original query.
    pub num_query_variants: usize,
    pub rrf_k: f32,
    pub dense_weight: f32,
    pub sparse_weight: f32,
    pub quality_high_threshold: f32,
    pub quality_medium_threshold: f32,
}

impl Default for RetrievalTuning {
    fn default() -> Self {
        Self {
            top_k: 5,
            candidate_multiplier: 4,
            prerank_multiplier: 2,
            num_query_variants: 3,
            rrf_k: DEFAULT_RRF_K,
            dense_weight: DEFAULT_DENSE_WEIGHT,
            sparse_weight: DEFAULT_SPARSE_WEIGHT,
            quality_high_threshold: 0.7,
            quality_medium_threshold: 0.4,
        }
    }
}

impl RetrievalTuning {
    pub fn quality_thresholds(&self) -> QualityThresholds {
        QualityThresholds {
            high: self.quality_high_threshold,
            medium: self.quality_medium_threshold,
        }
    }
}

/// Per-request configuration: strategy, tuning, and filters the caller
/// pins ahead of self-querying (for example a specific funding programme).
/// Caller-pinned filters win over extracted ones on key conflicts.
#[derive(Debug, Clone, Default)]
pub struct RetrievalConfig {
    pub strategy: RetrievalStrategy,
    pub tuning: RetrievalTuning,
    pub base_filters: Metadata,
}

impl RetrievalConfig {
    pub fn new(tuning: RetrievalTuning) -> Self {
        Self {
            strategy: RetrievalStrategy::default(),
            tuning,
            base_filters: Metadata::new(),
        }
    }

    pub fn with_strategy(strategy: RetrievalStrategy) -> Self {
        Self {
            strategy,
            tuning: RetrievalTuning::default(),
            base_filters: Metadata::new(),
        }
    }

    pub fn with_base_filters(mut self, filters: Metadata) -> Self {
        self.base_filters = filters;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.tuning.top_k = top_k;
        self
    }
}
