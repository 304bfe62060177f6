use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ScoredChunk;

/// Corrective-RAG style post-hoc classification of a retrieval result set.
/// Informational in the current scope: it is logged and returned so a
/// caller may decide to broaden filters and re-run, but nothing re-retrieves
/// automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalQuality {
    High,
    Medium,
    Low,
}

impl fmt::Display for RetrievalQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RetrievalQuality::High => "high",
            RetrievalQuality::Medium => "medium",
            RetrievalQuality::Low => "low",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QualityThresholds {
    pub high: f32,
    pub medium: f32,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            high: 0.7,
            medium: 0.4,
        }
    }
}

/// Mean of whatever score the final results carry (rerank score, else
/// fusion score, else raw similarity — the `score` field always holds the
/// current ranking key). An empty result set is always `Low`.
pub fn classify(results: &[ScoredChunk], thresholds: QualityThresholds) -> RetrievalQuality {
    if results.is_empty() {
        return RetrievalQuality::Low;
    }

    let mean = results.iter().map(|chunk| chunk.score).sum::<f32>() / results.len() as f32;

    if mean > thresholds.high {
        RetrievalQuality::High
    } else if mean > thresholds.medium {
        RetrievalQuality::Medium
    } else {
        RetrievalQuality::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Metadata, ScoreStage};

    fn chunk(score: f32) -> ScoredChunk {
        ScoredChunk {
            id: format!("chunk_{score}"),
            text: "text".to_owned(),
            metadata: Metadata::new(),
            score,
            stage: ScoreStage::Reranked,
        }
    }

    #[test]
    fn uniformly_strong_results_classify_high() {
        let results = vec![chunk(0.9), chunk(0.9), chunk(0.9)];
        assert_eq!(
            classify(&results, QualityThresholds::default()),
            RetrievalQuality::High
        );
    }

    #[test]
    fn middling_results_classify_medium() {
        let results = vec![chunk(0.5), chunk(0.5)];
        assert_eq!(
            classify(&results, QualityThresholds::default()),
            RetrievalQuality::Medium
        );
    }

    #[test]
    fn weak_results_classify_low() {
        let results = vec![chunk(0.1), chunk(0.1)];
        assert_eq!(
            classify(&results, QualityThresholds::default()),
            RetrievalQuality::Low
        );
    }

    #[test]
    fn empty_result_set_is_always_low() {
        assert_eq!(
            classify(&[], QualityThresholds::default()),
            RetrievalQuality::Low
        );
    }

    #[test]
    fn thresholds_are_exclusive_bounds() {
        assert_eq!(
            classify(&[chunk(0.7)], QualityThresholds::default()),
            RetrievalQuality::Medium
        );
        assert_eq!(
            classify(&[chunk(0.4)], QualityThresholds::default()),
            RetrievalQuality::Low
        );
    }
}
