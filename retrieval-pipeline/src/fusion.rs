use std::collections::{hash_map::Entry, HashMap};

use crate::{ScoreStage, ScoredChunk};

/// Standard RRF constant. Controls how much influence low-ranked results
/// retain; tunable through [`crate::RetrievalTuning`].
pub const DEFAULT_RRF_K: f32 = 60.0;

/// One ranked input list for fusion, ordered best-first.
#[derive(Debug, Clone)]
pub struct RankedList {
    pub weight: f32,
    pub hits: Vec<ScoredChunk>,
}

impl RankedList {
    pub fn new(hits: Vec<ScoredChunk>) -> Self {
        Self { weight: 1.0, hits }
    }

    pub fn weighted(weight: f32, hits: Vec<ScoredChunk>) -> Self {
        Self { weight, hits }
    }
}

/// Reciprocal rank fusion over any number of ranked lists.
///
/// Each result at zero-based rank `r` in a list with weight `w` contributes
/// `w / (k + r + 1)` to its fused score. Only rank positions enter the
/// computation, so BM25 scores and cosine similarities fuse safely despite
/// their different scales. A chunk appearing in several lists accumulates
/// contributions; its text and metadata come from the list that saw it
/// first. Ties keep first-appearance order.
pub fn reciprocal_rank_fusion(lists: Vec<RankedList>, k: f32) -> Vec<ScoredChunk> {
    let k = if k > 0.0 { k } else { DEFAULT_RRF_K };

    struct FusedEntry {
        chunk: ScoredChunk,
        arrival: usize,
    }

    let mut merged: HashMap<String, FusedEntry> = HashMap::new();
    let mut arrival = 0usize;

    for list in lists {
        let weight = if list.weight.is_finite() {
            list.weight.max(0.0)
        } else {
            0.0
        };

        for (rank, hit) in list.hits.into_iter().enumerate() {
            let contribution = weight / (k + rank as f32 + 1.0);

            match merged.entry(hit.id.clone()) {
                Entry::Occupied(mut entry) => {
                    entry.get_mut().chunk.score += contribution;
                }
                Entry::Vacant(slot) => {
                    let mut chunk = hit;
                    chunk.score = contribution;
                    chunk.stage = ScoreStage::Fused;
                    slot.insert(FusedEntry { chunk, arrival });
                    arrival += 1;
                }
            }
        }
    }

    let mut fused: Vec<FusedEntry> = merged.into_values().collect();
    fused.sort_by(|a, b| {
        b.chunk
            .score
            .partial_cmp(&a.chunk.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.arrival.cmp(&b.arrival))
    });

    fused.into_iter().map(|entry| entry.chunk).collect()
}
