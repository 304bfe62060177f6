use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use common::error::AppError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Okapi BM25 parameters, matching the defaults of the `rank_bm25` library
/// the first deployment of this system indexed with.
pub const BM25_K1: f32 = 1.5;
pub const BM25_B: f32 = 0.75;

/// Input record for [`SparseIndex::build`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparseDocument {
    pub id: String,
    pub text: String,
}

/// One lexical match. Carries no metadata; the hybrid searcher looks that
/// up from the dense index when it needs to post-filter.
#[derive(Debug, Clone)]
pub struct SparseHit {
    pub id: String,
    pub text: String,
    pub score: f32,
}

/// In-memory BM25 index over the chunk corpus.
///
/// Built in one pass, persisted as an opaque JSON blob (ids, texts and the
/// term statistics) so indexing and querying can run as separate processes.
/// An unbuilt index answers every search with an empty list; sparse
/// retrieval is an enhancement the pipeline degrades around, never a hard
/// dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparseIndex {
    k1: f32,
    b: f32,
    ids: Vec<String>,
    texts: Vec<String>,
    term_frequencies: Vec<HashMap<String, u32>>,
    doc_lengths: Vec<u32>,
    avg_doc_length: f32,
    document_frequencies: HashMap<String, u32>,
}

impl Default for SparseIndex {
    fn default() -> Self {
        Self {
            k1: BM25_K1,
            b: BM25_B,
            ids: Vec::new(),
            texts: Vec::new(),
            term_frequencies: Vec::new(),
            doc_lengths: Vec::new(),
            avg_doc_length: 0.0,
            document_frequencies: HashMap::new(),
        }
    }
}

impl SparseIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_built(&self) -> bool {
        !self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Tokenize every document and compute the corpus statistics. Replaces
    /// any previously built state.
    pub fn build(&mut self, documents: &[SparseDocument]) {
        let mut ids = Vec::with_capacity(documents.len());
        let mut texts = Vec::with_capacity(documents.len());
        let mut term_frequencies = Vec::with_capacity(documents.len());
        let mut doc_lengths = Vec::with_capacity(documents.len());
        let mut document_frequencies: HashMap<String, u32> = HashMap::new();

        for document in documents {
            let tokens = tokenize(&document.text);
            let mut frequencies: HashMap<String, u32> = HashMap::new();
            for token in &tokens {
                *frequencies.entry(token.clone()).or_insert(0) += 1;
            }
            for term in frequencies.keys() {
                *document_frequencies.entry(term.clone()).or_insert(0) += 1;
            }

            ids.push(document.id.clone());
            texts.push(document.text.clone());
            doc_lengths.push(tokens.len() as u32);
            term_frequencies.push(frequencies);
        }

        let total_len: u64 = doc_lengths.iter().map(|len| u64::from(*len)).sum();
        let avg_doc_length = if doc_lengths.is_empty() {
            0.0
        } else {
            total_len as f32 / doc_lengths.len() as f32
        };

        self.ids = ids;
        self.texts = texts;
        self.term_frequencies = term_frequencies;
        self.doc_lengths = doc_lengths;
        self.avg_doc_length = avg_doc_length;
        self.document_frequencies = document_frequencies;

        info!(documents = self.ids.len(), "Built sparse BM25 index");
    }

    /// Score every document against the query and return the `top_k` best.
    ///
    /// Documents sharing no term with the query are excluded regardless of
    /// available ranking slots. Ties keep the stable build order. An
    /// unbuilt index returns an empty list.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<SparseHit> {
        if !self.is_built() || top_k == 0 {
            return Vec::new();
        }

        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return Vec::new();
        }

        let corpus_size = self.ids.len() as f32;
        let mut scored: Vec<(usize, f32)> = Vec::new();

        for (index, frequencies) in self.term_frequencies.iter().enumerate() {
            let doc_length = self.doc_lengths[index] as f32;
            let norm = self.k1 * (1.0 - self.b + self.b * doc_length / self.avg_doc_length.max(1.0));

            let mut score = 0.0f32;
            for token in &query_tokens {
                let Some(tf) = frequencies.get(token).copied() else {
                    continue;
                };
                let df = self
                    .document_frequencies
                    .get(token)
                    .copied()
                    .unwrap_or(0) as f32;
                let idf = (1.0 + (corpus_size - df + 0.5) / (df + 0.5)).ln();
                let tf = tf as f32;
                score += idf * tf * (self.k1 + 1.0) / (tf + norm);
            }

            if score > 0.0 {
                scored.push((index, score));
            }
        }

        // Stable sort: equal scores keep corpus order.
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);

        scored
            .into_iter()
            .map(|(index, score)| SparseHit {
                id: self.ids[index].clone(),
                text: self.texts[index].clone(),
                score,
            })
            .collect()
    }

    /// Serialize the whole structure to `path`, atomically: write a sibling
    /// temp file, then rename over the destination so concurrent readers
    /// see either the old or the new blob, never a partial write.
    pub fn persist(&self, path: &Path) -> Result<(), AppError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let blob = serde_json::to_vec(self)
            .map_err(|e| AppError::InternalError(format!("serializing sparse index: {e}")))?;

        let tmp_path = temp_sibling(path);
        fs::write(&tmp_path, blob)?;
        fs::rename(&tmp_path, path)?;

        debug!(path = %path.display(), documents = self.len(), "Persisted sparse index");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, AppError> {
        if !path.exists() {
            return Err(AppError::IndexUnavailable(format!(
                "sparse index blob not found at {}",
                path.display()
            )));
        }

        let blob = fs::read(path)?;
        let index: Self = serde_json::from_slice(&blob).map_err(|e| {
            AppError::IndexUnavailable(format!(
                "sparse index blob at {} is unreadable: {e}",
                path.display()
            ))
        })?;

        debug!(path = %path.display(), documents = index.len(), "Loaded sparse index");
        Ok(index)
    }
}

// Case-folded whitespace split; mirrors the build-side tokenization so
// query and corpus terms always agree.
fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|token| token.to_lowercase())
        .collect()
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sparse_index".to_owned());
    name.push_str(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, text: &str) -> SparseDocument {
        SparseDocument {
            id: id.to_owned(),
            text: text.to_owned(),
        }
    }

    fn build_index(docs: &[SparseDocument]) -> SparseIndex {
        let mut index = SparseIndex::new();
        index.build(docs);
        index
    }

    #[test]
    fn exact_token_match_ranks_first() {
        let index = build_index(&[
            doc("a", "Fördermittel für Tablets in Grundschulen"),
            doc("b", "BMBF Förderung für MINT-Projekte"),
            doc("c", "Digitalisierung im Bildungswesen"),
        ]);

        let hits = index.search("Tablets für Schüler", 3);

        assert!(!hits.is_empty());
        assert_eq!(hits[0].id, "a");
        // c shares no token with the query and must not appear at all.
        assert!(hits.iter().all(|hit| hit.id != "c"));
    }

    #[test]
    fn zero_overlap_query_returns_nothing() {
        let index = build_index(&[
            doc("a", "Fördermittel für Tablets"),
            doc("b", "Digitalisierung im Bildungswesen"),
        ]);

        assert!(index.search("quantum chromodynamics", 10).is_empty());
    }

    #[test]
    fn unbuilt_index_returns_empty_not_error() {
        let index = SparseIndex::new();
        assert!(index.search("anything", 5).is_empty());
        assert!(!index.is_built());
    }

    #[test]
    fn ties_keep_corpus_order() {
        let index = build_index(&[
            doc("first", "gemeinsames wort"),
            doc("second", "gemeinsames wort"),
        ]);

        let hits = index.search("gemeinsames", 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "first");
        assert_eq!(hits[1].id, "second");
    }

    #[test]
    fn top_k_truncates() {
        let index = build_index(&[
            doc("a", "förderung schule"),
            doc("b", "förderung schule schule"),
            doc("c", "förderung"),
        ]);

        assert_eq!(index.search("förderung", 2).len(), 2);
    }

    #[test]
    fn rebuild_replaces_previous_corpus() {
        let mut index = build_index(&[doc("old", "alte förderung")]);
        index.build(&[doc("new", "neue förderung")]);

        let hits = index.search("förderung", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "new");
    }

    #[test]
    fn persist_and_load_round_trip_preserves_scores() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bm25_index.json");

        let index = build_index(&[
            doc("a", "Fördermittel für Tablets in Grundschulen"),
            doc("b", "BMBF Förderung für MINT-Projekte"),
        ]);
        index.persist(&path).expect("persist failed");

        let restored = SparseIndex::load(&path).expect("load failed");
        assert_eq!(restored.len(), index.len());

        let before = index.search("Tablets", 5);
        let after = restored.search("Tablets", 5);
        assert_eq!(before.len(), after.len());
        for (a, b) in before.iter().zip(after.iter()) {
            assert_eq!(a.id, b.id);
            assert!((a.score - b.score).abs() < f32::EPSILON);
        }
    }

    #[test]
    fn load_missing_blob_is_index_unavailable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = SparseIndex::load(&dir.path().join("missing.json"))
            .expect_err("expected load failure");
        assert!(matches!(err, AppError::IndexUnavailable(_)));
    }
}
