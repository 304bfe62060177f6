use common::{error::AppError, utils::embedding::EmbeddingProvider};
use tracing::debug;

use crate::{
    dense::DenseIndex,
    fusion::{reciprocal_rank_fusion, RankedList},
    sparse::SparseIndex,
    Metadata, ScoreStage, ScoredChunk,
};

/// Dense search typically carries more of the ranking signal than exact
/// keyword overlap; these defaults came over from the first deployment and
/// are tunable per request.
pub const DEFAULT_DENSE_WEIGHT: f32 = 0.6;
pub const DEFAULT_SPARSE_WEIGHT: f32 = 0.4;

/// Fusion and downstream reranking need a wider pool than the final result
/// count, so both indices are asked for four times as many candidates.
const CANDIDATE_MULTIPLIER: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct HybridWeights {
    pub dense: f32,
    pub sparse: f32,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            dense: DEFAULT_DENSE_WEIGHT,
            sparse: DEFAULT_SPARSE_WEIGHT,
        }
    }
}

/// One-query orchestration of dense + sparse retrieval with rank fusion.
/// Holds transient references only; the indices own their data.
pub struct HybridSearcher<'a> {
    dense: &'a DenseIndex,
    sparse: &'a SparseIndex,
    embedder: &'a EmbeddingProvider,
}

impl<'a> HybridSearcher<'a> {
    pub fn new(
        dense: &'a DenseIndex,
        sparse: &'a SparseIndex,
        embedder: &'a EmbeddingProvider,
    ) -> Self {
        Self {
            dense,
            sparse,
            embedder,
        }
    }

    /// Fetch candidates from both indices, fuse by reciprocal rank, return
    /// the best `top_k`.
    ///
    /// The dense call applies the metadata filter natively; sparse hits
    /// carry no metadata and are post-filtered against the dense index's
    /// stored copy. An unbuilt sparse index degrades to a dense-only
    /// fusion. Embedding failure is fatal to the request.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        weights: HybridWeights,
        rrf_k: f32,
        filter: Option<&Metadata>,
    ) -> Result<Vec<ScoredChunk>, AppError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let candidate_k = top_k * CANDIDATE_MULTIPLIER;

        let query_embedding = self.embedder.embed_query(query).await?;
        let dense_hits = self
            .dense
            .query(&query_embedding, candidate_k, filter)
            .await?;

        let sparse_hits = self.sparse.search(query, candidate_k);
        let sparse_chunks = self.attach_sparse_metadata(sparse_hits, filter).await?;

        debug!(
            dense_candidates = dense_hits.len(),
            sparse_candidates = sparse_chunks.len(),
            "Hybrid candidate counts"
        );

        let mut fused = reciprocal_rank_fusion(
            vec![
                RankedList::weighted(weights.dense, dense_hits),
                RankedList::weighted(weights.sparse, sparse_chunks),
            ],
            rrf_k,
        );
        fused.truncate(top_k);

        Ok(fused)
    }

    /// Look up stored metadata for sparse hits and drop hits that fail the
    /// filter. Hits unknown to the dense index are kept only when no filter
    /// applies, with empty metadata.
    async fn attach_sparse_metadata(
        &self,
        hits: Vec<crate::sparse::SparseHit>,
        filter: Option<&Metadata>,
    ) -> Result<Vec<ScoredChunk>, AppError> {
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = hits.iter().map(|hit| hit.id.clone()).collect();
        let mut metadata_by_id = self.dense.fetch_metadata(&ids).await?;

        let mut chunks = Vec::with_capacity(hits.len());
        for hit in hits {
            let metadata = metadata_by_id.remove(&hit.id).unwrap_or_default();

            if let Some(filter) = filter {
                if !metadata_matches(&metadata, filter) {
                    continue;
                }
            }

            chunks.push(ScoredChunk {
                id: hit.id,
                text: hit.text,
                metadata,
                score: hit.score,
                stage: ScoreStage::Lexical,
            });
        }

        Ok(chunks)
    }
}

/// Equality match on every filter entry; an empty filter matches anything.
pub fn metadata_matches(metadata: &Metadata, filter: &Metadata) -> bool {
    filter
        .iter()
        .all(|(key, value)| metadata.get(key) == Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dense::DenseIndex, sparse::SparseDocument, MetadataValue};
    use common::storage::db::SurrealDbClient;
    use common::utils::embedding::EmbeddingProvider;
    use std::sync::Arc;
    use uuid::Uuid;

    const DIM: usize = 128;

    async fn seeded_dense(embedder: &EmbeddingProvider, corpus: &[(&str, &str)]) -> DenseIndex {
        let db = SurrealDbClient::memory("hybrid_test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("failed to start in-memory surrealdb");
        let index = DenseIndex::new(Arc::new(db), DIM);
        index.ensure_index().await.expect("failed to define index");

        let ids: Vec<String> = corpus.iter().map(|(id, _)| (*id).to_owned()).collect();
        let texts: Vec<String> = corpus.iter().map(|(_, text)| (*text).to_owned()).collect();
        let embeddings = embedder
            .embed_documents(&texts)
            .await
            .expect("embedding corpus failed");
        let metadatas: Vec<Metadata> = corpus.iter().map(|_| Metadata::new()).collect();

        index
            .upsert(&ids, &embeddings, &texts, &metadatas)
            .await
            .expect("upsert failed");
        index
    }

    fn seeded_sparse(corpus: &[(&str, &str)]) -> SparseIndex {
        let documents: Vec<SparseDocument> = corpus
            .iter()
            .map(|(id, text)| SparseDocument {
                id: (*id).to_owned(),
                text: (*text).to_owned(),
            })
            .collect();
        let mut index = SparseIndex::new();
        index.build(&documents);
        index
    }

    const CORPUS: [(&str, &str); 3] = [
        ("doc_a_chunk_0", "Fördermittel für Tablets in Grundschulen"),
        ("doc_b_chunk_0", "BMBF Förderung für MINT-Projekte"),
        ("doc_c_chunk_0", "Digitalisierung im Bildungswesen"),
    ];

    #[tokio::test]
    async fn tablets_query_fuses_chunk_a_first() {
        let embedder = EmbeddingProvider::new_hashed(DIM);
        let dense = seeded_dense(&embedder, &CORPUS).await;
        let sparse = seeded_sparse(&CORPUS);
        let searcher = HybridSearcher::new(&dense, &sparse, &embedder);

        let hits = searcher
            .search(
                "Tablets für Schüler",
                3,
                HybridWeights::default(),
                60.0,
                None,
            )
            .await
            .expect("hybrid search failed");

        assert!(!hits.is_empty());
        assert_eq!(hits[0].id, "doc_a_chunk_0");
        assert_eq!(hits[0].stage, ScoreStage::Fused);
        for other in &hits[1..] {
            assert!(hits[0].score > other.score);
        }
    }

    #[tokio::test]
    async fn unbuilt_sparse_index_degrades_to_dense_only() {
        let embedder = EmbeddingProvider::new_hashed(DIM);
        let dense = seeded_dense(&embedder, &CORPUS).await;
        let sparse = SparseIndex::new();
        let searcher = HybridSearcher::new(&dense, &sparse, &embedder);

        let hits = searcher
            .search(
                "Tablets für Schüler",
                3,
                HybridWeights::default(),
                60.0,
                None,
            )
            .await
            .expect("hybrid search failed");

        assert!(!hits.is_empty());
        assert_eq!(hits[0].id, "doc_a_chunk_0");
        // Valid rank order: strictly non-increasing fused scores.
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn sparse_results_are_post_filtered_by_stored_metadata() {
        let embedder = EmbeddingProvider::new_hashed(DIM);

        let db = SurrealDbClient::memory("hybrid_test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("failed to start in-memory surrealdb");
        let dense = DenseIndex::new(Arc::new(db), DIM);
        dense.ensure_index().await.expect("failed to define index");

        let corpus = [
            ("berlin_chunk", "Tablets für Grundschulen in Berlin"),
            ("bayern_chunk", "Tablets für Grundschulen in Bayern"),
        ];
        let ids: Vec<String> = corpus.iter().map(|(id, _)| (*id).to_owned()).collect();
        let texts: Vec<String> = corpus.iter().map(|(_, text)| (*text).to_owned()).collect();
        let embeddings = embedder.embed_documents(&texts).await.expect("embed");
        let metadatas = vec![
            [("region".to_owned(), MetadataValue::from("Berlin"))]
                .into_iter()
                .collect::<Metadata>(),
            [("region".to_owned(), MetadataValue::from("Bayern"))]
                .into_iter()
                .collect::<Metadata>(),
        ];
        dense
            .upsert(&ids, &embeddings, &texts, &metadatas)
            .await
            .expect("upsert failed");

        let sparse = seeded_sparse(&corpus);
        let searcher = HybridSearcher::new(&dense, &sparse, &embedder);

        let filter: Metadata = [("region".to_owned(), MetadataValue::from("Berlin"))]
            .into_iter()
            .collect();
        let hits = searcher
            .search("Tablets", 5, HybridWeights::default(), 60.0, Some(&filter))
            .await
            .expect("hybrid search failed");

        assert!(!hits.is_empty());
        assert!(hits.iter().all(|hit| hit.id == "berlin_chunk"));
    }

    #[test]
    fn metadata_matching_requires_every_pair() {
        let metadata: Metadata = [
            ("region".to_owned(), MetadataValue::from("Berlin")),
            ("provider".to_owned(), MetadataValue::from("BMBF")),
        ]
        .into_iter()
        .collect();

        let matching: Metadata = [("region".to_owned(), MetadataValue::from("Berlin"))]
            .into_iter()
            .collect();
        let failing: Metadata = [
            ("region".to_owned(), MetadataValue::from("Berlin")),
            ("provider".to_owned(), MetadataValue::from("Telekom Stiftung")),
        ]
        .into_iter()
        .collect();

        assert!(metadata_matches(&metadata, &Metadata::new()));
        assert!(metadata_matches(&metadata, &matching));
        assert!(!metadata_matches(&metadata, &failing));
    }
}
