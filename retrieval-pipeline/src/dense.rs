use std::{collections::HashMap, sync::Arc};

use common::{
    error::AppError,
    storage::{db::SurrealDbClient, ids::deserialize_flexible_id},
};
use serde::Deserialize;
use surrealdb::sql::Thing;
use tracing::debug;

use crate::{Metadata, ScoreStage, ScoredChunk};

pub const CHUNK_TABLE: &str = "funding_chunk";
const HNSW_INDEX: &str = "idx_embedding_funding_chunk";
const KNN_EF: usize = 40;

/// Surreal-backed vector store over the chunk corpus.
///
/// Owns a durable copy of chunk text and metadata alongside the embedding,
/// so it stays queryable independently of the sparse index. Chunks are
/// keyed by their stable id; re-indexing a document overwrites its chunks
/// via UPSERT, there is no in-place mutation.
pub struct DenseIndex {
    db: Arc<SurrealDbClient>,
    dimension: usize,
}

#[derive(Debug, Deserialize)]
struct ChunkRow {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    id: String,
    text: String,
    #[serde(default)]
    metadata: Metadata,
    distance: f32,
}

#[derive(Debug, Deserialize)]
struct MetadataRow {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    id: String,
    #[serde(default)]
    metadata: Metadata,
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: usize,
}

impl DenseIndex {
    pub fn new(db: Arc<SurrealDbClient>, dimension: usize) -> Self {
        Self { db, dimension }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// (Re)create the HNSW index for the configured embedding dimension.
    /// Surreal requires the definition to be recreated when the dimension
    /// changes, so this always drops and redefines.
    pub async fn ensure_index(&self) -> Result<(), AppError> {
        let query = format!(
            "BEGIN TRANSACTION;
             REMOVE INDEX IF EXISTS {HNSW_INDEX} ON TABLE {CHUNK_TABLE};
             DEFINE INDEX {HNSW_INDEX} ON TABLE {CHUNK_TABLE} FIELDS embedding HNSW DIMENSION {dimension};
             COMMIT TRANSACTION;",
            dimension = self.dimension,
        );

        let res = self.db.client.query(query).await.map_err(AppError::Database)?;
        res.check().map_err(AppError::Database)?;

        Ok(())
    }

    /// Insert or overwrite chunks by id. All four sequences must line up;
    /// mismatches are rejected before anything touches the table.
    pub async fn upsert(
        &self,
        ids: &[String],
        embeddings: &[Vec<f32>],
        texts: &[String],
        metadatas: &[Metadata],
    ) -> Result<(), AppError> {
        if ids.len() != embeddings.len() || ids.len() != texts.len() || ids.len() != metadatas.len()
        {
            return Err(AppError::Validation(format!(
                "upsert sequences must have equal length (ids: {}, embeddings: {}, texts: {}, metadatas: {})",
                ids.len(),
                embeddings.len(),
                texts.len(),
                metadatas.len()
            )));
        }

        for (index, id) in ids.iter().enumerate() {
            if id.is_empty() {
                return Err(AppError::Validation(format!(
                    "chunk id at position {index} is empty"
                )));
            }
            if embeddings[index].len() != self.dimension {
                return Err(AppError::Validation(format!(
                    "embedding for chunk '{id}' has dimension {}, index expects {}",
                    embeddings[index].len(),
                    self.dimension
                )));
            }
        }

        for (((id, embedding), text), metadata) in ids
            .iter()
            .zip(embeddings.iter())
            .zip(texts.iter())
            .zip(metadatas.iter())
        {
            let response = self
                .db
                .client
                .query(
                    "UPSERT type::thing($table, $id) \
                     CONTENT { text: $text, embedding: $embedding, metadata: $metadata } \
                     RETURN NONE",
                )
                .bind(("table", CHUNK_TABLE))
                .bind(("id", id.clone()))
                .bind(("text", text.clone()))
                .bind(("embedding", embedding.clone()))
                .bind(("metadata", metadata.clone()))
                .await
                .map_err(AppError::Database)?;
            response.check().map_err(AppError::Database)?;
        }

        debug!(chunks = ids.len(), "Upserted chunks into dense index");
        Ok(())
    }

    /// Nearest chunks by vector distance, restricted to chunks matching
    /// every key/value pair of `filter`. Querying an empty index returns an
    /// empty list.
    pub async fn query(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: Option<&Metadata>,
    ) -> Result<Vec<ScoredChunk>, AppError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        if embedding.len() != self.dimension {
            return Err(AppError::Validation(format!(
                "query embedding has dimension {}, index expects {}",
                embedding.len(),
                self.dimension
            )));
        }

        // The metadata clauses apply after the KNN scan, so a filtered
        // query widens the scan to keep up to top_k survivors.
        let knn_k = match filter {
            Some(filter) if !filter.is_empty() => top_k * 4,
            _ => top_k,
        };

        let mut filter_clause = String::new();
        let mut bindings: Vec<(String, crate::MetadataValue)> = Vec::new();
        if let Some(filter) = filter {
            let mut keys: Vec<&String> = filter.keys().collect();
            keys.sort();
            for (position, key) in keys.into_iter().enumerate() {
                validate_filter_key(key)?;
                let placeholder = format!("filter_{position}");
                filter_clause.push_str(&format!(" AND metadata.{key} = ${placeholder}"));
                bindings.push((placeholder, filter[key].clone()));
            }
        }

        let sql = format!(
            "SELECT id, text, metadata, vector::distance::knn() AS distance \
             FROM {CHUNK_TABLE} \
             WHERE embedding <|{knn_k},{KNN_EF}|> {embedding:?}{filter_clause} \
             ORDER BY distance \
             LIMIT {top_k}"
        );

        let mut query = self.db.client.query(sql);
        for (placeholder, value) in bindings {
            query = query.bind((placeholder, value));
        }

        let mut response = query.await.map_err(AppError::Database)?;
        let rows: Vec<ChunkRow> = response.take(0).map_err(AppError::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| ScoredChunk {
                id: row.id,
                text: row.text,
                metadata: row.metadata,
                score: distance_to_similarity(row.distance),
                stage: ScoreStage::Similarity,
            })
            .collect())
    }

    /// Total chunks currently stored. Diagnostics, not ranking.
    pub async fn count(&self) -> Result<usize, AppError> {
        let mut response = self
            .db
            .client
            .query(format!("SELECT count() AS count FROM {CHUNK_TABLE} GROUP ALL"))
            .await
            .map_err(AppError::Database)?;

        let rows: Vec<CountRow> = response.take(0).map_err(AppError::Database)?;
        Ok(rows.first().map_or(0, |row| row.count))
    }

    /// Metadata lookup by id, used to post-filter sparse results that carry
    /// no metadata of their own.
    pub async fn fetch_metadata(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, Metadata>, AppError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let things: Vec<Thing> = ids
            .iter()
            .map(|id| Thing::from((CHUNK_TABLE, id.as_str())))
            .collect();

        let mut response = self
            .db
            .client
            .query("SELECT id, metadata FROM type::table($table) WHERE id IN $things")
            .bind(("table", CHUNK_TABLE))
            .bind(("things", things))
            .await
            .map_err(AppError::Database)?;

        let rows: Vec<MetadataRow> = response.take(0).map_err(AppError::Database)?;
        Ok(rows
            .into_iter()
            .map(|row| (row.id, row.metadata))
            .collect())
    }
}

/// Map a KNN distance to a similarity in [0, 1]; defined for any metric.
pub fn distance_to_similarity(distance: f32) -> f32 {
    if !distance.is_finite() {
        return 0.0;
    }
    (1.0 / (1.0 + distance.max(0.0))).clamp(0.0, 1.0)
}

fn validate_filter_key(key: &str) -> Result<(), AppError> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "metadata filter key '{key}' is not a plain identifier"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MetadataValue;
    use uuid::Uuid;

    async fn setup_index(dimension: usize) -> DenseIndex {
        let db = SurrealDbClient::memory("dense_test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("failed to start in-memory surrealdb");
        let index = DenseIndex::new(Arc::new(db), dimension);
        index.ensure_index().await.expect("failed to define index");
        index
    }

    fn meta(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), MetadataValue::from(*v)))
            .collect()
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let index = setup_index(3).await;

        let ids = vec!["doc_1_chunk_0".to_owned()];
        let embeddings = vec![vec![0.9, 0.1, 0.0]];
        let texts = vec!["Fördermittel für Tablets".to_owned()];
        let metadatas = vec![meta(&[("region", "Berlin")])];

        index
            .upsert(&ids, &embeddings, &texts, &metadatas)
            .await
            .expect("first upsert failed");
        index
            .upsert(&ids, &embeddings, &texts, &metadatas)
            .await
            .expect("second upsert failed");

        assert_eq!(index.count().await.expect("count failed"), 1);

        let hits = index
            .query(&[0.9, 0.1, 0.0], 5, None)
            .await
            .expect("query failed");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "doc_1_chunk_0");
        assert_eq!(hits[0].text, "Fördermittel für Tablets");
    }

    #[tokio::test]
    async fn mismatched_sequence_lengths_are_rejected() {
        let index = setup_index(3).await;

        let err = index
            .upsert(
                &["a".to_owned(), "b".to_owned()],
                &[vec![0.0, 0.0, 1.0]],
                &["only one text".to_owned()],
                &[Metadata::new()],
            )
            .await
            .expect_err("expected validation failure");

        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(index.count().await.expect("count failed"), 0);
    }

    #[tokio::test]
    async fn empty_id_is_rejected() {
        let index = setup_index(3).await;

        let err = index
            .upsert(
                &[String::new()],
                &[vec![0.0, 0.0, 1.0]],
                &["text".to_owned()],
                &[Metadata::new()],
            )
            .await
            .expect_err("expected validation failure");

        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn metadata_filter_never_leaks_non_matching_chunks() {
        let index = setup_index(3).await;

        index
            .upsert(
                &["berlin_chunk".to_owned(), "bayern_chunk".to_owned()],
                &[vec![1.0, 0.0, 0.0], vec![0.99, 0.01, 0.0]],
                &["Tablets Berlin".to_owned(), "Tablets Bayern".to_owned()],
                &[meta(&[("region", "Berlin")]), meta(&[("region", "Bayern")])],
            )
            .await
            .expect("upsert failed");

        let filter = meta(&[("region", "Berlin")]);
        let hits = index
            .query(&[1.0, 0.0, 0.0], 5, Some(&filter))
            .await
            .expect("query failed");

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "berlin_chunk");
        assert_eq!(
            hits[0].metadata.get("region"),
            Some(&MetadataValue::from("Berlin"))
        );
    }

    #[tokio::test]
    async fn querying_empty_index_returns_empty() {
        let index = setup_index(3).await;

        let hits = index
            .query(&[1.0, 0.0, 0.0], 5, None)
            .await
            .expect("query failed");
        assert!(hits.is_empty());
        assert_eq!(index.count().await.expect("count failed"), 0);
    }

    #[tokio::test]
    async fn scores_are_similarities_ordered_descending() {
        let index = setup_index(3).await;

        index
            .upsert(
                &["near".to_owned(), "far".to_owned()],
                &[vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]],
                &["near text".to_owned(), "far text".to_owned()],
                &[Metadata::new(), Metadata::new()],
            )
            .await
            .expect("upsert failed");

        let hits = index
            .query(&[1.0, 0.0, 0.0], 2, None)
            .await
            .expect("query failed");

        assert_eq!(hits[0].id, "near");
        assert!(hits[0].score > hits[1].score);
        assert!(hits.iter().all(|hit| (0.0..=1.0).contains(&hit.score)));
    }

    #[test]
    fn distance_mapping_is_monotone_and_clamped() {
        assert!(distance_to_similarity(0.0) > distance_to_similarity(0.5));
        assert!(distance_to_similarity(0.5) > distance_to_similarity(2.0));
        assert_eq!(distance_to_similarity(f32::NAN), 0.0);
        assert_eq!(distance_to_similarity(f32::INFINITY), 0.0);
        assert!((0.0..=1.0).contains(&distance_to_similarity(-3.0)));
    }
}
