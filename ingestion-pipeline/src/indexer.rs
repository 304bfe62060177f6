use std::path::PathBuf;

use common::{error::AppError, utils::embedding::EmbeddingProvider};
use retrieval_pipeline::{
    dense::DenseIndex,
    sparse::{SparseDocument, SparseIndex},
    Metadata,
};
use tracing::{info, instrument};

use crate::{chunker::DocumentChunker, types::CorpusDocument};

/// Counters from one indexing pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexReport {
    pub documents_indexed: usize,
    pub documents_skipped: usize,
    pub chunks_indexed: usize,
}

/// Builds both retrieval indices from a cleaned corpus.
///
/// One pass chunks every document, batch-embeds the chunk texts, upserts
/// them into the dense index and rebuilds the sparse index, persisting it
/// to the configured path. Chunk ids are stable, so re-running over a
/// changed corpus overwrites rather than duplicates.
pub struct CorpusIndexer<'a> {
    dense: &'a DenseIndex,
    embedder: &'a EmbeddingProvider,
    chunker: DocumentChunker,
    sparse_path: PathBuf,
}

impl<'a> CorpusIndexer<'a> {
    pub fn new(
        dense: &'a DenseIndex,
        embedder: &'a EmbeddingProvider,
        chunker: DocumentChunker,
        sparse_path: PathBuf,
    ) -> Self {
        Self {
            dense,
            embedder,
            chunker,
            sparse_path,
        }
    }

    /// Index the corpus into both stores and return the freshly built
    /// sparse index alongside the counters.
    #[instrument(skip_all, fields(documents = documents.len()))]
    pub async fn build(
        &self,
        documents: &[CorpusDocument],
    ) -> Result<(SparseIndex, IndexReport), AppError> {
        self.dense.ensure_index().await?;

        let mut report = IndexReport::default();
        let mut ids: Vec<String> = Vec::new();
        let mut texts: Vec<String> = Vec::new();
        let mut metadatas: Vec<Metadata> = Vec::new();

        for document in documents {
            let chunks = self.chunker.chunk_document(document)?;
            if chunks.is_empty() {
                report.documents_skipped += 1;
                continue;
            }

            report.documents_indexed += 1;
            for chunk in chunks {
                ids.push(chunk.id);
                texts.push(chunk.text);
                metadatas.push(chunk.metadata);
            }
        }

        report.chunks_indexed = ids.len();

        if !ids.is_empty() {
            let embeddings = self.embedder.embed_documents(&texts).await?;
            self.dense
                .upsert(&ids, &embeddings, &texts, &metadatas)
                .await?;
        }

        let sparse_documents: Vec<SparseDocument> = ids
            .iter()
            .zip(texts.iter())
            .map(|(id, text)| SparseDocument {
                id: id.clone(),
                text: text.clone(),
            })
            .collect();

        let mut sparse = SparseIndex::new();
        sparse.build(&sparse_documents);
        sparse.persist(&self.sparse_path)?;

        info!(
            documents_indexed = report.documents_indexed,
            documents_skipped = report.documents_skipped,
            chunks_indexed = report.chunks_indexed,
            "Corpus indexing pass complete"
        );

        Ok((sparse, report))
    }
}
