use common::error::AppError;
use retrieval_pipeline::{Metadata, MetadataValue};
use text_splitter::{ChunkConfig, TextSplitter};
use tracing::warn;

use crate::types::CorpusDocument;

/// Chunk sizing. Sizes are in characters; the overlap keeps sentences that
/// straddle a boundary retrievable from both sides.
#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap: usize,
    /// Documents shorter than this are skipped before chunking; scraper
    /// artifacts this small carry no retrievable content.
    pub min_document_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: 1000,
            overlap: 200,
            min_document_chars: 100,
        }
    }
}

/// One chunk ready for indexing. The id is stable across re-indexing runs
/// so upserts overwrite instead of duplicating, and it is shared verbatim
/// between the dense and sparse indices so fusion can join on it.
#[derive(Debug, Clone)]
pub struct DocumentChunk {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
}

#[derive(Debug)]
pub struct DocumentChunker {
    config: ChunkingConfig,
}

impl DocumentChunker {
    pub fn new(config: ChunkingConfig) -> Result<Self, AppError> {
        if config.max_chars == 0 {
            return Err(AppError::Validation(
                "chunk size must be greater than zero".to_owned(),
            ));
        }
        if config.overlap >= config.max_chars {
            return Err(AppError::Validation(format!(
                "chunk overlap {} must be smaller than the chunk size {}",
                config.overlap, config.max_chars
            )));
        }
        Ok(Self { config })
    }

    /// Split a document into overlapping chunks with ids of the form
    /// `{document_id}_chunk_{index}`. Documents below the minimum length
    /// are skipped (empty result), not rejected.
    pub fn chunk_document(&self, document: &CorpusDocument) -> Result<Vec<DocumentChunk>, AppError> {
        if document.document_id.is_empty() {
            return Err(AppError::Validation(
                "document is missing a document_id".to_owned(),
            ));
        }

        let text = document.text.trim();
        if text.chars().count() < self.config.min_document_chars {
            warn!(
                document_id = %document.document_id,
                chars = text.chars().count(),
                "Skipping document below the minimum length"
            );
            return Ok(Vec::new());
        }

        let chunk_config = ChunkConfig::new(self.config.max_chars)
            .with_overlap(self.config.overlap)
            .map_err(|e| AppError::Validation(format!("invalid chunk configuration: {e}")))?;
        let splitter = TextSplitter::new(chunk_config);

        let mut metadata = document.metadata.clone();
        metadata.insert(
            "document_id".to_owned(),
            MetadataValue::from(document.document_id.as_str()),
        );
        metadata.insert(
            "title".to_owned(),
            MetadataValue::from(document.title.as_str()),
        );

        Ok(splitter
            .chunks(text)
            .enumerate()
            .map(|(index, chunk)| DocumentChunk {
                id: format!("{}_chunk_{}", document.document_id, index),
                text: chunk.to_owned(),
                metadata: metadata.clone(),
            })
            .collect())
    }
}
