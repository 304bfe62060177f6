pub mod chunker;
pub mod indexer;
pub mod types;

pub use chunker::{ChunkingConfig, DocumentChunk, DocumentChunker};
pub use indexer::{CorpusIndexer, IndexReport};
pub use types::CorpusDocument;
