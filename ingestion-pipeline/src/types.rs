use retrieval_pipeline::Metadata;
use serde::{Deserialize, Serialize};

/// One cleaned funding-programme document as delivered by the corpus
/// source. Scraping and cleaning happen upstream; by the time a record
/// arrives here its text is plain prose and its metadata is flat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusDocument {
    pub document_id: String,
    pub title: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
}
