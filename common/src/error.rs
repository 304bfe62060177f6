use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    /// Embedding or reranking model could not be loaded. Fatal for the
    /// embedder, feature-degrade for the reranker.
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("Validation error: {0}")]
    Validation(String),
    /// Index not built or not loadable. Sparse search degrades to empty
    /// results, a missing dense index fails the request.
    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),
    /// LLM call failed or timed out. Always absorbed at the component
    /// boundary with a documented fallback.
    #[error("External service error: {0}")]
    ExternalService(String),
    #[error("LLM parsing error: {0}")]
    LLMParsing(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Internal service error: {0}")]
    InternalError(String),
}
