use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    #[serde(default = "default_surrealdb_address")]
    pub surrealdb_address: String,
    #[serde(default = "default_surrealdb_credential")]
    pub surrealdb_username: String,
    #[serde(default = "default_surrealdb_credential")]
    pub surrealdb_password: String,
    #[serde(default = "default_surrealdb_namespace")]
    pub surrealdb_namespace: String,
    #[serde(default = "default_surrealdb_database")]
    pub surrealdb_database: String,
    /// Durable location for the sparse index blob and model caches.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// API key for the chat-completion endpoint used by query expansion.
    #[serde(default)]
    pub llm_api_key: Option<String>,
    /// The original deployment spoke to a DeepSeek-compatible endpoint; any
    /// OpenAI-compatible base URL works.
    #[serde(default = "default_llm_base_url")]
    pub llm_base_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
    /// "fastembed", "openai" or "hashed".
    #[serde(default = "default_embedding_backend")]
    pub embedding_backend: String,
    #[serde(default)]
    pub embedding_model: Option<String>,
    /// Only meaningful for the openai/hashed backends; fastembed models carry
    /// their own dimension.
    #[serde(default)]
    pub embedding_dimensions: Option<u32>,
    #[serde(default)]
    pub reranking_enabled: bool,
    #[serde(default)]
    pub reranking_pool_size: Option<usize>,
    #[serde(default)]
    pub fastembed_cache_dir: Option<String>,
    #[serde(default)]
    pub fastembed_show_download_progress: Option<bool>,
    #[serde(default)]
    pub fastembed_max_length: Option<usize>,
}

fn default_surrealdb_address() -> String {
    "memory".to_string()
}

fn default_surrealdb_credential() -> String {
    "root".to_string()
}

fn default_surrealdb_namespace() -> String {
    "foerderscout".to_string()
}

fn default_surrealdb_database() -> String {
    "retrieval".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_llm_base_url() -> String {
    "https://api.deepseek.com/v1".to_string()
}

fn default_llm_model() -> String {
    "deepseek-chat".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    30
}

fn default_embedding_backend() -> String {
    "fastembed".to_string()
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}
