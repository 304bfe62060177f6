use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use common::{
    storage::db::SurrealDbClient,
    utils::{config::get_config, embedding::EmbeddingProvider},
};
use ingestion_pipeline::{ChunkingConfig, CorpusDocument, CorpusIndexer, DocumentChunker};
use retrieval_pipeline::{
    dense::DenseIndex,
    expansion::{AvailableFilters, QueryExpander},
    reranking::RerankerPool,
    retrieve_chunks,
    sparse::SparseIndex,
    Metadata, MetadataValue, PipelineDeps, RetrievalConfig, RetrievalStrategy,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(
    name = "foerderscout",
    about = "Hybrid retrieval over scraped funding-programme documents"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the dense and sparse indices from a JSON-Lines corpus file.
    Index {
        /// Path to a file with one CorpusDocument JSON object per line.
        #[arg(long)]
        corpus: PathBuf,
    },
    /// Run the retrieval pipeline for one query and print ranked chunks.
    Query {
        query: String,
        #[arg(long, default_value_t = 5)]
        top_k: usize,
        #[arg(long, value_enum, default_value_t = RetrievalStrategy::Advanced)]
        strategy: RetrievalStrategy,
        /// Pin a metadata filter ahead of self-querying, e.g. --filter region=Berlin
        #[arg(long = "filter", value_parser = parse_filter)]
        filters: Vec<(String, String)>,
    },
    /// Print index and model diagnostics.
    Stats,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );

    let openai_client = config.llm_api_key.as_ref().map(|api_key| {
        Arc::new(async_openai::Client::with_config(
            async_openai::config::OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base(&config.llm_base_url),
        ))
    });

    let embedder = Arc::new(EmbeddingProvider::from_config(&config, openai_client.clone()).await?);
    info!(
        backend = embedder.backend_label(),
        dimension = embedder.dimension(),
        model = ?embedder.model_code(),
        "Embedding provider initialized"
    );

    let dense = DenseIndex::new(Arc::clone(&db), embedder.dimension());
    let sparse_path = PathBuf::from(&config.data_dir).join("bm25_index.json");

    match cli.command {
        Commands::Index { corpus } => {
            let documents = read_corpus(&corpus)?;
            let chunker = DocumentChunker::new(ChunkingConfig::default())?;
            let indexer = CorpusIndexer::new(&dense, &embedder, chunker, sparse_path);

            let (_, report) = indexer.build(&documents).await?;
            println!(
                "{}",
                serde_json::json!({
                    "documents_indexed": report.documents_indexed,
                    "documents_skipped": report.documents_skipped,
                    "chunks_indexed": report.chunks_indexed,
                })
            );
        }
        Commands::Query {
            query,
            top_k,
            strategy,
            filters,
        } => {
            let sparse = load_sparse(&sparse_path);

            let expander = openai_client.as_ref().map(|client| {
                QueryExpander::new(
                    Arc::clone(client),
                    config.llm_model.clone(),
                    Duration::from_secs(config.llm_timeout_secs),
                )
            });
            if expander.is_none() {
                warn!("No LLM API key configured; self-querying and query expansion are off");
            }

            let reranker_pool = RerankerPool::maybe_from_config(&config);
            let reranker = match &reranker_pool {
                Some(pool) => Some(pool.checkout().await?),
                None => None,
            };

            let available_filters = AvailableFilters::default();
            let retrieval_config = RetrievalConfig::with_strategy(strategy)
                .with_top_k(top_k)
                .with_base_filters(cli_filters(filters));

            let deps = PipelineDeps {
                dense: &dense,
                sparse: &sparse,
                embedder: &embedder,
                expander: expander.as_ref(),
                available_filters: &available_filters,
                reranker,
            };

            let outcome = retrieve_chunks(deps, &query, retrieval_config).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "query": query,
                    "strategy": strategy.to_string(),
                    "quality": outcome.quality,
                    "results": outcome.chunks,
                }))?
            );
        }
        Commands::Stats => {
            let sparse = load_sparse(&sparse_path);
            println!(
                "{}",
                serde_json::json!({
                    "dense_chunks": dense.count().await?,
                    "sparse_documents": sparse.len(),
                    "embedding_backend": embedder.backend_label(),
                    "embedding_model": embedder.model_code(),
                    "embedding_dimension": embedder.dimension(),
                })
            );
        }
    }

    Ok(())
}

fn read_corpus(path: &PathBuf) -> Result<Vec<CorpusDocument>, Box<dyn std::error::Error>> {
    let raw = fs::read_to_string(path)?;
    let mut documents = Vec::new();
    for (line_number, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let document: CorpusDocument = serde_json::from_str(line)
            .map_err(|e| format!("corpus line {}: {e}", line_number + 1))?;
        documents.push(document);
    }
    Ok(documents)
}

fn load_sparse(path: &std::path::Path) -> SparseIndex {
    match SparseIndex::load(path) {
        Ok(index) => index,
        Err(err) => {
            warn!(error = %err, "Sparse index unavailable; continuing dense-only");
            SparseIndex::new()
        }
    }
}

fn cli_filters(pairs: Vec<(String, String)>) -> Metadata {
    pairs
        .into_iter()
        .map(|(key, value)| {
            let value = value
                .parse::<f64>()
                .map_or_else(|_| MetadataValue::Text(value), MetadataValue::Number);
            (key, value)
        })
        .collect()
}

fn parse_filter(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .ok_or_else(|| format!("filter '{raw}' must have the form key=value"))
}
