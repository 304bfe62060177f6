use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    str::FromStr,
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use async_openai::{types::CreateEmbeddingRequestArgs, Client};
use fastembed::{EmbeddingModel, ModelTrait, TextEmbedding, TextInitOptions};
use tokio::sync::Mutex;

use crate::{error::AppError, utils::config::AppConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingBackend {
    OpenAI,
    FastEmbed,
    Hashed,
}

impl Default for EmbeddingBackend {
    fn default() -> Self {
        Self::FastEmbed
    }
}

impl std::str::FromStr for EmbeddingBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "hashed" => Ok(Self::Hashed),
            "fastembed" | "fast-embed" | "fast" => Ok(Self::FastEmbed),
            other => Err(anyhow!(
                "unknown embedding backend '{other}'. Expected 'openai', 'hashed', or 'fastembed'."
            )),
        }
    }
}

/// One embedding model behind one contract. The backend is chosen once at
/// construction; callers never branch on which model is active. Index and
/// query vectors are only comparable within a single provider instance, so
/// whoever owns the pipeline's lifetime constructs this once and hands out
/// references.
#[derive(Clone)]
pub struct EmbeddingProvider {
    inner: EmbeddingInner,
}

#[derive(Clone)]
enum EmbeddingInner {
    OpenAI {
        client: Arc<Client<async_openai::config::OpenAIConfig>>,
        model: String,
        dimensions: u32,
    },
    Hashed {
        dimension: usize,
    },
    FastEmbed {
        model: Arc<Mutex<TextEmbedding>>,
        model_name: EmbeddingModel,
        dimension: usize,
    },
}

impl EmbeddingProvider {
    pub fn backend_label(&self) -> &'static str {
        match self.inner {
            EmbeddingInner::Hashed { .. } => "hashed",
            EmbeddingInner::FastEmbed { .. } => "fastembed",
            EmbeddingInner::OpenAI { .. } => "openai",
        }
    }

    pub fn dimension(&self) -> usize {
        match &self.inner {
            EmbeddingInner::Hashed { dimension } => *dimension,
            EmbeddingInner::FastEmbed { dimension, .. } => *dimension,
            EmbeddingInner::OpenAI { dimensions, .. } => *dimensions as usize,
        }
    }

    pub fn model_code(&self) -> Option<String> {
        match &self.inner {
            EmbeddingInner::FastEmbed { model_name, .. } => Some(model_name.to_string()),
            EmbeddingInner::OpenAI { model, .. } => Some(model.clone()),
            EmbeddingInner::Hashed { .. } => None,
        }
    }

    /// Embed a single query string with the same model as the documents.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let mut vectors = self.embed_documents(&[text.to_owned()]).await?;
        vectors
            .pop()
            .ok_or_else(|| AppError::InternalError("embedding backend returned no vector".into()))
    }

    /// Batch-embed documents, one vector per input in input order. Batching
    /// is a throughput detail; the result is identical to embedding each
    /// text on its own.
    pub async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        match &self.inner {
            EmbeddingInner::Hashed { dimension } => Ok(texts
                .iter()
                .map(|text| hashed_embedding(text, *dimension))
                .collect()),
            EmbeddingInner::FastEmbed { model, .. } => {
                let mut guard = model.lock().await;
                guard
                    .embed(texts.to_vec(), None)
                    .context("generating fastembed batch embeddings")
                    .map_err(AppError::Anyhow)
            }
            EmbeddingInner::OpenAI {
                client,
                model,
                dimensions,
            } => {
                let request = CreateEmbeddingRequestArgs::default()
                    .model(model.clone())
                    .input(texts.to_vec())
                    .dimensions(*dimensions)
                    .build()?;

                let response = client.embeddings().create(request).await?;

                let embeddings: Vec<Vec<f32>> = response
                    .data
                    .into_iter()
                    .map(|item| item.embedding)
                    .collect();

                if embeddings.len() != texts.len() {
                    return Err(AppError::InternalError(format!(
                        "embedding API returned {} vectors for {} inputs",
                        embeddings.len(),
                        texts.len()
                    )));
                }

                Ok(embeddings)
            }
        }
    }

    /// Construct the provider the config asks for. A backend that cannot be
    /// brought up is `ModelUnavailable`; there is no degraded mode, the
    /// dense index cannot function without embeddings.
    pub async fn from_config(
        config: &AppConfig,
        openai_client: Option<Arc<Client<async_openai::config::OpenAIConfig>>>,
    ) -> Result<Self, AppError> {
        let backend = EmbeddingBackend::from_str(&config.embedding_backend)
            .map_err(|e| AppError::ModelUnavailable(e.to_string()))?;

        match backend {
            EmbeddingBackend::FastEmbed => {
                Self::new_fastembed(config.embedding_model.clone())
                    .await
                    .map_err(|e| AppError::ModelUnavailable(e.to_string()))
            }
            EmbeddingBackend::OpenAI => {
                let client = openai_client.ok_or_else(|| {
                    AppError::ModelUnavailable(
                        "openai embedding backend requires an API client".to_string(),
                    )
                })?;
                let model = config
                    .embedding_model
                    .clone()
                    .unwrap_or_else(|| "text-embedding-3-small".to_string());
                let dimensions = config.embedding_dimensions.unwrap_or(1024);
                Ok(Self::new_openai(client, model, dimensions))
            }
            EmbeddingBackend::Hashed => {
                let dimension = config.embedding_dimensions.unwrap_or(256) as usize;
                Ok(Self::new_hashed(dimension))
            }
        }
    }

    pub fn new_openai(
        client: Arc<Client<async_openai::config::OpenAIConfig>>,
        model: String,
        dimensions: u32,
    ) -> Self {
        EmbeddingProvider {
            inner: EmbeddingInner::OpenAI {
                client,
                model,
                dimensions,
            },
        }
    }

    pub async fn new_fastembed(model_override: Option<String>) -> Result<Self> {
        let model_name = if let Some(code) = model_override {
            EmbeddingModel::from_str(&code).map_err(|err| anyhow!(err))?
        } else {
            EmbeddingModel::default()
        };

        let options = TextInitOptions::new(model_name.clone()).with_show_download_progress(true);
        let model_name_for_task = model_name.clone();
        let model_name_code = model_name.to_string();

        let (model, dimension) = tokio::task::spawn_blocking(move || -> Result<_> {
            let model =
                TextEmbedding::try_new(options).context("initialising FastEmbed text model")?;
            let info = EmbeddingModel::get_model_info(&model_name_for_task)
                .ok_or_else(|| anyhow!("FastEmbed model metadata missing for {model_name_code}"))?;
            Ok((model, info.dim))
        })
        .await
        .context("joining FastEmbed initialisation task")??;

        Ok(EmbeddingProvider {
            inner: EmbeddingInner::FastEmbed {
                model: Arc::new(Mutex::new(model)),
                model_name,
                dimension,
            },
        })
    }

    /// Deterministic token-bucket vectors. No model download, no network;
    /// this is the backend the test suites run on.
    pub fn new_hashed(dimension: usize) -> Self {
        EmbeddingProvider {
            inner: EmbeddingInner::Hashed {
                dimension: dimension.max(1),
            },
        }
    }
}

fn hashed_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let dim = dimension.max(1);
    let mut vector = vec![0.0f32; dim];
    if text.is_empty() {
        return vector;
    }

    let mut token_count = 0f32;
    for token in tokens(text) {
        token_count += 1.0;
        let idx = bucket(&token, dim);
        vector[idx] += 1.0;
    }

    if token_count == 0.0 {
        return vector;
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }

    vector
}

// Unicode-aware split; the corpus is German and umlauts must not break
// tokens apart.
fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_lowercase())
}

fn bucket(token: &str, dimension: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    (hasher.finish() as usize) % dimension
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashed_embedding_is_deterministic_and_batch_independent() {
        let provider = EmbeddingProvider::new_hashed(64);

        let single = provider
            .embed_query("Tablets für Grundschulen")
            .await
            .expect("query embedding failed");
        let batch = provider
            .embed_documents(&[
                "unrelated filler text".to_string(),
                "Tablets für Grundschulen".to_string(),
            ])
            .await
            .expect("batch embedding failed");

        assert_eq!(single.len(), 64);
        assert_eq!(batch[1], single);
    }

    #[tokio::test]
    async fn hashed_embedding_keeps_umlaut_tokens_together() {
        let provider = EmbeddingProvider::new_hashed(64);

        let a = provider.embed_query("Förderung").await.expect("embed");
        let b = provider.embed_query("förderung").await.expect("embed");

        // Case folding only; the umlaut does not split the token.
        assert_eq!(a, b);
        assert_eq!(a.iter().filter(|v| **v > 0.0).count(), 1);
    }

    #[tokio::test]
    async fn embed_documents_preserves_order() {
        let provider = EmbeddingProvider::new_hashed(32);
        let texts = vec!["alpha".to_string(), "beta".to_string()];

        let vectors = provider.embed_documents(&texts).await.expect("embed");
        let alpha = provider.embed_query("alpha").await.expect("embed");
        let beta = provider.embed_query("beta").await.expect("embed");

        assert_eq!(vectors, vec![alpha, beta]);
    }
}
