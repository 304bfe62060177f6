use std::{collections::HashMap, sync::Arc, time::Duration};

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use common::error::AppError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{Metadata, MetadataValue};

/// Filter keys whose values are numeric ranges rather than enumerated
/// categories; they pass validation untouched.
const NUMERIC_FILTER_KEYS: [&str; 2] = ["min_amount", "max_amount"];

/// Enumerated filter values the extractor may choose from. Anything the LLM
/// returns outside these lists is dropped, never guessed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableFilters(pub HashMap<String, Vec<String>>);

impl Default for AvailableFilters {
    fn default() -> Self {
        let mut filters = HashMap::new();
        filters.insert(
            "region".to_owned(),
            ["Berlin", "Brandenburg", "Bayern", "Bundesweit", "Sachsen"]
                .map(str::to_owned)
                .to_vec(),
        );
        filters.insert(
            "funding_area".to_owned(),
            [
                "Bildung",
                "Digitalisierung",
                "MINT-Bildung",
                "Bildungsprojekte",
            ]
            .map(str::to_owned)
            .to_vec(),
        );
        filters.insert(
            "provider".to_owned(),
            [
                "BMBF",
                "Land Berlin",
                "Land Brandenburg",
                "Deutsche Telekom Stiftung",
            ]
            .map(str::to_owned)
            .to_vec(),
        );
        Self(filters)
    }
}

/// Result of self-querying: structured constraints pulled out of the free
/// text, plus the query with those constraints removed.
#[derive(Debug, Clone)]
pub struct FilterExtraction {
    pub filters: Metadata,
    pub cleaned_query: String,
}

impl FilterExtraction {
    fn passthrough(query: &str) -> Self {
        Self {
            filters: Metadata::new(),
            cleaned_query: query.to_owned(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct VariantsPayload {
    #[serde(default)]
    variants: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ExtractionPayload {
    #[serde(default)]
    filters: HashMap<String, Value>,
    #[serde(default)]
    cleaned_query: Option<String>,
}

/// LLM-backed query expansion and self-querying.
///
/// Both capabilities are best-effort: an unreachable endpoint, a timeout or
/// unparsable output falls back to the original query, so the pipeline
/// keeps functioning with a single variant and no filters.
pub struct QueryExpander {
    client: Arc<Client<OpenAIConfig>>,
    model: String,
    timeout: Duration,
}

impl QueryExpander {
    pub fn new(client: Arc<Client<OpenAIConfig>>, model: String, timeout: Duration) -> Self {
        Self {
            client,
            model,
            timeout,
        }
    }

    /// Paraphrase the query into up to `num_variants` alternatives that
    /// surface documents using different vocabulary for the same intent.
    /// The original query is always the first element.
    pub async fn expand_query(&self, query: &str, num_variants: usize) -> Vec<String> {
        if num_variants == 0 {
            return vec![query.to_owned()];
        }

        match self.try_expand(query, num_variants).await {
            Ok(mut variants) => {
                variants.truncate(num_variants);
                let mut queries = Vec::with_capacity(variants.len() + 1);
                queries.push(query.to_owned());
                for variant in variants {
                    let variant = variant.trim().to_owned();
                    if !variant.is_empty() && !queries.contains(&variant) {
                        queries.push(variant);
                    }
                }
                debug!(total = queries.len(), "Expanded query into variants");
                queries
            }
            Err(err) => {
                warn!(error = %err, "Query expansion failed; continuing with the original query");
                vec![query.to_owned()]
            }
        }
    }

    /// Self-querying: extract structured constraints embedded in the free
    /// text and return the query with them removed.
    pub async fn extract_metadata_filters(
        &self,
        query: &str,
        available: &AvailableFilters,
    ) -> FilterExtraction {
        match self.try_extract(query, available).await {
            Ok(extraction) => {
                debug!(
                    filters = extraction.filters.len(),
                    cleaned = %extraction.cleaned_query,
                    "Extracted metadata filters"
                );
                extraction
            }
            Err(err) => {
                warn!(error = %err, "Self-querying failed; continuing without filters");
                FilterExtraction::passthrough(query)
            }
        }
    }

    async fn try_expand(&self, query: &str, num_variants: usize) -> Result<Vec<String>, AppError> {
        let prompt = format!(
            r#"Generiere {num_variants} alternative Formulierungen für folgende Suchanfrage im Kontext von Schul-Fördermitteln.

ORIGINAL QUERY: "{query}"

REGELN:
1. Behalte die Kernbedeutung und Intention bei
2. Verwende Synonyme und verwandte Begriffe
3. Variiere zwischen spezifisch und allgemein
4. Verwende deutsche Fachbegriffe aus dem Bildungsbereich

OUTPUT FORMAT (JSON):
{{"variants": ["Variante 1", "Variante 2"]}}

WICHTIG: Gib NUR das JSON zurück, keine zusätzlichen Erklärungen."#
        );

        let content = self
            .complete(
                "Du bist ein Experte für Suchanfragen-Optimierung im deutschen Bildungsbereich.",
                prompt,
                0.7,
                500,
            )
            .await?;

        let payload: VariantsPayload = parse_embedded_json(&content)?;
        Ok(payload.variants)
    }

    async fn try_extract(
        &self,
        query: &str,
        available: &AvailableFilters,
    ) -> Result<FilterExtraction, AppError> {
        let available_json = serde_json::to_string_pretty(&available.0)
            .map_err(|e| AppError::InternalError(format!("rendering available filters: {e}")))?;

        let prompt = format!(
            r#"Analysiere folgende Suchanfrage und extrahiere Metadaten-Filter für eine Datenbank-Suche.

SUCHANFRAGE: "{query}"

VERFÜGBARE FILTER:
{available_json}

ZUSÄTZLICHE FILTER:
- min_amount: Mindestfördersumme (Zahl in Euro)
- max_amount: Höchstfördersumme (Zahl in Euro)

OUTPUT FORMAT (JSON):
{{"filters": {{"region": "Wert aus Liste oder null", "min_amount": 0}}, "cleaned_query": "Suchanfrage ohne die Metadaten-Informationen"}}

WICHTIG:
- Verwende NUR Werte aus den verfügbaren Listen
- Wenn kein passender Wert existiert, setze null
- Gib NUR das JSON zurück"#
        );

        let content = self
            .complete(
                "Du bist ein Experte für strukturierte Datenextraktion aus Suchanfragen.",
                prompt,
                0.3,
                300,
            )
            .await?;

        let payload: ExtractionPayload = parse_embedded_json(&content)?;
        let filters = validate_filters(payload.filters, available);
        let cleaned_query = payload
            .cleaned_query
            .map(|cleaned| cleaned.trim().to_owned())
            .filter(|cleaned| !cleaned.is_empty())
            .unwrap_or_else(|| query.to_owned());

        Ok(FilterExtraction {
            filters,
            cleaned_query,
        })
    }

    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: String,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, AppError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages([
                ChatCompletionRequestSystemMessage::from(system_prompt.to_owned()).into(),
                ChatCompletionRequestUserMessage::from(user_prompt).into(),
            ])
            .temperature(temperature)
            .max_tokens(max_tokens)
            .build()?;

        let response = tokio::time::timeout(self.timeout, self.client.chat().create(request))
            .await
            .map_err(|_| {
                AppError::ExternalService(format!(
                    "LLM call timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| AppError::ExternalService(e.to_string()))?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| AppError::LLMParsing("No content found in LLM response".into()))
    }
}

/// Locate the JSON object embedded in free text. Models wrap their output
/// in prose often enough that strict parsing of the whole message is a
/// losing game.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end >= start).then(|| &text[start..=end])
}

fn parse_embedded_json<T: for<'de> Deserialize<'de>>(content: &str) -> Result<T, AppError> {
    let json = extract_json_object(content)
        .ok_or_else(|| AppError::LLMParsing("No JSON object found in LLM response".into()))?;

    serde_json::from_str(json)
        .map_err(|e| AppError::LLMParsing(format!("Failed to parse LLM response: {e}")))
}

/// Keep only filters that resolve to a known value: enumerated keys must
/// match one of the caller-supplied options exactly, numeric range keys
/// pass through as numbers, everything else is dropped.
fn validate_filters(raw: HashMap<String, Value>, available: &AvailableFilters) -> Metadata {
    let mut filters = Metadata::new();

    for (key, value) in raw {
        if value.is_null() {
            continue;
        }

        if NUMERIC_FILTER_KEYS.contains(&key.as_str()) {
            if let Some(number) = value.as_f64() {
                filters.insert(key, MetadataValue::Number(number));
            }
            continue;
        }

        let Some(options) = available.0.get(&key) else {
            debug!(key = %key, "Dropping filter with unknown key");
            continue;
        };
        let Some(text) = value.as_str() else {
            continue;
        };
        if options.iter().any(|option| option == text) {
            filters.insert(key, MetadataValue::Text(text.to_owned()));
        } else {
            debug!(key = %key, value = %text, "Dropping filter value outside the known options");
        }
    }

    filters
}
