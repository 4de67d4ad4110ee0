//! OpenAI-compatible embeddings compat adapter (manifest kind
//! `openai-embeddings`).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{EmbeddingCompat, Embeddings};
use crate::error::{CoordResult, CoordinatorError};
use crate::logging::log_debug;
use crate::registry::EmbeddingProviderManifest;

/// Manifest kind served by this adapter.
pub const KIND: &str = "openai-embeddings";

#[derive(Debug, Clone, Deserialize)]
struct WireResponse {
    data: Vec<WireEmbedding>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireEmbedding {
    embedding: Vec<f32>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireUsage {
    #[serde(default)]
    total_tokens: u32,
}

/// Embeddings adapter for the `/v1/embeddings` wire shape.
#[derive(Debug)]
pub struct OpenAiEmbeddingCompat {
    client: reqwest::Client,
}

impl Default for OpenAiEmbeddingCompat {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenAiEmbeddingCompat {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EmbeddingCompat for OpenAiEmbeddingCompat {
    fn kind(&self) -> &'static str {
        KIND
    }

    async fn embed(
        &self,
        inputs: &[String],
        manifest: &EmbeddingProviderManifest,
        model_override: Option<&str>,
    ) -> CoordResult<Embeddings> {
        let model = model_override.unwrap_or(&manifest.model);
        let mut request = self
            .client
            .post(&manifest.endpoint.url)
            .json(&json!({ "model": model, "input": inputs }));
        for (name, value) in &manifest.endpoint.headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|err| {
            CoordinatorError::provider(&manifest.id, format!("embedding request failed: {err}"))
        })?;
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(CoordinatorError::provider_rate_limit(
                &manifest.id,
                "embedding endpoint returned 429",
            ));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoordinatorError::provider(
                &manifest.id,
                format!("embedding endpoint returned {status}: {body}"),
            ));
        }

        let parsed: WireResponse = response.json().await.map_err(|err| {
            CoordinatorError::provider(&manifest.id, format!("unparseable embedding response: {err}"))
        })?;
        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|e| e.embedding).collect();
        let dimensions = vectors.first().map(Vec::len).unwrap_or_default();

        if vectors.len() != inputs.len() {
            return Err(CoordinatorError::provider(
                &manifest.id,
                format!(
                    "embedding count mismatch: {} inputs, {} vectors",
                    inputs.len(),
                    vectors.len()
                ),
            ));
        }

        log_debug!(
            provider = %manifest.id,
            model = model,
            input_count = inputs.len(),
            dimensions = dimensions,
            "Embedded inputs"
        );

        Ok(Embeddings {
            vectors,
            model: parsed.model.unwrap_or_else(|| model.to_string()),
            dimensions,
            token_count: parsed.usage.map(|u| u.total_tokens),
        })
    }

    fn validate(&self, manifest: &EmbeddingProviderManifest) -> CoordResult<()> {
        if manifest.endpoint.url.is_empty() {
            return Err(CoordinatorError::manifest(format!(
                "embedding provider {} has no endpoint URL",
                manifest.id
            )));
        }
        Ok(())
    }
}
