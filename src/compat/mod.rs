//! Compat adapter capability set.
//!
//! A compat adapter translates between the unified model and one concrete
//! upstream protocol. All provider, model, and endpoint knowledge lives in
//! the adapters and the manifests that select them; core code references no
//! provider-specific strings.
//!
//! Adapters are compiled in and selected by a manifest's `kind` string
//! through [`CompatRegistry`]. LLM and embedding adapters are stateless and
//! shared one-per-kind per registry; vector-store adapters hold connection
//! state, so every call site gets an independently constructed instance and
//! `close` on one never disturbs another.

pub mod anthropic;
pub mod embedding;
pub mod openai;
pub mod qdrant;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::error::{CoordResult, CoordinatorError};
use crate::registry::EmbeddingProviderManifest;
use crate::settings::ProviderSettings;
use crate::spec::{FinishReason, Message, Reasoning, Tool, ToolChoice, ToolEvent, UnifiedResponse, Usage};
use crate::vector::{VectorPoint, VectorQueryResult};

/// What one provider stream chunk contributed, in unified vocabulary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamChunk {
    /// Text fragment
    pub text: Option<String>,
    /// Tool-call lifecycle events (start / args-delta / end)
    pub tool_events: Vec<ToolEvent>,
    /// The provider signaled tool-call completion without paired end events
    pub finished_with_tool_calls: bool,
    /// Normalized stop reason, when the chunk carries one
    pub finish_reason: Option<FinishReason>,
    /// Usage snapshot (last writer wins within a stream)
    pub usage: Option<Usage>,
    /// Reasoning delta
    pub reasoning: Option<Reasoning>,
    /// The stream is over (terminator frame or terminal message)
    pub terminal: bool,
}

/// Per-stream chunk parser.
///
/// Providers interleave partial tool calls across chunks keyed by block
/// index rather than call id, so parsing is stateful per stream; a fresh
/// parser is created for every stream call.
pub trait StreamParser: Send {
    /// Parse one de-framed SSE data payload.
    fn parse_chunk(&mut self, chunk: &str) -> CoordResult<StreamChunk>;
}

/// An LLM compat adapter.
#[async_trait]
pub trait LlmCompat: Send + Sync + std::fmt::Debug {
    /// The manifest `kind` string this adapter serves
    fn kind(&self) -> &'static str;

    /// Build the provider-shaped request payload.
    fn build_payload(
        &self,
        model: &str,
        settings: &ProviderSettings,
        messages: &[Message],
        tools: &[Tool],
        tool_choice: Option<&ToolChoice>,
    ) -> CoordResult<Value>;

    /// Parse a unary response body into the unified response.
    fn parse_response(&self, raw: Value, provider: &str, model: &str)
        -> CoordResult<UnifiedResponse>;

    /// Create a parser for one stream call.
    fn new_stream_parser(&self) -> Box<dyn StreamParser>;

    /// Provider-shaped tool list.
    fn serialize_tools(&self, tools: &[Tool]) -> Value;

    /// Provider-shaped tool choice.
    fn serialize_tool_choice(&self, choice: &ToolChoice) -> Value;

    /// Hook for extras the payload-extension engine did not consume.
    fn apply_provider_extensions(&self, _payload: &mut Value, _extras: &BTreeMap<String, Value>) {}

    /// Whether this adapter ships a direct SDK-call variant. When true the
    /// manager prefers [`call_direct`](Self::call_direct) /
    /// [`stream_direct`](Self::stream_direct) over the HTTP path.
    fn has_direct_call(&self) -> bool {
        false
    }

    /// Direct SDK-style unary call (only invoked when
    /// [`has_direct_call`](Self::has_direct_call) is true).
    async fn call_direct(
        &self,
        _payload: &Value,
        _provider: &str,
        _model: &str,
    ) -> CoordResult<UnifiedResponse> {
        Err(CoordinatorError::Internal(anyhow::anyhow!(
            "compat declares no direct-call variant"
        )))
    }

    /// Direct SDK-style stream call (only invoked when
    /// [`has_direct_call`](Self::has_direct_call) is true). Yields the same
    /// de-framed chunk payloads the HTTP path produces.
    async fn stream_direct(
        &self,
        _payload: &Value,
        _provider: &str,
        _model: &str,
    ) -> CoordResult<crate::manager::RawChunkStream> {
        Err(CoordinatorError::Internal(anyhow::anyhow!(
            "compat declares no direct-call variant"
        )))
    }
}

/// Embedding vectors produced by one embed call.
#[derive(Debug, Clone, PartialEq)]
pub struct Embeddings {
    pub vectors: Vec<Vec<f32>>,
    /// Model that produced the vectors
    pub model: String,
    pub dimensions: usize,
    pub token_count: Option<u32>,
}

/// An embedding compat adapter.
#[async_trait]
pub trait EmbeddingCompat: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Embed `inputs` against the manifest's endpoint.
    async fn embed(
        &self,
        inputs: &[String],
        manifest: &EmbeddingProviderManifest,
        model_override: Option<&str>,
    ) -> CoordResult<Embeddings>;

    /// Declared dimensionality, when the manifest knows it.
    fn dimensions(&self, manifest: &EmbeddingProviderManifest, _model: Option<&str>) -> Option<usize> {
        manifest.dimensions
    }

    /// Validate the manifest before first use.
    fn validate(&self, _manifest: &EmbeddingProviderManifest) -> CoordResult<()> {
        Ok(())
    }
}

/// Options for a vector query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    pub filter: Option<Value>,
    pub score_threshold: Option<f64>,
    pub with_vector: bool,
}

/// A vector-store compat adapter.
///
/// Holds connection state between `connect` and `close`.
#[async_trait]
pub trait VectorStoreCompat: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn connect(&mut self, config: &Value) -> CoordResult<()>;

    async fn close(&mut self) -> CoordResult<()>;

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        top_k: usize,
        options: &QueryOptions,
    ) -> CoordResult<Vec<VectorQueryResult>>;

    async fn upsert(&self, collection: &str, points: &[VectorPoint]) -> CoordResult<()>;

    async fn delete_by_ids(&self, collection: &str, ids: &[String]) -> CoordResult<()>;

    async fn collection_exists(&self, name: &str) -> CoordResult<bool>;

    async fn create_collection(
        &self,
        name: &str,
        dimensions: usize,
        options: &Value,
    ) -> CoordResult<()>;

    async fn list_collections(&self) -> CoordResult<Vec<String>>;

    async fn delete_collection(&self, name: &str) -> CoordResult<()>;
}

// ============================================================================
// Kind registry
// ============================================================================

/// Registry of compiled-in compat adapters keyed by the manifest `kind`
/// string.
pub struct CompatRegistry {
    llm: Mutex<HashMap<&'static str, Arc<dyn LlmCompat>>>,
    embedding: Mutex<HashMap<&'static str, Arc<dyn EmbeddingCompat>>>,
}

impl Default for CompatRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CompatRegistry {
    pub fn new() -> Self {
        Self {
            llm: Mutex::new(HashMap::new()),
            embedding: Mutex::new(HashMap::new()),
        }
    }

    /// The shared LLM adapter for `kind` (instantiated on first lookup).
    pub fn llm(&self, kind: &str) -> CoordResult<Arc<dyn LlmCompat>> {
        let mut cache = self.llm.lock().expect("llm compat cache poisoned");
        if let Some(adapter) = cache.get(kind) {
            return Ok(adapter.clone());
        }
        let adapter: Arc<dyn LlmCompat> = match kind {
            openai::KIND => Arc::new(openai::OpenAiChatCompat::new()),
            anthropic::KIND => Arc::new(anthropic::AnthropicMessagesCompat::new()),
            _ => {
                return Err(CoordinatorError::manifest(format!(
                    "unknown LLM compat kind: {kind}"
                )))
            }
        };
        cache.insert(adapter.kind(), adapter.clone());
        Ok(adapter)
    }

    /// The shared embedding adapter for `kind`.
    pub fn embedding(&self, kind: &str) -> CoordResult<Arc<dyn EmbeddingCompat>> {
        let mut cache = self.embedding.lock().expect("embedding compat cache poisoned");
        if let Some(adapter) = cache.get(kind) {
            return Ok(adapter.clone());
        }
        let adapter: Arc<dyn EmbeddingCompat> = match kind {
            embedding::KIND => Arc::new(embedding::OpenAiEmbeddingCompat::new()),
            _ => {
                return Err(CoordinatorError::manifest(format!(
                    "unknown embedding compat kind: {kind}"
                )))
            }
        };
        cache.insert(adapter.kind(), adapter.clone());
        Ok(adapter)
    }

    /// A fresh vector-store adapter for `kind` — never shared.
    pub fn vector_store(&self, kind: &str) -> CoordResult<Box<dyn VectorStoreCompat>> {
        match kind {
            qdrant::KIND => Ok(Box::new(qdrant::QdrantRestCompat::new())),
            _ => Err(CoordinatorError::manifest(format!(
                "unknown vector-store compat kind: {kind}"
            ))),
        }
    }
}
