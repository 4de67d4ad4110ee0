//! # llm-coordinator
//!
//! Provider-agnostic coordinator for LLM workloads: a declarative call spec
//! in, provider selection over an ordered priority list with rate-limit
//! fallback, a budgeted multi-turn tool loop, and either a single unified
//! response or a stream of incremental events out. Sibling coordinators
//! cover embedding generation and vector-store operations, and an HTTP/SSE
//! server wraps all three behind shared admission control.
//!
//! ## Key Features
//!
//! - **Plugin registry**: lazy, filesystem-backed catalog of providers,
//!   tools, subprocess tool servers, vector stores, and embedding providers
//! - **Compat adapters**: per-protocol payload build / response parse /
//!   stream parse, selected by a manifest `kind`; core code carries no
//!   provider knowledge
//! - **Tool loop**: budgeted iteration, context pruning, parallel fan-out
//!   with deterministic result order, in-band tool failures
//! - **RAG injection**: retrieval-backed context messages and a
//!   `vector_search` tool with server-side locks and schema aliasing
//! - **HTTP/SSE core**: per-route concurrency limiting with bounded
//!   queues, auth, rate limiting, CORS, body and deadline enforcement
//!
//! ## Example
//!
//! ```rust,no_run
//! use llm_coordinator::{CallSpec, Defaults, LlmCoordinator, PluginRegistry};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let registry = Arc::new(PluginRegistry::new("./plugins")?);
//! let coordinator = LlmCoordinator::new(registry, Defaults::default());
//!
//! let spec: CallSpec = serde_json::from_str(r#"{
//!     "messages": [{ "role": "user", "content": [{ "type": "text", "text": "hi" }] }],
//!     "llmPriority": [{ "provider": "acme", "model": "acme-large" }]
//! }"#)?;
//!
//! let response = coordinator.run(&spec).await?;
//! println!("{}", response.text());
//! coordinator.close().await;
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module declarations
// =============================================================================

// Public modules - flattened structure matching DESIGN.md
pub mod compat;
pub mod coordinator;
pub mod defaults;
pub mod error;
pub mod extensions;
pub mod injector;
pub mod manager;
pub mod mcp;
pub mod prune;
pub mod registry;
pub mod server;
pub mod settings;
pub mod spec;
pub mod stream;
pub mod tool_loop;
pub mod tools;
pub mod vector;

// Internal modules
pub(crate) mod logging;

#[cfg(test)]
pub mod tests;

// =============================================================================
// Public API re-exports
// =============================================================================

// Errors
pub use error::{CoordResult, CoordinatorError};

// Spec and response types - the core data model
pub use spec::{
    CallSpec, ContentPart, DocumentSource, EmbeddingPriorityEntry, FinishReason, Message,
    PriorityEntry, Reasoning, Role, StreamEvent, Tool, ToolBinding, ToolCall, ToolCallRecord,
    ToolChoice, ToolChoiceMode, ToolEvent, UnifiedResponse, Usage, VectorContextConfig,
    VectorContextMode, VectorLocks,
};

// Settings
pub use settings::{KeepPolicy, PartitionedSettings, ProviderSettings, RuntimeSettings};

// Registry and manifests
pub use registry::{
    EndpointConfig, InvokeSpec, McpServerManifest, PayloadExtension, PluginRegistry,
    ProviderManifest, RouteManifest, ToolManifest, VectorStoreManifest,
};

// Coordinators
pub use coordinator::{LlmCoordinator, VectorCoordinator, VectorOperation};

// Compat capability set
pub use compat::{
    CompatRegistry, EmbeddingCompat, Embeddings, LlmCompat, QueryOptions, StreamChunk,
    StreamParser, VectorStoreCompat,
};

// Defaults
pub use defaults::Defaults;

// Vector types
pub use vector::{VectorPoint, VectorQueryResult, VectorStoreManager};

// Tooling surface
pub use tools::{ModuleToolFn, ModuleToolRegistry, ToolContext, ToolInvoker};

// MCP pool
pub use mcp::McpPool;

// Server
pub use server::auth::{AuthConfig, KeyList};
pub use server::{build_router, serve, AppState, ServerConfig};

// Streaming
pub use stream::EventStream;
