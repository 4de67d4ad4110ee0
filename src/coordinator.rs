//! Run coordination: registry → providers → tool loop → response.
//!
//! A coordinator is created fresh for every run surface (one per HTTP
//! request) and owns its transient resources: the tool-server pool, any
//! connected vector stores, and the per-run tool invoker. `close` tears all
//! of them down.
//!
//! Provider selection walks the spec's `llmPriority` in order; a rate-limit
//! failure advances to the next entry, at run start and on follow-up calls
//! mid-loop alike.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;

use crate::compat::LlmCompat;
use crate::defaults::Defaults;
use crate::error::{CoordResult, CoordinatorError};
use crate::injector::{ContextInjector, VECTOR_SEARCH_TOOL};
use crate::logging::{log_debug, log_info, log_warn};
use crate::manager::{LlmManager, ProviderCall, RawChunkStream};
use crate::mcp::McpPool;
use crate::registry::{PluginRegistry, ProviderManifest};
use crate::settings::{merge_settings, partition, ProviderSettings, RuntimeSettings};
use crate::spec::{
    CallSpec, ContentPart, EmbeddingPriorityEntry, Message, Role, StreamEvent, Tool, ToolBinding,
    UnifiedResponse,
};
use crate::stream::{
    pump_stream, EventSender, EventStream, StreamAssembly, EVENT_CHANNEL_CAPACITY,
};
use crate::tool_loop::{execute_turn, prepare_final_prompt, RunState};
use crate::tools::{ModuleToolRegistry, ToolInvoker, VectorSearchFn};
use crate::vector::{VectorPoint, VectorStoreManager};

/// Safety margin on top of the tool budget for follow-up turns, so a model
/// that keeps requesting tools against an exhausted budget cannot loop
/// forever.
const EXTRA_TURN_GUARD: u32 = 8;

/// One resolved priority entry.
struct EntryContext {
    manifest: Arc<ProviderManifest>,
    compat: Arc<dyn LlmCompat>,
    model: String,
    settings: ProviderSettings,
    extras: BTreeMap<String, Value>,
}

/// Everything a run needs after spec resolution.
struct PreparedRun {
    entries: Vec<EntryContext>,
    state: RunState,
    invoker: ToolInvoker,
    metadata: Option<Value>,
    retry_delays_ms: Vec<u64>,
}

/// The LLM run coordinator.
pub struct LlmCoordinator {
    registry: Arc<PluginRegistry>,
    manager: LlmManager,
    pool: Arc<McpPool>,
    modules: Arc<ModuleToolRegistry>,
    vector: Arc<VectorStoreManager>,
    defaults: Defaults,
}

impl LlmCoordinator {
    pub fn new(registry: Arc<PluginRegistry>, defaults: Defaults) -> Self {
        Self::with_modules(registry, defaults, Arc::new(ModuleToolRegistry::new()))
    }

    /// Construct with a shared in-process module-tool registry.
    pub fn with_modules(
        registry: Arc<PluginRegistry>,
        defaults: Defaults,
        modules: Arc<ModuleToolRegistry>,
    ) -> Self {
        let vector = Arc::new(VectorStoreManager::new(registry.clone()));
        Self {
            registry,
            manager: LlmManager::new(),
            pool: Arc::new(McpPool::new()),
            modules,
            vector,
            defaults,
        }
    }

    /// Tear down child resources (tool-server sessions, vector-store
    /// connections). Idempotent, best-effort.
    pub async fn close(&self) {
        self.pool.close().await;
        self.vector.close().await;
    }

    // ------------------------------------------------------------------
    // Spec resolution
    // ------------------------------------------------------------------

    async fn prepare(&self, spec: &CallSpec) -> CoordResult<PreparedRun> {
        spec.validate()?;

        // Resolve every priority entry up front; a broken manifest fails
        // the run before any upstream traffic.
        let mut entries = Vec::with_capacity(spec.llm_priority.len());
        for priority in &spec.llm_priority {
            let manifest = self.registry.get_provider(&priority.provider)?;
            let compat = self.registry.get_compat(&manifest.kind)?;
            let merged = merge_settings(&spec.settings, priority.settings.as_ref());
            let parts = partition(&merged);
            entries.push(EntryContext {
                manifest,
                compat,
                model: priority.model.clone(),
                settings: ProviderSettings(parts.provider),
                extras: parts.extras,
            });
        }

        // Loop governance comes from the first entry's merged settings.
        let first_partition = partition(&merge_settings(
            &spec.settings,
            spec.llm_priority[0].settings.as_ref(),
        ));
        let runtime = RuntimeSettings::resolve(&first_partition.runtime, &self.defaults.tools);

        let mut messages = Vec::with_capacity(spec.messages.len() + 1);
        if let Some(system) = &spec.system_prompt {
            messages.push(Message::system(system.clone()));
        }
        messages.extend(spec.messages.iter().cloned());

        // Tool surface: registry tools, inline tools, tool-server tools.
        let mut tools: Vec<Tool> = Vec::new();
        for binding in &spec.tools {
            match binding {
                ToolBinding::Id(id) => {
                    let manifest = self.registry.get_tool(id)?;
                    tools.push(Tool {
                        name: manifest.exposed_name().to_string(),
                        description: manifest.description.clone(),
                        parameters: manifest.parameters.clone().unwrap_or_else(|| {
                            json!({ "type": "object", "properties": {} })
                        }),
                    });
                }
                ToolBinding::Inline(tool) => tools.push(tool.clone()),
            }
        }
        for server_id in &spec.mcp_servers {
            let manifest = self.registry.get_mcp_server(server_id)?;
            let mut server_tools = self.pool.connect(&manifest).await?;
            tools.append(&mut server_tools);
        }

        let routes = self.registry.get_process_routes()?;
        let mut invoker = ToolInvoker::new(
            &routes,
            self.modules.clone(),
            Some(self.pool.clone()),
            std::time::Duration::from_millis(self.defaults.tools.tool_timeout_ms),
        );

        // RAG wiring: inject context and/or expose the search tool.
        if let Some(vector_config) = &spec.vector_context {
            let injector = Arc::new(ContextInjector::new(
                self.vector.clone(),
                vector_config.clone(),
                &spec.vector_stores,
                self.defaults.vector.clone(),
            )?);
            if injector.injects_context() {
                injector
                    .inject(&mut messages, spec.system_prompt.as_deref())
                    .await?;
            }
            if injector.exposes_tool() {
                tools.push(injector.tool());
                let handler: VectorSearchFn = {
                    let injector = injector.clone();
                    Arc::new(
                        move |args| -> futures_util::future::BoxFuture<'static, CoordResult<Value>> {
                            let injector = injector.clone();
                            Box::pin(async move { injector.handle_tool_call(args).await })
                        },
                    )
                };
                invoker.set_vector_search(VECTOR_SEARCH_TOOL, handler);
            }
        }

        let retry_delays_ms = spec
            .retry_delays_ms
            .clone()
            .unwrap_or_else(|| self.defaults.retry.delays_ms.clone());

        Ok(PreparedRun {
            entries,
            state: RunState::new(messages, tools, spec.tool_choice.clone(), runtime),
            invoker,
            metadata: spec.metadata.clone(),
            retry_delays_ms,
        })
    }

    // ------------------------------------------------------------------
    // Unary path
    // ------------------------------------------------------------------

    /// Run a spec to completion and return the final unified response.
    pub async fn run(&self, spec: &CallSpec) -> CoordResult<UnifiedResponse> {
        let mut run = self.prepare(spec).await?;
        let mut entry_index = 0usize;

        let mut response = self
            .call_with_fallback(&mut entry_index, &run, &run.state)
            .await?;
        if let Some(usage) = &response.usage {
            run.state.add_usage(usage);
        }

        let max_turns = run.state.budget.total() + EXTRA_TURN_GUARD;
        let mut turns = 0u32;
        loop {
            if !response.has_tool_calls() {
                return Ok(run.state.finalize_response(response));
            }
            turns += 1;
            if turns > max_turns {
                log_warn!(turns = turns, "Turn guard tripped, returning current response");
                return Ok(run.state.finalize_response(response));
            }

            let entry = &run.entries[entry_index.min(run.entries.len() - 1)];
            let provider = entry.manifest.id.clone();
            let model = entry.model.clone();
            let outcome = execute_turn(
                &mut run.state,
                &run.invoker,
                &response,
                &provider,
                &model,
                run.metadata.as_ref(),
            )
            .await?;

            if outcome.budget_exhausted && run.state.runtime.tool_final_prompt_enabled {
                prepare_final_prompt(&mut run.state);
                let final_response = self
                    .call_with_fallback(&mut entry_index, &run, &run.state)
                    .await?;
                if let Some(usage) = &final_response.usage {
                    run.state.add_usage(usage);
                }
                return Ok(run.state.finalize_response(final_response));
            }

            response = self
                .call_with_fallback(&mut entry_index, &run, &run.state)
                .await?;
            if let Some(usage) = &response.usage {
                run.state.add_usage(usage);
            }
        }
    }

    /// Call the current priority entry, advancing past rate-limited
    /// providers.
    async fn call_with_fallback(
        &self,
        entry_index: &mut usize,
        run: &PreparedRun,
        state: &RunState,
    ) -> CoordResult<UnifiedResponse> {
        loop {
            let entry = run
                .entries
                .get(*entry_index)
                .ok_or_else(|| CoordinatorError::Internal(anyhow::anyhow!("priority exhausted")))?;
            let call = ProviderCall {
                manifest: &entry.manifest,
                compat: &entry.compat,
                model: &entry.model,
                settings: &entry.settings,
                messages: &state.messages,
                tools: &state.tools,
                tool_choice: state.tool_choice.as_ref(),
                extras: &entry.extras,
                retry_delays_ms: &run.retry_delays_ms,
            };
            match self.manager.call_provider(&call).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_rate_limit() && *entry_index + 1 < run.entries.len() => {
                    log_info!(
                        provider = %entry.manifest.id,
                        "Rate limited, advancing to next priority entry"
                    );
                    *entry_index += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    // ------------------------------------------------------------------
    // Streaming path
    // ------------------------------------------------------------------

    /// Run a spec as an event stream. The returned stream yields exactly
    /// one terminal `done` (or `error`) event; dropping it cancels the run.
    pub async fn stream(&self, spec: &CallSpec) -> CoordResult<EventStream> {
        let run = self.prepare(spec).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let manager = self.manager.clone();
        tokio::spawn(async move {
            if let Err(err) = drive_stream(manager, run, tx.clone()).await {
                match err {
                    CoordinatorError::ClientAborted => {
                        log_debug!("Stream consumer gone, run cancelled");
                    }
                    err => {
                        let _ = tx
                            .send(StreamEvent::Error {
                                message: err.public_message(),
                                code: err.code().to_string(),
                            })
                            .await;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// The streaming tool loop, driven inside the producer task.
async fn drive_stream(
    manager: LlmManager,
    mut run: PreparedRun,
    events: EventSender,
) -> CoordResult<()> {
    let mut entry_index = 0usize;
    let mut accumulated_text = String::new();
    let mut run_reasoning: Option<crate::spec::Reasoning> = None;
    let max_turns = run.state.budget.total() + EXTRA_TURN_GUARD;
    let mut turns = 0u32;

    loop {
        let (raw, provider, model) =
            start_stream_with_fallback(&manager, &mut entry_index, &run).await?;
        let entry = &run.entries[entry_index];
        let mut parser = entry.compat.new_stream_parser();

        let mut assembly = StreamAssembly::new();
        pump_stream(raw, parser.as_mut(), &mut assembly, &events).await?;
        if !assembly.finalize_pending(&events).await {
            return Err(CoordinatorError::ClientAborted);
        }

        if !assembly.text.is_empty() {
            if !accumulated_text.is_empty() {
                accumulated_text.push('\n');
            }
            accumulated_text.push_str(&assembly.text);
        }
        if let Some(usage) = &assembly.usage {
            run.state.add_usage(usage);
        }
        if let Some(reasoning) = assembly.reasoning.clone() {
            let entry = run_reasoning.get_or_insert_with(Default::default);
            entry.text.push_str(&reasoning.text);
            if reasoning.metadata.is_some() {
                entry.metadata = reasoning.metadata;
            }
        }

        let tool_calls = assembly.tool_calls();
        if assembly.wants_tools() && !tool_calls.is_empty() {
            turns += 1;
            if turns <= max_turns {
                // Synthesize the turn response the loop mechanics expect.
                let turn_response = UnifiedResponse {
                    provider: provider.clone(),
                    model: model.clone(),
                    role: Role::Assistant,
                    content: if assembly.text.is_empty() {
                        Vec::new()
                    } else {
                        vec![ContentPart::text(&assembly.text)]
                    },
                    tool_calls: Some(tool_calls),
                    usage: None,
                    reasoning: assembly.reasoning.clone(),
                    finish_reason: assembly.finish_reason,
                    raw: None,
                };
                let outcome = execute_turn(
                    &mut run.state,
                    &run.invoker,
                    &turn_response,
                    &provider,
                    &model,
                    run.metadata.as_ref(),
                )
                .await?;
                for event in outcome.result_events {
                    if events.send(StreamEvent::Tool { event }).await.is_err() {
                        return Err(CoordinatorError::ClientAborted);
                    }
                }
                if outcome.budget_exhausted {
                    if run.state.runtime.tool_final_prompt_enabled {
                        prepare_final_prompt(&mut run.state);
                    } else {
                        // Tools and choice zeroed for the follow-up call.
                        run.state.tools.clear();
                        run.state.tool_choice = Some(crate::spec::ToolChoice::none());
                    }
                }
                continue;
            }
            log_warn!(turns = turns, "Turn guard tripped, closing stream");
        }

        // Terminal turn: assemble and emit the single done event.
        let response = UnifiedResponse {
            provider,
            model,
            role: Role::Assistant,
            content: if accumulated_text.is_empty() {
                Vec::new()
            } else {
                vec![ContentPart::text(&accumulated_text)]
            },
            tool_calls: None,
            usage: None,
            reasoning: run_reasoning.clone(),
            finish_reason: assembly.finish_reason,
            raw: None,
        };
        let response = run.state.finalize_response(response);
        if events.send(StreamEvent::Done { response }).await.is_err() {
            return Err(CoordinatorError::ClientAborted);
        }
        return Ok(());
    }
}

async fn start_stream_with_fallback(
    manager: &LlmManager,
    entry_index: &mut usize,
    run: &PreparedRun,
) -> CoordResult<(RawChunkStream, String, String)> {
    loop {
        let entry = run
            .entries
            .get(*entry_index)
            .ok_or_else(|| CoordinatorError::Internal(anyhow::anyhow!("priority exhausted")))?;
        let call = ProviderCall {
            manifest: &entry.manifest,
            compat: &entry.compat,
            model: &entry.model,
            settings: &entry.settings,
            messages: &run.state.messages,
            tools: &run.state.tools,
            tool_choice: run.state.tool_choice.as_ref(),
            extras: &entry.extras,
            retry_delays_ms: &run.retry_delays_ms,
        };
        match manager.stream_provider(&call).await {
            Ok(raw) => {
                return Ok((raw, entry.manifest.id.clone(), entry.model.clone()));
            }
            Err(err) if err.is_rate_limit() && *entry_index + 1 < run.entries.len() => {
                log_info!(
                    provider = %entry.manifest.id,
                    "Rate limited at stream start, advancing to next priority entry"
                );
                *entry_index += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

// ============================================================================
// Vector coordinator
// ============================================================================

/// Operations accepted by the vector surface (`/vector/run`,
/// `/vector/stream`, and the vector CLI).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "camelCase")]
pub enum VectorOperation {
    /// Embed a query (or use a supplied vector) and search a store
    #[serde(rename_all = "camelCase")]
    Query {
        store: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        collection: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        vector: Option<Vec<f32>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        top_k: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        score_threshold: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        embedding_priority: Option<Vec<EmbeddingPriorityEntry>>,
    },
    #[serde(rename_all = "camelCase")]
    Upsert {
        store: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        collection: Option<String>,
        points: Vec<VectorPoint>,
    },
    #[serde(rename_all = "camelCase")]
    Delete {
        store: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        collection: Option<String>,
        ids: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    ListCollections { store: String },
    #[serde(rename_all = "camelCase")]
    CreateCollection {
        store: String,
        name: String,
        dimensions: usize,
        #[serde(default)]
        options: Value,
    },
    #[serde(rename_all = "camelCase")]
    DeleteCollection { store: String, name: String },
    #[serde(rename_all = "camelCase")]
    CollectionExists { store: String, name: String },
    /// Generate embeddings without touching a store
    #[serde(rename_all = "camelCase")]
    Embed {
        inputs: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        embedding_priority: Option<Vec<EmbeddingPriorityEntry>>,
        /// Stores whose default priorities apply when none is given
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        stores: Vec<String>,
    },
}

/// Coordinator for vector-store and embedding operations.
pub struct VectorCoordinator {
    manager: Arc<VectorStoreManager>,
    defaults: Defaults,
}

impl VectorCoordinator {
    pub fn new(registry: Arc<PluginRegistry>, defaults: Defaults) -> Self {
        Self {
            manager: Arc::new(VectorStoreManager::new(registry)),
            defaults,
        }
    }

    pub async fn close(&self) {
        self.manager.close().await;
    }

    /// Execute one vector operation and return its JSON result.
    pub async fn run(&self, operation: VectorOperation) -> CoordResult<Value> {
        match operation {
            VectorOperation::Query {
                store,
                collection,
                query,
                vector,
                top_k,
                filter,
                score_threshold,
                embedding_priority,
            } => {
                let vector = match (vector, query) {
                    (Some(vector), _) => vector,
                    (None, Some(query)) => {
                        let priority = self.manager.resolve_embedding_priority(
                            embedding_priority.as_deref(),
                            std::slice::from_ref(&store),
                        )?;
                        self.manager.embed_query(&priority, &query).await?
                    }
                    (None, None) => {
                        return Err(CoordinatorError::validation(
                            "query requires either a query string or a vector",
                        ))
                    }
                };
                let results = self
                    .manager
                    .query(
                        &store,
                        collection.as_deref(),
                        vector,
                        top_k.unwrap_or(self.defaults.vector.top_k),
                        crate::compat::QueryOptions {
                            filter,
                            score_threshold,
                            with_vector: false,
                        },
                    )
                    .await?;
                Ok(json!({ "results": results }))
            }
            VectorOperation::Upsert {
                store,
                collection,
                points,
            } => {
                let count = self
                    .manager
                    .upsert(&store, collection.as_deref(), points)
                    .await?;
                Ok(json!({ "upserted": count }))
            }
            VectorOperation::Delete {
                store,
                collection,
                ids,
            } => {
                let count = self
                    .manager
                    .delete(&store, collection.as_deref(), ids)
                    .await?;
                Ok(json!({ "deleted": count }))
            }
            VectorOperation::ListCollections { store } => {
                let collections = self.manager.list_collections(&store).await?;
                Ok(json!({ "collections": collections }))
            }
            VectorOperation::CreateCollection {
                store,
                name,
                dimensions,
                options,
            } => {
                self.manager
                    .create_collection(&store, name.clone(), dimensions, options)
                    .await?;
                Ok(json!({ "created": name }))
            }
            VectorOperation::DeleteCollection { store, name } => {
                self.manager.delete_collection(&store, name.clone()).await?;
                Ok(json!({ "deleted": name }))
            }
            VectorOperation::CollectionExists { store, name } => {
                let exists = self.manager.collection_exists(&store, name).await?;
                Ok(json!({ "exists": exists }))
            }
            VectorOperation::Embed {
                inputs,
                embedding_priority,
                stores,
            } => {
                let priority = self
                    .manager
                    .resolve_embedding_priority(embedding_priority.as_deref(), &stores)?;
                let embeddings = self.manager.embed(&priority, &inputs).await?;
                Ok(json!({
                    "vectors": embeddings.vectors,
                    "model": embeddings.model,
                    "dimensions": embeddings.dimensions,
                    "tokenCount": embeddings.token_count,
                }))
            }
        }
    }

    /// Stream variant: the operation's result (or failure) arrives as the
    /// terminal SSE event.
    pub async fn stream(&self, operation: VectorOperation) -> CoordResult<EventStream> {
        let result = self.run(operation).await;
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        match result {
            Ok(data) => {
                let response = UnifiedResponse {
                    provider: "vector".to_string(),
                    model: String::new(),
                    role: Role::Assistant,
                    content: vec![ContentPart::text(data.to_string())],
                    tool_calls: None,
                    usage: None,
                    reasoning: None,
                    finish_reason: None,
                    raw: Some(json!({ "body": data })),
                };
                let _ = tx.send(StreamEvent::Done { response }).await;
            }
            Err(err) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: err.public_message(),
                        code: err.code().to_string(),
                    })
                    .await;
            }
        }
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
