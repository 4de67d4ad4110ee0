//! Retrieval-augmented context injection and the built-in `vector_search`
//! tool.
//!
//! The injector owns everything between a run's `vectorContext` config and
//! the vector-store manager: query construction, embedding, lock
//! enforcement, schema aliasing, template rendering, and the result
//! formatting the model sees.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::compat::QueryOptions;
use crate::defaults::VectorDefaults;
use crate::error::{CoordResult, CoordinatorError};
use crate::logging::{log_debug, log_warn};
use crate::spec::{
    EmbeddingPriorityEntry, IncludeSystemPrompt, InjectAs, Message, QueryConstruction, Role, Tool,
    VectorContextConfig, VectorContextMode,
};
use crate::vector::{VectorQueryResult, VectorStoreManager};

/// Canonical parameter names of the `vector_search` tool.
const CANONICAL_PARAMS: [&str; 6] = [
    "query",
    "topK",
    "store",
    "filter",
    "collection",
    "scoreThreshold",
];

/// Default name the tool is exposed under.
pub const VECTOR_SEARCH_TOOL: &str = "vector_search";

/// Effective, lock-aware retrieval parameters for one search.
#[derive(Debug, Clone)]
struct EffectiveQuery {
    store: String,
    collection: Option<String>,
    top_k: usize,
    score_threshold: f64,
    filter: Option<Value>,
}

/// Drives RAG injection and the `vector_search` tool for one run.
pub struct ContextInjector {
    manager: Arc<VectorStoreManager>,
    config: VectorContextConfig,
    /// Effective store ids (config stores, else the spec's bindings)
    stores: Vec<String>,
    defaults: VectorDefaults,
    priority: Vec<EmbeddingPriorityEntry>,
    /// exposed name → canonical name
    aliases: BTreeMap<String, String>,
}

impl ContextInjector {
    /// Build the injector, resolving the embedding priority and validating
    /// schema aliases.
    pub fn new(
        manager: Arc<VectorStoreManager>,
        config: VectorContextConfig,
        spec_stores: &[String],
        defaults: VectorDefaults,
    ) -> CoordResult<Self> {
        let stores = config
            .stores
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| spec_stores.to_vec());
        if stores.is_empty() {
            return Err(CoordinatorError::validation(
                "vectorContext requires at least one store",
            ));
        }

        let priority = manager
            .resolve_embedding_priority(config.embedding_priority.as_deref(), &stores)?;
        let aliases = build_alias_map(&config)?;

        Ok(Self {
            manager,
            config,
            stores,
            defaults,
            priority,
            aliases,
        })
    }

    pub fn mode(&self) -> VectorContextMode {
        self.config.mode
    }

    /// Whether this run injects context before the first call.
    pub fn injects_context(&self) -> bool {
        matches!(
            self.config.mode,
            VectorContextMode::Auto | VectorContextMode::Both
        )
    }

    /// Whether this run exposes the `vector_search` tool.
    pub fn exposes_tool(&self) -> bool {
        matches!(
            self.config.mode,
            VectorContextMode::Tool | VectorContextMode::Both
        )
    }

    // ------------------------------------------------------------------
    // Auto-injection
    // ------------------------------------------------------------------

    /// Retrieve and insert the synthesized context message.
    pub async fn inject(
        &self,
        messages: &mut Vec<Message>,
        system_prompt: Option<&str>,
    ) -> CoordResult<()> {
        let query = match &self.config.override_embedding_query {
            Some(query) => query.clone(),
            None => self.construct_query(messages, system_prompt),
        };
        if query.trim().is_empty() {
            log_debug!("Empty embedding query, skipping context injection");
            return Ok(());
        }

        let vector = self.manager.embed_query(&self.priority, &query).await?;
        let mut results = Vec::new();
        for store_id in &self.stores {
            let effective = self.effective_query(store_id.clone(), &Map::new())?;
            match self
                .manager
                .query(
                    store_id,
                    effective.collection.as_deref(),
                    vector.clone(),
                    effective.top_k,
                    QueryOptions {
                        filter: effective.filter.clone(),
                        score_threshold: Some(effective.score_threshold),
                        with_vector: false,
                    },
                )
                .await
            {
                Ok(mut hits) => results.append(&mut hits),
                Err(err) => {
                    log_warn!(store = %store_id, error = %err, "Store query failed during injection");
                }
            }
        }

        results.retain(|r| r.score >= self.threshold());
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(self.top_k());

        if results.is_empty() {
            log_debug!(query = %query, "No retrieval hits, skipping context injection");
            return Ok(());
        }

        let rendered = self.render_template(&results);
        match self.config.inject_as {
            InjectAs::System => {
                // A fresh system message; an existing system prompt is never
                // clobbered.
                messages.push(Message::system(rendered));
            }
            InjectAs::UserContext => {
                let position = messages
                    .iter()
                    .rposition(|m| m.role == Role::User)
                    .unwrap_or(messages.len());
                messages.insert(position, Message::user(rendered));
            }
        }
        Ok(())
    }

    /// Concatenate the trailing window of the conversation into the
    /// embedding query.
    fn construct_query(&self, messages: &[Message], system_prompt: Option<&str>) -> String {
        let construction = self
            .config
            .query_construction
            .clone()
            .unwrap_or_else(|| QueryConstruction {
                messages_to_include: self.defaults.query_messages_to_include,
                ..QueryConstruction::default()
            });

        let conversational: Vec<&Message> = messages
            .iter()
            .filter(|m| match m.role {
                Role::User => true,
                Role::Assistant => construction.include_assistant_messages,
                Role::System | Role::Tool => false,
            })
            .collect();

        let window = if construction.messages_to_include == 0 {
            conversational.as_slice()
        } else {
            let start = conversational
                .len()
                .saturating_sub(construction.messages_to_include);
            &conversational[start..]
        };
        let covers_all = construction.messages_to_include == 0
            || construction.messages_to_include >= conversational.len();

        let mut parts: Vec<String> = Vec::new();
        let include_system = match construction.include_system_prompt {
            IncludeSystemPrompt::Always => true,
            IncludeSystemPrompt::Never => false,
            IncludeSystemPrompt::IfInRange => covers_all,
        };
        if include_system {
            if let Some(system) = system_prompt {
                if !system.is_empty() {
                    parts.push(system.to_string());
                }
            }
        }
        parts.extend(
            window
                .iter()
                .map(|m| m.text_content())
                .filter(|t| !t.is_empty()),
        );
        parts.join(&construction.separator)
    }

    fn render_template(&self, results: &[VectorQueryResult]) -> String {
        let format = self
            .config
            .result_format
            .clone()
            .unwrap_or_else(|| self.defaults.result_format.clone());
        let rendered: Vec<String> = results
            .iter()
            .map(|result| render_result(&format, result))
            .collect();
        let results_block = rendered.join("\n");

        match &self.config.template {
            Some(template) => template.replace("{{results}}", &results_block),
            None => format!("Relevant context:\n{results_block}"),
        }
    }

    // ------------------------------------------------------------------
    // The vector_search tool
    // ------------------------------------------------------------------

    /// The tool definition exposed to the model: locked parameters are
    /// omitted, aliased parameters are renamed, hidden parameters are
    /// dropped.
    pub fn tool(&self) -> Tool {
        let locks = self.config.locks.clone().unwrap_or_default();
        let overrides = self
            .config
            .tool_schema_overrides
            .clone()
            .unwrap_or_default();

        let mut properties = Map::new();
        let mut required = Vec::new();
        for canonical in CANONICAL_PARAMS {
            let locked = match canonical {
                "store" => locks.store.is_some(),
                "collection" => locks.collection.is_some(),
                "topK" => locks.top_k.is_some(),
                "filter" => locks.filter.is_some(),
                "scoreThreshold" => locks.score_threshold.is_some(),
                _ => false,
            };
            if locked {
                continue;
            }
            let exposed = match overrides.params.get(canonical) {
                Some(Some(alias)) => alias.clone(),
                // null hides the parameter from the schema
                Some(None) => continue,
                None => canonical.to_string(),
            };
            properties.insert(exposed.clone(), param_schema(canonical));
            if canonical == "query" {
                required.push(Value::String(exposed));
            }
        }

        Tool {
            name: VECTOR_SEARCH_TOOL.to_string(),
            description: "Search the configured vector stores for relevant context.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        }
    }

    /// Execute a model-issued `vector_search` call.
    ///
    /// Failures are rendered in-band so the model can recover.
    pub async fn handle_tool_call(&self, args: Value) -> CoordResult<Value> {
        let args = self.translate_aliases(args);
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match self.search(&query, &args).await {
            Ok(results) => Ok(json!({
                "text": format_results(&query, &results),
                "results": results,
            })),
            Err(err) => Ok(json!({ "text": format!("Vector search failed: {err}") })),
        }
    }

    async fn search(&self, query: &str, args: &Value) -> CoordResult<Vec<VectorQueryResult>> {
        if query.is_empty() {
            return Err(CoordinatorError::validation("query is required"));
        }
        let empty = Map::new();
        let arg_map = args.as_object().unwrap_or(&empty);
        let effective = self.effective_query(self.stores[0].clone(), arg_map)?;

        let vector = self.manager.embed_query(&self.priority, query).await?;
        let mut results = self
            .manager
            .query(
                &effective.store,
                effective.collection.as_deref(),
                vector,
                effective.top_k,
                QueryOptions {
                    filter: effective.filter.clone(),
                    score_threshold: Some(effective.score_threshold),
                    with_vector: false,
                },
            )
            .await?;
        results.retain(|r| r.score >= effective.score_threshold);
        Ok(results)
    }

    /// Resolve each parameter: lock → caller argument → config default →
    /// store default. Locked values win regardless of the model's claim.
    fn effective_query(
        &self,
        default_store: String,
        args: &Map<String, Value>,
    ) -> CoordResult<EffectiveQuery> {
        let locks = self.config.locks.clone().unwrap_or_default();

        let store = locks
            .store
            .clone()
            .or_else(|| {
                args.get("store")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or(default_store);
        if !self.stores.contains(&store) && locks.store.as_deref() != Some(store.as_str()) {
            return Err(CoordinatorError::validation(format!(
                "store {store} is not bound to this run"
            )));
        }

        let store_manifest = self.manager.manifest(&store)?;
        let collection = locks
            .collection
            .clone()
            .or_else(|| {
                args.get("collection")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .or_else(|| self.config.collection.clone());
        let top_k = locks
            .top_k
            .or_else(|| args.get("topK").and_then(Value::as_u64).map(|n| n as usize))
            .or(self.config.top_k)
            .or(store_manifest.default_top_k)
            .unwrap_or(self.defaults.top_k);
        let score_threshold = locks
            .score_threshold
            .or_else(|| args.get("scoreThreshold").and_then(Value::as_f64))
            .or(self.config.score_threshold)
            .or(store_manifest.default_score_threshold)
            .unwrap_or(self.defaults.score_threshold);
        let filter = locks
            .filter
            .clone()
            .or_else(|| args.get("filter").filter(|f| !f.is_null()).cloned())
            .or_else(|| self.config.filter.clone());

        Ok(EffectiveQuery {
            store,
            collection,
            top_k,
            score_threshold,
            filter,
        })
    }

    /// Move aliased argument keys onto their canonical names. Canonical
    /// names keep working.
    fn translate_aliases(&self, args: Value) -> Value {
        let Value::Object(mut map) = args else {
            return args;
        };
        for (exposed, canonical) in &self.aliases {
            if let Some(value) = map.remove(exposed) {
                map.entry(canonical.clone()).or_insert(value);
            }
        }
        Value::Object(map)
    }

    fn top_k(&self) -> usize {
        self.config
            .locks
            .as_ref()
            .and_then(|l| l.top_k)
            .or(self.config.top_k)
            .unwrap_or(self.defaults.top_k)
    }

    fn threshold(&self) -> f64 {
        self.config
            .locks
            .as_ref()
            .and_then(|l| l.score_threshold)
            .or(self.config.score_threshold)
            .unwrap_or(self.defaults.score_threshold)
    }
}

/// Build the exposed→canonical alias map, rejecting collisions.
fn build_alias_map(config: &VectorContextConfig) -> CoordResult<BTreeMap<String, String>> {
    let mut aliases = BTreeMap::new();
    let Some(overrides) = &config.tool_schema_overrides else {
        return Ok(aliases);
    };
    for (canonical, exposed) in &overrides.params {
        if !CANONICAL_PARAMS.contains(&canonical.as_str()) {
            return Err(CoordinatorError::validation(format!(
                "unknown vector_search parameter: {canonical}"
            )));
        }
        let Some(exposed) = exposed else {
            continue;
        };
        if CANONICAL_PARAMS.contains(&exposed.as_str()) && exposed != canonical {
            return Err(CoordinatorError::validation(format!(
                "alias {exposed} collides with a canonical parameter name"
            )));
        }
        if aliases
            .insert(exposed.clone(), canonical.clone())
            .is_some()
        {
            return Err(CoordinatorError::validation(format!(
                "alias {exposed} is used for more than one parameter"
            )));
        }
    }
    Ok(aliases)
}

fn param_schema(canonical: &str) -> Value {
    match canonical {
        "query" => json!({ "type": "string", "description": "Search query text" }),
        "topK" => json!({ "type": "integer", "description": "Maximum number of results" }),
        "store" => json!({ "type": "string", "description": "Vector store id to search" }),
        "filter" => json!({ "type": "object", "description": "Store-specific payload filter" }),
        "collection" => json!({ "type": "string", "description": "Collection to search" }),
        "scoreThreshold" => {
            json!({ "type": "number", "description": "Minimum similarity score" })
        }
        _ => json!({ "type": "string" }),
    }
}

// ============================================================================
// Rendering
// ============================================================================

static TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{([A-Za-z0-9_.]+)\}\}").expect("valid template token regex"));

/// Interpolate `{{score}}`, `{{id}}`, and `{{payload.*}}` tokens.
fn render_result(format: &str, result: &VectorQueryResult) -> String {
    TOKEN
        .replace_all(format, |caps: &regex::Captures<'_>| {
            let token = &caps[1];
            if token == "score" {
                return format!("{:.3}", result.score);
            }
            if token == "id" {
                return result.id.clone();
            }
            if let Some(path) = token.strip_prefix("payload.") {
                return lookup_path(result.payload.as_ref(), path);
            }
            String::new()
        })
        .into_owned()
}

fn lookup_path(payload: Option<&Value>, path: &str) -> String {
    let mut cursor = match payload {
        Some(value) => value,
        None => return String::new(),
    };
    for segment in path.split('.') {
        match cursor.get(segment) {
            Some(next) => cursor = next,
            None => return String::new(),
        }
    }
    match cursor {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The textual block handed back to the model.
fn format_results(query: &str, results: &[VectorQueryResult]) -> String {
    if results.is_empty() {
        return format!("No results found for query: \"{query}\"");
    }
    let mut out = format!("Found {} results:", results.len());
    for (index, result) in results.iter().enumerate() {
        let content = match &result.payload {
            Some(payload) => match payload.get("text").and_then(Value::as_str) {
                Some(text) => text.to_string(),
                None => payload.to_string(),
            },
            None => result.id.clone(),
        };
        out.push_str(&format!(
            "\n[{}] (score: {:.3}) {content}",
            index + 1,
            result.score
        ));
    }
    out
}
