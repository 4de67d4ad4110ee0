//! Lazy filesystem-backed plugin registry.
//!
//! The registry is the catalog of everything declared on disk:
//!
//! ```text
//! <root>/providers/*.json        LLM provider manifests
//! <root>/tools/*.json            tool declarations
//! <root>/mcp/*.json              subprocess tool servers
//! <root>/vector/*.json           vector stores
//! <root>/embeddings/*.json       embedding providers
//! <root>/processes/*.json        tool routing rules
//! ```
//!
//! Each category is loaded lazily on first lookup and cached for the
//! registry lifetime. Malformed manifests are skipped with a warning, never
//! fatal. An optional overlay directory is scanned before the root; the
//! first manifest for an id wins and later duplicates are skipped.
//!
//! Compat adapters are compiled-in implementations selected by a manifest's
//! `kind` string through [`crate::compat::CompatRegistry`]; no provider,
//! model, or endpoint knowledge lives outside the adapters and the
//! manifests.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::compat::{CompatRegistry, EmbeddingCompat, LlmCompat, VectorStoreCompat};
use crate::error::{CoordResult, CoordinatorError};
use crate::logging::{log_debug, log_warn};
use crate::spec::EmbeddingPriorityEntry;

// ============================================================================
// Manifest types
// ============================================================================

/// Wire-level endpoint configuration for a provider or embedding manifest.
///
/// Header values may contain `${NAME}` tokens, substituted from the
/// environment at load time; unresolved tokens remain literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    /// URL template for unary calls
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Streaming override; unary URL is reused when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_headers: Option<BTreeMap<String, String>>,
}

impl EndpointConfig {
    /// The URL and headers for a streaming call.
    pub fn stream_parts(&self) -> (&str, &BTreeMap<String, String>) {
        (
            self.stream_url.as_deref().unwrap_or(&self.url),
            self.stream_headers.as_ref().unwrap_or(&self.headers),
        )
    }
}

/// Expected JSON type of a payload-extension value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExtensionValueType {
    Object,
    Array,
    String,
    Number,
    Boolean,
    #[default]
    Any,
}

/// How an extension value lands on the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Overwrite whatever is at the target path
    Replace,
    /// Recursive object merge (arrays and primitives still overwrite)
    #[default]
    Merge,
}

/// A typed injection point for pass-through settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadExtension {
    pub name: String,
    /// The extras key this extension consumes
    pub settings_key: String,
    /// Path into the payload where the value lands
    pub target_path: Vec<String>,
    #[serde(default)]
    pub value_type: ExtensionValueType,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
}

/// One LLM provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderManifest {
    pub id: String,
    /// Selects the compat adapter
    pub kind: String,
    pub endpoint: EndpointConfig,
    /// Body sentinels that classify a failure as a rate limit
    #[serde(default)]
    pub retry_words: Vec<String>,
    #[serde(default)]
    pub payload_extensions: Vec<PayloadExtension>,
}

/// A declared tool surface (invocation is decided by routes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolManifest {
    pub id: String,
    /// Name exposed to the model; defaults to the id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Option<Value>,
}

impl ToolManifest {
    pub fn exposed_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// A subprocess tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServerManifest {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_timeout_ms: Option<u64>,
}

/// A vector store binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorStoreManifest {
    pub id: String,
    /// Selects the vector-store compat adapter
    pub kind: String,
    /// Connection config handed to the compat's `connect`
    #[serde(default)]
    pub config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_top_k: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_score_threshold: Option<f64>,
    /// Default embedding priority for runs that configure none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_priority: Option<Vec<EmbeddingPriorityEntry>>,
}

/// An embedding provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingProviderManifest {
    pub id: String,
    /// Selects the embedding compat adapter
    pub kind: String,
    pub endpoint: EndpointConfig,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,
}

/// Pattern kinds for tool routing rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteMatchType {
    Exact,
    Prefix,
    Regex,
    Glob,
}

/// The matcher half of a routing rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteMatch {
    #[serde(rename = "type")]
    pub match_type: RouteMatchType,
    pub pattern: String,
}

/// How a routed tool is invoked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InvokeSpec {
    /// In-process tool function registered under `path`
    Module {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        function: Option<String>,
    },
    /// One-shot child process; JSON args on stdin, JSON result on stdout
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// POST JSON to a URL
    Http {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// Delegate to a subprocess tool server
    Mcp { server: String },
}

/// One tool routing rule; first match in declaration order wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "match")]
    pub matcher: RouteMatch,
    pub invoke: InvokeSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

// ============================================================================
// Environment interpolation
// ============================================================================

/// Replace `${NAME}` tokens with environment variables; unresolved tokens
/// remain literal.
pub(crate) fn interpolate_env(input: &str) -> String {
    static TOKEN: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

    TOKEN
        .replace_all(input, |caps: &regex::Captures<'_>| {
            match std::env::var(&caps[1]) {
                Ok(value) => value,
                Err(_) => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn interpolate_endpoint(endpoint: &mut EndpointConfig) {
    for value in endpoint.headers.values_mut() {
        *value = interpolate_env(value);
    }
    if let Some(headers) = endpoint.stream_headers.as_mut() {
        for value in headers.values_mut() {
            *value = interpolate_env(value);
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

type ManifestCache<T> = Mutex<Option<Arc<HashMap<String, Arc<T>>>>>;

/// Lazy catalog of on-disk artifacts plus the compiled-in compat registry.
///
/// Created once per coordinator instantiation; caches persist for the
/// registry lifetime.
pub struct PluginRegistry {
    root: PathBuf,
    overlay: Option<PathBuf>,
    compats: CompatRegistry,
    providers: ManifestCache<ProviderManifest>,
    tools: ManifestCache<ToolManifest>,
    mcp_servers: ManifestCache<McpServerManifest>,
    vector_stores: ManifestCache<VectorStoreManifest>,
    embedding_providers: ManifestCache<EmbeddingProviderManifest>,
    routes: Mutex<Option<Arc<Vec<RouteManifest>>>>,
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("root", &self.root)
            .field("overlay", &self.overlay)
            .finish_non_exhaustive()
    }
}

impl PluginRegistry {
    /// Open the registry rooted at `root`.
    ///
    /// Fails with a manifest error if the root directory is missing;
    /// individual category directories may be absent (their categories are
    /// simply empty).
    pub fn new(root: impl Into<PathBuf>) -> CoordResult<Self> {
        Self::with_overlay(root, None::<PathBuf>)
    }

    /// Open the registry with an overlay directory scanned before the root.
    pub fn with_overlay(
        root: impl Into<PathBuf>,
        overlay: Option<impl Into<PathBuf>>,
    ) -> CoordResult<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(CoordinatorError::manifest(format!(
                "plugin root does not exist: {}",
                root.display()
            )));
        }
        Ok(Self {
            root,
            overlay: overlay.map(Into::into),
            compats: CompatRegistry::new(),
            providers: Mutex::new(None),
            tools: Mutex::new(None),
            mcp_servers: Mutex::new(None),
            vector_stores: Mutex::new(None),
            embedding_providers: Mutex::new(None),
            routes: Mutex::new(None),
        })
    }

    /// The plugin root this registry reads from.
    pub fn root(&self) -> &Path {
        &self.root
    }

    // ------------------------------------------------------------------
    // Public lookups
    // ------------------------------------------------------------------

    pub fn get_provider(&self, id: &str) -> CoordResult<Arc<ProviderManifest>> {
        self.lookup(&self.providers, "providers", "provider", id, |m| {
            interpolate_endpoint(&mut m.endpoint);
            m.id.clone()
        })
    }

    pub fn get_tool(&self, id: &str) -> CoordResult<Arc<ToolManifest>> {
        self.lookup(&self.tools, "tools", "tool", id, |m| m.id.clone())
    }

    pub fn get_tools(&self, ids: &[String]) -> CoordResult<Vec<Arc<ToolManifest>>> {
        ids.iter().map(|id| self.get_tool(id)).collect()
    }

    pub fn get_mcp_server(&self, id: &str) -> CoordResult<Arc<McpServerManifest>> {
        self.lookup(&self.mcp_servers, "mcp", "MCP server", id, |m| {
            for value in m.env.values_mut() {
                *value = interpolate_env(value);
            }
            m.id.clone()
        })
    }

    pub fn get_mcp_servers(&self, ids: &[String]) -> CoordResult<Vec<Arc<McpServerManifest>>> {
        ids.iter().map(|id| self.get_mcp_server(id)).collect()
    }

    pub fn get_vector_store(&self, id: &str) -> CoordResult<Arc<VectorStoreManifest>> {
        self.lookup(&self.vector_stores, "vector", "vector store", id, |m| {
            m.id.clone()
        })
    }

    pub fn get_embedding_provider(&self, id: &str) -> CoordResult<Arc<EmbeddingProviderManifest>> {
        self.lookup(
            &self.embedding_providers,
            "embeddings",
            "embedding provider",
            id,
            |m| {
                interpolate_endpoint(&mut m.endpoint);
                m.id.clone()
            },
        )
    }

    /// All tool routing rules, in declaration order (overlay first, then
    /// root; files sorted by name, rules in file order).
    pub fn get_process_routes(&self) -> CoordResult<Arc<Vec<RouteManifest>>> {
        let mut cache = self.routes.lock().expect("routes cache poisoned");
        if let Some(routes) = cache.as_ref() {
            return Ok(routes.clone());
        }

        let mut routes: Vec<RouteManifest> = Vec::new();
        for dir in self.category_dirs("processes") {
            for path in sorted_json_files(&dir) {
                let raw = match std::fs::read_to_string(&path) {
                    Ok(raw) => raw,
                    Err(err) => {
                        log_warn!(path = %path.display(), error = %err, "Skipping unreadable route file");
                        continue;
                    }
                };
                // A route file holds either one rule or an array of rules.
                let parsed: Result<Vec<RouteManifest>, _> = serde_json::from_str::<Value>(&raw)
                    .map_err(|e| e.to_string())
                    .and_then(|v| {
                        if v.is_array() {
                            serde_json::from_value(v).map_err(|e| e.to_string())
                        } else {
                            serde_json::from_value(v)
                                .map(|one| vec![one])
                                .map_err(|e| e.to_string())
                        }
                    });
                match parsed {
                    Ok(mut file_routes) => routes.append(&mut file_routes),
                    Err(err) => {
                        log_warn!(path = %path.display(), error = %err, "Skipping malformed route file");
                    }
                }
            }
        }

        log_debug!(count = routes.len(), "Loaded tool routing rules");
        let routes = Arc::new(routes);
        *cache = Some(routes.clone());
        Ok(routes)
    }

    /// The shared LLM compat adapter for a manifest `kind`.
    pub fn get_compat(&self, kind: &str) -> CoordResult<Arc<dyn LlmCompat>> {
        self.compats.llm(kind)
    }

    /// The shared embedding compat adapter for a manifest `kind`.
    pub fn get_embedding_compat(&self, kind: &str) -> CoordResult<Arc<dyn EmbeddingCompat>> {
        self.compats.embedding(kind)
    }

    /// A **fresh** vector-store compat instance for a manifest `kind`.
    ///
    /// Instances are not shared across manager instances, so `close` on one
    /// never disturbs another.
    pub fn get_vector_store_compat(&self, kind: &str) -> CoordResult<Box<dyn VectorStoreCompat>> {
        self.compats.vector_store(kind)
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Overlay dir (if any) first, then the root dir, for a category.
    fn category_dirs(&self, category: &str) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        if let Some(overlay) = &self.overlay {
            dirs.push(overlay.join(category));
        }
        dirs.push(self.root.join(category));
        dirs
    }

    fn lookup<T>(
        &self,
        cache: &ManifestCache<T>,
        category: &str,
        label: &str,
        id: &str,
        mut finish: impl FnMut(&mut T) -> String,
    ) -> CoordResult<Arc<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        let mut guard = cache.lock().expect("manifest cache poisoned");
        if guard.is_none() {
            let mut loaded: HashMap<String, Arc<T>> = HashMap::new();
            for dir in self.category_dirs(category) {
                for path in sorted_json_files(&dir) {
                    let raw = match std::fs::read_to_string(&path) {
                        Ok(raw) => raw,
                        Err(err) => {
                            log_warn!(path = %path.display(), error = %err, "Skipping unreadable manifest");
                            continue;
                        }
                    };
                    match serde_json::from_str::<T>(&raw) {
                        Ok(mut manifest) => {
                            let key = finish(&mut manifest);
                            if loaded.contains_key(&key) {
                                log_debug!(
                                    path = %path.display(),
                                    id = %key,
                                    "Skipping duplicate manifest (earlier declaration wins)"
                                );
                                continue;
                            }
                            loaded.insert(key, Arc::new(manifest));
                        }
                        Err(err) => {
                            log_warn!(
                                path = %path.display(),
                                error = %err,
                                "Skipping malformed manifest"
                            );
                        }
                    }
                }
            }
            log_debug!(category = category, count = loaded.len(), "Loaded manifest category");
            *guard = Some(Arc::new(loaded));
        }

        guard
            .as_ref()
            .and_then(|map| map.get(id).cloned())
            .ok_or_else(|| CoordinatorError::manifest(format!("unknown {label} id: {id}")))
    }
}

/// JSON files of a directory, sorted by file name. Non-JSON entries
/// (declaration stubs, editor droppings) are ignored; a missing directory
/// yields an empty list.
fn sorted_json_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path.extension().is_some_and(|ext| ext == "json")
                && !path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.'))
        })
        .collect();
    files.sort();
    files
}
