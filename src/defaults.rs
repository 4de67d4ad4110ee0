//! Configuration defaults for every knob.
//!
//! A `configs/defaults.json` next to the plugin root overrides the
//! compiled-in values field by field; a missing or partial file is fine.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::logging::{log_debug, log_warn};
use crate::settings::KeepPolicy;

/// Retry behavior for rate-limited provider calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryDefaults {
    /// Sleep sequence between rate-limited attempts; exhaustion fails the
    /// attempt with a rate-limit error.
    pub delays_ms: Vec<u64>,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            delays_ms: vec![1_000, 2_000, 4_000],
        }
    }
}

/// Tool loop and invocation knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolLoopDefaults {
    pub tool_countdown_enabled: bool,
    pub tool_final_prompt_enabled: bool,
    pub max_tool_iterations: u32,
    pub preserve_tool_results: KeepPolicy,
    pub preserve_reasoning: KeepPolicy,
    pub parallel_tool_execution: bool,
    /// 0 disables result-text clamping
    pub tool_result_max_chars: usize,
    /// Per-invocation timeout when a route declares none
    pub tool_timeout_ms: u64,
    /// Per-call timeout for subprocess tool servers
    pub mcp_call_timeout_ms: u64,
}

impl Default for ToolLoopDefaults {
    fn default() -> Self {
        Self {
            tool_countdown_enabled: false,
            tool_final_prompt_enabled: true,
            max_tool_iterations: 10,
            preserve_tool_results: KeepPolicy::ALL,
            preserve_reasoning: KeepPolicy::ALL,
            parallel_tool_execution: false,
            tool_result_max_chars: 0,
            tool_timeout_ms: 60_000,
            mcp_call_timeout_ms: 30_000,
        }
    }
}

/// Vector retrieval defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VectorDefaults {
    pub top_k: usize,
    pub score_threshold: f64,
    /// Per-result line used when the config supplies no `resultFormat`
    pub result_format: String,
    /// Trailing messages used for query construction; 0 = all
    pub query_messages_to_include: usize,
}

impl Default for VectorDefaults {
    fn default() -> Self {
        Self {
            top_k: 5,
            score_threshold: 0.0,
            result_format: "- {{payload.text}} (score: {{score}})".to_string(),
            query_messages_to_include: 4,
        }
    }
}

/// HTTP/SSE server knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerDefaults {
    pub host: String,
    pub port: u16,
    pub max_request_bytes: usize,
    pub body_read_timeout_ms: u64,
    /// 0 disables the total deadline
    pub request_timeout_ms: u64,
    pub stream_idle_timeout_ms: u64,
    /// Per-route concurrency cap; `null` in JSON means unlimited
    pub max_concurrent: Option<usize>,
    pub max_queue_size: usize,
    pub queue_timeout_ms: u64,
    pub requests_per_minute: u32,
    pub burst: u32,
    pub trust_proxy_headers: bool,
    pub security_headers_enabled: bool,
    /// CORS allowlist; `*` matches any origin
    pub cors_origins: Vec<String>,
}

impl Default for ServerDefaults {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_request_bytes: 1_048_576,
            body_read_timeout_ms: 10_000,
            request_timeout_ms: 120_000,
            stream_idle_timeout_ms: 60_000,
            max_concurrent: Some(8),
            max_queue_size: 32,
            queue_timeout_ms: 10_000,
            requests_per_minute: 120,
            burst: 20,
            trust_proxy_headers: false,
            security_headers_enabled: true,
            cors_origins: vec!["*".to_string()],
        }
    }
}

/// Filesystem layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PathDefaults {
    pub plugins: String,
}

impl Default for PathDefaults {
    fn default() -> Self {
        Self {
            plugins: "./plugins".to_string(),
        }
    }
}

/// The resolved defaults for every knob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Defaults {
    pub retry: RetryDefaults,
    pub tools: ToolLoopDefaults,
    pub vector: VectorDefaults,
    pub server: ServerDefaults,
    pub paths: PathDefaults,
}

impl Defaults {
    /// Load defaults from `configs/defaults.json` under `config_dir`,
    /// falling back to the compiled-in values when the file is missing and
    /// skipping it with a warning when it is malformed.
    pub fn load(config_dir: &Path) -> Self {
        let path = config_dir.join("defaults.json");
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Defaults>(&raw) {
                Ok(defaults) => {
                    log_debug!(path = %path.display(), "Loaded configuration defaults");
                    defaults
                }
                Err(err) => {
                    log_warn!(
                        path = %path.display(),
                        error = %err,
                        "Malformed defaults file, using compiled-in defaults"
                    );
                    Defaults::default()
                }
            },
            Err(_) => Defaults::default(),
        }
    }
}
