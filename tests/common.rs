//! Shared helpers for integration tests.
//!
//! Builds throwaway plugin roots, wiremock provider fakes, and routers
//! wired the way `serve` wires them, so tests exercise the same admission
//! pipeline production requests go through.

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use axum::Router;
use llm_coordinator::{
    AppState, AuthConfig, Defaults, ModuleToolRegistry, PluginRegistry, ServerConfig,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tower::util::ServiceExt;
use wiremock::{Respond, ResponseTemplate};

/// Write one manifest under a plugin-root category.
pub fn write_manifest(root: &Path, category: &str, file: &str, body: Value) {
    let dir = root.join(category);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(file), body.to_string()).unwrap();
}

/// A chat-protocol provider manifest pointing at a mock endpoint.
pub fn provider_manifest(id: &str, base_url: &str, path: &str) -> Value {
    json!({
        "id": id,
        "kind": "openai-chat",
        "endpoint": { "url": format!("{base_url}{path}") },
        "retryWords": ["rate_limit_exceeded"],
    })
}

/// Plugin root with a single chat provider `acme`.
pub fn plugin_root_with_provider(base_url: &str) -> TempDir {
    let tmp = TempDir::new().unwrap();
    write_manifest(
        tmp.path(),
        "providers",
        "acme.json",
        provider_manifest("acme", base_url, "/v1/chat/completions"),
    );
    tmp
}

/// Chat-completions success body with plain text content.
pub fn chat_text_response(text: &str) -> Value {
    json!({
        "id": "chatcmpl-test",
        "model": "acme-large",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": "stop",
        }],
        "usage": { "prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10 },
    })
}

/// Chat-completions body requesting one tool call.
pub fn chat_tool_call_response(call_id: &str, tool: &str, arguments: Value) -> Value {
    json!({
        "id": "chatcmpl-test",
        "model": "acme-large",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": call_id,
                    "type": "function",
                    "function": { "name": tool, "arguments": arguments.to_string() },
                }],
            },
            "finish_reason": "tool_calls",
        }],
        "usage": { "prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10 },
    })
}

/// Responds with a scripted sequence, repeating the last template once the
/// script runs dry.
pub struct SequenceResponder {
    responses: Mutex<VecDeque<ResponseTemplate>>,
    fallback: ResponseTemplate,
}

impl SequenceResponder {
    pub fn new(responses: Vec<ResponseTemplate>) -> Self {
        let fallback = responses
            .last()
            .cloned()
            .unwrap_or_else(|| ResponseTemplate::new(500));
        Self {
            responses: Mutex::new(responses.into()),
            fallback,
        }
    }
}

impl Respond for SequenceResponder {
    fn respond(&self, _request: &wiremock::Request) -> ResponseTemplate {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// A fast server config for tests.
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::from_defaults(&Defaults::default());
    config.request_timeout_ms = 5_000;
    config.body_read_timeout_ms = 1_000;
    config.stream_idle_timeout_ms = 2_000;
    config.queue_timeout_ms = 1_000;
    config
}

/// Router over a plugin root, with optional auth and config tweaks.
pub fn build_test_router(
    plugin_root: &Path,
    config: ServerConfig,
    auth: AuthConfig,
    modules: Arc<ModuleToolRegistry>,
) -> Router {
    let registry = Arc::new(PluginRegistry::new(plugin_root).unwrap());
    let state = AppState::new(registry, Defaults::default(), config, auth, modules);
    llm_coordinator::build_router(state)
}

/// Minimal call spec against provider `acme`.
pub fn minimal_spec() -> Value {
    json!({
        "messages": [
            { "role": "user", "content": [{ "type": "text", "text": "hi" }] }
        ],
        "llmPriority": [{ "provider": "acme", "model": "acme-large" }],
        "retryDelaysMs": [],
    })
}

/// POST a JSON body through the router.
pub async fn post_json(router: &Router, path: &str, body: &Value) -> Response<Body> {
    let request = Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    router.clone().oneshot(request).await.unwrap()
}

/// Read a JSON response body.
pub async fn response_json(response: Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

/// Read an SSE body into its decoded `data:` events.
pub async fn response_events(response: Response<Body>) -> Vec<Value> {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    String::from_utf8_lossy(&bytes)
        .split("\n\n")
        .filter_map(|frame| frame.trim().strip_prefix("data:").map(str::trim).map(str::to_string))
        .filter_map(|data| serde_json::from_str(&data).ok())
        .collect()
}
