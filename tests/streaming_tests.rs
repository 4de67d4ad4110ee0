//! Streaming behavior over SSE: delta ordering, the single terminal done
//! event, the streaming tool loop, and the idle watchdog.

mod common;

use common::*;
use futures_util::future::BoxFuture;
use llm_coordinator::{AuthConfig, ModuleToolRegistry};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sse_body(chunks: &[Value]) -> String {
    let mut body = String::new();
    for chunk in chunks {
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

fn delta_chunk(text: &str) -> Value {
    json!({ "choices": [{ "index": 0, "delta": { "content": text } }] })
}

fn finish_chunk(reason: &str) -> Value {
    json!({
        "choices": [{ "index": 0, "delta": {}, "finish_reason": reason }],
        "usage": { "prompt_tokens": 4, "completion_tokens": 2, "total_tokens": 6 },
    })
}

fn tool_call_chunks(id: &str, name: &str, arguments: &str) -> Vec<Value> {
    vec![
        json!({ "choices": [{ "index": 0, "delta": { "tool_calls": [
            { "index": 0, "id": id, "function": { "name": name, "arguments": "" } }
        ] } }] }),
        json!({ "choices": [{ "index": 0, "delta": { "tool_calls": [
            { "index": 0, "function": { "arguments": arguments } }
        ] } }] }),
        finish_chunk("tool_calls"),
    ]
}

fn sse_template(chunks: &[Value]) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(sse_body(chunks))
}

#[tokio::test]
async fn test_stream_emits_deltas_then_exactly_one_done_last() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(sse_template(&[
            delta_chunk("Hel"),
            delta_chunk("lo"),
            finish_chunk("stop"),
        ]))
        .mount(&mock)
        .await;

    let plugins = plugin_root_with_provider(&mock.uri());
    let router = build_test_router(
        plugins.path(),
        test_config(),
        AuthConfig::disabled(),
        Arc::new(ModuleToolRegistry::new()),
    );

    let response = post_json(&router, "/stream", &minimal_spec()).await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let events = response_events(response).await;
    let deltas: Vec<&str> = events
        .iter()
        .filter(|e| e["type"] == "delta")
        .map(|e| e["text"].as_str().unwrap())
        .collect();
    assert_eq!(deltas, vec!["Hel", "lo"]);

    // Exactly one done, and it is the last event.
    let done_count = events.iter().filter(|e| e["type"] == "done").count();
    assert_eq!(done_count, 1);
    let last = events.last().unwrap();
    assert_eq!(last["type"], "done");
    assert_eq!(last["response"]["content"][0]["text"], "Hello");
    assert_eq!(last["response"]["usage"]["totalTokens"], 6);
}

#[tokio::test]
async fn test_streaming_tool_loop_emits_results_and_final_done() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(SequenceResponder::new(vec![
            sse_template(&tool_call_chunks("call_1", "echo", "{\"n\":1}")),
            sse_template(&[delta_chunk("done after tools"), finish_chunk("stop")]),
        ]))
        .mount(&mock)
        .await;

    let plugins = plugin_root_with_provider(&mock.uri());
    write_manifest(
        plugins.path(),
        "processes",
        "routes.json",
        json!({
            "match": { "type": "exact", "pattern": "echo" },
            "invoke": { "kind": "module", "path": "builtin/echo" },
        }),
    );
    let modules = Arc::new(ModuleToolRegistry::new());
    modules.register(
        "builtin/echo",
        Arc::new(
            |ctx: llm_coordinator::ToolContext| -> BoxFuture<
                'static,
                llm_coordinator::CoordResult<Value>,
            > { Box::pin(async move { Ok(json!({ "echo": ctx.args })) }) },
        ),
    );
    let router = build_test_router(plugins.path(), test_config(), AuthConfig::disabled(), modules);

    let mut spec = minimal_spec();
    spec["tools"] = json!([{ "name": "echo", "description": "", "parameters": {} }]);
    let response = post_json(&router, "/stream", &spec).await;
    let events = response_events(response).await;

    let kinds: Vec<(&str, &str)> = events
        .iter()
        .filter(|e| e["type"] == "tool")
        .map(|e| {
            (
                e["event"]["kind"].as_str().unwrap(),
                e["event"]["id"].as_str().unwrap(),
            )
        })
        .collect();
    assert!(kinds.contains(&("call_start", "call_1")));
    assert!(kinds.contains(&("call_end", "call_1")));
    assert!(kinds.contains(&("result", "call_1")));

    let last = events.last().unwrap();
    assert_eq!(last["type"], "done");
    // The done payload lists every executed tool call.
    assert_eq!(last["response"]["toolCalls"][0]["id"], "call_1");
    assert!(last["response"]["content"][0]["text"]
        .as_str()
        .unwrap()
        .contains("done after tools"));
}

#[tokio::test]
async fn test_idle_watchdog_emits_terminal_sse_error() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            sse_template(&[delta_chunk("late"), finish_chunk("stop")])
                .set_delay(Duration::from_millis(800)),
        )
        .mount(&mock)
        .await;

    let plugins = plugin_root_with_provider(&mock.uri());
    let mut config = test_config();
    config.stream_idle_timeout_ms = 100;
    let router = build_test_router(
        plugins.path(),
        config,
        AuthConfig::disabled(),
        Arc::new(ModuleToolRegistry::new()),
    );

    let response = post_json(&router, "/stream", &minimal_spec()).await;
    assert_eq!(response.status(), 200);
    let events = response_events(response).await;

    let last = events.last().unwrap();
    assert_eq!(last["type"], "error");
    assert_eq!(last["code"], "stream_idle_timeout");
}

#[tokio::test]
async fn test_stream_setup_failure_is_a_plain_error_status() {
    // Unknown provider id: fails before any SSE bytes, so the client gets
    // a regular error envelope.
    let plugins = tempfile::TempDir::new().unwrap();
    std::fs::create_dir_all(plugins.path().join("providers")).unwrap();
    let router = build_test_router(
        plugins.path(),
        test_config(),
        AuthConfig::disabled(),
        Arc::new(ModuleToolRegistry::new()),
    );

    let (status, body) = response_json(post_json(&router, "/stream", &minimal_spec()).await).await;
    assert_eq!(status, 500);
    assert_eq!(body["error"]["code"], "manifest_error");
}
