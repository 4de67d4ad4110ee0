// Unit tests for the tool loop mechanics.
//
// UNIT UNDER TEST: tool_loop::{ToolBudget, RunState, execute_turn}
//
// BUSINESS RESPONSIBILITY:
//   - Per-run budget with synthetic results once exhausted
//   - Assistant-before-results ordering, one result per call id
//   - Countdown annotations, char clamping, record aggregation

use crate::defaults::ToolLoopDefaults;
use crate::settings::RuntimeSettings;
use crate::spec::{ContentPart, Message, Role, ToolCall, UnifiedResponse};
use crate::tool_loop::{execute_turn, prepare_final_prompt, RunState, ToolBudget};
use crate::tools::{ModuleToolRegistry, ToolInvoker};
use crate::registry::{InvokeSpec, RouteManifest, RouteMatch, RouteMatchType};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn runtime(overrides: &[(&str, serde_json::Value)]) -> RuntimeSettings {
    let bag: BTreeMap<String, serde_json::Value> = overrides
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    RuntimeSettings::resolve(&bag, &ToolLoopDefaults::default())
}

/// Invoker with an in-process echo tool routed by exact name.
fn echo_invoker() -> ToolInvoker {
    let modules = Arc::new(ModuleToolRegistry::new());
    modules.register(
        "builtin/echo",
        Arc::new(
            |ctx: crate::tools::ToolContext| -> futures_util::future::BoxFuture<
                'static,
                crate::error::CoordResult<serde_json::Value>,
            > { Box::pin(async move { Ok(json!({ "echo": ctx.args })) }) },
        ),
    );
    let routes = vec![RouteManifest {
        id: None,
        matcher: RouteMatch {
            match_type: RouteMatchType::Exact,
            pattern: "echo".to_string(),
        },
        invoke: InvokeSpec::Module {
            path: "builtin/echo".to_string(),
            function: None,
        },
        timeout_ms: Some(1_000),
    }];
    ToolInvoker::new(&routes, modules, None, Duration::from_secs(1))
}

fn tool_response(calls: Vec<ToolCall>) -> UnifiedResponse {
    UnifiedResponse {
        provider: "acme".to_string(),
        model: "acme-large".to_string(),
        role: Role::Assistant,
        content: Vec::new(),
        tool_calls: Some(calls),
        usage: None,
        reasoning: None,
        finish_reason: None,
        raw: None,
    }
}

fn call(id: &str) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: "echo".to_string(),
        arguments: json!({ "id": id }),
        metadata: None,
    }
}

#[test]
fn test_budget_consumes_down_to_zero() {
    let mut budget = ToolBudget::new(2);
    assert!(budget.consume());
    assert!(budget.consume());
    assert!(!budget.consume());
    assert!(budget.is_exhausted());
    assert_eq!(budget.remaining(), 0);
}

#[tokio::test]
async fn test_turn_appends_assistant_before_results_in_call_order() {
    let invoker = echo_invoker();
    let mut state = RunState::new(vec![Message::user("hi")], Vec::new(), None, runtime(&[]));

    let outcome = execute_turn(
        &mut state,
        &invoker,
        &tool_response(vec![call("call_1"), call("call_2")]),
        "acme",
        "acme-large",
        None,
    )
    .await
    .unwrap();

    assert!(!outcome.budget_exhausted);
    // user, assistant(with calls), tool result x2
    assert_eq!(state.messages.len(), 4);
    assert_eq!(state.messages[1].role, Role::Assistant);
    assert!(state.messages[1].has_tool_calls());
    assert_eq!(state.messages[2].tool_call_id.as_deref(), Some("call_1"));
    assert_eq!(state.messages[3].tool_call_id.as_deref(), Some("call_2"));

    // Every call id appears exactly once on each side.
    assert_eq!(state.executed_calls.len(), 2);
    assert_eq!(state.records.len(), 2);
    assert!(state.records.iter().all(|r| r.error.is_none()));
}

#[tokio::test]
async fn test_parallel_execution_preserves_result_order() {
    let invoker = echo_invoker();
    let mut state = RunState::new(
        vec![Message::user("hi")],
        Vec::new(),
        None,
        runtime(&[("parallelToolExecution", json!(true))]),
    );

    let ids = ["call_a", "call_b", "call_c"];
    execute_turn(
        &mut state,
        &invoker,
        &tool_response(ids.iter().map(|id| call(id)).collect()),
        "acme",
        "acme-large",
        None,
    )
    .await
    .unwrap();

    let result_ids: Vec<&str> = state
        .messages
        .iter()
        .filter_map(|m| m.tool_call_id.as_deref())
        .collect();
    assert_eq!(result_ids, ids);
}

#[tokio::test]
async fn test_exhausted_budget_yields_synthetic_error_result() {
    let invoker = echo_invoker();
    let mut state = RunState::new(
        vec![Message::user("hi")],
        Vec::new(),
        None,
        runtime(&[("maxToolIterations", json!(1))]),
    );

    let outcome = execute_turn(
        &mut state,
        &invoker,
        &tool_response(vec![call("call_1"), call("call_2")]),
        "acme",
        "acme-large",
        None,
    )
    .await
    .unwrap();

    assert!(outcome.budget_exhausted);
    // Both calls are answered; the second with the synthetic error.
    assert_eq!(state.records.len(), 2);
    assert!(state.records[0].error.is_none());
    assert!(state.records[1]
        .error
        .as_deref()
        .unwrap()
        .contains("budget exhausted"));
}

#[tokio::test]
async fn test_unroutable_tool_failure_stays_in_band() {
    let invoker = echo_invoker();
    let mut state = RunState::new(vec![Message::user("hi")], Vec::new(), None, runtime(&[]));

    let mut unroutable = call("call_1");
    unroutable.name = "ghost_tool".to_string();
    let outcome = execute_turn(
        &mut state,
        &invoker,
        &tool_response(vec![unroutable]),
        "acme",
        "acme-large",
        None,
    )
    .await;

    // The turn succeeds; the failure is a tool-result message.
    let outcome = outcome.unwrap();
    assert_eq!(outcome.result_events.len(), 1);
    assert!(state.records[0]
        .error
        .as_deref()
        .unwrap()
        .contains("no matching route"));
}

#[tokio::test]
async fn test_countdown_annotation_added_when_enabled() {
    let invoker = echo_invoker();
    let mut state = RunState::new(
        vec![Message::user("hi")],
        Vec::new(),
        None,
        runtime(&[
            ("toolCountdownEnabled", json!(true)),
            ("maxToolIterations", json!(5)),
        ]),
    );

    execute_turn(
        &mut state,
        &invoker,
        &tool_response(vec![call("call_1")]),
        "acme",
        "acme-large",
        None,
    )
    .await
    .unwrap();

    let text = state.messages.last().unwrap().text_content();
    assert!(text.contains("Tool call 1 of 5"), "got: {text}");
    assert!(text.contains("4 remaining"), "got: {text}");
}

#[tokio::test]
async fn test_result_text_clamped_but_structured_result_untouched() {
    let invoker = echo_invoker();
    let mut state = RunState::new(
        vec![Message::user("hi")],
        Vec::new(),
        None,
        runtime(&[("toolResultMaxChars", json!(10))]),
    );

    let mut big = call("call_1");
    big.arguments = json!({ "blob": "a".repeat(200) });
    execute_turn(
        &mut state,
        &invoker,
        &tool_response(vec![big]),
        "acme",
        "acme-large",
        None,
    )
    .await
    .unwrap();

    let tool_message = state.messages.last().unwrap();
    let text = tool_message.text_content();
    assert!(text.chars().count() <= 11, "clamped with sentinel: {text}");
    assert!(text.ends_with('…'));

    // The structured part keeps the full payload.
    let structured = tool_message
        .content
        .iter()
        .find_map(|p| match p {
            ContentPart::ToolResult { result, .. } => Some(result),
            _ => None,
        })
        .unwrap();
    assert_eq!(
        structured["echo"]["blob"].as_str().unwrap().len(),
        200
    );
}

#[tokio::test]
async fn test_object_result_with_text_field_drives_message_content() {
    // Tools that return { "text": ..., ... } (vector_search does) put the
    // text field on the wire; the full payload stays in the structured part.
    let modules = Arc::new(ModuleToolRegistry::new());
    modules.register(
        "builtin/report",
        Arc::new(
            |_ctx: crate::tools::ToolContext| -> futures_util::future::BoxFuture<
                'static,
                crate::error::CoordResult<serde_json::Value>,
            > {
                Box::pin(async move {
                    Ok(json!({ "text": "three rows found", "rows": [1, 2, 3] }))
                })
            },
        ),
    );
    let routes = vec![RouteManifest {
        id: None,
        matcher: RouteMatch {
            match_type: RouteMatchType::Exact,
            pattern: "report".to_string(),
        },
        invoke: InvokeSpec::Module {
            path: "builtin/report".to_string(),
            function: None,
        },
        timeout_ms: Some(1_000),
    }];
    let invoker = ToolInvoker::new(&routes, modules, None, Duration::from_secs(1));

    let mut state = RunState::new(vec![Message::user("hi")], Vec::new(), None, runtime(&[]));
    let mut report_call = call("call_1");
    report_call.name = "report".to_string();
    execute_turn(
        &mut state,
        &invoker,
        &tool_response(vec![report_call]),
        "acme",
        "acme-large",
        None,
    )
    .await
    .unwrap();

    let tool_message = state.messages.last().unwrap();
    assert_eq!(tool_message.text_content(), "three rows found");

    let structured = tool_message
        .content
        .iter()
        .find_map(|p| match p {
            ContentPart::ToolResult { result, .. } => Some(result),
            _ => None,
        })
        .unwrap();
    assert_eq!(structured["rows"], json!([1, 2, 3]));
    assert_eq!(structured["text"], json!("three rows found"));
}

#[tokio::test]
async fn test_final_prompt_zeroes_tools_and_choice() {
    let mut state = RunState::new(
        vec![Message::user("hi")],
        vec![crate::spec::Tool {
            name: "echo".to_string(),
            description: String::new(),
            parameters: json!({}),
        }],
        None,
        runtime(&[]),
    );

    prepare_final_prompt(&mut state);

    assert!(state.tools.is_empty());
    assert_eq!(state.tool_choice, Some(crate::spec::ToolChoice::none()));
    assert_eq!(state.messages.last().unwrap().role, Role::User);
}

#[tokio::test]
async fn test_finalize_response_attaches_records_and_usage() {
    let invoker = echo_invoker();
    let mut state = RunState::new(vec![Message::user("hi")], Vec::new(), None, runtime(&[]));
    execute_turn(
        &mut state,
        &invoker,
        &tool_response(vec![call("call_1")]),
        "acme",
        "acme-large",
        None,
    )
    .await
    .unwrap();
    state.add_usage(&crate::spec::Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    });

    let final_response = state.finalize_response(UnifiedResponse {
        provider: "acme".to_string(),
        model: "acme-large".to_string(),
        role: Role::Assistant,
        content: vec![ContentPart::text("done")],
        tool_calls: None,
        usage: None,
        reasoning: None,
        finish_reason: None,
        raw: None,
    });

    assert_eq!(final_response.tool_calls.as_ref().unwrap().len(), 1);
    let raw = final_response.raw.unwrap();
    assert_eq!(raw["toolResults"].as_array().unwrap().len(), 1);
    assert_eq!(final_response.usage.unwrap().total_tokens, 15);
}
