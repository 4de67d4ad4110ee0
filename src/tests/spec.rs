// Unit tests for the call spec data model.
//
// UNIT UNDER TEST: spec::CallSpec and the stream-event vocabulary
//
// BUSINESS RESPONSIBILITY:
//   - Reject malformed specs (empty priority, unknown root keys, orphaned
//     tool messages) while letting unknown settings keys flow to extras
//   - Round-trip the tagged content-part and stream-event encodings

use crate::spec::{
    CallSpec, ContentPart, Message, Role, StreamEvent, ToolCall, ToolEvent,
};
use serde_json::json;

fn minimal_spec() -> serde_json::Value {
    json!({
        "messages": [
            { "role": "user", "content": [{ "type": "text", "text": "hi" }] }
        ],
        "llmPriority": [{ "provider": "acme", "model": "acme-large" }],
    })
}

#[test]
fn test_minimal_spec_parses_and_validates() {
    let spec: CallSpec = serde_json::from_value(minimal_spec()).unwrap();
    spec.validate().unwrap();
    assert_eq!(spec.messages.len(), 1);
    assert_eq!(spec.llm_priority[0].provider, "acme");
}

#[test]
fn test_empty_priority_fails_validation() {
    let mut raw = minimal_spec();
    raw["llmPriority"] = json!([]);
    let spec: CallSpec = serde_json::from_value(raw).unwrap();
    assert!(spec.validate().is_err());
}

#[test]
fn test_unknown_root_keys_are_rejected() {
    let mut raw = minimal_spec();
    raw["surprise"] = json!(true);
    assert!(serde_json::from_value::<CallSpec>(raw).is_err());
}

#[test]
fn test_unknown_settings_keys_are_preserved() {
    let mut raw = minimal_spec();
    raw["settings"] = json!({ "temperature": 0.1, "vendorKnob": { "x": 1 } });
    let spec: CallSpec = serde_json::from_value(raw).unwrap();
    assert_eq!(spec.settings["vendorKnob"], json!({ "x": 1 }));
}

#[test]
fn test_tool_message_requires_known_call_id() {
    let mut raw = minimal_spec();
    raw["messages"] = json!([
        { "role": "user", "content": [{ "type": "text", "text": "hi" }] },
        {
            "role": "tool",
            "toolCallId": "call_unseen",
            "content": [{ "type": "text", "text": "result" }]
        }
    ]);
    let spec: CallSpec = serde_json::from_value(raw).unwrap();
    assert!(spec.validate().is_err());
}

#[test]
fn test_tool_message_referencing_prior_call_is_valid() {
    let mut raw = minimal_spec();
    raw["messages"] = json!([
        { "role": "user", "content": [{ "type": "text", "text": "hi" }] },
        {
            "role": "assistant",
            "content": [],
            "toolCalls": [{ "id": "call_1", "name": "lookup", "arguments": {} }]
        },
        {
            "role": "tool",
            "toolCallId": "call_1",
            "content": [{ "type": "text", "text": "result" }]
        }
    ]);
    let spec: CallSpec = serde_json::from_value(raw).unwrap();
    spec.validate().unwrap();
}

#[test]
fn test_tool_call_metadata_round_trips() {
    let call = ToolCall {
        id: "call_1".to_string(),
        name: "lookup".to_string(),
        arguments: json!({ "q": "x" }),
        metadata: Some(json!({ "thoughtSignature": "sig" })),
    };
    let encoded = serde_json::to_value(&call).unwrap();
    let decoded: ToolCall = serde_json::from_value(encoded).unwrap();
    assert_eq!(decoded, call);
}

#[test]
fn test_message_text_content_joins_text_parts_only() {
    let message = Message {
        role: Role::Assistant,
        content: vec![
            ContentPart::text("a"),
            ContentPart::image("http://img"),
            ContentPart::text("b"),
        ],
        tool_calls: None,
        tool_call_id: None,
        reasoning: None,
    };
    assert_eq!(message.text_content(), "ab");
}

#[test]
fn test_stream_event_wire_shape() {
    let delta = serde_json::to_value(StreamEvent::Delta {
        text: "hi".to_string(),
    })
    .unwrap();
    assert_eq!(delta, json!({ "type": "delta", "text": "hi" }));

    let tool = serde_json::to_value(StreamEvent::Tool {
        event: ToolEvent::ArgsDelta {
            id: "call_1".to_string(),
            delta: "{\"q\"".to_string(),
        },
    })
    .unwrap();
    assert_eq!(tool["type"], "tool");
    assert_eq!(tool["event"]["kind"], "args_delta");

    let error = serde_json::to_value(StreamEvent::Error {
        message: "boom".to_string(),
        code: "provider_error".to_string(),
    })
    .unwrap();
    assert_eq!(error["type"], "error");
}

#[test]
fn test_document_source_tagging() {
    let part: ContentPart = serde_json::from_value(json!({
        "type": "document",
        "source": { "type": "path", "path": "/tmp/a.pdf" },
        "mimeType": "application/pdf",
        "filename": "a.pdf",
    }))
    .unwrap();
    match part {
        ContentPart::Document { source, .. } => {
            assert_eq!(
                source,
                crate::spec::DocumentSource::Path {
                    path: "/tmp/a.pdf".to_string()
                }
            );
        }
        other => panic!("expected document, got {other:?}"),
    }
}
