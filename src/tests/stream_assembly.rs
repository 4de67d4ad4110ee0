// Unit tests for stream assembly.
//
// UNIT UNDER TEST: stream::StreamAssembly
//
// BUSINESS RESPONSIBILITY:
//   - Fold chunks into text / tool-call / reasoning / usage state while
//     forwarding events
//   - Per-call-id state machine with metadata preserved through
//     finalization of unpaired calls
//   - Last-writer-wins usage, concatenated reasoning with shallow-merged
//     metadata

use crate::compat::StreamChunk;
use crate::spec::{Reasoning, StreamEvent, ToolEvent, Usage};
use crate::stream::StreamAssembly;
use serde_json::json;
use tokio::sync::mpsc;

fn chunk() -> StreamChunk {
    StreamChunk::default()
}

async fn drain(rx: &mut mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_text_deltas_accumulate_and_forward() {
    let (tx, mut rx) = mpsc::channel(16);
    let mut assembly = StreamAssembly::new();

    for text in ["Hel", "lo"] {
        let mut c = chunk();
        c.text = Some(text.to_string());
        assert!(assembly.apply(c, &tx).await);
    }

    assert_eq!(assembly.text, "Hello");
    let events = drain(&mut rx).await;
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], StreamEvent::Delta { text } if text == "Hel"));
}

#[tokio::test]
async fn test_usage_is_last_writer_wins() {
    let (tx, _rx) = mpsc::channel(16);
    let mut assembly = StreamAssembly::new();

    for total in [10, 25] {
        let mut c = chunk();
        c.usage = Some(Usage {
            prompt_tokens: 5,
            completion_tokens: total - 5,
            total_tokens: total,
        });
        assembly.apply(c, &tx).await;
    }

    assert_eq!(assembly.usage.as_ref().unwrap().total_tokens, 25);
}

#[tokio::test]
async fn test_reasoning_concatenates_and_merges_metadata() {
    let (tx, _rx) = mpsc::channel(16);
    let mut assembly = StreamAssembly::new();

    let mut first = chunk();
    first.reasoning = Some(Reasoning {
        text: "step one. ".to_string(),
        metadata: Some(json!({ "a": 1 })),
    });
    let mut second = chunk();
    second.reasoning = Some(Reasoning {
        text: "step two.".to_string(),
        metadata: Some(json!({ "b": 2 })),
    });
    assembly.apply(first, &tx).await;
    assembly.apply(second, &tx).await;

    let reasoning = assembly.reasoning.as_ref().unwrap();
    assert_eq!(reasoning.text, "step one. step two.");
    assert_eq!(reasoning.metadata, Some(json!({ "a": 1, "b": 2 })));
}

#[tokio::test]
async fn test_paired_call_assembles_arguments() {
    let (tx, _rx) = mpsc::channel(16);
    let mut assembly = StreamAssembly::new();

    let mut c = chunk();
    c.tool_events = vec![
        ToolEvent::CallStart {
            id: "call_1".to_string(),
            name: Some("lookup".to_string()),
            metadata: None,
        },
        ToolEvent::ArgsDelta {
            id: "call_1".to_string(),
            delta: "{\"q\":".to_string(),
        },
        ToolEvent::ArgsDelta {
            id: "call_1".to_string(),
            delta: "\"x\"}".to_string(),
        },
        ToolEvent::CallEnd {
            id: "call_1".to_string(),
            name: "lookup".to_string(),
            arguments: json!({ "q": "x" }),
            metadata: None,
        },
    ];
    assembly.apply(c, &tx).await;

    let calls = assembly.tool_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].arguments, json!({ "q": "x" }));
    assert!(assembly.wants_tools());
}

#[tokio::test]
async fn test_unpaired_call_finalizes_with_preserved_metadata() {
    // A provider that signals completion without end events: the start
    // event's opaque metadata must survive into the assembled call.
    let (tx, mut rx) = mpsc::channel(16);
    let mut assembly = StreamAssembly::new();

    let mut c = chunk();
    c.tool_events = vec![
        ToolEvent::CallStart {
            id: "call_1".to_string(),
            name: Some("lookup".to_string()),
            metadata: Some(json!({ "thoughtSignature": "X" })),
        },
        ToolEvent::ArgsDelta {
            id: "call_1".to_string(),
            delta: "{\"q\":\"x\"}".to_string(),
        },
    ];
    c.finished_with_tool_calls = true;
    assembly.apply(c, &tx).await;
    assert!(assembly.finalize_pending(&tx).await);

    let calls = assembly.tool_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].name, "lookup");
    assert_eq!(calls[0].arguments, json!({ "q": "x" }));
    assert_eq!(calls[0].metadata, Some(json!({ "thoughtSignature": "X" })));

    // The synthesized end event also carries the metadata.
    let events = drain(&mut rx).await;
    let end = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::Tool {
                event: ToolEvent::CallEnd { metadata, .. },
            } => Some(metadata.clone()),
            _ => None,
        })
        .expect("a call_end event");
    assert_eq!(end, Some(json!({ "thoughtSignature": "X" })));
}

#[tokio::test]
async fn test_finalize_is_idempotent() {
    let (tx, _rx) = mpsc::channel(16);
    let mut assembly = StreamAssembly::new();

    let mut c = chunk();
    c.tool_events = vec![ToolEvent::CallStart {
        id: "call_1".to_string(),
        name: Some("lookup".to_string()),
        metadata: None,
    }];
    assembly.apply(c, &tx).await;

    assembly.finalize_pending(&tx).await;
    assembly.finalize_pending(&tx).await;
    assert_eq!(assembly.tool_calls().len(), 1);
}
