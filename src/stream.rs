//! Stream coordination: provider chunks in, unified events out.
//!
//! [`StreamAssembly`] folds parsed chunks into the run's accumulating state
//! (text, per-call-id tool assembly, reasoning, usage) while forwarding the
//! observable events. The streaming tool loop itself is driven by the
//! coordinator; this module owns the per-stream mechanics.

use serde_json::Value;
use std::pin::Pin;
use tokio::sync::mpsc;

use futures_util::StreamExt;

use crate::compat::{StreamChunk, StreamParser};
use crate::error::{CoordResult, CoordinatorError};
use crate::logging::log_debug;
use crate::manager::RawChunkStream;
use crate::settings::merge_objects;
use crate::spec::{
    FinishReason, Reasoning, StreamEvent, ToolCall, ToolEvent, Usage,
};

/// The async sequence of events one streamed run produces.
pub type EventStream = Pin<Box<dyn futures_util::Stream<Item = StreamEvent> + Send>>;

/// Capacity of the bounded event channel between the run task and the
/// consumer; backpressure suspends the producer.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Sender half handed to the run task.
pub type EventSender = mpsc::Sender<StreamEvent>;

/// Per-call-id assembly state: pending → args-accumulating → ended.
#[derive(Debug, Clone)]
struct PendingCall {
    id: String,
    name: Option<String>,
    arguments_buffer: String,
    metadata: Option<Value>,
    ended: bool,
    /// Assembled arguments once ended
    arguments: Option<Value>,
}

/// Accumulated state of one provider stream (one turn).
#[derive(Debug, Default)]
pub struct StreamAssembly {
    pub text: String,
    calls: Vec<PendingCall>,
    pub reasoning: Option<Reasoning>,
    pub usage: Option<Usage>,
    pub finish_reason: Option<FinishReason>,
    finished_with_tool_calls: bool,
}

impl StreamAssembly {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one parsed chunk in, sending observable events to `events`.
    ///
    /// Returns `false` when the consumer is gone and the producer should
    /// stop.
    pub async fn apply(&mut self, chunk: StreamChunk, events: &EventSender) -> bool {
        if let Some(text) = chunk.text {
            self.text.push_str(&text);
            if events.send(StreamEvent::Delta { text }).await.is_err() {
                return false;
            }
        }

        if let Some(delta) = chunk.reasoning {
            self.aggregate_reasoning(delta);
        }

        if let Some(usage) = chunk.usage {
            // Last writer wins within one stream.
            self.usage = Some(usage.clone());
            if events.send(StreamEvent::Token { usage }).await.is_err() {
                return false;
            }
        }

        for event in chunk.tool_events {
            self.apply_tool_event(&event);
            if events.send(StreamEvent::Tool { event }).await.is_err() {
                return false;
            }
        }

        if chunk.finished_with_tool_calls {
            self.finished_with_tool_calls = true;
        }
        if let Some(reason) = chunk.finish_reason {
            self.finish_reason = Some(reason);
        }
        true
    }

    fn apply_tool_event(&mut self, event: &ToolEvent) {
        match event {
            ToolEvent::CallStart { id, name, metadata } => {
                if !self.calls.iter().any(|c| c.id == *id) {
                    self.calls.push(PendingCall {
                        id: id.clone(),
                        name: name.clone(),
                        arguments_buffer: String::new(),
                        metadata: metadata.clone(),
                        ended: false,
                        arguments: None,
                    });
                }
            }
            ToolEvent::ArgsDelta { id, delta } => {
                if let Some(call) = self.calls.iter_mut().find(|c| c.id == *id) {
                    call.arguments_buffer.push_str(delta);
                }
            }
            ToolEvent::CallEnd {
                id,
                name,
                arguments,
                metadata,
            } => {
                match self.calls.iter_mut().find(|c| c.id == *id) {
                    Some(call) => {
                        call.name = Some(name.clone());
                        call.arguments = Some(arguments.clone());
                        // Metadata captured at start survives an end event
                        // that carries none.
                        if metadata.is_some() {
                            call.metadata = metadata.clone();
                        }
                        call.ended = true;
                    }
                    None => self.calls.push(PendingCall {
                        id: id.clone(),
                        name: Some(name.clone()),
                        arguments_buffer: String::new(),
                        metadata: metadata.clone(),
                        ended: true,
                        arguments: Some(arguments.clone()),
                    }),
                }
            }
            ToolEvent::Result { .. } => {}
        }
    }

    /// Concatenate reasoning text; shallow-merge metadata.
    fn aggregate_reasoning(&mut self, delta: Reasoning) {
        let entry = self.reasoning.get_or_insert_with(Reasoning::default);
        entry.text.push_str(&delta.text);
        if let Some(Value::Object(incoming)) = delta.metadata {
            match &mut entry.metadata {
                Some(Value::Object(existing)) => merge_objects(existing, &incoming),
                _ => entry.metadata = Some(Value::Object(incoming)),
            }
        }
    }

    /// Close any still-pending calls (their `metadata` preserved) and emit
    /// the synthesized end events. Called when the provider signaled
    /// tool-call completion without paired ends.
    pub async fn finalize_pending(&mut self, events: &EventSender) -> bool {
        for call in &mut self.calls {
            if call.ended {
                continue;
            }
            let arguments: Value = if call.arguments_buffer.is_empty() {
                Value::Object(serde_json::Map::new())
            } else {
                serde_json::from_str(&call.arguments_buffer)
                    .unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
            };
            call.arguments = Some(arguments.clone());
            call.ended = true;
            let event = ToolEvent::CallEnd {
                id: call.id.clone(),
                name: call.name.clone().unwrap_or_default(),
                arguments,
                metadata: call.metadata.clone(),
            };
            if events.send(StreamEvent::Tool { event }).await.is_err() {
                return false;
            }
        }
        true
    }

    /// Whether this turn ended wanting tool execution.
    pub fn wants_tools(&self) -> bool {
        self.finished_with_tool_calls || self.calls.iter().any(|c| c.ended)
    }

    /// The turn's assembled tool calls, metadata intact.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.calls
            .iter()
            .filter(|c| c.ended)
            .map(|c| ToolCall {
                id: c.id.clone(),
                name: c.name.clone().unwrap_or_default(),
                arguments: c
                    .arguments
                    .clone()
                    .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
                metadata: c.metadata.clone(),
            })
            .collect()
    }
}

/// Pump one raw provider stream through its parser into `assembly`.
///
/// Stops on the terminal chunk, on upstream error, or when the consumer is
/// gone (send failure), in which case the raw stream is dropped and its
/// connection finalized.
pub async fn pump_stream(
    mut raw: RawChunkStream,
    parser: &mut dyn StreamParser,
    assembly: &mut StreamAssembly,
    events: &EventSender,
) -> CoordResult<()> {
    while let Some(chunk) = raw.next().await {
        let chunk = chunk?;
        let parsed = match parser.parse_chunk(&chunk) {
            Ok(parsed) => parsed,
            Err(err) => {
                log_debug!(error = %err, "Skipping unparseable stream chunk");
                continue;
            }
        };
        let terminal = parsed.terminal;
        let wants_finalize = parsed.finished_with_tool_calls;
        if !assembly.apply(parsed, events).await {
            return Err(CoordinatorError::ClientAborted);
        }
        if wants_finalize && !assembly.finalize_pending(events).await {
            return Err(CoordinatorError::ClientAborted);
        }
        if terminal {
            break;
        }
    }
    Ok(())
}
