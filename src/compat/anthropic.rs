//! Anthropic Messages-API compat adapter (manifest kind
//! `anthropic-messages`).
//!
//! The Messages API differs from the chat-completions shape in three ways
//! this adapter absorbs: the system prompt is a top-level field, tool
//! results travel as user-role content blocks, and reasoning arrives as
//! signed thinking blocks whose signatures must round-trip.

use serde::Deserialize;
use serde_json::{json, Value};

use super::openai::{base64_encode, mime_from_path};
use super::{LlmCompat, StreamChunk, StreamParser};
use crate::error::{CoordResult, CoordinatorError};
use crate::settings::ProviderSettings;
use crate::spec::{
    ContentPart, DocumentSource, FinishReason, Message, Reasoning, Role, Tool, ToolCall,
    ToolChoice, ToolChoiceMode, ToolEvent, UnifiedResponse, Usage,
};

/// Manifest kind served by this adapter.
pub const KIND: &str = "anthropic-messages";

/// The API requires max_tokens; applied when the settings carry none.
const DEFAULT_MAX_TOKENS: u64 = 4096;

// ============================================================================
// Wire structures
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
struct WireResponse {
    #[serde(default)]
    model: Option<String>,
    content: Vec<WireBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum WireBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(rename = "thinking")]
    Thinking {
        thinking: String,
        #[serde(default)]
        signature: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

impl From<WireUsage> for Usage {
    fn from(usage: WireUsage) -> Self {
        Self {
            prompt_tokens: usage.input_tokens,
            completion_tokens: usage.output_tokens,
            total_tokens: usage.input_tokens + usage.output_tokens,
        }
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// Anthropic Messages adapter
#[derive(Debug, Default)]
pub struct AnthropicMessagesCompat;

impl AnthropicMessagesCompat {
    pub fn new() -> Self {
        Self
    }

    /// Convert the unified history to the Messages shape: system messages
    /// lift into the top-level system field, tool results become user-role
    /// tool_result blocks.
    fn convert_messages(&self, messages: &[Message]) -> CoordResult<(Option<String>, Vec<Value>)> {
        let mut system_parts: Vec<String> = Vec::new();
        let mut wire: Vec<Value> = Vec::new();

        for message in messages {
            match message.role {
                Role::System => {
                    system_parts.push(message.text_content());
                }
                Role::Tool => {
                    let tool_use_id = message.tool_call_id.clone().ok_or_else(|| {
                        CoordinatorError::validation("tool message without toolCallId")
                    })?;
                    wire.push(json!({
                        "role": "user",
                        "content": [{
                            "type": "tool_result",
                            "tool_use_id": tool_use_id,
                            "content": message.text_content(),
                        }],
                    }));
                }
                Role::User | Role::Assistant => {
                    let role = if message.role == Role::User {
                        "user"
                    } else {
                        "assistant"
                    };
                    let mut blocks = Vec::new();
                    if let Some(reasoning) = &message.reasoning {
                        blocks.push(thinking_block(reasoning));
                    }
                    for part in &message.content {
                        blocks.push(self.convert_part(part)?);
                    }
                    for call in message.tool_calls.as_deref().unwrap_or_default() {
                        blocks.push(tool_use_block(call));
                    }
                    if blocks.is_empty() {
                        continue;
                    }
                    wire.push(json!({ "role": role, "content": blocks }));
                }
            }
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };
        Ok((system, wire))
    }

    fn convert_part(&self, part: &ContentPart) -> CoordResult<Value> {
        match part {
            ContentPart::Text { text } => Ok(json!({ "type": "text", "text": text })),
            ContentPart::Image { url, .. } => {
                if let Some(data) = url.strip_prefix("data:") {
                    // data:<mime>;base64,<payload>
                    let (mime, payload) = data
                        .split_once(";base64,")
                        .ok_or_else(|| CoordinatorError::validation("unsupported image data URL"))?;
                    Ok(json!({
                        "type": "image",
                        "source": { "type": "base64", "media_type": mime, "data": payload },
                    }))
                } else {
                    Ok(json!({
                        "type": "image",
                        "source": { "type": "url", "url": url },
                    }))
                }
            }
            ContentPart::Document {
                source, mime_type, ..
            } => self.convert_document(source, mime_type.as_deref()),
            ContentPart::ToolResult { tool_name, result } => Ok(json!({
                "type": "text",
                "text": format!("[{tool_name} result] {result}"),
            })),
        }
    }

    fn convert_document(
        &self,
        source: &DocumentSource,
        mime_type: Option<&str>,
    ) -> CoordResult<Value> {
        match source {
            DocumentSource::Url { url } => Ok(json!({
                "type": "document",
                "source": { "type": "url", "url": url },
            })),
            DocumentSource::ProviderId { id } => Ok(json!({
                "type": "document",
                "source": { "type": "file", "file_id": id },
            })),
            DocumentSource::Base64 { data } => Ok(json!({
                "type": "document",
                "source": {
                    "type": "base64",
                    "media_type": mime_type.unwrap_or("application/pdf"),
                    "data": data,
                },
            })),
            DocumentSource::Path { path } => {
                let bytes = std::fs::read(path).map_err(|err| {
                    CoordinatorError::validation(format!("cannot read document {path}: {err}"))
                })?;
                Ok(json!({
                    "type": "document",
                    "source": {
                        "type": "base64",
                        "media_type": mime_type.unwrap_or_else(|| mime_from_path(path)),
                        "data": base64_encode(&bytes),
                    },
                }))
            }
        }
    }

    fn map_stop_reason(reason: &str) -> FinishReason {
        match reason {
            "end_turn" | "stop_sequence" => FinishReason::Stop,
            "max_tokens" => FinishReason::Length,
            "tool_use" => FinishReason::ToolCalls,
            "refusal" => FinishReason::ContentFilter,
            _ => FinishReason::Other,
        }
    }
}

/// An assistant reasoning trace replays as a thinking block, signature
/// included (providers reject unsigned replayed thinking).
fn thinking_block(reasoning: &Reasoning) -> Value {
    let signature = reasoning
        .metadata
        .as_ref()
        .and_then(|m| m.get("signature"))
        .cloned();
    let mut block = json!({ "type": "thinking", "thinking": reasoning.text });
    if let Some(signature) = signature {
        block["signature"] = signature;
    }
    block
}

/// Tool-call metadata merges into the tool_use block so opaque provider
/// state survives the round trip verbatim.
fn tool_use_block(call: &ToolCall) -> Value {
    let mut block = json!({
        "type": "tool_use",
        "id": call.id,
        "name": call.name,
        "input": call.arguments,
    });
    if let (Some(Value::Object(meta)), Some(obj)) = (&call.metadata, block.as_object_mut()) {
        for (key, value) in meta {
            obj.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    block
}

impl LlmCompat for AnthropicMessagesCompat {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn build_payload(
        &self,
        model: &str,
        settings: &ProviderSettings,
        messages: &[Message],
        tools: &[Tool],
        tool_choice: Option<&ToolChoice>,
    ) -> CoordResult<Value> {
        let (system, wire_messages) = self.convert_messages(messages)?;

        let mut payload = json!({
            "model": model,
            "max_tokens": settings.max_tokens().unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": wire_messages,
        });
        let map = payload.as_object_mut().expect("payload is an object");

        if let Some(system) = system {
            map.insert("system".to_string(), Value::String(system));
        }
        if let Some(temperature) = settings.temperature() {
            map.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = settings.top_p() {
            map.insert("top_p".to_string(), json!(top_p));
        }
        if let Some(stop) = settings.stop() {
            let sequences = match stop {
                Value::String(s) => json!([s]),
                other => other.clone(),
            };
            map.insert("stop_sequences".to_string(), sequences);
        }
        if let Some(budget) = settings.reasoning_budget() {
            map.insert(
                "thinking".to_string(),
                json!({ "type": "enabled", "budget_tokens": budget }),
            );
        } else if let Some(reasoning) = settings.reasoning() {
            map.insert("thinking".to_string(), reasoning.clone());
        }

        if !tools.is_empty() {
            map.insert("tools".to_string(), self.serialize_tools(tools));
        }
        if let Some(choice) = tool_choice {
            map.insert("tool_choice".to_string(), self.serialize_tool_choice(choice));
        }

        Ok(payload)
    }

    fn parse_response(
        &self,
        raw: Value,
        provider: &str,
        model: &str,
    ) -> CoordResult<UnifiedResponse> {
        let parsed: WireResponse = serde_json::from_value(raw.clone()).map_err(|err| {
            CoordinatorError::provider(provider, format!("unparseable response: {err}"))
        })?;

        let mut content = Vec::new();
        let mut tool_calls = Vec::new();
        let mut reasoning: Option<Reasoning> = None;

        for block in parsed.content {
            match block {
                WireBlock::Text { text } => content.push(ContentPart::text(text)),
                WireBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: input,
                    metadata: None,
                }),
                WireBlock::Thinking {
                    thinking,
                    signature,
                } => {
                    let entry = reasoning.get_or_insert_with(Reasoning::default);
                    entry.text.push_str(&thinking);
                    if let Some(signature) = signature {
                        entry.metadata = Some(json!({ "signature": signature }));
                    }
                }
                WireBlock::Unknown => {}
            }
        }

        Ok(UnifiedResponse {
            provider: provider.to_string(),
            model: parsed.model.unwrap_or_else(|| model.to_string()),
            role: Role::Assistant,
            content,
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            usage: parsed.usage.map(Into::into),
            reasoning,
            finish_reason: parsed.stop_reason.as_deref().map(Self::map_stop_reason),
            raw: Some(json!({ "body": raw })),
        })
    }

    fn new_stream_parser(&self) -> Box<dyn StreamParser> {
        Box::new(AnthropicStreamParser::default())
    }

    fn serialize_tools(&self, tools: &[Tool]) -> Value {
        Value::Array(
            tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "input_schema": tool.parameters,
                    })
                })
                .collect(),
        )
    }

    fn serialize_tool_choice(&self, choice: &ToolChoice) -> Value {
        match choice {
            ToolChoice::Mode(ToolChoiceMode::Auto) => json!({ "type": "auto" }),
            ToolChoice::Mode(ToolChoiceMode::None) => json!({ "type": "none" }),
            ToolChoice::Mode(ToolChoiceMode::Required) => json!({ "type": "any" }),
            ToolChoice::Specific { name } => json!({ "type": "tool", "name": name }),
        }
    }
}

// ============================================================================
// Stream parsing
// ============================================================================

#[derive(Debug)]
enum PendingBlock {
    Text,
    Thinking { signature: Option<String> },
    ToolUse {
        id: String,
        name: String,
        arguments: String,
    },
}

/// Stateful parser for Messages-API SSE events, keyed by content-block
/// index.
#[derive(Debug, Default)]
pub struct AnthropicStreamParser {
    blocks: Vec<(usize, PendingBlock)>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum WireStreamEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: WireStreamMessage },
    #[serde(rename = "content_block_start")]
    BlockStart { index: usize, content_block: Value },
    #[serde(rename = "content_block_delta")]
    BlockDelta { index: usize, delta: Value },
    #[serde(rename = "content_block_stop")]
    BlockStop { index: usize },
    #[serde(rename = "message_delta")]
    MessageDelta {
        delta: Value,
        #[serde(default)]
        usage: Option<WireUsage>,
    },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(other)]
    Ignored,
}

#[derive(Debug, Clone, Deserialize)]
struct WireStreamMessage {
    #[serde(default)]
    usage: Option<WireUsage>,
}

impl StreamParser for AnthropicStreamParser {
    fn parse_chunk(&mut self, chunk: &str) -> CoordResult<StreamChunk> {
        let mut out = StreamChunk::default();
        let event: WireStreamEvent = serde_json::from_str(chunk).map_err(|err| {
            CoordinatorError::Internal(anyhow::anyhow!("unparseable stream event: {err}"))
        })?;

        match event {
            WireStreamEvent::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    out.usage = Some(usage.into());
                }
            }
            WireStreamEvent::BlockStart {
                index,
                content_block,
            } => match content_block.get("type").and_then(Value::as_str) {
                Some("tool_use") => {
                    let id = content_block
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let name = content_block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    out.tool_events.push(ToolEvent::CallStart {
                        id: id.clone(),
                        name: Some(name.clone()),
                        metadata: None,
                    });
                    self.blocks.push((
                        index,
                        PendingBlock::ToolUse {
                            id,
                            name,
                            arguments: String::new(),
                        },
                    ));
                }
                Some("thinking") => {
                    self.blocks.push((index, PendingBlock::Thinking { signature: None }));
                }
                _ => self.blocks.push((index, PendingBlock::Text)),
            },
            WireStreamEvent::BlockDelta { index, delta } => {
                let block = self.blocks.iter_mut().find(|(i, _)| *i == index);
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        if let Some(text) = delta.get("text").and_then(Value::as_str) {
                            out.text = Some(text.to_string());
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some((_, PendingBlock::ToolUse { id, arguments, .. })) = block {
                            if let Some(partial) = delta.get("partial_json").and_then(Value::as_str)
                            {
                                arguments.push_str(partial);
                                out.tool_events.push(ToolEvent::ArgsDelta {
                                    id: id.clone(),
                                    delta: partial.to_string(),
                                });
                            }
                        }
                    }
                    Some("thinking_delta") => {
                        if let Some(text) = delta.get("thinking").and_then(Value::as_str) {
                            out.reasoning = Some(Reasoning {
                                text: text.to_string(),
                                metadata: None,
                            });
                        }
                    }
                    Some("signature_delta") => {
                        if let Some(signature) = delta.get("signature").and_then(Value::as_str) {
                            if let Some((_, PendingBlock::Thinking { signature: slot })) = block {
                                *slot = Some(signature.to_string());
                            }
                            out.reasoning = Some(Reasoning {
                                text: String::new(),
                                metadata: Some(json!({ "signature": signature })),
                            });
                        }
                    }
                    _ => {}
                }
            }
            WireStreamEvent::BlockStop { index } => {
                if let Some(pos) = self.blocks.iter().position(|(i, _)| *i == index) {
                    let (_, block) = self.blocks.remove(pos);
                    if let PendingBlock::ToolUse {
                        id,
                        name,
                        arguments,
                    } = block
                    {
                        let arguments = if arguments.is_empty() {
                            json!({})
                        } else {
                            serde_json::from_str(&arguments).unwrap_or_else(|_| json!({}))
                        };
                        out.tool_events.push(ToolEvent::CallEnd {
                            id,
                            name,
                            arguments,
                            metadata: None,
                        });
                    }
                }
            }
            WireStreamEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    out.usage = Some(usage.into());
                }
                if let Some(reason) = delta.get("stop_reason").and_then(Value::as_str) {
                    out.finish_reason = Some(AnthropicMessagesCompat::map_stop_reason(reason));
                    if reason == "tool_use" {
                        out.finished_with_tool_calls = true;
                    }
                }
            }
            WireStreamEvent::MessageStop => {
                out.terminal = true;
            }
            WireStreamEvent::Ignored => {}
        }

        Ok(out)
    }
}
