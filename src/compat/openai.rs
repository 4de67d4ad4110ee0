//! OpenAI-compatible chat-completions compat adapter.
//!
//! Serves every provider speaking the `chat/completions` wire protocol
//! (hosted OpenAI, LM Studio, Ollama, vLLM, and friends) under the manifest
//! kind `openai-chat`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use super::{LlmCompat, StreamChunk, StreamParser};
use crate::error::{CoordResult, CoordinatorError};
use crate::logging::log_debug;
use crate::settings::ProviderSettings;
use crate::spec::{
    ContentPart, DocumentSource, FinishReason, Message, Reasoning, Role, Tool, ToolCall,
    ToolChoice, ToolChoiceMode, ToolEvent, UnifiedResponse, Usage,
};

/// Manifest kind served by this adapter.
pub const KIND: &str = "openai-chat";

// ============================================================================
// Wire structures
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
    /// Reasoning text some OpenAI-compatible servers attach
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Clone, Deserialize)]
struct WireFunction {
    name: String,
    /// JSON-encoded argument string
    arguments: String,
}

#[derive(Debug, Clone, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl From<WireUsage> for Usage {
    fn from(usage: WireUsage) -> Self {
        Self {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct WireStreamChunk {
    #[serde(default)]
    choices: Vec<WireStreamChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireStreamChoice {
    #[serde(default)]
    delta: WireDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireDeltaToolCall>>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireDeltaToolCall {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireDeltaFunction>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct WireDeltaFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

// ============================================================================
// Adapter
// ============================================================================

/// OpenAI chat-completions adapter
#[derive(Debug, Default)]
pub struct OpenAiChatCompat;

impl OpenAiChatCompat {
    pub fn new() -> Self {
        Self
    }

    fn convert_message(&self, message: &Message) -> CoordResult<WireMessage> {
        let role = match message.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };

        if message.role == Role::Tool {
            // Tool results travel as plain text; the structured result stays
            // in the spec's message for downstream consumers.
            return Ok(WireMessage {
                role,
                content: Some(Value::String(message.text_content())),
                tool_calls: None,
                tool_call_id: message.tool_call_id.clone(),
            });
        }

        let tool_calls = message.tool_calls.as_ref().map(|calls| {
            calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": call.arguments.to_string(),
                        },
                    })
                })
                .collect::<Vec<_>>()
        });

        let content = self.convert_content(&message.content)?;
        Ok(WireMessage {
            role,
            content,
            tool_calls,
            tool_call_id: None,
        })
    }

    /// Single text part collapses to a plain string; anything else becomes
    /// the parts-array form.
    fn convert_content(&self, parts: &[ContentPart]) -> CoordResult<Option<Value>> {
        match parts {
            [] => Ok(None),
            [ContentPart::Text { text }] => Ok(Some(Value::String(text.clone()))),
            parts => {
                let mut converted = Vec::with_capacity(parts.len());
                for part in parts {
                    match part {
                        ContentPart::Text { text } => {
                            converted.push(json!({ "type": "text", "text": text }));
                        }
                        ContentPart::Image { url, .. } => {
                            converted.push(json!({
                                "type": "image_url",
                                "image_url": { "url": url },
                            }));
                        }
                        ContentPart::Document {
                            source,
                            mime_type,
                            filename,
                            ..
                        } => {
                            converted.push(self.convert_document(source, mime_type.as_deref(), filename.as_deref())?);
                        }
                        ContentPart::ToolResult { tool_name, result } => {
                            converted.push(json!({
                                "type": "text",
                                "text": format!("[{tool_name} result] {result}"),
                            }));
                        }
                    }
                }
                Ok(Some(Value::Array(converted)))
            }
        }
    }

    fn convert_document(
        &self,
        source: &DocumentSource,
        mime_type: Option<&str>,
        filename: Option<&str>,
    ) -> CoordResult<Value> {
        let (data, mime) = match source {
            DocumentSource::Url { url } => {
                // The chat protocol only fetches image URLs itself.
                return Ok(json!({ "type": "image_url", "image_url": { "url": url } }));
            }
            DocumentSource::ProviderId { id } => {
                return Ok(json!({ "type": "file", "file": { "file_id": id } }));
            }
            DocumentSource::Base64 { data } => {
                (data.clone(), mime_type.unwrap_or("application/octet-stream"))
            }
            DocumentSource::Path { path } => {
                let bytes = std::fs::read(path).map_err(|err| {
                    CoordinatorError::validation(format!("cannot read document {path}: {err}"))
                })?;
                (
                    base64_encode(&bytes),
                    mime_type.unwrap_or_else(|| mime_from_path(path)),
                )
            }
        };

        if mime.starts_with("image/") {
            Ok(json!({
                "type": "image_url",
                "image_url": { "url": format!("data:{mime};base64,{data}") },
            }))
        } else {
            Ok(json!({
                "type": "file",
                "file": {
                    "filename": filename.unwrap_or("document"),
                    "file_data": format!("data:{mime};base64,{data}"),
                },
            }))
        }
    }

    fn map_finish_reason(reason: &str) -> FinishReason {
        match reason {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "tool_calls" | "function_call" => FinishReason::ToolCalls,
            "content_filter" => FinishReason::ContentFilter,
            _ => FinishReason::Other,
        }
    }
}

impl LlmCompat for OpenAiChatCompat {
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
        let wire_messages = messages
            .iter()
            .map(|m| self.convert_message(m))
            .collect::<CoordResult<Vec<_>>>()?;

        let mut payload = json!({
            "model": model,
            "messages": wire_messages,
        });
        let map = payload.as_object_mut().expect("payload is an object");

        // Recognized sampling knobs map one-to-one onto the wire names.
        for (settings_key, wire_key) in [
            ("temperature", "temperature"),
            ("topP", "top_p"),
            ("maxTokens", "max_tokens"),
            ("stop", "stop"),
            ("seed", "seed"),
            ("frequencyPenalty", "frequency_penalty"),
            ("presencePenalty", "presence_penalty"),
            ("logitBias", "logit_bias"),
            ("logprobs", "logprobs"),
            ("topLogprobs", "top_logprobs"),
        ] {
            if let Some(value) = settings.get(settings_key) {
                map.insert(wire_key.to_string(), value.clone());
            }
        }
        if let Some(format) = settings.response_format() {
            map.insert("response_format".to_string(), format.clone());
        }
        if let Some(budget) = settings.reasoning_budget() {
            map.insert("max_completion_tokens".to_string(), json!(budget));
        }
        if let Some(reasoning) = settings.reasoning() {
            map.insert("reasoning".to_string(), reasoning.clone());
        }

        if !tools.is_empty() {
            map.insert("tools".to_string(), self.serialize_tools(tools));
        }
        if let Some(choice) = tool_choice {
            map.insert("tool_choice".to_string(), self.serialize_tool_choice(choice));
        }

        log_debug!(
            kind = KIND,
            model = model,
            message_count = messages.len(),
            tool_count = tools.len(),
            "Built chat-completions payload"
        );
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
        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            CoordinatorError::provider(provider, "no choices in response".to_string())
        })?;

        let mut content = Vec::new();
        if let Some(text) = &choice.message.content {
            if !text.is_empty() {
                content.push(ContentPart::text(text));
            }
        }

        let tool_calls = choice.message.tool_calls.map(|calls| {
            calls
                .into_iter()
                .map(|tc| ToolCall {
                    id: tc.id,
                    name: tc.function.name,
                    arguments: serde_json::from_str(&tc.function.arguments)
                        .unwrap_or_else(|_| json!({})),
                    metadata: None,
                })
                .collect::<Vec<_>>()
        });

        let reasoning = choice
            .message
            .reasoning_content
            .filter(|t| !t.is_empty())
            .map(|text| Reasoning { text, metadata: None });

        Ok(UnifiedResponse {
            provider: provider.to_string(),
            model: parsed.model.unwrap_or_else(|| model.to_string()),
            role: Role::Assistant,
            content,
            tool_calls,
            usage: parsed.usage.map(Into::into),
            reasoning,
            finish_reason: choice.finish_reason.as_deref().map(Self::map_finish_reason),
            raw: Some(json!({ "body": raw })),
        })
    }

    fn new_stream_parser(&self) -> Box<dyn StreamParser> {
        Box::new(OpenAiStreamParser::default())
    }

    fn serialize_tools(&self, tools: &[Tool]) -> Value {
        Value::Array(
            tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        },
                    })
                })
                .collect(),
        )
    }

    fn serialize_tool_choice(&self, choice: &ToolChoice) -> Value {
        match choice {
            ToolChoice::Mode(ToolChoiceMode::Auto) => Value::String("auto".to_string()),
            ToolChoice::Mode(ToolChoiceMode::None) => Value::String("none".to_string()),
            ToolChoice::Mode(ToolChoiceMode::Required) => Value::String("required".to_string()),
            ToolChoice::Specific { name } => json!({
                "type": "function",
                "function": { "name": name },
            }),
        }
    }

    fn apply_provider_extensions(&self, payload: &mut Value, extras: &BTreeMap<String, Value>) {
        // Leftover extras land at the payload root without clobbering
        // compat-built fields.
        let Some(map) = payload.as_object_mut() else {
            return;
        };
        for (key, value) in extras {
            map.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
}

// ============================================================================
// Stream parsing
// ============================================================================

/// Partial tool call keyed by the wire's choice-local index.
#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

/// Stateful parser for chat-completions SSE chunks.
///
/// Tool-call argument fragments arrive keyed by index with the id only on
/// the first fragment; the parser resolves ids and emits unified tool
/// events, closing every pending call when the `tool_calls` finish reason
/// arrives.
#[derive(Debug, Default)]
pub struct OpenAiStreamParser {
    pending: Vec<(usize, PendingCall)>,
}

impl OpenAiStreamParser {
    fn pending_mut(&mut self, index: usize) -> &mut PendingCall {
        if !self.pending.iter().any(|(i, _)| *i == index) {
            self.pending.push((index, PendingCall::default()));
        }
        &mut self
            .pending
            .iter_mut()
            .find(|(i, _)| *i == index)
            .expect("inserted above")
            .1
    }
}

impl StreamParser for OpenAiStreamParser {
    fn parse_chunk(&mut self, chunk: &str) -> CoordResult<StreamChunk> {
        let mut out = StreamChunk::default();
        if chunk.trim() == "[DONE]" {
            out.terminal = true;
            return Ok(out);
        }

        let parsed: WireStreamChunk = serde_json::from_str(chunk).map_err(|err| {
            CoordinatorError::Internal(anyhow::anyhow!("unparseable stream chunk: {err}"))
        })?;

        if let Some(usage) = parsed.usage {
            out.usage = Some(usage.into());
        }

        let Some(choice) = parsed.choices.into_iter().next() else {
            return Ok(out);
        };

        if let Some(text) = choice.delta.content {
            if !text.is_empty() {
                out.text = Some(text);
            }
        }
        if let Some(reasoning) = choice.delta.reasoning_content {
            if !reasoning.is_empty() {
                out.reasoning = Some(Reasoning {
                    text: reasoning,
                    metadata: None,
                });
            }
        }

        for delta in choice.delta.tool_calls.unwrap_or_default() {
            let is_new = !self.pending.iter().any(|(i, _)| *i == delta.index);
            let call = self.pending_mut(delta.index);
            if let Some(id) = delta.id {
                call.id = id;
            }
            if let Some(function) = delta.function {
                if let Some(name) = function.name {
                    call.name = name;
                }
                if let Some(arguments) = function.arguments {
                    call.arguments.push_str(&arguments);
                    if !is_new {
                        out.tool_events.push(ToolEvent::ArgsDelta {
                            id: call.id.clone(),
                            delta: arguments,
                        });
                    }
                }
            }
            if is_new {
                let call = &self
                    .pending
                    .iter()
                    .find(|(i, _)| *i == delta.index)
                    .expect("inserted above")
                    .1;
                out.tool_events.push(ToolEvent::CallStart {
                    id: call.id.clone(),
                    name: (!call.name.is_empty()).then(|| call.name.clone()),
                    metadata: None,
                });
                if !call.arguments.is_empty() {
                    out.tool_events.push(ToolEvent::ArgsDelta {
                        id: call.id.clone(),
                        delta: call.arguments.clone(),
                    });
                }
            }
        }

        if let Some(reason) = choice.finish_reason.as_deref() {
            out.finish_reason = Some(OpenAiChatCompat::map_finish_reason(reason));
            out.terminal = true;
            if reason == "tool_calls" || reason == "function_call" {
                out.finished_with_tool_calls = true;
                for (_, call) in self.pending.drain(..) {
                    let arguments =
                        serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({}));
                    out.tool_events.push(ToolEvent::CallEnd {
                        id: call.id,
                        name: call.name,
                        arguments,
                        metadata: None,
                    });
                }
            }
        }

        Ok(out)
    }
}

// ============================================================================
// Small byte helpers
// ============================================================================

pub(crate) fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Minimal extension table for document parts declared without a MIME type.
pub(crate) fn mime_from_path(path: &str) -> &'static str {
    match path.rsplit('.').next().map(str::to_ascii_lowercase).as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("pdf") => "application/pdf",
        Some("txt") | Some("md") => "text/plain",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}
