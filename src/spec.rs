//! Call spec and unified response architecture
//!
//! This is the core data model of llm-coordinator: a provider-agnostic call
//! spec on the way in, and a unified response (or a stream of events) on the
//! way out. Invariants live here, embedded in the types and in
//! [`CallSpec::validate`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{CoordResult, CoordinatorError};

/// Message roles for LLM interactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// Where a document's bytes come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DocumentSource {
    /// A file on the local filesystem, read at payload-build time.
    Path { path: String },
    /// Inline base64-encoded bytes.
    Base64 { data: String },
    /// A URL the provider fetches itself.
    Url { url: String },
    /// A provider-side file id from a prior upload.
    ProviderId { id: String },
}

/// One part of a message's content.
///
/// Ordering of parts is significant and preserved end to end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ContentPart {
    /// Plain text.
    Text { text: String },
    /// Image by URL (data URL or HTTP URL).
    Image {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    /// A document attachment.
    Document {
        source: DocumentSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        /// Provider-specific hints, passed through to the compat untouched.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hints: Option<Value>,
    },
    /// A structured tool result embedded in a tool message.
    ToolResult { tool_name: String, result: Value },
}

impl ContentPart {
    /// Create a text content part
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    /// Create an image content part from a URL (data URL or HTTP URL)
    pub fn image(url: impl Into<String>) -> Self {
        ContentPart::Image {
            url: url.into(),
            mime_type: None,
        }
    }
}

/// Tool call issued by the model.
///
/// `metadata` is opaque provider state (e.g. cryptographic signatures) that
/// must round-trip unchanged into follow-up requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    /// Unique identifier for this tool call
    pub id: String,
    /// Name of the tool to call
    pub name: String,
    /// Arguments to pass to the tool (as JSON)
    pub arguments: Value,
    /// Opaque provider metadata, round-tripped verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Aggregated reasoning trace attached to an assistant message or response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reasoning {
    /// Concatenated reasoning text
    pub text: String,
    /// Shallow-merged provider reasoning metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Universal message for LLM interactions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message role
    pub role: Role,
    /// Ordered content parts
    #[serde(default)]
    pub content: Vec<ContentPart>,
    /// Tool calls issued by an assistant message.
    ///
    /// An assistant message carrying tool calls may have empty textual
    /// content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// For tool messages: the id of the prior assistant tool call this
    /// result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Reasoning trace attached to an assistant message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Reasoning>,
}

impl Message {
    /// Create a message with a single text part
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentPart::text(content)],
            tool_calls: None,
            tool_call_id: None,
            reasoning: None,
        }
    }

    /// Create a simple user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    /// Create a simple assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    /// Create a simple system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    /// Create an assistant message carrying tool calls (text may be empty)
    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let content = content.into();
        Self {
            role: Role::Assistant,
            content: if content.is_empty() {
                Vec::new()
            } else {
                vec![ContentPart::text(content)]
            },
            tool_calls: Some(tool_calls),
            tool_call_id: None,
            reasoning: None,
        }
    }

    /// Create a tool-result message answering `tool_call_id`
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        result: Value,
        text: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: vec![
                ContentPart::text(text),
                ContentPart::ToolResult {
                    tool_name: tool_name.into(),
                    result,
                },
            ],
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            reasoning: None,
        }
    }

    /// Concatenated text of all text parts (ignores media and tool results)
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Whether this message carries at least one tool call
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|tc| !tc.is_empty())
    }
}

/// Tool definition exposed to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    /// Tool name - must be unique within a request
    pub name: String,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// JSON Schema defining the tool's input parameters
    #[serde(default = "default_parameters")]
    pub parameters: Value,
}

fn default_parameters() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// Tool choice strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    /// "auto" | "none" | "required"
    Mode(ToolChoiceMode),
    /// Force a specific tool by name
    Specific { name: String },
}

/// The string-valued tool-choice modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoiceMode {
    /// Let the model decide whether and which tools to use
    #[default]
    Auto,
    /// Don't use any tools
    None,
    /// Must use at least one tool
    Required,
}

impl Default for ToolChoice {
    fn default() -> Self {
        ToolChoice::Mode(ToolChoiceMode::Auto)
    }
}

impl ToolChoice {
    /// The tool-choice used for the forced final turn after budget
    /// exhaustion.
    pub fn none() -> Self {
        ToolChoice::Mode(ToolChoiceMode::None)
    }
}

/// One candidate in the ordered provider priority list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PriorityEntry {
    /// Provider id (resolved through the plugin registry)
    pub provider: String,
    /// Model id passed to the compat adapter
    pub model: String,
    /// Partial settings override, deep-merged onto the spec's settings
    /// before partitioning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<BTreeMap<String, Value>>,
}

// ============================================================================
// Vector context configuration (RAG injection)
// ============================================================================

/// Injector modes for retrieval-augmented context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VectorContextMode {
    /// Retrieve and inject a context message before the first call
    #[default]
    Auto,
    /// Expose a `vector_search` tool the model can invoke at will
    Tool,
    /// Both of the above
    Both,
}

/// Where the injected context message is placed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InjectAs {
    /// Append a new system message (never clobbers an existing one)
    #[default]
    System,
    /// Insert a user message immediately before the last user message
    UserContext,
}

/// System-prompt inclusion policy for query construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum IncludeSystemPrompt {
    Always,
    #[default]
    Never,
    /// Include only when `messages_to_include` covers the whole history
    IfInRange,
}

/// How the embedding query string is built from the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct QueryConstruction {
    /// Number of trailing messages to include; 0 = all
    #[serde(default)]
    pub messages_to_include: usize,
    #[serde(default)]
    pub include_system_prompt: IncludeSystemPrompt,
    #[serde(default = "default_true")]
    pub include_assistant_messages: bool,
    #[serde(default = "default_separator")]
    pub separator: String,
}

fn default_true() -> bool {
    true
}

fn default_separator() -> String {
    "\n".to_string()
}

impl Default for QueryConstruction {
    fn default() -> Self {
        Self {
            messages_to_include: 0,
            include_system_prompt: IncludeSystemPrompt::Never,
            include_assistant_messages: true,
            separator: default_separator(),
        }
    }
}

/// Server-side pinned values for `vector_search` parameters.
///
/// A locked parameter is omitted from the tool schema exposed to the model
/// and overwritten server-side regardless of the model's arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VectorLocks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_threshold: Option<f64>,
}

/// Per-parameter renames (or hides) for the exposed `vector_search` schema.
///
/// A value of `null` hides the parameter; a string renames it. Canonical
/// names keep working on invocation either way.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ToolSchemaOverrides {
    #[serde(default)]
    pub params: BTreeMap<String, Option<String>>,
}

/// One embedding-provider candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EmbeddingPriorityEntry {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// RAG context configuration for a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VectorContextConfig {
    #[serde(default)]
    pub mode: VectorContextMode,
    /// Store ids this run may query; defaults to the spec's `vectorStores`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stores: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    #[serde(default)]
    pub inject_as: InjectAs,
    /// Template for the injected message; `{{results}}` expands to the
    /// rendered result list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Per-result format; `{{score}}` and `payload.*` interpolate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_format: Option<String>,
    /// Bypass query construction with a fixed embedding query
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_embedding_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_construction: Option<QueryConstruction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_priority: Option<Vec<EmbeddingPriorityEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locks: Option<VectorLocks>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_schema_overrides: Option<ToolSchemaOverrides>,
}

// ============================================================================
// Call spec
// ============================================================================

/// Immutable input to one LLM run.
///
/// Unknown root keys are rejected; unknown keys inside `settings` flow to
/// the extras partition.
///
/// # Example
///
/// ```rust
/// use llm_coordinator::CallSpec;
///
/// let spec: CallSpec = serde_json::from_value(serde_json::json!({
///     "messages": [{ "role": "user", "content": [{ "type": "text", "text": "hi" }] }],
///     "llmPriority": [{ "provider": "acme", "model": "acme-large" }]
/// })).unwrap();
/// spec.validate().unwrap();
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CallSpec {
    /// Optional system prompt, prepended as a system message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Ordered conversation
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Tool ids to load from the registry, or inline tool definitions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolBinding>,
    /// Subprocess tool-server ids to connect
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mcp_servers: Vec<String>,
    /// Vector store ids bound to this run
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vector_stores: Vec<String>,
    /// RAG context configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_context: Option<VectorContextConfig>,
    /// Ordered provider candidates; must be non-empty
    pub llm_priority: Vec<PriorityEntry>,
    /// Tool-choice directive forwarded to the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    /// Sleep sequence (ms) applied between rate-limited attempts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delays_ms: Option<Vec<u64>>,
    /// Settings bag, partitioned into runtime / provider / extras
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
    /// Free-form caller metadata, passed to tool contexts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// A tool referenced by registry id or declared inline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolBinding {
    /// Registry tool id
    Id(String),
    /// Inline tool definition
    Inline(Tool),
}

impl CallSpec {
    /// Validate the spec invariants that the schema cannot express.
    pub fn validate(&self) -> CoordResult<()> {
        if self.llm_priority.is_empty() {
            return Err(CoordinatorError::validation("llmPriority must not be empty"));
        }
        for (idx, message) in self.messages.iter().enumerate() {
            if message.role == Role::Tool && message.tool_call_id.is_none() {
                return Err(CoordinatorError::validation(format!(
                    "messages[{idx}]: tool message requires toolCallId"
                )));
            }
            if message.role != Role::Assistant && message.has_tool_calls() {
                return Err(CoordinatorError::validation(format!(
                    "messages[{idx}]: only assistant messages may carry toolCalls"
                )));
            }
        }
        // Tool messages must answer a previously-seen tool call id.
        let mut seen_call_ids: Vec<&str> = Vec::new();
        for (idx, message) in self.messages.iter().enumerate() {
            if let Some(calls) = &message.tool_calls {
                seen_call_ids.extend(calls.iter().map(|c| c.id.as_str()));
            }
            if let Some(id) = &message.tool_call_id {
                if !seen_call_ids.contains(&id.as_str()) {
                    return Err(CoordinatorError::validation(format!(
                        "messages[{idx}]: toolCallId {id} does not reference a prior tool call"
                    )));
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Unified response
// ============================================================================

/// Token usage information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    /// Number of tokens in the prompt
    #[serde(default)]
    pub prompt_tokens: u32,
    /// Number of tokens in the completion
    #[serde(default)]
    pub completion_tokens: u32,
    /// Total tokens used (prompt + completion)
    #[serde(default)]
    pub total_tokens: u32,
}

impl Usage {
    /// Accumulate another usage snapshot (multi-turn runs sum per-call usage)
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Normalized stop reasons across providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Other,
}

/// Record of one tool invocation made during a run.
///
/// The final unified response carries every record so callers always see
/// what was invoked, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: Value,
    /// Structured result (untruncated, even when the text form was clamped)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The provider-agnostic response document produced by a compat's
/// `parse_response` and augmented by the tool loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedResponse {
    /// Provider id that produced this response
    pub provider: String,
    /// Model that generated the response
    pub model: String,
    /// Always `assistant`
    pub role: Role,
    /// Response content parts
    pub content: Vec<ContentPart>,
    /// Every tool call the run executed, in invocation order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Reasoning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    /// Raw extras: providers stash their original body under `body`, the
    /// tool loop appends `toolResults`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl UnifiedResponse {
    /// Concatenated text of all text parts
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Whether the response requests tool execution
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|tc| !tc.is_empty())
    }

    /// Attach the run's tool-call records under `raw.toolResults`.
    pub fn attach_tool_records(&mut self, records: &[ToolCallRecord]) {
        if records.is_empty() {
            return;
        }
        let encoded = serde_json::to_value(records).unwrap_or(Value::Null);
        match &mut self.raw {
            Some(Value::Object(map)) => {
                map.insert("toolResults".to_string(), encoded);
            }
            _ => {
                self.raw = Some(serde_json::json!({ "toolResults": encoded }));
            }
        }
    }
}

// ============================================================================
// Stream events
// ============================================================================

/// Tool-related stream events, keyed by call id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolEvent {
    /// A tool call opened; name and metadata may arrive here or at the end
    CallStart {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    /// A fragment of the call's JSON arguments
    ArgsDelta { id: String, delta: String },
    /// The call is complete with assembled arguments
    CallEnd {
        id: String,
        name: String,
        arguments: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    /// A tool invocation finished; `result` is the JSON-encoded payload
    Result {
        id: String,
        name: String,
        result: String,
    },
}

impl ToolEvent {
    /// The call id this event belongs to
    pub fn call_id(&self) -> &str {
        match self {
            ToolEvent::CallStart { id, .. }
            | ToolEvent::ArgsDelta { id, .. }
            | ToolEvent::CallEnd { id, .. }
            | ToolEvent::Result { id, .. } => id,
        }
    }
}

/// The sole observable vocabulary of a streamed run.
///
/// Consumers observe exactly one `done`, and it is the last event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental text
    Delta { text: String },
    /// Interim usage snapshot
    Token { usage: Usage },
    /// Tool-call lifecycle
    Tool { event: ToolEvent },
    /// Terminal event carrying the final assembled response
    Done { response: UnifiedResponse },
    /// Terminal error
    Error { message: String, code: String },
}
