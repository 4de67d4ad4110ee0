//! Subprocess tool-server pool.
//!
//! Each configured server runs as a long-lived child process speaking
//! newline-delimited JSON-RPC 2.0 over stdin/stdout. A session walks
//! unstarted → initialized → ready → closing → closed; `connect` is
//! idempotent and `close` is best-effort (failures logged and swallowed).
//!
//! Tool names surfaced to the model use a sanitized, server-prefixed form;
//! the pool keeps the bidirectional map and consults the reverse direction
//! on invocation.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};

use crate::error::{CoordResult, CoordinatorError};
use crate::logging::{log_debug, log_warn};
use crate::registry::McpServerManifest;
use crate::spec::Tool;

const PROTOCOL_VERSION: &str = "2024-11-05";
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Unstarted,
    Initialized,
    Ready,
    Closing,
    Closed,
}

/// Exposed name ↔ upstream name map for one server.
#[derive(Debug, Default)]
struct NameMap {
    exposed_to_upstream: HashMap<String, String>,
    upstream_to_exposed: HashMap<String, String>,
}

impl NameMap {
    fn insert(&mut self, exposed: String, upstream: String) {
        self.upstream_to_exposed
            .insert(upstream.clone(), exposed.clone());
        self.exposed_to_upstream.insert(exposed, upstream);
    }
}

/// One long-lived JSON-RPC session over a child process.
struct McpSession {
    server_id: String,
    state: Mutex<SessionState>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
    next_id: AtomicU64,
    names: Mutex<NameMap>,
    /// Tool surface advertised by the server, with exposed names
    tools: Mutex<Vec<Tool>>,
    call_timeout: Duration,
}

impl McpSession {
    fn new(manifest: &McpServerManifest) -> Self {
        Self {
            server_id: manifest.id.clone(),
            state: Mutex::new(SessionState::Unstarted),
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            names: Mutex::new(NameMap::default()),
            tools: Mutex::new(Vec::new()),
            call_timeout: manifest
                .call_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CALL_TIMEOUT),
        }
    }

    /// Spawn, initialize, and list tools. Idempotent.
    async fn connect(&self, manifest: &McpServerManifest) -> CoordResult<()> {
        {
            let state = self.state.lock().await;
            match *state {
                SessionState::Ready => return Ok(()),
                SessionState::Closing | SessionState::Closed => {
                    return Err(CoordinatorError::tool_execution(
                        &self.server_id,
                        "tool server session is closed",
                    ));
                }
                SessionState::Unstarted | SessionState::Initialized => {}
            }
        }

        let mut command = Command::new(&manifest.command);
        command
            .args(&manifest.args)
            .envs(&manifest.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &manifest.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|err| {
            CoordinatorError::tool_execution(
                &self.server_id,
                format!("cannot spawn tool server: {err}"),
            )
        })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            CoordinatorError::tool_execution(&self.server_id, "tool server has no stdin")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            CoordinatorError::tool_execution(&self.server_id, "tool server has no stdout")
        })?;

        // Reader task: route responses to their pending requests by id.
        let pending = self.pending.clone();
        let server_id = self.server_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(message) = serde_json::from_str::<Value>(&line) else {
                    log_warn!(server = %server_id, line = %line, "Skipping non-JSON line from tool server");
                    continue;
                };
                let Some(id) = message.get("id").and_then(Value::as_u64) else {
                    // Notification; nothing waits on it.
                    continue;
                };
                if let Some(sender) = pending.lock().await.remove(&id) {
                    let _ = sender.send(message);
                }
            }
        });

        *self.child.lock().await = Some(child);
        *self.stdin.lock().await = Some(stdin);

        let init = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "llm-coordinator",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            )
            .await?;
        if init.get("error").is_some() {
            return Err(CoordinatorError::tool_execution(
                &self.server_id,
                format!("initialize failed: {init}"),
            ));
        }
        *self.state.lock().await = SessionState::Initialized;
        self.notify("notifications/initialized", json!({})).await?;

        let listed = self.request("tools/list", json!({})).await?;
        let upstream_tools = listed
            .pointer("/result/tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut names = self.names.lock().await;
        let mut tools = self.tools.lock().await;
        for tool in &upstream_tools {
            let Some(upstream_name) = tool.get("name").and_then(Value::as_str) else {
                continue;
            };
            let exposed = exposed_name(&self.server_id, upstream_name, &names.exposed_to_upstream);
            names.insert(exposed.clone(), upstream_name.to_string());
            tools.push(Tool {
                name: exposed,
                description: tool
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                parameters: tool
                    .get("inputSchema")
                    .cloned()
                    .unwrap_or_else(|| json!({ "type": "object", "properties": {} })),
            });
        }
        drop(names);
        log_debug!(
            server = %self.server_id,
            tool_count = tools.len(),
            "Tool server session ready"
        );
        drop(tools);

        *self.state.lock().await = SessionState::Ready;
        Ok(())
    }

    async fn request(&self, method: &str, params: Value) -> CoordResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.pending.lock().await.insert(id, sender);

        let frame = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        self.write_frame(&frame).await?;

        match tokio::time::timeout(self.call_timeout, receiver).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(CoordinatorError::tool_execution(
                &self.server_id,
                "tool server closed mid-request",
            )),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(CoordinatorError::tool_execution(
                    &self.server_id,
                    format!("{method} timed out after {:?}", self.call_timeout),
                ))
            }
        }
    }

    async fn notify(&self, method: &str, params: Value) -> CoordResult<()> {
        let frame = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.write_frame(&frame).await
    }

    async fn write_frame(&self, frame: &Value) -> CoordResult<()> {
        let mut line = frame.to_string();
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        let Some(stdin) = stdin.as_mut() else {
            return Err(CoordinatorError::tool_execution(
                &self.server_id,
                "tool server stdin is closed",
            ));
        };
        stdin.write_all(line.as_bytes()).await.map_err(|err| {
            CoordinatorError::tool_execution(
                &self.server_id,
                format!("cannot write to tool server: {err}"),
            )
        })
    }

    /// Invoke one tool by its exposed name.
    async fn call(&self, exposed_tool: &str, args: Value) -> CoordResult<Value> {
        let upstream = {
            let names = self.names.lock().await;
            names
                .exposed_to_upstream
                .get(exposed_tool)
                .cloned()
                // Unmapped names pass through for servers that accept the
                // exposed form directly.
                .unwrap_or_else(|| exposed_tool.to_string())
        };

        let response = self
            .request("tools/call", json!({ "name": upstream, "arguments": args }))
            .await?;

        if let Some(error) = response.get("error") {
            return Err(CoordinatorError::tool_execution(
                exposed_tool,
                format!("tool server error: {error}"),
            ));
        }

        let result = response.get("result").cloned().unwrap_or(Value::Null);
        if result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return Err(CoordinatorError::tool_execution(
                exposed_tool,
                content_text(&result),
            ));
        }
        Ok(normalize_call_result(result))
    }

    /// Best-effort teardown; errors are logged and swallowed.
    async fn close(&self) {
        *self.state.lock().await = SessionState::Closing;
        self.stdin.lock().await.take();
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(err) = child.kill().await {
                log_warn!(server = %self.server_id, error = %err, "Failed to kill tool server");
            }
        }
        self.pending.lock().await.clear();
        *self.state.lock().await = SessionState::Closed;
    }
}

/// Pool of tool-server sessions owned by one coordinator.
pub struct McpPool {
    sessions: Mutex<HashMap<String, Arc<McpSession>>>,
}

impl Default for McpPool {
    fn default() -> Self {
        Self::new()
    }
}

impl McpPool {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Connect (idempotently) to a server and return its exposed tools.
    pub async fn connect(&self, manifest: &McpServerManifest) -> CoordResult<Vec<Tool>> {
        let session = {
            let mut sessions = self.sessions.lock().await;
            sessions
                .entry(manifest.id.clone())
                .or_insert_with(|| Arc::new(McpSession::new(manifest)))
                .clone()
        };
        session.connect(manifest).await?;
        let tools = session.tools.lock().await.clone();
        Ok(tools)
    }

    /// Whether `server_id` has a connected session.
    pub async fn has_server(&self, server_id: &str) -> bool {
        self.sessions.lock().await.contains_key(server_id)
    }

    /// Connected server ids, for the router's fallback heuristic.
    pub async fn server_ids(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    /// Call `tool_name` (exposed form) on `server_id`.
    pub async fn call(&self, server_id: &str, tool_name: &str, args: Value) -> CoordResult<Value> {
        let session = {
            let sessions = self.sessions.lock().await;
            sessions.get(server_id).cloned()
        };
        let Some(session) = session else {
            return Err(CoordinatorError::tool_execution(
                tool_name,
                format!("no connected tool server: {server_id}"),
            ));
        };
        session.call(tool_name, args).await
    }

    /// Tear down every session, best-effort.
    pub async fn close(&self) {
        let sessions: Vec<_> = self.sessions.lock().await.drain().collect();
        for (_, session) in sessions {
            session.close().await;
        }
    }
}

// ============================================================================
// Name sanitization
// ============================================================================

/// Sanitize an arbitrary printable string into the `[A-Za-z0-9_-]` set the
/// upstream protocols accept.
pub(crate) fn sanitize_tool_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if out.is_empty() {
        out.push('_');
    }
    out
}

/// Server-prefixed exposed name, collision-suffixed so the map stays
/// bijective.
fn exposed_name(server_id: &str, upstream: &str, taken: &HashMap<String, String>) -> String {
    let prefixed = if upstream.starts_with(&format!("{server_id}_"))
        || upstream.starts_with(&format!("{server_id}."))
    {
        upstream.to_string()
    } else {
        format!("{server_id}_{upstream}")
    };
    let base = sanitize_tool_name(&prefixed);
    if !taken.contains_key(&base) {
        return base;
    }
    let mut suffix = 2;
    loop {
        let candidate = format!("{base}_{suffix}");
        if !taken.contains_key(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}

/// Flatten an MCP call result: single-text content that parses as JSON
/// becomes that JSON, otherwise the joined text; structured content passes
/// through.
fn normalize_call_result(result: Value) -> Value {
    if let Some(structured) = result.get("structuredContent") {
        return structured.clone();
    }
    let text = content_text(&result);
    if text.is_empty() {
        return result;
    }
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

fn content_text(result: &Value) -> String {
    result
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|block| {
                    if block.get("type").and_then(Value::as_str) == Some("text") {
                        block.get("text").and_then(Value::as_str)
                    } else {
                        None
                    }
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}
