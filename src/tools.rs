//! Tool routing and invocation.
//!
//! A tool name is dispatched in a fixed order: the configured vector-search
//! tool first, then declared routes in declaration order (first match
//! wins), then a fallback heuristic that sends `<server>[_.]<rest>` names
//! to a connected subprocess tool server. Invocation kinds are in-process
//! module functions, one-shot child processes, HTTP POSTs, and tool-server
//! calls, all bounded by the route's timeout.
//!
//! Implementations may return either `{ "result": X }` or a bare `X`; the
//! invoker unwraps a top-level `result` key so the loop always sees `X`.

use futures_util::future::BoxFuture;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::error::{CoordResult, CoordinatorError};
use crate::logging::{log_debug, log_warn};
use crate::mcp::McpPool;
use crate::registry::{InvokeSpec, RouteManifest, RouteMatchType};

/// Context handed to in-process module tools.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub args: Value,
    /// Provider id of the priority entry driving the current turn
    pub provider: String,
    pub model: String,
    /// Caller metadata from the spec
    pub metadata: Option<Value>,
    /// Monotone invocation counter within the run
    pub call_progress: u32,
}

/// An in-process tool function.
pub type ModuleToolFn =
    Arc<dyn Fn(ToolContext) -> BoxFuture<'static, CoordResult<Value>> + Send + Sync>;

/// Registry of in-process module tools, keyed by the manifest's module
/// path. Registration happens once at startup; lookups are cached reads.
#[derive(Default)]
pub struct ModuleToolRegistry {
    functions: RwLock<HashMap<String, ModuleToolFn>>,
}

impl ModuleToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool function under a module path.
    pub fn register(&self, path: impl Into<String>, function: ModuleToolFn) {
        self.functions
            .write()
            .expect("module registry poisoned")
            .insert(path.into(), function);
    }

    fn get(&self, path: &str) -> Option<ModuleToolFn> {
        self.functions
            .read()
            .expect("module registry poisoned")
            .get(path)
            .cloned()
    }
}

/// Handler for the built-in vector-search tool, wired in by the context
/// injector when a run configures one.
pub type VectorSearchFn =
    Arc<dyn Fn(Value) -> BoxFuture<'static, CoordResult<Value>> + Send + Sync>;

/// A route with its matcher compiled once.
struct CompiledRoute {
    manifest: RouteManifest,
    /// Compiled regex for regex/glob matchers; `None` for exact/prefix or
    /// for patterns that failed to compile (those never match).
    pattern: Option<Regex>,
}

impl CompiledRoute {
    fn new(manifest: RouteManifest) -> Self {
        let pattern = match manifest.matcher.match_type {
            RouteMatchType::Exact | RouteMatchType::Prefix => None,
            RouteMatchType::Regex => compile(&manifest.matcher.pattern),
            RouteMatchType::Glob => compile(&glob_to_regex(&manifest.matcher.pattern)),
        };
        Self { manifest, pattern }
    }

    fn matches(&self, name: &str) -> bool {
        match self.manifest.matcher.match_type {
            RouteMatchType::Exact => name == self.manifest.matcher.pattern,
            RouteMatchType::Prefix => name.starts_with(&self.manifest.matcher.pattern),
            RouteMatchType::Regex | RouteMatchType::Glob => self
                .pattern
                .as_ref()
                .is_some_and(|regex| regex.is_match(name)),
        }
    }
}

fn compile(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(err) => {
            log_warn!(pattern = pattern, error = %err, "Route pattern failed to compile, route disabled");
            None
        }
    }
}

/// Translate a glob (`*`, `?`) into an anchored regex.
fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() + 4);
    out.push('^');
    for c in glob.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

/// Routes tool names and executes invocations with timeouts.
pub struct ToolInvoker {
    routes: Vec<CompiledRoute>,
    modules: Arc<ModuleToolRegistry>,
    pool: Option<Arc<McpPool>>,
    client: reqwest::Client,
    default_timeout: Duration,
    /// The vector-search tool name and handler, when a run configures one
    vector_search: Option<(String, VectorSearchFn)>,
}

impl ToolInvoker {
    pub fn new(
        routes: &[RouteManifest],
        modules: Arc<ModuleToolRegistry>,
        pool: Option<Arc<McpPool>>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            routes: routes.iter().cloned().map(CompiledRoute::new).collect(),
            modules,
            pool,
            client: reqwest::Client::new(),
            default_timeout,
            vector_search: None,
        }
    }

    /// Install the built-in vector-search handler for this run.
    pub fn set_vector_search(&mut self, tool_name: impl Into<String>, handler: VectorSearchFn) {
        self.vector_search = Some((tool_name.into(), handler));
    }

    /// Invoke `name` with `args`, honoring dispatch order and timeouts.
    pub async fn invoke(&self, name: &str, args: Value, ctx: ToolContext) -> CoordResult<Value> {
        if let Some((vector_name, handler)) = &self.vector_search {
            if name == vector_name {
                let result = handler(args).await?;
                return Ok(unwrap_result(result));
            }
        }

        if let Some(route) = self.routes.iter().find(|route| route.matches(name)) {
            let timeout = route
                .manifest
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(self.default_timeout);
            let result = self
                .invoke_route(&route.manifest.invoke, name, args, ctx, timeout)
                .await?;
            return Ok(unwrap_result(result));
        }

        // Fallback heuristic: <server-id>[_.]<rest> routes to a connected
        // tool server.
        if let Some(pool) = &self.pool {
            for server_id in pool.server_ids().await {
                let underscored = format!("{server_id}_");
                let dotted = format!("{server_id}.");
                if name.starts_with(&underscored) || name.starts_with(&dotted) {
                    let result = tokio::time::timeout(
                        self.default_timeout,
                        pool.call(&server_id, name, args),
                    )
                    .await
                    .map_err(|_| timed_out(name, self.default_timeout))??;
                    return Ok(unwrap_result(result));
                }
            }
        }

        Err(CoordinatorError::tool_execution(
            name,
            "no matching route".to_string(),
        ))
    }

    async fn invoke_route(
        &self,
        invoke: &InvokeSpec,
        name: &str,
        args: Value,
        ctx: ToolContext,
        timeout: Duration,
    ) -> CoordResult<Value> {
        log_debug!(tool = name, kind = ?invoke_kind(invoke), timeout_ms = timeout.as_millis() as u64, "Invoking tool");
        match invoke {
            InvokeSpec::Module { path, .. } => {
                let function = self.modules.get(path).ok_or_else(|| {
                    CoordinatorError::tool_execution(
                        name,
                        format!("no registered module tool at {path}"),
                    )
                })?;
                let future = function(ToolContext { args, ..ctx });
                tokio::time::timeout(timeout, future)
                    .await
                    .map_err(|_| timed_out(name, timeout))?
            }
            InvokeSpec::Command { command, args: argv, env } => {
                self.invoke_command(name, command, argv, env, &args, timeout)
                    .await
            }
            InvokeSpec::Http { url, headers } => {
                let mut request = self.client.post(url).json(&args);
                for (header, value) in headers {
                    request = request.header(header, value);
                }
                let response = tokio::time::timeout(timeout, request.send())
                    .await
                    .map_err(|_| timed_out(name, timeout))?
                    .map_err(|err| {
                        CoordinatorError::tool_execution(name, format!("HTTP invocation failed: {err}"))
                    })?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(CoordinatorError::tool_execution(
                        name,
                        format!("HTTP tool returned {status}: {body}"),
                    ));
                }
                tokio::time::timeout(timeout, response.json::<Value>())
                    .await
                    .map_err(|_| timed_out(name, timeout))?
                    .map_err(|err| {
                        CoordinatorError::tool_execution(name, format!("non-JSON tool response: {err}"))
                    })
            }
            InvokeSpec::Mcp { server } => {
                let Some(pool) = &self.pool else {
                    return Err(CoordinatorError::tool_execution(
                        name,
                        format!("route targets tool server {server} but none is connected"),
                    ));
                };
                tokio::time::timeout(timeout, pool.call(server, name, args))
                    .await
                    .map_err(|_| timed_out(name, timeout))?
            }
        }
    }

    /// One-shot child process: JSON args on stdin, JSON result on stdout.
    /// The timeout kills the child.
    async fn invoke_command(
        &self,
        name: &str,
        command: &str,
        argv: &[String],
        env: &std::collections::BTreeMap<String, String>,
        args: &Value,
        timeout: Duration,
    ) -> CoordResult<Value> {
        let mut child = tokio::process::Command::new(command)
            .args(argv)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                CoordinatorError::tool_execution(name, format!("cannot spawn {command}: {err}"))
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            CoordinatorError::tool_execution(name, "command tool has no stdin")
        })?;
        let payload = args.to_string();

        let run = async {
            stdin.write_all(payload.as_bytes()).await.map_err(|err| {
                CoordinatorError::tool_execution(name, format!("cannot write args: {err}"))
            })?;
            drop(stdin);
            let output = child.wait_with_output().await.map_err(|err| {
                CoordinatorError::tool_execution(name, format!("command tool failed: {err}"))
            })?;
            if !output.status.success() {
                return Err(CoordinatorError::tool_execution(
                    name,
                    format!("command tool exited with {}", output.status),
                ));
            }
            serde_json::from_slice::<Value>(&output.stdout).map_err(|err| {
                CoordinatorError::tool_execution(name, format!("non-JSON tool output: {err}"))
            })
        };

        tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| timed_out(name, timeout))?
    }
}

fn invoke_kind(invoke: &InvokeSpec) -> &'static str {
    match invoke {
        InvokeSpec::Module { .. } => "module",
        InvokeSpec::Command { .. } => "command",
        InvokeSpec::Http { .. } => "http",
        InvokeSpec::Mcp { .. } => "mcp",
    }
}

fn timed_out(name: &str, timeout: Duration) -> CoordinatorError {
    CoordinatorError::tool_execution(name, format!("timed out after {}ms", timeout.as_millis()))
}

/// Unwrap a top-level `{ "result": X }` envelope when present.
fn unwrap_result(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.len() == 1 && map.contains_key("result") => {
            map.remove("result").expect("checked above")
        }
        other => other,
    }
}
