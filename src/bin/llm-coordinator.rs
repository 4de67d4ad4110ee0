// llm-coordinator CLI: run or stream a call spec, or serve the HTTP/SSE
// front end.

use clap::{Args, Parser, Subcommand};
use futures_util::StreamExt;
use llm_coordinator::{
    serve, AppState, AuthConfig, CallSpec, CoordinatorError, Defaults, KeyList, LlmCoordinator,
    ModuleToolRegistry, PluginRegistry, ServerConfig,
};
use serde_json::json;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "llm-coordinator", version, about = "Provider-agnostic LLM workload coordinator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute a spec and print the unified response
    Run(SpecArgs),
    /// Execute a spec and print stream events as JSON lines
    Stream(SpecArgs),
    /// Serve the HTTP/SSE API
    Serve(ServeArgs),
}

#[derive(Debug, Args)]
struct SpecArgs {
    /// Read the spec from a file (standard input when neither --file nor
    /// --spec is given)
    #[arg(long)]
    file: Option<PathBuf>,
    /// Inline spec JSON
    #[arg(long)]
    spec: Option<String>,
    /// Plugin root directory
    #[arg(long, default_value = "./plugins")]
    plugins: PathBuf,
    /// Configuration directory holding defaults.json
    #[arg(long, default_value = "./configs")]
    configs: PathBuf,
    /// Pretty-print output
    #[arg(long)]
    pretty: bool,
    /// Batch id threaded through logs and exposed to subprocess tools
    #[arg(long)]
    batch_id: Option<String>,
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[command(flatten)]
    spec: SpecArgs,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    max_request_bytes: Option<usize>,
    #[arg(long)]
    body_read_timeout_ms: Option<u64>,
    /// Total request deadline; 0 disables
    #[arg(long)]
    request_timeout_ms: Option<u64>,
    #[arg(long)]
    stream_idle_timeout_ms: Option<u64>,
    /// Per-route concurrency cap; 0 means unlimited
    #[arg(long)]
    max_concurrent: Option<usize>,
    #[arg(long)]
    max_queue_size: Option<usize>,
    #[arg(long)]
    queue_timeout_ms: Option<u64>,
    /// Enable the per-client token bucket
    #[arg(long)]
    rate_limit: bool,
    #[arg(long)]
    requests_per_minute: Option<u32>,
    #[arg(long)]
    burst: Option<u32>,
    #[arg(long)]
    trust_proxy_headers: bool,
    /// API keys (repeatable or comma-separated); enables auth
    #[arg(long)]
    api_key: Vec<String>,
    /// Header name checked alongside Authorization: Bearer
    #[arg(long, default_value = "x-api-key")]
    auth_header: String,
    /// Allowed CORS origin (repeatable; * matches any)
    #[arg(long)]
    cors_origin: Vec<String>,
    #[arg(long)]
    no_security_headers: bool,
}

/// Terminal CLI failure: the wire code is carried verbatim, so streamed
/// error events keep their original code on exit.
struct CliError {
    code: String,
    message: String,
}

impl From<CoordinatorError> for CliError {
    fn from(err: CoordinatorError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_coordinator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Run(args) => run(args, false).await,
        Command::Stream(args) => run(args, true).await,
        Command::Serve(args) => serve_command(args).await,
    };

    if let Err(err) = outcome {
        let line = json!({ "type": "error", "error": { "code": err.code, "message": err.message } });
        eprintln!("{line}");
        std::process::exit(1);
    }
}

fn read_spec(args: &SpecArgs) -> Result<CallSpec, CoordinatorError> {
    let raw = if let Some(file) = &args.file {
        std::fs::read_to_string(file)
            .map_err(|err| CoordinatorError::validation(format!("cannot read {}: {err}", file.display())))?
    } else if let Some(inline) = &args.spec {
        inline.clone()
    } else {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .map_err(|err| CoordinatorError::validation(format!("cannot read stdin: {err}")))?;
        buffer
    };

    let mut spec: CallSpec = serde_json::from_str(&raw)
        .map_err(|err| CoordinatorError::validation(format!("Invalid JSON: {err}")))?;
    spec.validate()?;

    if let Some(batch_id) = &args.batch_id {
        // Exposed to subprocess tools and threaded into the runtime
        // settings for the logger.
        std::env::set_var("LLM_ADAPTER_BATCH_ID", batch_id);
        spec.settings
            .entry("batchId".to_string())
            .or_insert_with(|| json!(batch_id));
    }
    Ok(spec)
}

async fn run(args: SpecArgs, streaming: bool) -> Result<(), CliError> {
    let spec = read_spec(&args)?;
    let registry = Arc::new(PluginRegistry::new(&args.plugins)?);
    let defaults = Defaults::load(&args.configs);
    let coordinator = LlmCoordinator::new(registry, defaults);

    let result = if streaming {
        let mut events = coordinator.stream(&spec).await?;
        let mut failed = None;
        while let Some(event) = events.next().await {
            if let llm_coordinator::StreamEvent::Error { message, code } = &event {
                failed = Some(CliError {
                    code: code.clone(),
                    message: message.clone(),
                });
            }
            print_value(&serde_json::to_value(&event).unwrap_or_default(), args.pretty);
        }
        match failed {
            Some(err) => Err(err),
            None => Ok(()),
        }
    } else {
        coordinator
            .run(&spec)
            .await
            .map(|response| {
                print_value(&serde_json::to_value(&response).unwrap_or_default(), args.pretty);
            })
            .map_err(CliError::from)
    };

    coordinator.close().await;
    result
}

async fn serve_command(args: ServeArgs) -> Result<(), CliError> {
    let registry = Arc::new(PluginRegistry::new(&args.spec.plugins)?);
    let defaults = Defaults::load(&args.spec.configs);

    let mut config = ServerConfig::from_defaults(&defaults);
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(value) = args.max_request_bytes {
        config.max_request_bytes = value;
    }
    if let Some(value) = args.body_read_timeout_ms {
        config.body_read_timeout_ms = value;
    }
    if let Some(value) = args.request_timeout_ms {
        config.request_timeout_ms = value;
    }
    if let Some(value) = args.stream_idle_timeout_ms {
        config.stream_idle_timeout_ms = value;
    }
    if let Some(value) = args.max_concurrent {
        config.max_concurrent = (value > 0).then_some(value);
    }
    if let Some(value) = args.max_queue_size {
        config.max_queue_size = value;
    }
    if let Some(value) = args.queue_timeout_ms {
        config.queue_timeout_ms = value;
    }
    config.rate_limit_enabled = args.rate_limit;
    if let Some(value) = args.requests_per_minute {
        config.requests_per_minute = value;
    }
    if let Some(value) = args.burst {
        config.burst = value;
    }
    config.trust_proxy_headers = args.trust_proxy_headers;
    if !args.cors_origin.is_empty() {
        config.cors_origins = args.cors_origin;
    }
    if args.no_security_headers {
        config.security_headers_enabled = false;
    }

    let auth = if args.api_key.is_empty() {
        AuthConfig::disabled()
    } else {
        AuthConfig::enabled(&KeyList::List(args.api_key)).with_header_name(args.auth_header)
    };

    let state = AppState::new(
        registry,
        defaults,
        config,
        auth,
        Arc::new(ModuleToolRegistry::new()),
    );
    serve(state).await.map_err(CoordinatorError::Internal)?;
    Ok(())
}

fn print_value(value: &serde_json::Value, pretty: bool) {
    if pretty {
        println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
    } else {
        println!("{value}");
    }
}
