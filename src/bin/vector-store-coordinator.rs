// vector-store-coordinator CLI: vector-store and embedding operations
// against the plugin registry.

use clap::{Args, Parser, Subcommand};
use futures_util::StreamExt;
use llm_coordinator::{
    CoordinatorError, Defaults, PluginRegistry, VectorCoordinator, VectorOperation,
};
use serde_json::json;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(
    name = "vector-store-coordinator",
    version,
    about = "Vector-store and embedding coordinator"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute an operation spec and print the result
    Run(SpecArgs),
    /// Execute an operation spec and print stream events as JSON lines
    Stream(SpecArgs),
    /// Embed inputs: {"inputs": [...], "stores": [...]}
    Embed(SpecArgs),
    /// Upsert points: {"store": "...", "points": [...]}
    Upsert(SpecArgs),
    /// Query a store: {"store": "...", "query": "..."}
    Query(SpecArgs),
    /// Delete points by id: {"store": "...", "ids": [...]}
    Delete(SpecArgs),
    /// Collection management: {"operation": "listCollections", ...}
    Collections(SpecArgs),
    /// Alias of `embed` matching the HTTP route name
    #[command(name = "embeddings-run")]
    EmbeddingsRun(SpecArgs),
}

#[derive(Debug, Args)]
struct SpecArgs {
    /// Read the operation from a file (standard input when neither --file
    /// nor --spec is given)
    #[arg(long)]
    file: Option<PathBuf>,
    /// Inline operation JSON
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
    let (args, implied, streaming) = match cli.command {
        Command::Run(args) => (args, None, false),
        Command::Stream(args) => (args, None, true),
        Command::Embed(args) | Command::EmbeddingsRun(args) => (args, Some("embed"), false),
        Command::Upsert(args) => (args, Some("upsert"), false),
        Command::Query(args) => (args, Some("query"), false),
        Command::Delete(args) => (args, Some("delete"), false),
        Command::Collections(args) => (args, Some("listCollections"), false),
    };

    if let Err(err) = run(args, implied, streaming).await {
        let line = json!({ "type": "error", "error": { "code": err.code, "message": err.message } });
        eprintln!("{line}");
        std::process::exit(1);
    }
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

fn read_operation(
    args: &SpecArgs,
    implied: Option<&str>,
) -> Result<VectorOperation, CoordinatorError> {
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

    let mut value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|err| CoordinatorError::validation(format!("Invalid JSON: {err}")))?;
    // Subcommands imply the operation discriminator when the body omits it.
    if let (Some(operation), Some(map)) = (implied, value.as_object_mut()) {
        map.entry("operation".to_string())
            .or_insert_with(|| json!(operation));
    }
    serde_json::from_value(value).map_err(|err| CoordinatorError::validation(err.to_string()))
}

async fn run(
    args: SpecArgs,
    implied: Option<&str>,
    streaming: bool,
) -> Result<(), CliError> {
    if let Some(batch_id) = &args.batch_id {
        std::env::set_var("LLM_ADAPTER_BATCH_ID", batch_id);
    }
    let operation = read_operation(&args, implied)?;
    let registry = Arc::new(PluginRegistry::new(&args.plugins)?);
    let defaults = Defaults::load(&args.configs);
    let coordinator = VectorCoordinator::new(registry, defaults);

    let result = if streaming {
        let mut events = coordinator.stream(operation).await?;
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
            .run(operation)
            .await
            .map(|data| {
                print_value(&data, args.pretty);
            })
            .map_err(CliError::from)
    };

    coordinator.close().await;
    result
}

fn print_value(value: &serde_json::Value, pretty: bool) {
    if pretty {
        println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
    } else {
        println!("{value}");
    }
}
