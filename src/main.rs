use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use judgehub::broker::{self, Broker, BrokerClient};
use judgehub::config::{BrokerConfig, GatewayConfig, KeepaliveConfig, WorkerConfig};
use judgehub::gateway;
use judgehub::model::{JudgeUpdate, Language, Submission};
use judgehub::proto::judge::{SubmissionRequest, SubmitRequest, TestCase, UpdatesRequest};
use judgehub::sandbox::{GrpcSandbox, LocalSandbox, Sandbox};
use judgehub::shutdown::install_shutdown_handler;
use judgehub::store::MemoryStore;
use judgehub::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "judgehub")]
#[command(version)]
#[command(about = "Online judge broker, grading worker and web gateway")]
#[command(propagate_version = true)]
struct Args {
    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "RELEASE")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the dispatch broker
    Broker(BrokerArgs),

    /// Run a grading worker
    Worker(WorkerArgs),

    /// Run the HTTP/WebSocket gateway
    Gateway(GatewayArgs),

    /// Submit a source file for grading
    Submit {
        #[command(flatten)]
        client: ClientArgs,

        #[command(flatten)]
        submission: SubmitArgs,
    },

    /// List submissions, newest first
    List {
        #[command(flatten)]
        client: ClientArgs,

        /// Only show submissions older than this id
        #[arg(long)]
        before: Option<String>,
    },

    /// Follow judge updates as they happen
    Watch {
        #[command(flatten)]
        client: ClientArgs,

        /// Only show updates for this submission and stop once it finishes
        #[arg(long)]
        id: Option<String>,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct BrokerArgs {
    /// Address to listen on for gRPC
    #[arg(long, env = "GRPC_ADDR", default_value = "127.0.0.1:5081")]
    grpc_addr: SocketAddr,

    /// Sandbox executor address. Without it commands run as local processes.
    #[arg(long, env = "EXEC_SERVER")]
    exec_server: Option<String>,

    /// Bearer token required on every call
    #[arg(long, env = "TOKEN")]
    token: Option<String>,

    /// Maximum number of pending judge requests
    #[arg(long, default_value = "64")]
    queue_capacity: usize,
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Broker address
    #[arg(long, env = "BROKER_ADDR", default_value = "http://127.0.0.1:5081")]
    broker_addr: String,

    /// Sandbox executor address. Without it commands run as local processes.
    #[arg(long, env = "EXEC_SERVER")]
    exec_server: Option<String>,

    /// Bearer token sent to the broker
    #[arg(long, env = "TOKEN")]
    token: Option<String>,
}

#[derive(Parser, Debug)]
struct GatewayArgs {
    /// HTTP port
    #[arg(long, env = "PORT", default_value = "5000")]
    port: u16,

    /// Bind on all interfaces instead of loopback
    #[arg(long)]
    public: bool,

    /// Broker address
    #[arg(long, env = "BROKER_ADDR", default_value = "http://127.0.0.1:5081")]
    broker_addr: String,

    /// Bearer token sent to the broker
    #[arg(long, env = "TOKEN")]
    token: Option<String>,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Broker address
    #[arg(long, short = 'a', env = "BROKER_ADDR", default_value = "http://127.0.0.1:5081")]
    addr: String,

    /// Bearer token sent to the broker
    #[arg(long, env = "TOKEN")]
    token: Option<String>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Parser, Debug)]
struct SubmitArgs {
    /// Source file to grade
    source: PathBuf,

    /// Language name, e.g. "c" or "java"
    #[arg(long, short = 'l')]
    language: String,

    /// Compile command, split shell-style
    #[arg(long)]
    compile_cmd: String,

    /// Run command, split shell-style
    #[arg(long)]
    run_cmd: String,

    /// File name the source is stored under. Defaults to the source's own name.
    #[arg(long)]
    source_file_name: Option<String>,

    /// Files produced by the compile step (repeatable)
    #[arg(long = "executable", short = 'e')]
    executables: Vec<String>,

    /// Test case as INPUT_FILE:ANSWER_FILE (repeatable)
    #[arg(long = "case", short = 'c', value_parser = parse_case)]
    cases: Vec<(PathBuf, PathBuf)>,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct SubmitOutput {
    id: String,
}

#[derive(Serialize)]
struct ListOutput {
    submissions: Vec<Submission>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn parse_case(s: &str) -> Result<(PathBuf, PathBuf), String> {
    match s.split_once(':') {
        Some((input, answer)) if !input.is_empty() && !answer.is_empty() => {
            Ok((PathBuf::from(input), PathBuf::from(answer)))
        }
        _ => Err(format!("expected INPUT_FILE:ANSWER_FILE, got {:?}", s)),
    }
}

fn make_sandbox(
    exec_server: Option<&str>,
    keepalive: &KeepaliveConfig,
) -> Result<Arc<dyn Sandbox>, Box<dyn std::error::Error>> {
    match exec_server {
        Some(addr) => {
            tracing::info!(exec_server = %addr, "Using remote sandbox executor");
            Ok(Arc::new(GrpcSandbox::connect_lazy(addr, keepalive)?))
        }
        None => {
            tracing::warn!("No sandbox executor configured, running commands as local processes");
            Ok(Arc::new(LocalSandbox::new()))
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max - 3).collect();
        format!("{}...", head)
    } else {
        s.to_string()
    }
}

async fn client(args: &ClientArgs) -> Result<BrokerClient, Box<dyn std::error::Error>> {
    Ok(broker::connect(&args.addr, args.token.as_deref(), &KeepaliveConfig::default()).await?)
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_broker(args: BrokerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = BrokerConfig::new(args.grpc_addr).with_queue_capacity(args.queue_capacity);
    if let Some(token) = args.token {
        config = config.with_auth_token(token);
    }

    let sandbox = make_sandbox(args.exec_server.as_deref(), &config.keepalive)?;
    let store = Arc::new(MemoryStore::new());
    let shutdown = install_shutdown_handler();

    Broker::new(config, store, sandbox, shutdown).serve().await?;
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = WorkerConfig {
        auth_token: args.token,
        ..WorkerConfig::new(args.broker_addr)
    };
    let sandbox = make_sandbox(args.exec_server.as_deref(), &config.keepalive)?;
    let shutdown = install_shutdown_handler();

    tracing::info!(broker = %config.broker_addr, "Starting worker");
    Worker::new(config, sandbox).run(shutdown).await;
    Ok(())
}

async fn run_gateway(args: GatewayArgs) -> Result<(), Box<dyn std::error::Error>> {
    let host = if args.public { "0.0.0.0" } else { "127.0.0.1" };
    let config = GatewayConfig {
        listen_addr: format!("{}:{}", host, args.port).parse()?,
        broker_addr: args.broker_addr,
        auth_token: args.token,
        ..GatewayConfig::default()
    };
    let shutdown = install_shutdown_handler();
    gateway::run(config, shutdown).await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_submit(
    client: &mut BrokerClient,
    args: SubmitArgs,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let source = tokio::fs::read_to_string(&args.source).await?;
    let source_file_name = match args.source_file_name {
        Some(name) => name,
        None => args
            .source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or("source path has no file name")?,
    };

    let mut cases = Vec::with_capacity(args.cases.len());
    for (input, answer) in &args.cases {
        cases.push(TestCase {
            input: tokio::fs::read(input).await?,
            answer: tokio::fs::read(answer).await?,
        });
    }

    let language = Language {
        name: args.language,
        source_file_name,
        compile_cmd: args.compile_cmd,
        run_cmd: args.run_cmd,
        executables: args.executables,
    };

    let response = match client
        .submit(SubmitRequest {
            language: Some(language.into()),
            source,
            cases,
        })
        .await
    {
        Ok(response) => response.into_inner(),
        Err(status) => {
            eprintln!("Error: Submission failed: {}", status.message());
            std::process::exit(1);
        }
    };

    match output_format {
        OutputFormat::Json => {
            let output = SubmitOutput { id: response.id };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Submitted successfully!");
            println!("Submission ID: {}", response.id);
        }
    }
    Ok(())
}

async fn handle_list(
    client: &mut BrokerClient,
    before: Option<String>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .submission(SubmissionRequest {
            id: before.unwrap_or_default(),
        })
        .await?
        .into_inner();
    let submissions: Vec<Submission> = response
        .submissions
        .into_iter()
        .map(Submission::from)
        .collect();

    match output_format {
        OutputFormat::Json => {
            let output = ListOutput { submissions };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if submissions.is_empty() {
                println!("No submissions found.");
                return Ok(());
            }
            println!(
                "{:<18} {:<10} {:<24} {:>8} {:>10} CREATED",
                "ID", "LANGUAGE", "STATUS", "TIME", "MEMORY"
            );
            println!("{}", "-".repeat(96));
            for s in &submissions {
                println!(
                    "{:<18} {:<10} {:<24} {:>6}ms {:>7}KiB {}",
                    s.id,
                    truncate(&s.language.name, 10),
                    truncate(&s.status, 24),
                    s.total_time_ms,
                    s.max_memory_kib,
                    s.created_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
            if let Some(last) = submissions.last() {
                println!();
                println!("Older: judgehub list --before {}", last.id);
            }
        }
    }
    Ok(())
}

async fn handle_watch(
    client: &mut BrokerClient,
    id: Option<String>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut updates = client.updates(UpdatesRequest {}).await?.into_inner();

    while let Some(update) = updates.message().await? {
        let update = match JudgeUpdate::try_from(update) {
            Ok(update) => update,
            Err(e) => {
                eprintln!("Skipping malformed update: {}", e);
                continue;
            }
        };
        if id.as_deref().is_some_and(|id| id != update.id) {
            continue;
        }

        match output_format {
            OutputFormat::Json => println!("{}", serde_json::to_string(&update)?),
            OutputFormat::Table => {
                let marker = if update.is_finished() { "[done]" } else { "[....]" };
                println!("{} {:<18} {}", marker, update.id, update.status);
                if update.is_finished() {
                    for (i, result) in update.results.iter().enumerate() {
                        let step = if i == 0 {
                            "compile".to_string()
                        } else {
                            format!("case {}", i)
                        };
                        println!(
                            "    {:<10} {:>6}ms {:>8}KiB {}",
                            step,
                            result.time_ms,
                            result.memory_kib,
                            truncate(result.log.lines().next().unwrap_or(""), 48)
                        );
                    }
                }
            }
        }

        if id.is_some() && update.is_finished() {
            break;
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Broker(broker_args) => {
            init_logging(args.json_logs);
            run_broker(broker_args).await?;
        }
        Commands::Worker(worker_args) => {
            init_logging(args.json_logs);
            run_worker(worker_args).await?;
        }
        Commands::Gateway(gateway_args) => {
            init_logging(args.json_logs);
            run_gateway(gateway_args).await?;
        }
        Commands::Submit { client: c, submission } => {
            let mut grpc_client = client(&c).await?;
            handle_submit(&mut grpc_client, submission, &c.output).await?;
        }
        Commands::List { client: c, before } => {
            let mut grpc_client = client(&c).await?;
            handle_list(&mut grpc_client, before, &c.output).await?;
        }
        Commands::Watch { client: c, id } => {
            let mut grpc_client = client(&c).await?;
            handle_watch(&mut grpc_client, id, &c.output).await?;
        }
    }

    Ok(())
}
