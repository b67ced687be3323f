//! code-runner - run untrusted programs in throwaway containers.
//!
//! Usage:
//!   code-runner serve [--port 5000]     # Start HTTP server
//!   code-runner run <file>              # Run one file and print its output

use clap::{Args as ClapArgs, Parser, Subcommand};
use code_runner::config::{self, Config, ResourceLimits, SchedulerConfig};
use code_runner::docker::{self, DockerEngine};
use code_runner::http_server;
use code_runner::sandbox::{ExecutionRequest, Outcome, Sandbox};
use code_runner::state::AppState;
use code_runner::workspace::WorkspaceManager;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "code-runner")]
#[command(about = "Sandboxed code runner with HTTP API")]
struct Args {
    /// Name labelling this runner's containers; orphan cleanup only touches
    /// containers with the same name
    #[arg(long, global = true, env = "CODE_RUNNER_INSTANCE", default_value = docker::DEFAULT_INSTANCE)]
    instance: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve(ServeArgs),
    /// Run a single source file and print its output
    Run {
        /// Source file; its extension selects the language
        file: PathBuf,

        #[command(flatten)]
        limits: LimitArgs,
    },
}

#[derive(ClapArgs, Debug)]
struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "CODE_RUNNER_PORT", default_value = "5000")]
    port: u16,

    /// Executions allowed to run at once
    #[arg(long, env = "CODE_RUNNER_MAX_CONCURRENT", default_value = "4")]
    max_concurrent: usize,

    /// Requests allowed to be pending (running or queued) before rejecting
    #[arg(long, env = "CODE_RUNNER_MAX_BACKLOG", default_value = "200")]
    max_backlog: usize,

    #[command(flatten)]
    limits: LimitArgs,
}

#[derive(ClapArgs, Debug)]
struct LimitArgs {
    /// Wall-clock limit per execution in milliseconds
    #[arg(long, env = "CODE_RUNNER_TIMEOUT_MS", default_value_t = config::DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Memory limit in MB (swap disabled)
    #[arg(long, env = "CODE_RUNNER_MEMORY_MB", default_value = "256")]
    memory_mb: i64,

    /// CPU quota as a fraction of one core
    #[arg(long, env = "CODE_RUNNER_CPUS", default_value = "0.5")]
    cpus: f64,

    /// Maximum number of processes inside the container
    #[arg(long, env = "CODE_RUNNER_PIDS_LIMIT", default_value = "64")]
    pids_limit: i64,

    /// Output kept per execution in KB
    #[arg(long, env = "CODE_RUNNER_MAX_OUTPUT_KB", default_value = "1024")]
    max_output_kb: usize,

    /// Directory holding per-request workspaces
    #[arg(long, env = "CODE_RUNNER_WORKSPACE_ROOT")]
    workspace_root: Option<PathBuf>,
}

impl LimitArgs {
    fn apply(&self, config: &mut Config) {
        config.timeout = Duration::from_millis(self.timeout_ms);
        config.limits = ResourceLimits {
            memory_bytes: self.memory_mb.saturating_mul(1024 * 1024),
            cpus: self.cpus,
            pids_limit: self.pids_limit,
            max_output_bytes: self.max_output_kb.saturating_mul(1024),
        };
        if let Some(root) = &self.workspace_root {
            config.workspace_root = root.clone();
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::default();
    match &args.command {
        Commands::Serve(serve) => {
            config.port = serve.port;
            config.scheduler = SchedulerConfig {
                max_concurrent: serve.max_concurrent,
                max_backlog: serve.max_backlog,
            };
            serve.limits.apply(&mut config);
        }
        Commands::Run { limits, .. } => limits.apply(&mut config),
    }
    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        exit(2);
    }

    let engine = match DockerEngine::connect(args.instance.as_str()) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            eprintln!("Error: cannot set up Docker client: {}", e);
            exit(1);
        }
    };

    match args.command {
        Commands::Serve(_) => serve(engine, config).await,
        Commands::Run { file, .. } => run_file(engine, config, file).await,
    }
}

async fn serve(engine: Arc<DockerEngine>, config: Config) {
    match engine.ping().await {
        Ok(()) => {
            if let Err(e) = engine.reap_orphans().await {
                warn!(error = %e, "Could not clean up orphaned containers");
            }
        }
        Err(e) => warn!(error = %e, "Docker daemon unreachable, executions will fail until it is up"),
    }
    if let Err(e) = WorkspaceManager::new(&config.workspace_root).reap_stale().await {
        warn!(error = %e, "Could not clean up stale workspaces");
    }

    info!(
        max_concurrent = config.scheduler.max_concurrent,
        max_backlog = config.scheduler.max_backlog,
        timeout_ms = config.timeout.as_millis() as u64,
        workspace_root = ?config.workspace_root,
        instance = %engine.instance(),
        "Scheduler configured"
    );

    let state = AppState::with_engine(engine, &config);
    if let Err(e) = http_server::run_server(config.port, state, shutdown_signal()).await {
        error!(error = %e, "HTTP server failed");
        exit(1);
    }
}

async fn run_file(engine: Arc<DockerEngine>, config: Config, file: PathBuf) {
    let code = match tokio::fs::read_to_string(&file).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: reading {}: {}", file.display(), e);
            exit(1);
        }
    };

    let sandbox = Sandbox::from_config(engine, &config);
    let request = ExecutionRequest::new(code, file.to_string_lossy());
    let result = sandbox.run(&request).await;

    println!("{}", result.output);
    exit(if result.outcome == Outcome::Success { 0 } else { 1 });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
