use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use batch_lb::api::{run_api, ApiState};
use batch_lb::config::{
    parse_resources, RunnerConfig, SchedulerConfig, ServerConfig, DEFAULT_MAX_UPLOAD_BYTES,
    DEFAULT_RESOURCES,
};
use batch_lb::payload::FsPayloadStore;
use batch_lb::scheduler::{AllocationPolicy, QueueMode};
use batch_lb::service::BatchService;
use batch_lb::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "batch-lb")]
#[command(version)]
#[command(about = "Queue jobs and lease them to exclusive execution targets")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server and the dispatcher
    Server(ServerArgs),

    /// Validate and print a resource inventory
    Inventory {
        #[command(flatten)]
        inventory: InventoryArgs,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct InventoryArgs {
    /// Resources (comma-separated, format: "vendor/model@id")
    /// Example: "cisco/c8k@10.0.0.1,cisco/c8k@10.0.0.2"
    #[arg(long, default_value = DEFAULT_RESOURCES)]
    resources: String,
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Port to listen on for HTTP
    #[arg(long, default_value = "8000")]
    port: u16,

    /// Bind address
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Directory holding job payloads
    #[arg(long, default_value = "./data/tickets")]
    data_dir: PathBuf,

    #[command(flatten)]
    inventory: InventoryArgs,

    /// How a free resource is picked within a class
    #[arg(long, default_value = "first-free")]
    policy: PolicyArg,

    /// Whether a busy class blocks jobs of other classes queued behind it
    #[arg(long, default_value = "per-class")]
    queue_mode: QueueModeArg,

    /// Number of executor workers (defaults to one per resource)
    #[arg(long)]
    workers: Option<usize>,

    /// Maximum accepted upload size in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    max_upload_bytes: usize,

    /// Shell command that executes a job (payload on stdin).
    /// Without it, execution is simulated.
    #[arg(long)]
    command: Option<String>,

    /// Simulated execution time
    #[arg(long, default_value = "10000", conflicts_with = "command")]
    sim_duration_ms: u64,

    /// Simulated success probability
    #[arg(long, default_value = "0.8", conflicts_with = "command", value_parser = parse_success_rate)]
    sim_success_rate: f64,
}

fn parse_success_rate(s: &str) -> Result<f64, String> {
    let rate: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if !(0.0..=1.0).contains(&rate) {
        return Err(format!("{rate} is not a probability between 0 and 1"));
    }
    Ok(rate)
}

#[derive(Debug, Clone, ValueEnum)]
enum PolicyArg {
    FirstFree,
    RoundRobin,
}

impl From<PolicyArg> for AllocationPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::FirstFree => AllocationPolicy::FirstFree,
            PolicyArg::RoundRobin => AllocationPolicy::RoundRobin,
        }
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum QueueModeArg {
    PerClass,
    Strict,
}

impl From<QueueModeArg> for QueueMode {
    fn from(arg: QueueModeArg) -> Self {
        match arg {
            QueueModeArg::PerClass => QueueMode::PerClass,
            QueueModeArg::Strict => QueueMode::Strict,
        }
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct ResourceOutput {
    id: String,
    vendor: String,
    model: String,
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let listen_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;

    let mut scheduler = SchedulerConfig::new(parse_resources(&args.inventory.resources)?)
        .with_policy(args.policy.into())
        .with_queue_mode(args.queue_mode.into());
    if let Some(workers) = args.workers {
        scheduler = scheduler.with_workers(workers);
    }

    let runner = match args.command {
        Some(command) => RunnerConfig::Command { command },
        None => RunnerConfig::Simulated {
            duration_ms: args.sim_duration_ms,
            success_rate: args.sim_success_rate,
        },
    };

    let config = ServerConfig {
        listen_addr,
        data_dir: args.data_dir,
        max_upload_bytes: args.max_upload_bytes,
        scheduler,
        runner,
    };

    if config.scheduler.resources.is_empty() {
        return Err("no resources configured (--resources)".into());
    }

    tracing::info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir.display(),
        resources = config.scheduler.resources.len(),
        workers = config.scheduler.worker_count(),
        policy = ?config.scheduler.policy,
        queue_mode = ?config.scheduler.queue_mode,
        runner = ?config.runner,
        "Starting batch-lb"
    );

    let shutdown = CancellationToken::new();
    install_shutdown_handler(shutdown.clone())?;

    let payloads = Arc::new(FsPayloadStore::new(&config.data_dir));
    let service = BatchService::start(
        &config.scheduler,
        payloads,
        config.runner.build(),
        shutdown.clone(),
    )
    .await?;

    let state = ApiState {
        service: Arc::new(service),
        max_upload_bytes: config.max_upload_bytes,
    };
    run_api(config.listen_addr, state, shutdown.clone()).await?;

    shutdown.cancel();
    tracing::info!("Shutdown complete");
    Ok(())
}

fn print_inventory(
    args: InventoryArgs,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let resources = parse_resources(&args.resources)?;

    match output_format {
        OutputFormat::Json => {
            let output: Vec<ResourceOutput> = resources
                .into_iter()
                .map(|r| ResourceOutput {
                    id: r.id,
                    vendor: r.class.vendor,
                    model: r.class.model,
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if resources.is_empty() {
                println!("No resources configured.");
                return Ok(());
            }
            println!("{:<24} CLASS", "RESOURCE");
            println!("{}", "-".repeat(40));
            for r in &resources {
                println!("{:<24} {}", r.id, r.class);
            }
            println!();
            println!("{} resources", resources.len());
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
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Inventory { inventory, output } => {
            print_inventory(inventory, &output)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_must_be_a_probability() {
        assert_eq!(parse_success_rate("0.8"), Ok(0.8));
        assert_eq!(parse_success_rate("1"), Ok(1.0));
        assert!(parse_success_rate("NaN").is_err());
        assert!(parse_success_rate("inf").is_err());
        assert!(parse_success_rate("1.5").is_err());
        assert!(parse_success_rate("-0.1").is_err());
        assert!(parse_success_rate("often").is_err());
    }
}
