use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use netbk::config::AppConfig;
use netbk::context::AppContext;
use netbk::core::{BackupRequest, JobStatus};
use netbk::logging::{self, LogConfig};
use netbk::rpc::{MethodHandler, RpcClient, RpcServer};
use netbk::web::WebServer;
use netbk::{adapters, db};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "netbk")]
#[command(about = "Bulk network device configuration backup", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default /etc/netbk/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the backup daemon (RPC and HTTP API)
    Daemon(DaemonArgs),
    /// Start a bulk backup on the running daemon
    Backup(BackupArgs),
    /// Show daemon status
    Status,
    /// Show a job, or list recent jobs when no id is given
    Job(JobArgs),
    /// Show processed/total devices of a job
    Progress { id: String },
    /// Print the default configuration as TOML
    Config,
}

#[derive(Args, Serialize)]
struct DaemonArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    data_directory: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    database_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    rpc_bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    http_bind: Option<SocketAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,
}

#[derive(Args)]
struct BackupArgs {
    /// Inventory ids of the devices to back up
    #[arg(required = true)]
    device_ids: Vec<String>,

    #[arg(long)]
    repository: i64,

    #[arg(long)]
    credential: i64,

    #[arg(long, default_value_t = 1)]
    parallel: usize,

    /// Write the backup date into this inventory custom field
    #[arg(long)]
    timestamp_field: Option<String>,

    /// Follow progress until the job finishes
    #[arg(long)]
    wait: bool,
}

#[derive(Args)]
struct JobArgs {
    id: Option<String>,

    #[arg(long, default_value_t = 20)]
    limit: u32,

    #[arg(long)]
    status: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Daemon(args) => AppConfig::new(cli.config.as_deref(), Some(args))?,
        _ => AppConfig::new(cli.config.as_deref(), None::<&DaemonArgs>)?,
    };

    logging::init(LogConfig::from(&config));

    let client = RpcClient::new(config.rpc_bind);
    match cli.command {
        Commands::Daemon(_) => run_daemon(config).await.context("Daemon failed")?,
        Commands::Backup(args) => run_backup(&client, args).await?,
        Commands::Status => print_json(&client.status().await?)?,
        Commands::Job(args) => match args.id {
            Some(id) => print_json(&client.job(&id).await?)?,
            None => {
                let status = args
                    .status
                    .as_deref()
                    .map(|s| JobStatus::parse(s).with_context(|| format!("Unknown job status: {s}")))
                    .transpose()?;
                print_json(&client.jobs(args.limit, status).await?)?
            }
        },
        Commands::Progress { id } => print_json(&client.progress(&id).await?)?,
        Commands::Config => print!("{}", AppConfig::default().to_toml()?),
    }

    Ok(())
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let db_conn = db::init(&config.database_path).await?;
    let services = adapters::build_services(&config)?;
    let ctx = AppContext::new(config, db_conn, services);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        simulation = ctx.config.simulation,
        repositories = ctx.config.repositories.len(),
        "netbk daemon starting"
    );

    let cancel = CancellationToken::new();
    let sweeper = ctx
        .progress
        .spawn_sweeper(Duration::from_secs(60), cancel.clone());

    let handler = Arc::new(MethodHandler::new(ctx.clone()));
    let rpc = Arc::new(RpcServer::new(handler.clone(), ctx.config.rpc_bind));
    let web = Arc::new(WebServer::new(handler, ctx.config.http_bind));

    let rpc_task = tokio::spawn({
        let rpc = rpc.clone();
        async move { rpc.start().await }
    });
    let web_task = tokio::spawn({
        let web = web.clone();
        async move { web.start().await }
    });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Shutdown requested");
        }
        result = wait_server("RPC", rpc_task) => result?,
        result = wait_server("HTTP", web_task) => result?,
    }

    rpc.shutdown();
    web.shutdown();
    cancel.cancel();
    let _ = sweeper.await;

    info!("netbk daemon stopped");
    Ok(())
}

async fn wait_server(name: &str, task: tokio::task::JoinHandle<Result<()>>) -> Result<()> {
    match task.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(server = name, error = %e, "Server stopped");
            Err(e.context(format!("{name} server failed")))
        }
        Err(e) => Err(anyhow::anyhow!("{name} server task panicked: {e}")),
    }
}

async fn run_backup(client: &RpcClient, args: BackupArgs) -> Result<()> {
    let request = BackupRequest {
        device_ids: args.device_ids,
        repository_id: args.repository,
        credential_id: args.credential,
        parallel_tasks: args.parallel,
        write_timestamp_to_custom_field: args.timestamp_field.is_some(),
        timestamp_custom_field_name: args.timestamp_field,
    };

    let started = client.start_backup(&request).await?;
    println!("Job {} accepted ({} devices)", started.job_id, started.total_devices);

    if !args.wait {
        return Ok(());
    }

    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let job = client.job(&started.job_id).await?;
        println!(
            "  {}/{} devices processed",
            job.record.processed_devices, job.record.total_devices
        );
        if job.record.status.is_terminal() {
            return print_json(&job);
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
