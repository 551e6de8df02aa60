//! MyWant CLI
//!
//! Serves the engine with its REST API, validates want configs offline,
//! and applies configs to a running server.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

use mywant::api::RestApiServer;
use mywant::api::models::requests::AddWantsRequest;
use mywant::config::AppConfig;
use mywant::engine::ChainBuilder;
use mywant::observability;

#[derive(Parser)]
#[command(name = "mywant")]
#[command(about = "Declarative workflow engine: wants, agents, recipes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine and its REST API
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,
        /// Snapshot file to restore from and persist to
        #[arg(long)]
        snapshot: Option<PathBuf>,
        /// Directory of agent declaration files
        #[arg(long)]
        agents_dir: Option<PathBuf>,
        /// Directory of recipe files
        #[arg(long)]
        recipes_dir: Option<PathBuf>,
        /// Want config applied after startup
        #[arg(short, long)]
        wants: Option<PathBuf>,
    },

    /// Parse and validate a want config without running anything
    Validate {
        /// Want config file (YAML or JSON)
        file: PathBuf,
    },

    /// Post a want config to a running server
    Apply {
        /// Want config file (YAML or JSON)
        file: PathBuf,
        /// Server base URL
        #[arg(short, long, default_value = "http://127.0.0.1:8080")]
        server: String,
    },
}

/// Exit codes: 0 normal, 1 unrecoverable startup failure, 2 config error
fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config error: {:#}", e);
            return ExitCode::from(2);
        }
    };
    observability::init_logging(&config.logging);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("runtime startup failed: {}", e);
            return ExitCode::from(1);
        }
    };
    match runtime.block_on(run(cli, config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::load_from_env().context("loading configuration")?,
    };
    if let Commands::Serve {
        port,
        host,
        snapshot,
        agents_dir,
        recipes_dir,
        ..
    } = &cli.command
    {
        if let Some(port) = port {
            config.server.port = *port;
        }
        if let Some(host) = host {
            config.server.host = host.clone();
        }
        if let Some(snapshot) = snapshot {
            config.engine.snapshot_path = Some(snapshot.clone());
        }
        if let Some(dir) = agents_dir {
            config.engine.agents_dir = Some(dir.clone());
        }
        if let Some(dir) = recipes_dir {
            config.engine.recipes_dir = Some(dir.clone());
        }
        config.validate().context("validating configuration")?;
    }
    Ok(config)
}

async fn run(cli: Cli, config: AppConfig) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve { wants, .. } => serve(config, wants).await,
        Commands::Validate { file } => validate(&file),
        Commands::Apply { file, server } => apply(&file, &server).await,
    }
}

async fn serve(config: AppConfig, wants: Option<PathBuf>) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("parsing bind address")?;
    let handle = ChainBuilder::init(config).context("starting engine")?;

    if let Some(path) = wants {
        let request = read_config(&path)?;
        let ids = handle
            .add_wants(request.into_wants())
            .await
            .context("admitting startup wants")?;
        info!(count = ids.len(), "startup wants admitted");
    }

    let server = RestApiServer::new(handle.clone());
    let serve = tokio::spawn(async move { server.serve(addr).await });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    handle.shutdown().await.context("engine shutdown")?;
    serve.abort();
    Ok(())
}

fn validate(file: &PathBuf) -> anyhow::Result<()> {
    let request = read_config(file)?;
    let wants = request.into_wants();
    for want in &wants {
        want.validate()
            .with_context(|| format!("want {}", want.metadata.name))?;
    }
    println!("{}: {} wants ok", file.display(), wants.len());
    Ok(())
}

async fn apply(file: &PathBuf, server: &str) -> anyhow::Result<()> {
    let request = read_config(file)?;
    let url = format!("{}/api/v1/wants", server.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .post(&url)
        .json(&request)
        .send()
        .await
        .with_context(|| format!("posting to {}", url))?;
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        anyhow::bail!("server returned {}: {}", status, body);
    }
    println!("{}", body);
    Ok(())
}

fn read_config(path: &PathBuf) -> anyhow::Result<AddWantsRequest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e == "json")
        .unwrap_or(false);
    let request = if is_json {
        serde_json::from_str(&content)?
    } else {
        serde_yaml::from_str(&content)?
    };
    Ok(request)
}
