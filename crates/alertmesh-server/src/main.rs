//! alertmesh - clustered alert deduplication, grouping and routing.

use std::net::SocketAddr;
use std::path::PathBuf;

use alertmesh_server::{AlertmeshServer, ServerConfig, reload_on_sighup, shutdown_on_signal};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "alertmesh")]
#[command(about = "Clustered alert deduplication, grouping and routing")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, env = "ALERTMESH_CONFIG", default_value = "alertmesh.toml", global = true)]
    config: PathBuf,

    /// Override the HTTP listen address
    #[arg(long, global = true)]
    listen: Option<SocketAddr>,

    /// Override the peer id
    #[arg(long, global = true)]
    peer_id: Option<String>,

    /// Additional seed peer address (repeatable)
    #[arg(long = "seed", global = true)]
    seeds: Vec<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server (default)
    Run,

    /// Validate the config file and print the routing tree
    CheckConfig,
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("alertmesh=info".parse()?);
    let (text, json) = match format {
        LogFormat::Text => (Some(fmt::layer()), None),
        LogFormat::Json => (None, Some(fmt::layer().json())),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .init();
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<ServerConfig> {
    let mut config = ServerConfig::from_file(&cli.config)?;
    if let Some(listen) = cli.listen {
        config = config.with_listen(listen);
    }
    if let Some(peer_id) = &cli.peer_id {
        config = config.with_peer_id(peer_id.clone());
    }
    config = config.with_seeds(cli.seeds.iter().cloned());
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    match cli.command.as_ref().unwrap_or(&Commands::Run) {
        Commands::Run => run(&cli).await?,
        Commands::CheckConfig => check_config(&cli)?,
    }

    Ok(())
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    info!(config = %cli.config.display(), "starting alertmesh");
    let config = load_config(cli)?;
    let listen = config.server.listen;

    let server = AlertmeshServer::new(config, Some(cli.config.clone()))?;
    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));
    tokio::spawn(reload_on_sighup(server.state(), shutdown.clone()));

    server.serve_with_shutdown(listen, shutdown).await?;
    Ok(())
}

fn check_config(cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    let routing = config.routing()?;

    println!("config OK: {}", cli.config.display());
    println!(
        "receivers: {}",
        config.receiver_names().into_iter().collect::<Vec<_>>().join(", ")
    );
    println!("inhibit rules: {}", routing.inhibitor().rule_count());
    println!("routing tree:");
    print!("{}", routing.route().describe());
    Ok(())
}
