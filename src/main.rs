use clap::Parser;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;

use cli::{Cli, Command, RunArgs, StatusArgs};
use smptt::config::{self, Config};
use smptt::network::ListenAddr;
use smptt::{StatusReport, TunnelNode};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run(ref args) => {
            let config = load_settings(cli.config.as_deref(), args)?;
            init_logging(&cli, &config);
            run(config).await
        }
        Command::Status(ref args) => {
            init_logging(&cli, &Config::default());
            print_status(args).await
        }
        Command::Version => print_version(),
    }
}

fn init_logging(cli: &Cli, config: &Config) {
    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let format = cli.log_format.as_deref().unwrap_or(&config.logging.format);

    let subscriber = tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(level));

    match format {
        "json" => {
            subscriber
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            subscriber.with(tracing_subscriber::fmt::layer()).init();
        }
    }
}

fn load_settings(path: Option<&Path>, args: &RunArgs) -> anyhow::Result<Config> {
    let mut config = match path {
        Some(path) => config::load_config(path)?,
        None => Config::default(),
    };

    args.apply(&mut config);
    config::validate_config(&config)?;

    if config.peer.is_empty() && config.listen.is_empty() {
        anyhow::bail!("Nothing to do: configure at least one peer or listen address");
    }
    Ok(config)
}

async fn run(config: Config) -> anyhow::Result<()> {
    let api_address = config.api_address.clone();

    tracing::info!("Starting smptt {}", env!("CARGO_PKG_VERSION"));
    let node = TunnelNode::new(config)?;
    node.start().await?;

    if let Some(spec) = api_address {
        let bind = spec.parse::<ListenAddr>()?.bind_addr();
        let addr = tokio::net::lookup_host(&bind)
            .await?
            .next()
            .ok_or_else(|| anyhow::anyhow!("API address {} did not resolve", bind))?;
        tokio::spawn(start_api_server(addr, node.clone()));
    }

    wait_for_shutdown_signal().await;

    tracing::info!("Initiating graceful shutdown...");
    node.stop().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

fn print_version() -> anyhow::Result<()> {
    println!("smptt {}", env!("CARGO_PKG_VERSION"));
    println!(
        "Build timestamp: {}",
        option_env!("BUILD_TIMESTAMP").unwrap_or("unknown")
    );
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C (SIGINT)");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}

async fn print_status(args: &StatusArgs) -> anyhow::Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.timeout))
        .build()?;

    let response = client.get(&args.endpoint).send().await?;
    if !response.status().is_success() {
        anyhow::bail!("Status request failed: HTTP {}", response.status());
    }
    let report: StatusReport = response.json().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "smptt {} ({} connections, ping max {} ms)",
        report.version, report.connections, report.ping_max_ms
    );
    for (kind, links) in [("client", &report.client), ("server", &report.server)] {
        for link in links {
            println!(
                "{:<6} {:<24} rtt {:>9.1} ms  sent {:>12}  recv {:>12}  since {}",
                kind,
                link.addr,
                link.average_rtt_ms,
                link.bytes_sent,
                link.bytes_received,
                link.started_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    Ok(())
}

/// `/status.json` and `/metrics`, readable from any origin so browser
/// dashboards can poll them.
fn api_routes(
    node: TunnelNode,
) -> impl warp::Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    use warp::Filter;

    let status_node = node.clone();
    let status = warp::path("status.json").and(warp::path::end()).and_then(move || {
        let node = status_node.clone();
        async move {
            let report = node.status_report().await;
            Ok::<_, warp::Rejection>(warp::reply::json(&report))
        }
    });

    let metrics = warp::path("metrics").and(warp::path::end()).and_then(move || {
        let node = node.clone();
        async move {
            let text = match node.status_report().await.render_metrics() {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to encode metrics: {}", e);
                    "Error encoding metrics".to_string()
                }
            };
            Ok::<_, warp::Rejection>(text)
        }
    });

    let cors = warp::cors().allow_any_origin().allow_methods(vec!["GET"]);
    warp::get().and(status.or(metrics)).with(cors)
}

async fn start_api_server(addr: SocketAddr, node: TunnelNode) {
    match warp::serve(api_routes(node)).try_bind_ephemeral(addr) {
        Ok((bound, server)) => {
            tracing::info!("Starting API server on {}", bound);
            server.await;
        }
        Err(e) => {
            tracing::error!("Failed to start API server on {}: {}", addr, e);
        }
    }
}
